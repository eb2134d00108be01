use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tempfile::Builder as TempBuilder;

use super::payload::SignalPayload;

const DELETE_ATTEMPTS: u32 = 3;
const DELETE_RETRY_DELAY: Duration = Duration::from_millis(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    RenderRequest,
    RenderComplete,
    ImportRequest,
    ImportComplete,
    RemeshState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalRole {
    /// Written by the overlay, consumed by the host.
    Request,
    /// Written by the host, consumed by the overlay.
    Completion,
    /// Last writer wins; never deleted by readers.
    State,
}

impl SignalKind {
    pub const ALL: [SignalKind; 5] = [
        SignalKind::RenderRequest,
        SignalKind::RenderComplete,
        SignalKind::ImportRequest,
        SignalKind::ImportComplete,
        SignalKind::RemeshState,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            Self::RenderRequest => "render_request",
            Self::RenderComplete => "render_complete",
            Self::ImportRequest => "import_request",
            Self::ImportComplete => "import_complete",
            Self::RemeshState => "remesh_state",
        }
    }

    pub fn role(&self) -> SignalRole {
        match self {
            Self::RenderRequest | Self::ImportRequest => SignalRole::Request,
            Self::RenderComplete | Self::ImportComplete => SignalRole::Completion,
            Self::RemeshState => SignalRole::State,
        }
    }
}

/// A shared directory of signal files.
///
/// Writes go through a temp file in the same directory followed by a rename,
/// so a reader only ever sees a missing file or a complete one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalChannel {
    dir: PathBuf,
}

impl SignalChannel {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, kind: SignalKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    /// Creates an empty marker.
    pub fn signal(&self, kind: SignalKind) -> io::Result<()> {
        self.write_atomic(kind, b"")
    }

    pub fn send(&self, kind: SignalKind, payload: &SignalPayload) -> io::Result<()> {
        self.write_atomic(kind, payload.encode().as_bytes())
    }

    /// Non-blocking existence check, one per tick.
    pub fn is_pending(&self, kind: SignalKind) -> bool {
        self.path(kind).is_file()
    }

    /// Takes a pending signal. Returns `None` when nothing is pending.
    ///
    /// The marker is renamed to a private name before it is read, so a peer
    /// replacing it in the meantime writes a fresh marker that stays pending.
    /// The claimed file is removed even when it cannot be read, and bytes
    /// that are not UTF-8 decode lossily, so no marker can fire forever.
    pub fn consume(&self, kind: SignalKind) -> io::Result<Option<SignalPayload>> {
        match self.claim(kind)? {
            Some(claimed) => take_claimed(&claimed).map(Some),
            None => Ok(None),
        }
    }

    fn claim(&self, kind: SignalKind) -> io::Result<Option<PathBuf>> {
        let path = self.path(kind);
        let claimed = private_path(&path, "claimed");
        match fs::rename(&path, &claimed) {
            Ok(()) => Ok(Some(claimed)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => {
                // Some platforms refuse the rename while the writer still
                // holds the file; fall back to reading in place.
                tracing::debug!(signal = kind.file_name(), "claim rename refused: {err}");
                Ok(Some(path))
            }
        }
    }

    /// Reads a state file without consuming it. Missing files read as `None`.
    pub fn read_state(&self, kind: SignalKind) -> io::Result<Option<SignalPayload>> {
        match fs::read(self.path(kind)) {
            Ok(bytes) => Ok(Some(decode_bytes(&bytes))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn write_state(&self, kind: SignalKind, payload: &SignalPayload) -> io::Result<()> {
        self.send(kind, payload)
    }

    /// Removes a leftover marker, if any.
    pub fn clear(&self, kind: SignalKind) -> io::Result<()> {
        let path = self.path(kind);
        if path.exists() {
            remove_marker(&path)?;
        }
        Ok(())
    }

    fn write_atomic(&self, kind: SignalKind, bytes: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut temp = TempBuilder::new()
            .prefix(&format!(".{}.", kind.file_name()))
            .suffix(".tmp")
            .tempfile_in(&self.dir)?;
        temp.write_all(bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(self.path(kind)).map_err(|err| err.error)?;
        Ok(())
    }
}

/// Deletes a consumed marker. When the platform holds the file open briefly
/// the delete is retried, then the marker is renamed out of the way so it
/// can never trigger again.
fn remove_marker(path: &Path) -> io::Result<()> {
    let mut last_err = None;
    for attempt in 0..DELETE_ATTEMPTS {
        match fs::remove_file(path) {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                last_err = Some(err);
                if attempt + 1 < DELETE_ATTEMPTS {
                    thread::sleep(DELETE_RETRY_DELAY);
                }
            }
        }
    }

    let tombstone = tombstone_path(path);
    match fs::rename(path, &tombstone) {
        Ok(()) => {
            if let Err(err) = fs::remove_file(&tombstone) {
                tracing::debug!(
                    path = %tombstone.display(),
                    "tombstone left behind after rename: {err}"
                );
            }
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(last_err.unwrap_or(err)),
    }
}

/// Reads a claimed marker and removes it whether or not the read worked.
fn take_claimed(claimed: &Path) -> io::Result<SignalPayload> {
    let read = fs::read(claimed);
    let removed = if claimed.is_dir() {
        fs::remove_dir_all(claimed)
    } else {
        remove_marker(claimed)
    };
    match (read, removed) {
        (Ok(bytes), Ok(())) => Ok(decode_bytes(&bytes)),
        (Ok(bytes), Err(err)) => {
            tracing::warn!(path = %claimed.display(), "claimed signal left behind: {err}");
            Ok(decode_bytes(&bytes))
        }
        (Err(err), _) => Err(err),
    }
}

fn decode_bytes(bytes: &[u8]) -> SignalPayload {
    SignalPayload::decode(&String::from_utf8_lossy(bytes))
}

fn tombstone_path(path: &Path) -> PathBuf {
    private_path(path, "consumed")
}

fn private_path(path: &Path, tag: &str) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    let name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("signal");
    path.with_file_name(format!(".{name}.{tag}-{}-{stamp}", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::super::payload::SignalKey;
    use super::*;

    #[test]
    fn consume_reads_once_then_reports_nothing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let channel = SignalChannel::new(temp.path().join("signals"));
        let payload = SignalPayload::new().with(SignalKey::RequestId, "r-1");
        channel.send(SignalKind::RenderRequest, &payload)?;

        assert!(channel.is_pending(SignalKind::RenderRequest));
        assert_eq!(channel.consume(SignalKind::RenderRequest)?, Some(payload));
        assert!(!channel.is_pending(SignalKind::RenderRequest));
        assert_eq!(channel.consume(SignalKind::RenderRequest)?, None);
        Ok(())
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let channel = SignalChannel::new(temp.path());
        channel.signal(SignalKind::ImportRequest)?;
        channel.send(
            SignalKind::ImportRequest,
            &SignalPayload::new().with(SignalKey::MeshPath, "/tmp/mesh.glb"),
        )?;

        let names: Vec<String> = fs::read_dir(temp.path())?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["import_request".to_string()]);
        Ok(())
    }

    #[test]
    fn state_reads_do_not_consume() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let channel = SignalChannel::new(temp.path());
        assert_eq!(channel.read_state(SignalKind::RemeshState)?, None);

        let payload = SignalPayload::new().with(SignalKey::Stage, "2");
        channel.write_state(SignalKind::RemeshState, &payload)?;
        assert_eq!(channel.read_state(SignalKind::RemeshState)?, Some(payload.clone()));
        assert_eq!(channel.read_state(SignalKind::RemeshState)?, Some(payload));
        Ok(())
    }

    #[test]
    fn empty_marker_consumes_as_empty_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let channel = SignalChannel::new(temp.path());
        channel.signal(SignalKind::RenderRequest)?;
        let payload = channel.consume(SignalKind::RenderRequest)?;
        assert_eq!(payload.map(|p| p.get(SignalKey::RequestId).is_none()), Some(true));
        Ok(())
    }

    #[test]
    fn clear_is_a_noop_without_marker() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let channel = SignalChannel::new(temp.path());
        channel.clear(SignalKind::RenderComplete)?;
        channel.signal(SignalKind::RenderComplete)?;
        channel.clear(SignalKind::RenderComplete)?;
        assert!(!channel.is_pending(SignalKind::RenderComplete));
        Ok(())
    }

    fn dir_names(dir: &Path) -> anyhow::Result<Vec<String>> {
        let mut names: Vec<String> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    #[test]
    fn consume_leaves_nothing_behind() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let channel = SignalChannel::new(temp.path());
        channel.send(
            SignalKind::ImportRequest,
            &SignalPayload::new().with(SignalKey::RequestId, "i-1"),
        )?;
        channel.consume(SignalKind::ImportRequest)?;
        assert!(dir_names(temp.path())?.is_empty());
        Ok(())
    }

    #[test]
    fn non_utf8_marker_decodes_lossily_and_is_removed() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let channel = SignalChannel::new(temp.path());
        fs::write(
            channel.path(SignalKind::RenderRequest),
            b"request_id=r-7\ntarget_dir=/tmp/caf\xe9\n",
        )?;

        let payload = channel.consume(SignalKind::RenderRequest)?;
        let payload = payload.ok_or_else(|| anyhow::anyhow!("marker was not consumed"))?;
        assert_eq!(payload.get(SignalKey::RequestId), Some("r-7"));
        assert!(payload
            .get(SignalKey::TargetDir)
            .is_some_and(|dir| dir.starts_with("/tmp/caf")));
        assert!(!channel.is_pending(SignalKind::RenderRequest));
        assert!(dir_names(temp.path())?.is_empty());
        Ok(())
    }

    #[test]
    fn unreadable_marker_fails_once_then_is_gone() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let channel = SignalChannel::new(temp.path());
        fs::create_dir_all(channel.path(SignalKind::RenderRequest).join("nested"))?;

        assert!(channel.consume(SignalKind::RenderRequest).is_err());
        assert!(!channel.path(SignalKind::RenderRequest).exists());
        assert_eq!(channel.consume(SignalKind::RenderRequest)?, None);
        assert!(dir_names(temp.path())?.is_empty());
        Ok(())
    }

    #[test]
    fn marker_rewritten_after_claim_stays_pending() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let channel = SignalChannel::new(temp.path());
        let first = SignalPayload::new().with(SignalKey::RequestId, "r-1");
        let second = SignalPayload::new().with(SignalKey::RequestId, "r-2");
        channel.send(SignalKind::RenderRequest, &first)?;

        let claimed = channel
            .claim(SignalKind::RenderRequest)?
            .ok_or_else(|| anyhow::anyhow!("nothing claimed"))?;
        channel.send(SignalKind::RenderRequest, &second)?;
        assert_eq!(take_claimed(&claimed)?, first);

        assert!(channel.is_pending(SignalKind::RenderRequest));
        assert_eq!(channel.consume(SignalKind::RenderRequest)?, Some(second));
        Ok(())
    }

    #[test]
    fn roles_follow_the_file_table() {
        assert_eq!(SignalKind::RenderRequest.role(), SignalRole::Request);
        assert_eq!(SignalKind::ImportComplete.role(), SignalRole::Completion);
        assert_eq!(SignalKind::RemeshState.role(), SignalRole::State);
        assert_eq!(SignalKind::ImportComplete.file_name(), "import_complete");
    }
}
