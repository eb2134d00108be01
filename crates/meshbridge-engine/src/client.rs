use std::fs;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Instant, SystemTime};

use anyhow::{bail, Context, Result};
use meshbridge_contracts::{
    Config, ImageRef, Job, JobResult, JobStatus, OptionLabel, PipelineError, PipelineResult,
    SubmittedJob,
};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of fetching the per-label option images.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionArtifacts {
    pub written: Vec<(OptionLabel, PathBuf)>,
    pub failed: Vec<(OptionLabel, String)>,
}

impl OptionArtifacts {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn error(&self) -> Option<PipelineError> {
        if self.failed.is_empty() {
            return None;
        }
        Some(PipelineError::ArtifactRetrieval {
            failed: self.failed.clone(),
        })
    }
}

/// Where a retrieved mesh came from.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshArtifact {
    pub source: PathBuf,
    pub target: PathBuf,
    /// False when nothing newer than the submission existed and the newest
    /// file overall was taken.
    pub fresh: bool,
}

/// Blocking client for the generation server's submit/poll/fetch protocol.
///
/// Nothing here retries a job. A failed submission or exhausted poll is
/// returned to the caller, which resubmits with a new correlation id if it
/// wants to.
#[derive(Debug, Clone)]
pub struct GenerationClient {
    config: Arc<Config>,
    http: HttpClient,
    client_id: String,
}

impl GenerationClient {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(config.request_timeout())
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            config,
            http,
            client_id: Uuid::new_v4().to_string(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// TCP reachability check against the configured host and port.
    pub fn probe(&self) -> PipelineResult<()> {
        let host = self.config.server_host.clone();
        let port = self.config.server_port;
        let unreachable = |reason: String| PipelineError::UnreachableServer {
            host: host.clone(),
            port,
            reason,
        };
        let addrs: Vec<_> = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|err| unreachable(format!("address lookup failed: {err}")))?
            .collect();
        let mut last_err = "no address resolved".to_string();
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.config.probe_timeout()) {
                Ok(_) => return Ok(()),
                Err(err) => last_err = err.to_string(),
            }
        }
        Err(unreachable(last_err))
    }

    pub fn submit(&self, job: &Job) -> Result<SubmittedJob> {
        self.probe()?;
        let submitted_at = SystemTime::now();
        let body = json!({
            "prompt": job.payload,
            "client_id": self.client_id,
        });
        let response = self
            .http
            .post(format!("{}/prompt", self.config.server_base_url()))
            .json(&body)
            .send()
            .with_context(|| format!("{} job submission failed", job.kind.as_str()))?;
        let parsed = response_json_or_error("generation server", response)?;

        if let Some(errors) = parsed.get("node_errors").and_then(Value::as_object) {
            if !errors.is_empty() {
                return Err(PipelineError::JobFailed {
                    prompt_id: String::new(),
                    message: format!("workflow rejected: {}", Value::Object(errors.clone())),
                }
                .into());
            }
        }
        let Some(prompt_id) = parsed.get("prompt_id").and_then(Value::as_str) else {
            bail!("generation server response missing prompt_id");
        };
        info!(
            kind = job.kind.as_str(),
            prompt_id,
            correlation_id = %job.correlation_id,
            "job submitted"
        );
        Ok(SubmittedJob {
            kind: job.kind,
            correlation_id: job.correlation_id.clone(),
            prompt_id: prompt_id.to_string(),
            submitted_at,
        })
    }

    pub fn poll(&self, prompt_id: &str) -> Result<JobResult> {
        let response = self
            .http
            .get(format!("{}/history/{prompt_id}", self.config.server_base_url()))
            .send()
            .with_context(|| format!("history request for {prompt_id} failed"))?;
        let parsed = response_json_or_error("generation server", response)?;
        Ok(JobResult::from_history(prompt_id, &parsed))
    }

    /// Polls until the job is terminal or the attempt budget is spent.
    /// `on_poll` sees every non-terminal result, e.g. for status text.
    pub fn wait<F>(&self, job: &SubmittedJob, mut on_poll: F) -> Result<JobResult>
    where
        F: FnMut(u32, &JobResult),
    {
        let attempts = self.config.job_poll_attempts();
        let interval = self.config.job_poll_interval();
        let started = Instant::now();

        for attempt in 1..=attempts {
            match self.poll(&job.prompt_id) {
                Ok(result) if result.status == JobStatus::Complete => return Ok(result),
                Ok(result) if result.status == JobStatus::Error => {
                    return Err(PipelineError::JobFailed {
                        prompt_id: job.prompt_id.clone(),
                        message: result
                            .message
                            .unwrap_or_else(|| "server reported an error".to_string()),
                    }
                    .into());
                }
                Ok(result) => on_poll(attempt, &result),
                Err(err) => warn!(prompt_id = %job.prompt_id, attempt, "poll failed: {err:#}"),
            }
            if attempt < attempts {
                thread::sleep(interval);
            }
        }

        Err(PipelineError::JobTimeout {
            prompt_id: job.prompt_id.clone(),
            attempts,
            elapsed: started.elapsed(),
        }
        .into())
    }

    pub fn fetch_image(&self, image: &ImageRef) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(format!("{}/view", self.config.server_base_url()))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.kind.as_str()),
            ])
            .send()
            .with_context(|| format!("fetch of {} failed", image.filename))?;
        let status = response.status();
        if !status.is_success() {
            bail!("fetch of {} failed ({})", image.filename, status.as_u16());
        }
        let bytes = response
            .bytes()
            .with_context(|| format!("reading {} failed", image.filename))?;
        Ok(bytes.to_vec())
    }

    /// Writes the result's first three images to the per-label paths,
    /// overwriting older ones. One label failing does not stop the others.
    pub fn fetch_option_images(&self, result: &JobResult) -> OptionArtifacts {
        let images = result.images();
        let mut artifacts = OptionArtifacts::default();
        for label in OptionLabel::ALL {
            let Some(image) = images.get(label.index()) else {
                artifacts
                    .failed
                    .push((label, "server produced no image".to_string()));
                continue;
            };
            let target = self.config.option_image_path(label);
            match self
                .fetch_image(image)
                .and_then(|bytes| write_atomic(&target, &bytes))
            {
                Ok(()) => artifacts.written.push((label, target)),
                Err(err) => {
                    warn!(%label, "option image retrieval failed: {err:#}");
                    artifacts.failed.push((label, format!("{err:#}")));
                }
            }
        }
        artifacts
    }

    /// Copies the mesh produced by `job` into the artifact directory.
    ///
    /// The server does not hand back a usable path for every mesh node, so
    /// when history names no existing file the newest matching file in the
    /// server's shared output directory is taken. Another client finishing in
    /// between can still win that race.
    pub fn copy_latest_mesh(&self, job: &SubmittedJob, result: &JobResult) -> Result<MeshArtifact> {
        let (source, fresh) = match self.reported_mesh(result) {
            Some(path) => (path, true),
            None => self.newest_output_mesh(job.submitted_at)?,
        };
        let ext = source
            .extension()
            .and_then(|value| value.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| "glb".to_string());
        let target = self.config.mesh_target_path(&ext);
        let bytes =
            fs::read(&source).with_context(|| format!("failed reading {}", source.display()))?;
        write_atomic(&target, &bytes)?;
        debug!(source = %source.display(), target = %target.display(), "mesh copied");
        Ok(MeshArtifact {
            source,
            target,
            fresh,
        })
    }

    fn reported_mesh(&self, result: &JobResult) -> Option<PathBuf> {
        result.model_files().into_iter().find_map(|raw| {
            let path = PathBuf::from(&raw);
            let path = if path.is_absolute() {
                path
            } else {
                self.config.server_output_dir.join(path)
            };
            path.is_file().then_some(path)
        })
    }

    fn newest_output_mesh(&self, since: SystemTime) -> Result<(PathBuf, bool)> {
        let root = &self.config.server_output_dir;
        let mut candidates = Vec::new();
        collect_meshes(root, &self.config.mesh_extensions, &mut candidates)
            .with_context(|| format!("failed scanning {}", root.display()))?;

        if let Some(path) = newest(candidates.iter().filter(|(_, modified)| *modified >= since)) {
            return Ok((path, true));
        }
        match newest(candidates.iter()) {
            Some(path) => {
                warn!(
                    path = %path.display(),
                    "no mesh newer than the submission; using the newest one available"
                );
                Ok((path, false))
            }
            None => bail!("no mesh file found in {}", root.display()),
        }
    }
}

fn newest<'a>(items: impl Iterator<Item = &'a (PathBuf, SystemTime)>) -> Option<PathBuf> {
    items
        .max_by_key(|(_, modified)| *modified)
        .map(|(path, _)| path.clone())
}

fn collect_meshes(
    dir: &Path,
    extensions: &[String],
    out: &mut Vec<(PathBuf, SystemTime)>,
) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            collect_meshes(&path, extensions, out)?;
            continue;
        }
        let matches = path
            .extension()
            .and_then(|value| value.to_str())
            .map(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
            .unwrap_or(false);
        if matches && meta.len() > 0 {
            out.push((path, meta.modified()?));
        }
    }
    Ok(())
}

/// Replaces `path` in one rename so readers never see a partial file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("failed creating {}", parent.display()))?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed creating temp file in {}", parent.display()))?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .with_context(|| format!("failed replacing {}", path.display()))?;
    Ok(())
}

fn response_json_or_error(service: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{service} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{service} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{service} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::time::Duration;

    use super::*;

    fn config_for(root: &Path, port: u16) -> Arc<Config> {
        Arc::new(Config {
            server_port: port,
            probe_timeout_s: 0.2,
            ..Config::rooted(root)
        })
    }

    #[test]
    fn probe_fails_fast_on_closed_port() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0")?;
            listener.local_addr()?.port()
        };
        let client = GenerationClient::new(config_for(temp.path(), port))?;
        match client.probe() {
            Err(PipelineError::UnreachableServer { port: p, .. }) => assert_eq!(p, port),
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn probe_succeeds_when_listening() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let client = GenerationClient::new(config_for(temp.path(), port))?;
        assert!(client.probe().is_ok());
        Ok(())
    }

    #[test]
    fn newest_mesh_prefers_files_after_submission() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let config = config_for(temp.path(), 1);
        let out = &config.server_output_dir;
        fs::create_dir_all(out.join("nested"))?;
        fs::write(out.join("old.obj"), "v 0 0 0\n")?;
        fs::write(out.join("notes.txt"), "ignored")?;
        thread::sleep(Duration::from_millis(20));
        let submitted_at = SystemTime::now();
        thread::sleep(Duration::from_millis(20));
        fs::write(out.join("nested").join("fresh.obj"), "v 1 1 1\n")?;

        let client = GenerationClient::new(Arc::clone(&config))?;
        let job = SubmittedJob {
            kind: meshbridge_contracts::JobKind::Mesh,
            correlation_id: "c".to_string(),
            prompt_id: "p".to_string(),
            submitted_at,
        };
        let artifact = client.copy_latest_mesh(&job, &JobResult::pending("p"))?;
        assert!(artifact.fresh);
        assert!(artifact.source.ends_with("nested/fresh.obj"));
        assert_eq!(artifact.target, config.mesh_target_path("obj"));
        assert_eq!(fs::read_to_string(&artifact.target)?, "v 1 1 1\n");
        Ok(())
    }

    #[test]
    fn stale_output_is_used_with_a_warning() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let config = config_for(temp.path(), 1);
        fs::create_dir_all(&config.server_output_dir)?;
        fs::write(config.server_output_dir.join("old.stl"), "solid x\nendsolid x\n")?;

        let client = GenerationClient::new(Arc::clone(&config))?;
        let job = SubmittedJob {
            kind: meshbridge_contracts::JobKind::Mesh,
            correlation_id: "c".to_string(),
            prompt_id: "p".to_string(),
            submitted_at: SystemTime::now() + Duration::from_secs(60),
        };
        let artifact = client.copy_latest_mesh(&job, &JobResult::pending("p"))?;
        assert!(!artifact.fresh);
        assert_eq!(artifact.target, config.mesh_target_path("stl"));
        Ok(())
    }

    #[test]
    fn atomic_write_replaces_content() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("deep").join("option_A.png");
        write_atomic(&path, b"first")?;
        write_atomic(&path, b"second")?;
        assert_eq!(fs::read(&path)?, b"second");
        Ok(())
    }
}
