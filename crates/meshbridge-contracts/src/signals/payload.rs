use std::collections::BTreeMap;
use std::fmt;

pub const PAYLOAD_VERSION: u32 = 1;

/// Keys understood in signal files. Anything else is ignored on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SignalKey {
    Version,
    RequestId,
    Timestamp,
    TargetDir,
    MeshPath,
    Status,
    Detail,
    Enabled,
    Stage,
    Type,
}

impl SignalKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::RequestId => "request_id",
            Self::Timestamp => "timestamp",
            Self::TargetDir => "target_dir",
            Self::MeshPath => "mesh_path",
            Self::Status => "status",
            Self::Detail => "detail",
            Self::Enabled => "enabled",
            Self::Stage => "stage",
            Self::Type => "type",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "version" => Some(Self::Version),
            "request_id" => Some(Self::RequestId),
            "timestamp" => Some(Self::Timestamp),
            "target_dir" => Some(Self::TargetDir),
            "mesh_path" => Some(Self::MeshPath),
            "status" => Some(Self::Status),
            "detail" => Some(Self::Detail),
            "enabled" => Some(Self::Enabled),
            "stage" => Some(Self::Stage),
            "type" => Some(Self::Type),
            _ => None,
        }
    }
}

/// Plain-text `key=value` document stored in a signal file.
///
/// Reading never fails: unknown keys and malformed lines are skipped and
/// missing keys read as `None`, so either process can be restarted against
/// files written by an older peer. A body with no `key=value` line at all is
/// read as a bare status word followed by free-form detail (`SUCCESS`, or an
/// error message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalPayload {
    entries: BTreeMap<SignalKey, String>,
}

impl Default for SignalPayload {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalPayload {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(SignalKey::Version, PAYLOAD_VERSION.to_string());
        Self { entries }
    }

    pub fn with(mut self, key: SignalKey, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: SignalKey, value: impl Into<String>) {
        self.entries.insert(key, value.into());
    }

    pub fn get(&self, key: SignalKey) -> Option<&str> {
        self.entries
            .get(&key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn get_bool(&self, key: SignalKey) -> Option<bool> {
        match self.get(key)?.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        }
    }

    pub fn get_u32(&self, key: SignalKey) -> Option<u32> {
        self.get(key)?.trim().parse().ok()
    }

    pub fn version(&self) -> u32 {
        self.get_u32(SignalKey::Version).unwrap_or(0)
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key.as_str());
            out.push('=');
            out.push_str(&escape(value));
            out.push('\n');
        }
        out
    }

    pub fn decode(raw: &str) -> Self {
        let mut entries = BTreeMap::new();
        let mut saw_pair = false;
        for line in raw.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let Some(key) = SignalKey::parse(key) else {
                continue;
            };
            saw_pair = true;
            entries.insert(key, unescape(value.trim()));
        }

        if !saw_pair {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                let (status, detail) = match trimmed.split_once(char::is_whitespace) {
                    Some((head, rest)) if is_status_word(head) => (head, rest.trim()),
                    _ if is_status_word(trimmed) => (trimmed, ""),
                    _ => ("FAILURE", trimmed),
                };
                entries.insert(SignalKey::Status, status.to_ascii_uppercase());
                if !detail.is_empty() {
                    entries.insert(SignalKey::Detail, detail.to_string());
                }
            }
        }
        Self { entries }
    }
}

impl fmt::Display for SignalPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn is_status_word(word: &str) -> bool {
    matches!(
        word.trim_end_matches(':').to_ascii_uppercase().as_str(),
        "SUCCESS" | "FAILURE" | "ERROR"
    )
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
