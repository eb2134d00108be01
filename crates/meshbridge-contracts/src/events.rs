use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::Config;

/// Which process wrote a log line. Each source has its own file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Host,
    Overlay,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Overlay => "overlay",
        }
    }
}

/// Everything either side of the bridge logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEvent {
    RenderRequested,
    RenderCompleted,
    RenderTimeout,
    ImportRequested,
    ImportCompleted,
    ImportTimeout,
    RequestUnreadable,
    ReconcileWarning,
    CoordinatorError,
    OptionsSubmitted,
    ArtifactFailed,
    OptionsReady,
    OptionSelected,
    MeshSubmitted,
    MeshReady,
    SessionError,
}

impl PipelineEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RenderRequested => "render_requested",
            Self::RenderCompleted => "render_completed",
            Self::RenderTimeout => "render_timeout",
            Self::ImportRequested => "import_requested",
            Self::ImportCompleted => "import_completed",
            Self::ImportTimeout => "import_timeout",
            Self::RequestUnreadable => "request_unreadable",
            Self::ReconcileWarning => "reconcile_warning",
            Self::CoordinatorError => "coordinator_error",
            Self::OptionsSubmitted => "options_submitted",
            Self::ArtifactFailed => "artifact_failed",
            Self::OptionsReady => "options_ready",
            Self::OptionSelected => "option_selected",
            Self::MeshSubmitted => "mesh_submitted",
            Self::MeshReady => "mesh_ready",
            Self::SessionError => "session_error",
        }
    }

    /// Failures and timeouts, the lines worth scanning for after a bad run.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::RenderTimeout
                | Self::ImportTimeout
                | Self::RequestUnreadable
                | Self::ArtifactFailed
                | Self::CoordinatorError
                | Self::SessionError
        )
    }
}

/// One line of an event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    pub ts: String,
    pub source: EventSource,
    pub session_id: String,
    pub event: PipelineEvent,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

const RESERVED_KEYS: [&str; 5] = ["seq", "ts", "source", "session_id", "event"];

/// Append-only JSONL log for one session of one process.
///
/// Lines are numbered from 1 in write order. Clones share the counter, so
/// the overlay worker thread and the UI thread can both log without
/// interleaving numbers.
#[derive(Debug, Clone)]
pub struct EventLog {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    path: PathBuf,
    source: EventSource,
    session_id: String,
    last_seq: Mutex<u64>,
}

impl EventLog {
    pub fn new(
        path: impl Into<PathBuf>,
        source: EventSource,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                path: path.into(),
                source,
                session_id: session_id.into(),
                last_seq: Mutex::new(0),
            }),
        }
    }

    /// Log at the configured location for `source`.
    pub fn open(config: &Config, source: EventSource, session_id: impl Into<String>) -> Self {
        Self::new(config.event_log_path(source), source, session_id)
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn source(&self) -> EventSource {
        self.shared.source
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// Appends one event. `fields` should be a JSON object; anything else
    /// is kept under `detail`. Fields named like the line header are dropped.
    pub fn append(&self, event: PipelineEvent, fields: Value) -> anyhow::Result<EventRecord> {
        let mut fields = match fields {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => Map::from_iter([("detail".to_string(), other)]),
        };
        for key in RESERVED_KEYS {
            if fields.remove(key).is_some() {
                tracing::debug!(event = event.as_str(), key, "reserved event field dropped");
            }
        }

        if let Some(parent) = self.shared.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut last_seq = self
            .shared
            .last_seq
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let record = EventRecord {
            seq: *last_seq + 1,
            ts: now_utc_iso(),
            source: self.shared.source,
            session_id: self.shared.session_id.clone(),
            event,
            fields,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.shared.path)?
            .write_all(line.as_bytes())?;
        *last_seq = record.seq;
        Ok(record)
    }

    /// Appends and downgrades a write failure to a log line, so logging can
    /// never fail a render or import.
    pub fn record(&self, event: PipelineEvent, fields: Value) {
        if let Err(err) = self.append(event, fields) {
            tracing::warn!(event = event.as_str(), "event log write failed: {err:#}");
        }
    }
}

/// Reads a whole log back, skipping lines that do not parse.
pub fn read_event_log(path: &Path) -> anyhow::Result<Vec<EventRecord>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading event log {}", path.display()))?;
    Ok(raw
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

pub(crate) fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
