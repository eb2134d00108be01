use std::path::PathBuf;

use super::channel::SignalKind;
use super::payload::{SignalKey, SignalPayload};
use crate::events::now_utc_iso;

/// Typed view over a signal file body.
pub trait SignalMessage: Sized {
    const KIND: SignalKind;

    fn to_payload(&self) -> SignalPayload;

    fn from_payload(payload: &SignalPayload) -> Self;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    pub request_id: Option<String>,
    pub timestamp: String,
    pub target_dir: Option<PathBuf>,
}

impl RenderRequest {
    pub fn new(request_id: impl Into<String>, target_dir: impl Into<PathBuf>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            timestamp: now_utc_iso(),
            target_dir: Some(target_dir.into()),
        }
    }
}

impl SignalMessage for RenderRequest {
    const KIND: SignalKind = SignalKind::RenderRequest;

    fn to_payload(&self) -> SignalPayload {
        let mut payload = SignalPayload::new().with(SignalKey::Timestamp, &self.timestamp);
        if let Some(id) = &self.request_id {
            payload.set(SignalKey::RequestId, id);
        }
        if let Some(dir) = &self.target_dir {
            payload.set(SignalKey::TargetDir, dir.to_string_lossy());
        }
        payload
    }

    fn from_payload(payload: &SignalPayload) -> Self {
        Self {
            request_id: payload.get(SignalKey::RequestId).map(str::to_string),
            timestamp: payload
                .get(SignalKey::Timestamp)
                .unwrap_or_default()
                .to_string(),
            target_dir: payload.get(SignalKey::TargetDir).map(PathBuf::from),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    pub request_id: Option<String>,
    pub timestamp: String,
    pub mesh_path: Option<PathBuf>,
}

impl ImportRequest {
    pub fn new(request_id: impl Into<String>, mesh_path: impl Into<PathBuf>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            timestamp: now_utc_iso(),
            mesh_path: Some(mesh_path.into()),
        }
    }
}

impl SignalMessage for ImportRequest {
    const KIND: SignalKind = SignalKind::ImportRequest;

    fn to_payload(&self) -> SignalPayload {
        let mut payload = SignalPayload::new().with(SignalKey::Timestamp, &self.timestamp);
        if let Some(id) = &self.request_id {
            payload.set(SignalKey::RequestId, id);
        }
        if let Some(path) = &self.mesh_path {
            payload.set(SignalKey::MeshPath, path.to_string_lossy());
        }
        payload
    }

    fn from_payload(payload: &SignalPayload) -> Self {
        Self {
            request_id: payload.get(SignalKey::RequestId).map(str::to_string),
            timestamp: payload
                .get(SignalKey::Timestamp)
                .unwrap_or_default()
                .to_string(),
            mesh_path: payload.get(SignalKey::MeshPath).map(PathBuf::from),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Success,
    Failure(String),
}

/// Body of `render_complete` / `import_complete`, echoing the id of the
/// request it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub request_id: Option<String>,
    pub outcome: CompletionOutcome,
    pub timestamp: String,
}

impl Completion {
    pub fn success(request_id: Option<String>) -> Self {
        Self {
            request_id,
            outcome: CompletionOutcome::Success,
            timestamp: now_utc_iso(),
        }
    }

    pub fn failure(request_id: Option<String>, detail: impl Into<String>) -> Self {
        Self {
            request_id,
            outcome: CompletionOutcome::Failure(detail.into()),
            timestamp: now_utc_iso(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == CompletionOutcome::Success
    }

    pub fn detail(&self) -> Option<&str> {
        match &self.outcome {
            CompletionOutcome::Success => None,
            CompletionOutcome::Failure(detail) => Some(detail.as_str()),
        }
    }

    pub fn to_payload(&self) -> SignalPayload {
        let mut payload = SignalPayload::new().with(SignalKey::Timestamp, &self.timestamp);
        if let Some(id) = &self.request_id {
            payload.set(SignalKey::RequestId, id);
        }
        match &self.outcome {
            CompletionOutcome::Success => payload.set(SignalKey::Status, "SUCCESS"),
            CompletionOutcome::Failure(detail) => {
                payload.set(SignalKey::Status, "FAILURE");
                payload.set(SignalKey::Detail, detail);
            }
        }
        payload
    }

    pub fn from_payload(payload: &SignalPayload) -> Self {
        let status = payload
            .get(SignalKey::Status)
            .map(|value| value.trim().to_ascii_uppercase());
        let outcome = match status.as_deref() {
            Some("SUCCESS") => CompletionOutcome::Success,
            Some(_) => CompletionOutcome::Failure(
                payload
                    .get(SignalKey::Detail)
                    .unwrap_or("failed without detail")
                    .to_string(),
            ),
            None => CompletionOutcome::Failure("completion reported no status".to_string()),
        };
        Self {
            request_id: payload.get(SignalKey::RequestId).map(str::to_string),
            outcome,
            timestamp: payload
                .get(SignalKey::Timestamp)
                .unwrap_or_default()
                .to_string(),
        }
    }
}
