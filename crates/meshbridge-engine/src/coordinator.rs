use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use meshbridge_contracts::{
    Completion, Config, EventLog, ImportRequest, PipelineError, PipelineEvent, RemeshCycleState,
    RenderRequest, RenderView, SignalChannel, SignalKind, SignalMessage, Tick,
};
use serde_json::json;
use tracing::{error, info, warn};

use crate::host::{HostResult, SceneHost, SceneMeshRef};
use crate::reconcile::{MeshReconciler, ReconcileReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    RenderRequested,
    Rendering,
    ImportRequested,
    Importing,
}

/// Host-side loop that serves render and import requests.
///
/// Driven by a periodic tick. Each tick checks for at most one request of
/// each kind, serves it synchronously and writes the matching completion.
/// A failure inside a request becomes a failure completion; a failure of
/// the tick itself is logged and answered with a longer backoff.
pub struct Coordinator<H: SceneHost> {
    config: Arc<Config>,
    channel: SignalChannel,
    host: H,
    reconciler: MeshReconciler,
    events: EventLog,
    state: CoordinatorState,
    transitions: Vec<CoordinatorState>,
    last_report: Option<ReconcileReport>,
}

impl<H: SceneHost> Coordinator<H> {
    pub fn new(config: Arc<Config>, host: H, events: EventLog) -> Self {
        let channel = config.signal_channel();
        let reconciler = MeshReconciler::new(config.host_has_remesh);
        Self {
            config,
            channel,
            host,
            reconciler,
            events,
            state: CoordinatorState::Idle,
            transitions: Vec::new(),
            last_report: None,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// States visited while serving the most recent request.
    pub fn transitions(&self) -> &[CoordinatorState] {
        &self.transitions
    }

    pub fn last_report(&self) -> Option<&ReconcileReport> {
        self.last_report.as_ref()
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn into_host(self) -> H {
        self.host
    }

    /// One scheduler tick. Always asks to be called again.
    pub fn tick(&mut self) -> Tick {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.check()));
        let failure = match outcome {
            Ok(Ok(_)) => return Tick::After(self.config.coordinator_tick()),
            Ok(Err(err)) => format!("{err:#}"),
            Err(panic) => format!("panic: {}", panic_text(panic.as_ref())),
        };
        error!("coordinator tick failed: {failure}");
        self.events.record(
            PipelineEvent::CoordinatorError,
            json!({ "error": failure, "state": format!("{:?}", self.state) }),
        );
        self.state = CoordinatorState::Idle;
        Tick::After(self.config.error_backoff())
    }

    /// Serves whatever is pending. Returns whether any request was handled.
    ///
    /// Render and import requests are taken independently: a request that
    /// cannot be read or served is answered with a failure completion and
    /// the other kind is still served in the same pass. The first such
    /// failure is returned once both kinds have been handled.
    pub fn check(&mut self) -> Result<bool> {
        let render = self.take_request(SignalKind::RenderRequest);
        let import = self.take_request(SignalKind::ImportRequest);
        Ok(render? | import?)
    }

    fn take_request(&mut self, kind: SignalKind) -> Result<bool> {
        let payload = match self.channel.consume(kind) {
            Ok(Some(payload)) => payload,
            Ok(None) => return Ok(false),
            Err(err) => {
                let detail = format!("unreadable {}: {err}", kind.file_name());
                warn!("{detail}");
                self.events.record(
                    PipelineEvent::RequestUnreadable,
                    json!({ "signal": kind.file_name(), "error": detail }),
                );
                self.transitions.clear();
                let (completion_kind, event) = completion_for(kind);
                self.finish(completion_kind, event, &Completion::failure(None, detail.clone()))?;
                anyhow::bail!(detail);
            }
        };
        match kind {
            SignalKind::ImportRequest => self.serve_import(ImportRequest::from_payload(&payload))?,
            _ => self.serve_render(RenderRequest::from_payload(&payload))?,
        }
        Ok(true)
    }

    fn enter(&mut self, state: CoordinatorState) {
        self.state = state;
        self.transitions.push(state);
    }

    fn serve_render(&mut self, request: RenderRequest) -> Result<()> {
        self.transitions.clear();
        self.enter(CoordinatorState::RenderRequested);
        let target = request
            .target_dir
            .clone()
            .unwrap_or_else(|| self.config.views_dir());
        self.events.record(
            PipelineEvent::RenderRequested,
            json!({
                "request_id": request.request_id,
                "target_dir": target.to_string_lossy(),
            }),
        );

        self.enter(CoordinatorState::Rendering);
        let resolution = self.config.render_resolution();
        let completion = match guarded(|| self.host.render_views(&target, resolution)) {
            Ok(paths) if paths.len() == RenderView::ALL.len() => {
                info!(dir = %target.display(), "render complete");
                Completion::success(request.request_id.clone())
            }
            Ok(paths) => Completion::failure(
                request.request_id.clone(),
                format!("expected {} views, host wrote {}", RenderView::ALL.len(), paths.len()),
            ),
            Err(detail) => {
                warn!("render failed: {detail}");
                Completion::failure(request.request_id.clone(), detail)
            }
        };

        self.finish(SignalKind::RenderComplete, PipelineEvent::RenderCompleted, &completion)
    }

    fn serve_import(&mut self, request: ImportRequest) -> Result<()> {
        self.transitions.clear();
        self.enter(CoordinatorState::ImportRequested);
        self.events.record(
            PipelineEvent::ImportRequested,
            json!({
                "request_id": request.request_id,
                "mesh_path": request.mesh_path.as_ref().map(|p| p.to_string_lossy()),
            }),
        );

        let completion = match self.import(&request) {
            Ok(report) => {
                for warning in &report.warnings {
                    self.events.record(
                        PipelineEvent::ReconcileWarning,
                        json!({
                            "request_id": request.request_id,
                            "warning": warning,
                        }),
                    );
                }
                info!(
                    object = report.object.as_deref().unwrap_or("?"),
                    scale = report.scale_factor,
                    rotated = report.rotated,
                    "mesh imported"
                );
                self.last_report = Some(report);
                Completion::success(request.request_id.clone())
            }
            Err(detail) => {
                warn!("import failed: {detail}");
                Completion::failure(request.request_id.clone(), detail)
            }
        };

        self.finish(SignalKind::ImportComplete, PipelineEvent::ImportCompleted, &completion)
    }

    /// Checks the file before touching the scene, so a bad request leaves
    /// the current mesh visible.
    fn import(&mut self, request: &ImportRequest) -> Result<ReconcileReport, String> {
        let Some(path) = request.mesh_path.clone() else {
            return Err("import request carried no mesh path".to_string());
        };
        validate_mesh_file(&path)?;

        self.enter(CoordinatorState::Importing);
        let previous = SceneMeshRef::current(&self.host);
        let mut remesh = RemeshCycleState::load(&self.channel).unwrap_or_else(|err| {
            warn!("remesh state unreadable, using defaults: {err}");
            RemeshCycleState::default()
        });
        let stage_before = remesh.stage;

        let name = guarded(|| self.host.import_mesh(&path))?;
        let reconciler = self.reconciler;
        let report = panic::catch_unwind(AssertUnwindSafe(|| {
            reconciler.reconcile(&mut self.host, &name, previous.as_ref(), &mut remesh)
        }))
        .map_err(|panic| format!("reconcile panicked: {}", panic_text(panic.as_ref())))?;

        if remesh.stage != stage_before {
            if let Err(err) = remesh.store(&self.channel) {
                warn!("failed to persist remesh stage: {err}");
            }
        }
        Ok(report)
    }

    fn finish(
        &mut self,
        kind: SignalKind,
        event: PipelineEvent,
        completion: &Completion,
    ) -> Result<()> {
        let sent = self.channel.send(kind, &completion.to_payload());
        self.events.record(
            event,
            json!({
                "request_id": completion.request_id,
                "success": completion.is_success(),
                "detail": completion.detail(),
            }),
        );
        self.enter(CoordinatorState::Idle);
        sent?;
        Ok(())
    }
}

fn completion_for(request: SignalKind) -> (SignalKind, PipelineEvent) {
    match request {
        SignalKind::ImportRequest => (SignalKind::ImportComplete, PipelineEvent::ImportCompleted),
        _ => (SignalKind::RenderComplete, PipelineEvent::RenderCompleted),
    }
}

fn validate_mesh_file(path: &Path) -> Result<(), String> {
    let meta = fs::metadata(path)
        .map_err(|err| format!("mesh file not found: {} ({err})", path.display()))?;
    if !meta.is_file() {
        return Err(format!("mesh path is not a file: {}", path.display()));
    }
    if meta.len() == 0 {
        return Err(PipelineError::EmptyMesh(path.to_path_buf()).to_string());
    }
    Ok(())
}

/// Runs a host call, turning both errors and panics into a detail string.
fn guarded<T>(call: impl FnOnce() -> HostResult<T>) -> Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.to_string()),
        Err(panic) => Err(format!("host panicked: {}", panic_text(panic.as_ref()))),
    }
}

fn panic_text(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = panic.downcast_ref::<String>() {
        return text.clone();
    }
    "unknown panic".to_string()
}
