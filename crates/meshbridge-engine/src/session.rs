use std::io;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use meshbridge_contracts::{
    Completion, CompletionPoll, CompletionWaiter, Config, EventLog, ImportRequest, JobResult,
    OptionLabel, PipelineError, PipelineEvent, RenderRequest, RenderView, Scheduler,
    SelectedOption, SignalChannel, SignalKind, SignalMessage, SubmittedJob, Tick, TickLoop,
};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::{write_atomic, GenerationClient};
use crate::progress::{JobProgress, ProgressWatcher};
use crate::workflow::JobBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingPrompt,
    Rendering,
    GeneratingOptions,
    AwaitingSelection,
    GeneratingMesh,
    AwaitingImport,
}

/// What the overlay UI is told.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Status(String),
    State(SessionState),
    OptionsReady {
        images: Vec<(OptionLabel, PathBuf)>,
        texts: Vec<(OptionLabel, String)>,
        failed: Vec<OptionLabel>,
    },
    MeshReady {
        label: OptionLabel,
        mesh_path: PathBuf,
        imported: bool,
    },
    /// Pipeline-breaking failure: a one-line summary plus detail for a dialog.
    Error { summary: String, detail: String },
}

enum Wait {
    Completed(Completion),
    TimedOut,
}

/// UI-side driver of one prompt-to-mesh cycle.
///
/// Every operation runs to completion on the calling thread; `OverlayWorker`
/// moves it off the UI thread. A failed step reports an error and returns to
/// `AwaitingPrompt`, leaving already produced option artifacts alone.
pub struct OverlaySession {
    config: Arc<Config>,
    client: GenerationClient,
    jobs: JobBuilder,
    channel: SignalChannel,
    render_waiter: CompletionWaiter,
    import_waiter: CompletionWaiter,
    events: EventLog,
    state: SessionState,
    prompt: Option<String>,
    options: Vec<OptionLabel>,
    selected: Option<SelectedOption>,
    notify: Box<dyn FnMut(SessionUpdate) + Send>,
}

impl OverlaySession {
    pub fn new<F>(config: Arc<Config>, events: EventLog, notify: F) -> Result<Self>
    where
        F: FnMut(SessionUpdate) + Send + 'static,
    {
        let client = GenerationClient::new(Arc::clone(&config))?;
        let jobs = JobBuilder::new(&config.options_template, &config.mesh_template);
        let channel = config.signal_channel();
        Ok(Self {
            render_waiter: CompletionWaiter::new(channel.clone(), SignalKind::RenderComplete),
            import_waiter: CompletionWaiter::new(channel.clone(), SignalKind::ImportComplete),
            config,
            client,
            jobs,
            channel,
            events,
            state: SessionState::AwaitingPrompt,
            prompt: None,
            options: Vec::new(),
            selected: None,
            notify: Box::new(notify),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Labels whose image was fetched in the latest options cycle.
    pub fn options(&self) -> &[OptionLabel] {
        &self.options
    }

    pub fn selected(&self) -> Option<&SelectedOption> {
        self.selected.as_ref()
    }

    pub fn client(&self) -> &GenerationClient {
        &self.client
    }

    /// Server reachability and both workflow templates. Runs before any
    /// operation writes a file.
    pub fn preflight(&self) -> Result<(), PipelineError> {
        self.client.probe()?;
        self.config.validate_templates()
    }

    /// Render views, then generate three options for `prompt`.
    pub fn submit_prompt(&mut self, prompt: &str) -> Result<()> {
        let prompt = prompt.trim().to_string();
        if prompt.is_empty() {
            let err = anyhow!("prompt is empty");
            self.fail(&err);
            return Err(err);
        }
        let outcome = self.run_options_cycle(&prompt);
        self.settle(outcome)
    }

    /// Generate and import a mesh for one of the current options.
    pub fn select_option(&mut self, label: OptionLabel) -> Result<()> {
        if !self.options.contains(&label) {
            let err = anyhow!("option {label} is not available");
            self.fail(&err);
            return Err(err);
        }
        let outcome = self.run_mesh_cycle(label);
        self.settle(outcome)
    }

    fn settle(&mut self, outcome: Result<()>) -> Result<()> {
        if let Err(err) = &outcome {
            self.fail(err);
        }
        outcome
    }

    fn run_options_cycle(&mut self, prompt: &str) -> Result<()> {
        self.preflight()?;
        self.prompt = Some(prompt.to_string());

        self.enter(SessionState::Rendering);
        self.request_render()?;

        self.enter(SessionState::GeneratingOptions);
        let views = self.available_views();
        let job = self.jobs.options_job(prompt, &views)?;
        let submitted = self.client.submit(&job)?;
        self.events.record(
            PipelineEvent::OptionsSubmitted,
            json!({
                "prompt_id": submitted.prompt_id,
                "correlation_id": submitted.correlation_id,
                "seeds": job.seeds,
                "views": views.len(),
            }),
        );
        self.status(format!("Generating options for \"{prompt}\""));
        let result = self.wait_for_job(&submitted)?;

        let artifacts = self.client.fetch_option_images(&result);
        for (label, reason) in &artifacts.failed {
            self.events.record(
                PipelineEvent::ArtifactFailed,
                json!({ "label": label.as_str(), "reason": reason }),
            );
        }
        if artifacts.written.is_empty() {
            return Err(artifacts
                .error()
                .map(anyhow::Error::from)
                .unwrap_or_else(|| anyhow!("options job produced no images")));
        }

        let produced = result.texts();
        let mut texts = Vec::with_capacity(OptionLabel::ALL.len());
        for label in OptionLabel::ALL {
            let text = produced
                .get(label.index())
                .map(|text| text.trim().to_string())
                .filter(|text| !text.is_empty())
                .unwrap_or_else(|| prompt.to_string());
            write_atomic(&self.config.option_text_path(label), text.as_bytes())?;
            texts.push((label, text));
        }

        self.options = artifacts.written.iter().map(|(label, _)| *label).collect();
        let failed: Vec<OptionLabel> = artifacts.failed.iter().map(|(label, _)| *label).collect();
        self.events.record(
            PipelineEvent::OptionsReady,
            json!({
                "prompt_id": submitted.prompt_id,
                "labels": self.options.iter().map(OptionLabel::as_str).collect::<Vec<_>>(),
                "failed": failed.iter().map(OptionLabel::as_str).collect::<Vec<_>>(),
            }),
        );
        if let Some(err) = artifacts.error() {
            self.status(format!("Options ready with gaps: {err}"));
        } else {
            self.status("Options ready".to_string());
        }
        self.emit(SessionUpdate::OptionsReady {
            images: artifacts.written.clone(),
            texts,
            failed,
        });
        self.enter(SessionState::AwaitingSelection);
        Ok(())
    }

    fn run_mesh_cycle(&mut self, label: OptionLabel) -> Result<()> {
        self.preflight()?;

        let text_path = self.config.option_text_path(label);
        let prompt_text = std::fs::read_to_string(&text_path)
            .ok()
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .or_else(|| self.prompt.clone())
            .with_context(|| format!("no prompt text for option {label}"))?;
        write_atomic(&self.config.active_prompt_path(), prompt_text.as_bytes())?;
        let image_path = self.config.option_image_path(label);
        self.selected = Some(SelectedOption {
            label,
            prompt_text: prompt_text.clone(),
            image_path: image_path.clone(),
            mesh_path: None,
        });
        self.events.record(
            PipelineEvent::OptionSelected,
            json!({ "label": label.as_str(), "prompt": prompt_text }),
        );

        self.enter(SessionState::GeneratingMesh);
        let views = self.available_views();
        let job = self.jobs.mesh_job(&prompt_text, &image_path, &views)?;
        let submitted = self.client.submit(&job)?;
        self.events.record(
            PipelineEvent::MeshSubmitted,
            json!({
                "prompt_id": submitted.prompt_id,
                "correlation_id": submitted.correlation_id,
                "label": label.as_str(),
                "seeds": job.seeds,
            }),
        );
        self.status(format!("Generating mesh for option {label}"));
        let result = self.wait_for_job(&submitted)?;
        let mesh = self.client.copy_latest_mesh(&submitted, &result)?;
        self.events.record(
            PipelineEvent::MeshReady,
            json!({
                "prompt_id": submitted.prompt_id,
                "source": mesh.source.to_string_lossy(),
                "target": mesh.target.to_string_lossy(),
                "fresh": mesh.fresh,
            }),
        );
        if let Some(selected) = self.selected.as_mut() {
            selected.mesh_path = Some(mesh.target.clone());
        }

        self.enter(SessionState::AwaitingImport);
        let request_id = Uuid::new_v4().to_string();
        let request = ImportRequest::new(&request_id, &mesh.target);
        self.channel
            .send(SignalKind::ImportRequest, &request.to_payload())
            .context("failed to write import request")?;
        self.status("Importing mesh".to_string());

        let imported = match self.await_completion(SignalKind::ImportComplete, &request_id)? {
            Wait::Completed(completion) if completion.is_success() => {
                self.events.record(
                    PipelineEvent::ImportCompleted,
                    json!({ "request_id": request_id }),
                );
                true
            }
            Wait::Completed(completion) => {
                return Err(anyhow!(
                    "host could not import the mesh: {}",
                    completion.detail().unwrap_or("no detail")
                ));
            }
            Wait::TimedOut => {
                warn!(%request_id, "import completion not observed before deadline");
                self.events.record(
                    PipelineEvent::ImportTimeout,
                    json!({ "request_id": request_id }),
                );
                self.status("Import not confirmed by the 3D host".to_string());
                false
            }
        };

        self.emit(SessionUpdate::MeshReady {
            label,
            mesh_path: mesh.target,
            imported,
        });
        self.enter(SessionState::AwaitingPrompt);
        Ok(())
    }

    /// Asks the host for fresh views. A missing or failed render is not
    /// fatal: options are generated from whatever views are on disk.
    fn request_render(&mut self) -> Result<()> {
        let request_id = Uuid::new_v4().to_string();
        let request = RenderRequest::new(&request_id, self.config.views_dir());
        self.channel
            .send(SignalKind::RenderRequest, &request.to_payload())
            .context("failed to write render request")?;
        self.events.record(
            PipelineEvent::RenderRequested,
            json!({ "request_id": request_id }),
        );
        self.status("Rendering views".to_string());

        match self.await_completion(SignalKind::RenderComplete, &request_id)? {
            Wait::Completed(completion) if completion.is_success() => {
                self.events.record(
                    PipelineEvent::RenderCompleted,
                    json!({ "request_id": request_id }),
                );
            }
            Wait::Completed(completion) => {
                let detail = completion.detail().unwrap_or("no detail").to_string();
                warn!("render failed on host: {detail}");
                self.events.record(
                    PipelineEvent::RenderCompleted,
                    json!({ "request_id": request_id, "error": detail }),
                );
                self.status(format!("Render failed ({detail}); continuing without new views"));
            }
            Wait::TimedOut => {
                warn!(%request_id, "render completion not observed before deadline");
                self.events.record(
                    PipelineEvent::RenderTimeout,
                    json!({ "request_id": request_id }),
                );
                self.status("Render timed out; continuing without new views".to_string());
            }
        }
        Ok(())
    }

    /// Polls a completion file on the tick loop until the answer to
    /// `request_id` arrives or the deadline passes.
    fn await_completion(&mut self, kind: SignalKind, request_id: &str) -> Result<Wait> {
        let interval = self.config.signal_wait_interval();
        let deadline = Instant::now() + self.config.signal_wait_deadline();
        let waiter = match kind {
            SignalKind::ImportComplete => &mut self.import_waiter,
            _ => &mut self.render_waiter,
        };

        let mut outcome: Option<io::Result<Wait>> = None;
        {
            let mut ticks = TickLoop::new();
            ticks.register(
                || match waiter.poll(Some(request_id)) {
                    Ok(CompletionPoll::Ready(completion)) => {
                        outcome = Some(Ok(Wait::Completed(completion)));
                        Tick::Stop
                    }
                    Ok(other) => {
                        match other {
                            CompletionPoll::Duplicate(id) => {
                                debug!(%id, "ignoring repeated completion")
                            }
                            CompletionPoll::Stale(old) => warn!(
                                stale = old.request_id.as_deref().unwrap_or("?"),
                                "ignoring completion for an earlier request"
                            ),
                            _ => {}
                        }
                        if Instant::now() >= deadline {
                            outcome = Some(Ok(Wait::TimedOut));
                            Tick::Stop
                        } else {
                            Tick::After(interval)
                        }
                    }
                    Err(err) => {
                        outcome = Some(Err(err));
                        Tick::Stop
                    }
                },
                Duration::ZERO,
            );
            ticks.run();
        }

        let wait = outcome
            .unwrap_or(Ok(Wait::TimedOut))
            .with_context(|| format!("failed reading {}", kind.file_name()))?;
        Ok(wait)
    }

    fn wait_for_job(&mut self, submitted: &SubmittedJob) -> Result<JobResult> {
        let (tx, rx) = mpsc::channel::<JobProgress>();
        let _watcher = if self.config.use_progress_socket {
            let url = self.config.server_ws_url(self.client.client_id());
            match ProgressWatcher::spawn(&url, move |event| {
                let _ = tx.send(event);
            }) {
                Ok(watcher) => Some(watcher),
                Err(err) => {
                    debug!("progress socket unavailable: {err:#}");
                    None
                }
            }
        } else {
            None
        };

        let label = submitted.kind.as_str();
        let prompt_id = submitted.prompt_id.as_str();
        let notify = &mut self.notify;
        let result = self.client.wait(submitted, |attempt, _| {
            let mut latest = None;
            while let Ok(event) = rx.try_recv() {
                if event.prompt_id().map(|id| id == prompt_id).unwrap_or(true) {
                    latest = Some(event.status_text());
                }
            }
            let text = match latest {
                Some(progress) => format!("Generating {label}: {progress}"),
                None => format!("Generating {label} (poll {attempt})"),
            };
            debug!("{text}");
            notify(SessionUpdate::Status(text));
        })?;
        info!(prompt_id, "{label} job complete");
        Ok(result)
    }

    fn available_views(&self) -> Vec<(RenderView, PathBuf)> {
        RenderView::ALL
            .into_iter()
            .map(|view| (view, self.config.view_path(view)))
            .filter(|(_, path)| path.is_file())
            .collect()
    }

    fn enter(&mut self, state: SessionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "session state");
            self.state = state;
            self.emit(SessionUpdate::State(state));
        }
    }

    fn status(&mut self, text: String) {
        info!("{text}");
        self.emit(SessionUpdate::Status(text));
    }

    fn emit(&mut self, update: SessionUpdate) {
        (self.notify)(update);
    }

    fn fail(&mut self, err: &anyhow::Error) {
        let summary = summarize(err);
        let detail = format!("{err:#}");
        error!("{summary}: {detail}");
        self.events.record(
            PipelineEvent::SessionError,
            json!({
                "summary": summary,
                "detail": detail,
                "state": format!("{:?}", self.state),
            }),
        );
        self.emit(SessionUpdate::Status(summary.clone()));
        self.emit(SessionUpdate::Error { summary, detail });
        self.enter(SessionState::AwaitingPrompt);
    }
}

fn summarize(err: &anyhow::Error) -> String {
    let Some(pipeline) = err.chain().find_map(|cause| cause.downcast_ref::<PipelineError>()) else {
        return "Pipeline step failed".to_string();
    };
    match pipeline {
        PipelineError::UnreachableServer { .. } => "Generation server unreachable",
        PipelineError::MissingTemplate(_) => "Workflow template missing",
        PipelineError::JobTimeout { .. } => "Generation timed out",
        PipelineError::JobFailed { .. } => "Generation failed",
        PipelineError::ArtifactRetrieval { .. } => "Option images could not be fetched",
        PipelineError::EmptyMesh(_) => "Generated mesh is empty",
        _ => "Pipeline step failed",
    }
    .to_string()
}
