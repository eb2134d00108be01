use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use axum::extract::{Path as UrlPath, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use meshbridge_contracts::{
    read_event_log, Config, EventLog, EventSource, JobKind, OptionLabel, PipelineError,
    PipelineEvent, RenderView, Scheduler, SignalKind, SubmittedJob, Tick, TickLoop,
};
use meshbridge_engine::{
    box_mesh, write_obj, Coordinator, GenerationClient, HeadlessHost, OverlaySession, SceneHost,
    SessionState, SessionUpdate,
};
use serde_json::{json, Value};
use tokio::sync::oneshot;

const OPTION_TEXTS: [&str; 3] = ["a red sphere", "a blue sphere", "a green sphere"];

#[derive(Default)]
struct FakeState {
    next_id: u32,
    submissions: Vec<Value>,
    polls: HashMap<String, u32>,
    mesh_jobs: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scenario {
    Succeeds,
    EmptyMesh,
    /// History never gains an entry for the job.
    NeverFinishes,
    /// The second history poll reports an execution error.
    FailsMidway,
}

/// Stand-in for the generation server: options jobs yield three images and
/// three texts, mesh jobs write an OBJ into the shared output directory.
/// Every job reports pending on its first history poll.
struct FakeServer {
    output_dir: PathBuf,
    scenario: Scenario,
    state: Mutex<FakeState>,
}

impl FakeServer {
    fn submissions(&self) -> Result<Vec<Value>> {
        let guard = self.state.lock().map_err(|_| anyhow!("fake server poisoned"))?;
        Ok(guard.submissions.clone())
    }

    fn polls(&self, prompt_id: &str) -> Result<u32> {
        let guard = self.state.lock().map_err(|_| anyhow!("fake server poisoned"))?;
        Ok(guard.polls.get(prompt_id).copied().unwrap_or(0))
    }
}

struct ServerHandle {
    port: u16,
    fake: Arc<FakeServer>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
    fn start(output_dir: &Path, scenario: Scenario) -> Result<Self> {
        let server = Arc::new(FakeServer {
            output_dir: output_dir.to_path_buf(),
            scenario,
            state: Mutex::new(FakeState::default()),
        });
        let app = Router::new()
            .route("/prompt", post(submit))
            .route("/history/{id}", get(history))
            .route("/view", get(view))
            .with_state(Arc::clone(&server));

        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let thread = thread::Builder::new()
            .name("fake-generation-server".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(err) => {
                            eprintln!("fake server listener failed: {err}");
                            return;
                        }
                    };
                    let _ = axum::serve(listener, app)
                        .with_graceful_shutdown(async {
                            let _ = shutdown_rx.await;
                        })
                        .await;
                });
            })?;

        Ok(Self {
            port,
            fake: server,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn submit(State(server): State<Arc<FakeServer>>, Json(body): Json<Value>) -> Json<Value> {
    let mut guard = match server.state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.next_id += 1;
    let prompt_id = format!("p-{}", guard.next_id);
    let is_mesh = node_with_title(&body["prompt"], "option_image").is_some();
    if is_mesh {
        let relative = format!("mesh/{prompt_id}.obj");
        let target = server.output_dir.join(&relative);
        let written = match target.parent() {
            Some(parent) => fs::create_dir_all(parent),
            None => Ok(()),
        }
        .and_then(|_| {
            if server.scenario == Scenario::EmptyMesh {
                fs::write(&target, b"")
            } else {
                write_obj(&target, &box_mesh([0.0, 0.0, 0.0], [2.0, 1.0, 0.5]))
            }
        });
        if let Err(err) = written {
            eprintln!("fake server mesh write failed: {err}");
        }
        guard.mesh_jobs.insert(prompt_id.clone(), relative);
    }
    guard.submissions.push(body);
    Json(json!({ "prompt_id": prompt_id, "number": guard.next_id, "node_errors": {} }))
}

async fn history(
    State(server): State<Arc<FakeServer>>,
    UrlPath(prompt_id): UrlPath<String>,
) -> Json<Value> {
    let mut guard = match server.state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let polls = guard.polls.entry(prompt_id.clone()).or_insert(0);
    *polls += 1;
    let polls = *polls;
    if polls < 2 || server.scenario == Scenario::NeverFinishes {
        return Json(json!({}));
    }
    if server.scenario == Scenario::FailsMidway {
        return Json(json!({
            prompt_id: {
                "status": {
                    "status_str": "error",
                    "completed": false,
                    "messages": [
                        ["execution_error", { "node_type": "KSampler", "exception_message": "out of memory" }]
                    ],
                },
                "outputs": {},
            }
        }));
    }
    let outputs = match guard.mesh_jobs.get(&prompt_id) {
        Some(relative) => json!({ "12": { "model_file": relative } }),
        None => json!({
            "9": {
                "images": (0..3)
                    .map(|idx| json!({
                        "filename": format!("{prompt_id}_{idx}.png"),
                        "subfolder": "",
                        "type": "output",
                    }))
                    .collect::<Vec<_>>(),
            },
            "10": { "text": OPTION_TEXTS },
        }),
    };
    Json(json!({
        prompt_id: {
            "status": { "status_str": "success", "completed": true, "messages": [] },
            "outputs": outputs,
        }
    }))
}

async fn view(Query(params): Query<HashMap<String, String>>) -> Vec<u8> {
    let filename = params.get("filename").cloned().unwrap_or_default();
    format!("png:{filename}").into_bytes()
}

fn node_with_title<'a>(workflow: &'a Value, title: &str) -> Option<&'a Value> {
    workflow.as_object()?.values().find(|node| {
        node.get("_meta")
            .and_then(|meta| meta.get("title"))
            .and_then(Value::as_str)
            == Some(title)
    })
}

fn write_templates(config: &Config) -> Result<()> {
    let options = json!({
        "3": { "class_type": "KSampler", "inputs": { "seed": 0, "steps": 20 }, "_meta": { "title": "sampler" } },
        "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "" }, "_meta": { "title": "prompt" } },
        "11": { "class_type": "LoadImage", "inputs": { "image": "" }, "_meta": { "title": "view_front" } },
        "12": { "class_type": "LoadImage", "inputs": { "image": "" }, "_meta": { "title": "view_left" } },
    });
    let mesh = json!({
        "3": { "class_type": "KSampler", "inputs": { "seed": 0 }, "_meta": { "title": "sampler" } },
        "4": { "class_type": "Noise", "inputs": { "noise_seed": 0 }, "_meta": { "title": "noise" } },
        "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "" }, "_meta": { "title": "prompt" } },
        "7": { "class_type": "LoadImage", "inputs": { "image": "" }, "_meta": { "title": "option_image" } },
    });
    for (path, doc) in [(&config.options_template, options), (&config.mesh_template, mesh)] {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(&doc)?)?;
    }
    Ok(())
}

fn test_config(root: &Path, port: u16) -> Config {
    Config {
        server_port: port,
        probe_timeout_s: 0.5,
        request_timeout_s: 5.0,
        job_poll_interval_s: 0.01,
        job_poll_attempts: 50,
        signal_wait_interval_s: 0.02,
        signal_wait_deadline_s: 10.0,
        coordinator_tick_s: 0.05,
        render_resolution: 64,
        use_progress_socket: false,
        ..Config::rooted(root)
    }
}

type UpdateLog = Arc<Mutex<Vec<SessionUpdate>>>;

fn overlay(config: &Arc<Config>) -> Result<(OverlaySession, UpdateLog)> {
    let log: UpdateLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let events = EventLog::open(&config, EventSource::Overlay, "pipeline-test");
    let session = OverlaySession::new(Arc::clone(config), events, move |update| {
        if let Ok(mut guard) = sink.lock() {
            guard.push(update);
        }
    })?;
    Ok((session, log))
}

fn updates(log: &UpdateLog) -> Result<Vec<SessionUpdate>> {
    Ok(log.lock().map_err(|_| anyhow!("update log poisoned"))?.clone())
}

/// A coordinator over a headless host, ticking on its own thread the way a
/// 3D application would drive it from a timer.
struct HostThread {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<HeadlessHost>>,
}

impl HostThread {
    fn spawn(config: Arc<Config>, host: HeadlessHost) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("test-host".to_string())
            .spawn(move || {
                let events = EventLog::open(&config, EventSource::Host, "pipeline-host");
                let mut coordinator = Coordinator::new(Arc::clone(&config), host, events);
                {
                    let mut ticks = TickLoop::new();
                    ticks.register(
                        || {
                            if worker_stop.load(Ordering::SeqCst) {
                                Tick::Stop
                            } else {
                                coordinator.tick()
                            }
                        },
                        Duration::ZERO,
                    );
                    ticks.run();
                }
                coordinator.into_host()
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    fn finish(mut self) -> Result<HeadlessHost> {
        self.stop.store(true, Ordering::SeqCst);
        self.handle
            .take()
            .context("host thread already joined")?
            .join()
            .map_err(|_| anyhow!("host thread panicked"))
    }
}

fn input<'a>(workflow: &'a Value, title: &str, key: &str) -> Option<&'a Value> {
    node_with_title(workflow, title)?.get("inputs")?.get(key)
}

fn seeds_of(submission: &Value) -> Vec<i64> {
    let Some(nodes) = submission["prompt"].as_object() else {
        return Vec::new();
    };
    nodes
        .values()
        .filter_map(|node| node.get("inputs"))
        .flat_map(|inputs| ["seed", "noise_seed"].map(|key| inputs.get(key).and_then(Value::as_i64)))
        .flatten()
        .collect()
}

fn logged_events(path: &Path) -> Result<Vec<PipelineEvent>> {
    Ok(read_event_log(path)?
        .into_iter()
        .map(|record| record.event)
        .collect())
}

#[test]
fn prompt_to_imported_mesh() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let output_dir = temp.path().join("server-output");
    let server = ServerHandle::start(&output_dir, Scenario::Succeeds)?;
    let config = Arc::new(test_config(temp.path(), server.port));
    write_templates(&config)?;
    let host = HostThread::spawn(Arc::clone(&config), HeadlessHost::default())?;
    let (mut session, log) = overlay(&config)?;

    session.submit_prompt("sphere")?;
    assert_eq!(session.state(), SessionState::AwaitingSelection);
    assert_eq!(session.options(), &OptionLabel::ALL[..]);
    for view in RenderView::ALL {
        assert!(config.view_path(view).is_file(), "missing {view:?} view");
    }
    for (label, text) in OptionLabel::ALL.into_iter().zip(OPTION_TEXTS) {
        assert!(config.option_image_path(label).is_file());
        assert_eq!(fs::read_to_string(config.option_text_path(label))?, text);
    }
    let options_job = server.fake.submissions()?.remove(0);
    assert_eq!(
        input(&options_job["prompt"], "prompt", "text"),
        Some(&json!("sphere"))
    );
    assert_eq!(
        input(&options_job["prompt"], "view_front", "image"),
        Some(&json!(config.view_path(RenderView::Front).to_string_lossy()))
    );

    session.select_option(OptionLabel::B)?;
    assert_eq!(session.state(), SessionState::AwaitingPrompt);
    assert_eq!(fs::read_to_string(config.active_prompt_path())?, "a blue sphere");
    let submissions = server.fake.submissions()?;
    assert_eq!(submissions.len(), 2);
    assert_eq!(
        input(&submissions[1]["prompt"], "prompt", "text"),
        Some(&json!("a blue sphere"))
    );
    assert_eq!(
        input(&submissions[1]["prompt"], "option_image", "image"),
        Some(&json!(config.option_image_path(OptionLabel::B).to_string_lossy()))
    );
    assert!(config.mesh_target_path("obj").is_file());

    let seen = updates(&log)?;
    assert!(seen
        .iter()
        .any(|update| matches!(update, SessionUpdate::OptionsReady { failed, .. } if failed.is_empty())));
    assert!(seen.iter().any(|update| matches!(
        update,
        SessionUpdate::MeshReady { label: OptionLabel::B, imported: true, .. }
    )));

    let host = host.finish()?;
    let meshes = host.mesh_objects();
    assert_eq!(meshes, vec!["mesh".to_string()]);
    let bounds = host.bounds("mesh").context("imported mesh has bounds")?;
    assert!((bounds.max_dimension() - 1.0).abs() < 1e-9);
    Ok(())
}

#[test]
fn seeds_are_unique_across_submissions() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let server = ServerHandle::start(&temp.path().join("server-output"), Scenario::Succeeds)?;
    let config = Arc::new(Config {
        signal_wait_deadline_s: 0.05,
        ..test_config(temp.path(), server.port)
    });
    write_templates(&config)?;
    let (mut session, _log) = overlay(&config)?;

    session.submit_prompt("chair")?;
    session.submit_prompt("table")?;
    session.submit_prompt("lamp")?;

    let seeds: Vec<i64> = server
        .fake
        .submissions()?
        .iter()
        .flat_map(seeds_of)
        .collect();
    assert_eq!(seeds.len(), 3);
    let distinct: HashSet<i64> = seeds.iter().copied().collect();
    assert_eq!(distinct.len(), seeds.len());
    Ok(())
}

#[test]
fn unreachable_server_leaves_active_prompt_untouched() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let mut server = ServerHandle::start(&temp.path().join("server-output"), Scenario::Succeeds)?;
    let config = Arc::new(Config {
        signal_wait_deadline_s: 0.05,
        ..test_config(temp.path(), server.port)
    });
    write_templates(&config)?;
    let (mut session, log) = overlay(&config)?;
    session.submit_prompt("sphere")?;
    fs::write(config.active_prompt_path(), "previous")?;

    server.stop();
    let err = match session.select_option(OptionLabel::B) {
        Ok(()) => anyhow::bail!("selection should fail without a server"),
        Err(err) => err,
    };
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::UnreachableServer { .. })
    ));
    assert_eq!(fs::read_to_string(config.active_prompt_path())?, "previous");
    assert!(!config.signal_channel().is_pending(SignalKind::ImportRequest));
    assert_eq!(session.state(), SessionState::AwaitingPrompt);
    assert!(updates(&log)?.iter().any(|update| matches!(
        update,
        SessionUpdate::Error { summary, .. } if summary == "Generation server unreachable"
    )));
    Ok(())
}

#[test]
fn missing_render_completion_still_generates_options() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let server = ServerHandle::start(&temp.path().join("server-output"), Scenario::Succeeds)?;
    let config = Arc::new(Config {
        signal_wait_deadline_s: 0.2,
        ..test_config(temp.path(), server.port)
    });
    write_templates(&config)?;
    let (mut session, _log) = overlay(&config)?;

    session.submit_prompt("sphere")?;
    assert_eq!(session.state(), SessionState::AwaitingSelection);
    assert!(config.signal_channel().is_pending(SignalKind::RenderRequest));

    let events = logged_events(&config.event_log_path(EventSource::Overlay))?;
    let timeout_at = events
        .iter()
        .position(|event| *event == PipelineEvent::RenderTimeout)
        .context("render timeout logged")?;
    let submitted_at = events
        .iter()
        .position(|event| *event == PipelineEvent::OptionsSubmitted)
        .context("options submission logged")?;
    assert!(timeout_at < submitted_at);

    let options_job = server.fake.submissions()?.remove(0);
    assert_eq!(
        input(&options_job["prompt"], "view_front", "image"),
        Some(&json!(""))
    );
    Ok(())
}

#[test]
fn empty_generated_mesh_keeps_previous_mesh_visible() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let server = ServerHandle::start(&temp.path().join("server-output"), Scenario::EmptyMesh)?;
    let config = Arc::new(test_config(temp.path(), server.port));
    write_templates(&config)?;

    let mut scene = HeadlessHost::default();
    let previous = scene.add_object("previous", box_mesh([0.0, 0.0, 0.0], [2.0, 2.0, 2.0]));
    let host = HostThread::spawn(Arc::clone(&config), scene)?;
    let (mut session, log) = overlay(&config)?;

    session.submit_prompt("sphere")?;
    let err = match session.select_option(OptionLabel::A) {
        Ok(()) => anyhow::bail!("empty mesh should not import"),
        Err(err) => err,
    };
    assert!(format!("{err:#}").contains("empty"));
    assert!(!updates(&log)?
        .iter()
        .any(|update| matches!(update, SessionUpdate::MeshReady { .. })));

    let host = host.finish()?;
    assert_eq!(host.mesh_objects(), vec![previous.clone()]);
    assert_eq!(host.is_visible(&previous), Some(true));
    Ok(())
}

fn submitted(prompt_id: &str) -> SubmittedJob {
    SubmittedJob {
        kind: JobKind::Options,
        correlation_id: "wait-test".to_string(),
        prompt_id: prompt_id.to_string(),
        submitted_at: SystemTime::now(),
    }
}

#[test]
fn wait_gives_up_after_the_attempt_budget() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let server = ServerHandle::start(&temp.path().join("server-output"), Scenario::NeverFinishes)?;
    let config = Arc::new(Config {
        job_poll_attempts: 4,
        ..test_config(temp.path(), server.port)
    });
    let client = GenerationClient::new(config)?;

    let mut seen = Vec::new();
    let err = match client.wait(&submitted("p-stuck"), |attempt, _| seen.push(attempt)) {
        Ok(result) => anyhow::bail!("stalled job finished: {result:?}"),
        Err(err) => err,
    };
    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::JobTimeout {
            prompt_id,
            attempts,
            ..
        }) => {
            assert_eq!(prompt_id, "p-stuck");
            assert_eq!(*attempts, 4);
        }
        other => anyhow::bail!("expected a timeout, got {other:?}"),
    }
    assert_eq!(seen, vec![1, 2, 3, 4]);
    assert_eq!(server.fake.polls("p-stuck")?, 4);
    Ok(())
}

#[test]
fn wait_stops_at_the_first_error_status() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let server = ServerHandle::start(&temp.path().join("server-output"), Scenario::FailsMidway)?;
    let config = Arc::new(test_config(temp.path(), server.port));
    let client = GenerationClient::new(config)?;

    let err = match client.wait(&submitted("p-oom"), |_, _| {}) {
        Ok(result) => anyhow::bail!("failed job reported success: {result:?}"),
        Err(err) => err,
    };
    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::JobFailed { prompt_id, message }) => {
            assert_eq!(prompt_id, "p-oom");
            assert!(message.contains("out of memory"));
        }
        other => anyhow::bail!("expected a job failure, got {other:?}"),
    }
    assert_eq!(server.fake.polls("p-oom")?, 2);
    Ok(())
}
