use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use meshbridge_contracts::{
    Config, EventLog, EventSource, OptionLabel, RemeshCycleState, RemeshMode, RemeshStage,
    Scheduler, Tick, TickLoop,
};
use meshbridge_engine::{load_mesh, Coordinator, GenerationClient, HeadlessHost, OverlayWorker, SessionUpdate};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "meshbridge", version, about = "Prompt-to-mesh bridge between a 3D host and a generation server")]
struct Cli {
    /// JSON config file. Keys it leaves out keep their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Put signals, artifacts, templates and server output under one directory.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[arg(long, global = true)]
    port: Option<u16>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the host-side coordinator against a headless scene.
    Host(HostArgs),
    /// Run one prompt-to-mesh cycle from the overlay side.
    Session(SessionArgs),
    /// Check server reachability and workflow templates.
    Probe,
    /// Show or change the persisted remesh cycle.
    Remesh(RemeshArgs),
}

#[derive(Debug, Parser)]
struct HostArgs {
    /// Stop after this many ticks instead of running forever.
    #[arg(long)]
    ticks: Option<u64>,
    /// Mesh files to place in the scene before serving requests.
    #[arg(long = "scene")]
    scene: Vec<PathBuf>,
    #[arg(long)]
    no_remesh: bool,
}

#[derive(Debug, Parser)]
struct SessionArgs {
    /// Read from stdin when omitted.
    #[arg(long)]
    prompt: Option<String>,
    /// Option to turn into a mesh. Asked for interactively when omitted.
    #[arg(long)]
    select: Option<OptionLabel>,
}

#[derive(Debug, Parser)]
struct RemeshArgs {
    #[arg(long, conflicts_with = "disable")]
    enable: bool,
    #[arg(long)]
    disable: bool,
    #[arg(long)]
    stage: Option<u32>,
    #[arg(long)]
    mode: Option<RemeshMode>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("meshbridge error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Arc::new(resolve_config(&cli)?);
    match cli.command {
        Command::Host(args) => run_host(config, args),
        Command::Session(args) => run_session(config, args),
        Command::Probe => run_probe(config),
        Command::Remesh(args) => run_remesh(&config, args),
    }
}

/// Defaults, then the config file, then `MESHBRIDGE_*` variables, then flags.
fn resolve_config(cli: &Cli) -> Result<Config> {
    let base = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    Ok(apply_flags(cli, base.with_env_overrides()))
}

fn apply_flags(cli: &Cli, mut config: Config) -> Config {
    if let Some(root) = &cli.root {
        let rooted = Config::rooted(root);
        config.signal_dir = rooted.signal_dir;
        config.artifact_dir = rooted.artifact_dir;
        config.event_log_dir = rooted.event_log_dir;
        config.server_output_dir = rooted.server_output_dir;
        config.options_template = rooted.options_template;
        config.mesh_template = rooted.mesh_template;
    }
    if let Some(port) = cli.port {
        config.server_port = port;
    }
    config
}

fn run_host(config: Arc<Config>, args: HostArgs) -> Result<i32> {
    let mut host = HeadlessHost::new(config.host_has_remesh && !args.no_remesh);
    for path in &args.scene {
        let mesh = load_mesh(path)?;
        let stem = path
            .file_stem()
            .and_then(|value| value.to_str())
            .unwrap_or("mesh");
        let name = host.add_object(stem, mesh);
        info!(object = %name, "scene mesh loaded");
    }

    let session_id = Uuid::new_v4().to_string();
    let events = EventLog::open(&config, EventSource::Host, session_id);
    let mut coordinator = Coordinator::new(Arc::clone(&config), host, events);
    info!(
        signals = %config.signal_dir.display(),
        tick_ms = config.coordinator_tick().as_millis() as u64,
        "coordinator running"
    );

    let mut remaining = args.ticks;
    let mut ticks = TickLoop::new();
    ticks.register(
        || {
            if let Some(left) = remaining.as_mut() {
                if *left == 0 {
                    return Tick::Stop;
                }
                *left -= 1;
            }
            coordinator.tick()
        },
        Duration::ZERO,
    );
    ticks.run();
    Ok(0)
}

fn run_session(config: Arc<Config>, args: SessionArgs) -> Result<i32> {
    let prompt = match args.prompt {
        Some(prompt) => prompt,
        None => read_line("prompt> ")?,
    };
    let session_id = Uuid::new_v4().to_string();
    let events = EventLog::open(&config, EventSource::Overlay, session_id);
    let mut worker = OverlayWorker::spawn(config, events)?;
    worker.submit_prompt(&prompt)?;

    let code = loop {
        match next_update(&worker)? {
            SessionUpdate::Status(text) => eprintln!("{text}"),
            SessionUpdate::State(_) => {}
            SessionUpdate::OptionsReady { images, texts, failed } => {
                for (label, text) in &texts {
                    let image = images
                        .iter()
                        .find(|(candidate, _)| candidate == label)
                        .map(|(_, path)| path.display().to_string())
                        .unwrap_or_else(|| "(no image)".to_string());
                    println!("{label}: {text}  [{image}]");
                }
                for label in failed {
                    eprintln!("option {label} has no image");
                }
                let label = match args.select {
                    Some(label) => label,
                    None => read_line("select A/B/C> ")?
                        .parse::<OptionLabel>()
                        .map_err(anyhow::Error::msg)?,
                };
                worker.select_option(label)?;
            }
            SessionUpdate::MeshReady {
                label,
                mesh_path,
                imported,
            } => {
                println!("option {label} mesh: {}", mesh_path.display());
                if !imported {
                    eprintln!("import was not confirmed by the 3D host");
                }
                break 0;
            }
            SessionUpdate::Error { summary, detail } => {
                eprintln!("{summary}: {detail}");
                break 1;
            }
        }
    };
    worker.shutdown();
    Ok(code)
}

/// Blocks until the session reports something. Fails if the session thread
/// is gone, since nothing will ever arrive.
fn next_update(worker: &OverlayWorker) -> Result<SessionUpdate> {
    loop {
        if let Some(update) = worker.recv_timeout(Duration::from_millis(250)) {
            return Ok(update);
        }
        if !worker.is_running() {
            return worker
                .try_recv()
                .context("overlay session stopped before finishing");
        }
    }
}

fn run_probe(config: Arc<Config>) -> Result<i32> {
    let client = GenerationClient::new(Arc::clone(&config))?;
    let mut code = 0;
    match client.probe() {
        Ok(()) => println!("server {} reachable", config.server_base_url()),
        Err(err) => {
            println!("{err}");
            code = 1;
        }
    }
    match config.validate_templates() {
        Ok(()) => println!("workflow templates present"),
        Err(err) => {
            println!("{err}");
            code = 1;
        }
    }
    Ok(code)
}

fn run_remesh(config: &Config, args: RemeshArgs) -> Result<i32> {
    let channel = config.signal_channel();
    let mut state = RemeshCycleState::load(&channel).context("failed reading remesh state")?;
    let before = state.clone();
    if args.enable {
        state.enabled = true;
    }
    if args.disable {
        state.enabled = false;
    }
    if let Some(number) = args.stage {
        let Some(stage) = RemeshStage::from_number(number) else {
            bail!("remesh stage must be 1, 2 or 3");
        };
        state.stage = stage;
    }
    if let Some(mode) = args.mode {
        state.mode = mode;
    }
    if state != before {
        state.store(&channel).context("failed writing remesh state")?;
    }
    println!(
        "remesh {} stage {} mode {}",
        if state.enabled { "on" } else { "off" },
        state.stage.number(),
        state.mode.as_str()
    );
    Ok(0)
}

fn read_line(label: &str) -> Result<String> {
    eprint!("{label}");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let line = line.trim().to_string();
    if line.is_empty() {
        bail!("no input");
    }
    Ok(line)
}
