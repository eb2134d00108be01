use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::events::EventSource;
use crate::jobs::{OptionLabel, RenderView};
use crate::signals::SignalChannel;

const ENV_PREFIX: &str = "MESHBRIDGE_";

/// Process configuration, built once at startup and passed down by reference.
///
/// Durations are stored as seconds so config files stay human-editable; the
/// accessor methods clamp them into the supported range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub signal_dir: PathBuf,
    pub artifact_dir: PathBuf,
    pub event_log_dir: Option<PathBuf>,
    pub server_host: String,
    pub server_port: u16,
    pub server_output_dir: PathBuf,
    pub options_template: PathBuf,
    pub mesh_template: PathBuf,
    pub mesh_extensions: Vec<String>,
    pub probe_timeout_s: f64,
    pub request_timeout_s: f64,
    pub coordinator_tick_s: f64,
    pub error_backoff_s: f64,
    pub job_poll_interval_s: f64,
    pub job_poll_attempts: u32,
    pub signal_wait_interval_s: f64,
    pub signal_wait_deadline_s: f64,
    pub render_resolution: u32,
    pub host_has_remesh: bool,
    pub use_progress_socket: bool,
}

impl Default for Config {
    fn default() -> Self {
        let root = env::temp_dir().join("meshbridge");
        Self {
            signal_dir: root.join("signals"),
            artifact_dir: root.join("artifacts"),
            event_log_dir: None,
            server_host: "127.0.0.1".to_string(),
            server_port: 8188,
            server_output_dir: PathBuf::from("output"),
            options_template: PathBuf::from("workflows/options.json"),
            mesh_template: PathBuf::from("workflows/mesh.json"),
            mesh_extensions: vec!["glb".to_string(), "obj".to_string(), "stl".to_string()],
            probe_timeout_s: 2.0,
            request_timeout_s: 30.0,
            coordinator_tick_s: 1.0,
            error_backoff_s: 5.0,
            job_poll_interval_s: 5.0,
            job_poll_attempts: 120,
            signal_wait_interval_s: 0.5,
            signal_wait_deadline_s: 60.0,
            render_resolution: 512,
            host_has_remesh: true,
            use_progress_socket: true,
        }
    }
}

impl Config {
    /// Loads a JSON config file; keys it leaves out keep their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid config JSON in {}", path.display()))
    }

    /// Places every directory under one root. Used by tests and `--root`.
    pub fn rooted(root: &Path) -> Self {
        Self {
            signal_dir: root.join("signals"),
            artifact_dir: root.join("artifacts"),
            server_output_dir: root.join("server-output"),
            options_template: root.join("workflows").join("options.json"),
            mesh_template: root.join("workflows").join("mesh.json"),
            ..Self::default()
        }
    }

    /// Applies `MESHBRIDGE_*` environment overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(value) = env_value::<PathBuf>("SIGNAL_DIR") {
            self.signal_dir = value;
        }
        if let Some(value) = env_value::<PathBuf>("ARTIFACT_DIR") {
            self.artifact_dir = value;
        }
        if let Some(value) = env_value::<PathBuf>("EVENT_LOG_DIR") {
            self.event_log_dir = Some(value);
        }
        if let Some(value) = env_value::<String>("SERVER_HOST") {
            self.server_host = value;
        }
        if let Some(value) = env_value::<u16>("SERVER_PORT") {
            self.server_port = value;
        }
        if let Some(value) = env_value::<PathBuf>("SERVER_OUTPUT_DIR") {
            self.server_output_dir = value;
        }
        if let Some(value) = env_value::<PathBuf>("OPTIONS_TEMPLATE") {
            self.options_template = value;
        }
        if let Some(value) = env_value::<PathBuf>("MESH_TEMPLATE") {
            self.mesh_template = value;
        }
        if let Some(value) = env_value::<f64>("JOB_POLL_INTERVAL") {
            self.job_poll_interval_s = value;
        }
        if let Some(value) = env_value::<u32>("JOB_POLL_ATTEMPTS") {
            self.job_poll_attempts = value;
        }
        if let Some(value) = env_value::<f64>("SIGNAL_WAIT_DEADLINE") {
            self.signal_wait_deadline_s = value;
        }
        if let Some(value) = env_value::<u32>("RENDER_RESOLUTION") {
            self.render_resolution = value;
        }
        if let Some(value) = env_value::<String>("HOST_HAS_REMESH") {
            self.host_has_remesh = parse_flag(&value).unwrap_or(self.host_has_remesh);
        }
        if let Some(value) = env_value::<String>("USE_PROGRESS_SOCKET") {
            self.use_progress_socket = parse_flag(&value).unwrap_or(self.use_progress_socket);
        }
        self
    }

    pub fn signal_channel(&self) -> SignalChannel {
        SignalChannel::new(&self.signal_dir)
    }

    pub fn server_base_url(&self) -> String {
        format!("http://{}:{}", self.server_host, self.server_port)
    }

    pub fn server_ws_url(&self, client_id: &str) -> String {
        format!(
            "ws://{}:{}/ws?clientId={client_id}",
            self.server_host, self.server_port
        )
    }

    pub fn option_image_path(&self, label: OptionLabel) -> PathBuf {
        self.artifact_dir.join(format!("option_{label}.png"))
    }

    pub fn option_text_path(&self, label: OptionLabel) -> PathBuf {
        self.artifact_dir.join(format!("option_{label}.txt"))
    }

    pub fn active_prompt_path(&self) -> PathBuf {
        self.artifact_dir.join("active_prompt.txt")
    }

    pub fn mesh_target_path(&self, extension: &str) -> PathBuf {
        self.artifact_dir
            .join(format!("mesh.{}", extension.trim_start_matches('.')))
    }

    pub fn views_dir(&self) -> PathBuf {
        self.artifact_dir.join("views")
    }

    pub fn view_path(&self, view: RenderView) -> PathBuf {
        self.views_dir().join(view.file_name())
    }

    pub fn event_log_path(&self, source: EventSource) -> PathBuf {
        self.event_log_dir
            .clone()
            .unwrap_or_else(|| self.artifact_dir.clone())
            .join(format!("{}-events.jsonl", source.as_str()))
    }

    /// Both workflow templates must exist before any job is attempted.
    pub fn validate_templates(&self) -> Result<(), PipelineError> {
        for template in [&self.options_template, &self.mesh_template] {
            if !template.is_file() {
                return Err(PipelineError::MissingTemplate(template.clone()));
            }
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        secs(self.probe_timeout_s, 0.05, 30.0)
    }

    pub fn request_timeout(&self) -> Duration {
        secs(self.request_timeout_s, 1.0, 600.0)
    }

    pub fn coordinator_tick(&self) -> Duration {
        secs(self.coordinator_tick_s, 0.05, 2.0)
    }

    pub fn error_backoff(&self) -> Duration {
        secs(self.error_backoff_s, 0.05, 60.0)
    }

    pub fn job_poll_interval(&self) -> Duration {
        secs(self.job_poll_interval_s, 0.01, 60.0)
    }

    pub fn job_poll_attempts(&self) -> u32 {
        self.job_poll_attempts.clamp(1, 10_000)
    }

    pub fn signal_wait_interval(&self) -> Duration {
        secs(self.signal_wait_interval_s, 0.01, 5.0)
    }

    pub fn signal_wait_deadline(&self) -> Duration {
        secs(self.signal_wait_deadline_s, 0.05, 3600.0)
    }

    pub fn render_resolution(&self) -> u32 {
        self.render_resolution.clamp(64, 4096)
    }
}

fn secs(value: f64, min: f64, max: f64) -> Duration {
    let value = if value.is_finite() { value } else { min };
    Duration::from_secs_f64(value.clamp(min, max))
}

fn env_value<T: FromStr>(key: &str) -> Option<T> {
    env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse().ok())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_file_keeps_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("meshbridge.json");
        std::fs::write(&path, r#"{"server_port": 9000, "job_poll_attempts": 3}"#)?;

        let config = Config::load(&path)?;
        assert_eq!(config.server_port, 9000);
        assert_eq!(config.job_poll_attempts(), 3);
        assert_eq!(config.server_host, "127.0.0.1");
        assert_eq!(config.job_poll_interval(), Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn durations_are_clamped() {
        let config = Config {
            coordinator_tick_s: 30.0,
            job_poll_interval_s: f64::NAN,
            ..Config::default()
        };
        assert_eq!(config.coordinator_tick(), Duration::from_secs(2));
        assert!((config.job_poll_interval().as_secs_f64() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn artifact_paths_are_fixed_per_label() {
        let config = Config::rooted(Path::new("/work"));
        assert_eq!(
            config.option_image_path(OptionLabel::B),
            PathBuf::from("/work/artifacts/option_B.png")
        );
        assert_eq!(
            config.option_text_path(OptionLabel::C),
            PathBuf::from("/work/artifacts/option_C.txt")
        );
        assert_eq!(
            config.mesh_target_path(".glb"),
            PathBuf::from("/work/artifacts/mesh.glb")
        );
        assert_eq!(
            config.view_path(RenderView::Back),
            PathBuf::from("/work/artifacts/views/back.png")
        );
        assert_eq!(
            config.event_log_path(EventSource::Host),
            PathBuf::from("/work/artifacts/host-events.jsonl")
        );
    }

    #[test]
    fn missing_template_is_reported_by_path() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let config = Config::rooted(temp.path());
        std::fs::create_dir_all(temp.path().join("workflows"))?;
        std::fs::write(&config.options_template, "{}")?;

        match config.validate_templates() {
            Err(PipelineError::MissingTemplate(path)) => assert_eq!(path, config.mesh_template),
            other => panic!("unexpected {other:?}"),
        }
        std::fs::write(&config.mesh_template, "{}")?;
        assert!(config.validate_templates().is_ok());
        Ok(())
    }
}
