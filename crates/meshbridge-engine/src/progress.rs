use std::io::ErrorKind;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, warn};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{connect as websocket_connect, Message as WsMessage, WebSocket};

const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// One decoded progress-socket message.
#[derive(Debug, Clone, PartialEq)]
pub enum JobProgress {
    Executing { prompt_id: Option<String>, node: String },
    Progress { prompt_id: Option<String>, value: u64, max: u64 },
    Finished { prompt_id: Option<String> },
    Failed { prompt_id: Option<String>, message: String },
}

impl JobProgress {
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            Self::Executing { prompt_id, .. }
            | Self::Progress { prompt_id, .. }
            | Self::Finished { prompt_id }
            | Self::Failed { prompt_id, .. } => prompt_id.as_deref(),
        }
    }

    /// Short text for the status line.
    pub fn status_text(&self) -> String {
        match self {
            Self::Executing { node, .. } => format!("running node {node}"),
            Self::Progress { value, max, .. } => format!("step {value}/{max}"),
            Self::Finished { .. } => "finished".to_string(),
            Self::Failed { message, .. } => format!("failed: {message}"),
        }
    }
}

/// Decodes a `{type, data}` message. Unknown types and malformed bodies
/// yield `None`.
pub fn parse_progress_message(raw: &str) -> Option<JobProgress> {
    let parsed: Value = serde_json::from_str(raw).ok()?;
    let kind = parsed.get("type")?.as_str()?;
    let data = parsed.get("data").cloned().unwrap_or(Value::Null);
    let prompt_id = data
        .get("prompt_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    match kind {
        "executing" => match data.get("node") {
            Some(Value::String(node)) => Some(JobProgress::Executing {
                prompt_id,
                node: node.clone(),
            }),
            Some(Value::Null) | None => Some(JobProgress::Finished { prompt_id }),
            Some(other) => Some(JobProgress::Executing {
                prompt_id,
                node: other.to_string(),
            }),
        },
        "execution_success" => Some(JobProgress::Finished { prompt_id }),
        "progress" => Some(JobProgress::Progress {
            prompt_id,
            value: data.get("value").and_then(Value::as_u64).unwrap_or(0),
            max: data.get("max").and_then(Value::as_u64).unwrap_or(0),
        }),
        "execution_error" => {
            let message = data
                .get("exception_message")
                .and_then(Value::as_str)
                .unwrap_or("execution error")
                .trim()
                .to_string();
            Some(JobProgress::Failed { prompt_id, message })
        }
        _ => None,
    }
}

/// Background reader of the server's progress socket.
///
/// Purely informational: `/history` polling stays authoritative for
/// terminal results, so a dropped socket only loses status text.
pub struct ProgressWatcher {
    handle: Option<thread::JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
}

impl ProgressWatcher {
    pub fn spawn<F>(url: &str, on_event: F) -> Result<Self>
    where
        F: FnMut(JobProgress) + Send + 'static,
    {
        let (mut ws, _) =
            websocket_connect(url).with_context(|| format!("failed to connect {url}"))?;
        set_socket_read_timeout(&mut ws, Some(READ_TIMEOUT));

        let stop_flag = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop_flag);
        let handle = thread::Builder::new()
            .name("meshbridge-progress".to_string())
            .spawn(move || read_loop(ws, worker_stop, on_event))
            .context("progress thread spawn failed")?;
        Ok(Self {
            handle: Some(handle),
            stop_flag,
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_loop<F>(mut ws: WebSocket<MaybeTlsStream<TcpStream>>, stop_flag: Arc<AtomicBool>, mut on_event: F)
where
    F: FnMut(JobProgress),
{
    while !stop_flag.load(Ordering::SeqCst) {
        let message = match ws.read() {
            Ok(message) => message,
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                continue;
            }
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                debug!("progress socket closed");
                return;
            }
            Err(err) => {
                warn!("progress socket read failed: {err}");
                return;
            }
        };
        let raw = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Binary(_) => continue,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        if let Some(event) = parse_progress_message(&raw) {
            on_event(event);
        }
    }
    let _ = ws.close(None);
}

fn set_socket_read_timeout(ws: &mut WebSocket<MaybeTlsStream<TcpStream>>, timeout: Option<Duration>) {
    #[allow(unreachable_patterns)]
    match ws.get_mut() {
        MaybeTlsStream::Plain(stream) => {
            let _ = stream.set_read_timeout(timeout);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_node_means_finished() {
        let event = parse_progress_message(
            r#"{"type":"executing","data":{"node":null,"prompt_id":"p-1"}}"#,
        );
        assert_eq!(
            event,
            Some(JobProgress::Finished {
                prompt_id: Some("p-1".to_string())
            })
        );
    }

    #[test]
    fn progress_and_errors_decode() {
        let progress = parse_progress_message(r#"{"type":"progress","data":{"value":3,"max":20}}"#);
        assert_eq!(
            progress.map(|p| p.status_text()),
            Some("step 3/20".to_string())
        );

        let failed = parse_progress_message(
            r#"{"type":"execution_error","data":{"prompt_id":"p","exception_message":" OOM "}}"#,
        );
        assert_eq!(failed.as_ref().and_then(JobProgress::prompt_id), Some("p"));
        assert_eq!(
            failed.map(|p| p.status_text()),
            Some("failed: OOM".to_string())
        );
    }

    #[test]
    fn unknown_or_garbage_messages_are_ignored() {
        assert_eq!(parse_progress_message(r#"{"type":"status","data":{}}"#), None);
        assert_eq!(parse_progress_message("not json"), None);
    }
}
