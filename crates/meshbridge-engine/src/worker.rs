use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use meshbridge_contracts::{Config, EventLog, OptionLabel};
use tracing::{debug, warn};

use crate::session::{OverlaySession, SessionUpdate};

enum OverlayCommand {
    SubmitPrompt { generation: u64, prompt: String },
    SelectOption { generation: u64, label: OptionLabel },
    Shutdown,
}

/// A session update stamped with the command generation that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedUpdate {
    pub generation: u64,
    pub update: SessionUpdate,
}

/// Runs an `OverlaySession` on its own thread so the UI loop never blocks on
/// network calls or completion waits.
///
/// Jobs in flight cannot be cancelled. Issuing a new command bumps the
/// generation; updates from older generations are dropped on receipt.
pub struct OverlayWorker {
    sender: Option<mpsc::Sender<OverlayCommand>>,
    updates: mpsc::Receiver<TaggedUpdate>,
    handle: Option<thread::JoinHandle<()>>,
    generation: Arc<AtomicU64>,
}

impl OverlayWorker {
    pub fn spawn(config: Arc<Config>, events: EventLog) -> Result<Self> {
        let (command_tx, command_rx) = mpsc::channel::<OverlayCommand>();
        let (update_tx, update_rx) = mpsc::channel::<TaggedUpdate>();
        let generation = Arc::new(AtomicU64::new(0));

        let current = Arc::new(AtomicU64::new(0));
        let session_current = Arc::clone(&current);
        let session = OverlaySession::new(config, events, move |update| {
            let _ = update_tx.send(TaggedUpdate {
                generation: session_current.load(Ordering::SeqCst),
                update,
            });
        })?;

        let handle = thread::Builder::new()
            .name("meshbridge-overlay".to_string())
            .spawn(move || run(session, command_rx, current))
            .context("overlay worker thread spawn failed")?;

        Ok(Self {
            sender: Some(command_tx),
            updates: update_rx,
            handle: Some(handle),
            generation,
        })
    }

    /// Returns the generation assigned to this command.
    pub fn submit_prompt(&self, prompt: &str) -> Result<u64> {
        let generation = self.next_generation();
        self.send(OverlayCommand::SubmitPrompt {
            generation,
            prompt: prompt.to_string(),
        })?;
        Ok(generation)
    }

    pub fn select_option(&self, label: OptionLabel) -> Result<u64> {
        let generation = self.next_generation();
        self.send(OverlayCommand::SelectOption { generation, label })?;
        Ok(generation)
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Next update from the current generation, skipping superseded ones.
    pub fn try_recv(&self) -> Option<SessionUpdate> {
        while let Ok(tagged) = self.updates.try_recv() {
            if let Some(update) = self.accept(tagged) {
                return Some(update);
            }
        }
        None
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<SessionUpdate> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            let tagged = self.updates.recv_timeout(remaining).ok()?;
            if let Some(update) = self.accept(tagged) {
                return Some(update);
            }
        }
    }

    /// False once the session thread has exited, whether through
    /// `shutdown` or because it died.
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.sender.take() {
            let _ = tx.send(OverlayCommand::Shutdown);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn accept(&self, tagged: TaggedUpdate) -> Option<SessionUpdate> {
        if tagged.generation < self.current_generation() {
            debug!(generation = tagged.generation, "dropping superseded update");
            return None;
        }
        Some(tagged.update)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn send(&self, command: OverlayCommand) -> Result<()> {
        let Some(tx) = self.sender.as_ref() else {
            anyhow::bail!("overlay worker is shut down");
        };
        tx.send(command)
            .map_err(|_| anyhow::anyhow!("overlay worker is not running"))
    }
}

impl Drop for OverlayWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    mut session: OverlaySession,
    commands: mpsc::Receiver<OverlayCommand>,
    current: Arc<AtomicU64>,
) {
    while let Ok(command) = commands.recv() {
        match command {
            OverlayCommand::SubmitPrompt { generation, prompt } => {
                current.store(generation, Ordering::SeqCst);
                if let Err(err) = session.submit_prompt(&prompt) {
                    warn!(generation, "prompt cycle failed: {err:#}");
                }
            }
            OverlayCommand::SelectOption { generation, label } => {
                current.store(generation, Ordering::SeqCst);
                if let Err(err) = session.select_option(label) {
                    warn!(generation, "selection cycle failed: {err:#}");
                }
            }
            OverlayCommand::Shutdown => break,
        }
    }
    debug!("overlay worker stopped");
}
