use std::io;

use super::channel::{SignalChannel, SignalKind};
use super::messages::Completion;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionPoll {
    /// No completion file yet.
    Pending,
    Ready(Completion),
    /// The same completion was seen again after a reader crashed before its
    /// delete. Already acted on; ignore.
    Duplicate(String),
    /// A completion answering an earlier request, e.g. one that timed out on
    /// the overlay side and finished later on the host.
    Stale(Completion),
}

/// Single reader of one completion kind.
#[derive(Debug, Clone)]
pub struct CompletionWaiter {
    channel: SignalChannel,
    kind: SignalKind,
    last_seen: Option<String>,
}

impl CompletionWaiter {
    pub fn new(channel: SignalChannel, kind: SignalKind) -> Self {
        Self {
            channel,
            kind,
            last_seen: None,
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    /// Consumes the completion file if present. `expected` is the request id
    /// the caller is waiting on; completions without an id are accepted.
    pub fn poll(&mut self, expected: Option<&str>) -> io::Result<CompletionPoll> {
        let Some(payload) = self.channel.consume(self.kind)? else {
            return Ok(CompletionPoll::Pending);
        };
        let completion = Completion::from_payload(&payload);

        if let (Some(id), Some(last)) = (completion.request_id.as_deref(), self.last_seen.as_deref())
        {
            if id == last {
                return Ok(CompletionPoll::Duplicate(id.to_string()));
            }
        }
        if let (Some(id), Some(expected)) = (completion.request_id.as_deref(), expected) {
            if id != expected {
                return Ok(CompletionPoll::Stale(completion));
            }
        }

        self.last_seen = completion.request_id.clone();
        Ok(CompletionPoll::Ready(completion))
    }
}
