//! File-based signaling between the overlay and the 3D host process.
//!
//! Every signal kind has exactly one writer role and one reader role, which is
//! what lets the two processes sequence work without any lock.

mod channel;
mod messages;
mod payload;
mod waiter;

pub use channel::{SignalChannel, SignalKind, SignalRole};
pub use messages::{Completion, CompletionOutcome, ImportRequest, RenderRequest, SignalMessage};
pub use payload::{SignalKey, SignalPayload, PAYLOAD_VERSION};
pub use waiter::{CompletionPoll, CompletionWaiter};
