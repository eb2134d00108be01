pub mod config;
pub mod errors;
pub mod events;
pub mod jobs;
pub mod remesh;
pub mod scheduler;
pub mod signals;

pub use config::Config;
pub use errors::{PipelineError, PipelineResult};
pub use events::{read_event_log, EventLog, EventRecord, EventSource, PipelineEvent};
pub use jobs::{
    ImageRef, Job, JobKind, JobResult, JobStatus, OptionLabel, RenderView, SelectedOption,
    SlotOutput, SubmittedJob,
};
pub use remesh::{RemeshCycleState, RemeshMode, RemeshStage};
pub use scheduler::{Scheduler, Tick, TickHandle, TickLoop};
pub use signals::{
    Completion, CompletionOutcome, CompletionPoll, CompletionWaiter, ImportRequest, RenderRequest,
    SignalChannel, SignalKey, SignalKind, SignalMessage, SignalPayload,
};
