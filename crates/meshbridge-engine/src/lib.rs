pub mod client;
pub mod coordinator;
pub mod headless;
pub mod host;
pub mod mesh_io;
pub mod progress;
pub mod reconcile;
pub mod session;
pub mod worker;
pub mod workflow;

pub use client::{GenerationClient, MeshArtifact, OptionArtifacts};
pub use coordinator::{Coordinator, CoordinatorState};
pub use headless::{box_mesh, write_obj, HeadlessHost, RemeshRecord};
pub use host::{Bounds, HostError, HostResult, SceneHost, SceneMeshRef, Vec3};
pub use mesh_io::{load_mesh, MeshData};
pub use progress::{parse_progress_message, JobProgress, ProgressWatcher};
pub use reconcile::{MeshReconciler, ReconcileReport, ORIENTATION_FIX_DEGREES};
pub use session::{OverlaySession, SessionState, SessionUpdate};
pub use worker::{OverlayWorker, TaggedUpdate};
pub use workflow::{JobBuilder, SeedSource, SlotInputs, WorkflowTemplate};
