//! Session orchestration: establish, resume, reconcile, and recover.

mod orchestrator;
mod reconcile;
mod state;

pub use orchestrator::{SessionConfig, SessionOrchestrator};
pub use reconcile::{reconcile, ReconcileSnapshot, ReconcileStore};
pub use state::{BufferReleaseRequest, ErrorEvent, SessionState};
