//! Companion process lifecycle: privileged execution, binary deployment, and
//! the start/stop state machine.

mod binary;
mod process;
mod runner;

pub use binary::{parse_protocol_version, BinaryDeployer, BinarySource};
pub use process::{LifecycleConfig, ProcessLifecycle, ProcessLifecycleState, StartPhase};
pub use runner::{shell_quote, CommandOutcome, PrivilegedRunner, RootAvailability, SuRunner};
