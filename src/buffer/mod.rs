//! Shared-buffer pool and memory-pressure shedding.
//!
//! Buffers are owned by the companion and lent to this client; the pool keeps
//! at most `max_buffers` of them with a write/read double-buffering pair.

mod pool;
mod pressure;

pub use pool::{
    BufferPool, BufferPoolConfig, BufferReleaser, ManagedBuffer, PressureEvent, ReleaseReason,
};
pub use pressure::{PressureController, PressureLevel, PressureSignal, PressureWarning};
