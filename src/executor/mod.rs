//! Program executors (§4.9, §4.10): a sequential, instruction-at-a-time
//! simulator and a faster event-driven makespan estimator over the same
//! `Program`/`HardwareContext` types.

pub mod concurrent;
pub mod sequential;

pub use concurrent::ConcurrentEstimator;
pub use sequential::{ExecState, SequentialExecutor};
