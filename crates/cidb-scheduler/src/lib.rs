//! Concurrent build simulation for CIDB.
//!
//! A fixed-size [`WorkerPool`] drains a [`TaskQueue`]; the
//! [`BuildSimulator`] uses it to write slave builds in parallel under a
//! master, the way a commit-queue run does.

pub mod error;
pub mod pool;
pub mod queue;
pub mod simulate;

pub use error::{SchedulerError, SchedulerResult};
pub use pool::WorkerPool;
pub use queue::{TaskConsumer, TaskQueue};
pub use simulate::{
    BuildSimulator, SimulatedBuild, SimulatedFailure, SimulatedStage, SimulationOutcome,
};
