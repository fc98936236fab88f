#[macro_use]
mod log_macros;

pub mod admission;
pub mod backend;
pub mod cache;
pub mod director;
pub mod download;
pub mod driver;
pub mod error;
pub mod state;
pub mod task;
pub mod tracing_init;

pub use director::{RunDirector, RunErrorReport, RunOptions, RunOutcome, wait_for_signal};
pub use error::{RuntimeError, RuntimeReason, RuntimeResult};
pub use state::{CallJob, InstanceKey, JobId, StateMachine, TaskResult};
