//! Leased command processing.
//!
//! - `model`: command, progress and status wire types
//! - `queue`: remote command queue contract
//! - `executor`: workflow executor contract and progress reporter
//! - `worker`: LeaseWorker, InFlightSet and the heartbeat loop

pub mod executor;
pub mod model;
pub mod queue;
pub mod worker;

pub use executor::{ExecutionOptions, ProgressReporter, WorkflowExecutor};
pub use model::{Command, CommandProgress, CommandReport, CommandStatus, CommandType};
pub use queue::CommandQueue;
pub use worker::{InFlightLease, InFlightSet, LeaseWorker, LeaseWorkerOptions};
