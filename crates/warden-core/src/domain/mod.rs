//! Domain models for Warden.
//!
//! - `error`: the error taxonomy shared by the supervisor, evaluator and voting engine
//! - `worker`: the line protocol spoken by the training worker

pub mod error;
pub mod worker;

pub use error::{Result, SupervisorError, VotingError, WardenError};
pub use worker::{parse_worker_line, StepReport, WorkerLineError, WorkerMessage};
