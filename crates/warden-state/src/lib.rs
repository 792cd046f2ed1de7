//! Warden-State: persistence for the Warden governance loop
//!
//! This crate owns every durable record the supervisor, evaluator and voting
//! engine share: training runs, their step logs, proposals, votes, phase
//! results and the consensus history.
//!
//! ## Key Components
//!
//! - `storage_traits`: `RunStore`, `StepStore`, `ProposalStore`, `ConsensusLedger`
//! - `fakes::MemoryGovernanceStore`: in-memory backend for tests
//! - `SurrealGovernanceStore`: SurrealDB backend (`mem://`, `surrealkv://`, `ws://`)

mod error;
pub mod fakes;
pub mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use storage_traits::{
    ConsensusHistoryEntry, ConsensusLedger, ConsensusOutcome, ConsensusResultRecord,
    ExecutionRecord, ProposalFilter, ProposalOrigin, ProposalRecord, ProposalStatus,
    ProposalStore, RunFilter, RunStatus, RunStore, StepParams, StepStore, StorageResult,
    ThresholdSnapshot, TrainingRunRecord, TrainingStepRecord, VoteRecord, VoterRole, VotingPhase,
    STEP_PARAMS_SCHEMA_VERSION,
};
pub use surreal_store::SurrealGovernanceStore;

/// Result type for warden-state setup operations
pub type Result<T> = std::result::Result<T, StateError>;
