//! Error types for warden-state

use thiserror::Error;

/// Errors raised while connecting to or initializing the backing database
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

/// Errors returned by the storage traits.
///
/// Constraint variants (`StepOutOfOrder`, `DuplicateVote`, ...) are part of
/// the trait contracts: every backend must report them the same way.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("training run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("training run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    #[error("step {step} for run {run_id} is not after last recorded step {last}")]
    StepOutOfOrder { run_id: String, step: u64, last: u64 },

    #[error("proposal not found: {proposal_id}")]
    ProposalNotFound { proposal_id: String },

    #[error("proposal already exists: {proposal_id}")]
    DuplicateProposal { proposal_id: String },

    #[error("proposal {proposal_id} is {from}; cannot move to {to}")]
    InvalidProposalTransition {
        proposal_id: String,
        from: String,
        to: String,
    },

    #[error("voter {voter_id} already voted on proposal {proposal_id} in the {phase} phase")]
    DuplicateVote {
        proposal_id: String,
        voter_id: String,
        phase: String,
    },

    #[error("no history entry for proposal {proposal_id}")]
    HistoryNotFound { proposal_id: String },

    #[error("history entry already exists for proposal {proposal_id}")]
    DuplicateHistory { proposal_id: String },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether this error reports a violated invariant rather than a backend fault.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidRunState { .. }
                | Self::StepOutOfOrder { .. }
                | Self::DuplicateProposal { .. }
                | Self::InvalidProposalTransition { .. }
                | Self::DuplicateVote { .. }
                | Self::DuplicateHistory { .. }
        )
    }
}
