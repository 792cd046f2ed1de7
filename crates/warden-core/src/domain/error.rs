//! Domain-level error taxonomy for Warden.

use uuid::Uuid;
use warden_state::{ProposalStatus, StorageError, VotingPhase};

use crate::config::ConfigError;
use crate::evidence::EvidenceError;

/// Protocol violations on the voting surface.
///
/// These are caller-correctable; the engine never retries them.
#[derive(Debug, thiserror::Error)]
pub enum VotingError {
    #[error("proposal not found: {0}")]
    ProposalNotFound(Uuid),

    #[error("proposal {proposal_id} is {status}, expected the {expected} phase")]
    PhaseMismatch {
        proposal_id: Uuid,
        status: ProposalStatus,
        expected: VotingPhase,
    },

    #[error("{voter_id} already voted on proposal {proposal_id} in the {phase} phase")]
    DuplicateVote {
        proposal_id: Uuid,
        voter_id: String,
        phase: VotingPhase,
    },

    #[error("{voter_id} is not in the automated reviewer pool")]
    UnknownReviewer { voter_id: String },

    #[error("proposal {proposal_id} is {status}, only approved proposals can be executed")]
    NotApproved {
        proposal_id: Uuid,
        status: ProposalStatus,
    },

    #[error("proposal {0} has no consensus history entry")]
    HistoryMissing(Uuid),

    #[error("proposal {proposal_id} is {status} and can no longer be edited")]
    NotEditable {
        proposal_id: Uuid,
        status: ProposalStatus,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Internal supervisor faults.
///
/// `start`/`stop` report these as `started: false` / `stopped: false` and a
/// log line; they only surface from lower-level helpers.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("worker command is empty")]
    EmptyCommand,

    #[error("failed to launch worker: {0}")]
    Launch(String),

    #[error("failed to signal pid {pid}: {reason}")]
    Signal { pid: i32, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Warden domain errors.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("voting error: {0}")]
    Voting(#[from] VotingError),

    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("evidence error: {0}")]
    Evidence(#[from] EvidenceError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Warden domain operations.
pub type Result<T> = std::result::Result<T, WardenError>;
