//! Two-phase voting.
//!
//! Every proposal passes an automated-reviewer phase (`sentient_voting`)
//! resolved by quorum, then a human phase (`human_voting`) resolved by one
//! authoritative decision. Either phase can time out to `expired`.
//!
//! ```text
//! pending -> sentient_voting -> human_voting -> approved | vetoed
//!                 |                  |
//!                 +-> vetoed         +-> expired
//!                 +-> expired
//! ```

pub mod engine;
pub mod executor;
pub mod policy;
pub mod sweep;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warden_state::{ConsensusResultRecord, ProposalOrigin, ProposalStatus};

pub use engine::VotingEngine;
pub use executor::{
    spawn_auto_executor, CommandExecutor, ExecutionCollaborator, ExecutionReport, NoopExecutor,
};
pub use policy::{approval_rate, required_count, PhaseTally, VotingPolicy};
pub use sweep::spawn_expiration_sweeper;

/// Result of submitting one vote.
#[derive(Debug, Clone, PartialEq)]
pub enum VoteOutcome {
    /// The vote was recorded; the phase has not resolved yet.
    Open,
    /// The vote resolved the phase.
    Resolved(ConsensusResultRecord),
}

impl VoteOutcome {
    pub fn result(&self) -> Option<&ConsensusResultRecord> {
        match self {
            Self::Open => None,
            Self::Resolved(r) => Some(r),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// A proposal to add.
#[derive(Debug, Clone, PartialEq)]
pub struct NewProposal {
    pub title: String,
    pub description: String,
    pub origin: ProposalOrigin,
    pub category: String,
    pub diff: Option<String>,
}

impl NewProposal {
    pub fn manual(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            origin: ProposalOrigin::Manual,
            category: "manual".to_string(),
            diff: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_diff(mut self, diff: impl Into<String>) -> Self {
        self.diff = Some(diff.into());
        self
    }
}

/// Terminal status carried by a [`FinalizationEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalStatus {
    Approved,
    Vetoed,
    Expired,
}

impl FinalStatus {
    pub fn from_status(status: ProposalStatus) -> Option<Self> {
        match status {
            ProposalStatus::Approved => Some(Self::Approved),
            ProposalStatus::Vetoed => Some(Self::Vetoed),
            ProposalStatus::Expired => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn instructions(&self) -> &'static str {
        match self {
            Self::Approved => "Execute the proposed changes according to the approved code diff",
            Self::Vetoed => "Reject the proposed changes and maintain current system state",
            Self::Expired => "Voting window elapsed; maintain current system state",
        }
    }
}

/// Broadcast whenever a proposal reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizationEvent {
    pub proposal_id: Uuid,
    pub title: String,
    pub status: FinalStatus,
    pub instructions: String,
    pub diff: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate view over every proposal the engine has seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsensusStatistics {
    pub total_proposals: usize,
    pub open_proposals: usize,
    pub approved_proposals: usize,
    pub vetoed_proposals: usize,
    pub expired_proposals: usize,
    /// Approved share of resolved proposals.
    pub approval_rate: f64,
    /// Mean approval rate over resolved automated-review phases.
    pub average_automated_approval_rate: f64,
}
