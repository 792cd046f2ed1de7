//! Quorum and approval arithmetic.
//!
//! Both thresholds are measured against the fixed `total_reviewers`, never
//! against the number of votes cast: a reviewer who never votes still counts
//! in the denominator.

use chrono::Duration;
use warden_state::{ThresholdSnapshot, VoteRecord, VotingPhase};

use crate::config::VotingConfig;

/// Smallest vote count `n` (at least 1) such that `n / total` reaches
/// `threshold`, compared at whole-percent precision.
///
/// Whole-percent comparison makes `0.67` and `2/3` agree: with three
/// reviewers both require two votes.
pub fn required_count(total: u32, threshold: f64) -> u32 {
    if total == 0 {
        return 0;
    }
    let target = (threshold * 100.0).round() as i64;
    (1..=total)
        .find(|n| ((*n as f64) * 100.0 / total as f64).round() as i64 >= target)
        .unwrap_or(total)
}

/// Share of approving votes in `votes`; `0.0` for an empty slice.
pub fn approval_rate(votes: &[VoteRecord]) -> f64 {
    if votes.is_empty() {
        return 0.0;
    }
    votes.iter().filter(|v| v.approve).count() as f64 / votes.len() as f64
}

/// Snapshot of one phase's votes against the policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseTally {
    pub votes_cast: u32,
    pub approvals: u32,
    pub quorum_reached: bool,
    /// `Some` once quorum is reached.
    pub approved: Option<bool>,
    pub approval_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VotingPolicy {
    pub total_reviewers: u32,
    pub quorum_threshold: f64,
    pub approval_threshold: f64,
    /// Empty accepts any automated reviewer id.
    pub reviewer_pool: Vec<String>,
    pub reviewer_timeout: Duration,
    pub human_timeout: Duration,
}

impl Default for VotingPolicy {
    fn default() -> Self {
        Self::from_config(&VotingConfig::default())
    }
}

impl VotingPolicy {
    pub fn from_config(config: &VotingConfig) -> Self {
        Self {
            total_reviewers: config.total_reviewers,
            quorum_threshold: config.quorum_threshold,
            approval_threshold: config.approval_threshold,
            reviewer_pool: config.reviewer_pool.clone(),
            reviewer_timeout: config.reviewer_timeout(),
            human_timeout: config.human_timeout(),
        }
    }

    pub fn quorum_required(&self) -> u32 {
        required_count(self.total_reviewers, self.quorum_threshold)
    }

    pub fn approvals_required(&self) -> u32 {
        required_count(self.total_reviewers, self.approval_threshold)
    }

    pub fn thresholds(&self) -> ThresholdSnapshot {
        ThresholdSnapshot {
            total_reviewers: self.total_reviewers,
            quorum_threshold: self.quorum_threshold,
            approval_threshold: self.approval_threshold,
            quorum_required: self.quorum_required(),
            approvals_required: self.approvals_required(),
        }
    }

    pub fn is_reviewer(&self, voter_id: &str) -> bool {
        self.reviewer_pool.is_empty() || self.reviewer_pool.iter().any(|r| r == voter_id)
    }

    pub fn timeout_for(&self, phase: VotingPhase) -> Duration {
        match phase {
            VotingPhase::AutomatedReview => self.reviewer_timeout,
            VotingPhase::Human => self.human_timeout,
        }
    }

    /// Tally automated-phase votes.
    pub fn tally(&self, votes: &[VoteRecord]) -> PhaseTally {
        let votes_cast = votes.len() as u32;
        let approvals = votes.iter().filter(|v| v.approve).count() as u32;
        let quorum_reached = votes_cast >= self.quorum_required();
        PhaseTally {
            votes_cast,
            approvals,
            quorum_reached,
            approved: quorum_reached.then(|| approvals >= self.approvals_required()),
            approval_rate: approval_rate(votes),
        }
    }
}
