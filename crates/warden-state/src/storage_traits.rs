//! Storage trait definitions for Warden
//!
//! These traits define the persistence abstractions behind the governance loop:
//! - `RunStore`: supervised training runs and their terminal transitions
//! - `StepStore`: the append-only, strictly ordered step log of each run
//! - `ProposalStore`: proposals and the votes cast on them
//! - `ConsensusLedger`: phase results and the durable consensus history
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Training runs
// ---------------------------------------------------------------------------

/// Status of a supervised training run.
///
/// A run transitions `Running → Completed | Failed` exactly once. A run
/// stopped by a caller is recorded as `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One supervised execution of the training worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRunRecord {
    pub run_id: Uuid,
    /// Agent that owns the run; at most one `Running` run per agent.
    pub agent_id: String,
    pub status: RunStatus,
    pub learning_rate: f64,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TrainingRunRecord {
    /// A fresh run in `Running` state.
    pub fn new(agent_id: impl Into<String>, learning_rate: f64) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            status: RunStatus::Running,
            learning_rate,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Filter for listing runs. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub agent_id: Option<String>,
    pub status: Option<RunStatus>,
}

impl RunFilter {
    /// Runs of `agent_id` that are still marked running.
    pub fn running_for(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            status: Some(RunStatus::Running),
        }
    }

    pub fn matches(&self, run: &TrainingRunRecord) -> bool {
        self.agent_id.as_ref().map_or(true, |a| *a == run.agent_id)
            && self.status.map_or(true, |s| s == run.status)
    }
}

/// Persistence for training runs.
///
/// Guarantees:
/// - `finish_run` only succeeds on a `Running` run; a second terminal
///   transition fails with `StorageError::InvalidRunState`.
/// - Terminal runs are never mutated again.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a new run record (normally in `Running` state).
    async fn create_run(&self, run: TrainingRunRecord) -> StorageResult<()>;

    /// Fetch a run by ID.
    async fn get_run(&self, run_id: Uuid) -> StorageResult<TrainingRunRecord>;

    /// Move a running run into a terminal status, stamping `finished_at`.
    async fn finish_run(&self, run_id: Uuid, status: RunStatus)
        -> StorageResult<TrainingRunRecord>;

    /// List runs matching the filter, oldest first.
    async fn list_runs(&self, filter: RunFilter) -> StorageResult<Vec<TrainingRunRecord>>;
}

// ---------------------------------------------------------------------------
// Training steps
// ---------------------------------------------------------------------------

/// Schema version of [`StepParams`]. Bump when the key layout changes.
pub const STEP_PARAMS_SCHEMA_VERSION: u32 = 1;

/// Versioned key-value snapshot of model parameters reported with a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepParams {
    pub schema_version: u32,
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
}

impl StepParams {
    pub fn new(values: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            schema_version: STEP_PARAMS_SCHEMA_VERSION,
            values,
        }
    }

    /// Numeric parameter lookup (e.g. `w`, `b`).
    pub fn number(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(serde_json::Value::as_f64)
    }
}

impl Default for StepParams {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

/// One reported measurement from a run. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingStepRecord {
    pub run_id: Uuid,
    /// Strictly increasing within a run.
    pub step: u64,
    pub loss: f64,
    pub elapsed_ms: u64,
    pub params: StepParams,
    pub recorded_at: DateTime<Utc>,
}

/// Durable ordered step log.
///
/// Guarantees:
/// - `append_step` rejects a step index that is not strictly greater than the
///   last stored index of the same run (`StorageError::StepOutOfOrder`).
/// - `latest_steps` returns the newest `limit` steps in ascending order.
/// - Writes to different runs never contend on a shared lock.
#[async_trait]
pub trait StepStore: Send + Sync {
    async fn append_step(&self, step: TrainingStepRecord) -> StorageResult<()>;

    async fn latest_steps(&self, run_id: Uuid, limit: usize)
        -> StorageResult<Vec<TrainingStepRecord>>;

    async fn count_steps(&self, run_id: Uuid) -> StorageResult<u64>;

    /// Most recently recorded step across all runs.
    async fn latest_step(&self) -> StorageResult<Option<TrainingStepRecord>>;
}

// ---------------------------------------------------------------------------
// Proposals and votes
// ---------------------------------------------------------------------------

/// Proposal state machine.
///
/// `Pending → SentientVoting → HumanVoting → Approved | Vetoed`, with
/// `Expired` reachable from either voting state and `Vetoed` reachable from
/// `SentientVoting`. `SentientVoting` is the automated-reviewer phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    SentientVoting,
    HumanVoting,
    Approved,
    Vetoed,
    Expired,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::SentientVoting => "sentient_voting",
            Self::HumanVoting => "human_voting",
            Self::Approved => "approved",
            Self::Vetoed => "vetoed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sentient_voting" => Some(Self::SentientVoting),
            "human_voting" => Some(Self::HumanVoting),
            "approved" => Some(Self::Approved),
            "vetoed" => Some(Self::Vetoed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Vetoed | Self::Expired)
    }

    /// The voting phase open in this status, if any.
    pub fn voting_phase(&self) -> Option<VotingPhase> {
        match self {
            Self::SentientVoting => Some(VotingPhase::AutomatedReview),
            Self::HumanVoting => Some(VotingPhase::Human),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::SentientVoting)
                | (Self::SentientVoting, Self::HumanVoting)
                | (Self::SentientVoting, Self::Vetoed)
                | (Self::SentientVoting, Self::Expired)
                | (Self::HumanVoting, Self::Approved)
                | (Self::HumanVoting, Self::Vetoed)
                | (Self::HumanVoting, Self::Expired)
        )
    }

    /// Whether a stored proposal in this status may be overwritten with one
    /// in `next`. Terminal proposals are immutable.
    pub fn can_update_to(&self, next: Self) -> bool {
        !self.is_terminal() && (*self == next || self.can_transition_to(next))
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a proposal exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProposalOrigin {
    /// Submitted by an external actor.
    Manual,
    /// Raised by the consensus evaluator for a training run.
    Automatic { run_id: Uuid },
}

impl ProposalOrigin {
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            Self::Manual => None,
            Self::Automatic { run_id } => Some(*run_id),
        }
    }

    pub fn is_automatic(&self) -> bool {
        matches!(self, Self::Automatic { .. })
    }
}

/// A candidate decision requiring consensus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub proposal_id: Uuid,
    pub title: String,
    pub description: String,
    pub status: ProposalStatus,
    pub origin: ProposalOrigin,
    /// Grouping key used by the evaluator guard (e.g. `lr-tuning`).
    pub category: String,
    /// Optional code or parameter diff handed to the execution collaborator.
    pub diff: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the current voting phase opened.
    pub phase_started_at: Option<DateTime<Utc>>,
}

impl ProposalRecord {
    /// A new `Pending` proposal.
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        origin: ProposalOrigin,
        category: impl Into<String>,
        diff: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            proposal_id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            status: ProposalStatus::Pending,
            origin,
            category: category.into(),
            diff,
            created_at: now,
            updated_at: now,
            phase_started_at: None,
        }
    }
}

/// Filter for listing proposals. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ProposalFilter {
    /// Match any of these statuses (empty = all).
    pub statuses: Vec<ProposalStatus>,
    pub origin_run: Option<Uuid>,
    pub category: Option<String>,
    pub automatic_only: bool,
}

impl ProposalFilter {
    pub fn with_statuses(statuses: impl IntoIterator<Item = ProposalStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn matches(&self, p: &ProposalRecord) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&p.status))
            && self.origin_run.map_or(true, |r| p.origin.run_id() == Some(r))
            && self.category.as_ref().map_or(true, |c| *c == p.category)
            && (!self.automatic_only || p.origin.is_automatic())
    }
}

/// The two voting phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingPhase {
    AutomatedReview,
    Human,
}

impl VotingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutomatedReview => "automated_review",
            Self::Human => "human",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "automated_review" => Some(Self::AutomatedReview),
            "human" => Some(Self::Human),
            _ => None,
        }
    }
}

impl std::fmt::Display for VotingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who cast a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoterRole {
    AutomatedReviewer,
    Human,
}

impl VoterRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutomatedReviewer => "automated_reviewer",
            Self::Human => "human",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "automated_reviewer" => Some(Self::AutomatedReviewer),
            "human" => Some(Self::Human),
            _ => None,
        }
    }

    pub fn phase(&self) -> VotingPhase {
        match self {
            Self::AutomatedReviewer => VotingPhase::AutomatedReview,
            Self::Human => VotingPhase::Human,
        }
    }
}

/// A single participant's decision on a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub proposal_id: Uuid,
    pub voter_id: String,
    pub role: VoterRole,
    pub approve: bool,
    pub rationale: Option<String>,
    pub cast_at: DateTime<Utc>,
}

impl VoteRecord {
    pub fn new(
        proposal_id: Uuid,
        voter_id: impl Into<String>,
        role: VoterRole,
        approve: bool,
        rationale: Option<String>,
    ) -> Self {
        Self {
            proposal_id,
            voter_id: voter_id.into(),
            role,
            approve,
            rationale,
            cast_at: Utc::now(),
        }
    }

    pub fn phase(&self) -> VotingPhase {
        self.role.phase()
    }
}

/// Persistence for proposals and their votes.
///
/// Guarantees:
/// - `insert_proposal` rejects an existing ID (`DuplicateProposal`).
/// - `append_vote` rejects a second vote by the same voter on the same
///   proposal in the same phase (`DuplicateVote`) and leaves the vote list
///   unchanged.
/// - `list_votes` returns votes in arrival order.
/// - `update_proposal` rejects a write to a terminal proposal, or one that
///   skips a state-machine edge, with `InvalidProposalTransition`. The check
///   and the write are atomic, so two writers racing on one proposal cannot
///   both move it.
#[async_trait]
pub trait ProposalStore: Send + Sync {
    async fn insert_proposal(&self, proposal: ProposalRecord) -> StorageResult<()>;

    async fn get_proposal(&self, proposal_id: Uuid) -> StorageResult<ProposalRecord>;

    /// Replace the stored proposal with `proposal` (matched by ID).
    ///
    /// Allowed when the stored status is not terminal and either equals
    /// `proposal.status` or has an edge to it.
    async fn update_proposal(&self, proposal: ProposalRecord) -> StorageResult<()>;

    /// Matching proposals, oldest first.
    async fn list_proposals(&self, filter: ProposalFilter) -> StorageResult<Vec<ProposalRecord>>;

    async fn append_vote(&self, vote: VoteRecord) -> StorageResult<()>;

    async fn list_votes(&self, proposal_id: Uuid, phase: VotingPhase)
        -> StorageResult<Vec<VoteRecord>>;
}

// ---------------------------------------------------------------------------
// Consensus results and history
// ---------------------------------------------------------------------------

/// Outcome tag of a resolved phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusOutcome {
    ReviewersApproved,
    ReviewersVetoed,
    HumanApproved,
    HumanVetoed,
    Expired,
}

impl ConsensusOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReviewersApproved => "reviewers_approved",
            Self::ReviewersVetoed => "reviewers_vetoed",
            Self::HumanApproved => "human_approved",
            Self::HumanVetoed => "human_vetoed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reviewers_approved" => Some(Self::ReviewersApproved),
            "reviewers_vetoed" => Some(Self::ReviewersVetoed),
            "human_approved" => Some(Self::HumanApproved),
            "human_vetoed" => Some(Self::HumanVetoed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Stable tag used in logs and evidence.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ReviewersApproved => "SENTIENCE:APPROVED",
            Self::ReviewersVetoed => "SENTIENCE:VETOED",
            Self::HumanApproved => "HUMAN:APPROVED",
            Self::HumanVetoed => "HUMAN:VETOED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn is_approval(&self) -> bool {
        matches!(self, Self::ReviewersApproved | Self::HumanApproved)
    }

    pub fn is_veto(&self) -> bool {
        matches!(self, Self::ReviewersVetoed | Self::HumanVetoed)
    }
}

/// Quorum and approval thresholds in force when a phase resolved.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSnapshot {
    pub total_reviewers: u32,
    pub quorum_threshold: f64,
    pub approval_threshold: f64,
    pub quorum_required: u32,
    pub approvals_required: u32,
}

/// Immutable outcome of resolving one voting phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResultRecord {
    pub result_id: Uuid,
    pub proposal_id: Uuid,
    pub phase: VotingPhase,
    pub outcome: ConsensusOutcome,
    /// Proposal status after the transition.
    pub resulting_status: ProposalStatus,
    pub decided_at: DateTime<Utc>,
    /// The votes of the resolved phase, in arrival order.
    pub votes: Vec<VoteRecord>,
    pub approval_rate: f64,
    pub quorum_reached: bool,
    pub thresholds: ThresholdSnapshot,
}

/// Result of carrying out an approved proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// Durable audit record of a resolved proposal.
///
/// Created once when the proposal reaches a terminal status; later
/// executions are appended to `executions`, never to a new entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusHistoryEntry {
    pub proposal_id: Uuid,
    pub title: String,
    pub final_status: ProposalStatus,
    pub outcome: ConsensusOutcome,
    pub resolved_at: DateTime<Utc>,
    pub results: Vec<ConsensusResultRecord>,
    #[serde(default)]
    pub executions: Vec<ExecutionRecord>,
}

/// Append-only ledger of phase results and consensus history.
///
/// Guarantees:
/// - Results are immutable once appended.
/// - At most one history entry exists per proposal (`DuplicateHistory`).
/// - `record_execution` appends to the existing entry
///   (`HistoryNotFound` if there is none).
#[async_trait]
pub trait ConsensusLedger: Send + Sync {
    async fn append_result(&self, result: ConsensusResultRecord) -> StorageResult<()>;

    /// Results of one proposal, in decision order.
    async fn list_results(&self, proposal_id: Uuid) -> StorageResult<Vec<ConsensusResultRecord>>;

    /// Every recorded result, in decision order.
    async fn all_results(&self) -> StorageResult<Vec<ConsensusResultRecord>>;

    async fn append_history(&self, entry: ConsensusHistoryEntry) -> StorageResult<()>;

    async fn record_execution(
        &self,
        proposal_id: Uuid,
        execution: ExecutionRecord,
    ) -> StorageResult<ConsensusHistoryEntry>;

    async fn get_history(&self, proposal_id: Uuid) -> StorageResult<Option<ConsensusHistoryEntry>>;

    /// All history entries, oldest first.
    async fn list_history(&self) -> StorageResult<Vec<ConsensusHistoryEntry>>;
}
