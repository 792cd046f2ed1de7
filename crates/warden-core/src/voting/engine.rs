use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{warn, Instrument};
use uuid::Uuid;
use warden_state::{
    ConsensusHistoryEntry, ConsensusLedger, ConsensusOutcome, ConsensusResultRecord,
    ExecutionRecord, ProposalFilter, ProposalRecord, ProposalStatus, ProposalStore,
    StorageError, VoteRecord, VoterRole, VotingPhase,
};

use super::executor::ExecutionCollaborator;
use super::policy::{approval_rate, VotingPolicy};
use super::{ConsensusStatistics, FinalStatus, FinalizationEvent, NewProposal, VoteOutcome};
use crate::domain::VotingError;
use crate::evidence::{append_best_effort, EvidenceKind, EvidenceSink};
use crate::locks::KeyedLocks;
use crate::obs;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Proposal state machine over the proposal store and consensus ledger.
///
/// Every mutation of a proposal runs under that proposal's lock, so votes on
/// one proposal apply in arrival order and each quorum check sees every vote
/// recorded before it. Unrelated proposals never contend.
pub struct VotingEngine {
    proposals: Arc<dyn ProposalStore>,
    ledger: Arc<dyn ConsensusLedger>,
    evidence: Arc<dyn EvidenceSink>,
    policy: VotingPolicy,
    locks: KeyedLocks<Uuid>,
    events: broadcast::Sender<FinalizationEvent>,
}

impl VotingEngine {
    pub fn new(
        proposals: Arc<dyn ProposalStore>,
        ledger: Arc<dyn ConsensusLedger>,
        evidence: Arc<dyn EvidenceSink>,
        policy: VotingPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            proposals,
            ledger,
            evidence,
            policy,
            locks: KeyedLocks::new(),
            events,
        }
    }

    /// Build over one backend that stores both proposals and the ledger.
    pub fn with_store<S>(store: Arc<S>, evidence: Arc<dyn EvidenceSink>, policy: VotingPolicy) -> Self
    where
        S: ProposalStore + ConsensusLedger + 'static,
    {
        Self::new(store.clone(), store, evidence, policy)
    }

    pub fn policy(&self) -> &VotingPolicy {
        &self.policy
    }

    /// Receive a [`FinalizationEvent`] for every proposal that reaches a
    /// terminal status after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<FinalizationEvent> {
        self.events.subscribe()
    }

    // -- proposals -----------------------------------------------------------

    pub async fn add_proposal(&self, draft: NewProposal) -> Result<ProposalRecord, VotingError> {
        self.add_proposal_at(draft, Utc::now()).await
    }

    /// Insert a proposal and open its automated-review phase at `now`.
    pub async fn add_proposal_at(
        &self,
        draft: NewProposal,
        now: DateTime<Utc>,
    ) -> Result<ProposalRecord, VotingError> {
        let mut proposal = ProposalRecord::new(
            draft.title,
            draft.description,
            draft.origin,
            draft.category,
            draft.diff,
        );
        proposal.created_at = now;
        proposal.updated_at = now;
        proposal.status = ProposalStatus::SentientVoting;
        proposal.phase_started_at = Some(now);

        let _guard = self.locks.lock(&proposal.proposal_id).await;
        self.proposals.insert_proposal(proposal.clone()).await?;

        let origin = match proposal.origin.run_id() {
            Some(run_id) => format!("automatic:{run_id}"),
            None => "manual".to_string(),
        };
        obs::emit_proposal_added(&proposal.proposal_id.to_string(), &proposal.title, &origin);
        Ok(proposal)
    }

    pub async fn get_proposal(&self, proposal_id: Uuid) -> Result<ProposalRecord, VotingError> {
        self.load(proposal_id).await
    }

    pub async fn list_proposals(
        &self,
        filter: ProposalFilter,
    ) -> Result<Vec<ProposalRecord>, VotingError> {
        Ok(self.proposals.list_proposals(filter).await?)
    }

    pub async fn votes(
        &self,
        proposal_id: Uuid,
        phase: VotingPhase,
    ) -> Result<Vec<VoteRecord>, VotingError> {
        Ok(self.proposals.list_votes(proposal_id, phase).await?)
    }

    /// Replace the description of a proposal still in automated review.
    pub async fn update_description(
        &self,
        proposal_id: Uuid,
        description: impl Into<String>,
    ) -> Result<ProposalRecord, VotingError> {
        let _guard = self.locks.lock(&proposal_id).await;
        let mut proposal = self.load(proposal_id).await?;
        if proposal.status != ProposalStatus::SentientVoting {
            return Err(VotingError::NotEditable {
                proposal_id,
                status: proposal.status,
            });
        }
        proposal.description = description.into();
        proposal.updated_at = Utc::now();
        self.proposals.update_proposal(proposal.clone()).await?;
        Ok(proposal)
    }

    // -- votes ---------------------------------------------------------------

    pub async fn submit_automated_vote(
        &self,
        proposal_id: Uuid,
        voter_id: &str,
        approve: bool,
        rationale: Option<String>,
    ) -> Result<VoteOutcome, VotingError> {
        self.submit_automated_vote_at(proposal_id, voter_id, approve, rationale, Utc::now())
            .await
    }

    /// Record an automated reviewer's vote and resolve the phase once quorum
    /// is reached.
    pub async fn submit_automated_vote_at(
        &self,
        proposal_id: Uuid,
        voter_id: &str,
        approve: bool,
        rationale: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<VoteOutcome, VotingError> {
        async move {
            let _guard = self.locks.lock(&proposal_id).await;
            let mut proposal = self.load(proposal_id).await?;
            if proposal.status != ProposalStatus::SentientVoting {
                return Err(VotingError::PhaseMismatch {
                    proposal_id,
                    status: proposal.status,
                    expected: VotingPhase::AutomatedReview,
                });
            }
            if !self.policy.is_reviewer(voter_id) {
                return Err(VotingError::UnknownReviewer {
                    voter_id: voter_id.to_string(),
                });
            }

            let mut vote = VoteRecord::new(
                proposal_id,
                voter_id,
                VoterRole::AutomatedReviewer,
                approve,
                rationale,
            );
            vote.cast_at = now;
            self.record_vote(&vote).await?;

            let votes = self
                .proposals
                .list_votes(proposal_id, VotingPhase::AutomatedReview)
                .await?;
            let tally = self.policy.tally(&votes);
            let Some(approved) = tally.approved else {
                return Ok(VoteOutcome::Open);
            };

            let (outcome, next) = if approved {
                (ConsensusOutcome::ReviewersApproved, ProposalStatus::HumanVoting)
            } else {
                (ConsensusOutcome::ReviewersVetoed, ProposalStatus::Vetoed)
            };
            let result = self
                .resolve(
                    &mut proposal,
                    VotingPhase::AutomatedReview,
                    outcome,
                    next,
                    votes,
                    tally.quorum_reached,
                    now,
                )
                .await?;
            Ok(VoteOutcome::Resolved(result))
        }
        .instrument(obs::proposal_span(&proposal_id.to_string()))
        .await
    }

    pub async fn submit_human_vote(
        &self,
        proposal_id: Uuid,
        voter_id: &str,
        approve: bool,
        rationale: Option<String>,
    ) -> Result<VoteOutcome, VotingError> {
        self.submit_human_vote_at(proposal_id, voter_id, approve, rationale, Utc::now())
            .await
    }

    /// Record the authoritative human decision. Always resolves.
    pub async fn submit_human_vote_at(
        &self,
        proposal_id: Uuid,
        voter_id: &str,
        approve: bool,
        rationale: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<VoteOutcome, VotingError> {
        async move {
            let _guard = self.locks.lock(&proposal_id).await;
            let mut proposal = self.load(proposal_id).await?;
            if proposal.status != ProposalStatus::HumanVoting {
                return Err(VotingError::PhaseMismatch {
                    proposal_id,
                    status: proposal.status,
                    expected: VotingPhase::Human,
                });
            }

            let mut vote =
                VoteRecord::new(proposal_id, voter_id, VoterRole::Human, approve, rationale);
            vote.cast_at = now;
            self.record_vote(&vote).await?;

            let (outcome, next) = if approve {
                (ConsensusOutcome::HumanApproved, ProposalStatus::Approved)
            } else {
                (ConsensusOutcome::HumanVetoed, ProposalStatus::Vetoed)
            };
            let result = self
                .resolve(
                    &mut proposal,
                    VotingPhase::Human,
                    outcome,
                    next,
                    vec![vote],
                    true,
                    now,
                )
                .await?;
            Ok(VoteOutcome::Resolved(result))
        }
        .instrument(obs::proposal_span(&proposal_id.to_string()))
        .await
    }

    // -- expiration ----------------------------------------------------------

    pub async fn sweep_expired(&self) -> Result<Vec<ConsensusResultRecord>, VotingError> {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Expire every proposal whose open phase has outlived its timeout as of
    /// `now`. A failure on one proposal is logged and does not stop the sweep.
    pub async fn sweep_expired_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConsensusResultRecord>, VotingError> {
        let open = self
            .proposals
            .list_proposals(ProposalFilter::with_statuses([
                ProposalStatus::SentientVoting,
                ProposalStatus::HumanVoting,
            ]))
            .await?;

        let mut expired = Vec::new();
        for candidate in open.iter().filter(|p| self.is_overdue(p, now)) {
            match self.expire_one(candidate.proposal_id, now).await {
                Ok(Some(result)) => expired.push(result),
                Ok(None) => {}
                Err(e) => warn!(
                    proposal_id = %candidate.proposal_id,
                    error = %e,
                    "failed to expire proposal"
                ),
            }
        }
        self.locks.prune();
        Ok(expired)
    }

    async fn expire_one(
        &self,
        proposal_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ConsensusResultRecord>, VotingError> {
        let _guard = self.locks.lock(&proposal_id).await;
        // Re-check under the lock: a vote may have resolved the phase meanwhile.
        let mut proposal = self.load(proposal_id).await?;
        let Some(phase) = proposal.status.voting_phase() else {
            return Ok(None);
        };
        if !self.is_overdue(&proposal, now) {
            return Ok(None);
        }

        let votes = self.proposals.list_votes(proposal_id, phase).await?;
        let quorum_reached = match phase {
            VotingPhase::AutomatedReview => self.policy.tally(&votes).quorum_reached,
            VotingPhase::Human => !votes.is_empty(),
        };
        let age = now - phase_start(&proposal);
        obs::emit_proposal_expired(&proposal_id.to_string(), phase.as_str(), age.num_seconds());

        let result = self
            .resolve(
                &mut proposal,
                phase,
                ConsensusOutcome::Expired,
                ProposalStatus::Expired,
                votes,
                quorum_reached,
                now,
            )
            .await?;
        Ok(Some(result))
    }

    fn is_overdue(&self, proposal: &ProposalRecord, now: DateTime<Utc>) -> bool {
        proposal
            .status
            .voting_phase()
            .is_some_and(|phase| now - phase_start(proposal) > self.policy.timeout_for(phase))
    }

    // -- execution -----------------------------------------------------------

    /// Carry out an approved proposal and append the outcome to its history
    /// entry. A failed execution is recorded, never reverts the proposal.
    pub async fn execute_approved(
        &self,
        proposal_id: Uuid,
        executor: &dyn ExecutionCollaborator,
    ) -> Result<ExecutionRecord, VotingError> {
        let _guard = self.locks.lock(&proposal_id).await;
        let proposal = self.load(proposal_id).await?;
        if proposal.status != ProposalStatus::Approved {
            return Err(VotingError::NotApproved {
                proposal_id,
                status: proposal.status,
            });
        }
        if self.ledger.get_history(proposal_id).await?.is_none() {
            return Err(VotingError::HistoryMissing(proposal_id));
        }

        let report = executor.execute(proposal_id, proposal.diff.as_deref()).await;
        let record = ExecutionRecord {
            success: report.success,
            output: report.output,
            error: report.error,
            executed_at: Utc::now(),
        };
        self.ledger
            .record_execution(proposal_id, record.clone())
            .await
            .map_err(|e| match e {
                StorageError::HistoryNotFound { .. } => VotingError::HistoryMissing(proposal_id),
                other => other.into(),
            })?;

        obs::emit_execution_recorded(&proposal_id.to_string(), record.success);
        append_best_effort(
            &self.evidence,
            EvidenceKind::Voting,
            &format!("execution-{proposal_id}"),
            json!({
                "event": "execution",
                "proposalId": proposal_id,
                "execution": record,
            }),
        )
        .await;
        Ok(record)
    }

    // -- history -------------------------------------------------------------

    pub async fn results(
        &self,
        proposal_id: Uuid,
    ) -> Result<Vec<ConsensusResultRecord>, VotingError> {
        Ok(self.ledger.list_results(proposal_id).await?)
    }

    /// Every phase result, in decision order.
    pub async fn all_results(&self) -> Result<Vec<ConsensusResultRecord>, VotingError> {
        Ok(self.ledger.all_results().await?)
    }

    pub async fn history(&self) -> Result<Vec<ConsensusHistoryEntry>, VotingError> {
        Ok(self.ledger.list_history().await?)
    }

    pub async fn history_entry(
        &self,
        proposal_id: Uuid,
    ) -> Result<Option<ConsensusHistoryEntry>, VotingError> {
        Ok(self.ledger.get_history(proposal_id).await?)
    }

    pub async fn statistics(&self) -> Result<ConsensusStatistics, VotingError> {
        let proposals = self.proposals.list_proposals(ProposalFilter::default()).await?;
        let results = self.ledger.all_results().await?;

        let count = |status: ProposalStatus| proposals.iter().filter(|p| p.status == status).count();
        let approved = count(ProposalStatus::Approved);
        let vetoed = count(ProposalStatus::Vetoed);
        let expired = count(ProposalStatus::Expired);
        let resolved = approved + vetoed + expired;

        let automated: Vec<f64> = results
            .iter()
            .filter(|r| {
                r.phase == VotingPhase::AutomatedReview && r.outcome != ConsensusOutcome::Expired
            })
            .map(|r| r.approval_rate)
            .collect();

        Ok(ConsensusStatistics {
            total_proposals: proposals.len(),
            open_proposals: proposals.len() - resolved,
            approved_proposals: approved,
            vetoed_proposals: vetoed,
            expired_proposals: expired,
            approval_rate: ratio(approved as f64, resolved as f64),
            average_automated_approval_rate: ratio(
                automated.iter().sum(),
                automated.len() as f64,
            ),
        })
    }

    // -- internals -----------------------------------------------------------

    async fn load(&self, proposal_id: Uuid) -> Result<ProposalRecord, VotingError> {
        self.proposals
            .get_proposal(proposal_id)
            .await
            .map_err(|e| match e {
                StorageError::ProposalNotFound { .. } => VotingError::ProposalNotFound(proposal_id),
                other => other.into(),
            })
    }

    async fn record_vote(&self, vote: &VoteRecord) -> Result<(), VotingError> {
        self.proposals
            .append_vote(vote.clone())
            .await
            .map_err(|e| match e {
                StorageError::DuplicateVote { .. } => VotingError::DuplicateVote {
                    proposal_id: vote.proposal_id,
                    voter_id: vote.voter_id.clone(),
                    phase: vote.phase(),
                },
                other => other.into(),
            })?;
        obs::emit_vote_recorded(
            &vote.proposal_id.to_string(),
            &vote.voter_id,
            vote.phase().as_str(),
            vote.approve,
        );
        Ok(())
    }

    /// Write the phase result, move the proposal to `next`, and finalize it
    /// when `next` is terminal. Caller holds the proposal lock.
    #[allow(clippy::too_many_arguments)]
    async fn resolve(
        &self,
        proposal: &mut ProposalRecord,
        phase: VotingPhase,
        outcome: ConsensusOutcome,
        next: ProposalStatus,
        votes: Vec<VoteRecord>,
        quorum_reached: bool,
        now: DateTime<Utc>,
    ) -> Result<ConsensusResultRecord, VotingError> {
        let result = ConsensusResultRecord {
            result_id: Uuid::new_v4(),
            proposal_id: proposal.proposal_id,
            phase,
            outcome,
            resulting_status: next,
            decided_at: now,
            approval_rate: approval_rate(&votes),
            votes,
            quorum_reached,
            thresholds: self.policy.thresholds(),
        };
        // The store admits one transition per edge, so only the writer that
        // moves the status goes on to record the result.
        let mut moved = proposal.clone();
        moved.status = next;
        moved.updated_at = now;
        if next == ProposalStatus::HumanVoting {
            moved.phase_started_at = Some(now);
        }
        self.proposals.update_proposal(moved.clone()).await?;
        *proposal = moved;
        self.ledger.append_result(result.clone()).await?;

        let pid = proposal.proposal_id.to_string();
        obs::emit_phase_resolved(&pid, outcome.tag(), result.approval_rate, result.votes.len());
        append_best_effort(
            &self.evidence,
            EvidenceKind::Voting,
            &format!("result-{pid}"),
            json!({
                "event": "phase_resolved",
                "proposalId": proposal.proposal_id,
                "outcome": outcome.tag(),
                "result": result,
            }),
        )
        .await;

        if next.is_terminal() {
            self.finalize(proposal, outcome, now).await?;
        }
        Ok(result)
    }

    async fn finalize(
        &self,
        proposal: &ProposalRecord,
        outcome: ConsensusOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), VotingError> {
        let results = self.ledger.list_results(proposal.proposal_id).await?;
        self.ledger
            .append_history(ConsensusHistoryEntry {
                proposal_id: proposal.proposal_id,
                title: proposal.title.clone(),
                final_status: proposal.status,
                outcome,
                resolved_at: now,
                results,
                executions: Vec::new(),
            })
            .await?;

        obs::emit_proposal_finalized(&proposal.proposal_id.to_string(), proposal.status.as_str());

        if let Some(status) = FinalStatus::from_status(proposal.status) {
            let event = FinalizationEvent {
                proposal_id: proposal.proposal_id,
                title: proposal.title.clone(),
                status,
                instructions: status.instructions().to_string(),
                diff: proposal.diff.clone(),
                timestamp: now,
            };
            if let Ok(record) = serde_json::to_value(&event) {
                append_best_effort(
                    &self.evidence,
                    EvidenceKind::Voting,
                    &format!("finalized-{}", proposal.proposal_id),
                    record,
                )
                .await;
            }
            // No subscribers is not an error.
            let _ = self.events.send(event);
        }
        Ok(())
    }
}

fn phase_start(proposal: &ProposalRecord) -> DateTime<Utc> {
    proposal.phase_started_at.unwrap_or(proposal.created_at)
}

fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::MemoryEvidence;
    use crate::voting::NoopExecutor;
    use warden_state::fakes::MemoryGovernanceStore;

    fn engine() -> (VotingEngine, Arc<MemoryEvidence>) {
        let evidence = Arc::new(MemoryEvidence::new());
        let engine = VotingEngine::with_store(
            Arc::new(MemoryGovernanceStore::new()),
            evidence.clone(),
            VotingPolicy::default(),
        );
        (engine, evidence)
    }

    #[tokio::test]
    async fn add_opens_automated_phase() {
        let (engine, _) = engine();
        let p = engine.add_proposal(NewProposal::manual("t", "d")).await.unwrap();
        assert_eq!(p.status, ProposalStatus::SentientVoting);
        assert!(p.phase_started_at.is_some());
        let stored = engine.get_proposal(p.proposal_id).await.unwrap();
        assert_eq!(stored.status, ProposalStatus::SentientVoting);
    }

    #[tokio::test]
    async fn human_phase_rejects_early_vote() {
        let (engine, _) = engine();
        let p = engine.add_proposal(NewProposal::manual("t", "d")).await.unwrap();
        let err = engine
            .submit_human_vote(p.proposal_id, "alice", true, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VotingError::PhaseMismatch { expected: VotingPhase::Human, .. }
        ));
    }

    #[tokio::test]
    async fn unknown_proposal() {
        let (engine, _) = engine();
        let id = Uuid::new_v4();
        let err = engine.submit_automated_vote(id, "r1", true, None).await.unwrap_err();
        assert!(matches!(err, VotingError::ProposalNotFound(p) if p == id));
    }

    #[tokio::test]
    async fn execute_requires_approval() {
        let (engine, _) = engine();
        let p = engine.add_proposal(NewProposal::manual("t", "d")).await.unwrap();
        let err = engine
            .execute_approved(p.proposal_id, &NoopExecutor)
            .await
            .unwrap_err();
        assert!(matches!(err, VotingError::NotApproved { .. }));
    }

    #[tokio::test]
    async fn resolution_writes_voting_evidence() {
        let (engine, evidence) = engine();
        let p = engine.add_proposal(NewProposal::manual("t", "d")).await.unwrap();
        engine.submit_automated_vote(p.proposal_id, "r1", false, None).await.unwrap();
        engine.submit_automated_vote(p.proposal_id, "r2", false, None).await.unwrap();

        let records = evidence.records(EvidenceKind::Voting);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["outcome"], "SENTIENCE:VETOED");
        assert_eq!(records[1]["status"], "VETOED");
        assert_eq!(
            records[1]["instructions"],
            "Reject the proposed changes and maintain current system state"
        );
    }
}
