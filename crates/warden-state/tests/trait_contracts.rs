//! Trait contract tests for RunStore, StepStore, ProposalStore, and ConsensusLedger.
//!
//! Each contract is written once against the traits and run against both the
//! in-memory fake and the SurrealDB backend (in `mem://` mode). Any conforming
//! implementation must pass these.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;
use warden_state::fakes::MemoryGovernanceStore;
use warden_state::storage_traits::*;
use warden_state::{StorageError, SurrealGovernanceStore};

trait GovernanceBackend: RunStore + StepStore + ProposalStore + ConsensusLedger {}
impl<T: RunStore + StepStore + ProposalStore + ConsensusLedger> GovernanceBackend for T {}

fn step(run_id: Uuid, idx: u64, loss: f64) -> TrainingStepRecord {
    let mut values = BTreeMap::new();
    values.insert("w".to_string(), serde_json::json!(0.25 * idx as f64));
    TrainingStepRecord {
        run_id,
        step: idx,
        loss,
        elapsed_ms: 100 * idx,
        params: StepParams::new(values),
        recorded_at: Utc::now(),
    }
}

fn proposal(origin: ProposalOrigin) -> ProposalRecord {
    let mut p = ProposalRecord::new("Tune LR", "Lower the learning rate", origin, "lr-tuning", None);
    p.status = ProposalStatus::SentientVoting;
    p.phase_started_at = Some(p.created_at);
    p
}

fn thresholds() -> ThresholdSnapshot {
    ThresholdSnapshot {
        total_reviewers: 3,
        quorum_threshold: 0.67,
        approval_threshold: 0.67,
        quorum_required: 2,
        approvals_required: 2,
    }
}

fn result(proposal_id: Uuid, votes: Vec<VoteRecord>, offset_secs: i64) -> ConsensusResultRecord {
    ConsensusResultRecord {
        result_id: Uuid::new_v4(),
        proposal_id,
        phase: VotingPhase::AutomatedReview,
        outcome: ConsensusOutcome::ReviewersApproved,
        resulting_status: ProposalStatus::HumanVoting,
        decided_at: Utc::now() + Duration::seconds(offset_secs),
        votes,
        approval_rate: 1.0,
        quorum_reached: true,
        thresholds: thresholds(),
    }
}

fn history(proposal_id: Uuid, results: Vec<ConsensusResultRecord>) -> ConsensusHistoryEntry {
    ConsensusHistoryEntry {
        proposal_id,
        title: "Tune LR".into(),
        final_status: ProposalStatus::Approved,
        outcome: ConsensusOutcome::HumanApproved,
        resolved_at: Utc::now(),
        results,
        executions: Vec::new(),
    }
}

// ===========================================================================
// Contracts
// ===========================================================================

async fn run_lifecycle(store: Arc<dyn GovernanceBackend>) {
    let run = TrainingRunRecord::new("synth-1", 0.01);
    let run_id = run.run_id;
    store.create_run(run).await.unwrap();

    let fetched = store.get_run(run_id).await.unwrap();
    assert_eq!(fetched.status, RunStatus::Running);
    assert!(fetched.finished_at.is_none());

    let finished = store.finish_run(run_id, RunStatus::Completed).await.unwrap();
    assert_eq!(finished.status, RunStatus::Completed);
    assert!(finished.finished_at.is_some());

    // A second terminal transition is rejected and leaves the run untouched.
    let err = store.finish_run(run_id, RunStatus::Failed).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));
    assert_eq!(
        store.get_run(run_id).await.unwrap().status,
        RunStatus::Completed
    );

    let err = store.get_run(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, StorageError::RunNotFound { .. }));
}

async fn run_listing(store: Arc<dyn GovernanceBackend>) {
    let a = TrainingRunRecord::new("synth-1", 0.01);
    let b = TrainingRunRecord::new("synth-1", 0.008);
    let c = TrainingRunRecord::new("synth-2", 0.01);
    let (a_id, b_id) = (a.run_id, b.run_id);
    for run in [a, b, c] {
        store.create_run(run).await.unwrap();
    }
    store.finish_run(a_id, RunStatus::Failed).await.unwrap();

    let running = store
        .list_runs(RunFilter::running_for("synth-1"))
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].run_id, b_id);

    let all = store.list_runs(RunFilter::default()).await.unwrap();
    assert_eq!(all.len(), 3);
}

async fn step_ordering(store: Arc<dyn GovernanceBackend>) {
    let run_id = Uuid::new_v4();
    for idx in 1..=4 {
        store.append_step(step(run_id, idx, 1.0 / idx as f64)).await.unwrap();
    }

    let err = store.append_step(step(run_id, 4, 0.1)).await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::StepOutOfOrder { step: 4, last: 4, .. }
    ));
    let err = store.append_step(step(run_id, 2, 0.1)).await.unwrap_err();
    assert!(matches!(err, StorageError::StepOutOfOrder { .. }));

    assert_eq!(store.count_steps(run_id).await.unwrap(), 4);

    let latest = store.latest_steps(run_id, 3).await.unwrap();
    let indices: Vec<u64> = latest.iter().map(|s| s.step).collect();
    assert_eq!(indices, vec![2, 3, 4]);
    assert_eq!(latest[0].params.number("w"), Some(0.5));
    assert_eq!(latest[0].params.schema_version, STEP_PARAMS_SCHEMA_VERSION);

    // Other runs keep their own ordering.
    let other = Uuid::new_v4();
    store.append_step(step(other, 1, 2.0)).await.unwrap();
    assert_eq!(store.count_steps(other).await.unwrap(), 1);
    assert!(store.latest_steps(Uuid::new_v4(), 5).await.unwrap().is_empty());

    let newest = store.latest_step().await.unwrap().unwrap();
    assert_eq!(newest.run_id, other);
}

async fn proposal_round_trip(store: Arc<dyn GovernanceBackend>) {
    let run_id = Uuid::new_v4();
    let auto = proposal(ProposalOrigin::Automatic { run_id });
    let manual = proposal(ProposalOrigin::Manual);
    let auto_id = auto.proposal_id;

    store.insert_proposal(auto.clone()).await.unwrap();
    store.insert_proposal(manual).await.unwrap();

    let err = store.insert_proposal(auto.clone()).await.unwrap_err();
    assert!(matches!(err, StorageError::DuplicateProposal { .. }));

    let mut updated = store.get_proposal(auto_id).await.unwrap();
    assert_eq!(updated.origin, ProposalOrigin::Automatic { run_id });
    updated.status = ProposalStatus::HumanVoting;
    updated.description = "Refreshed analysis".into();
    store.update_proposal(updated).await.unwrap();

    let fetched = store.get_proposal(auto_id).await.unwrap();
    assert_eq!(fetched.status, ProposalStatus::HumanVoting);
    assert_eq!(fetched.description, "Refreshed analysis");

    let by_run = store
        .list_proposals(ProposalFilter {
            origin_run: Some(run_id),
            ..ProposalFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(by_run.len(), 1);

    let voting = store
        .list_proposals(ProposalFilter::with_statuses([ProposalStatus::SentientVoting]))
        .await
        .unwrap();
    assert_eq!(voting.len(), 1);
    assert_eq!(voting[0].origin, ProposalOrigin::Manual);

    let err = store.get_proposal(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, StorageError::ProposalNotFound { .. }));
}

async fn proposal_transitions(store: Arc<dyn GovernanceBackend>) {
    let p = proposal(ProposalOrigin::Manual);
    let id = p.proposal_id;
    store.insert_proposal(p).await.unwrap();

    // Automated review cannot jump straight to approval.
    let mut skipped = store.get_proposal(id).await.unwrap();
    skipped.status = ProposalStatus::Approved;
    let err = store.update_proposal(skipped).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidProposalTransition { .. }));
    assert!(err.is_constraint_violation());

    let mut vetoed = store.get_proposal(id).await.unwrap();
    vetoed.status = ProposalStatus::Vetoed;
    store.update_proposal(vetoed.clone()).await.unwrap();

    // Terminal proposals reject every write, including same-status edits.
    vetoed.description = "rewritten after the fact".into();
    let err = store.update_proposal(vetoed.clone()).await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::InvalidProposalTransition { ref from, .. } if from == "vetoed"
    ));
    vetoed.status = ProposalStatus::HumanVoting;
    assert!(store.update_proposal(vetoed).await.is_err());

    let stored = store.get_proposal(id).await.unwrap();
    assert_eq!(stored.status, ProposalStatus::Vetoed);
    assert_eq!(stored.description, "Lower the learning rate");
}

async fn vote_uniqueness(store: Arc<dyn GovernanceBackend>) {
    let p = proposal(ProposalOrigin::Manual);
    let pid = p.proposal_id;
    store.insert_proposal(p).await.unwrap();

    let first = VoteRecord::new(pid, "reviewer-a", VoterRole::AutomatedReviewer, true, None);
    store.append_vote(first).await.unwrap();
    store
        .append_vote(VoteRecord::new(
            pid,
            "reviewer-b",
            VoterRole::AutomatedReviewer,
            false,
            Some("loss plateaued".into()),
        ))
        .await
        .unwrap();

    let dup = VoteRecord::new(pid, "reviewer-a", VoterRole::AutomatedReviewer, false, None);
    let err = store.append_vote(dup).await.unwrap_err();
    assert!(matches!(err, StorageError::DuplicateVote { .. }));

    // Same voter in the other phase is a different vote.
    store
        .append_vote(VoteRecord::new(pid, "reviewer-a", VoterRole::Human, true, None))
        .await
        .unwrap();

    let automated = store
        .list_votes(pid, VotingPhase::AutomatedReview)
        .await
        .unwrap();
    let voters: Vec<&str> = automated.iter().map(|v| v.voter_id.as_str()).collect();
    assert_eq!(voters, vec!["reviewer-a", "reviewer-b"]);
    assert!(automated[0].approve);
    assert_eq!(automated[1].rationale.as_deref(), Some("loss plateaued"));

    let human = store.list_votes(pid, VotingPhase::Human).await.unwrap();
    assert_eq!(human.len(), 1);

    let orphan = VoteRecord::new(Uuid::new_v4(), "x", VoterRole::Human, true, None);
    let err = store.append_vote(orphan).await.unwrap_err();
    assert!(matches!(err, StorageError::ProposalNotFound { .. }));
}

async fn ledger_history(store: Arc<dyn GovernanceBackend>) {
    let pid = Uuid::new_v4();
    let vote = VoteRecord::new(pid, "reviewer-a", VoterRole::AutomatedReviewer, true, None);
    let first = result(pid, vec![vote], 0);
    let mut second = result(pid, Vec::new(), 5);
    second.phase = VotingPhase::Human;
    second.outcome = ConsensusOutcome::HumanApproved;
    second.resulting_status = ProposalStatus::Approved;

    store.append_result(first.clone()).await.unwrap();
    store.append_result(second.clone()).await.unwrap();
    store.append_result(result(Uuid::new_v4(), Vec::new(), 10)).await.unwrap();

    let results = store.list_results(pid).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].result_id, first.result_id);
    assert_eq!(results[0].votes.len(), 1);
    assert_eq!(results[0].thresholds, thresholds());
    assert_eq!(results[1].outcome, ConsensusOutcome::HumanApproved);
    assert_eq!(store.all_results().await.unwrap().len(), 3);

    assert!(store.get_history(pid).await.unwrap().is_none());
    let err = store
        .record_execution(
            pid,
            ExecutionRecord {
                success: true,
                output: None,
                error: None,
                executed_at: Utc::now(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::HistoryNotFound { .. }));

    store.append_history(history(pid, results)).await.unwrap();
    let err = store.append_history(history(pid, Vec::new())).await.unwrap_err();
    assert!(matches!(err, StorageError::DuplicateHistory { .. }));

    let entry = store
        .record_execution(
            pid,
            ExecutionRecord {
                success: false,
                output: Some("applying diff".into()),
                error: Some("exit status 1".into()),
                executed_at: Utc::now(),
            },
        )
        .await
        .unwrap();
    assert_eq!(entry.executions.len(), 1);

    let stored = store.get_history(pid).await.unwrap().unwrap();
    assert_eq!(stored.results.len(), 2);
    assert_eq!(stored.executions.len(), 1);
    assert!(!stored.executions[0].success);
    assert_eq!(store.list_history().await.unwrap().len(), 1);
}

// ===========================================================================
// Backends
// ===========================================================================

macro_rules! contract_suite {
    ($module:ident, $make:expr) => {
        mod $module {
            use super::*;

            async fn store() -> Arc<dyn GovernanceBackend> {
                $make
            }

            #[tokio::test]
            async fn run_lifecycle_is_single_terminal_transition() {
                run_lifecycle(store().await).await;
            }

            #[tokio::test]
            async fn run_listing_filters_by_agent_and_status() {
                run_listing(store().await).await;
            }

            #[tokio::test]
            async fn steps_are_strictly_ordered_per_run() {
                step_ordering(store().await).await;
            }

            #[tokio::test]
            async fn proposals_round_trip_and_filter() {
                proposal_round_trip(store().await).await;
            }

            #[tokio::test]
            async fn terminal_proposals_are_immutable() {
                proposal_transitions(store().await).await;
            }

            #[tokio::test]
            async fn votes_are_unique_per_voter_and_phase() {
                vote_uniqueness(store().await).await;
            }

            #[tokio::test]
            async fn ledger_keeps_results_and_single_history_entry() {
                ledger_history(store().await).await;
            }
        }
    };
}

contract_suite!(memory, Arc::new(MemoryGovernanceStore::new()));
contract_suite!(
    surreal,
    Arc::new(
        SurrealGovernanceStore::in_memory()
            .await
            .expect("in_memory() failed")
    )
);

// ===========================================================================
// Concurrency
// ===========================================================================

#[tokio::test]
async fn concurrent_duplicate_votes_admit_exactly_one() {
    let store = Arc::new(MemoryGovernanceStore::new());
    let p = proposal(ProposalOrigin::Manual);
    let pid = p.proposal_id;
    store.insert_proposal(p).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .append_vote(VoteRecord::new(
                    pid,
                    "reviewer-a",
                    VoterRole::AutomatedReviewer,
                    true,
                    None,
                ))
                .await
        }));
    }

    let mut ok = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            ok += 1;
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(
        store
            .list_votes(pid, VotingPhase::AutomatedReview)
            .await
            .unwrap()
            .len(),
        1
    );
}
