//! Integration tests for the consensus evaluator.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use warden_core::config::{EvaluatorConfig, GuardScope};
use warden_core::{
    spawn_evaluation_worker, spawn_human_veto_listener, ConsensusEvaluator, Decision, EvaluationOutcome, EvaluationRequest,
    EvidenceKind, MemoryEvidence, NewProposal, ProposalAction, StartOutcome, TrainingControl,
    VoteOutcome, VotingEngine, VotingPolicy,
};
use warden_state::fakes::MemoryGovernanceStore;
use warden_state::{
    ProposalFilter, ProposalOrigin, ProposalStatus, RunStatus, RunStore, StepParams, StepStore,
    TrainingRunRecord, TrainingStepRecord, VotingPhase,
};

const APPROVING: [f64; 5] = [1.0, 0.9, 0.85, 0.82, 0.78];
const FLAT: [f64; 5] = [1.0, 0.98, 0.97, 0.96, 0.95];
// 15% improvement: vetoed but above the retrain threshold.
const MEDIOCRE: [f64; 5] = [1.0, 0.95, 0.92, 0.88, 0.85];

#[derive(Default)]
struct RecordingControl {
    current: Mutex<Option<Uuid>>,
    restarts: Mutex<Vec<f64>>,
}

#[async_trait]
impl TrainingControl for RecordingControl {
    async fn current_run(&self) -> Option<Uuid> {
        *self.current.lock().unwrap()
    }

    async fn restart(&self, replacing: Uuid, learning_rate: f64) -> Option<StartOutcome> {
        let mut current = self.current.lock().unwrap();
        if current.is_some_and(|owned| owned != replacing) {
            return None;
        }
        self.restarts.lock().unwrap().push(learning_rate);
        let next = Uuid::new_v4();
        *current = Some(next);
        Some(StartOutcome {
            started: true,
            run_id: Some(next),
        })
    }
}

struct Harness {
    store: Arc<MemoryGovernanceStore>,
    voting: Arc<VotingEngine>,
    evidence: Arc<MemoryEvidence>,
    control: Arc<RecordingControl>,
    evaluator: Arc<ConsensusEvaluator>,
}

fn harness_with(config: EvaluatorConfig) -> Harness {
    let store = Arc::new(MemoryGovernanceStore::new());
    let evidence = Arc::new(MemoryEvidence::new());
    let voting = Arc::new(VotingEngine::with_store(
        store.clone(),
        evidence.clone(),
        VotingPolicy::default(),
    ));
    let control = Arc::new(RecordingControl::default());
    let evaluator = Arc::new(ConsensusEvaluator::new(
        config,
        store.clone(),
        store.clone(),
        voting.clone(),
        evidence.clone(),
        control.clone(),
    ));
    Harness {
        store,
        voting,
        evidence,
        control,
        evaluator,
    }
}

fn harness() -> Harness {
    harness_with(EvaluatorConfig::default())
}

impl Harness {
    /// A running run that the control reports as current.
    async fn run(&self) -> Uuid {
        let run = TrainingRunRecord::new("synth-1", 0.01);
        let run_id = run.run_id;
        self.store.create_run(run).await.unwrap();
        *self.control.current.lock().unwrap() = Some(run_id);
        run_id
    }

    async fn steps(&self, run_id: Uuid, first_step: u64, losses: &[f64]) {
        for (i, loss) in losses.iter().enumerate() {
            self.store
                .append_step(TrainingStepRecord {
                    run_id,
                    step: first_step + i as u64,
                    loss: *loss,
                    elapsed_ms: 100,
                    params: StepParams::default(),
                    recorded_at: Utc::now(),
                })
                .await
                .unwrap();
        }
    }
}

#[tokio::test]
async fn fewer_steps_than_window_is_a_noop() {
    let h = harness();
    let run_id = h.run().await;
    h.steps(run_id, 1, &APPROVING[..4]).await;

    let outcome = h.evaluator.evaluate(run_id).await.unwrap();
    assert_eq!(outcome, EvaluationOutcome::InsufficientSteps { have: 4, need: 5 });
    assert!(h.voting.list_proposals(ProposalFilter::default()).await.unwrap().is_empty());
    assert!(h.evidence.is_empty());
}

#[tokio::test]
async fn improving_window_creates_proposal_with_approving_vote() {
    let h = harness();
    let run_id = h.run().await;
    h.steps(run_id, 1, &APPROVING).await;

    let outcome = h.evaluator.evaluate(run_id).await.unwrap();
    let EvaluationOutcome::Evaluated {
        analysis,
        proposal,
        vote,
        retrain,
    } = outcome
    else {
        panic!("expected an evaluation, got {outcome:?}");
    };
    assert_eq!(analysis.decision, Decision::Approve);
    assert!((analysis.improvement - 0.22).abs() < 1e-9);
    assert!(matches!(proposal, ProposalAction::Created(_)));
    assert_eq!(vote, Some(VoteOutcome::Open));
    assert!(retrain.is_none());

    let p = h.voting.get_proposal(proposal.proposal_id()).await.unwrap();
    assert_eq!(p.status, ProposalStatus::SentientVoting);
    assert_eq!(p.origin, ProposalOrigin::Automatic { run_id });
    assert!(p.title.starts_with("Auto: Tune LR (run "));
    assert!(p.description.contains("**Improvement:** 22.00%"));

    let votes = h
        .voting
        .votes(p.proposal_id, VotingPhase::AutomatedReview)
        .await
        .unwrap();
    assert_eq!(votes.len(), 1);
    assert_eq!(votes[0].voter_id, "synth-1");
    assert!(votes[0].approve);

    let consensus = h.evidence.records(EvidenceKind::Consensus);
    assert_eq!(consensus.len(), 1);
    assert_eq!(consensus[0]["decision"], "approve");
    assert_eq!(consensus[0]["stepsAnalyzed"], 5);
    assert_eq!(consensus[0]["steps"].as_array().unwrap().len(), 5);
    assert!(h.control.restarts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn flat_window_vetoes_and_retrains() {
    let h = harness();
    let run_id = h.run().await;
    h.steps(run_id, 1, &FLAT).await;

    let outcome = h.evaluator.evaluate(run_id).await.unwrap();
    let EvaluationOutcome::Evaluated {
        analysis, retrain, ..
    } = outcome
    else {
        panic!("expected an evaluation");
    };
    assert_eq!(analysis.decision, Decision::Veto);

    let directive = retrain.expect("retrain directive");
    assert_eq!(directive.old_learning_rate, 0.01);
    assert_eq!(directive.new_learning_rate, 0.008);
    assert!(directive.restart.unwrap().started);
    assert_eq!(*h.control.restarts.lock().unwrap(), vec![0.008]);

    let directives = h.evidence.records(EvidenceKind::Directive);
    assert_eq!(directives.len(), 1);
    assert_eq!(directives[0]["newLearningRate"], 0.008);
}

#[tokio::test]
async fn mediocre_window_vetoes_without_retrain() {
    let h = harness();
    let run_id = h.run().await;
    h.steps(run_id, 1, &MEDIOCRE).await;

    let EvaluationOutcome::Evaluated {
        analysis, retrain, ..
    } = h.evaluator.evaluate(run_id).await.unwrap()
    else {
        panic!("expected an evaluation");
    };
    assert_eq!(analysis.decision, Decision::Veto);
    assert!(retrain.is_none());
    assert!(h.control.restarts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn later_window_updates_the_open_proposal_without_revoting() {
    let h = harness();
    let run_id = h.run().await;
    h.steps(run_id, 1, &APPROVING).await;
    let first = h.evaluator.evaluate(run_id).await.unwrap();

    h.steps(run_id, 6, &[0.7]).await;
    let second = h.evaluator.evaluate(run_id).await.unwrap();

    let (
        EvaluationOutcome::Evaluated { proposal: a, .. },
        EvaluationOutcome::Evaluated { proposal: b, vote, .. },
    ) = (first, second)
    else {
        panic!("expected two evaluations");
    };
    assert!(matches!(b, ProposalAction::Updated(id) if id == a.proposal_id()));
    assert_eq!(vote, None);

    let proposals = h.voting.list_proposals(ProposalFilter::default()).await.unwrap();
    assert_eq!(proposals.len(), 1);
    assert!(proposals[0].description.contains("**Final Loss:** 0.700000"));
    let votes = h
        .voting
        .votes(a.proposal_id(), VotingPhase::AutomatedReview)
        .await
        .unwrap();
    assert_eq!(votes.len(), 1);
}

#[tokio::test]
async fn resolved_proposal_is_left_alone() {
    let h = harness();
    let run_id = h.run().await;
    h.steps(run_id, 1, &MEDIOCRE).await;
    let EvaluationOutcome::Evaluated { proposal, .. } = h.evaluator.evaluate(run_id).await.unwrap()
    else {
        panic!("expected an evaluation");
    };
    let id = proposal.proposal_id();
    h.voting.submit_automated_vote(id, "synth-2", false, None).await.unwrap();
    assert_eq!(h.voting.get_proposal(id).await.unwrap().status, ProposalStatus::Vetoed);

    h.steps(run_id, 6, &[0.84]).await;
    let EvaluationOutcome::Evaluated { proposal, vote, .. } =
        h.evaluator.evaluate(run_id).await.unwrap()
    else {
        panic!("expected an evaluation");
    };
    assert_eq!(
        proposal,
        ProposalAction::Unchanged {
            proposal_id: id,
            status: ProposalStatus::Vetoed
        }
    );
    assert!(vote.is_none());
}

async fn park_in_human_review(h: &Harness, run_id: Uuid) -> Uuid {
    let p = h
        .voting
        .add_proposal(NewProposal {
            title: "Auto: Tune LR".into(),
            description: "waiting on a human".into(),
            origin: ProposalOrigin::Automatic { run_id },
            category: "lr-tuning".into(),
            diff: None,
        })
        .await
        .unwrap();
    h.voting.submit_automated_vote(p.proposal_id, "synth-2", true, None).await.unwrap();
    h.voting.submit_automated_vote(p.proposal_id, "synth-3", true, None).await.unwrap();
    p.proposal_id
}

#[tokio::test]
async fn pending_human_review_blocks_evaluation_in_category_scope() {
    let h = harness();
    let pending = park_in_human_review(&h, Uuid::new_v4()).await;

    let run_id = h.run().await;
    h.steps(run_id, 1, &FLAT).await;
    let outcome = h.evaluator.evaluate(run_id).await.unwrap();
    assert_eq!(
        outcome,
        EvaluationOutcome::HumanReviewPending {
            proposal_id: pending
        }
    );
    assert!(h.evidence.records(EvidenceKind::Consensus).is_empty());
    assert!(h.control.restarts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn run_scope_only_blocks_the_same_run() {
    let h = harness_with(EvaluatorConfig {
        guard_scope: GuardScope::Run,
        ..EvaluatorConfig::default()
    });
    park_in_human_review(&h, Uuid::new_v4()).await;

    let run_id = h.run().await;
    h.steps(run_id, 1, &APPROVING).await;
    assert!(matches!(
        h.evaluator.evaluate(run_id).await.unwrap(),
        EvaluationOutcome::Evaluated { .. }
    ));

    park_in_human_review(&h, run_id).await;
    assert!(matches!(
        h.evaluator.evaluate(run_id).await.unwrap(),
        EvaluationOutcome::HumanReviewPending { .. }
    ));
}

#[tokio::test]
async fn finished_run_is_not_evaluated() {
    let h = harness();
    let run_id = h.run().await;
    h.steps(run_id, 1, &FLAT).await;
    h.store.finish_run(run_id, RunStatus::Completed).await.unwrap();

    assert_eq!(
        h.evaluator.evaluate(run_id).await.unwrap(),
        EvaluationOutcome::RunNotRunning {
            status: RunStatus::Completed
        }
    );
}

#[tokio::test]
async fn retrain_skips_restart_when_another_run_is_active() {
    let h = harness();
    let run_id = h.run().await;
    h.steps(run_id, 1, &FLAT).await;
    *h.control.current.lock().unwrap() = Some(Uuid::new_v4());

    let EvaluationOutcome::Evaluated { retrain, .. } = h.evaluator.evaluate(run_id).await.unwrap()
    else {
        panic!("expected an evaluation");
    };
    let directive = retrain.unwrap();
    assert_eq!(directive.restart, None);
    assert!(h.control.restarts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn human_veto_applies_the_same_decay() {
    let h = harness();
    let run_id = h.run().await;

    let directive = h.evaluator.apply_human_veto(run_id).await.unwrap();
    assert_eq!(directive.new_learning_rate, 0.008);
    assert_eq!(directive.reason, "human veto");
    assert_eq!(*h.control.restarts.lock().unwrap(), vec![0.008]);
}

#[tokio::test]
async fn worker_drains_the_queue() {
    let h = harness();
    let run_id = h.run().await;
    h.steps(run_id, 1, &APPROVING).await;

    let (tx, rx) = mpsc::channel(4);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = spawn_evaluation_worker(h.evaluator.clone(), rx, shutdown_rx);
    for step in 4..=5 {
        tx.send(EvaluationRequest { run_id, step }).await.unwrap();
    }
    drop(tx);
    handle.await.unwrap();

    let proposals = h.voting.list_proposals(ProposalFilter::default()).await.unwrap();
    assert_eq!(proposals.len(), 1);
    assert_eq!(h.evidence.records(EvidenceKind::Consensus).len(), 2);
}

#[tokio::test]
async fn worker_stops_on_shutdown_before_queued_requests() {
    let h = harness();
    let run_id = h.run().await;
    h.steps(run_id, 1, &FLAT).await;

    let (tx, rx) = mpsc::channel(4);
    tx.send(EvaluationRequest { run_id, step: 5 }).await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    shutdown_tx.send(true).unwrap();

    // The sender stays alive, as it does inside a running supervisor.
    let handle = spawn_evaluation_worker(h.evaluator.clone(), rx, shutdown_rx);
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("worker ignored shutdown")
        .unwrap();

    assert!(h.control.restarts.lock().unwrap().is_empty());
    assert!(h
        .voting
        .list_proposals(ProposalFilter::default())
        .await
        .unwrap()
        .is_empty());
    drop(tx);
}

async fn human_review_for(h: &Harness, run_id: Uuid) -> Uuid {
    h.steps(run_id, 1, &APPROVING).await;
    let EvaluationOutcome::Evaluated { proposal, .. } = h.evaluator.evaluate(run_id).await.unwrap()
    else {
        panic!("expected an evaluation");
    };
    let id = proposal.proposal_id();
    h.voting.submit_automated_vote(id, "synth-2", true, None).await.unwrap();
    assert_eq!(h.voting.get_proposal(id).await.unwrap().status, ProposalStatus::HumanVoting);
    id
}

#[tokio::test]
async fn human_veto_of_automatic_proposal_retrains() {
    let h = harness();
    let run_id = h.run().await;
    let id = human_review_for(&h, run_id).await;

    h.voting.submit_human_vote(id, "operator", false, None).await.unwrap();
    let directive = h.evaluator.retrain_after_veto(id).await.unwrap().unwrap();
    assert_eq!(directive.run_id, run_id);
    assert_eq!(directive.new_learning_rate, 0.008);
}

#[tokio::test]
async fn reviewer_veto_and_manual_proposals_do_not_retrain() {
    let h = harness();
    let run_id = h.run().await;
    h.steps(run_id, 1, &MEDIOCRE).await;
    let EvaluationOutcome::Evaluated { proposal, .. } = h.evaluator.evaluate(run_id).await.unwrap()
    else {
        panic!("expected an evaluation");
    };
    let id = proposal.proposal_id();
    h.voting.submit_automated_vote(id, "synth-2", false, None).await.unwrap();
    assert_eq!(h.evaluator.retrain_after_veto(id).await.unwrap(), None);

    let manual = h
        .voting
        .add_proposal(NewProposal::manual("Swap optimizer", "adam -> sgd"))
        .await
        .unwrap();
    assert_eq!(h.evaluator.retrain_after_veto(manual.proposal_id).await.unwrap(), None);
    assert!(h.control.restarts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn veto_listener_retrains_on_finalization() {
    let h = harness();
    let run_id = h.run().await;
    let id = human_review_for(&h, run_id).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = spawn_human_veto_listener(h.evaluator.clone(), shutdown_rx);
    h.voting.submit_human_vote(id, "operator", false, None).await.unwrap();

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while h.control.restarts.lock().unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "no retrain after veto");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(*h.control.restarts.lock().unwrap(), vec![0.008]);

    shutdown_tx.send(true).unwrap();
    listener.await.unwrap();
}
