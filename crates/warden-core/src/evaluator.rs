//! Windowed consensus evaluation of a training run.
//!
//! After every persisted step the evaluator looks at the newest
//! `window_size` steps of the run, computes the relative loss improvement,
//! and turns it into an automatic proposal plus one automated-reviewer vote.
//! A poor enough window also restarts training at a decayed learning rate.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;
use warden_state::{
    ConsensusOutcome, ProposalFilter, ProposalOrigin, ProposalRecord, ProposalStatus, RunStatus, RunStore,
    StepStore, TrainingRunRecord, TrainingStepRecord, VotingPhase,
};

use crate::config::{EvaluatorConfig, GuardScope};
use crate::domain::{VotingError, WardenError};
use crate::evidence::{append_best_effort, EvidenceKind, EvidenceSink};
use crate::obs;
use crate::supervisor::{EvaluationRequest, StartOutcome, TrainingControl};
use crate::voting::{FinalStatus, NewProposal, VoteOutcome, VotingEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Veto,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Veto => "veto",
        }
    }
}

/// `(first - last) / first`; `0.0` when `first` is not positive.
pub fn improvement(first_loss: f64, last_loss: f64) -> f64 {
    if first_loss > 0.0 {
        (first_loss - last_loss) / first_loss
    } else {
        0.0
    }
}

/// `max(min_lr, round(old * decay, 5))`.
pub fn next_learning_rate(old: f64, decay: f64, min_lr: f64) -> f64 {
    let decayed = (old * decay * 1e5).round() / 1e5;
    decayed.max(min_lr)
}

/// Judgement over one window of steps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowAnalysis {
    pub first_loss: f64,
    pub last_loss: f64,
    pub improvement: f64,
    pub decision: Decision,
    pub reasoning: String,
}

/// Analyse `window` (ascending by step). `None` for an empty window.
pub fn analyze_window(window: &[TrainingStepRecord], threshold: f64) -> Option<WindowAnalysis> {
    let first = window.first()?;
    let last = window.last()?;
    let improvement = improvement(first.loss, last.loss);
    let pct = improvement * 100.0;
    let threshold_pct = threshold * 100.0;

    let (decision, reasoning) = if improvement >= threshold {
        (
            Decision::Approve,
            format!("Training shows {pct:.2}% improvement, exceeding {threshold_pct:.0}% threshold"),
        )
    } else {
        (
            Decision::Veto,
            format!("Training shows only {pct:.2}% improvement, below {threshold_pct:.0}% threshold"),
        )
    };

    Some(WindowAnalysis {
        first_loss: first.loss,
        last_loss: last.loss,
        improvement,
        decision,
        reasoning,
    })
}

/// What happened to the run's automatic proposal.
#[derive(Debug, Clone, PartialEq)]
pub enum ProposalAction {
    Created(Uuid),
    Updated(Uuid),
    /// The proposal moved past automated review; left alone.
    Unchanged { proposal_id: Uuid, status: ProposalStatus },
}

impl ProposalAction {
    pub fn proposal_id(&self) -> Uuid {
        match self {
            Self::Created(id) | Self::Updated(id) => *id,
            Self::Unchanged { proposal_id, .. } => *proposal_id,
        }
    }
}

/// A stop-and-restart at a decayed learning rate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrainDirective {
    pub run_id: Uuid,
    pub old_learning_rate: f64,
    pub new_learning_rate: f64,
    pub reason: String,
    /// `None` when another run was owned or the run's worker had already
    /// exited.
    pub restart: Option<StartOutcome>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome {
    RunNotRunning { status: RunStatus },
    InsufficientSteps { have: usize, need: usize },
    /// An automatic proposal in this scope awaits a human decision.
    HumanReviewPending { proposal_id: Uuid },
    Evaluated {
        analysis: WindowAnalysis,
        proposal: ProposalAction,
        vote: Option<VoteOutcome>,
        retrain: Option<RetrainDirective>,
    },
}

pub struct ConsensusEvaluator {
    config: EvaluatorConfig,
    runs: Arc<dyn RunStore>,
    steps: Arc<dyn StepStore>,
    voting: Arc<VotingEngine>,
    evidence: Arc<dyn EvidenceSink>,
    control: Arc<dyn TrainingControl>,
}

impl ConsensusEvaluator {
    pub fn new(
        config: EvaluatorConfig,
        runs: Arc<dyn RunStore>,
        steps: Arc<dyn StepStore>,
        voting: Arc<VotingEngine>,
        evidence: Arc<dyn EvidenceSink>,
        control: Arc<dyn TrainingControl>,
    ) -> Self {
        Self {
            config,
            runs,
            steps,
            voting,
            evidence,
            control,
        }
    }

    pub async fn evaluate(&self, run_id: Uuid) -> Result<EvaluationOutcome, WardenError> {
        let run = self.runs.get_run(run_id).await?;
        if run.status != RunStatus::Running {
            return Ok(EvaluationOutcome::RunNotRunning { status: run.status });
        }

        let need = self.config.window_size;
        let window = self.steps.latest_steps(run_id, need).await?;
        if window.len() < need {
            return Ok(EvaluationOutcome::InsufficientSteps {
                have: window.len(),
                need,
            });
        }

        if let Some(pending) = self.pending_human_review(run_id).await? {
            debug!(%run_id, proposal_id = %pending, "evaluation skipped: human review pending");
            return Ok(EvaluationOutcome::HumanReviewPending {
                proposal_id: pending,
            });
        }

        let Some(analysis) = analyze_window(&window, self.config.improvement_threshold) else {
            return Ok(EvaluationOutcome::InsufficientSteps { have: 0, need });
        };
        self.write_consensus_evidence(&run, &window, &analysis).await;

        let proposal = self.reconcile_proposal(&run, &window, &analysis).await?;
        let vote = match &proposal {
            ProposalAction::Created(id) | ProposalAction::Updated(id) => {
                self.cast_vote(*id, &analysis).await
            }
            ProposalAction::Unchanged { .. } => None,
        };

        obs::emit_evaluation_completed(
            &run_id.to_string(),
            analysis.improvement,
            analysis.decision.as_str(),
            &proposal.proposal_id().to_string(),
        );

        let retrain = if analysis.decision == Decision::Veto
            && analysis.improvement < self.config.retrain_improvement_threshold
        {
            Some(self.retrain(&run, analysis.reasoning.clone()).await)
        } else {
            None
        };

        Ok(EvaluationOutcome::Evaluated {
            analysis,
            proposal,
            vote,
            retrain,
        })
    }

    /// On-demand retrain after a human veto of `run_id`'s proposal.
    pub async fn apply_human_veto(&self, run_id: Uuid) -> Result<RetrainDirective, WardenError> {
        let run = self.runs.get_run(run_id).await?;
        Ok(self.retrain(&run, "human veto".to_string()).await)
    }

    /// Retrain the origin run of `proposal_id` if a human vetoed it.
    ///
    /// `None` for manual proposals, other categories, and vetoes that did
    /// not come from the human phase.
    pub async fn retrain_after_veto(
        &self,
        proposal_id: Uuid,
    ) -> Result<Option<RetrainDirective>, WardenError> {
        let proposal = self.voting.get_proposal(proposal_id).await?;
        let Some(run_id) = proposal.origin.run_id() else {
            return Ok(None);
        };
        if proposal.category != self.config.category {
            return Ok(None);
        }
        let results = self.voting.results(proposal_id).await?;
        if !results
            .last()
            .is_some_and(|r| r.outcome == ConsensusOutcome::HumanVetoed)
        {
            return Ok(None);
        }
        self.apply_human_veto(run_id).await.map(Some)
    }

    async fn pending_human_review(&self, run_id: Uuid) -> Result<Option<Uuid>, WardenError> {
        let filter = ProposalFilter {
            statuses: vec![ProposalStatus::HumanVoting],
            origin_run: match self.config.guard_scope {
                GuardScope::Run => Some(run_id),
                GuardScope::Category => None,
            },
            category: Some(self.config.category.clone()),
            automatic_only: true,
        };
        let pending = self.voting.list_proposals(filter).await?;
        Ok(pending.first().map(|p| p.proposal_id))
    }

    async fn reconcile_proposal(
        &self,
        run: &TrainingRunRecord,
        window: &[TrainingStepRecord],
        analysis: &WindowAnalysis,
    ) -> Result<ProposalAction, WardenError> {
        let filter = ProposalFilter {
            statuses: Vec::new(),
            origin_run: Some(run.run_id),
            category: Some(self.config.category.clone()),
            automatic_only: true,
        };
        let existing: Option<ProposalRecord> =
            self.voting.list_proposals(filter).await?.into_iter().last();
        let body = proposal_body(run, window, analysis);

        match existing {
            None => {
                let suggested = next_learning_rate(
                    run.learning_rate,
                    self.config.learning_rate_decay,
                    self.config.min_learning_rate,
                );
                let proposal = self
                    .voting
                    .add_proposal(NewProposal {
                        title: proposal_title(run.run_id),
                        description: body,
                        origin: ProposalOrigin::Automatic { run_id: run.run_id },
                        category: self.config.category.clone(),
                        diff: Some(format!(
                            "learning_rate: {} -> {}",
                            run.learning_rate, suggested
                        )),
                    })
                    .await?;
                Ok(ProposalAction::Created(proposal.proposal_id))
            }
            Some(p) if p.status == ProposalStatus::SentientVoting => {
                match self.voting.update_description(p.proposal_id, body).await {
                    Ok(_) => Ok(ProposalAction::Updated(p.proposal_id)),
                    // Resolved between the lookup and the edit.
                    Err(VotingError::NotEditable { status, .. }) => Ok(ProposalAction::Unchanged {
                        proposal_id: p.proposal_id,
                        status,
                    }),
                    Err(e) => Err(e.into()),
                }
            }
            Some(p) => Ok(ProposalAction::Unchanged {
                proposal_id: p.proposal_id,
                status: p.status,
            }),
        }
    }

    /// One vote per reviewer per proposal; a later window only refreshes the
    /// description. Vote rejections are logged, not propagated.
    async fn cast_vote(&self, proposal_id: Uuid, analysis: &WindowAnalysis) -> Option<VoteOutcome> {
        let reviewer = &self.config.reviewer_id;
        match self
            .voting
            .votes(proposal_id, VotingPhase::AutomatedReview)
            .await
        {
            Ok(votes) if votes.iter().any(|v| v.voter_id == *reviewer) => return None,
            Ok(_) => {}
            Err(e) => {
                warn!(%proposal_id, error = %e, "cannot read votes; not voting");
                return None;
            }
        }

        match self
            .voting
            .submit_automated_vote(
                proposal_id,
                reviewer,
                analysis.decision == Decision::Approve,
                Some(analysis.reasoning.clone()),
            )
            .await
        {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(%proposal_id, reviewer = %reviewer, error = %e, "automated vote rejected");
                None
            }
        }
    }

    async fn retrain(&self, run: &TrainingRunRecord, reason: String) -> RetrainDirective {
        let new_learning_rate = next_learning_rate(
            run.learning_rate,
            self.config.learning_rate_decay,
            self.config.min_learning_rate,
        );
        obs::emit_retrain_directive(
            &run.run_id.to_string(),
            run.learning_rate,
            new_learning_rate,
            &reason,
        );
        append_best_effort(
            &self.evidence,
            EvidenceKind::Directive,
            &format!("retrain-{}", run.run_id),
            json!({
                "timestamp": Utc::now(),
                "runId": run.run_id,
                "action": "retrain",
                "oldLearningRate": run.learning_rate,
                "newLearningRate": new_learning_rate,
                "reason": reason,
            }),
        )
        .await;

        let restart = self.control.restart(run.run_id, new_learning_rate).await;
        match &restart {
            Some(outcome) => info!(
                run_id = %run.run_id,
                started = outcome.started,
                new_run_id = ?outcome.run_id,
                "retrain restart"
            ),
            None => {
                let current = self.control.current_run().await;
                warn!(
                    run_id = %run.run_id,
                    current = ?current,
                    "retrain not applied: run is not the live training run"
                )
            }
        }

        RetrainDirective {
            run_id: run.run_id,
            old_learning_rate: run.learning_rate,
            new_learning_rate,
            reason,
            restart,
        }
    }

    async fn write_consensus_evidence(
        &self,
        run: &TrainingRunRecord,
        window: &[TrainingStepRecord],
        analysis: &WindowAnalysis,
    ) {
        let steps: Vec<_> = window
            .iter()
            .map(|s| json!({"step": s.step, "loss": s.loss, "parameters": s.params}))
            .collect();
        append_best_effort(
            &self.evidence,
            EvidenceKind::Consensus,
            &format!("consensus-{}", run.run_id),
            json!({
                "timestamp": Utc::now(),
                "runId": run.run_id,
                "windowSize": self.config.window_size,
                "stepsAnalyzed": window.len(),
                "improvement": analysis.improvement,
                "threshold": self.config.improvement_threshold,
                "decision": analysis.decision.as_str(),
                "reasoning": analysis.reasoning,
                "steps": steps,
            }),
        )
        .await;
    }
}

/// Drain the evaluation queue one request at a time until shut down.
///
/// Shutdown is only observed between requests, so an evaluation that is
/// already restarting training finishes first.
pub fn spawn_evaluation_worker(
    evaluator: Arc<ConsensusEvaluator>,
    mut requests: mpsc::Receiver<EvaluationRequest>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            let span = obs::run_span(&request.run_id.to_string());
            match evaluator.evaluate(request.run_id).instrument(span).await {
                Ok(outcome) => debug!(run_id = %request.run_id, step = request.step, ?outcome, "evaluated"),
                Err(e) => warn!(run_id = %request.run_id, step = request.step, error = %e, "evaluation failed"),
            }
        }
    })
}

/// Retrain whenever a human vetoes an automatic proposal, until shut down.
pub fn spawn_human_veto_listener(
    evaluator: Arc<ConsensusEvaluator>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut events = evaluator.voting.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) if event.status == FinalStatus::Vetoed => {
                        match evaluator.retrain_after_veto(event.proposal_id).await {
                            Ok(Some(directive)) => info!(
                                proposal_id = %event.proposal_id,
                                run_id = %directive.run_id,
                                new_learning_rate = directive.new_learning_rate,
                                "retrained after human veto"
                            ),
                            Ok(None) => {}
                            Err(e) => warn!(
                                proposal_id = %event.proposal_id,
                                error = %e,
                                "retrain after veto failed"
                            ),
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "veto listener lagged behind finalization events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

fn proposal_title(run_id: Uuid) -> String {
    let short: String = run_id.to_string().chars().take(8).collect();
    format!("Auto: Tune LR (run {short})")
}

fn proposal_body(
    run: &TrainingRunRecord,
    window: &[TrainingStepRecord],
    analysis: &WindowAnalysis,
) -> String {
    let mut body = format!(
        "## Training Analysis\n\n\
         **Run ID:** {}\n\
         **Learning Rate:** {}\n\
         **Steps Analyzed:** {}\n\
         **Improvement:** {:.2}%\n\
         **Final Loss:** {:.6}\n\
         **Initial Loss:** {:.6}\n",
        run.run_id,
        run.learning_rate,
        window.len(),
        analysis.improvement * 100.0,
        analysis.last_loss,
        analysis.first_loss,
    );

    if let Some(last) = window.last().filter(|s| !s.params.values.is_empty()) {
        body.push_str("\n### Parameters\n");
        for (key, value) in &last.params.values {
            body.push_str(&format!("- {key}: {value}\n"));
        }
    }

    body.push_str(&format!(
        "\n### Consensus Decision\n**{}**: {}\n",
        analysis.decision.as_str().to_uppercase(),
        analysis.reasoning
    ));
    body
}
