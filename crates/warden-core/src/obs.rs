//! Structured observability hooks for the Warden governance loop.
//!
//! This module provides:
//! - Run- and proposal-scoped tracing spans (`run_span`, `proposal_span`)
//! - Emission functions with stable `event` names for every lifecycle transition
//!
//! Events are emitted at `info!` level unless they report a fault.
//! Filtering follows `RUST_LOG`; see [`crate::telemetry::init_tracing`].

use tracing::{info, warn, Span};

/// Span tagged with `run_id`. Attach to async work with
/// [`tracing::Instrument::instrument`].
///
/// # Example
///
/// ```ignore
/// reader.instrument(run_span(&run_id)).await;
/// // every event below carries run_id
/// ```
pub fn run_span(run_id: &str) -> Span {
    tracing::info_span!("warden.run", run_id = %run_id)
}

/// Span tagged with `proposal_id`.
pub fn proposal_span(proposal_id: &str) -> Span {
    tracing::info_span!("warden.proposal", proposal_id = %proposal_id)
}

// -- supervisor --------------------------------------------------------------

/// Emit event: run started.
///
/// ```ignore
/// emit_run_started("run-123", "synth-1", 0.01, 4242);
/// // logs: event=run.started run_id=run-123 agent_id=synth-1 learning_rate=0.01 pid=4242
/// ```
pub fn emit_run_started(run_id: &str, agent_id: &str, learning_rate: f64, pid: Option<u32>) {
    info!(
        event = "run.started",
        run_id = %run_id,
        agent_id = %agent_id,
        learning_rate = learning_rate,
        pid = pid,
    );
}

/// Emit event: run reached a terminal status.
pub fn emit_run_finished(run_id: &str, status: &str, exit_code: Option<i32>, steps: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        exit_code = exit_code,
        steps = steps,
    );
}

/// Emit event: stale running state repaired at startup.
pub fn emit_run_reconciled(run_id: &str, terminated_pid: Option<i32>) {
    warn!(
        event = "run.reconciled",
        run_id = %run_id,
        terminated_pid = terminated_pid,
        "stale running run marked failed"
    );
}

pub fn emit_step_recorded(run_id: &str, step: u64, loss: f64) {
    info!(event = "step.recorded", run_id = %run_id, step = step, loss = loss);
}

/// Emit event: worker produced something that is not a valid record (warning level).
pub fn emit_worker_anomaly(run_id: &str, detail: &dyn std::fmt::Display) {
    warn!(event = "worker.anomaly", run_id = %run_id, detail = %detail);
}

// -- evaluator ---------------------------------------------------------------

pub fn emit_evaluation_completed(run_id: &str, improvement: f64, decision: &str, proposal_id: &str) {
    info!(
        event = "evaluation.completed",
        run_id = %run_id,
        improvement = improvement,
        decision = %decision,
        proposal_id = %proposal_id,
    );
}

pub fn emit_retrain_directive(run_id: &str, old_lr: f64, new_lr: f64, reason: &str) {
    warn!(
        event = "retrain.directive",
        run_id = %run_id,
        old_lr = old_lr,
        new_lr = new_lr,
        reason = %reason,
    );
}

// -- voting ------------------------------------------------------------------

pub fn emit_proposal_added(proposal_id: &str, title: &str, origin: &str) {
    info!(event = "proposal.added", proposal_id = %proposal_id, title = %title, origin = %origin);
}

pub fn emit_vote_recorded(proposal_id: &str, voter_id: &str, phase: &str, approve: bool) {
    info!(
        event = "vote.recorded",
        proposal_id = %proposal_id,
        voter_id = %voter_id,
        phase = %phase,
        approve = approve,
    );
}

/// Emit event: a voting phase resolved with an outcome tag such as `SENTIENCE:APPROVED`.
pub fn emit_phase_resolved(proposal_id: &str, outcome: &str, approval_rate: f64, votes: usize) {
    info!(
        event = "phase.resolved",
        proposal_id = %proposal_id,
        outcome = %outcome,
        approval_rate = approval_rate,
        votes = votes,
    );
}

pub fn emit_proposal_expired(proposal_id: &str, phase: &str, age_secs: i64) {
    warn!(
        event = "proposal.expired",
        proposal_id = %proposal_id,
        phase = %phase,
        age_secs = age_secs,
    );
}

pub fn emit_proposal_finalized(proposal_id: &str, status: &str) {
    info!(event = "proposal.finalized", proposal_id = %proposal_id, status = %status);
}

pub fn emit_execution_recorded(proposal_id: &str, success: bool) {
    info!(event = "execution.recorded", proposal_id = %proposal_id, success = success);
}

// -- evidence ----------------------------------------------------------------

/// Emit event: evidence write failed (warning level). Never fatal.
pub fn emit_evidence_write_failed(kind: &str, name: &str, error: &dyn std::fmt::Display) {
    warn!(event = "evidence.write_failed", kind = %kind, name = %name, error = %error);
}
