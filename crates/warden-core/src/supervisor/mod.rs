//! Training process supervision.
//!
//! [`TrainingSupervisor`] owns at most one worker process. It records the run,
//! streams the worker's stdout into the step store, and hands each persisted
//! step to the evaluator through a bounded queue.

pub mod launcher;
pub mod probe;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;
use warden_state::{
    RunFilter, RunStatus, RunStore, StepStore, StorageError, TrainingRunRecord,
    TrainingStepRecord,
};

pub use launcher::{CommandLauncher, WorkerLauncher, RUN_ID_ENV};
pub use probe::{PidFileProbe, ProcessProbe};

use crate::config::SupervisorConfig;
use crate::domain::{parse_worker_line, StepReport, WardenError, WorkerMessage};
use crate::evidence::{append_best_effort, EvidenceKind, EvidenceSink};
use crate::obs;

/// Upper bound on draining worker output after the process exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on waiting for exit after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// One persisted step handed to the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationRequest {
    pub run_id: Uuid,
    pub step: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StartOutcome {
    pub started: bool,
    pub run_id: Option<Uuid>,
}

impl StartOutcome {
    fn refused() -> Self {
        Self {
            started: false,
            run_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StopOutcome {
    pub stopped: bool,
    pub run_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SupervisorStatus {
    pub running: bool,
    pub run_id: Option<Uuid>,
    pub pid: Option<u32>,
    pub learning_rate: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub step_count: u64,
}

/// The narrow seam through which the evaluator changes live training.
#[async_trait]
pub trait TrainingControl: Send + Sync {
    /// Run currently owned by the supervisor.
    async fn current_run(&self) -> Option<Uuid>;

    /// Replace `replacing` with a new run at `learning_rate`.
    ///
    /// Starts fresh when nothing is owned. `None` when another run is owned,
    /// or when `replacing`'s worker already exited on its own; that run then
    /// keeps the outcome of its exit.
    async fn restart(&self, replacing: Uuid, learning_rate: f64) -> Option<StartOutcome>;
}

/// Collaborators of a [`TrainingSupervisor`].
pub struct SupervisorDeps {
    pub runs: Arc<dyn RunStore>,
    pub steps: Arc<dyn StepStore>,
    pub evidence: Arc<dyn EvidenceSink>,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub probe: Arc<dyn ProcessProbe>,
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WorkerExit {
    code: Option<i32>,
}

impl WorkerExit {
    fn run_status(&self) -> RunStatus {
        if self.code == Some(0) {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        }
    }
}

struct OwnedWorker {
    run_id: Uuid,
    pid: Option<u32>,
    learning_rate: f64,
    started_at: DateTime<Utc>,
    exited: watch::Receiver<Option<WorkerExit>>,
    step_count: Arc<AtomicU64>,
}

struct Inner {
    agent_id: String,
    default_learning_rate: f64,
    shutdown_timeout: Duration,
    deps: SupervisorDeps,
    eval_tx: mpsc::Sender<EvaluationRequest>,
    worker: Mutex<Option<OwnedWorker>>,
}

/// Owner of the training worker. Cheap to clone; clones share ownership state.
#[derive(Clone)]
pub struct TrainingSupervisor {
    inner: Arc<Inner>,
}

impl TrainingSupervisor {
    pub fn new(
        config: &SupervisorConfig,
        deps: SupervisorDeps,
        eval_tx: mpsc::Sender<EvaluationRequest>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                agent_id: config.agent_id.clone(),
                default_learning_rate: config.default_learning_rate,
                shutdown_timeout: config.shutdown_timeout(),
                deps,
                eval_tx,
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    /// Start a worker at `learning_rate` (or the configured default).
    ///
    /// Refuses with `started: false` when a worker is already owned, when the
    /// store still has a running run for this agent, or when the launch
    /// fails. Never returns an error.
    pub async fn start(&self, learning_rate: Option<f64>) -> StartOutcome {
        let mut slot = self.inner.worker.lock().await;
        self.launch(&mut slot, learning_rate).await
    }

    /// Start a worker into `slot`. Caller holds the slot lock.
    async fn launch(
        &self,
        slot: &mut Option<OwnedWorker>,
        learning_rate: Option<f64>,
    ) -> StartOutcome {
        let inner = &self.inner;
        if let Some(owned) = slot.as_ref() {
            info!(run_id = %owned.run_id, "start refused: worker already running");
            return StartOutcome::refused();
        }

        match inner
            .deps
            .runs
            .list_runs(RunFilter::running_for(&inner.agent_id))
            .await
        {
            Ok(running) if !running.is_empty() => {
                warn!(
                    agent_id = %inner.agent_id,
                    run_id = %running[0].run_id,
                    "start refused: store has a running run for this agent"
                );
                return StartOutcome::refused();
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "start refused: cannot read run state");
                return StartOutcome::refused();
            }
        }

        let learning_rate = learning_rate.unwrap_or(inner.default_learning_rate);
        let run = TrainingRunRecord::new(&inner.agent_id, learning_rate);
        let run_id = run.run_id;
        if let Err(e) = inner.deps.runs.create_run(run.clone()).await {
            warn!(error = %e, "start refused: cannot record run");
            return StartOutcome::refused();
        }

        let mut child = match inner.deps.launcher.launch(run_id, learning_rate) {
            Ok(child) => child,
            Err(e) => {
                warn!(%run_id, error = %e, "worker launch failed");
                if let Err(e) = inner.deps.runs.finish_run(run_id, RunStatus::Failed).await {
                    warn!(%run_id, error = %e, "failed to mark run failed");
                }
                obs::emit_run_finished(&run_id.to_string(), RunStatus::Failed.as_str(), None, 0);
                return StartOutcome::refused();
            }
        };

        let pid = child.id();
        if let Some(pid) = pid {
            if let Err(e) = inner.deps.probe.record(run_id, pid) {
                warn!(%run_id, pid, error = %e, "failed to record worker pid");
            }
        }
        obs::emit_run_started(&run_id.to_string(), &inner.agent_id, learning_rate, pid);

        let step_count = Arc::new(AtomicU64::new(0));
        let (exit_tx, exit_rx) = watch::channel(None);
        *slot = Some(OwnedWorker {
            run_id,
            pid,
            learning_rate,
            started_at: run.created_at,
            exited: exit_rx,
            step_count: step_count.clone(),
        });

        let span = obs::run_span(&run_id.to_string());
        let stdout = child.stdout.take().map(|out| {
            tokio::spawn(
                self.clone()
                    .read_stdout(run_id, out, step_count.clone())
                    .instrument(span.clone()),
            )
        });
        if let Some(err) = child.stderr.take() {
            tokio::spawn(read_stderr(run_id, err).instrument(span.clone()));
        }
        tokio::spawn(
            self.clone()
                .monitor(run_id, child, exit_tx, stdout, step_count)
                .instrument(span),
        );

        StartOutcome {
            started: true,
            run_id: Some(run_id),
        }
    }

    /// Stop the owned worker: SIGTERM, wait up to the shutdown timeout, then
    /// SIGKILL. The run is marked failed. A worker that already exited on
    /// its own keeps the status of its exit. Returns `stopped: false` when
    /// nothing is owned; calling it again is harmless.
    pub async fn stop(&self) -> StopOutcome {
        let mut slot = self.inner.worker.lock().await;
        let Some(worker) = slot.take() else {
            return StopOutcome {
                stopped: false,
                run_id: None,
            };
        };
        let run_id = worker.run_id;
        self.release(worker).await;

        StopOutcome {
            stopped: true,
            run_id: Some(run_id),
        }
    }

    /// Finalize a worker taken out of the slot, terminating it first when
    /// it is still running. Returns whether it was terminated here. Caller
    /// holds the slot lock.
    async fn release(&self, mut worker: OwnedWorker) -> bool {
        let inner = &self.inner;
        let already_exited = *worker.exited.borrow();
        let (status, exit_code, terminated) = match already_exited {
            Some(exit) => (exit.run_status(), exit.code, false),
            None => {
                self.terminate(&mut worker).await;
                let code = worker.exited.borrow().and_then(|exit| exit.code);
                (RunStatus::Failed, code, true)
            }
        };

        let steps = worker.step_count.load(Ordering::SeqCst);
        match inner.deps.runs.finish_run(worker.run_id, status).await {
            Ok(_) => obs::emit_run_finished(
                &worker.run_id.to_string(),
                status.as_str(),
                exit_code,
                steps,
            ),
            Err(StorageError::InvalidRunState { status, .. }) => {
                debug!(run_id = %worker.run_id, %status, "run already terminal");
            }
            Err(e) => warn!(run_id = %worker.run_id, error = %e, "failed to finalize run"),
        }
        inner.deps.probe.forget(worker.run_id);
        terminated
    }

    pub async fn status(&self) -> SupervisorStatus {
        let slot = self.inner.worker.lock().await;
        match slot.as_ref() {
            Some(w) => SupervisorStatus {
                running: true,
                run_id: Some(w.run_id),
                pid: w.pid,
                learning_rate: Some(w.learning_rate),
                started_at: Some(w.started_at),
                step_count: w.step_count.load(Ordering::SeqCst),
            },
            None => SupervisorStatus::default(),
        }
    }

    /// Most recent step of any run.
    pub async fn latest_step(&self) -> Result<Option<TrainingStepRecord>, WardenError> {
        Ok(self.inner.deps.steps.latest_step().await?)
    }

    /// Repair running state left behind by a previous instance.
    ///
    /// Every run of this agent still marked running and not owned here is
    /// marked failed; a live process recorded for it is terminated first.
    /// Faults are logged. Returns the repaired run ids.
    pub async fn reconcile(&self) -> Vec<Uuid> {
        let inner = &self.inner;
        let owned = self.current_run().await;
        let stale = match inner
            .deps
            .runs
            .list_runs(RunFilter::running_for(&inner.agent_id))
            .await
        {
            Ok(runs) => runs,
            Err(e) => {
                warn!(error = %e, "reconcile skipped: cannot list runs");
                return Vec::new();
            }
        };

        let mut repaired = Vec::new();
        for run in stale.into_iter().filter(|r| Some(r.run_id) != owned) {
            let terminated = match inner.deps.probe.find_live(run.run_id) {
                Some(pid) => {
                    if !probe::terminate_pid(pid, inner.shutdown_timeout).await {
                        warn!(run_id = %run.run_id, pid, "orphaned worker survived SIGKILL");
                    }
                    Some(pid)
                }
                None => None,
            };

            match inner.deps.runs.finish_run(run.run_id, RunStatus::Failed).await {
                Ok(_) | Err(StorageError::InvalidRunState { .. }) => {
                    obs::emit_run_reconciled(&run.run_id.to_string(), terminated);
                    repaired.push(run.run_id);
                }
                Err(e) => warn!(run_id = %run.run_id, error = %e, "failed to reconcile run"),
            }
            inner.deps.probe.forget(run.run_id);
        }
        repaired
    }

    async fn terminate(&self, worker: &mut OwnedWorker) {
        if worker.exited.borrow().is_some() {
            return;
        }
        let Some(pid) = worker.pid.map(|p| p as i32) else {
            return;
        };

        if let Err(e) = probe::send_signal(pid, Signal::SIGTERM) {
            warn!(run_id = %worker.run_id, error = %e, "SIGTERM failed");
        }
        if wait_exit(&mut worker.exited, self.inner.shutdown_timeout).await {
            return;
        }

        warn!(
            run_id = %worker.run_id,
            pid,
            timeout_secs = self.inner.shutdown_timeout.as_secs(),
            "worker ignored SIGTERM; sending SIGKILL"
        );
        if let Err(e) = probe::send_signal(pid, Signal::SIGKILL) {
            warn!(run_id = %worker.run_id, error = %e, "SIGKILL failed");
        }
        if !wait_exit(&mut worker.exited, KILL_WAIT).await {
            warn!(run_id = %worker.run_id, pid, "worker did not exit after SIGKILL");
        }
    }

    /// Wait for the worker to exit, then finalize the run if this instance
    /// still owns it. A run taken over by `stop` is finalized there.
    async fn monitor(
        self,
        run_id: Uuid,
        mut child: Child,
        exit_tx: watch::Sender<Option<WorkerExit>>,
        stdout: Option<tokio::task::JoinHandle<()>>,
        step_count: Arc<AtomicU64>,
    ) {
        let exit_code = match child.wait().await {
            Ok(s) => s.code(),
            Err(e) => {
                warn!(%run_id, error = %e, "failed to wait for worker");
                None
            }
        };
        let exit = WorkerExit { code: exit_code };
        let _ = exit_tx.send(Some(exit));

        if let Some(reader) = stdout {
            if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
                warn!(%run_id, "worker output still open after exit");
            }
        }

        let inner = &self.inner;
        let mut slot = inner.worker.lock().await;
        if !slot.as_ref().is_some_and(|w| w.run_id == run_id) {
            return;
        }
        *slot = None;

        let final_status = exit.run_status();
        match inner.deps.runs.finish_run(run_id, final_status).await {
            Ok(_) => obs::emit_run_finished(
                &run_id.to_string(),
                final_status.as_str(),
                exit_code,
                step_count.load(Ordering::SeqCst),
            ),
            Err(e) => warn!(%run_id, error = %e, "failed to finalize run"),
        }
        inner.deps.probe.forget(run_id);
    }

    async fn read_stdout(
        self,
        run_id: Uuid,
        stdout: impl AsyncRead + Unpin,
        step_count: Arc<AtomicU64>,
    ) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => self.handle_line(run_id, &line, &step_count).await,
                Ok(None) => break,
                Err(e) => {
                    obs::emit_worker_anomaly(&run_id.to_string(), &e);
                    break;
                }
            }
        }
    }

    async fn handle_line(&self, run_id: Uuid, line: &str, step_count: &AtomicU64) {
        if line.trim().is_empty() {
            return;
        }
        match parse_worker_line(line) {
            Ok(WorkerMessage::Step(report)) => self.record_step(run_id, report, step_count).await,
            Ok(WorkerMessage::Info(message)) => info!(%run_id, %message, "worker info"),
            Ok(WorkerMessage::Error(message)) => warn!(%run_id, %message, "worker reported error"),
            Err(e) => obs::emit_worker_anomaly(&run_id.to_string(), &e),
        }
    }

    async fn record_step(&self, run_id: Uuid, report: StepReport, step_count: &AtomicU64) {
        let inner = &self.inner;
        let record = TrainingStepRecord {
            run_id,
            step: report.step,
            loss: report.loss,
            elapsed_ms: report.elapsed_ms,
            params: report.params,
            recorded_at: Utc::now(),
        };
        if let Err(e) = inner.deps.steps.append_step(record.clone()).await {
            obs::emit_worker_anomaly(&run_id.to_string(), &e);
            return;
        }
        step_count.fetch_add(1, Ordering::SeqCst);
        obs::emit_step_recorded(&run_id.to_string(), record.step, record.loss);

        append_best_effort(
            &inner.deps.evidence,
            EvidenceKind::Training,
            &format!("step-{}", record.step),
            json!({
                "timestamp": record.recorded_at,
                "runId": run_id,
                "step": record.step,
                "loss": record.loss,
                "elapsedMs": record.elapsed_ms,
                "parameters": record.params,
            }),
        )
        .await;

        // Blocks while the queue is full.
        let request = EvaluationRequest {
            run_id,
            step: record.step,
        };
        if inner.eval_tx.send(request).await.is_err() {
            debug!(%run_id, "evaluation queue closed; step not evaluated");
        }
    }
}

#[async_trait]
impl TrainingControl for TrainingSupervisor {
    async fn current_run(&self) -> Option<Uuid> {
        self.inner.worker.lock().await.as_ref().map(|w| w.run_id)
    }

    async fn restart(&self, replacing: Uuid, learning_rate: f64) -> Option<StartOutcome> {
        let mut slot = self.inner.worker.lock().await;
        if let Some(owned) = slot.as_ref() {
            if owned.run_id != replacing {
                info!(
                    run_id = %replacing,
                    current = %owned.run_id,
                    "restart skipped: another run is active"
                );
                return None;
            }
        }
        if let Some(worker) = slot.take() {
            if !self.release(worker).await {
                info!(run_id = %replacing, "restart skipped: worker already exited");
                return None;
            }
        }
        Some(self.launch(&mut slot, Some(learning_rate)).await)
    }
}

async fn read_stderr(run_id: Uuid, stderr: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            warn!(%run_id, line = %line, "worker stderr");
        }
    }
}

/// Whether the worker exited within `within`. A closed channel means the
/// monitor is gone, which only happens after exit.
async fn wait_exit(exited: &mut watch::Receiver<Option<WorkerExit>>, within: Duration) -> bool {
    tokio::time::timeout(within, exited.wait_for(Option::is_some))
        .await
        .is_ok()
}
