//! The execution collaborator invoked for approved proposals.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::engine::VotingEngine;
use super::FinalStatus;

/// What an execution attempt reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl ExecutionReport {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// Carries out an approved proposal. Failures are reported, not raised.
#[async_trait]
pub trait ExecutionCollaborator: Send + Sync {
    async fn execute(&self, proposal_id: Uuid, diff: Option<&str>) -> ExecutionReport;
}

/// Records success without touching anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExecutor;

#[async_trait]
impl ExecutionCollaborator for NoopExecutor {
    async fn execute(&self, proposal_id: Uuid, _diff: Option<&str>) -> ExecutionReport {
        debug!(%proposal_id, "no-op execution");
        ExecutionReport::succeeded("no-op")
    }
}

/// Runs a configured command with the diff on stdin.
///
/// The proposal id is exported as `WARDEN_PROPOSAL_ID`. A non-zero exit, a
/// spawn failure or a timeout is a failed execution.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, proposal_id: Uuid, diff: Option<&str>) -> Result<ExecutionReport, String> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| "executor command is empty".to_string())?;

        let mut child = Command::new(program)
            .args(args)
            .env("WARDEN_PROPOSAL_ID", proposal_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn {program}: {e}"))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Some(diff) = diff {
                stdin
                    .write_all(diff.as_bytes())
                    .await
                    .map_err(|e| format!("failed to write diff: {e}"))?;
            }
            // Dropping stdin closes the pipe.
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| format!("timed out after {}s", self.timeout.as_secs()))?
            .map_err(|e| format!("failed to wait for {program}: {e}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let non_empty = |s: String| (!s.is_empty()).then_some(s);

        if output.status.success() {
            Ok(ExecutionReport {
                success: true,
                output: non_empty(stdout),
                error: None,
            })
        } else {
            Ok(ExecutionReport {
                success: false,
                output: non_empty(stdout),
                error: Some(non_empty(stderr).unwrap_or_else(|| format!("{}", output.status))),
            })
        }
    }
}

#[async_trait]
impl ExecutionCollaborator for CommandExecutor {
    async fn execute(&self, proposal_id: Uuid, diff: Option<&str>) -> ExecutionReport {
        self.run(proposal_id, diff)
            .await
            .unwrap_or_else(ExecutionReport::failed)
    }
}

/// Execute every proposal the engine approves from now on, until `shutdown`
/// flips to `true`.
pub fn spawn_auto_executor(
    engine: Arc<VotingEngine>,
    executor: Arc<dyn ExecutionCollaborator>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) if event.status == FinalStatus::Approved => {
                        match engine.execute_approved(event.proposal_id, executor.as_ref()).await {
                            Ok(record) => info!(
                                proposal_id = %event.proposal_id,
                                success = record.success,
                                "auto-executed approved proposal"
                            ),
                            Err(e) => warn!(
                                proposal_id = %event.proposal_id,
                                error = %e,
                                "auto-execution rejected"
                            ),
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "auto-executor lagged behind finalization events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}
