//! Worker process launch.

use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::domain::SupervisorError;

/// Environment variable carrying the run id into the worker.
pub const RUN_ID_ENV: &str = "WARDEN_RUN_ID";

/// Capability to spawn the training worker.
///
/// The returned child must have piped stdout and stderr.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, run_id: Uuid, learning_rate: f64) -> Result<Child, SupervisorError>;
}

/// Launches `argv --lr <rate>` with the run identity in the environment.
///
/// Environment: `TRAIN_ENABLED=1`, `WARDEN_RUN_ID`, `WARDEN_LEARNING_RATE`.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    argv: Vec<String>,
    low_priority: bool,
}

impl CommandLauncher {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            low_priority: false,
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            argv: config.worker_command.clone(),
            low_priority: config.low_priority,
        }
    }

    /// Prefix the worker with `nice -n 10` when `nice` is on `PATH`.
    pub fn with_low_priority(mut self, low_priority: bool) -> Self {
        self.low_priority = low_priority;
        self
    }

    /// Full argv for a launch, after priority prefixing.
    pub fn argv_for(&self, learning_rate: f64) -> Result<Vec<String>, SupervisorError> {
        if self.argv.is_empty() {
            return Err(SupervisorError::EmptyCommand);
        }
        let mut argv = Vec::with_capacity(self.argv.len() + 5);
        if self.low_priority && on_path("nice") {
            argv.extend(["nice".to_string(), "-n".to_string(), "10".to_string()]);
        }
        argv.extend(self.argv.iter().cloned());
        argv.push("--lr".to_string());
        argv.push(learning_rate.to_string());
        Ok(argv)
    }
}

impl WorkerLauncher for CommandLauncher {
    fn launch(&self, run_id: Uuid, learning_rate: f64) -> Result<Child, SupervisorError> {
        let argv = self.argv_for(learning_rate)?;
        let (program, args) = argv.split_first().ok_or(SupervisorError::EmptyCommand)?;

        Command::new(program)
            .args(args)
            .env("TRAIN_ENABLED", "1")
            .env(RUN_ID_ENV, run_id.to_string())
            .env("WARDEN_LEARNING_RATE", learning_rate.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Launch(format!("{program}: {e}")))
    }
}

fn on_path(program: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| is_file(&dir.join(program))))
        .unwrap_or(false)
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}
