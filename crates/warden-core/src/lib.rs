//! Warden Core Library
//!
//! Supervises one training worker, evaluates its loss over a sliding window,
//! and routes every resulting proposal through two-phase voting.
//!
//! ```text
//! TrainingSupervisor -> StepStore -> ConsensusEvaluator -> VotingEngine -> history
//! ```

pub mod config;
pub mod domain;
pub mod evaluator;
pub mod evidence;
pub mod locks;
pub mod obs;
pub mod supervisor;
pub mod telemetry;
pub mod voting;

pub use config::{ConfigError, GuardScope, WardenConfig};
pub use domain::{
    parse_worker_line, Result, StepReport, SupervisorError, VotingError, WardenError,
    WorkerMessage,
};
pub use evaluator::{
    analyze_window, improvement, next_learning_rate, spawn_evaluation_worker,
    spawn_human_veto_listener, ConsensusEvaluator, Decision, EvaluationOutcome, ProposalAction, RetrainDirective, WindowAnalysis,
};
pub use evidence::{
    EvidenceError, EvidenceKind, EvidenceReceipt, EvidenceSink, FsEvidenceWriter, MemoryEvidence,
    NullEvidence, VerifyReport,
};
pub use locks::KeyedLocks;
pub use supervisor::{
    CommandLauncher, EvaluationRequest, PidFileProbe, ProcessProbe, StartOutcome, StopOutcome,
    SupervisorDeps, SupervisorStatus, TrainingControl, TrainingSupervisor, WorkerLauncher,
    RUN_ID_ENV,
};
pub use telemetry::init_tracing;
pub use voting::{
    spawn_auto_executor, spawn_expiration_sweeper, CommandExecutor, ConsensusStatistics,
    ExecutionCollaborator, ExecutionReport, FinalStatus, FinalizationEvent, NewProposal,
    NoopExecutor, VoteOutcome, VotingEngine, VotingPolicy,
};

/// Warden version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
