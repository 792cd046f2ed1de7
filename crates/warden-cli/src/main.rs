//! Warden CLI
//!
//! The `warden` command supervises a training worker and governs the
//! proposals raised about it.
//!
//! ## Commands
//!
//! - `serve`: run the supervisor, evaluator, and voting sweeper until interrupted
//! - `proposals`: list, inspect, add, vote on, and execute proposals
//! - `history`: show finalized proposals and their executions
//! - `verify-evidence`: re-hash evidence manifests
//! - `config`: print the effective or sample configuration

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn, Level};
use uuid::Uuid;

use warden_core::config::WardenConfig;
use warden_core::{
    init_tracing, spawn_auto_executor, spawn_evaluation_worker, spawn_expiration_sweeper,
    spawn_human_veto_listener, CommandExecutor, CommandLauncher, ConsensusEvaluator,
    EvidenceSink, ExecutionCollaborator, FsEvidenceWriter, NewProposal, NoopExecutor,
    PidFileProbe, SupervisorDeps, TrainingSupervisor, VoteOutcome, VotingEngine, VotingPolicy,
};
use warden_state::{ProposalFilter, ProposalStatus, SurrealGovernanceStore, VotingPhase};

#[derive(Parser)]
#[command(name = "warden")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Supervised training with two-phase consensus governance", long_about = None)]
struct Cli {
    /// Configuration file (default: ./warden.toml when present)
    #[arg(short, long, global = true, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Format of command results
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise training and govern proposals until Ctrl-C or SIGTERM
    Serve {
        /// Start a training run immediately
        #[arg(long)]
        start: bool,

        /// Learning rate of the initial run (implies --start)
        #[arg(long)]
        lr: Option<f64>,
    },

    /// Inspect and act on proposals
    Proposals {
        #[command(subcommand)]
        action: ProposalAction,
    },

    /// Show finalized proposals
    History {
        /// Only this proposal
        #[arg(long)]
        proposal: Option<Uuid>,
    },

    /// Re-hash the evidence manifest of one day, or of every day
    VerifyEvidence {
        /// Day to verify (YYYY-MM-DD, UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ProposalAction {
    /// List proposals, oldest first
    List {
        /// Only these statuses (repeatable)
        #[arg(long, value_parser = parse_status)]
        status: Vec<ProposalStatus>,

        /// Only this category
        #[arg(long)]
        category: Option<String>,
    },

    /// Show one proposal with its votes and phase results
    Show { id: Uuid },

    /// Submit a manual proposal
    Add {
        #[arg(long)]
        title: String,

        #[arg(long)]
        description: String,

        #[arg(long, default_value = "manual")]
        category: String,

        /// Change to apply if approved
        #[arg(long)]
        diff: Option<String>,
    },

    /// Cast a vote
    Vote {
        id: Uuid,

        #[arg(value_enum)]
        decision: VoteChoice,

        /// Voter identity
        #[arg(long)]
        voter: String,

        /// Vote in the human phase instead of the automated phase
        #[arg(long)]
        human: bool,

        #[arg(long)]
        rationale: Option<String>,
    },

    /// Execute an approved proposal
    Execute { id: Uuid },

    /// Expire proposals whose voting window elapsed
    Sweep,

    /// Aggregate counts and approval rates
    Stats,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum VoteChoice {
    Approve,
    Veto,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the defaults as a starting warden.toml
    Sample,
}

fn parse_status(s: &str) -> std::result::Result<ProposalStatus, String> {
    ProposalStatus::parse(s).ok_or_else(|| format!("unknown proposal status '{s}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = WardenConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        config.logging.level.parse().unwrap_or(Level::INFO)
    };
    init_tracing(cli.json || config.logging.json, level);

    let out = cli.format;
    match cli.command {
        Commands::Serve { start, lr } => cmd_serve(&config, start || lr.is_some(), lr).await,
        Commands::Proposals { action } => {
            let engine = open_engine(&config).await?;
            match action {
                ProposalAction::List { status, category } => {
                    cmd_proposals_list(&engine, status, category, out).await
                }
                ProposalAction::Show { id } => cmd_proposals_show(&engine, id, out).await,
                ProposalAction::Add {
                    title,
                    description,
                    category,
                    diff,
                } => {
                    let mut draft = NewProposal::manual(title, description).with_category(category);
                    if let Some(diff) = diff {
                        draft = draft.with_diff(diff);
                    }
                    cmd_proposals_add(&engine, draft, out).await
                }
                ProposalAction::Vote {
                    id,
                    decision,
                    voter,
                    human,
                    rationale,
                } => {
                    let approve = decision == VoteChoice::Approve;
                    cmd_proposals_vote(&engine, id, &voter, approve, human, rationale, out).await
                }
                ProposalAction::Execute { id } => {
                    let executor = executor_for(&config);
                    cmd_proposals_execute(&engine, id, executor.as_ref(), out).await
                }
                ProposalAction::Sweep => cmd_proposals_sweep(&engine, out).await,
                ProposalAction::Stats => cmd_proposals_stats(&engine, out).await,
            }
        }
        Commands::History { proposal } => {
            let engine = open_engine(&config).await?;
            cmd_history(&engine, proposal, out).await
        }
        Commands::VerifyEvidence { date } => cmd_verify_evidence(&config, date, out),
        Commands::Config { action } => cmd_config(&config, action),
    }
}

// -- wiring -------------------------------------------------------------------

async fn open_store(config: &WardenConfig) -> Result<Arc<SurrealGovernanceStore>> {
    let s = &config.storage;
    let store = SurrealGovernanceStore::connect(&s.url, &s.namespace, &s.database)
        .await
        .with_context(|| format!("Failed to connect to Warden database at {}", s.url))?;
    Ok(Arc::new(store))
}

fn open_evidence(config: &WardenConfig) -> Result<Arc<FsEvidenceWriter>> {
    let writer = FsEvidenceWriter::new(&config.evidence.root).with_context(|| {
        format!(
            "Failed to open evidence root {}",
            config.evidence.root.display()
        )
    })?;
    Ok(Arc::new(writer))
}

async fn open_engine(config: &WardenConfig) -> Result<VotingEngine> {
    let store = open_store(config).await?;
    let evidence = open_evidence(config)?;
    Ok(VotingEngine::with_store(
        store,
        evidence,
        VotingPolicy::from_config(&config.voting),
    ))
}

fn executor_for(config: &WardenConfig) -> Arc<dyn ExecutionCollaborator> {
    match &config.voting.executor_command {
        Some(argv) => Arc::new(CommandExecutor::new(argv.clone())),
        None => Arc::new(NoopExecutor),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn short(id: Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

// -- serve --------------------------------------------------------------------

/// Run the governance loop until a shutdown signal arrives.
async fn cmd_serve(config: &WardenConfig, start: bool, lr: Option<f64>) -> Result<()> {
    let store = open_store(config).await?;
    let evidence: Arc<dyn EvidenceSink> = open_evidence(config)?;
    let voting = Arc::new(VotingEngine::with_store(
        store.clone(),
        evidence.clone(),
        VotingPolicy::from_config(&config.voting),
    ));

    let (eval_tx, eval_rx) = mpsc::channel(config.supervisor.eval_queue_capacity);
    let supervisor = TrainingSupervisor::new(
        &config.supervisor,
        SupervisorDeps {
            runs: store.clone(),
            steps: store.clone(),
            evidence: evidence.clone(),
            launcher: Arc::new(CommandLauncher::from_config(&config.supervisor)),
            probe: Arc::new(PidFileProbe::in_state_dir(&config.supervisor.state_dir)),
        },
        eval_tx,
    );

    let repaired = supervisor.reconcile().await;
    if !repaired.is_empty() {
        warn!(count = repaired.len(), "reconciled runs left running by a previous instance");
    }

    let evaluator = Arc::new(ConsensusEvaluator::new(
        config.evaluator.clone(),
        store.clone(),
        store.clone(),
        voting.clone(),
        evidence.clone(),
        Arc::new(supervisor.clone()),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let eval_worker = spawn_evaluation_worker(evaluator.clone(), eval_rx, shutdown_rx.clone());
    let mut tasks = vec![
        spawn_expiration_sweeper(
            voting.clone(),
            config.voting.sweep_interval(),
            shutdown_rx.clone(),
        ),
        spawn_human_veto_listener(evaluator, shutdown_rx.clone()),
    ];
    if config.voting.auto_execute {
        tasks.push(spawn_auto_executor(
            voting.clone(),
            executor_for(config),
            shutdown_rx.clone(),
        ));
    }

    if start {
        let outcome = supervisor.start(lr).await;
        match outcome.run_id {
            Some(run_id) => info!(%run_id, "training run started"),
            None => warn!("initial training run was not started"),
        }
    }
    info!(
        agent_id = supervisor.agent_id(),
        storage = %config.storage.url,
        "warden serving"
    );

    wait_for_shutdown().await?;
    info!("shutting down");

    // Evaluations and veto retrains can restart training, so they finish
    // before the worker is stopped.
    let _ = shutdown_tx.send(true);
    if let Err(e) = eval_worker.await {
        warn!(error = %e, "evaluation worker ended abnormally");
    }
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }

    let stopped = supervisor.stop().await;
    if let Some(run_id) = stopped.run_id {
        info!(%run_id, "training run stopped");
    }
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("Failed to listen for Ctrl-C")?,
        _ = term.recv() => {}
    }
    Ok(())
}

// -- proposals ----------------------------------------------------------------

async fn cmd_proposals_list(
    engine: &VotingEngine,
    statuses: Vec<ProposalStatus>,
    category: Option<String>,
    out: OutputFormat,
) -> Result<()> {
    let proposals = engine
        .list_proposals(ProposalFilter {
            statuses,
            category,
            ..ProposalFilter::default()
        })
        .await?;

    if out == OutputFormat::Json {
        return print_json(&proposals);
    }
    if proposals.is_empty() {
        println!("No proposals found.");
        return Ok(());
    }
    for p in proposals {
        println!(
            "{}  {:<15}  {:<10}  {}",
            short(p.proposal_id),
            p.status.as_str(),
            p.category,
            p.title
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct ProposalDetail {
    proposal: warden_state::ProposalRecord,
    automated_votes: Vec<warden_state::VoteRecord>,
    human_votes: Vec<warden_state::VoteRecord>,
    results: Vec<warden_state::ConsensusResultRecord>,
}

async fn cmd_proposals_show(engine: &VotingEngine, id: Uuid, out: OutputFormat) -> Result<()> {
    let detail = ProposalDetail {
        proposal: engine.get_proposal(id).await?,
        automated_votes: engine.votes(id, VotingPhase::AutomatedReview).await?,
        human_votes: engine.votes(id, VotingPhase::Human).await?,
        results: engine.results(id).await?,
    };

    if out == OutputFormat::Json {
        return print_json(&detail);
    }
    let p = &detail.proposal;
    println!("proposal {}", p.proposal_id);
    println!("Title:    {}", p.title);
    println!("Status:   {}", p.status.as_str());
    println!("Category: {}", p.category);
    println!("Created:  {}", p.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(diff) = &p.diff {
        println!("Diff:     {diff}");
    }
    println!();
    for line in p.description.lines() {
        println!("    {line}");
    }
    for vote in detail.automated_votes.iter().chain(&detail.human_votes) {
        println!(
            "vote  {:<10} {:<8} {}{}",
            vote.role.as_str(),
            vote.voter_id,
            if vote.approve { "approve" } else { "veto" },
            vote.rationale
                .as_deref()
                .map(|r| format!("  ({r})"))
                .unwrap_or_default()
        );
    }
    for result in &detail.results {
        println!(
            "result {:<18} rate {:.2}  -> {}",
            result.outcome.tag(),
            result.approval_rate,
            result.resulting_status.as_str()
        );
    }
    Ok(())
}

async fn cmd_proposals_add(
    engine: &VotingEngine,
    draft: NewProposal,
    out: OutputFormat,
) -> Result<()> {
    let proposal = engine.add_proposal(draft).await?;
    if out == OutputFormat::Json {
        return print_json(&proposal);
    }
    println!(
        "Added proposal {} ({})",
        proposal.proposal_id,
        proposal.status.as_str()
    );
    Ok(())
}

async fn cmd_proposals_vote(
    engine: &VotingEngine,
    id: Uuid,
    voter: &str,
    approve: bool,
    human: bool,
    rationale: Option<String>,
    out: OutputFormat,
) -> Result<()> {
    let outcome = if human {
        engine.submit_human_vote(id, voter, approve, rationale).await
    } else {
        engine.submit_automated_vote(id, voter, approve, rationale).await
    }
    .with_context(|| format!("Vote on proposal {id} rejected"))?;

    if out == OutputFormat::Json {
        return print_json(&outcome.result());
    }
    match outcome {
        VoteOutcome::Open => println!("Vote recorded; phase still open."),
        VoteOutcome::Resolved(result) => println!(
            "Vote recorded; phase resolved {} -> {}",
            result.outcome.tag(),
            result.resulting_status.as_str()
        ),
    }
    Ok(())
}

async fn cmd_proposals_execute(
    engine: &VotingEngine,
    id: Uuid,
    executor: &dyn ExecutionCollaborator,
    out: OutputFormat,
) -> Result<()> {
    let record = engine.execute_approved(id, executor).await?;
    if out == OutputFormat::Json {
        return print_json(&record);
    }
    if record.success {
        println!("Executed proposal {}", short(id));
        if let Some(output) = record.output.filter(|o| !o.is_empty()) {
            println!("{output}");
        }
        Ok(())
    } else {
        bail!(
            "Execution of proposal {} failed: {}",
            id,
            record.error.unwrap_or_default()
        )
    }
}

async fn cmd_proposals_sweep(engine: &VotingEngine, out: OutputFormat) -> Result<()> {
    let expired = engine.sweep_expired().await?;
    if out == OutputFormat::Json {
        return print_json(&expired);
    }
    println!("Expired {} proposal(s)", expired.len());
    for result in expired {
        println!("  {}", result.proposal_id);
    }
    Ok(())
}

async fn cmd_proposals_stats(engine: &VotingEngine, out: OutputFormat) -> Result<()> {
    let stats = engine.statistics().await?;
    if out == OutputFormat::Json {
        return print_json(&stats);
    }
    println!("Proposals:        {}", stats.total_proposals);
    println!("  open:           {}", stats.open_proposals);
    println!("  approved:       {}", stats.approved_proposals);
    println!("  vetoed:         {}", stats.vetoed_proposals);
    println!("  expired:        {}", stats.expired_proposals);
    println!("Approval rate:    {:.1}%", stats.approval_rate * 100.0);
    println!(
        "Automated rate:   {:.1}%",
        stats.average_automated_approval_rate * 100.0
    );
    Ok(())
}

// -- history ------------------------------------------------------------------

async fn cmd_history(engine: &VotingEngine, proposal: Option<Uuid>, out: OutputFormat) -> Result<()> {
    let entries = match proposal {
        Some(id) => match engine.history_entry(id).await? {
            Some(entry) => vec![entry],
            None => bail!("Proposal {id} has not been finalized"),
        },
        None => engine.history().await?,
    };

    if out == OutputFormat::Json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No finalized proposals.");
        return Ok(());
    }
    for entry in entries {
        println!("proposal {}", entry.proposal_id);
        println!("Title:     {}", entry.title);
        println!("Outcome:   {}", entry.outcome.tag());
        println!(
            "Finalized: {}",
            entry.resolved_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        for exec in &entry.executions {
            println!(
                "Executed:  {} ({})",
                exec.executed_at.format("%Y-%m-%d %H:%M:%S UTC"),
                if exec.success { "ok" } else { "failed" }
            );
        }
        println!();
    }
    Ok(())
}

// -- evidence -----------------------------------------------------------------

fn cmd_verify_evidence(config: &WardenConfig, date: Option<NaiveDate>, out: OutputFormat) -> Result<()> {
    let writer = FsEvidenceWriter::new(&config.evidence.root)?;
    let days = match date {
        Some(day) => vec![day],
        None => writer.days()?,
    };

    let mut reports = Vec::with_capacity(days.len());
    for day in days {
        let report = writer
            .verify_day(day)
            .with_context(|| format!("Failed to verify evidence for {day}"))?;
        reports.push((day, report));
    }

    let clean = reports.iter().all(|(_, r)| r.is_clean());
    if out == OutputFormat::Json {
        let value: Vec<_> = reports
            .iter()
            .map(|(day, report)| serde_json::json!({"date": day, "report": report}))
            .collect();
        print_json(&value)?;
    } else if reports.is_empty() {
        println!("No evidence under {}", config.evidence.root.display());
    } else {
        for (day, report) in &reports {
            println!(
                "{day}: {} ok, {} mismatched, {} missing",
                report.ok.len(),
                report.mismatched.len(),
                report.missing.len()
            );
            for path in &report.mismatched {
                println!("  MISMATCH {path}");
            }
            for path in &report.missing {
                println!("  MISSING  {path}");
            }
        }
    }

    if !clean {
        bail!("Evidence verification failed");
    }
    Ok(())
}

// -- config -------------------------------------------------------------------

fn cmd_config(config: &WardenConfig, action: ConfigAction) -> Result<()> {
    let rendered = match action {
        ConfigAction::Show => {
            toml::to_string_pretty(config).context("Failed to render configuration")?
        }
        ConfigAction::Sample => WardenConfig::sample_toml(),
    };
    print!("{rendered}");
    Ok(())
}
