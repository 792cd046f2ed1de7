//! SurrealDB schema migrations and initialization
//!
//! Unique indexes carry the storage invariants that must hold even with
//! several writers: one step index per run, one vote per voter and phase,
//! one history entry per proposal.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all Warden tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Warden SurrealDB schema");

    init_training_tables(db).await?;
    init_proposal_tables(db).await?;
    init_consensus_tables(db).await?;

    info!("Warden schema initialization complete");
    Ok(())
}

/// `training_runs` and `training_steps`
///
/// ```text
/// TABLE training_runs {
///   run_id:         STRING (unique)
///   agent_id:       STRING (indexed)
///   status:         STRING (running | completed | failed)
///   learning_rate:  FLOAT
///   created_at:     DATETIME
///   finished_at:    DATETIME?
/// }
///
/// TABLE training_steps {
///   run_id, step    (unique together)
///   loss, elapsed_ms, schema_version, params, recorded_at
/// }
/// ```
async fn init_training_tables(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing training tables");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS training_runs SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;
        DEFINE INDEX IF NOT EXISTS idx_run_id ON TABLE training_runs COLUMNS run_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_agent_status ON TABLE training_runs COLUMNS agent_id, status;

        DEFINE TABLE IF NOT EXISTS training_steps SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;
        DEFINE INDEX IF NOT EXISTS idx_run_step ON TABLE training_steps COLUMNS run_id, step UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_recorded_at ON TABLE training_steps COLUMNS recorded_at;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ training tables initialized");
    Ok(())
}

/// `proposals` and `votes`
///
/// Votes are unique on `(proposal_id, voter_id, phase)`.
async fn init_proposal_tables(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing proposal tables");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS proposals SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;
        DEFINE INDEX IF NOT EXISTS idx_proposal_id ON TABLE proposals COLUMNS proposal_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_proposal_status ON TABLE proposals COLUMNS status;
        DEFINE INDEX IF NOT EXISTS idx_origin_run ON TABLE proposals COLUMNS origin_run_id;

        DEFINE TABLE IF NOT EXISTS votes SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;
        DEFINE INDEX IF NOT EXISTS idx_vote_unique ON TABLE votes COLUMNS proposal_id, voter_id, phase UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_vote_proposal ON TABLE votes COLUMNS proposal_id;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ proposal tables initialized");
    Ok(())
}

/// `consensus_results` (append-only) and `consensus_history`
///
/// History is unique on `proposal_id`; only `executions` is ever updated.
async fn init_consensus_tables(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing consensus tables");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS consensus_results SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;
        DEFINE INDEX IF NOT EXISTS idx_result_id ON TABLE consensus_results COLUMNS result_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_result_proposal ON TABLE consensus_results COLUMNS proposal_id;

        DEFINE TABLE IF NOT EXISTS consensus_history SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;
        DEFINE INDEX IF NOT EXISTS idx_history_proposal ON TABLE consensus_history COLUMNS proposal_id UNIQUE;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ consensus tables initialized");
    Ok(())
}
