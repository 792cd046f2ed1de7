//! SurrealDB-backed implementation of every governance storage trait
//!
//! Uses the rows in `schema` for persistence, converting to/from
//! `storage_traits` types at the boundary. Ordering and uniqueness rules are
//! checked before each write and backed by the unique indexes from
//! `migrations`, so a racing writer surfaces as the same constraint error.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::schema::{HistoryRow, ProposalRow, ResultRow, RunRow, StepRow, VoteRow};
use crate::storage_traits::*;

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Unique index rejections read "Database index `idx_...` already contains ...".
fn is_index_conflict(e: &surrealdb::Error) -> bool {
    e.to_string().contains("already contains")
}

#[derive(Debug, Deserialize)]
struct CountRow {
    n: u64,
}

/// SurrealDB-backed [`RunStore`], [`StepStore`], [`ProposalStore`] and
/// [`ConsensusLedger`].
#[derive(Clone)]
pub struct SurrealGovernanceStore {
    db: Surreal<Any>,
}

impl SurrealGovernanceStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `warden/main`, and runs `init_schema`.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect("mem://", "warden", "main").await
    }

    /// Connect to `url` (`mem://`, `surrealkv://path`, `ws://host`) and
    /// initialize the schema.
    pub async fn connect(url: &str, namespace: &str, database: &str) -> crate::Result<Self> {
        if let Some(path) = url.strip_prefix("surrealkv://") {
            std::fs::create_dir_all(path).map_err(|e| {
                StateError::Connection(format!(
                    "Failed to create database directory {}: {}",
                    path, e
                ))
            })?;
        }

        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns(namespace)
            .use_db(database)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;

        info!(url, namespace, database, "SurrealGovernanceStore connected");
        Ok(Self { db })
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_run(&self, run_id: Uuid) -> StorageResult<RunRow> {
        let mut res = self
            .db
            .query("SELECT * FROM training_runs WHERE run_id = $rid")
            .bind(("rid", run_id.to_string()))
            .await
            .map_err(backend)?;

        let rows: Vec<RunRow> = res.take(0).map_err(backend)?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    async fn fetch_proposal(&self, proposal_id: Uuid) -> StorageResult<ProposalRow> {
        let mut res = self
            .db
            .query("SELECT * FROM proposals WHERE proposal_id = $pid")
            .bind(("pid", proposal_id.to_string()))
            .await
            .map_err(backend)?;

        let rows: Vec<ProposalRow> = res.take(0).map_err(backend)?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::ProposalNotFound {
                proposal_id: proposal_id.to_string(),
            })
    }

    async fn fetch_history(&self, proposal_id: Uuid) -> StorageResult<Option<HistoryRow>> {
        let mut res = self
            .db
            .query("SELECT * FROM consensus_history WHERE proposal_id = $pid")
            .bind(("pid", proposal_id.to_string()))
            .await
            .map_err(backend)?;

        let rows: Vec<HistoryRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().next())
    }

    async fn last_step_index(&self, run_id: Uuid) -> StorageResult<Option<u64>> {
        let mut res = self
            .db
            .query("SELECT * FROM training_steps WHERE run_id = $rid ORDER BY step DESC LIMIT 1")
            .bind(("rid", run_id.to_string()))
            .await
            .map_err(backend)?;

        let rows: Vec<StepRow> = res.take(0).map_err(backend)?;
        Ok(rows.first().map(|r| r.step))
    }

    async fn vote_exists(&self, vote: &VoteRecord) -> StorageResult<bool> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM votes WHERE proposal_id = $pid AND voter_id = $voter AND phase = $phase",
            )
            .bind(("pid", vote.proposal_id.to_string()))
            .bind(("voter", vote.voter_id.clone()))
            .bind(("phase", vote.phase().as_str().to_string()))
            .await
            .map_err(backend)?;

        let rows: Vec<VoteRow> = res.take(0).map_err(backend)?;
        Ok(!rows.is_empty())
    }
}

#[async_trait]
impl RunStore for SurrealGovernanceStore {
    async fn create_run(&self, run: TrainingRunRecord) -> StorageResult<()> {
        debug!(run_id = %run.run_id, agent_id = %run.agent_id, "creating training run");

        let _created: Option<RunRow> = self
            .db
            .create("training_runs")
            .content(RunRow::from(&run))
            .await
            .map_err(backend)?;

        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> StorageResult<TrainingRunRecord> {
        self.fetch_run(run_id).await?.into_record()
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
    ) -> StorageResult<TrainingRunRecord> {
        if !status.is_terminal() {
            let current = self.fetch_run(run_id).await?;
            return Err(StorageError::InvalidRunState {
                run_id: run_id.to_string(),
                status: current.status,
                expected: RunStatus::Running.to_string(),
            });
        }

        // Conditional on the row still being running, so two finishers
        // cannot both win.
        let mut res = self
            .db
            .query(
                "UPDATE training_runs SET status = $status, finished_at = $finished \
                 WHERE run_id = $rid AND status = 'running' RETURN AFTER",
            )
            .bind(("status", status.as_str().to_string()))
            .bind(("finished", surrealdb::sql::Datetime::from(Utc::now())))
            .bind(("rid", run_id.to_string()))
            .await
            .map_err(backend)?;

        let rows: Vec<RunRow> = res.take(0).map_err(backend)?;
        match rows.into_iter().next() {
            Some(row) => row.into_record(),
            None => {
                let current = self.fetch_run(run_id).await?;
                Err(StorageError::InvalidRunState {
                    run_id: run_id.to_string(),
                    status: current.status,
                    expected: RunStatus::Running.to_string(),
                })
            }
        }
    }

    async fn list_runs(&self, filter: RunFilter) -> StorageResult<Vec<TrainingRunRecord>> {
        let mut clauses = Vec::new();
        if filter.agent_id.is_some() {
            clauses.push("agent_id = $agent");
        }
        if filter.status.is_some() {
            clauses.push("status = $status");
        }
        let mut sql = String::from("SELECT * FROM training_runs");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at ASC");

        let mut query = self.db.query(sql);
        if let Some(agent) = filter.agent_id {
            query = query.bind(("agent", agent));
        }
        if let Some(status) = filter.status {
            query = query.bind(("status", status.as_str().to_string()));
        }

        let mut res = query.await.map_err(backend)?;
        let rows: Vec<RunRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(RunRow::into_record).collect()
    }
}

#[async_trait]
impl StepStore for SurrealGovernanceStore {
    async fn append_step(&self, step: TrainingStepRecord) -> StorageResult<()> {
        let out_of_order = |last: u64| StorageError::StepOutOfOrder {
            run_id: step.run_id.to_string(),
            step: step.step,
            last,
        };

        if let Some(last) = self.last_step_index(step.run_id).await? {
            if step.step <= last {
                return Err(out_of_order(last));
            }
        }

        let row = StepRow::from_record(&step)?;
        let created: Result<Option<StepRow>, _> =
            self.db.create("training_steps").content(row).await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if is_index_conflict(&e) => {
                let last = self.last_step_index(step.run_id).await?.unwrap_or(step.step);
                Err(out_of_order(last))
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn latest_steps(
        &self,
        run_id: Uuid,
        limit: usize,
    ) -> StorageResult<Vec<TrainingStepRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM training_steps WHERE run_id = $rid ORDER BY step DESC LIMIT {limit}"
        );
        let mut res = self
            .db
            .query(sql)
            .bind(("rid", run_id.to_string()))
            .await
            .map_err(backend)?;

        let rows: Vec<StepRow> = res.take(0).map_err(backend)?;
        let mut steps = rows
            .into_iter()
            .map(StepRow::into_record)
            .collect::<StorageResult<Vec<_>>>()?;
        steps.reverse();
        Ok(steps)
    }

    async fn count_steps(&self, run_id: Uuid) -> StorageResult<u64> {
        let mut res = self
            .db
            .query("SELECT count() AS n FROM training_steps WHERE run_id = $rid GROUP ALL")
            .bind(("rid", run_id.to_string()))
            .await
            .map_err(backend)?;

        let rows: Vec<CountRow> = res.take(0).map_err(backend)?;
        Ok(rows.first().map_or(0, |r| r.n))
    }

    async fn latest_step(&self) -> StorageResult<Option<TrainingStepRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM training_steps ORDER BY recorded_at DESC LIMIT 1")
            .await
            .map_err(backend)?;

        let rows: Vec<StepRow> = res.take(0).map_err(backend)?;
        rows.into_iter().next().map(StepRow::into_record).transpose()
    }
}

#[async_trait]
impl ProposalStore for SurrealGovernanceStore {
    async fn insert_proposal(&self, proposal: ProposalRecord) -> StorageResult<()> {
        let duplicate = || StorageError::DuplicateProposal {
            proposal_id: proposal.proposal_id.to_string(),
        };

        match self.fetch_proposal(proposal.proposal_id).await {
            Ok(_) => return Err(duplicate()),
            Err(StorageError::ProposalNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let created: Result<Option<ProposalRow>, _> = self
            .db
            .create("proposals")
            .content(ProposalRow::from(&proposal))
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if is_index_conflict(&e) => Err(duplicate()),
            Err(e) => Err(backend(e)),
        }
    }

    async fn get_proposal(&self, proposal_id: Uuid) -> StorageResult<ProposalRecord> {
        self.fetch_proposal(proposal_id).await?.into_record()
    }

    async fn update_proposal(&self, proposal: ProposalRecord) -> StorageResult<()> {
        let existing = self.fetch_proposal(proposal.proposal_id).await?;
        let stored = existing.status.clone();
        let rejected = |from: String| StorageError::InvalidProposalTransition {
            proposal_id: proposal.proposal_id.to_string(),
            from,
            to: proposal.status.to_string(),
        };
        let allowed = ProposalStatus::parse(&stored)
            .is_some_and(|current| current.can_update_to(proposal.status));
        if !allowed {
            return Err(rejected(stored));
        }

        let mut row = ProposalRow::from(&proposal);
        row.id = existing.id;

        // Conditional on the status read above, so a concurrent transition
        // makes this write miss instead of overwriting it.
        let mut res = self
            .db
            .query(
                "UPDATE proposals CONTENT $row \
                 WHERE proposal_id = $pid AND status = $expected RETURN AFTER",
            )
            .bind(("row", row))
            .bind(("pid", proposal.proposal_id.to_string()))
            .bind(("expected", stored))
            .await
            .map_err(backend)?;

        let rows: Vec<ProposalRow> = res.take(0).map_err(backend)?;
        if rows.is_empty() {
            let current = self.fetch_proposal(proposal.proposal_id).await?;
            return Err(rejected(current.status));
        }
        Ok(())
    }

    async fn list_proposals(&self, filter: ProposalFilter) -> StorageResult<Vec<ProposalRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM proposals ORDER BY created_at ASC")
            .await
            .map_err(backend)?;

        let rows: Vec<ProposalRow> = res.take(0).map_err(backend)?;
        let mut out = Vec::new();
        for row in rows {
            let record = row.into_record()?;
            if filter.matches(&record) {
                out.push(record);
            }
        }
        Ok(out)
    }

    async fn append_vote(&self, vote: VoteRecord) -> StorageResult<()> {
        let duplicate = || StorageError::DuplicateVote {
            proposal_id: vote.proposal_id.to_string(),
            voter_id: vote.voter_id.clone(),
            phase: vote.phase().to_string(),
        };

        self.fetch_proposal(vote.proposal_id).await?;
        if self.vote_exists(&vote).await? {
            return Err(duplicate());
        }

        let created: Result<Option<VoteRow>, _> =
            self.db.create("votes").content(VoteRow::from(&vote)).await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if is_index_conflict(&e) => Err(duplicate()),
            Err(e) => Err(backend(e)),
        }
    }

    async fn list_votes(
        &self,
        proposal_id: Uuid,
        phase: VotingPhase,
    ) -> StorageResult<Vec<VoteRecord>> {
        self.fetch_proposal(proposal_id).await?;

        let mut res = self
            .db
            .query("SELECT * FROM votes WHERE proposal_id = $pid AND phase = $phase ORDER BY cast_at ASC")
            .bind(("pid", proposal_id.to_string()))
            .bind(("phase", phase.as_str().to_string()))
            .await
            .map_err(backend)?;

        let rows: Vec<VoteRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(VoteRow::into_record).collect()
    }
}

#[async_trait]
impl ConsensusLedger for SurrealGovernanceStore {
    async fn append_result(&self, result: ConsensusResultRecord) -> StorageResult<()> {
        let _created: Option<ResultRow> = self
            .db
            .create("consensus_results")
            .content(ResultRow::from_record(&result)?)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn list_results(&self, proposal_id: Uuid) -> StorageResult<Vec<ConsensusResultRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM consensus_results WHERE proposal_id = $pid ORDER BY decided_at ASC")
            .bind(("pid", proposal_id.to_string()))
            .await
            .map_err(backend)?;

        let rows: Vec<ResultRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(ResultRow::into_record).collect()
    }

    async fn all_results(&self) -> StorageResult<Vec<ConsensusResultRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM consensus_results ORDER BY decided_at ASC")
            .await
            .map_err(backend)?;

        let rows: Vec<ResultRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(ResultRow::into_record).collect()
    }

    async fn append_history(&self, entry: ConsensusHistoryEntry) -> StorageResult<()> {
        let duplicate = || StorageError::DuplicateHistory {
            proposal_id: entry.proposal_id.to_string(),
        };

        if self.fetch_history(entry.proposal_id).await?.is_some() {
            return Err(duplicate());
        }

        let created: Result<Option<HistoryRow>, _> = self
            .db
            .create("consensus_history")
            .content(HistoryRow::from_entry(&entry)?)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if is_index_conflict(&e) => Err(duplicate()),
            Err(e) => Err(backend(e)),
        }
    }

    async fn record_execution(
        &self,
        proposal_id: Uuid,
        execution: ExecutionRecord,
    ) -> StorageResult<ConsensusHistoryEntry> {
        let row = self
            .fetch_history(proposal_id)
            .await?
            .ok_or_else(|| StorageError::HistoryNotFound {
                proposal_id: proposal_id.to_string(),
            })?;

        let id = row.id.clone();
        let mut entry = row.into_entry()?;
        entry.executions.push(execution);

        let mut updated = HistoryRow::from_entry(&entry)?;
        updated.id = id;

        self.db
            .query("UPDATE consensus_history CONTENT $row WHERE proposal_id = $pid")
            .bind(("row", updated))
            .bind(("pid", proposal_id.to_string()))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;

        Ok(entry)
    }

    async fn get_history(&self, proposal_id: Uuid) -> StorageResult<Option<ConsensusHistoryEntry>> {
        self.fetch_history(proposal_id)
            .await?
            .map(HistoryRow::into_entry)
            .transpose()
    }

    async fn list_history(&self) -> StorageResult<Vec<ConsensusHistoryEntry>> {
        let mut res = self
            .db
            .query("SELECT * FROM consensus_history ORDER BY resolved_at ASC")
            .await
            .map_err(backend)?;

        let rows: Vec<HistoryRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(HistoryRow::into_entry).collect()
    }
}
