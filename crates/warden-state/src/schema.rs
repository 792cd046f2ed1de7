//! Row definitions for the Warden SurrealDB tables
//!
//! Tables:
//! - training_runs: one row per supervised run
//! - training_steps: append-only step log, unique on (run_id, step)
//! - proposals: proposal state machine rows
//! - votes: one row per vote, unique on (proposal_id, voter_id, phase)
//! - consensus_results: immutable phase results
//! - consensus_history: one row per resolved proposal
//!
//! Rows use plain strings for IDs and enum tags; conversion to the
//! `storage_traits` types happens in `surreal_store`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::*;

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde::Serialize::serialize(&date.map(SurrealDatetime::from), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

fn unknown(kind: &str, value: &str) -> StorageError {
    StorageError::Backend(format!("unknown {kind}: {value}"))
}

fn parse_uuid(value: &str) -> StorageResult<uuid::Uuid> {
    uuid::Uuid::parse_str(value).map_err(|e| StorageError::Backend(format!("bad uuid {value}: {e}")))
}

// ---------------------------------------------------------------------------
// training_runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub run_id: String,
    pub agent_id: String,
    pub status: String,
    pub learning_rate: f64,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime_opt")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&TrainingRunRecord> for RunRow {
    fn from(run: &TrainingRunRecord) -> Self {
        Self {
            id: None,
            run_id: run.run_id.to_string(),
            agent_id: run.agent_id.clone(),
            status: run.status.as_str().to_string(),
            learning_rate: run.learning_rate,
            created_at: run.created_at,
            finished_at: run.finished_at,
        }
    }
}

impl RunRow {
    pub fn into_record(self) -> StorageResult<TrainingRunRecord> {
        Ok(TrainingRunRecord {
            run_id: parse_uuid(&self.run_id)?,
            status: RunStatus::parse(&self.status)
                .ok_or_else(|| unknown("run status", &self.status))?,
            agent_id: self.agent_id,
            learning_rate: self.learning_rate,
            created_at: self.created_at,
            finished_at: self.finished_at,
        })
    }
}

// ---------------------------------------------------------------------------
// training_steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub run_id: String,
    pub step: u64,
    pub loss: f64,
    pub elapsed_ms: u64,
    pub schema_version: u32,
    /// Parameter map encoded as a JSON string.
    pub params: String,
    #[serde(with = "surreal_datetime")]
    pub recorded_at: DateTime<Utc>,
}

impl StepRow {
    pub fn from_record(step: &TrainingStepRecord) -> StorageResult<Self> {
        Ok(Self {
            id: None,
            run_id: step.run_id.to_string(),
            step: step.step,
            loss: step.loss,
            elapsed_ms: step.elapsed_ms,
            schema_version: step.params.schema_version,
            params: serde_json::to_string(&step.params.values)?,
            recorded_at: step.recorded_at,
        })
    }

    pub fn into_record(self) -> StorageResult<TrainingStepRecord> {
        Ok(TrainingStepRecord {
            run_id: parse_uuid(&self.run_id)?,
            step: self.step,
            loss: self.loss,
            elapsed_ms: self.elapsed_ms,
            params: StepParams {
                schema_version: self.schema_version,
                values: serde_json::from_str(&self.params)?,
            },
            recorded_at: self.recorded_at,
        })
    }
}

// ---------------------------------------------------------------------------
// proposals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub proposal_id: String,
    pub title: String,
    pub description: String,
    pub status: String,
    /// `manual` or `automatic`
    pub origin: String,
    pub origin_run_id: Option<String>,
    pub category: String,
    pub diff: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime_opt")]
    pub phase_started_at: Option<DateTime<Utc>>,
}

impl From<&ProposalRecord> for ProposalRow {
    fn from(p: &ProposalRecord) -> Self {
        let (origin, origin_run_id) = match p.origin {
            ProposalOrigin::Manual => ("manual", None),
            ProposalOrigin::Automatic { run_id } => ("automatic", Some(run_id.to_string())),
        };
        Self {
            id: None,
            proposal_id: p.proposal_id.to_string(),
            title: p.title.clone(),
            description: p.description.clone(),
            status: p.status.as_str().to_string(),
            origin: origin.to_string(),
            origin_run_id,
            category: p.category.clone(),
            diff: p.diff.clone(),
            created_at: p.created_at,
            updated_at: p.updated_at,
            phase_started_at: p.phase_started_at,
        }
    }
}

impl ProposalRow {
    pub fn into_record(self) -> StorageResult<ProposalRecord> {
        let origin = match (self.origin.as_str(), self.origin_run_id.as_deref()) {
            ("manual", _) => ProposalOrigin::Manual,
            ("automatic", Some(run_id)) => ProposalOrigin::Automatic {
                run_id: parse_uuid(run_id)?,
            },
            (other, _) => return Err(unknown("proposal origin", other)),
        };
        Ok(ProposalRecord {
            proposal_id: parse_uuid(&self.proposal_id)?,
            status: ProposalStatus::parse(&self.status)
                .ok_or_else(|| unknown("proposal status", &self.status))?,
            title: self.title,
            description: self.description,
            origin,
            category: self.category,
            diff: self.diff,
            created_at: self.created_at,
            updated_at: self.updated_at,
            phase_started_at: self.phase_started_at,
        })
    }
}

// ---------------------------------------------------------------------------
// votes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub proposal_id: String,
    pub voter_id: String,
    pub role: String,
    pub phase: String,
    pub approve: bool,
    pub rationale: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub cast_at: DateTime<Utc>,
}

impl From<&VoteRecord> for VoteRow {
    fn from(v: &VoteRecord) -> Self {
        Self {
            id: None,
            proposal_id: v.proposal_id.to_string(),
            voter_id: v.voter_id.clone(),
            role: v.role.as_str().to_string(),
            phase: v.phase().as_str().to_string(),
            approve: v.approve,
            rationale: v.rationale.clone(),
            cast_at: v.cast_at,
        }
    }
}

impl VoteRow {
    pub fn into_record(self) -> StorageResult<VoteRecord> {
        Ok(VoteRecord {
            proposal_id: parse_uuid(&self.proposal_id)?,
            role: VoterRole::parse(&self.role).ok_or_else(|| unknown("voter role", &self.role))?,
            voter_id: self.voter_id,
            approve: self.approve,
            rationale: self.rationale,
            cast_at: self.cast_at,
        })
    }
}

// ---------------------------------------------------------------------------
// consensus_results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub result_id: String,
    pub proposal_id: String,
    pub phase: String,
    pub outcome: String,
    pub resulting_status: String,
    #[serde(with = "surreal_datetime")]
    pub decided_at: DateTime<Utc>,
    /// Vote snapshot of the resolved phase.
    pub votes: serde_json::Value,
    pub approval_rate: f64,
    pub quorum_reached: bool,
    pub thresholds: serde_json::Value,
}

impl ResultRow {
    pub fn from_record(r: &ConsensusResultRecord) -> StorageResult<Self> {
        Ok(Self {
            id: None,
            result_id: r.result_id.to_string(),
            proposal_id: r.proposal_id.to_string(),
            phase: r.phase.as_str().to_string(),
            outcome: r.outcome.as_str().to_string(),
            resulting_status: r.resulting_status.as_str().to_string(),
            decided_at: r.decided_at,
            votes: serde_json::to_value(&r.votes)?,
            approval_rate: r.approval_rate,
            quorum_reached: r.quorum_reached,
            thresholds: serde_json::to_value(r.thresholds)?,
        })
    }

    pub fn into_record(self) -> StorageResult<ConsensusResultRecord> {
        Ok(ConsensusResultRecord {
            result_id: parse_uuid(&self.result_id)?,
            proposal_id: parse_uuid(&self.proposal_id)?,
            phase: VotingPhase::parse(&self.phase)
                .ok_or_else(|| unknown("voting phase", &self.phase))?,
            outcome: ConsensusOutcome::parse(&self.outcome)
                .ok_or_else(|| unknown("consensus outcome", &self.outcome))?,
            resulting_status: ProposalStatus::parse(&self.resulting_status)
                .ok_or_else(|| unknown("proposal status", &self.resulting_status))?,
            decided_at: self.decided_at,
            votes: serde_json::from_value(self.votes)?,
            approval_rate: self.approval_rate,
            quorum_reached: self.quorum_reached,
            thresholds: serde_json::from_value(self.thresholds)?,
        })
    }
}

// ---------------------------------------------------------------------------
// consensus_history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub proposal_id: String,
    pub title: String,
    pub final_status: String,
    pub outcome: String,
    #[serde(with = "surreal_datetime")]
    pub resolved_at: DateTime<Utc>,
    pub results: serde_json::Value,
    pub executions: serde_json::Value,
}

impl HistoryRow {
    pub fn from_entry(e: &ConsensusHistoryEntry) -> StorageResult<Self> {
        Ok(Self {
            id: None,
            proposal_id: e.proposal_id.to_string(),
            title: e.title.clone(),
            final_status: e.final_status.as_str().to_string(),
            outcome: e.outcome.as_str().to_string(),
            resolved_at: e.resolved_at,
            results: serde_json::to_value(&e.results)?,
            executions: serde_json::to_value(&e.executions)?,
        })
    }

    pub fn into_entry(self) -> StorageResult<ConsensusHistoryEntry> {
        Ok(ConsensusHistoryEntry {
            proposal_id: parse_uuid(&self.proposal_id)?,
            title: self.title,
            final_status: ProposalStatus::parse(&self.final_status)
                .ok_or_else(|| unknown("proposal status", &self.final_status))?,
            outcome: ConsensusOutcome::parse(&self.outcome)
                .ok_or_else(|| unknown("consensus outcome", &self.outcome))?,
            resolved_at: self.resolved_at,
            results: serde_json::from_value(self.results)?,
            executions: serde_json::from_value(self.executions)?,
        })
    }
}
