//! In-memory fakes for storage traits (testing only)
//!
//! `MemoryGovernanceStore` satisfies `RunStore`, `StepStore`, `ProposalStore`
//! and `ConsensusLedger` without any external dependencies. Steps, proposals
//! and history entries each sit behind their own lock; the outer maps are
//! only locked long enough to look an entity up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::StorageError;
use crate::storage_traits::*;

/// Insertion-ordered map of independently locked entities.
#[derive(Debug)]
struct Keyed<T> {
    entries: HashMap<Uuid, Arc<Mutex<T>>>,
    order: Vec<Uuid>,
}

impl<T> Default for Keyed<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }
}

impl<T> Keyed<T> {
    fn get(&self, id: &Uuid) -> Option<Arc<Mutex<T>>> {
        self.entries.get(id).cloned()
    }

    fn insert(&mut self, id: Uuid, value: T) -> Arc<Mutex<T>> {
        let slot = Arc::new(Mutex::new(value));
        self.entries.insert(id, slot.clone());
        self.order.push(id);
        slot
    }

    fn ordered(&self) -> Vec<Arc<Mutex<T>>> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).cloned())
            .collect()
    }
}

#[derive(Debug)]
struct ProposalState {
    record: ProposalRecord,
    votes: Vec<VoteRecord>,
}

// ---------------------------------------------------------------------------
// MemoryGovernanceStore
// ---------------------------------------------------------------------------

/// In-memory backend for every governance storage trait.
#[derive(Debug, Default)]
pub struct MemoryGovernanceStore {
    runs: Mutex<Keyed<TrainingRunRecord>>,
    steps: Mutex<HashMap<Uuid, Arc<Mutex<Vec<TrainingStepRecord>>>>>,
    proposals: Mutex<Keyed<ProposalState>>,
    results: Mutex<Vec<ConsensusResultRecord>>,
    history: Mutex<Keyed<ConsensusHistoryEntry>>,
}

impl MemoryGovernanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn run_slot(&self, run_id: Uuid) -> StorageResult<Arc<Mutex<TrainingRunRecord>>> {
        self.runs
            .lock()
            .unwrap()
            .get(&run_id)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    fn proposal_slot(&self, proposal_id: Uuid) -> StorageResult<Arc<Mutex<ProposalState>>> {
        self.proposals
            .lock()
            .unwrap()
            .get(&proposal_id)
            .ok_or_else(|| StorageError::ProposalNotFound {
                proposal_id: proposal_id.to_string(),
            })
    }

    fn step_log(&self, run_id: Uuid) -> Arc<Mutex<Vec<TrainingStepRecord>>> {
        self.steps
            .lock()
            .unwrap()
            .entry(run_id)
            .or_default()
            .clone()
    }
}

#[async_trait]
impl RunStore for MemoryGovernanceStore {
    async fn create_run(&self, run: TrainingRunRecord) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        if runs.entries.contains_key(&run.run_id) {
            return Err(StorageError::Backend(format!(
                "training run already exists: {}",
                run.run_id
            )));
        }
        runs.insert(run.run_id, run);
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> StorageResult<TrainingRunRecord> {
        let slot = self.run_slot(run_id)?;
        let run = slot.lock().unwrap().clone();
        Ok(run)
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
    ) -> StorageResult<TrainingRunRecord> {
        let slot = self.run_slot(run_id)?;
        let mut run = slot.lock().unwrap();
        if run.status != RunStatus::Running || !status.is_terminal() {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.to_string(),
                status: run.status.to_string(),
                expected: RunStatus::Running.to_string(),
            });
        }
        run.status = status;
        run.finished_at = Some(Utc::now());
        Ok(run.clone())
    }

    async fn list_runs(&self, filter: RunFilter) -> StorageResult<Vec<TrainingRunRecord>> {
        let slots = self.runs.lock().unwrap().ordered();
        Ok(slots
            .iter()
            .map(|s| s.lock().unwrap().clone())
            .filter(|r| filter.matches(r))
            .collect())
    }
}

#[async_trait]
impl StepStore for MemoryGovernanceStore {
    async fn append_step(&self, step: TrainingStepRecord) -> StorageResult<()> {
        let log = self.step_log(step.run_id);
        let mut log = log.lock().unwrap();
        if let Some(last) = log.last() {
            if step.step <= last.step {
                return Err(StorageError::StepOutOfOrder {
                    run_id: step.run_id.to_string(),
                    step: step.step,
                    last: last.step,
                });
            }
        }
        log.push(step);
        Ok(())
    }

    async fn latest_steps(
        &self,
        run_id: Uuid,
        limit: usize,
    ) -> StorageResult<Vec<TrainingStepRecord>> {
        let log = self.step_log(run_id);
        let log = log.lock().unwrap();
        let skip = log.len().saturating_sub(limit);
        Ok(log[skip..].to_vec())
    }

    async fn count_steps(&self, run_id: Uuid) -> StorageResult<u64> {
        let log = self.step_log(run_id);
        let count = log.lock().unwrap().len() as u64;
        Ok(count)
    }

    async fn latest_step(&self) -> StorageResult<Option<TrainingStepRecord>> {
        let logs: Vec<_> = self.steps.lock().unwrap().values().cloned().collect();
        Ok(logs
            .iter()
            .filter_map(|log| log.lock().unwrap().last().cloned())
            .max_by_key(|s| s.recorded_at))
    }
}

#[async_trait]
impl ProposalStore for MemoryGovernanceStore {
    async fn insert_proposal(&self, proposal: ProposalRecord) -> StorageResult<()> {
        let mut proposals = self.proposals.lock().unwrap();
        if proposals.entries.contains_key(&proposal.proposal_id) {
            return Err(StorageError::DuplicateProposal {
                proposal_id: proposal.proposal_id.to_string(),
            });
        }
        proposals.insert(
            proposal.proposal_id,
            ProposalState {
                record: proposal,
                votes: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_proposal(&self, proposal_id: Uuid) -> StorageResult<ProposalRecord> {
        let slot = self.proposal_slot(proposal_id)?;
        let record = slot.lock().unwrap().record.clone();
        Ok(record)
    }

    async fn update_proposal(&self, proposal: ProposalRecord) -> StorageResult<()> {
        let slot = self.proposal_slot(proposal.proposal_id)?;
        let mut state = slot.lock().unwrap();
        let stored = state.record.status;
        if !stored.can_update_to(proposal.status) {
            return Err(StorageError::InvalidProposalTransition {
                proposal_id: proposal.proposal_id.to_string(),
                from: stored.to_string(),
                to: proposal.status.to_string(),
            });
        }
        state.record = proposal;
        Ok(())
    }

    async fn list_proposals(&self, filter: ProposalFilter) -> StorageResult<Vec<ProposalRecord>> {
        let slots = self.proposals.lock().unwrap().ordered();
        Ok(slots
            .iter()
            .map(|s| s.lock().unwrap().record.clone())
            .filter(|p| filter.matches(p))
            .collect())
    }

    async fn append_vote(&self, vote: VoteRecord) -> StorageResult<()> {
        let slot = self.proposal_slot(vote.proposal_id)?;
        let mut state = slot.lock().unwrap();
        let phase = vote.phase();
        if state
            .votes
            .iter()
            .any(|v| v.voter_id == vote.voter_id && v.phase() == phase)
        {
            return Err(StorageError::DuplicateVote {
                proposal_id: vote.proposal_id.to_string(),
                voter_id: vote.voter_id,
                phase: phase.to_string(),
            });
        }
        state.votes.push(vote);
        Ok(())
    }

    async fn list_votes(
        &self,
        proposal_id: Uuid,
        phase: VotingPhase,
    ) -> StorageResult<Vec<VoteRecord>> {
        let slot = self.proposal_slot(proposal_id)?;
        let state = slot.lock().unwrap();
        Ok(state
            .votes
            .iter()
            .filter(|v| v.phase() == phase)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ConsensusLedger for MemoryGovernanceStore {
    async fn append_result(&self, result: ConsensusResultRecord) -> StorageResult<()> {
        self.results.lock().unwrap().push(result);
        Ok(())
    }

    async fn list_results(&self, proposal_id: Uuid) -> StorageResult<Vec<ConsensusResultRecord>> {
        let results = self.results.lock().unwrap();
        Ok(results
            .iter()
            .filter(|r| r.proposal_id == proposal_id)
            .cloned()
            .collect())
    }

    async fn all_results(&self) -> StorageResult<Vec<ConsensusResultRecord>> {
        Ok(self.results.lock().unwrap().clone())
    }

    async fn append_history(&self, entry: ConsensusHistoryEntry) -> StorageResult<()> {
        let mut history = self.history.lock().unwrap();
        if history.entries.contains_key(&entry.proposal_id) {
            return Err(StorageError::DuplicateHistory {
                proposal_id: entry.proposal_id.to_string(),
            });
        }
        history.insert(entry.proposal_id, entry);
        Ok(())
    }

    async fn record_execution(
        &self,
        proposal_id: Uuid,
        execution: ExecutionRecord,
    ) -> StorageResult<ConsensusHistoryEntry> {
        let slot = self
            .history
            .lock()
            .unwrap()
            .get(&proposal_id)
            .ok_or_else(|| StorageError::HistoryNotFound {
                proposal_id: proposal_id.to_string(),
            })?;
        let mut entry = slot.lock().unwrap();
        entry.executions.push(execution);
        Ok(entry.clone())
    }

    async fn get_history(&self, proposal_id: Uuid) -> StorageResult<Option<ConsensusHistoryEntry>> {
        let slot = self.history.lock().unwrap().get(&proposal_id);
        Ok(slot.map(|s| s.lock().unwrap().clone()))
    }

    async fn list_history(&self) -> StorageResult<Vec<ConsensusHistoryEntry>> {
        let slots = self.history.lock().unwrap().ordered();
        Ok(slots.iter().map(|s| s.lock().unwrap().clone()).collect())
    }
}
