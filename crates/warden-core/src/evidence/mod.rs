//! Append-only, content-hashed evidence records.
//!
//! Every decision or measurement the governance loop makes can be written as
//! a JSON record under a dated directory, with its SHA-256 appended to that
//! day's manifest. Consumers only ever append.

pub mod fs;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use fs::FsEvidenceWriter;

/// Manifest file kept in each day directory.
pub const MANIFEST_FILE: &str = "file-hashes-complete.sha256";

/// Evidence category; also the sub-directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Training,
    Consensus,
    Directive,
    Voting,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Training => "training",
            Self::Consensus => "consensus",
            Self::Directive => "directive",
            Self::Voting => "voting",
        }
    }
}

impl std::fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a record landed and what it hashed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceReceipt {
    /// Path relative to the day directory (`<kind>/<file>.json`).
    pub relative_path: PathBuf,
    /// Lowercase hex SHA-256 of the file contents.
    pub sha256: String,
}

/// Result of re-hashing one day's manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub ok: Vec<String>,
    pub mismatched: Vec<String>,
    pub missing: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.mismatched.is_empty() && self.missing.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("no evidence manifest for {0}")]
    NoManifest(NaiveDate),

    #[error("malformed manifest line {line}: {content}")]
    MalformedManifest { line: usize, content: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EvidenceResult<T> = std::result::Result<T, EvidenceError>;

/// Hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Append-only evidence store.
pub trait EvidenceSink: Send + Sync {
    /// Write `record` as `<kind>/<timestamp>-<name>.json` and append its hash
    /// to the day's manifest.
    fn append(
        &self,
        kind: EvidenceKind,
        name: &str,
        record: &serde_json::Value,
    ) -> EvidenceResult<EvidenceReceipt>;
}

/// Append on the blocking pool and log instead of failing.
///
/// Evidence is best-effort: a write failure must never abort the state
/// transition it accompanies. The write runs on tokio's blocking pool, so
/// file I/O never stalls an async worker thread; awaiting it keeps one
/// caller's records in order.
pub async fn append_best_effort(
    sink: &Arc<dyn EvidenceSink>,
    kind: EvidenceKind,
    name: &str,
    record: serde_json::Value,
) -> Option<EvidenceReceipt> {
    let writer = Arc::clone(sink);
    let file_name = name.to_string();
    let written =
        tokio::task::spawn_blocking(move || writer.append(kind, &file_name, &record)).await;
    match written {
        Ok(Ok(receipt)) => Some(receipt),
        Ok(Err(e)) => {
            crate::obs::emit_evidence_write_failed(kind.as_str(), name, &e);
            None
        }
        Err(e) => {
            crate::obs::emit_evidence_write_failed(kind.as_str(), name, &e);
            None
        }
    }
}

/// Sink that hashes and discards records.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEvidence;

impl EvidenceSink for NullEvidence {
    fn append(
        &self,
        kind: EvidenceKind,
        name: &str,
        record: &serde_json::Value,
    ) -> EvidenceResult<EvidenceReceipt> {
        let bytes = serde_json::to_vec_pretty(record)?;
        Ok(EvidenceReceipt {
            relative_path: PathBuf::from(kind.as_str()).join(format!("{name}.json")),
            sha256: sha256_hex(&bytes),
        })
    }
}

/// Sink that keeps records in memory, for assertions in tests.
#[derive(Debug, Default)]
pub struct MemoryEvidence {
    records: Mutex<Vec<(EvidenceKind, String, serde_json::Value)>>,
}

impl MemoryEvidence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records of `kind`, in append order.
    pub fn records(&self, kind: EvidenceKind) -> Vec<serde_json::Value> {
        self.records
            .lock()
            .map(|r| {
                r.iter()
                    .filter(|(k, _, _)| *k == kind)
                    .map(|(_, _, v)| v.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EvidenceSink for MemoryEvidence {
    fn append(
        &self,
        kind: EvidenceKind,
        name: &str,
        record: &serde_json::Value,
    ) -> EvidenceResult<EvidenceReceipt> {
        let receipt = NullEvidence.append(kind, name, record)?;
        if let Ok(mut records) = self.records.lock() {
            records.push((kind, name.to_string(), record.clone()));
        }
        Ok(receipt)
    }
}
