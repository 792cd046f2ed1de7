use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use tempfile::NamedTempFile;
use tracing::debug;

use super::{
    sha256_hex, EvidenceError, EvidenceKind, EvidenceReceipt, EvidenceResult, EvidenceSink,
    VerifyReport, MANIFEST_FILE,
};

/// Filesystem evidence log.
///
/// Layout:
///
/// ```text
/// <root>/<YYYY-MM-DD>/<kind>/<timestamp>-<name>.json
/// <root>/<YYYY-MM-DD>/file-hashes-complete.sha256
/// ```
///
/// Manifest lines are `"<sha256-hex>  <kind>/<file>.json"`, relative to the
/// day directory. Days are UTC.
pub struct FsEvidenceWriter {
    root: PathBuf,
    // Serializes record + manifest appends so one proposal's evidence keeps its order.
    write_lock: Mutex<()>,
}

impl FsEvidenceWriter {
    /// Create a writer rooted at `root`. Creates `root` if needed.
    pub fn new(root: impl AsRef<Path>) -> EvidenceResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn day_dir(&self, date: NaiveDate) -> PathBuf {
        self.root.join(date.format("%Y-%m-%d").to_string())
    }

    /// Write `record` as if it were `now`.
    pub fn append_at(
        &self,
        kind: EvidenceKind,
        name: &str,
        record: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> EvidenceResult<EvidenceReceipt> {
        let bytes = serde_json::to_vec_pretty(record)?;
        let sha256 = sha256_hex(&bytes);

        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());

        let day = self.day_dir(now.date_naive());
        let dir = day.join(kind.as_str());
        fs::create_dir_all(&dir)?;

        let stem = format!(
            "{}-{}",
            now.format("%Y-%m-%dT%H-%M-%S-%3fZ"),
            sanitize(name)
        );

        // Atomic write: temp file in the same directory, then a no-clobber rename.
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;

        let mut attempt = 0u32;
        let file_name = loop {
            let candidate = if attempt == 0 {
                format!("{stem}.json")
            } else {
                format!("{stem}-{attempt}.json")
            };
            match tmp.persist_noclobber(dir.join(&candidate)) {
                Ok(_) => break candidate,
                Err(e) if e.error.kind() == ErrorKind::AlreadyExists && attempt < 1000 => {
                    tmp = e.file;
                    attempt += 1;
                }
                Err(e) => return Err(e.error.into()),
            }
        };

        let relative_path = PathBuf::from(kind.as_str()).join(&file_name);
        let mut manifest = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(day.join(MANIFEST_FILE))?;
        manifest.write_all(format!("{}  {}\n", sha256, manifest_path(&relative_path)).as_bytes())?;

        debug!(kind = %kind, file = %file_name, sha256 = %sha256, "evidence appended");
        Ok(EvidenceReceipt {
            relative_path,
            sha256,
        })
    }

    /// Re-hash every file listed in the manifest of `date`.
    pub fn verify_day(&self, date: NaiveDate) -> EvidenceResult<VerifyReport> {
        let day = self.day_dir(date);
        let manifest = match fs::read_to_string(day.join(MANIFEST_FILE)) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(EvidenceError::NoManifest(date)),
            Err(e) => return Err(e.into()),
        };

        let mut report = VerifyReport::default();
        for (idx, line) in manifest.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (expected, rel) =
                line.split_once("  ")
                    .ok_or_else(|| EvidenceError::MalformedManifest {
                        line: idx + 1,
                        content: line.to_string(),
                    })?;

            match fs::read(day.join(rel)) {
                Ok(bytes) if sha256_hex(&bytes) == expected => report.ok.push(rel.to_string()),
                Ok(_) => report.mismatched.push(rel.to_string()),
                Err(e) if e.kind() == ErrorKind::NotFound => report.missing.push(rel.to_string()),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(report)
    }

    /// Dates that have a manifest, oldest first.
    pub fn days(&self) -> EvidenceResult<Vec<NaiveDate>> {
        let mut days = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(date) = name
                .to_str()
                .and_then(|n| NaiveDate::parse_from_str(n, "%Y-%m-%d").ok())
            {
                if entry.path().join(MANIFEST_FILE).exists() {
                    days.push(date);
                }
            }
        }
        days.sort();
        Ok(days)
    }
}

impl EvidenceSink for FsEvidenceWriter {
    fn append(
        &self,
        kind: EvidenceKind,
        name: &str,
        record: &serde_json::Value,
    ) -> EvidenceResult<EvidenceReceipt> {
        self.append_at(kind, name, record, Utc::now())
    }
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "record".to_string()
    } else {
        cleaned
    }
}

/// Manifest paths always use `/`.
fn manifest_path(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn make_writer() -> (tempfile::TempDir, FsEvidenceWriter) {
        let dir = tempfile::tempdir().unwrap();
        let writer = FsEvidenceWriter::new(dir.path().join("compliance")).unwrap();
        (dir, writer)
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap()
    }

    #[test]
    fn layout_and_manifest_line() {
        let (_dir, writer) = make_writer();
        let record = serde_json::json!({"step": 7, "loss": 0.5});
        let receipt = writer
            .append_at(EvidenceKind::Training, "step-7", &record, fixed_now())
            .unwrap();

        assert_eq!(
            receipt.relative_path,
            PathBuf::from("training/2025-03-14T09-26-53-000Z-step-7.json")
        );

        let day = writer.day_dir(fixed_now().date_naive());
        assert!(day.ends_with("2025-03-14"));
        let stored = fs::read(day.join(&receipt.relative_path)).unwrap();
        assert_eq!(sha256_hex(&stored), receipt.sha256);
        let parsed: serde_json::Value = serde_json::from_slice(&stored).unwrap();
        assert_eq!(parsed, record);

        let manifest = fs::read_to_string(day.join(MANIFEST_FILE)).unwrap();
        assert_eq!(
            manifest,
            format!(
                "{}  training/2025-03-14T09-26-53-000Z-step-7.json\n",
                receipt.sha256
            )
        );
    }

    #[test]
    fn same_timestamp_does_not_clobber() {
        let (_dir, writer) = make_writer();
        let a = writer
            .append_at(EvidenceKind::Voting, "p", &serde_json::json!({"n": 1}), fixed_now())
            .unwrap();
        let b = writer
            .append_at(EvidenceKind::Voting, "p", &serde_json::json!({"n": 2}), fixed_now())
            .unwrap();
        assert_ne!(a.relative_path, b.relative_path);

        let report = writer.verify_day(fixed_now().date_naive()).unwrap();
        assert_eq!(report.ok.len(), 2);
        assert!(report.is_clean());
    }

    #[test]
    fn verify_detects_tampering_and_missing_files() {
        let (_dir, writer) = make_writer();
        let now = fixed_now();
        let kept = writer
            .append_at(EvidenceKind::Consensus, "kept", &serde_json::json!({}), now)
            .unwrap();
        let edited = writer
            .append_at(EvidenceKind::Consensus, "edited", &serde_json::json!({"d": "veto"}), now)
            .unwrap();
        let deleted = writer
            .append_at(EvidenceKind::Directive, "deleted", &serde_json::json!({}), now)
            .unwrap();

        let day = writer.day_dir(now.date_naive());
        fs::write(day.join(&edited.relative_path), b"{\"d\":\"approve\"}").unwrap();
        fs::remove_file(day.join(&deleted.relative_path)).unwrap();

        let report = writer.verify_day(now.date_naive()).unwrap();
        assert_eq!(report.ok, vec![manifest_path(&kept.relative_path)]);
        assert_eq!(report.mismatched, vec![manifest_path(&edited.relative_path)]);
        assert_eq!(report.missing, vec![manifest_path(&deleted.relative_path)]);
        assert!(!report.is_clean());
    }

    #[test]
    fn verify_without_manifest() {
        let (_dir, writer) = make_writer();
        let date = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        assert!(matches!(
            writer.verify_day(date),
            Err(EvidenceError::NoManifest(d)) if d == date
        ));
    }

    #[test]
    fn names_are_sanitized() {
        assert_eq!(sanitize("consensus/../run 1"), "consensus----run-1");
        assert_eq!(sanitize(""), "record");
    }

    #[test]
    fn days_lists_manifest_dirs() {
        let (_dir, writer) = make_writer();
        writer
            .append_at(EvidenceKind::Training, "s", &serde_json::json!({}), fixed_now())
            .unwrap();
        fs::create_dir_all(writer.root().join("not-a-date")).unwrap();
        assert_eq!(writer.days().unwrap(), vec![fixed_now().date_naive()]);
    }
}
