//! Append-only ledger of terminal job outcomes.
//!
//! One JSON object per line. Entries are immutable once written; the whole
//! file is reloaded at startup for quota counting and statistics.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::{JobId, TerminalResult, UserId};
use attestor_core::record::CandidateRecord;

/// Immutable snapshot of one terminal job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Job identifier.
    pub job_id: JobId,
    /// Owning user.
    pub user_id: UserId,
    /// The claimed record's identity fields, for audit.
    pub record: CandidateRecord,
    /// Terminal result.
    pub result: TerminalResult,
    /// When the job was accepted.
    pub created_at: DateTime<Utc>,
    /// When the job reached its terminal state.
    pub completed_at: DateTime<Utc>,
    /// Total wall-clock duration (milliseconds).
    pub duration_ms: u64,
}

/// Aggregate counts over the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    /// All entries.
    pub total: usize,
    /// Jobs the provider accepted.
    pub succeeded: usize,
    /// Jobs that failed (rejection or exhausted retries).
    pub failed: usize,
    /// Jobs whose phase deadline elapsed.
    pub timed_out: usize,
    /// Jobs cancelled on request.
    pub cancelled: usize,
}

/// Durable, append-only outcome ledger.
pub struct Ledger {
    path: PathBuf,
    entries: Mutex<Vec<LedgerEntry>>,
}

impl Ledger {
    /// Load the ledger, tolerating a missing file. Corrupt lines are
    /// skipped with a warning rather than poisoning the whole file.
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut entries = Vec::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            for line in raw.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<LedgerEntry>(line) {
                    Ok(entry) => entries.push(entry),
                    Err(err) => {
                        tracing::warn!(%err, "skipping corrupt ledger line");
                    }
                }
            }
        }
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Append one entry durably, then mirror it in memory.
    pub async fn append(&self, entry: LedgerEntry) -> anyhow::Result<()> {
        let line = serde_json::to_string(&entry)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || append_line(&path, &line))
            .await
            .map_err(|err| anyhow::anyhow!("append ledger entry: {err}"))??;
        self.lock().push(entry);
        Ok(())
    }

    /// Aggregate counts per terminal result.
    pub fn stats(&self) -> LedgerStats {
        let entries = self.lock();
        let mut stats = LedgerStats {
            total: entries.len(),
            ..LedgerStats::default()
        };
        for entry in entries.iter() {
            match entry.result {
                TerminalResult::Success => stats.succeeded += 1,
                TerminalResult::Failed { .. } => stats.failed += 1,
                TerminalResult::TimedOut { .. } => stats.timed_out += 1,
                TerminalResult::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Number of entries for `user_id` created at or after `since`.
    pub fn count_for_user_since(&self, user_id: UserId, since: DateTime<Utc>) -> usize {
        self.lock()
            .iter()
            .filter(|e| e.user_id == user_id && e.created_at >= since)
            .count()
    }

    /// Total number of entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the ledger has no entries.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of all entries, oldest first.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LedgerEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn append_line(path: &Path, line: &str) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use attestor_core::record::parse_record_line;

    fn entry(job: u64, user: i64, result: TerminalResult, created_at: DateTime<Utc>) -> LedgerEntry {
        LedgerEntry {
            job_id: JobId(job),
            user_id: UserId(user),
            record: parse_record_line("A|ONE|Army|1990-01-01").unwrap(),
            result,
            created_at,
            completed_at: created_at + TimeDelta::seconds(30),
            duration_ms: 30_000,
        }
    }

    #[tokio::test]
    async fn appends_survive_reload_and_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let now = Utc::now();

        let ledger = Ledger::load(&path).unwrap();
        ledger.append(entry(1, 7, TerminalResult::Success, now)).await.unwrap();
        ledger
            .append(entry(2, 7, TerminalResult::Failed { reason: "rejected".into() }, now))
            .await
            .unwrap();
        ledger
            .append(entry(3, 8, TerminalResult::TimedOut { phase: "decision".into() }, now))
            .await
            .unwrap();

        let reloaded = Ledger::load(&path).unwrap();
        assert_eq!(reloaded.len(), 3);
        let stats = reloaded.stats();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.cancelled, 0);
    }

    #[tokio::test]
    async fn counts_per_user_within_a_window() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::load(dir.path().join("ledger.jsonl")).unwrap();
        let now = Utc::now();

        ledger
            .append(entry(1, 7, TerminalResult::Success, now - TimeDelta::hours(30)))
            .await
            .unwrap();
        ledger.append(entry(2, 7, TerminalResult::Success, now)).await.unwrap();
        ledger.append(entry(3, 9, TerminalResult::Success, now)).await.unwrap();

        let since = now - TimeDelta::hours(24);
        assert_eq!(ledger.count_for_user_since(UserId(7), since), 1);
        assert_eq!(ledger.count_for_user_since(UserId(9), since), 1);
        assert_eq!(ledger.count_for_user_since(UserId(5), since), 0);
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let ledger = Ledger::load(&path).unwrap();
        ledger.append(entry(1, 7, TerminalResult::Success, Utc::now())).await.unwrap();

        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{not json}\n");
        std::fs::write(&path, raw).unwrap();

        let reloaded = Ledger::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
    }
}
