//! Candidate record inventory.
//!
//! Records are partitioned into "available" and "consumed". A claim is
//! atomic and irrevocable: the record's identity key is appended to the
//! consumed file before the claim returns, so a job that crashes before
//! reaching a terminal state can never resubmit the same record.

use std::collections::{HashSet, VecDeque};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use attestor_core::record::{parse_record_line, CandidateRecord};

/// A claim succeeded in memory but could not be made durable.
#[derive(Debug, thiserror::Error)]
#[error("failed to persist consumed key: {0}")]
pub struct ClaimError(String);

struct InventoryState {
    available: VecDeque<CandidateRecord>,
    /// Keys of every record ever seen (available or consumed), for import dedup.
    known: HashSet<String>,
    consumed: HashSet<String>,
}

/// Shared, internally synchronized record inventory.
pub struct RecordInventory {
    records_path: PathBuf,
    consumed_path: PathBuf,
    state: Mutex<InventoryState>,
}

impl RecordInventory {
    /// Load the inventory from the records file and the consumed-keys file.
    /// Missing files are treated as empty. Unparseable rows are skipped with
    /// a warning; they never reach the available set.
    pub fn load(
        records_path: impl Into<PathBuf>,
        consumed_path: impl Into<PathBuf>,
    ) -> anyhow::Result<Self> {
        let records_path = records_path.into();
        let consumed_path = consumed_path.into();

        let consumed: HashSet<String> = read_lines(&consumed_path)?
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        let mut available = VecDeque::new();
        let mut known = consumed.clone();
        for line in read_lines(&records_path)? {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_record_line(line) {
                Ok(record) => {
                    let key = record.key();
                    if known.insert(key) {
                        available.push_back(record);
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, line, "skipping unparseable record row");
                }
            }
        }

        Ok(Self {
            records_path,
            consumed_path,
            state: Mutex::new(InventoryState {
                available,
                known,
                consumed,
            }),
        })
    }

    /// Claim the next available record, marking it consumed durably before
    /// returning. `Ok(None)` means the inventory is empty, a normal,
    /// non-fatal condition.
    pub async fn claim(&self) -> Result<Option<CandidateRecord>, ClaimError> {
        let record = {
            let mut state = self.lock();
            match state.available.pop_front() {
                Some(record) => {
                    state.consumed.insert(record.key());
                    record
                }
                None => return Ok(None),
            }
        };
        self.persist_consumed(record.key()).await?;
        Ok(Some(record))
    }

    /// Claim one specific record by identity key. `Ok(None)` means the key
    /// is unknown or already consumed.
    pub async fn claim_key(&self, key: &str) -> Result<Option<CandidateRecord>, ClaimError> {
        let wanted = key.trim().to_uppercase();
        let record = {
            let mut state = self.lock();
            let Some(idx) = state.available.iter().position(|r| r.key() == wanted) else {
                return Ok(None);
            };
            let Some(record) = state.available.remove(idx) else {
                return Ok(None);
            };
            state.consumed.insert(record.key());
            record
        };
        self.persist_consumed(record.key()).await?;
        Ok(Some(record))
    }

    /// Undo a claim for a record that failed pre-claim validation (never for
    /// job failures; those stay consumed). The record returns to the front
    /// of the available set and its key is removed from the consumed file.
    pub async fn release_unused(&self, record: CandidateRecord) -> anyhow::Result<()> {
        let consumed: Vec<String> = {
            let mut state = self.lock();
            state.consumed.remove(&record.key());
            state.available.push_front(record);
            state.consumed.iter().cloned().collect()
        };
        let path = self.consumed_path.clone();
        tokio::task::spawn_blocking(move || rewrite_lines(&path, &consumed))
            .await
            .map_err(|err| anyhow::anyhow!("rewrite consumed keys: {err}"))??;
        Ok(())
    }

    /// Number of records currently available.
    pub fn count_available(&self) -> usize {
        self.lock().available.len()
    }

    /// Snapshot of the available records, in claim order.
    pub fn available(&self) -> Vec<CandidateRecord> {
        self.lock().available.iter().cloned().collect()
    }

    /// Append parseable, previously unseen rows from `text` to the
    /// inventory (and the records file). Returns how many were added;
    /// malformed rows are skipped with a warning.
    pub async fn import_lines(&self, text: &str) -> anyhow::Result<usize> {
        let mut added = Vec::new();
        {
            let mut state = self.lock();
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match parse_record_line(line) {
                    Ok(record) => {
                        if state.known.insert(record.key()) {
                            state.available.push_back(record.clone());
                            added.push(record.to_line());
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, line, "skipping unparseable import row");
                    }
                }
            }
        }

        if added.is_empty() {
            return Ok(0);
        }
        let count = added.len();
        let path = self.records_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut out = String::new();
            for line in &added {
                out.push_str(line);
                out.push('\n');
            }
            append_text(&path, &out)
        })
        .await
        .map_err(|err| anyhow::anyhow!("append records: {err}"))??;
        Ok(count)
    }

    async fn persist_consumed(&self, key: String) -> Result<(), ClaimError> {
        let path = self.consumed_path.clone();
        tokio::task::spawn_blocking(move || append_text(&path, &format!("{key}\n")))
            .await
            .map_err(|err| ClaimError(err.to_string()))?
            .map_err(|err| ClaimError(err.to_string()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InventoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn read_lines(path: &Path) -> anyhow::Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(raw.lines().map(str::to_string).collect())
}

fn append_text(path: &Path, text: &str) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(text.as_bytes())?;
    file.flush()?;
    Ok(())
}

fn rewrite_lines(path: &Path, lines: &[String]) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, out)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
