//! JSON-file store under a state directory.
//!
//! Layout:
//!
//! ```text
//! <root>/ledger/<phase>/<date>.json    outputs and outstanding failures
//! <root>/history/<phase>/<date>.json   run history entry
//! <root>/attempts/<phase>_<start>_<end>.json
//! <root>/heal/<phase>/<date>.json      self-heal record
//! <root>/.lock                         exclusive lock for read-modify-write
//! <root>/.lock.reclaim                 held while removing an abandoned lock
//! ```
//!
//! Every document is written to a temporary file and renamed into place, so
//! readers never see a torn write. Read-modify-write cycles hold the lock
//! file, created with `create_new`, which serializes writers across
//! processes. An abandoned lock is only removed under the reclaim guard,
//! after its age is checked again.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::partition::PartitionLedger;
use super::{check_holder, claim, lock_date, MergeOutcome, OutputStore, RunHistoryStore};
use crate::backfill::{AttemptKey, RunAttempt, RunHistoryEntry};
use crate::core::{OutputRecord, Phase, ProcessingUnit, RunStatus};
use crate::errors::{PhaseflowError, Result, TransientKind};
use crate::ledger::FailureRecord;
use crate::selfheal::HealRecord;
use crate::utils::DateRange;

const LOCK_FILE: &str = ".lock";
const RECLAIM_FILE: &str = ".lock.reclaim";
const LOCK_POLL: Duration = Duration::from_millis(10);

/// Store persisting JSON documents under a state directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    lock_timeout: Duration,
    stale_lock_after: Duration,
}

/// Held while a read-modify-write cycle runs; removes the lock file on drop.
struct StateLock {
    path: PathBuf,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove state lock");
        }
    }
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            lock_timeout: Duration::from_secs(5),
            stale_lock_after: Duration::from_secs(60),
        })
    }

    /// Sets how long to wait for the lock file before giving up.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the age after which a leftover lock file is removed.
    #[must_use]
    pub fn with_stale_lock_after(mut self, age: Duration) -> Self {
        self.stale_lock_after = age;
        self
    }

    /// The state directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ledger_path(&self, phase: Phase, date: NaiveDate) -> PathBuf {
        self.root.join("ledger").join(phase.as_str()).join(format!("{date}.json"))
    }

    fn history_path(&self, phase: Phase, date: NaiveDate) -> PathBuf {
        self.root.join("history").join(phase.as_str()).join(format!("{date}.json"))
    }

    fn attempt_path(&self, key: &AttemptKey) -> PathBuf {
        self.root.join("attempts").join(format!("{}.json", key.slug()))
    }

    fn heal_path(&self, phase: Phase, date: NaiveDate) -> PathBuf {
        self.root.join("heal").join(phase.as_str()).join(format!("{date}.json"))
    }

    async fn lock(&self) -> Result<StateLock> {
        let path = self.root.join(LOCK_FILE);
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(std::process::id().to_string().as_bytes()).await?;
                    return Ok(StateLock { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.lock_is_stale(&path).await && self.reclaim_stale_lock(&path).await? {
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(PhaseflowError::transient(
                            TransientKind::Unavailable,
                            format!("state directory {} is locked", self.root.display()),
                        ));
                    }
                    tokio::time::sleep(LOCK_POLL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Removes the lock file at `path` if it is still stale once the
    /// reclaim guard is held. Returns true if it was removed.
    async fn reclaim_stale_lock(&self, path: &Path) -> Result<bool> {
        let guard_path = self.root.join(RECLAIM_FILE);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&guard_path)
            .await
        {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if self.lock_is_stale(&guard_path).await {
                    warn!(path = %guard_path.display(), "Removing abandoned reclaim guard");
                    remove_if_present(&guard_path).await;
                }
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }
        let _guard = StateLock { path: guard_path };

        // Another waiter may have replaced the lock since it was seen stale.
        if !self.lock_is_stale(path).await {
            return Ok(false);
        }
        warn!(path = %path.display(), "Removing abandoned state lock");
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove abandoned state lock");
                Err(e.into())
            }
        }
    }

    async fn lock_is_stale(&self, path: &Path) -> bool {
        let Ok(meta) = tokio::fs::metadata(path).await else {
            return false;
        };
        meta.modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .is_some_and(|age| age > self.stale_lock_after)
    }

    async fn load_ledger(&self, phase: Phase, date: NaiveDate) -> Result<PartitionLedger> {
        Ok(read_json(&self.ledger_path(phase, date)).await?.unwrap_or_default())
    }
}

async fn remove_if_present(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            PhaseflowError::Store(format!("corrupt document {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json<T: Serialize + Sync>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(value)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_dir_json<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut docs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            if let Some(doc) = read_json(&path).await? {
                docs.push(doc);
            }
        }
    }
    Ok(docs)
}

#[async_trait]
impl OutputStore for FileStore {
    async fn merge_output(&self, record: OutputRecord) -> Result<MergeOutcome> {
        let (phase, date) = (record.phase, record.date);
        let _lock = self.lock().await?;
        let mut ledger = self.load_ledger(phase, date).await?;
        let outcome = ledger.merge(record);
        if outcome.wrote() {
            write_json(&self.ledger_path(phase, date), &ledger).await?;
        }
        Ok(outcome)
    }

    async fn get_output(&self, unit: &ProcessingUnit) -> Result<Option<OutputRecord>> {
        let mut ledger = self.load_ledger(unit.phase, unit.date).await?;
        Ok(ledger.outputs.remove(&unit.entity_id))
    }

    async fn list_outputs(&self, phase: Phase, date: NaiveDate) -> Result<Vec<OutputRecord>> {
        Ok(self.load_ledger(phase, date).await?.outputs.into_values().collect())
    }

    async fn count_outputs(&self, phase: Phase, date: NaiveDate) -> Result<u64> {
        Ok(self.load_ledger(phase, date).await?.outputs.len() as u64)
    }

    async fn record_failure(&self, record: FailureRecord) -> Result<bool> {
        let (phase, date) = (record.phase, record.date);
        let _lock = self.lock().await?;
        let mut ledger = self.load_ledger(phase, date).await?;
        let written = ledger.record_failure(record);
        if written {
            write_json(&self.ledger_path(phase, date), &ledger).await?;
        }
        Ok(written)
    }

    async fn list_failures(&self, phase: Phase, date: NaiveDate) -> Result<Vec<FailureRecord>> {
        Ok(self.load_ledger(phase, date).await?.failures)
    }
}

#[async_trait]
impl RunHistoryStore for FileStore {
    async fn load_attempt(&self, key: &AttemptKey) -> Result<Option<RunAttempt>> {
        read_json(&self.attempt_path(key)).await
    }

    async fn save_attempt(&self, attempt: &RunAttempt) -> Result<()> {
        let _lock = self.lock().await?;
        write_json(&self.attempt_path(&attempt.key), attempt).await
    }

    async fn claim_attempt(&self, fresh: RunAttempt, now: DateTime<Utc>) -> Result<RunAttempt> {
        let path = self.attempt_path(&fresh.key);
        let _lock = self.lock().await?;
        let attempt = claim(read_json(&path).await?, fresh, now)?;
        write_json(&path, &attempt).await?;
        Ok(attempt)
    }

    async fn list_running(&self) -> Result<Vec<RunAttempt>> {
        let attempts: Vec<RunAttempt> = read_dir_json(&self.root.join("attempts")).await?;
        Ok(attempts
            .into_iter()
            .filter(|a| a.status == RunStatus::Running)
            .collect())
    }

    async fn acquire_date(
        &self,
        phase: Phase,
        date: NaiveDate,
        attempt_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RunHistoryEntry> {
        let path = self.history_path(phase, date);
        let _lock = self.lock().await?;
        let entry = lock_date(read_json(&path).await?, phase, date, attempt_id, now)?;
        write_json(&path, &entry).await?;
        Ok(entry)
    }

    async fn complete_date(&self, entry: RunHistoryEntry) -> Result<()> {
        let path = self.history_path(entry.phase, entry.date);
        let _lock = self.lock().await?;
        let existing: Option<RunHistoryEntry> = read_json(&path).await?;
        check_holder(existing.as_ref(), entry.attempt_id)?;
        write_json(&path, &entry).await
    }

    async fn release_date(&self, phase: Phase, date: NaiveDate, attempt_id: Uuid) -> Result<()> {
        let path = self.history_path(phase, date);
        let _lock = self.lock().await?;
        let existing: Option<RunHistoryEntry> = read_json(&path).await?;
        check_holder(existing.as_ref(), Some(attempt_id))?;
        if let Some(mut entry) = existing.filter(|e| e.status == RunStatus::Running) {
            entry.status = RunStatus::Pending;
            entry.updated_at = Utc::now();
            write_json(&path, &entry).await?;
        }
        Ok(())
    }

    async fn entry(&self, phase: Phase, date: NaiveDate) -> Result<Option<RunHistoryEntry>> {
        read_json(&self.history_path(phase, date)).await
    }

    async fn history(&self, phase: Phase, range: DateRange) -> Result<Vec<RunHistoryEntry>> {
        let mut entries = Vec::new();
        for date in range.days() {
            if let Some(entry) = read_json(&self.history_path(phase, date)).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn reclaim_stale(
        &self,
        phase: Phase,
        date: NaiveDate,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<Vec<Uuid>> {
        let _lock = self.lock().await?;
        let mut reclaimed = Vec::new();

        let path = self.history_path(phase, date);
        let entry: Option<RunHistoryEntry> = read_json(&path).await?;
        if let Some(mut entry) = entry.filter(|e| e.is_stale(now, stale_after)) {
            reclaimed.extend(entry.attempt_id);
            entry.status = RunStatus::Failed;
            entry.updated_at = now;
            write_json(&path, &entry).await?;
        }

        let attempts: Vec<RunAttempt> = read_dir_json(&self.root.join("attempts")).await?;
        for mut attempt in attempts {
            if attempt.key.phase == phase
                && attempt.key.range.contains(date)
                && attempt.is_stale(now, stale_after)
            {
                attempt.status = RunStatus::Failed;
                attempt.last_error = Some("reclaimed stale lock".to_string());
                attempt.updated_at = now;
                write_json(&self.attempt_path(&attempt.key), &attempt).await?;
                if !reclaimed.contains(&attempt.attempt_id) {
                    reclaimed.push(attempt.attempt_id);
                }
            }
        }

        if !reclaimed.is_empty() {
            debug!(phase = %phase, date = %date, count = reclaimed.len(), "Reclaimed stale locks");
        }
        Ok(reclaimed)
    }

    async fn load_heal(&self, phase: Phase, date: NaiveDate) -> Result<Option<HealRecord>> {
        read_json(&self.heal_path(phase, date)).await
    }

    async fn save_heal(&self, record: &HealRecord) -> Result<()> {
        let _lock = self.lock().await?;
        write_json(&self.heal_path(record.phase, record.date), record).await
    }
}
