//! Audit Recorder
//!
//! Writes exactly one record per terminal outcome. A failed write never
//! fails the caller's response: each write is time-limited, the recorder
//! retries with backoff, then
//! parks the record in a JSONL near-miss journal and logs at error level.
//! The journal is replayed into the store at startup; appends are
//! idempotent on the record id, so a replay never duplicates a row.
//!
//! Storage: /var/lib/medgate/audit-nearmiss.jsonl (configurable)

use crate::audit_store::{AppendOutcome, AuditStore, StoreError};
use medgate_shared::audit::ModelCallAudit;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Persisted,
    /// Same id already stored (a retry after an unacknowledged success)
    Duplicate,
    /// Store refused it; parked in the journal for replay
    Journaled,
    /// Store and journal both failed
    Lost,
}

impl RecordStatus {
    /// Record is in the store or will be at the next replay
    pub fn is_durable(&self) -> bool {
        !matches!(self, RecordStatus::Lost)
    }
}

// ============================================================================
// Near-miss journal
// ============================================================================

pub struct NearMissJournal {
    path: PathBuf,
}

impl NearMissJournal {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_dir(&self) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            if dir.as_os_str().is_empty() {
                return Ok(());
            }
            fs::create_dir_all(dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
            }
        }
        Ok(())
    }

    /// Append one record as a JSON line and sync
    pub fn append(&self, record: &ModelCallAudit) -> std::io::Result<()> {
        self.ensure_dir()?;
        let json = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", json)?;
        file.sync_all()?;
        Ok(())
    }

    /// All parseable records; unreadable lines are logged and skipped
    pub fn read_all(&self) -> std::io::Result<Vec<ModelCallAudit>> {
        Ok(self.read_entries()?.0)
    }

    /// Parseable records plus the raw text of every line that did not parse
    pub fn read_entries(&self) -> std::io::Result<(Vec<ModelCallAudit>, Vec<String>)> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), Vec::new())),
            Err(e) => return Err(e),
        };

        let mut records = Vec::new();
        let mut unreadable = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ModelCallAudit>(line) {
                Ok(r) => records.push(r),
                Err(e) => {
                    warn!("Unreadable journal line {}: {}", n + 1, e);
                    unreadable.push(line.to_string());
                }
            }
        }
        Ok((records, unreadable))
    }

    /// Sidecar file holding lines replay could not parse
    pub fn rejected_path(&self) -> PathBuf {
        self.path.with_extension("rejected")
    }

    /// Move raw lines to the sidecar file, appending and syncing
    pub fn reject_lines(&self, lines: &[String]) -> std::io::Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        self.ensure_dir()?;
        let mut file = OpenOptions::new().create(true).append(true).open(self.rejected_path())?;
        for line in lines {
            writeln!(file, "{}", line)?;
        }
        file.sync_all()
    }

    /// Replace the journal contents with `records` (empty -> truncate)
    pub fn rewrite(&self, records: &[ModelCallAudit]) -> std::io::Result<()> {
        self.ensure_dir()?;
        let mut out = String::new();
        for r in records {
            let json = serde_json::to_string(r)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            out.push_str(&json);
            out.push('\n');
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        fs::write(&tmp, out)?;
        fs::rename(&tmp, &self.path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub duplicates: usize,
    pub remaining: usize,
    /// Unparseable lines moved to the `.rejected` sidecar
    pub rejected: usize,
}

// ============================================================================
// Recorder
// ============================================================================

pub struct AuditRecorder {
    store: Arc<dyn AuditStore>,
    journal: Option<Arc<NearMissJournal>>,
    retries: u32,
    backoff: Duration,
    write_timeout: Duration,
}

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

impl AuditRecorder {
    pub fn new(store: Arc<dyn AuditStore>, journal: Option<NearMissJournal>, retries: u32, backoff: Duration) -> Self {
        Self {
            store,
            journal: journal.map(Arc::new),
            retries,
            backoff,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Bound each store write; zero is treated as one millisecond
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    async fn append_bounded(&self, record: &ModelCallAudit) -> Result<AppendOutcome, StoreError> {
        match tokio::time::timeout(self.write_timeout, self.store.append(record)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "write timed out after {}ms",
                self.write_timeout.as_millis()
            ))),
        }
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    /// Persist `record`, retrying then journaling. Never returns an error.
    pub async fn record(&self, record: &ModelCallAudit) -> RecordStatus {
        let mut last_err: Option<StoreError> = None;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff * attempt).await;
            }
            match self.append_bounded(record).await {
                Ok(AppendOutcome::Inserted) => return RecordStatus::Persisted,
                Ok(AppendOutcome::AlreadyPresent) => return RecordStatus::Duplicate,
                Err(e) => {
                    warn!("Audit write {} attempt {} failed: {}", record.id, attempt + 1, e);
                    last_err = Some(e);
                }
            }
        }

        let reason = last_err.map(|e| e.to_string()).unwrap_or_default();
        error!(
            "AUDIT NEAR-MISS: record {} (user {}, outcome {}) not persisted: {}",
            record.id,
            record.user_id,
            record.outcome.as_str(),
            reason
        );

        let Some(journal) = self.journal.clone() else {
            return RecordStatus::Lost;
        };
        let parked = record.clone();
        let result = tokio::task::spawn_blocking(move || journal.append(&parked)).await;
        match result {
            Ok(Ok(())) => RecordStatus::Journaled,
            Ok(Err(e)) => {
                error!("AUDIT LOST: record {} could not be journaled: {}", record.id, e);
                RecordStatus::Lost
            }
            Err(e) => {
                error!("AUDIT LOST: journal task for {} failed: {}", record.id, e);
                RecordStatus::Lost
            }
        }
    }

    /// Push journaled records into the store. Records the store still
    /// refuses stay in the journal; lines that no longer parse are moved to
    /// the `.rejected` sidecar rather than dropped.
    pub async fn replay_journal(&self) -> Result<ReplayReport, StoreError> {
        let Some(journal) = self.journal.clone() else {
            return Ok(ReplayReport::default());
        };
        let reader = Arc::clone(&journal);
        let (parked, unreadable) = tokio::task::spawn_blocking(move || reader.read_entries())
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;
        if parked.is_empty() && unreadable.is_empty() {
            return Ok(ReplayReport::default());
        }

        let mut report = ReplayReport {
            rejected: unreadable.len(),
            ..Default::default()
        };
        let mut remaining = Vec::new();
        for record in parked {
            match self.append_bounded(&record).await {
                Ok(AppendOutcome::Inserted) => report.replayed += 1,
                Ok(AppendOutcome::AlreadyPresent) => report.duplicates += 1,
                Err(e) => {
                    warn!("Replay of {} failed, keeping in journal: {}", record.id, e);
                    remaining.push(record);
                }
            }
        }
        report.remaining = remaining.len();

        // Sidecar first so a crash in between leaves lines duplicated, not lost
        tokio::task::spawn_blocking(move || {
            journal.reject_lines(&unreadable)?;
            journal.rewrite(&remaining)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))??;

        if report.rejected > 0 {
            warn!("Audit journal replay: {} unreadable line(s) moved aside", report.rejected);
        }
        info!(
            "Audit journal replay: {} replayed, {} already present, {} remaining",
            report.replayed, report.duplicates, report.remaining
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit_store::MemoryAuditStore;
    use crate::test_support::record;
    use chrono::Utc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_retry_then_persist() {
        let store = Arc::new(MemoryAuditStore::new());
        store.fail_next(2);
        let recorder = AuditRecorder::new(store.clone(), None, 3, Duration::from_millis(1));

        let status = recorder.record(&record("u", "m", Utc::now())).await;
        assert_eq!(status, RecordStatus::Persisted);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_go_to_journal_and_replay() {
        let dir = tempdir().unwrap();
        let journal_path = dir.path().join("audit").join("nearmiss.jsonl");
        let store = Arc::new(MemoryAuditStore::new());
        store.fail_next(10);
        let recorder = AuditRecorder::new(
            store.clone(),
            Some(NearMissJournal::new(&journal_path)),
            1,
            Duration::from_millis(1),
        );

        let rec = record("u", "m", Utc::now());
        assert_eq!(recorder.record(&rec).await, RecordStatus::Journaled);
        assert_eq!(store.count().await.unwrap(), 0);

        store.fail_next(0);
        let report = recorder.replay_journal().await.unwrap();
        assert_eq!(
            report,
            ReplayReport {
                replayed: 1,
                ..Default::default()
            }
        );
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(NearMissJournal::new(&journal_path).read_all().unwrap().is_empty());

        // A second replay of the same record is a no-op
        NearMissJournal::new(&journal_path).append(&rec).unwrap();
        let report = recorder.replay_journal().await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_no_journal_means_lost() {
        let store = Arc::new(MemoryAuditStore::new());
        store.fail_next(5);
        let recorder = AuditRecorder::new(store, None, 0, Duration::ZERO);
        let status = recorder.record(&record("u", "m", Utc::now())).await;
        assert_eq!(status, RecordStatus::Lost);
        assert!(!status.is_durable());
    }

    #[test]
    fn test_journal_skips_garbage_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("j.jsonl");
        let journal = NearMissJournal::new(&path);
        journal.append(&record("u", "m", Utc::now())).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{{not json"))
            .unwrap();
        assert_eq!(journal.read_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replay_moves_unreadable_lines_aside() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nearmiss.jsonl");
        let journal = NearMissJournal::new(&path);
        journal.append(&record("u", "m", Utc::now())).unwrap();
        // Torn final line, as left by a crash mid-write
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut f| write!(f, "{{\"id\":\"half"))
            .unwrap();

        let store = Arc::new(MemoryAuditStore::new());
        let recorder = AuditRecorder::new(store.clone(), Some(NearMissJournal::new(&path)), 0, Duration::ZERO);
        let report = recorder.replay_journal().await.unwrap();

        assert_eq!(report.replayed, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(journal.read_all().unwrap().is_empty());
        let rejected = std::fs::read_to_string(journal.rejected_path()).unwrap();
        assert_eq!(rejected, "{\"id\":\"half\n");
    }

    /// Store whose appends never complete
    struct StalledStore;

    #[async_trait::async_trait]
    impl AuditStore for StalledStore {
        async fn append(&self, _record: &ModelCallAudit) -> Result<AppendOutcome, StoreError> {
            std::future::pending().await
        }

        async fn query_page(
            &self,
            _filter: &medgate_shared::audit::AuditFilter,
            _after: Option<&crate::audit_store::AuditCursor>,
            _limit: usize,
        ) -> Result<crate::audit_store::AuditPage, StoreError> {
            Err(StoreError::Unavailable("stalled".to_string()))
        }

        async fn purge_before(&self, _cutoff: chrono::DateTime<Utc>) -> Result<usize, StoreError> {
            Ok(0)
        }

        async fn count(&self) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_stalled_store_write_times_out_into_journal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nearmiss.jsonl");
        let recorder = AuditRecorder::new(
            Arc::new(StalledStore),
            Some(NearMissJournal::new(&path)),
            1,
            Duration::from_millis(1),
        )
        .with_write_timeout(Duration::from_millis(20));

        let rec = record("u", "m", Utc::now());
        let status = tokio::time::timeout(Duration::from_secs(5), recorder.record(&rec))
            .await
            .expect("recorder must not hang on a stalled store");

        assert_eq!(status, RecordStatus::Journaled);
        assert_eq!(NearMissJournal::new(&path).read_all().unwrap(), vec![rec]);
    }
}
