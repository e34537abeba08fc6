//! Persisted FIFO of captures waiting to be uploaded.
//!
//! Every entry owns a copy of its artifact under `<root>/artifacts`. The index
//! record is only committed after that copy is durable on disk, and the copy
//! is only deleted after the record is gone, so a crash at any point leaves
//! either a complete entry or an orphan file that the next [`UploadQueue::open`]
//! sweeps away.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::PhotoApi;
use crate::config::ConfigError;
use crate::listeners::{ListenerHandle, ListenerRegistry};
use crate::model::{EntryId, UnixTimeMs, UploadMetadata, UploadResponse};
use crate::network::NetworkMonitor;

const ARTIFACTS_DIR: &str = "artifacts";
const PART_SUFFIX: &str = "part";
#[cfg(not(target_arch = "wasm32"))]
const INDEX_FILE: &str = "queue.sqlite3";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("upload queue is full ({0} entries)")]
    Full(usize),

    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("artifact not found: {}", path.display())]
    ArtifactMissing { path: PathBuf },

    #[error("{op} failed for {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupted entry: {entry_id}, reason: {reason}")]
    CorruptedEntry { entry_id: String, reason: String },
}

impl QueueError {
    fn io(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Holds the SQLite index and the `artifacts/` directory.
    pub root_dir: PathBuf,
    pub max_entries: usize,
    pub max_failure_reason_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("photovault/queue"),
            max_entries: 10_000,
            max_failure_reason_bytes: 1024,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("queue.root_dir must not be empty".into()));
        }
        if self.max_entries == 0 {
            return Err(ConfigError::Invalid("queue.max_entries must be > 0".into()));
        }
        if self.max_failure_reason_bytes < 16 {
            return Err(ConfigError::Invalid(
                "queue.max_failure_reason_bytes must be >= 16".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn artifacts_dir(&self) -> PathBuf {
        self.root_dir.join(ARTIFACTS_DIR)
    }
}

// ============================================================================
// Entries
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub reason: String,
    /// Server refused the content; retrying the same bytes will not help.
    pub permanent: bool,
    pub at: UnixTimeMs,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub seq: u64,
    pub artifact_path: PathBuf,
    pub created_at: UnixTimeMs,
    pub attempt_count: u32,
    pub last_failure: Option<FailureRecord>,
    #[serde(default)]
    pub metadata: UploadMetadata,
}

/// An index record the queue refuses to drain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuarantinedEntry {
    pub entry_id: String,
    pub reason: String,
    pub at: UnixTimeMs,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrainFailure {
    pub entry_id: EntryId,
    pub reason: String,
    pub permanent: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub processed: usize,
    pub failed: usize,
    pub failures: Vec<DrainFailure>,
    /// Another drain held the guard; nothing was attempted.
    pub already_running: bool,
    /// Entries left untouched because connectivity dropped mid-drain.
    pub deferred: usize,
    /// Entries the server rejected permanently. They are not uploaded again
    /// and wait for an explicit `discard`.
    pub held: Vec<EntryId>,
    pub uploaded: Vec<(EntryId, UploadResponse)>,
}

impl DrainReport {
    fn skipped() -> Self {
        Self {
            already_running: true,
            ..Self::default()
        }
    }
}

// ============================================================================
// Storage
// ============================================================================

#[async_trait]
pub trait QueueStorage: Send + Sync {
    /// All records in sequence order. Undecodable records come back as
    /// `Err(QueueError::CorruptedEntry)` so the caller can quarantine them.
    async fn load_all(&self) -> Result<Vec<Result<QueueEntry, QueueError>>, QueueError>;
    async fn insert(&self, entry: &QueueEntry) -> Result<(), QueueError>;
    async fn update(&self, entry: &QueueEntry) -> Result<(), QueueError>;
    /// Returns whether a record was removed.
    async fn remove(&self, entry_id: &str) -> Result<bool, QueueError>;
}

/// SQLite index with `synchronous=FULL`; one connection behind a mutex, every
/// statement run on the blocking pool.
#[cfg(not(target_arch = "wasm32"))]
pub struct SqliteQueueStorage {
    conn: Arc<std::sync::Mutex<rusqlite::Connection>>,
}

#[cfg(not(target_arch = "wasm32"))]
impl SqliteQueueStorage {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<_, QueueError> {
            let conn = rusqlite::Connection::open(&path)?;
            Self::migrate(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| QueueError::Storage(format!("storage task failed: {e}")))??;
        Ok(Self {
            conn: Arc::new(std::sync::Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, QueueError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(std::sync::Mutex::new(conn)),
        })
    }

    fn migrate(conn: &rusqlite::Connection) -> Result<(), QueueError> {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS upload_queue (
                seq INTEGER PRIMARY KEY,
                entry_id TEXT NOT NULL UNIQUE,
                data BLOB NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T, QueueError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| QueueError::Storage("index connection poisoned".into()))?;
            f(&guard)
        })
        .await
        .map_err(|e| QueueError::Storage(format!("storage task failed: {e}")))?
    }

    #[cfg(test)]
    async fn insert_raw(&self, seq: i64, entry_id: &str, data: &[u8]) {
        let entry_id = entry_id.to_string();
        let data = data.to_vec();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO upload_queue (seq, entry_id, data, created_at) VALUES (?1, ?2, ?3, 0)",
                rusqlite::params![seq, entry_id, data],
            )?;
            Ok(())
        })
        .await
        .unwrap();
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn to_sql_int(value: u64, field: &str) -> Result<i64, QueueError> {
    i64::try_from(value).map_err(|_| QueueError::Storage(format!("{field} out of range: {value}")))
}

#[cfg(not(target_arch = "wasm32"))]
#[async_trait]
impl QueueStorage for SqliteQueueStorage {
    async fn load_all(&self) -> Result<Vec<Result<QueueEntry, QueueError>>, QueueError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT entry_id, data FROM upload_queue ORDER BY seq ASC")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (entry_id, data) = row?;
                out.push(serde_json::from_slice::<QueueEntry>(&data).map_err(|e| {
                    QueueError::CorruptedEntry {
                        entry_id,
                        reason: e.to_string(),
                    }
                }));
            }
            Ok(out)
        })
        .await
    }

    async fn insert(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        let data = serde_json::to_vec(entry).map_err(|e| QueueError::Storage(e.to_string()))?;
        let seq = to_sql_int(entry.seq, "seq")?;
        let created_at = to_sql_int(entry.created_at.as_millis(), "created_at")?;
        let entry_id = entry.id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO upload_queue (seq, entry_id, data, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![seq, entry_id, data, created_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn update(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        let data = serde_json::to_vec(entry).map_err(|e| QueueError::Storage(e.to_string()))?;
        let entry_id = entry.id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE upload_queue SET data = ?1 WHERE entry_id = ?2",
                rusqlite::params![data, entry_id],
            )?;
            if changed == 0 {
                return Err(QueueError::NotFound(entry_id));
            }
            Ok(())
        })
        .await
    }

    async fn remove(&self, entry_id: &str) -> Result<bool, QueueError> {
        let entry_id = entry_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "DELETE FROM upload_queue WHERE entry_id = ?1",
                rusqlite::params![entry_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }
}

/// Volatile index for tests and for targets without SQLite.
#[derive(Default)]
pub struct MemoryQueueStorage {
    records: std::sync::Mutex<BTreeMap<u64, QueueEntry>>,
}

impl MemoryQueueStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, QueueEntry>> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl QueueStorage for MemoryQueueStorage {
    async fn load_all(&self) -> Result<Vec<Result<QueueEntry, QueueError>>, QueueError> {
        Ok(self.records().values().cloned().map(Ok).collect())
    }

    async fn insert(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        let mut records = self.records();
        if records.values().any(|e| e.id == entry.id) {
            return Err(QueueError::Storage(format!("duplicate entry id {}", entry.id)));
        }
        records.insert(entry.seq, entry.clone());
        Ok(())
    }

    async fn update(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        match self.records().get_mut(&entry.seq) {
            Some(existing) if existing.id == entry.id => {
                *existing = entry.clone();
                Ok(())
            }
            _ => Err(QueueError::NotFound(entry.id.to_string())),
        }
    }

    async fn remove(&self, entry_id: &str) -> Result<bool, QueueError> {
        let mut records = self.records();
        let seq = records
            .iter()
            .find(|(_, e)| e.id.as_str() == entry_id)
            .map(|(seq, _)| *seq);
        Ok(seq.and_then(|seq| records.remove(&seq)).is_some())
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub enqueued: AtomicU64,
    pub uploaded: AtomicU64,
    pub failed_attempts: AtomicU64,
    pub discarded: AtomicU64,
    pub skipped_drains: AtomicU64,
    pub storage_errors: AtomicU64,
    pub cleanup_failures: AtomicU64,
}

impl QueueMetrics {
    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            skipped_drains: self.skipped_drains.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueMetricsSnapshot {
    pub enqueued: u64,
    pub uploaded: u64,
    pub failed_attempts: u64,
    pub discarded: u64,
    pub skipped_drains: u64,
    pub storage_errors: u64,
    pub cleanup_failures: u64,
}

// ============================================================================
// Queue
// ============================================================================

struct QueueState {
    entries: BTreeMap<u64, QueueEntry>,
    next_seq: u64,
    quarantined: Vec<QuarantinedEntry>,
}

impl QueueState {
    fn find(&self, entry_id: &str) -> Option<&QueueEntry> {
        self.entries.values().find(|e| e.id.as_str() == entry_id)
    }
}

pub struct UploadQueue {
    storage: Arc<dyn QueueStorage>,
    api: Arc<dyn PhotoApi>,
    config: QueueConfig,
    artifacts_dir: PathBuf,
    state: RwLock<QueueState>,
    drain_guard: Mutex<()>,
    count_tx: watch::Sender<usize>,
    listeners: ListenerRegistry<usize>,
    network: Option<NetworkMonitor>,
    metrics: QueueMetrics,
}

impl UploadQueue {
    /// Opens the queue with a SQLite index at `<root_dir>/queue.sqlite3`.
    #[cfg(not(target_arch = "wasm32"))]
    pub async fn open_sqlite(
        config: QueueConfig,
        api: Arc<dyn PhotoApi>,
    ) -> Result<Self, QueueError> {
        tokio::fs::create_dir_all(&config.root_dir)
            .await
            .map_err(|e| QueueError::io("create queue dir", &config.root_dir, e))?;
        let storage = SqliteQueueStorage::open(config.root_dir.join(INDEX_FILE)).await?;
        Self::open(config, Arc::new(storage), api).await
    }

    /// Loads the index, quarantines records that cannot be drained and
    /// sweeps artifact files that no record owns.
    #[instrument(skip_all, fields(root = %config.root_dir.display()))]
    pub async fn open(
        config: QueueConfig,
        storage: Arc<dyn QueueStorage>,
        api: Arc<dyn PhotoApi>,
    ) -> Result<Self, QueueError> {
        config
            .validate()
            .map_err(|e| QueueError::Validation(e.to_string()))?;
        let artifacts_dir = config.artifacts_dir();
        tokio::fs::create_dir_all(&artifacts_dir)
            .await
            .map_err(|e| QueueError::io("create artifacts dir", &artifacts_dir, e))?;

        let mut state = QueueState {
            entries: BTreeMap::new(),
            next_seq: 1,
            quarantined: Vec::new(),
        };
        let mut owned: HashSet<String> = HashSet::new();

        for loaded in storage.load_all().await? {
            match loaded {
                Ok(entry) => {
                    state.next_seq = state.next_seq.max(entry.seq + 1);
                    let present = tokio::fs::try_exists(&entry.artifact_path)
                        .await
                        .unwrap_or(false);
                    if present {
                        owned.insert(entry.id.to_string());
                        state.entries.insert(entry.seq, entry);
                    } else {
                        warn!(entry_id = %entry.id, "quarantining entry with missing artifact");
                        state.quarantined.push(QuarantinedEntry {
                            entry_id: entry.id.to_string(),
                            reason: format!(
                                "artifact missing: {}",
                                entry.artifact_path.display()
                            ),
                            at: UnixTimeMs::now(),
                        });
                    }
                }
                Err(QueueError::CorruptedEntry { entry_id, reason }) => {
                    warn!(%entry_id, %reason, "quarantining corrupted entry");
                    // Its artifact may still be recoverable by hand.
                    owned.insert(entry_id.clone());
                    state.quarantined.push(QuarantinedEntry {
                        entry_id,
                        reason,
                        at: UnixTimeMs::now(),
                    });
                }
                Err(other) => return Err(other),
            }
        }

        let metrics = QueueMetrics::default();
        sweep_orphans(&artifacts_dir, &owned, &metrics).await;

        let count = state.entries.len();
        info!(
            pending = count,
            quarantined = state.quarantined.len(),
            "upload queue opened"
        );
        let (count_tx, _) = watch::channel(count);

        Ok(Self {
            storage,
            api,
            config,
            artifacts_dir,
            state: RwLock::new(state),
            drain_guard: Mutex::new(()),
            count_tx,
            listeners: ListenerRegistry::new(),
            network: None,
            metrics,
        })
    }

    /// Drains stop early while this monitor reports `Offline`.
    #[must_use]
    pub fn with_network(mut self, monitor: NetworkMonitor) -> Self {
        self.network = Some(monitor);
        self
    }

    /// Copies `source` into queue-owned storage and records it.
    #[instrument(skip_all, fields(source = %source.as_ref().display()))]
    pub async fn add_to_queue(
        &self,
        source: impl AsRef<Path>,
        metadata: UploadMetadata,
    ) -> Result<QueueEntry, QueueError> {
        let source = source.as_ref();
        metadata
            .validate()
            .map_err(|e| QueueError::Validation(e.to_string()))?;
        if self.state.read().await.entries.len() >= self.config.max_entries {
            return Err(QueueError::Full(self.config.max_entries));
        }

        let id = EntryId::generate();
        let file_name = format!("{id}.{}", artifact_extension(source));
        let artifact_path = self.artifacts_dir.join(file_name);
        persist_artifact(source, &artifact_path, &self.artifacts_dir).await?;

        let mut state = self.state.write().await;
        if state.entries.len() >= self.config.max_entries {
            drop(state);
            self.remove_artifact(&artifact_path).await;
            return Err(QueueError::Full(self.config.max_entries));
        }
        let entry = QueueEntry {
            id,
            seq: state.next_seq,
            artifact_path,
            created_at: UnixTimeMs::now(),
            attempt_count: 0,
            last_failure: None,
            metadata,
        };

        if let Err(e) = self.storage.insert(&entry).await {
            drop(state);
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            error!(entry_id = %entry.id, error = %e, "failed to commit queue entry");
            self.remove_artifact(&entry.artifact_path).await;
            return Err(e);
        }

        state.next_seq += 1;
        state.entries.insert(entry.seq, entry.clone());
        let count = self.publish_count(&state);
        drop(state);

        self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        info!(entry_id = %entry.id, count, "capture queued");
        self.notify_count();
        Ok(entry)
    }

    #[must_use]
    pub fn queue_count(&self) -> usize {
        *self.count_tx.borrow()
    }

    pub fn add_listener(&self, callback: impl Fn(usize) + Send + Sync + 'static) -> ListenerHandle {
        self.listeners.add(callback)
    }

    #[must_use]
    pub fn subscribe_count(&self) -> watch::Receiver<usize> {
        self.count_tx.subscribe()
    }

    /// Pending entries, oldest first.
    pub async fn entries(&self) -> Vec<QueueEntry> {
        self.state.read().await.entries.values().cloned().collect()
    }

    pub async fn quarantined(&self) -> Vec<QuarantinedEntry> {
        self.state.read().await.quarantined.clone()
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.drain_guard.try_lock().is_err()
    }

    pub fn metrics(&self) -> QueueMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Removes a pending or quarantined entry and its artifact.
    #[instrument(skip(self))]
    pub async fn discard(&self, entry_id: &str) -> Result<(), QueueError> {
        let mut state = self.state.write().await;

        if let Some(entry) = state.find(entry_id).cloned() {
            if let Err(e) = self.storage.remove(entry_id).await {
                self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
            state.entries.remove(&entry.seq);
            let count = self.publish_count(&state);
            drop(state);

            self.remove_artifact(&entry.artifact_path).await;
            self.metrics.discarded.fetch_add(1, Ordering::Relaxed);
            info!(count, "entry discarded");
            self.notify_count();
            return Ok(());
        }

        if let Some(pos) = state
            .quarantined
            .iter()
            .position(|q| q.entry_id == entry_id)
        {
            self.storage.remove(entry_id).await?;
            state.quarantined.remove(pos);
            self.metrics.discarded.fetch_add(1, Ordering::Relaxed);
            info!("quarantined entry discarded");
            return Ok(());
        }

        Err(QueueError::NotFound(entry_id.to_string()))
    }

    /// Uploads pending entries one at a time, oldest first.
    ///
    /// Returns immediately with `already_running` when another drain holds
    /// the guard. Upload failures are recorded on the entry and reported;
    /// only index failures come back as `Err`.
    #[instrument(skip(self))]
    pub async fn process_queue(&self) -> Result<DrainReport, QueueError> {
        let Ok(_guard) = self.drain_guard.try_lock() else {
            self.metrics.skipped_drains.fetch_add(1, Ordering::Relaxed);
            debug!("drain already running");
            return Ok(DrainReport::skipped());
        };

        let pending = self.entries().await;
        let mut report = DrainReport::default();
        info!(pending = pending.len(), "drain started");

        for (index, entry) in pending.iter().enumerate() {
            if self.network.as_ref().is_some_and(|n| !n.is_online()) {
                report.deferred = pending.len() - index;
                info!(deferred = report.deferred, "connectivity lost, drain deferred");
                break;
            }
            // Discarded while an earlier entry was uploading.
            if !self.state.read().await.entries.contains_key(&entry.seq) {
                continue;
            }
            if entry.last_failure.as_ref().is_some_and(|f| f.permanent) {
                report.held.push(entry.id.clone());
                continue;
            }

            match self
                .api
                .upload_photo(&entry.artifact_path, &entry.metadata)
                .await
            {
                Ok(response) => {
                    self.complete(entry).await?;
                    report.processed += 1;
                    report.uploaded.push((entry.id.clone(), response));
                }
                Err(e) => {
                    let failure = FailureRecord {
                        reason: truncate_utf8(&e.to_string(), self.config.max_failure_reason_bytes),
                        permanent: e.is_permanent(),
                        at: UnixTimeMs::now(),
                    };
                    warn!(entry_id = %entry.id, reason = %failure.reason, permanent = failure.permanent, "upload failed");
                    self.record_failure(entry, failure.clone()).await?;
                    report.failed += 1;
                    report.failures.push(DrainFailure {
                        entry_id: entry.id.clone(),
                        reason: failure.reason,
                        permanent: failure.permanent,
                    });
                }
            }
        }

        info!(
            processed = report.processed,
            failed = report.failed,
            held = report.held.len(),
            remaining = self.queue_count(),
            "drain finished"
        );
        Ok(report)
    }

    async fn complete(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        if let Err(e) = self.storage.remove(entry.id.as_str()).await {
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            error!(entry_id = %entry.id, error = %e, "uploaded entry could not be removed from index");
            return Err(e);
        }
        let removed = state.entries.remove(&entry.seq).is_some();
        let count = self.publish_count(&state);
        drop(state);

        self.remove_artifact(&entry.artifact_path).await;
        self.metrics.uploaded.fetch_add(1, Ordering::Relaxed);
        info!(entry_id = %entry.id, count, "entry uploaded");
        if removed {
            self.notify_count();
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        entry: &QueueEntry,
        failure: FailureRecord,
    ) -> Result<(), QueueError> {
        self.metrics.failed_attempts.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.write().await;
        let Some(current) = state.entries.get(&entry.seq) else {
            return Ok(());
        };
        let mut updated = current.clone();
        updated.attempt_count = updated.attempt_count.saturating_add(1);
        updated.last_failure = Some(failure);

        if let Err(e) = self.storage.update(&updated).await {
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        state.entries.insert(updated.seq, updated);
        Ok(())
    }

    /// Must run under the state write guard so concurrent writers publish
    /// in the order they changed the state.
    fn publish_count(&self, state: &QueueState) -> usize {
        let count = state.entries.len();
        self.count_tx.send_replace(count);
        count
    }

    /// Listeners always see the latest published count.
    fn notify_count(&self) {
        let count = *self.count_tx.borrow();
        self.listeners.notify(&count);
    }

    async fn remove_artifact(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                self.metrics.cleanup_failures.fetch_add(1, Ordering::Relaxed);
                warn!(path = %path.display(), error = %e, "failed to delete queue artifact");
            }
        }
    }
}

// ============================================================================
// Artifact files
// ============================================================================

fn artifact_extension(source: &Path) -> String {
    source
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map_or_else(|| "jpg".to_string(), str::to_ascii_lowercase)
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(PART_SUFFIX);
    path.with_file_name(name)
}

/// Copy to `<dest>.part`, fsync, rename over `dest`, then fsync the directory.
async fn persist_artifact(source: &Path, dest: &Path, dir: &Path) -> Result<(), QueueError> {
    let source = source.to_path_buf();
    let dest = dest.to_path_buf();
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        if !source.is_file() {
            return Err(QueueError::ArtifactMissing { path: source });
        }
        let tmp = part_path(&dest);
        let result = (|| {
            std::fs::copy(&source, &tmp).map_err(|e| QueueError::io("copy artifact", &source, e))?;
            std::fs::File::open(&tmp)
                .and_then(|f| f.sync_all())
                .map_err(|e| QueueError::io("sync artifact", &tmp, e))?;
            std::fs::rename(&tmp, &dest).map_err(|e| QueueError::io("rename artifact", &tmp, e))
        })();
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
            return result;
        }
        sync_dir(&dir);
        Ok(())
    })
    .await
    .map_err(|e| QueueError::Storage(format!("artifact task failed: {e}")))?
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = std::fs::File::open(dir).and_then(|d| d.sync_all()) {
        warn!(dir = %dir.display(), error = %e, "directory fsync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Deletes `.part` leftovers and artifacts whose stem matches no known entry.
async fn sweep_orphans(dir: &Path, owned: &HashSet<String>, metrics: &QueueMetrics) {
    let mut reader = match tokio::fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot list artifacts for sweep");
            return;
        }
    };
    let mut swept = 0usize;
    loop {
        let item = match reader.next_entry().await {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "artifact sweep interrupted");
                break;
            }
        };
        let path = item.path();
        let name = item.file_name().to_string_lossy().into_owned();
        let stem = name.split('.').next().unwrap_or_default();
        let is_part = name.ends_with(&format!(".{PART_SUFFIX}"));
        if !is_part && owned.contains(stem) {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => swept += 1,
            Err(e) => {
                metrics.cleanup_failures.fetch_add(1, Ordering::Relaxed);
                warn!(path = %path.display(), error = %e, "failed to sweep orphan artifact");
            }
        }
    }
    if swept > 0 {
        info!(swept, "swept orphan artifacts");
    }
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
