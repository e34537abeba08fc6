//! Decides, per capture, between a direct upload and the offline queue, and
//! turns reconnects into queue drains.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::PhotoApi;
use crate::listeners::ListenerHandle;
use crate::model::{UploadMetadata, UploadResponse};
use crate::network::{ConnectivityState, NetworkMonitor};
use crate::upload_queue::{DrainReport, QueueEntry, QueueError, UploadQueue};

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// User asked to keep everything local for now.
    pub offline_mode_enabled: bool,
    pub metadata: UploadMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Uploaded(UploadResponse),
    Queued(QueueEntry),
    /// The server refused the content. Nothing was queued.
    Failed(String),
}

impl SubmitOutcome {
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub path: PathBuf,
    pub outcome: SubmitOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Fell back to the queue after a transient failure.
    pub queued: usize,
    pub items: Vec<BatchItem>,
}

impl BatchReport {
    pub fn failed_paths(&self) -> impl Iterator<Item = &Path> {
        self.items
            .iter()
            .filter(|item| item.outcome.is_failed())
            .map(|item| item.path.as_path())
    }
}

pub struct CaptureCoordinator {
    queue: Arc<UploadQueue>,
    api: Arc<dyn PhotoApi>,
    network: NetworkMonitor,
    offline_mode: AtomicBool,
    reports_tx: watch::Sender<Option<DrainReport>>,
}

impl CaptureCoordinator {
    pub fn new(queue: Arc<UploadQueue>, api: Arc<dyn PhotoApi>, network: NetworkMonitor) -> Self {
        let (reports_tx, _) = watch::channel(None);
        Self {
            queue,
            api,
            network,
            offline_mode: AtomicBool::new(false),
            reports_tx,
        }
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<UploadQueue> {
        &self.queue
    }

    pub fn set_offline_mode(&self, enabled: bool) {
        self.offline_mode.store(enabled, Ordering::SeqCst);
        info!(enabled, "offline mode changed");
    }

    #[must_use]
    pub fn offline_mode(&self) -> bool {
        self.offline_mode.load(Ordering::SeqCst)
    }

    /// Last completed drain. Skipped drains are not published.
    #[must_use]
    pub fn drain_reports(&self) -> watch::Receiver<Option<DrainReport>> {
        self.reports_tx.subscribe()
    }

    /// Uploads `path` now, or queues it when offline or when the upload
    /// fails for a reason worth retrying.
    ///
    /// `Err` means the queue itself could not take the capture.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn submit(
        &self,
        path: impl AsRef<Path>,
        options: SubmitOptions,
    ) -> Result<SubmitOutcome, QueueError> {
        let path = path.as_ref();
        if options.offline_mode_enabled || self.offline_mode() || !self.network.is_online() {
            debug!("offline, queueing without network");
            let entry = self.queue.add_to_queue(path, options.metadata).await?;
            return Ok(SubmitOutcome::Queued(entry));
        }

        match self.api.upload_photo(path, &options.metadata).await {
            Ok(response) => {
                info!(photo_id = ?response.photo_id, "uploaded directly");
                Ok(SubmitOutcome::Uploaded(response))
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "direct upload failed, queueing");
                let entry = self.queue.add_to_queue(path, options.metadata).await?;
                Ok(SubmitOutcome::Queued(entry))
            }
            Err(e) => {
                warn!(error = %e, "upload rejected");
                Ok(SubmitOutcome::Failed(e.to_string()))
            }
        }
    }

    /// Submits each path in order. A failing item never stops the batch.
    #[instrument(skip_all, fields(count = paths.len()))]
    pub async fn upload_batch(&self, paths: &[PathBuf]) -> BatchReport {
        let mut report = BatchReport::default();
        for path in paths {
            let options = SubmitOptions {
                offline_mode_enabled: self.offline_mode(),
                metadata: UploadMetadata::default(),
            };
            let outcome = match self.submit(path, options).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "capture could not be queued");
                    SubmitOutcome::Failed(e.to_string())
                }
            };
            match &outcome {
                SubmitOutcome::Uploaded(_) => report.succeeded += 1,
                SubmitOutcome::Queued(_) => report.queued += 1,
                SubmitOutcome::Failed(_) => report.failed += 1,
            }
            report.items.push(BatchItem {
                path: path.clone(),
                outcome,
            });
        }
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            queued = report.queued,
            "batch finished"
        );
        report
    }

    /// Drains the queue now, even in offline mode. Collapses into a drain
    /// that is already running.
    pub async fn drain_now(&self) -> Result<DrainReport, QueueError> {
        let report = self.queue.process_queue().await?;
        if !report.already_running {
            self.reports_tx.send_replace(Some(report.clone()));
        }
        Ok(report)
    }

    /// Spawns the task that drains the queue once per `Offline -> Online`
    /// transition while offline mode is off. Abort the handle to stop it.
    ///
    /// Transitions arrive through a monitor listener rather than the state
    /// watch, which would fold a quick `Online -> Offline -> Online` flap
    /// into no change at all.
    pub fn watch_connectivity(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let (tx, mut transitions) = mpsc::unbounded_channel();
        let mut previous = self.network.connection_status();
        let listener = ListenerGuard(Some(self.network.add_listener(move |state| {
            let _ = tx.send(state);
        })));

        tokio::spawn(async move {
            let _listener = listener;
            while let Some(current) = transitions.recv().await {
                let reconnected = previous == ConnectivityState::Offline
                    && current == ConnectivityState::Online;
                previous = current;
                if !reconnected {
                    continue;
                }
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                if coordinator.offline_mode() {
                    debug!("reconnected in offline mode, not draining");
                    continue;
                }
                info!(pending = coordinator.queue.queue_count(), "reconnected, draining queue");
                if let Err(e) = coordinator.drain_now().await {
                    error!(error = %e, "drain after reconnect failed");
                }
            }
            debug!("connectivity watcher finished");
        })
    }
}

/// Unsubscribes the watcher's listener when its task ends or is aborted.
struct ListenerGuard(Option<ListenerHandle>);

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.unsubscribe();
        }
    }
}
