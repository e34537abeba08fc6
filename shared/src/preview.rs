//! Interactive sharpen preview for one remote photo.
//!
//! A session downloads the photo once, keeps a private copy of it in its own
//! scratch directory, and re-renders a local preview whenever the user stops
//! moving the sliders for `debounce_ms`. Committing sends the chosen
//! parameters to the server-side sharpen endpoint.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::capabilities::{ApiError, PhotoApi};
use crate::config::ConfigError;
use crate::image_cache::{CacheError, ImageCache, ImageRef, ResolveOptions};
use crate::model::{EnhancementResponse, ModelError, PhotoId, SharpenMethod, SharpenOptions};
use crate::sharpen::{ImageTransform, SharpenError, SharpenParams};

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("image download failed: {0}")]
    Download(#[from] CacheError),

    #[error("preview render failed: {0}")]
    Transform(#[from] SharpenError),

    #[error("sharpen request failed: {0}")]
    Api(#[from] ApiError),

    #[error("invalid sharpen parameters: {0}")]
    Params(#[from] ModelError),

    #[error("{op} failed for {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("preview session is closed")]
    Closed,

    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        state: PreviewState,
        operation: &'static str,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Quiet period after the last adjustment before re-rendering.
    pub debounce_ms: u64,
    /// Parent of every session's private directory.
    pub scratch_dir: PathBuf,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            scratch_dir: PathBuf::from("photovault/preview"),
        }
    }
}

impl PreviewConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scratch_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("preview.scratch_dir must not be empty".into()));
        }
        if self.debounce_ms > 60_000 {
            return Err(ConfigError::Invalid(format!(
                "preview.debounce_ms must be <= 60000, got {}",
                self.debounce_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewStage {
    Downloading,
    Regenerating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewState {
    Idle,
    Downloading,
    Ready,
    Regenerating,
    Failed { stage: PreviewStage },
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreviewSnapshot {
    pub state: PreviewState,
    pub params: SharpenParams,
    pub preview_path: Option<PathBuf>,
    pub last_error: Option<String>,
    /// Debounced re-renders that replaced the preview.
    pub regenerations: u64,
}

/// Artifacts and cancellation state. Every adoption or deletion of a
/// session file happens under this lock.
struct Session {
    original: Option<PathBuf>,
    preview: Option<PathBuf>,
    /// Bumped by every adjustment and by close; a render that started in an
    /// older epoch is stale.
    epoch: u64,
    closed: bool,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    id: Uuid,
    image: ImageRef,
    cache: Arc<ImageCache>,
    transform: Arc<dyn ImageTransform>,
    config: PreviewConfig,
    session_dir: PathBuf,
    session: Mutex<Session>,
    snapshot_tx: watch::Sender<PreviewSnapshot>,
    /// Serializes start and regenerations.
    render_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct PreviewController {
    inner: Arc<Inner>,
}

impl PreviewController {
    pub fn new(
        image: ImageRef,
        cache: Arc<ImageCache>,
        transform: Arc<dyn ImageTransform>,
        config: PreviewConfig,
    ) -> Self {
        let id = Uuid::new_v4();
        let session_dir = config.scratch_dir.join(id.simple().to_string());
        let (snapshot_tx, _) = watch::channel(PreviewSnapshot {
            state: PreviewState::Idle,
            params: SharpenParams::default(),
            preview_path: None,
            last_error: None,
            regenerations: 0,
        });
        Self {
            inner: Arc::new(Inner {
                id,
                image,
                cache,
                transform,
                config,
                session_dir,
                session: Mutex::new(Session {
                    original: None,
                    preview: None,
                    epoch: 0,
                    closed: false,
                    timer: None,
                }),
                snapshot_tx,
                render_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.inner.id
    }

    #[must_use]
    pub fn session_dir(&self) -> &Path {
        &self.inner.session_dir
    }

    #[must_use]
    pub fn snapshot(&self) -> PreviewSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PreviewSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Downloads the photo and renders the first preview with the current
    /// parameters.
    #[instrument(skip(self), fields(session = %self.inner.id))]
    pub async fn start(&self) -> Result<PathBuf, PreviewError> {
        self.inner.start().await
    }

    /// Stores clamped parameters and restarts the debounce timer.
    #[instrument(skip(self), fields(session = %self.inner.id))]
    pub async fn adjust(&self, params: SharpenParams) -> Result<(), PreviewError> {
        let params = params.clamped();
        let delay = Duration::from_millis(self.inner.config.debounce_ms);
        let weak = Arc::downgrade(&self.inner);

        let mut session = self.inner.session();
        if session.closed {
            return Err(PreviewError::Closed);
        }
        session.epoch += 1;
        if let Some(timer) = session.timer.take() {
            timer.abort();
        }
        self.inner.snapshot_tx.send_modify(|s| s.params = params);
        session.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Detached so that a later abort of this timer cannot cancel a
            // render halfway through.
            tokio::spawn(async move {
                if let Err(e) = inner.regenerate().await {
                    debug!(error = %e, "debounced regeneration skipped");
                }
            });
        }));
        drop(session);

        debug!(intensity = params.intensity, radius = params.radius, "preview params adjusted");
        Ok(())
    }

    /// `Failed { Downloading }` restarts from scratch, `Failed { Regenerating }`
    /// re-renders with the current parameters. Returns the new preview, or
    /// `None` when a newer adjustment superseded it.
    #[instrument(skip(self), fields(session = %self.inner.id))]
    pub async fn retry(&self) -> Result<Option<PathBuf>, PreviewError> {
        let state = self.inner.state();
        match state {
            PreviewState::Failed {
                stage: PreviewStage::Downloading,
            } => {
                let original = {
                    let mut session = self.inner.session();
                    if session.closed {
                        return Err(PreviewError::Closed);
                    }
                    session.original.take()
                };
                if let Some(original) = original {
                    remove_quietly(&original).await;
                }
                self.inner.set_state_if(state, PreviewState::Idle);
                self.inner.start().await.map(Some)
            }
            PreviewState::Failed {
                stage: PreviewStage::Regenerating,
            } => {
                self.inner.set_state_if(state, PreviewState::Ready);
                self.inner.regenerate().await
            }
            other => Err(PreviewError::InvalidState {
                state: other,
                operation: "retry",
            }),
        }
    }

    /// Sends the current parameters to the server, then closes the session
    /// whatever the outcome.
    #[instrument(skip(self, api), fields(session = %self.inner.id))]
    pub async fn commit(
        &self,
        api: &dyn PhotoApi,
        photo_id: PhotoId,
        threshold: u8,
    ) -> Result<EnhancementResponse, PreviewError> {
        if self.inner.is_closed() {
            return Err(PreviewError::Closed);
        }
        let params = self.snapshot().params;
        let result = match SharpenOptions::new(
            params.intensity,
            params.radius,
            threshold,
            SharpenMethod::UnsharpMask,
        ) {
            Ok(options) => api.sharpen(photo_id, &options).await.map_err(PreviewError::from),
            Err(e) => Err(e.into()),
        };
        self.close().await;
        match &result {
            Ok(_) => info!(%photo_id, "sharpen committed"),
            Err(e) => warn!(%photo_id, error = %e, "sharpen commit failed"),
        }
        result
    }

    /// Cancels pending work and deletes every session file. Idempotent.
    #[instrument(skip(self), fields(session = %self.inner.id))]
    pub async fn close(&self) {
        let (timer, files) = {
            let mut session = self.inner.session();
            if session.closed {
                return;
            }
            session.closed = true;
            session.epoch += 1;
            (
                session.timer.take(),
                [session.original.take(), session.preview.take()],
            )
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        self.inner.snapshot_tx.send_modify(|s| {
            s.state = PreviewState::Closed;
            s.preview_path = None;
        });

        for file in files.into_iter().flatten() {
            remove_quietly(&file).await;
        }
        self.inner.remove_session_dir().await;
        info!("preview closed");
    }
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.session().closed
    }

    /// Runs `f` unless the session is closed. Returns whether it ran.
    fn adopt(&self, f: impl FnOnce(&mut Session)) -> bool {
        let mut session = self.session();
        if session.closed {
            return false;
        }
        f(&mut session);
        true
    }

    fn state(&self) -> PreviewState {
        self.snapshot_tx.borrow().state
    }

    fn set_state_if(&self, expected: PreviewState, next: PreviewState) -> bool {
        self.snapshot_tx.send_if_modified(|s| {
            if s.state == expected {
                s.state = next;
                true
            } else {
                false
            }
        })
    }

    /// Records a failure unless the session was closed meanwhile.
    fn fail(&self, stage: PreviewStage, err: PreviewError) -> PreviewError {
        if self.is_closed() {
            return PreviewError::Closed;
        }
        warn!(session = %self.id, ?stage, error = %err, "preview failed");
        let message = err.to_string();
        self.snapshot_tx.send_modify(|s| {
            s.state = PreviewState::Failed { stage };
            s.last_error = Some(message);
        });
        err
    }

    async fn start(&self) -> Result<PathBuf, PreviewError> {
        let _render = self.render_lock.lock().await;
        if self.is_closed() {
            return Err(PreviewError::Closed);
        }
        if !self.set_state_if(PreviewState::Idle, PreviewState::Downloading) {
            return Err(PreviewError::InvalidState {
                state: self.state(),
                operation: "start",
            });
        }
        self.snapshot_tx.send_modify(|s| s.last_error = None);

        let resolved = self
            .cache
            .resolve(&self.image, ResolveOptions::default())
            .await
            .map_err(|e| self.fail(PreviewStage::Downloading, e.into()))?;
        let original = self
            .copy_original(&resolved)
            .await
            .map_err(|e| self.fail(PreviewStage::Downloading, e))?;

        if !self.adopt(|session| session.original = Some(original.clone())) {
            self.remove_session_dir().await;
            return Err(PreviewError::Closed);
        }

        let params = self.snapshot_tx.borrow().params;
        let preview = self
            .transform
            .apply(&original, params)
            .await
            .map_err(|e| self.fail(PreviewStage::Downloading, e.into()))?;

        if !self.adopt(|session| session.preview = Some(preview.clone())) {
            remove_quietly(&preview).await;
            return Err(PreviewError::Closed);
        }
        self.snapshot_tx.send_modify(|s| {
            s.state = PreviewState::Ready;
            s.preview_path = Some(preview.clone());
        });
        info!(session = %self.id, "preview ready");
        Ok(preview)
    }

    /// A start racing `close` may have recreated the directory after close
    /// removed it, so every path that observes the close calls this too.
    async fn remove_session_dir(&self) {
        match tokio::fs::remove_dir_all(&self.session_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.session_dir.display(), error = %e, "failed to delete preview scratch dir"),
        }
    }

    async fn copy_original(&self, resolved: &Path) -> Result<PathBuf, PreviewError> {
        let io_err = |op, path: &Path, source| PreviewError::Io {
            op,
            path: path.to_path_buf(),
            source,
        };
        if self.is_closed() {
            return Err(PreviewError::Closed);
        }
        tokio::fs::create_dir_all(&self.session_dir)
            .await
            .map_err(|e| io_err("create session dir", &self.session_dir, e))?;
        let extension = resolved
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("jpg");
        let original = self.session_dir.join(format!("original.{extension}"));
        tokio::fs::copy(resolved, &original)
            .await
            .map_err(|e| io_err("copy original", resolved, e))?;
        Ok(original)
    }

    async fn regenerate(&self) -> Result<Option<PathBuf>, PreviewError> {
        let _render = self.render_lock.lock().await;
        let (original, epoch) = {
            let session = self.session();
            if session.closed {
                return Err(PreviewError::Closed);
            }
            (session.original.clone(), session.epoch)
        };
        let Some(original) = original else {
            return Ok(None);
        };
        let allowed = self.snapshot_tx.send_if_modified(|s| match s.state {
            PreviewState::Ready
            | PreviewState::Failed {
                stage: PreviewStage::Regenerating,
            } => {
                s.state = PreviewState::Regenerating;
                true
            }
            _ => false,
        });
        if !allowed {
            return Ok(None);
        }

        let params = self.snapshot_tx.borrow().params;
        let result = self.transform.apply(&original, params).await;

        enum Outcome {
            Adopted(Option<PathBuf>),
            Stale,
            Closed,
        }
        let outcome = {
            let mut session = self.session();
            if session.closed {
                Outcome::Closed
            } else if session.epoch != epoch {
                Outcome::Stale
            } else if let Ok(preview) = &result {
                Outcome::Adopted(session.preview.replace(preview.clone()))
            } else {
                Outcome::Adopted(None)
            }
        };

        match (outcome, result) {
            (Outcome::Closed, result) => {
                if let Ok(preview) = result {
                    remove_quietly(&preview).await;
                }
                Err(PreviewError::Closed)
            }
            (Outcome::Stale, result) => {
                if let Ok(preview) = result {
                    remove_quietly(&preview).await;
                }
                debug!(session = %self.id, "discarded superseded preview");
                self.set_state_if(PreviewState::Regenerating, PreviewState::Ready);
                Ok(None)
            }
            (Outcome::Adopted(previous), Ok(preview)) => {
                self.snapshot_tx.send_modify(|s| {
                    s.state = PreviewState::Ready;
                    s.preview_path = Some(preview.clone());
                    s.last_error = None;
                    s.regenerations += 1;
                });
                if let Some(previous) = previous {
                    remove_quietly(&previous).await;
                }
                debug!(session = %self.id, "preview regenerated");
                Ok(Some(preview))
            }
            (Outcome::Adopted(_), Err(e)) => Err(self.fail(PreviewStage::Regenerating, e.into())),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let session = self.session.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = session.timer.take() {
            timer.abort();
        }
        if !session.closed && (session.original.is_some() || session.preview.is_some()) {
            warn!(session = %self.id, "preview dropped without close, scratch files left behind");
        }
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to delete preview artifact"),
    }
}
