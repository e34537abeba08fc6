//! Process-wide connectivity state.
//!
//! [`NetworkMonitor`] is the only writer of [`ConnectivityState`]. Consumers
//! get a cloned handle and either register ordered callbacks or hold a
//! `watch::Receiver`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::listeners::{ListenerHandle, ListenerRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    #[must_use]
    pub const fn from_online(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }

    #[must_use]
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

/// Platform reachability source.
pub trait ConnectivitySignal: Send + Sync {
    /// `None` when the platform cannot report reachability at all.
    fn subscribe(&self) -> Option<watch::Receiver<bool>>;
}

/// Channel-backed signal for shells that push reachability changes, and for tests.
#[derive(Debug)]
pub struct ManualSignal {
    tx: watch::Sender<bool>,
    subscriptions: AtomicUsize,
}

impl ManualSignal {
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self {
            tx,
            subscriptions: AtomicUsize::new(0),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.tx.send_replace(online);
    }

    /// Number of times an observer attached to this signal.
    #[must_use]
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

impl ConnectivitySignal for ManualSignal {
    fn subscribe(&self) -> Option<watch::Receiver<bool>> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Some(self.tx.subscribe())
    }
}

/// Signal for platforms without a reachability API.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableSignal;

impl ConnectivitySignal for UnavailableSignal {
    fn subscribe(&self) -> Option<watch::Receiver<bool>> {
        None
    }
}

enum Observation {
    Idle,
    /// Initialized without a platform signal; state is driven by `report` only.
    Passive,
    Observing(JoinHandle<()>),
}

struct Shared {
    state_tx: watch::Sender<ConnectivityState>,
    listeners: ListenerRegistry<ConnectivityState>,
    observation: Mutex<Observation>,
}

impl Shared {
    fn apply(&self, next: ConnectivityState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(state = ?next, "connectivity changed");
            self.listeners.notify(&next);
        }
    }
}

#[derive(Clone)]
pub struct NetworkMonitor {
    shared: Arc<Shared>,
    signal: Arc<dyn ConnectivitySignal>,
}

impl NetworkMonitor {
    pub fn new(signal: Arc<dyn ConnectivitySignal>) -> Self {
        let (state_tx, _rx) = watch::channel(ConnectivityState::Online);
        Self {
            shared: Arc::new(Shared {
                state_tx,
                listeners: ListenerRegistry::new(),
                observation: Mutex::new(Observation::Idle),
            }),
            signal,
        }
    }

    /// Starts observing the platform signal. Calling it again while already
    /// initialized does nothing.
    ///
    /// Without a platform signal (or outside a Tokio runtime) the monitor
    /// reports `Online` so uploads are never stranded.
    pub fn initialize(&self) {
        let mut observation = self
            .shared
            .observation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !matches!(*observation, Observation::Idle) {
            debug!("network monitor already initialized");
            return;
        }

        let runtime = tokio::runtime::Handle::try_current();
        let receiver = match (runtime, self.signal.subscribe()) {
            (Ok(runtime), Some(rx)) => Some((runtime, rx)),
            (Err(_), Some(_)) => {
                warn!("no async runtime available, connectivity observation disabled");
                None
            }
            (_, None) => {
                warn!("platform connectivity signal unavailable, assuming online");
                None
            }
        };

        let Some((runtime, mut rx)) = receiver else {
            *observation = Observation::Passive;
            drop(observation);
            self.shared.apply(ConnectivityState::Online);
            return;
        };

        let initial = ConnectivityState::from_online(*rx.borrow_and_update());
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let task = runtime.spawn(async move {
            while rx.changed().await.is_ok() {
                let next = ConnectivityState::from_online(*rx.borrow_and_update());
                match weak.upgrade() {
                    Some(shared) => shared.apply(next),
                    None => break,
                }
            }
            debug!("connectivity observer finished");
        });
        *observation = Observation::Observing(task);
        drop(observation);

        info!(state = ?initial, "network monitor initialized");
        self.shared.apply(initial);
    }

    /// Last known state. Never blocks.
    #[must_use]
    pub fn connection_status(&self) -> ConnectivityState {
        *self.shared.state_tx.borrow()
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.connection_status().is_online()
    }

    pub fn add_listener(
        &self,
        callback: impl Fn(ConnectivityState) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.shared.listeners.add(callback)
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.shared.state_tx.subscribe()
    }

    /// Feeds a reachability observation directly. Repeating the current
    /// state is not a transition and notifies nobody.
    pub fn report(&self, online: bool) {
        self.shared.apply(ConnectivityState::from_online(online));
    }

    /// Stops observation. Safe to call when never initialized.
    pub fn cleanup(&self) {
        let previous = std::mem::replace(
            &mut *self
                .shared
                .observation
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            Observation::Idle,
        );
        if let Observation::Observing(task) = previous {
            task.abort();
            info!("network monitor stopped");
        }
    }
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("state", &self.connection_status())
            .finish_non_exhaustive()
    }
}
