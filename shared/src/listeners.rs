//! Ordered callback registry shared by the connectivity monitor and the
//! upload queue.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

struct Slots<T> {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback<T>>,
}

/// Callbacks are invoked in registration order. Ids only grow, so the
/// `BTreeMap` iteration order is the registration order.
pub struct ListenerRegistry<T> {
    slots: Arc<Mutex<Slots<T>>>,
}

impl<T: Clone + 'static> ListenerRegistry<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                next_id: 0,
                callbacks: BTreeMap::new(),
            })),
        }
    }

    pub fn add(&self, callback: impl Fn(T) + Send + Sync + 'static) -> ListenerHandle {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let id = slots.next_id;
        slots.next_id += 1;
        slots.callbacks.insert(id, Arc::new(callback));

        let weak: Weak<Mutex<Slots<T>>> = Arc::downgrade(&self.slots);
        ListenerHandle {
            remove: Some(Box::new(move || {
                if let Some(slots) = weak.upgrade() {
                    slots
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .callbacks
                        .remove(&id);
                }
            })),
        }
    }

    /// Calls every listener with `value`.
    ///
    /// The lock is released before any callback runs, so a callback may
    /// register or unsubscribe listeners without deadlocking.
    pub fn notify(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .values()
            .cloned()
            .collect();
        for callback in callbacks {
            callback(value.clone());
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + 'static> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Returned by `add_listener`. Dropping the handle keeps the listener
/// registered; call [`ListenerHandle::unsubscribe`] to remove it.
pub struct ListenerHandle {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
