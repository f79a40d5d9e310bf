//! Single-assignment promises
//!
//! A `Promise<T>` is a write-once cell that any number of tasks can await.
//! The container record uses these for the executor exit status and the
//! Termination message: both are set exactly once, possibly long after the
//! waiters registered.

use std::sync::Arc;

use tokio::sync::watch;

/// A write-once, multi-reader asynchronous cell.
///
/// Cloning the promise clones a handle to the same cell. `set` succeeds only
/// for the first caller; every `wait` observes the single assigned value.
pub struct Promise<T> {
    tx: Arc<watch::Sender<Option<T>>>,
}

impl<T: Clone> Promise<T> {
    /// Create an unfulfilled promise.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Fulfil the promise. Returns false if it was already fulfilled.
    pub fn set(&self, value: T) -> bool {
        let mut slot = Some(value);
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = slot.take();
                true
            } else {
                false
            }
        })
    }

    /// Current value without waiting.
    pub fn peek(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Whether the promise has been fulfilled.
    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait until the promise is fulfilled and return the value.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        // The sender lives inside self, so changed() cannot fail before a
        // value is observed.
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            if rx.changed().await.is_err() {
                unreachable!("promise sender dropped while waiting");
            }
        }
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T: Clone> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::fmt::Debug + Clone> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Promise").field(&self.peek()).finish()
    }
}
