//! Named one-shot wait lists.
//!
//! "Wake me when event X happens" primitive: waiters register under a
//! string id and every waiter for that id resolves, in insertion order,
//! with a clone of the value when the event fires. Entries can be
//! cancelled individually and the whole list can be closed, failing all
//! pending waiters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::oneshot;

use crate::error::{Error, Result};

struct Inner<T> {
    next_token: u64,
    waiters: HashMap<String, Vec<(u64, oneshot::Sender<T>)>>,
    closed: bool,
}

/// Map from id to FIFO list of one-shot waiters.
pub struct WaitList<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T: Clone> WaitList<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_token: 0,
                waiters: HashMap::new(),
                closed: false,
            })),
        }
    }

    /// Register a waiter for `id`.
    pub fn wait_for(&self, id: &str) -> Waiter<T> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().expect("wait list lock poisoned");
        let token = inner.next_token;
        inner.next_token += 1;
        if !inner.closed {
            inner.waiters.entry(id.to_string()).or_default().push((token, tx));
        }
        // On a closed list the sender is dropped immediately and the
        // waiter resolves with `Error::Closed`.
        Waiter {
            id: id.to_string(),
            token,
            rx,
            list: Arc::downgrade(&self.inner),
        }
    }

    /// Resolve every waiter registered under `id`, in insertion order,
    /// with a clone of `value`. Returns the number of waiters resolved.
    pub fn resolve_all(&self, id: &str, value: T) -> usize {
        let entries = {
            let mut inner = self.inner.lock().expect("wait list lock poisoned");
            inner.waiters.remove(id).unwrap_or_default()
        };
        let count = entries.len();
        for (_, tx) in entries {
            let _ = tx.send(value.clone());
        }
        count
    }

    /// Fail every pending waiter and reject all future registrations.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("wait list lock poisoned");
        inner.closed = true;
        inner.waiters.clear();
    }
}

impl<T: Clone> Default for WaitList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending entry of a [`WaitList`].
pub struct Waiter<T> {
    id: String,
    token: u64,
    rx: oneshot::Receiver<T>,
    list: Weak<Mutex<Inner<T>>>,
}

impl<T> Waiter<T> {
    /// Await resolution. Fails with [`Error::Closed`] if the entry was
    /// cancelled or the list closed.
    pub async fn wait(self) -> Result<T> {
        self.rx.await.map_err(|_| Error::Closed)
    }

    /// Remove this entry from the list; idempotent.
    pub fn cancel(&mut self) {
        let Some(inner) = self.list.upgrade() else {
            return;
        };
        let mut inner = inner.lock().expect("wait list lock poisoned");
        if let Some(entries) = inner.waiters.get_mut(&self.id) {
            entries.retain(|(token, _)| *token != self.token);
            if entries.is_empty() {
                inner.waiters.remove(&self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_single_waiter() {
        let list: WaitList<u32> = WaitList::new();
        let waiter = list.wait_for("key");
        assert_eq!(list.resolve_all("key", 7), 1);
        assert_eq!(waiter.wait().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_all_waiters_get_same_value() {
        let list: WaitList<String> = WaitList::new();
        let first = list.wait_for("key");
        let second = list.wait_for("key");
        assert_eq!(list.resolve_all("key", "value".to_string()), 2);
        assert_eq!(first.wait().await.unwrap(), "value");
        assert_eq!(second.wait().await.unwrap(), "value");
    }

    #[tokio::test]
    async fn test_unrelated_id_not_resolved() {
        let list: WaitList<u32> = WaitList::new();
        let _waiter = list.wait_for("a");
        assert_eq!(list.resolve_all("b", 1), 0);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let list: WaitList<u32> = WaitList::new();
        let mut waiter = list.wait_for("key");
        waiter.cancel();
        waiter.cancel();
        assert_eq!(list.resolve_all("key", 1), 0);
        assert!(matches!(waiter.wait().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_close_fails_pending_waiters() {
        let list: WaitList<u32> = WaitList::new();
        let waiter = list.wait_for("key");
        list.close();
        assert!(matches!(waiter.wait().await, Err(Error::Closed)));

        // Registrations after close resolve immediately with an error.
        let late = list.wait_for("key");
        assert!(matches!(late.wait().await, Err(Error::Closed)));
    }
}
