//! Observable state containers.
//!
//! A [`StateCell`] holds the current state value for one pipeline and fans
//! out changes two ways:
//!
//! - **Observers** registered with [`StateCell::subscribe`] run synchronously
//!   on every accepted write, in registration order, and see every accepted
//!   value exactly once (plus a replay of the current value at subscription).
//! - **Watches** created with [`StateCell::watch`] are cheap async handles
//!   that always expose the latest value. A watch may skip intermediate
//!   values under load; it never blocks the writer.
//!
//! Writes deduplicate with `PartialEq`: setting a value equal to the current
//! one is a no-op and notifies nobody.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::core::lock_unpoisoned;

struct Observer<S> {
    id: u64,
    callback: Arc<dyn Fn(&S) + Send + Sync>,
}

type ObserverList<S> = Arc<Mutex<Vec<Observer<S>>>>;

/// Holds one state value and notifies observers when it changes.
///
/// Every pipeline owns exactly one cell. The cell can also be used on its
/// own wherever a deduplicating observable value is useful.
pub struct StateCell<S> {
    tx: watch::Sender<S>,
    observers: ObserverList<S>,
    next_id: AtomicU64,
}

impl<S> StateCell<S>
where
    S: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a cell holding `initial`.
    pub fn new(initial: S) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            tx,
            observers: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Snapshot of the current value.
    pub fn get(&self) -> S {
        self.tx.borrow().clone()
    }

    /// Replace the current value.
    ///
    /// If `next` compares equal to the current value the write is dropped
    /// and no observer runs. Otherwise observers run synchronously before
    /// this method returns.
    pub fn set(&self, next: S) {
        let accepted = self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if accepted {
            self.notify();
        }
    }

    /// Register an observer.
    ///
    /// The observer is immediately invoked with the current value, then once
    /// per accepted write until the returned [`Subscription`] is dropped.
    /// Observers run inside the writer's call stack; an observer that needs
    /// to trigger actions should hand the work to a task instead of calling
    /// back into a pipeline synchronously.
    ///
    /// Under concurrent writers an observer can see the value it was replayed
    /// with delivered a second time around subscription; within a single
    /// thread the replay is exact.
    pub fn subscribe(&self, observer: impl Fn(&S) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: Arc<dyn Fn(&S) + Send + Sync> = Arc::new(observer);

        lock_unpoisoned(&self.observers).push(Observer {
            id,
            callback: callback.clone(),
        });
        callback(&self.get());

        let list = Arc::downgrade(&self.observers);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(list) = Weak::upgrade(&list) {
                    lock_unpoisoned(&list).retain(|observer| observer.id != id);
                }
            })),
        }
    }

    /// Async handle onto the cell's value.
    pub fn watch(&self) -> StateWatch<S> {
        StateWatch {
            rx: self.tx.subscribe(),
        }
    }

    fn notify(&self) {
        // Snapshot the list so observer bodies run without holding the lock.
        let callbacks: Vec<Arc<dyn Fn(&S) + Send + Sync>> = lock_unpoisoned(&self.observers)
            .iter()
            .map(|observer| observer.callback.clone())
            .collect();
        let value = self.tx.borrow().clone();
        for callback in callbacks {
            callback(&value);
        }
    }

    #[cfg(test)]
    fn observer_count(&self) -> usize {
        lock_unpoisoned(&self.observers).len()
    }
}

impl<S> fmt::Debug for StateCell<S>
where
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCell")
            .field("value", &*self.tx.borrow())
            .finish_non_exhaustive()
    }
}

/// Handle keeping one observer registered.
///
/// Dropping the subscription removes the observer. Call
/// [`Subscription::detach`] to keep the observer alive for as long as the
/// cell lives.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Keep the observer registered after this handle is dropped.
    pub fn detach(mut self) {
        self.remove = None;
    }

    /// Remove the observer now. Equivalent to dropping the handle.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.remove.is_some())
            .finish()
    }
}

/// Cheap async view of a [`StateCell`].
///
/// A watch always exposes the latest value and can be turned into a stream
/// or polled with [`StateWatch::wait_until`]. Effects receive one of these
/// so they can read state without being able to write it.
pub struct StateWatch<S> {
    rx: watch::Receiver<S>,
}

impl<S> StateWatch<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Snapshot of the latest value.
    pub fn current(&self) -> S {
        self.rx.borrow().clone()
    }

    /// Turn this watch into a stream of values.
    ///
    /// The stream yields the value current at conversion time, then the
    /// latest value after each change. Intermediate values may be skipped if
    /// the consumer lags; the final value is always delivered.
    pub fn into_stream(self) -> WatchStream<S> {
        WatchStream::new(self.rx)
    }

    /// Wait until the value satisfies `predicate`, returning that value.
    ///
    /// The current value is checked first. Returns `None` if the owning cell
    /// is dropped before the predicate matches.
    pub async fn wait_until(&mut self, mut predicate: impl FnMut(&S) -> bool) -> Option<S> {
        match self.rx.wait_for(|value| predicate(value)).await {
            Ok(matched) => Some(matched.clone()),
            Err(_) => None,
        }
    }
}

impl<S> Clone for StateWatch<S> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<S> fmt::Debug for StateWatch<S>
where
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateWatch")
            .field("value", &*self.rx.borrow())
            .finish()
    }
}
