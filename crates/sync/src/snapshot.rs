//! Revisioned snapshot store.
//!
//! The current value and its revision are published together as one
//! `Arc<Snapshot<T>>` through [`ArcSwap`], so a reader can never observe a
//! revision that belongs to a different value. Every mutation goes through a
//! single async mutex ([`SnapshotStore::lock`]); the revision only ever grows,
//! by exactly one per swap.

use arc_swap::ArcSwap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// An immutable value paired with the revision it was published under.
#[derive(Debug)]
pub struct Snapshot<T> {
    value: Arc<T>,
    revision: u64,
}

impl<T> Snapshot<T> {
    /// The decoded configuration value.
    #[must_use]
    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    /// The revision this value was published under.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

/// Holds the current snapshot; one writer at a time, any number of readers.
pub struct SnapshotStore<T> {
    current: ArcSwap<Snapshot<T>>,
    writer: Mutex<()>,
}

impl<T> SnapshotStore<T> {
    /// Creates a store holding `initial` at revision 0.
    #[must_use]
    pub fn new(initial: T) -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot {
                value: Arc::new(initial),
                revision: 0,
            }),
            writer: Mutex::new(()),
        }
    }

    /// Returns the current value. Callers get a shared reference, never a
    /// mutable alias into the store.
    #[must_use]
    pub fn read(&self) -> Arc<T> {
        Arc::clone(&self.current.load().value)
    }

    /// Returns the current value and revision as one consistent pair.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot<T>> {
        self.current.load_full()
    }

    /// Returns the current revision.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.current.load().revision
    }

    /// Acquires the exclusive write lock.
    pub async fn lock(&self) -> WriteGuard<'_, T> {
        WriteGuard {
            store: self,
            _permit: self.writer.lock().await,
        }
    }

    /// Replaces the value and bumps the revision in one critical section.
    ///
    /// Returns the previous value and the new revision.
    pub async fn swap(&self, value: T) -> (Arc<T>, u64) {
        self.lock().await.swap(value)
    }
}

/// Exclusive write access to a [`SnapshotStore`].
pub struct WriteGuard<'a, T> {
    store: &'a SnapshotStore<T>,
    _permit: MutexGuard<'a, ()>,
}

impl<T> WriteGuard<'_, T> {
    /// The revision as seen under the lock.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.store.revision()
    }

    /// Publishes `value` at the next revision and returns the previous value
    /// along with the new revision.
    pub fn swap(&mut self, value: T) -> (Arc<T>, u64) {
        let previous = self.store.current.load_full();
        let revision = previous.revision + 1;
        self.store.current.store(Arc::new(Snapshot {
            value: Arc::new(value),
            revision,
        }));
        (Arc::clone(&previous.value), revision)
    }
}
