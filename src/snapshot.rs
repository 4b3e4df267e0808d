//! In-memory snapshot cache for aggregate state.
//!
//! Loading an aggregate starts from the cached snapshot and folds only the
//! events appended since, so hot streams are not replayed from version 1
//! on every command.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use uuid::Uuid;

use crate::aggregate::Aggregate;

/// A point-in-time snapshot of an aggregate's state and stream version.
///
/// `stream_version` records how many events have been folded into `state`,
/// so catch-up resumes from `stream_version + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<A> {
    /// The aggregate state at the time of the snapshot.
    pub state: A,
    /// The stream version (number of events applied) at snapshot time.
    pub stream_version: u64,
}

/// Last known snapshot per stream of one aggregate type.
///
/// Entries only move forward: storing an older snapshot than the cached one
/// is ignored, so concurrent loaders cannot roll the cache back.
#[derive(Debug)]
pub struct SnapshotCache<A> {
    entries: Mutex<HashMap<Uuid, Snapshot<A>>>,
}

impl<A> Default for SnapshotCache<A> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<A: Aggregate> SnapshotCache<A> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached snapshot for `stream_id`, if any.
    pub fn get(&self, stream_id: &Uuid) -> Option<Snapshot<A>> {
        self.lock().get(stream_id).cloned()
    }

    /// Store `snapshot` unless a newer one is already cached.
    pub fn put(&self, stream_id: Uuid, snapshot: Snapshot<A>) {
        let mut entries = self.lock();
        match entries.get(&stream_id) {
            Some(cached) if cached.stream_version >= snapshot.stream_version => {}
            _ => {
                entries.insert(stream_id, snapshot);
            }
        }
    }

    /// Drop the cached snapshot for `stream_id`.
    pub fn invalidate(&self, stream_id: &Uuid) {
        self.lock().remove(stream_id);
    }

    /// Number of cached streams.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Snapshot<A>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
