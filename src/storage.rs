//! Storage contract, commit types, and the in-memory backend.
//!
//! Every backend implements [`EventStorage`]. A [`Commit`] bundles appends
//! to one or more streams with an optional [`TrackingRecord`]; backends
//! record all of it or none of it. The shared [`EventIndex`] holds the
//! validation and position-assignment rules so that backends differ only
//! in how they make a commit durable.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;
use crate::event::{ProposedEvent, StoredEvent};

/// Events to append to one stream, guarded by the version the writer saw.
#[derive(Debug, Clone)]
pub struct StreamAppend {
    /// Target stream.
    pub stream_id: Uuid,
    /// The stream's version when the writer made its decision (0 for a new
    /// stream).
    pub expected_version: u64,
    /// Events to append, in order.
    pub events: Vec<ProposedEvent>,
}

/// How far a downstream application has consumed an upstream log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingRecord {
    /// Consuming application name.
    pub downstream: String,
    /// Producing application name.
    pub upstream: String,
    /// Highest upstream global position consumed.
    pub position: u64,
}

/// An atomic unit of work: stream appends plus an optional tracking record.
#[derive(Debug, Clone, Default)]
pub struct Commit {
    /// Appends, applied in order.
    pub appends: Vec<StreamAppend>,
    /// Tracking record written with the appends.
    pub tracking: Option<TrackingRecord>,
}

impl Commit {
    /// Create an empty commit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an append to `stream_id`, expecting it to be at `expected_version`.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn append(
        mut self,
        stream_id: Uuid,
        expected_version: u64,
        events: Vec<ProposedEvent>,
    ) -> Self {
        self.appends.push(StreamAppend {
            stream_id,
            expected_version,
            events,
        });
        self
    }

    /// Record `tracking` in the same atomic unit.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn with_tracking(mut self, tracking: TrackingRecord) -> Self {
        self.tracking = Some(tracking);
        self
    }
}

/// The events a successful commit recorded, in global position order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitReceipt {
    /// Committed events with their assigned versions and positions.
    pub events: Vec<StoredEvent>,
}

impl CommitReceipt {
    /// Global position of the last committed event, if any.
    pub fn last_position(&self) -> Option<u64> {
        self.events.last().map(|e| e.global_position)
    }
}

/// The durable storage contract every backend implements.
///
/// Implementations must be safe to share between pipeline worker threads.
/// Only [`commit`](EventStorage::commit) mutates; it is the single place
/// where the optimistic concurrency check and the tracking check happen.
pub trait EventStorage: Send + Sync + fmt::Debug {
    /// Atomically record every append and the tracking record of `commit`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::ConcurrencyConflict`] if any stream is not at its
    ///   expected version.
    /// - [`StorageError::TrackingConflict`] if the tracking position does not
    ///   advance.
    /// - [`StorageError::Io`] / [`StorageError::Serialization`] if the
    ///   backend cannot persist the commit. Nothing is recorded in any case.
    fn commit(&self, commit: Commit) -> Result<CommitReceipt, StorageError>;

    /// Read a stream's events with `version > after_version`, in version order.
    ///
    /// An unknown stream yields an empty vector.
    fn read_stream(
        &self,
        stream_id: Uuid,
        after_version: u64,
    ) -> Result<Vec<StoredEvent>, StorageError>;

    /// Current version of a stream (0 when the stream has no events).
    fn stream_version(&self, stream_id: Uuid) -> Result<u64, StorageError>;

    /// Read up to `limit` events with `global_position > after_position`.
    fn read_notifications(
        &self,
        after_position: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StorageError>;

    /// Global position of the newest event (0 for an empty store).
    fn head_position(&self) -> Result<u64, StorageError>;

    /// Tracking position recorded for `(downstream, upstream)` (0 when none).
    fn tracking_position(&self, downstream: &str, upstream: &str) -> Result<u64, StorageError>;
}

/// A validated commit with versions and positions assigned, ready to be made
/// durable and then applied to the index.
///
/// This is also the on-disk record format of the file journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct CommitRecord {
    pub events: Vec<StoredEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking: Option<TrackingRecord>,
}

impl CommitRecord {
    /// Returns `true` if applying the record would change nothing.
    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty() && self.tracking.is_none()
    }
}

/// In-memory index over committed events and tracking records.
///
/// Index `i` of `events` holds global position `i + 1`; each entry of
/// `streams` lists indices into `events`, so entry `j` is version `j + 1`.
#[derive(Debug, Default)]
pub(crate) struct EventIndex {
    events: Vec<StoredEvent>,
    streams: HashMap<Uuid, Vec<usize>>,
    tracking: HashMap<(String, String), u64>,
}

impl EventIndex {
    pub(crate) fn stream_version(&self, stream_id: &Uuid) -> u64 {
        self.streams
            .get(stream_id)
            .map_or(0, |indices| indices.len() as u64)
    }

    pub(crate) fn head_position(&self) -> u64 {
        self.events.len() as u64
    }

    pub(crate) fn tracking_position(&self, downstream: &str, upstream: &str) -> u64 {
        self.tracking
            .get(&(downstream.to_owned(), upstream.to_owned()))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn read_stream(&self, stream_id: &Uuid, after_version: u64) -> Vec<StoredEvent> {
        let Some(indices) = self.streams.get(stream_id) else {
            return Vec::new();
        };
        indices
            .iter()
            .skip(after_version.min(indices.len() as u64) as usize)
            .map(|&i| self.events[i].clone())
            .collect()
    }

    pub(crate) fn read_notifications(&self, after_position: u64, limit: usize) -> Vec<StoredEvent> {
        let start = after_position.min(self.head_position()) as usize;
        let end = start.saturating_add(limit).min(self.events.len());
        self.events[start..end].to_vec()
    }

    /// Validate `commit` against the current state and assign versions and
    /// positions. Does not modify the index.
    pub(crate) fn prepare(&self, commit: Commit) -> Result<CommitRecord, StorageError> {
        if let Some(tracking) = &commit.tracking {
            let recorded = self.tracking_position(&tracking.downstream, &tracking.upstream);
            if tracking.position <= recorded {
                return Err(StorageError::TrackingConflict {
                    downstream: tracking.downstream.clone(),
                    upstream: tracking.upstream.clone(),
                    recorded,
                    attempted: tracking.position,
                });
            }
        }

        let recorded_at = now_millis();
        let mut next_position = self.head_position() + 1;
        // Versions reached by earlier appends of this same commit.
        let mut pending: HashMap<Uuid, u64> = HashMap::new();
        let mut events = Vec::new();

        for append in commit.appends {
            let actual = pending
                .get(&append.stream_id)
                .copied()
                .unwrap_or_else(|| self.stream_version(&append.stream_id));
            if append.expected_version != actual {
                return Err(StorageError::ConcurrencyConflict {
                    stream_id: append.stream_id,
                    expected: append.expected_version,
                    actual,
                });
            }

            let mut version = actual;
            for proposed in append.events {
                version += 1;
                events.push(StoredEvent {
                    event_id: proposed.event_id,
                    stream_id: append.stream_id,
                    version,
                    global_position: next_position,
                    event_type: proposed.event_type,
                    payload: proposed.payload,
                    metadata: proposed.metadata,
                    recorded_at,
                });
                next_position += 1;
            }
            pending.insert(append.stream_id, version);
        }

        Ok(CommitRecord {
            events,
            tracking: commit.tracking,
        })
    }

    /// Apply a record produced by [`prepare`](EventIndex::prepare) (or read
    /// back from a journal).
    ///
    /// # Errors
    ///
    /// Returns a description of the first discontinuity if the record does
    /// not extend the index exactly; the index is left unchanged.
    pub(crate) fn apply(&mut self, record: CommitRecord) -> Result<(), String> {
        let mut expected_position = self.head_position() + 1;
        let mut versions: HashMap<Uuid, u64> = HashMap::new();
        for event in &record.events {
            let current = versions
                .get(&event.stream_id)
                .copied()
                .unwrap_or_else(|| self.stream_version(&event.stream_id));
            if event.global_position != expected_position || event.version != current + 1 {
                return Err(format!(
                    "event {} at position {} version {} does not extend position {} version {}",
                    event.event_id,
                    event.global_position,
                    event.version,
                    expected_position - 1,
                    current
                ));
            }
            versions.insert(event.stream_id, event.version);
            expected_position += 1;
        }

        for event in record.events {
            let index = self.events.len();
            self.streams.entry(event.stream_id).or_default().push(index);
            self.events.push(event);
        }
        if let Some(tracking) = record.tracking {
            self.tracking
                .insert((tracking.downstream, tracking.upstream), tracking.position);
        }
        Ok(())
    }
}

/// Milliseconds since the Unix epoch, or 0 if the clock is before it.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Volatile storage backend. Commits are atomic but vanish with the process.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    index: RwLock<EventIndex>,
}

impl InMemoryStorage {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStorage for InMemoryStorage {
    fn commit(&self, commit: Commit) -> Result<CommitReceipt, StorageError> {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let record = index.prepare(commit)?;
        if record.is_empty() {
            return Ok(CommitReceipt::default());
        }
        let receipt = CommitReceipt {
            events: record.events.clone(),
        };
        index.apply(record).map_err(|detail| StorageError::Corrupt {
            line: 0,
            detail,
        })?;
        Ok(receipt)
    }

    fn read_stream(
        &self,
        stream_id: Uuid,
        after_version: u64,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(index.read_stream(&stream_id, after_version))
    }

    fn stream_version(&self, stream_id: Uuid) -> Result<u64, StorageError> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(index.stream_version(&stream_id))
    }

    fn read_notifications(
        &self,
        after_position: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(index.read_notifications(after_position, limit))
    }

    fn head_position(&self) -> Result<u64, StorageError> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(index.head_position())
    }

    fn tracking_position(&self, downstream: &str, upstream: &str) -> Result<u64, StorageError> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(index.tracking_position(downstream, upstream))
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Wraps an [`InMemoryStorage`] and fails the next `n` commits with an
    /// I/O error, to exercise commit-failure recovery.
    #[derive(Debug, Default)]
    pub(crate) struct FlakyStorage {
        pub inner: InMemoryStorage,
        pub failures_left: AtomicUsize,
    }

    impl FlakyStorage {
        pub(crate) fn failing(n: usize) -> Self {
            Self {
                inner: InMemoryStorage::new(),
                failures_left: AtomicUsize::new(n),
            }
        }
    }

    impl EventStorage for FlakyStorage {
        fn commit(&self, commit: Commit) -> Result<CommitReceipt, StorageError> {
            let injected = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(StorageError::Io(std::io::Error::other("injected failure")));
            }
            self.inner.commit(commit)
        }

        fn read_stream(&self, id: Uuid, after: u64) -> Result<Vec<StoredEvent>, StorageError> {
            self.inner.read_stream(id, after)
        }

        fn stream_version(&self, id: Uuid) -> Result<u64, StorageError> {
            self.inner.stream_version(id)
        }

        fn read_notifications(&self, after: u64, limit: usize) -> Result<Vec<StoredEvent>, StorageError> {
            self.inner.read_notifications(after, limit)
        }

        fn head_position(&self) -> Result<u64, StorageError> {
            self.inner.head_position()
        }

        fn tracking_position(&self, downstream: &str, upstream: &str) -> Result<u64, StorageError> {
            self.inner.tracking_position(downstream, upstream)
        }
    }
}
