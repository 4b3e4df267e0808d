//! The [`EventStore`] facade and backend selection.
//!
//! An `EventStore` is a cheap-to-clone handle over one storage boundary.
//! Applications, notification logs, and process applications all talk to
//! storage through it, never to a backend directly.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::StorageError;
use crate::event::{ProposedEvent, StoredEvent};
use crate::journal::FileJournal;
use crate::notification::NotificationLog;
use crate::storage::{Commit, CommitReceipt, EventStorage, InMemoryStorage};

/// Environment variable selecting the backend (`memory` or `file`).
pub const PERSISTENCE_ENV: &str = "EVENTFOLD_PERSISTENCE";

/// Environment variable naming the data directory of the file backend.
pub const DATA_DIR_ENV: &str = "EVENTFOLD_DATA_DIR";

/// Data directory used when [`DATA_DIR_ENV`] is unset.
pub const DEFAULT_DATA_DIR: &str = "eventfold-data";

/// Versions and positions assigned to a single-stream append.
///
/// For an append of no events, `first_version > last_version` and both
/// positions are 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedRange {
    /// Version of the first appended event.
    pub first_version: u64,
    /// Version of the last appended event (the stream's new version).
    pub last_version: u64,
    /// Global position of the first appended event.
    pub first_position: u64,
    /// Global position of the last appended event.
    pub last_position: u64,
}

impl CommittedRange {
    /// Returns `true` if the append recorded no events.
    pub fn is_empty(&self) -> bool {
        self.first_version > self.last_version
    }
}

/// Handle to one storage boundary.
///
/// `Clone` is cheap: the backend is `Arc`-wrapped.
#[derive(Debug, Clone)]
pub struct EventStore {
    storage: Arc<dyn EventStorage>,
}

impl EventStore {
    /// Wrap an existing backend.
    pub fn new(storage: Arc<dyn EventStorage>) -> Self {
        Self { storage }
    }

    /// Create a store over a fresh [`InMemoryStorage`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStorage::new()))
    }

    /// Open a store over a [`FileJournal`] in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the journal cannot be opened or recovered.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let journal = FileJournal::open(dir.into())?;
        Ok(Self::new(Arc::new(journal)))
    }

    /// The underlying backend.
    pub fn storage(&self) -> &Arc<dyn EventStorage> {
        &self.storage
    }

    /// Append `events` to one stream, expecting it at `expected_version`.
    ///
    /// # Arguments
    ///
    /// * `stream_id` - Target stream.
    /// * `expected_version` - Version the caller's decision was based on
    ///   (0 for a new stream).
    /// * `events` - Events to append, in order.
    ///
    /// # Returns
    ///
    /// The versions and global positions assigned to the events.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ConcurrencyConflict`] if the stream moved on,
    /// or an I/O error from the backend. Nothing is appended on error.
    pub fn append(
        &self,
        stream_id: Uuid,
        expected_version: u64,
        events: Vec<ProposedEvent>,
    ) -> Result<CommittedRange, StorageError> {
        let receipt = self
            .storage
            .commit(Commit::new().append(stream_id, expected_version, events))?;
        Ok(match (receipt.events.first(), receipt.events.last()) {
            (Some(first), Some(last)) => CommittedRange {
                first_version: first.version,
                last_version: last.version,
                first_position: first.global_position,
                last_position: last.global_position,
            },
            _ => CommittedRange {
                first_version: expected_version + 1,
                last_version: expected_version,
                first_position: 0,
                last_position: 0,
            },
        })
    }

    /// Atomically record a multi-stream commit with optional tracking.
    ///
    /// # Errors
    ///
    /// See [`EventStorage::commit`].
    pub fn commit(&self, commit: Commit) -> Result<CommitReceipt, StorageError> {
        self.storage.commit(commit)
    }

    /// Read a whole stream from version 1.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend read fails.
    pub fn read(&self, stream_id: Uuid) -> Result<Vec<StoredEvent>, StorageError> {
        self.storage.read_stream(stream_id, 0)
    }

    /// Read a stream's events after `after_version`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend read fails.
    pub fn read_after(
        &self,
        stream_id: Uuid,
        after_version: u64,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        self.storage.read_stream(stream_id, after_version)
    }

    /// Current version of a stream (0 when it has no events).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend read fails.
    pub fn stream_version(&self, stream_id: Uuid) -> Result<u64, StorageError> {
        self.storage.stream_version(stream_id)
    }

    /// The notification log of this store, published under `name`.
    pub fn notification_log(&self, name: impl Into<String>) -> NotificationLog {
        NotificationLog::new(name, Arc::clone(&self.storage))
    }

    /// Position `downstream` has consumed of `upstream`'s log (0 when none).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend read fails.
    pub fn tracking_position(&self, downstream: &str, upstream: &str) -> Result<u64, StorageError> {
        self.storage.tracking_position(downstream, upstream)
    }
}

/// Which backend an [`EventStore`] should use.
///
/// # Examples
///
/// ```
/// use eventfold_process::StorageConfig;
///
/// let store = StorageConfig::InMemory.open().expect("in-memory open cannot fail");
/// assert!(store.read(uuid::Uuid::new_v4()).unwrap().is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StorageConfig {
    /// Volatile in-memory storage.
    #[default]
    InMemory,
    /// Durable commit journal in `dir`.
    File {
        /// Data directory holding the journal.
        dir: PathBuf,
    },
}

impl StorageConfig {
    /// Read the backend choice from [`PERSISTENCE_ENV`] and [`DATA_DIR_ENV`].
    ///
    /// An unset or empty `EVENTFOLD_PERSISTENCE` selects in-memory storage.
    ///
    /// # Errors
    ///
    /// Returns `io::ErrorKind::InvalidInput` for an unrecognised backend name.
    pub fn from_env() -> io::Result<Self> {
        let persistence = std::env::var(PERSISTENCE_ENV).ok();
        let data_dir = std::env::var(DATA_DIR_ENV).ok();
        Self::from_values(persistence.as_deref(), data_dir.as_deref())
    }

    fn from_values(persistence: Option<&str>, data_dir: Option<&str>) -> io::Result<Self> {
        match persistence.map(str::trim).unwrap_or("") {
            "" | "memory" => Ok(Self::InMemory),
            "file" => Ok(Self::File {
                dir: PathBuf::from(data_dir.unwrap_or(DEFAULT_DATA_DIR)),
            }),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown {PERSISTENCE_ENV} value {other:?}; expected \"memory\" or \"file\""),
            )),
        }
    }

    /// Open the configured store.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the file backend cannot be opened.
    pub fn open(&self) -> Result<EventStore, StorageError> {
        match self {
            Self::InMemory => Ok(EventStore::in_memory()),
            Self::File { dir } => {
                tracing::info!(dir = %dir.display(), "opening file-backed event store");
                EventStore::open(dir.clone())
            }
        }
    }
}
