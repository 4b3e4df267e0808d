//! Event-sourced applications connected into a processing pipeline.
//!
//! An [`Application`] records the events of its aggregates in an
//! [`EventStore`]. Every store exposes its events as a totally ordered
//! [`NotificationLog`]. A [`ProcessApplication`] follows a log, feeds each
//! notification to its [`Policy`], and commits the resulting events together
//! with its new tracking position. A [`Runner`] drives the edges of a
//! pipeline, on the calling thread or on worker threads.
//!
//! The [`email`] module builds the email delivery pipeline on top of these
//! pieces.

mod aggregate;
mod application;
mod command;
pub mod email;
mod error;
mod event;
mod journal;
mod notification;
mod process;
mod runner;
mod snapshot;
mod storage;
mod store;

pub use aggregate::{Aggregate, replay};
pub use application::{Application, DEFAULT_MAX_RETRIES};
pub use command::CommandContext;
pub use error::{ExecuteError, ProcessError, StateError, StorageError};
pub use event::{
    Causation, EventMetadata, Notification, ProposedEvent, StoredEvent, decode_domain_event,
    encode_domain_event,
};
pub use journal::{FileJournal, JOURNAL_FILE};
pub use notification::{NotificationLog, Pages};
pub use process::{BatchReport, DEFAULT_BATCH_SIZE, Follower, Policy, ProcessApplication};
pub use runner::{Edge, Runner, RunnerConfig, Scheduling};
pub use snapshot::{Snapshot, SnapshotCache};
pub use storage::{
    Commit, CommitReceipt, EventStorage, InMemoryStorage, StreamAppend, TrackingRecord,
};
pub use store::{
    CommittedRange, DATA_DIR_ENV, DEFAULT_DATA_DIR, EventStore, PERSISTENCE_ENV, StorageConfig,
};
