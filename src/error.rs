//! Crate-level error types for storage, command execution, state retrieval,
//! and notification processing.

use uuid::Uuid;

/// Error returned by an [`EventStorage`](crate::storage::EventStorage) backend.
///
/// A failed commit never leaves partial effects: either every event and the
/// tracking record of a [`Commit`](crate::storage::Commit) are recorded, or
/// none of them are.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A stream was not at the version the writer expected.
    ///
    /// Retryable: the writer must re-read the stream and decide again.
    #[error(
        "concurrency conflict on stream {stream_id}: expected version {expected}, actual {actual}"
    )]
    ConcurrencyConflict {
        /// The stream whose version did not match.
        stream_id: Uuid,
        /// Version the writer based its decision on.
        expected: u64,
        /// Version the store holds.
        actual: u64,
    },

    /// A tracking record would not advance.
    ///
    /// Raised when a downstream consumer tries to record a position it has
    /// already recorded (or passed), i.e. the notification was redelivered
    /// after its effects were committed.
    #[error(
        "tracking conflict for {downstream} following {upstream}: \
         position {attempted} is not after recorded position {recorded}"
    )]
    TrackingConflict {
        /// Consuming application name.
        downstream: String,
        /// Producing application name.
        upstream: String,
        /// Position already recorded.
        recorded: u64,
        /// Position the commit tried to record.
        attempted: u64,
    },

    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An event or commit record could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The commit journal holds a damaged record followed by valid records.
    #[error("corrupt commit journal at line {line}: {detail}")]
    Corrupt {
        /// One-based line number of the damaged record.
        line: usize,
        /// Human-readable description of the damage.
        detail: String,
    },
}

impl StorageError {
    /// Returns `true` for errors that a writer resolves by re-reading and
    /// retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::ConcurrencyConflict { .. } | StorageError::TrackingConflict { .. }
        )
    }
}

/// Error returned when executing a command against an aggregate fails.
///
/// # Type Parameters
///
/// * `E` - Domain error type produced by the aggregate's command handler.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by aggregate logic.
    #[error(transparent)]
    Domain(E),

    /// Optimistic concurrency retries exhausted.
    ///
    /// Every attempt re-read the stream and found a concurrent writer had
    /// appended in between.
    #[error("optimistic concurrency conflict: retries exhausted")]
    Conflict,

    /// The target aggregate has no events.
    #[error("aggregate {0} not found")]
    NotFound(Uuid),

    /// The storage backend failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Error returned when reading the current state of an aggregate fails.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// No events were ever recorded for this aggregate id.
    #[error("aggregate {0} not found")]
    NotFound(Uuid),

    /// The storage backend failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Error returned when a process application fails to process a batch of
/// notifications.
///
/// None of these stop a runner: the edge loop logs the error, backs off,
/// and retries from the last durable tracking position.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Reading the tracking record or the upstream log failed.
    #[error("failed to fetch notifications: {0}")]
    Fetch(#[source] StorageError),

    /// Loading a target aggregate from the downstream store failed.
    #[error("failed to load aggregate {stream_id}: {source}")]
    Load {
        /// The target aggregate.
        stream_id: Uuid,
        /// Underlying storage failure.
        #[source]
        source: StorageError,
    },

    /// A policy issued a command its target aggregate rejected.
    ///
    /// Policies guard on the target's state, so this signals a bug in the
    /// policy rather than a recoverable condition.
    #[error("policy command rejected by aggregate {stream_id}: {source}")]
    Policy {
        /// The target aggregate.
        stream_id: Uuid,
        /// The aggregate's rejection.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An event produced for a target aggregate could not be serialized.
    #[error("failed to encode event for aggregate {stream_id}: {source}")]
    Encode {
        /// The target aggregate.
        stream_id: Uuid,
        /// Underlying serialization failure.
        #[source]
        source: StorageError,
    },

    /// The atomic commit of produced events plus tracking record failed.
    ///
    /// Nothing was recorded; the batch is retried from the unchanged
    /// tracking position.
    #[error("tracking commit failed: {0}")]
    TrackingCommit(#[source] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("test domain error")]
    struct TestDomainError;

    #[test]
    fn execute_error_domain_displays_inner() {
        let err: ExecuteError<TestDomainError> = ExecuteError::Domain(TestDomainError);
        assert_eq!(err.to_string(), "test domain error");
    }

    #[test]
    fn execute_error_conflict_display() {
        let err: ExecuteError<TestDomainError> = ExecuteError::Conflict;
        assert_eq!(
            err.to_string(),
            "optimistic concurrency conflict: retries exhausted"
        );
    }

    #[test]
    fn storage_error_io_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "journal missing");
        let err = StorageError::from(io_err);
        assert!(err.to_string().contains("journal missing"));
        assert!(!err.is_conflict());
    }

    #[test]
    fn conflicts_are_classified_as_retryable() {
        let concurrency = StorageError::ConcurrencyConflict {
            stream_id: Uuid::nil(),
            expected: 1,
            actual: 2,
        };
        let tracking = StorageError::TrackingConflict {
            downstream: "email".into(),
            upstream: "email".into(),
            recorded: 4,
            attempted: 4,
        };
        assert!(concurrency.is_conflict());
        assert!(tracking.is_conflict());
    }

    #[test]
    fn state_error_not_found_names_the_id() {
        let id = Uuid::new_v4();
        let err = StateError::NotFound(id);
        assert_eq!(err.to_string(), format!("aggregate {id} not found"));
    }

    #[test]
    fn process_error_keeps_source_chain() {
        use std::error::Error as _;

        let err = ProcessError::TrackingCommit(StorageError::Corrupt {
            line: 3,
            detail: "bad json".into(),
        });
        assert!(err.to_string().starts_with("tracking commit failed"));
        assert!(err.source().is_some());
    }

    // Errors cross worker threads, so they must be `Send + Sync`.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<ExecuteError<TestDomainError>>();
            assert_send_sync::<StateError>();
            assert_send_sync::<StorageError>();
            assert_send_sync::<ProcessError>();
        }
    };
}
