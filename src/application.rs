//! Command side of one application: load, decide, append.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::aggregate::{Aggregate, replay};
use crate::command::CommandContext;
use crate::error::{ExecuteError, StateError, StorageError};
use crate::event::{Causation, ProposedEvent, encode_domain_event};
use crate::notification::NotificationLog;
use crate::snapshot::{Snapshot, SnapshotCache};
use crate::store::EventStore;

/// Maximum number of optimistic concurrency retries before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// An application owning the streams of aggregate type `A` in one store.
///
/// Commands are executed by loading the aggregate (snapshot plus catch-up),
/// running [`Aggregate::handle`], and appending the produced events with
/// the loaded version as the expected version. A concurrent writer makes
/// the append fail; the command is then re-run against fresh state.
///
/// `Clone` is cheap: the store and snapshot cache are shared.
pub struct Application<A: Aggregate> {
    name: Arc<str>,
    store: EventStore,
    cache: Arc<SnapshotCache<A>>,
    max_retries: u32,
}

impl<A: Aggregate> Clone for Application<A> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            store: self.store.clone(),
            cache: Arc::clone(&self.cache),
            max_retries: self.max_retries,
        }
    }
}

impl<A: Aggregate> fmt::Debug for Application<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.name)
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl<A: Aggregate> Application<A> {
    /// Create an application named `name` over `store`.
    pub fn new(name: impl Into<String>, store: EventStore) -> Self {
        Self {
            name: Arc::from(name.into()),
            store,
            cache: Arc::new(SnapshotCache::new()),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Set how many times a conflicting command is re-run.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Application name; also the name of its notification log.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The store this application writes to.
    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub(crate) fn cache(&self) -> &SnapshotCache<A> {
        &self.cache
    }

    /// This application's notification log.
    pub fn notification_log(&self) -> NotificationLog {
        self.store.notification_log(self.name())
    }

    /// Start a new aggregate instance.
    ///
    /// # Arguments
    ///
    /// * `cmd` - The creating command, handled against `A::default()`.
    /// * `ctx` - Actor and correlation metadata for the produced events.
    ///
    /// # Returns
    ///
    /// The new stream id and the events that were appended.
    ///
    /// # Errors
    ///
    /// - [`ExecuteError::Domain`] if the aggregate rejects the command.
    /// - [`ExecuteError::Storage`] if the append fails.
    pub fn create(
        &self,
        cmd: A::Command,
        ctx: &CommandContext,
    ) -> Result<(Uuid, Vec<A::DomainEvent>), ExecuteError<A::Error>> {
        let stream_id = Uuid::new_v4();
        let _span = tracing::info_span!(
            "execute",
            aggregate_type = A::AGGREGATE_TYPE,
            %stream_id
        )
        .entered();

        let state = A::default();
        let events = state.handle(cmd).map_err(ExecuteError::Domain)?;
        if events.is_empty() {
            return Ok((stream_id, events));
        }

        let proposed = encode_all::<A>(&events, ctx, None)?;
        let range = self
            .store
            .append(stream_id, 0, proposed)
            .map_err(|e| match e {
                StorageError::ConcurrencyConflict { .. } => ExecuteError::Conflict,
                other => ExecuteError::Storage(other),
            })?;

        self.cache.put(
            stream_id,
            Snapshot {
                state: events.iter().fold(state, |s, e| s.apply(e)),
                stream_version: range.last_version,
            },
        );
        tracing::info!(count = events.len(), "events appended");
        Ok((stream_id, events))
    }

    /// Execute a command against an existing aggregate instance.
    ///
    /// # Returns
    ///
    /// The events that were appended (empty for a no-op command).
    ///
    /// # Errors
    ///
    /// - [`ExecuteError::NotFound`] if the stream has no events.
    /// - [`ExecuteError::Domain`] if the aggregate rejects the command.
    /// - [`ExecuteError::Conflict`] if every attempt lost a race with a
    ///   concurrent writer.
    /// - [`ExecuteError::Storage`] for any other storage failure.
    pub fn execute(
        &self,
        stream_id: Uuid,
        cmd: A::Command,
        ctx: &CommandContext,
    ) -> Result<Vec<A::DomainEvent>, ExecuteError<A::Error>>
    where
        A::Command: Clone,
    {
        let _span = tracing::info_span!(
            "execute",
            aggregate_type = A::AGGREGATE_TYPE,
            %stream_id
        )
        .entered();

        for attempt in 0..=self.max_retries {
            let (state, version) = self.load_or_default(stream_id)?;
            if version == 0 {
                return Err(ExecuteError::NotFound(stream_id));
            }

            let events = state.handle(cmd.clone()).map_err(ExecuteError::Domain)?;
            if events.is_empty() {
                return Ok(events);
            }

            let proposed = encode_all::<A>(&events, ctx, None)?;
            match self.store.append(stream_id, version, proposed) {
                Ok(range) => {
                    self.cache.put(
                        stream_id,
                        Snapshot {
                            state: events.iter().fold(state, |s, e| s.apply(e)),
                            stream_version: range.last_version,
                        },
                    );
                    tracing::info!(count = events.len(), "events appended");
                    return Ok(events);
                }
                Err(e @ StorageError::ConcurrencyConflict { .. }) => {
                    tracing::warn!(attempt, error = %e, "concurrency conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ExecuteError::Conflict)
    }

    /// Current state and version of an aggregate instance.
    ///
    /// # Errors
    ///
    /// - [`StateError::NotFound`] if the stream has no events.
    /// - [`StateError::Storage`] if the read fails.
    pub fn load(&self, stream_id: Uuid) -> Result<(A, u64), StateError> {
        match self.load_or_default(stream_id)? {
            (_, 0) => Err(StateError::NotFound(stream_id)),
            loaded => Ok(loaded),
        }
    }

    /// Like [`load`](Application::load) but yields `(A::default(), 0)` for
    /// an empty stream.
    pub(crate) fn load_or_default(&self, stream_id: Uuid) -> Result<(A, u64), StorageError> {
        let cached = self.cache.get(&stream_id).unwrap_or_else(|| Snapshot {
            state: A::default(),
            stream_version: 0,
        });
        let events = self.store.read_after(stream_id, cached.stream_version)?;
        let Some(last_version) = events.last().map(|e| e.version) else {
            return Ok((cached.state, cached.stream_version));
        };

        let state = replay(cached.state, &events);
        self.cache.put(
            stream_id,
            Snapshot {
                state: state.clone(),
                stream_version: last_version,
            },
        );
        Ok((state, last_version))
    }
}

/// Encode a batch of domain events with shared metadata.
pub(crate) fn encode_all<A: Aggregate>(
    events: &[A::DomainEvent],
    ctx: &CommandContext,
    causation: Option<&Causation>,
) -> Result<Vec<ProposedEvent>, StorageError> {
    events
        .iter()
        .map(|event| encode_domain_event::<A>(event, ctx, causation.cloned()))
        .collect::<Result<_, _>>()
        .map_err(StorageError::from)
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;
    use crate::aggregate::test_fixtures::{Ledger, LedgerCommand, LedgerError, LedgerEvent};

    fn app() -> Application<Ledger> {
        Application::new("ledgers", EventStore::in_memory())
    }

    #[test]
    fn create_then_execute_then_load() {
        let app = app();
        let ctx = CommandContext::default().with_actor("teller");

        let (id, events) = app.create(LedgerCommand::Open, &ctx).unwrap();
        assert_eq!(events, vec![LedgerEvent::Opened]);

        app.execute(id, LedgerCommand::Deposit(5), &ctx).unwrap();
        app.execute(id, LedgerCommand::Deposit(2), &ctx).unwrap();

        let (state, version) = app.load(id).unwrap();
        assert_eq!(state.balance, 7);
        assert_eq!(version, 3);

        let stored = app.store().read(id).unwrap();
        assert_eq!(stored[0].metadata.actor.as_deref(), Some("teller"));
        assert_eq!(stored[0].metadata.aggregate_type, "ledger");
    }

    #[test]
    fn load_unknown_id_is_not_found() {
        let id = Uuid::new_v4();
        assert!(matches!(app().load(id), Err(StateError::NotFound(found)) if found == id));
    }

    #[test]
    fn execute_unknown_id_is_not_found() {
        let result = app().execute(
            Uuid::new_v4(),
            LedgerCommand::Deposit(1),
            &CommandContext::default(),
        );
        assert!(matches!(result, Err(ExecuteError::NotFound(_))));
    }

    #[test]
    fn rejected_command_appends_nothing() {
        let app = app();
        let ctx = CommandContext::default();
        let (id, _) = app.create(LedgerCommand::Open, &ctx).unwrap();

        let result = app.execute(id, LedgerCommand::Open, &ctx);
        assert!(matches!(
            result,
            Err(ExecuteError::Domain(LedgerError::AlreadyOpen))
        ));
        assert_eq!(app.store().stream_version(id).unwrap(), 1);
    }

    #[test]
    fn no_op_command_appends_nothing() {
        let app = app();
        let ctx = CommandContext::default();
        let (id, _) = app.create(LedgerCommand::Open, &ctx).unwrap();
        let events = app.execute(id, LedgerCommand::Deposit(0), &ctx).unwrap();
        assert!(events.is_empty());
        assert_eq!(app.store().stream_version(id).unwrap(), 1);
    }

    #[test]
    fn load_catches_up_with_writes_from_another_application() {
        let store = EventStore::in_memory();
        let a = Application::<Ledger>::new("ledgers", store.clone());
        let b = Application::<Ledger>::new("ledgers", store);
        let ctx = CommandContext::default();

        let (id, _) = a.create(LedgerCommand::Open, &ctx).unwrap();
        a.execute(id, LedgerCommand::Deposit(1), &ctx).unwrap();
        // Warm `b`'s cache, then write through `a`.
        assert_eq!(b.load(id).unwrap().0.balance, 1);
        a.execute(id, LedgerCommand::Deposit(10), &ctx).unwrap();

        assert_eq!(b.load(id).unwrap(), (Ledger { open: true, balance: 11 }, 3));
    }

    #[test]
    fn concurrent_executes_both_land_via_retry() {
        let store = EventStore::in_memory();
        let ctx = CommandContext::default();
        let (id, _) = Application::<Ledger>::new("ledgers", store.clone())
            .create(LedgerCommand::Open, &ctx)
            .unwrap();

        let barrier = Barrier::new(2);
        std::thread::scope(|s| {
            for amount in [3, 4] {
                let app = Application::<Ledger>::new("ledgers", store.clone());
                let barrier = &barrier;
                let ctx = &ctx;
                s.spawn(move || {
                    barrier.wait();
                    app.execute(id, LedgerCommand::Deposit(amount), ctx)
                        .expect("retry should resolve the conflict");
                });
            }
        });

        let (state, version) = app_over(store).load(id).unwrap();
        assert_eq!(state.balance, 7);
        assert_eq!(version, 3);
    }

    #[test]
    fn cached_state_is_caught_up_before_deciding() {
        let store = EventStore::in_memory();
        let ctx = CommandContext::default();
        let app = Application::<Ledger>::new("ledgers", store.clone()).with_max_retries(0);
        let (id, _) = app.create(LedgerCommand::Open, &ctx).unwrap();
        app.load(id).unwrap();
        app_over(store)
            .execute(id, LedgerCommand::Deposit(1), &ctx)
            .unwrap();

        app.execute(id, LedgerCommand::Deposit(1), &ctx).unwrap();
        assert_eq!(app.load(id).unwrap().0.balance, 2);
    }

    /// Accepts reads but rejects every commit as a lost race.
    #[derive(Debug, Default)]
    struct AlwaysConflicting {
        inner: crate::storage::InMemoryStorage,
        attempts: std::sync::atomic::AtomicU32,
    }

    impl crate::storage::EventStorage for AlwaysConflicting {
        fn commit(
            &self,
            commit: crate::storage::Commit,
        ) -> Result<crate::storage::CommitReceipt, StorageError> {
            self.attempts
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let append = &commit.appends[0];
            Err(StorageError::ConcurrencyConflict {
                stream_id: append.stream_id,
                expected: append.expected_version,
                actual: append.expected_version + 1,
            })
        }

        fn read_stream(
            &self,
            id: Uuid,
            after: u64,
        ) -> Result<Vec<crate::event::StoredEvent>, StorageError> {
            self.inner.read_stream(id, after)
        }

        fn stream_version(&self, id: Uuid) -> Result<u64, StorageError> {
            self.inner.stream_version(id)
        }

        fn read_notifications(
            &self,
            after: u64,
            limit: usize,
        ) -> Result<Vec<crate::event::StoredEvent>, StorageError> {
            self.inner.read_notifications(after, limit)
        }

        fn head_position(&self) -> Result<u64, StorageError> {
            self.inner.head_position()
        }

        fn tracking_position(&self, d: &str, u: &str) -> Result<u64, StorageError> {
            self.inner.tracking_position(d, u)
        }
    }

    #[test]
    fn exhausted_retries_surface_conflict() {
        let storage = Arc::new(AlwaysConflicting::default());
        let ctx = CommandContext::default();
        let id = Uuid::new_v4();
        let opened = encode_all::<Ledger>(&[LedgerEvent::Opened], &ctx, None).unwrap();
        crate::storage::EventStorage::commit(
            &storage.inner,
            crate::storage::Commit::new().append(id, 0, opened),
        )
        .unwrap();

        let app = Application::<Ledger>::new("ledgers", EventStore::new(storage.clone()))
            .with_max_retries(2);
        let result = app.execute(id, LedgerCommand::Deposit(1), &ctx);

        assert!(matches!(result, Err(ExecuteError::Conflict)));
        assert_eq!(
            storage.attempts.load(std::sync::atomic::Ordering::SeqCst),
            3
        );
    }

    fn app_over(store: EventStore) -> Application<Ledger> {
        Application::new("ledgers", store)
    }
}
