//! Process applications: policies that follow another application's
//! notification log.
//!
//! A [`ProcessApplication`] reads notifications after its tracking position,
//! feeds each one to a [`Policy`], executes the resulting commands against
//! its own aggregates, and records the produced events together with the
//! new tracking position in one atomic [`Commit`]. A notification's effects
//! are therefore recorded exactly once even though notifications may be
//! read more than once.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;

use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::application::{Application, encode_all};
use crate::command::CommandContext;
use crate::error::{ProcessError, StorageError};
use crate::event::{Causation, Notification, ProposedEvent};
use crate::notification::NotificationLog;
use crate::snapshot::Snapshot;
use crate::storage::{Commit, TrackingRecord};

/// Default number of notifications pulled per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Reaction of a downstream application to upstream events.
///
/// # Contract
///
/// - [`react`](Policy::react) dispatches on the upstream event variant;
///   variants it does not care about yield no commands.
/// - It must guard on the target's state so that seeing the same
///   notification again issues no commands. The store's tracking check
///   makes redelivery rare, but a policy must never depend on it alone.
/// - Any boundary call (sending mail, calling a service) happens inside
///   `react`. A failing call must be turned into a command that records
///   the failure rather than a panic.
pub trait Policy: Send + Sync + 'static {
    /// Aggregate whose events this policy reacts to.
    type Upstream: Aggregate;

    /// Aggregate the produced commands are executed against.
    type Target: Aggregate;

    /// Which target aggregate a notification concerns.
    ///
    /// Defaults to the notification's own stream id.
    fn target_id(&self, notification: &Notification) -> Uuid {
        notification.stream_id
    }

    /// Decide which commands to run against `target` in response to `event`.
    ///
    /// # Arguments
    ///
    /// * `event` - The decoded upstream event.
    /// * `target` - Current state of the target aggregate, including the
    ///   effects of earlier notifications in the same batch.
    fn react(
        &self,
        event: &<Self::Upstream as Aggregate>::DomainEvent,
        target: &Self::Target,
    ) -> Vec<<Self::Target as Aggregate>::Command>;
}

/// Outcome of one batch of an edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// Name of the upstream log.
    pub upstream: String,
    /// Notifications consumed.
    pub notifications: usize,
    /// Events committed downstream.
    pub events: usize,
    /// Tracking position after the batch.
    pub position: u64,
}

impl BatchReport {
    /// Returns `true` if the batch consumed anything.
    pub fn made_progress(&self) -> bool {
        self.notifications > 0
    }
}

/// A downstream consumer the runner can drive without knowing its policy
/// type.
pub trait Follower: Send + Sync {
    /// Name of the consuming application.
    fn name(&self) -> &str;

    /// Process at most `limit` notifications of `upstream` after this
    /// follower's tracking position.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] if nothing could be recorded; the tracking
    /// position is then unchanged.
    fn pull_and_process(
        &self,
        upstream: &NotificationLog,
        limit: usize,
    ) -> Result<BatchReport, ProcessError>;
}

/// An application whose aggregates are driven by a [`Policy`].
pub struct ProcessApplication<P: Policy> {
    app: Application<P::Target>,
    policy: P,
    batch_size: usize,
}

impl<P: Policy> fmt::Debug for ProcessApplication<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessApplication")
            .field("app", &self.app)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl<P: Policy> ProcessApplication<P> {
    /// Drive `app`'s aggregates with `policy`.
    pub fn new(app: Application<P::Target>, policy: P) -> Self {
        Self {
            app,
            policy,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Set how many notifications [`process_next_batch`] pulls at once.
    ///
    /// [`process_next_batch`]: ProcessApplication::process_next_batch
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// The application this process writes to.
    pub fn application(&self) -> &Application<P::Target> {
        &self.app
    }

    /// The policy driving this process.
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Process the next batch of `upstream` notifications.
    ///
    /// # Errors
    ///
    /// - [`ProcessError::Fetch`] if the tracking position or the upstream log
    ///   cannot be read.
    /// - [`ProcessError::Load`] if a target aggregate cannot be loaded.
    /// - [`ProcessError::Policy`] if the target rejects a policy's command.
    /// - [`ProcessError::Encode`] if a produced event cannot be serialized.
    /// - [`ProcessError::TrackingCommit`] if the atomic commit fails.
    ///
    /// In every case nothing is recorded and the next call starts from the
    /// same tracking position.
    pub fn process_next_batch(&self, upstream: &NotificationLog) -> Result<BatchReport, ProcessError> {
        self.process_batch(upstream, self.batch_size)
    }

    fn process_batch(
        &self,
        upstream: &NotificationLog,
        limit: usize,
    ) -> Result<BatchReport, ProcessError> {
        let limit = limit.max(1);
        let downstream = self.app.name();
        let _span = tracing::debug_span!(
            "process_batch",
            downstream,
            upstream = upstream.name()
        )
        .entered();

        let last_position = self
            .app
            .store()
            .tracking_position(downstream, upstream.name())
            .map_err(ProcessError::Fetch)?;
        let notifications = upstream
            .read_notifications(last_position, limit)
            .map_err(ProcessError::Fetch)?;

        let Some(position) = notifications.last().map(|n| n.position) else {
            tracing::debug!(position = last_position, "no new notifications");
            return Ok(BatchReport {
                upstream: upstream.name().to_owned(),
                notifications: 0,
                events: 0,
                position: last_position,
            });
        };

        let mut unit = ProcessingUnit::new(&self.app);
        for notification in &notifications {
            self.apply_policy(&mut unit, upstream.name(), notification)?;
        }

        let tracking = TrackingRecord {
            downstream: downstream.to_owned(),
            upstream: upstream.name().to_owned(),
            position,
        };
        let events = unit.commit(tracking).map_err(ProcessError::TrackingCommit)?;

        tracing::info!(
            position,
            notifications = notifications.len(),
            count = events,
            "batch committed"
        );
        Ok(BatchReport {
            upstream: upstream.name().to_owned(),
            notifications: notifications.len(),
            events,
            position,
        })
    }

    /// Run the policy for one notification, collecting its effects in `unit`.
    fn apply_policy(
        &self,
        unit: &mut ProcessingUnit<'_, P::Target>,
        upstream: &str,
        notification: &Notification,
    ) -> Result<(), ProcessError> {
        if notification.metadata.aggregate_type != <P::Upstream as Aggregate>::AGGREGATE_TYPE {
            return Ok(());
        }
        let Some(event) = notification.decode::<P::Upstream>() else {
            tracing::debug!(
                position = notification.position,
                event_type = %notification.event_type,
                "skipping notification of unknown kind"
            );
            return Ok(());
        };

        let stream_id = self.policy.target_id(notification);
        let target = unit
            .entry(stream_id)
            .map_err(|source| ProcessError::Load { stream_id, source })?;
        let commands = self.policy.react(&event, &target.state);
        if commands.is_empty() {
            return Ok(());
        }

        let mut ctx = CommandContext::default().with_actor(self.app.name());
        if let Some(id) = &notification.metadata.correlation_id {
            ctx = ctx.with_correlation_id(id.clone());
        }
        let causation = Causation {
            upstream: upstream.to_owned(),
            position: notification.position,
        };

        for cmd in commands {
            let events = target.state.handle(cmd).map_err(|e| {
                tracing::error!(
                    %stream_id,
                    position = notification.position,
                    error = %e,
                    "policy command rejected"
                );
                ProcessError::Policy {
                    stream_id,
                    source: Box::new(e),
                }
            })?;
            let proposed = encode_all::<P::Target>(&events, &ctx, Some(&causation))
                .map_err(|source| ProcessError::Encode { stream_id, source })?;
            let state = std::mem::take(&mut target.state);
            target.state = events.iter().fold(state, |s, e| s.apply(e));
            target.pending.extend(proposed);
        }
        Ok(())
    }
}

impl<P: Policy> Follower for ProcessApplication<P> {
    fn name(&self) -> &str {
        self.app.name()
    }

    fn pull_and_process(
        &self,
        upstream: &NotificationLog,
        limit: usize,
    ) -> Result<BatchReport, ProcessError> {
        self.process_batch(upstream, limit)
    }
}

/// A target aggregate touched during a batch.
struct Touched<A> {
    state: A,
    /// Stream version the batch's decisions are based on.
    base_version: u64,
    /// Events produced so far, not yet committed.
    pending: Vec<ProposedEvent>,
}

/// Collects the effects of one batch so that later notifications see the
/// effects of earlier ones before anything is committed.
struct ProcessingUnit<'a, A: Aggregate> {
    app: &'a Application<A>,
    touched: HashMap<Uuid, Touched<A>>,
    /// First-touch order, which fixes the order of appends in the commit.
    order: Vec<Uuid>,
}

impl<'a, A: Aggregate> ProcessingUnit<'a, A> {
    fn new(app: &'a Application<A>) -> Self {
        Self {
            app,
            touched: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn entry(&mut self, stream_id: Uuid) -> Result<&mut Touched<A>, StorageError> {
        match self.touched.entry(stream_id) {
            Entry::Occupied(touched) => Ok(touched.into_mut()),
            Entry::Vacant(slot) => {
                let (state, base_version) = self.app.load_or_default(stream_id)?;
                self.order.push(stream_id);
                Ok(slot.insert(Touched {
                    state,
                    base_version,
                    pending: Vec::new(),
                }))
            }
        }
    }

    /// Commit every pending event and the tracking record as one unit.
    ///
    /// Returns the number of events committed.
    fn commit(mut self, tracking: TrackingRecord) -> Result<usize, StorageError> {
        let mut commit = Commit::new().with_tracking(tracking);
        let mut appended = Vec::new();
        for stream_id in &self.order {
            if let Some(touched) = self.touched.get_mut(stream_id)
                && !touched.pending.is_empty()
            {
                let events = std::mem::take(&mut touched.pending);
                appended.push((*stream_id, touched.base_version + events.len() as u64));
                commit = commit.append(*stream_id, touched.base_version, events);
            }
        }

        let receipt = self.app.store().commit(commit)?;
        for (stream_id, stream_version) in appended {
            if let Some(touched) = self.touched.remove(&stream_id) {
                self.app.cache().put(
                    stream_id,
                    Snapshot {
                        state: touched.state,
                        stream_version,
                    },
                );
            }
        }
        Ok(receipt.events.len())
    }
}
