//! Aggregate trait and replay helpers.

use serde::{Serialize, de::DeserializeOwned};

use crate::event::{StoredEvent, decode_domain_event};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state. State is
/// built by folding domain events through [`apply`](Aggregate::apply).
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a pure decision function: no I/O,
///   no side effects. It validates a command against the current state and
///   returns zero or more events.
/// - [`apply`](Aggregate::apply) must be a pure, total function. Replaying
///   the same events always yields the same state.
/// - `DomainEvent` must use adjacently tagged serde
///   (`#[serde(tag = "type", content = "data")]`); the tag becomes the
///   stored event kind.
pub trait Aggregate: Default + Clone + Send + Sync + 'static {
    /// Identifies this aggregate type (e.g. "email-message").
    const AGGREGATE_TYPE: &'static str;

    /// The set of commands this aggregate can handle.
    type Command: Send + 'static;

    /// The set of events this aggregate can produce and apply.
    type DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone + 'static;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate a command against the current state and produce events.
    ///
    /// Returns `Ok(vec![])` if the command is a no-op and `Err` to reject it.
    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::DomainEvent) -> Self;
}

/// Fold stored events into `state`, in the order given.
///
/// Events whose kind does not decode into `A::DomainEvent` are skipped,
/// which keeps old code able to replay streams written by newer code.
///
/// # Arguments
///
/// * `state` - The state to start from (`A::default()` for a full replay,
///   or a cached snapshot).
/// * `events` - Stored events of one stream, in version order.
///
/// # Returns
///
/// The state after every recognised event has been applied.
pub fn replay<'a, A: Aggregate>(state: A, events: impl IntoIterator<Item = &'a StoredEvent>) -> A {
    events.into_iter().fold(state, |state, stored| {
        match decode_domain_event::<A>(&stored.event_type, &stored.payload) {
            Some(event) => state.apply(&event),
            None => {
                tracing::debug!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    event_type = %stored.event_type,
                    "skipping unrecognised event during replay"
                );
                state
            }
        }
    })
}
