//! Event encoding, decoding, and the shared event types.
//!
//! This module provides the data types that the storage, application, and
//! process modules all depend on. No I/O occurs here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::command::CommandContext;

/// Identifies the notification a process application was reacting to when
/// it produced an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Causation {
    /// Name of the upstream application whose log carried the notification.
    pub upstream: String,
    /// Global position of the notification in that log.
    pub position: u64,
}

/// Infrastructure metadata stamped on every stored event.
///
/// Makes each event self-describing: consumers can recover which aggregate
/// type wrote it, who asked for it, and which notification caused it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Aggregate type name (e.g., "email-message").
    pub aggregate_type: String,
    /// Actor identity from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Correlation ID from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// The upstream notification that caused this event, for events written
    /// by a process application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation: Option<Causation>,
}

/// An event a writer wants to append to a stream.
///
/// The store assigns `version` and `global_position` when the event is
/// committed.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedEvent {
    /// Newly generated UUID v4 event ID.
    pub event_id: Uuid,
    /// Event kind, taken from the adjacently tagged domain event.
    pub event_type: String,
    /// JSON payload (the `"data"` portion of the adjacently tagged enum).
    pub payload: Value,
    /// Infrastructure metadata to stamp on the event.
    pub metadata: EventMetadata,
}

/// A committed, immutable event.
///
/// `version` is one-based and gap-free within its stream; `global_position`
/// is one-based and gap-free within its store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Writer-assigned event ID.
    pub event_id: Uuid,
    /// The stream (aggregate instance) this event belongs to.
    pub stream_id: Uuid,
    /// One-based version within the stream.
    pub version: u64,
    /// One-based position in the store's notification log.
    pub global_position: u64,
    /// Event kind (e.g., "Initiated").
    pub event_type: String,
    /// Domain event data.
    pub payload: Value,
    /// Infrastructure metadata.
    pub metadata: EventMetadata,
    /// Store-assigned timestamp (Unix epoch milliseconds).
    pub recorded_at: u64,
}

/// A read-only, globally positioned view of a committed event.
///
/// Notifications are what crosses application boundaries; they are never
/// mutated and never reference another application's in-memory state.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Position in the upstream notification log.
    pub position: u64,
    /// The stream that originated the event.
    pub stream_id: Uuid,
    /// Version of the event within its stream.
    pub stream_version: u64,
    /// Event kind.
    pub event_type: String,
    /// Domain event data.
    pub payload: Value,
    /// Infrastructure metadata.
    pub metadata: EventMetadata,
}

impl From<StoredEvent> for Notification {
    fn from(event: StoredEvent) -> Self {
        Self {
            position: event.global_position,
            stream_id: event.stream_id,
            stream_version: event.version,
            event_type: event.event_type,
            payload: event.payload,
            metadata: event.metadata,
        }
    }
}

impl Notification {
    /// Decode this notification into the domain event of aggregate `A`.
    ///
    /// # Returns
    ///
    /// `None` if the kind is not one of `A`'s events or the payload does not
    /// match it.
    pub fn decode<A: Aggregate>(&self) -> Option<A::DomainEvent> {
        decode_domain_event::<A>(&self.event_type, &self.payload)
    }
}

/// Encode a domain event into a [`ProposedEvent`].
///
/// Serializes the adjacently tagged domain event, splits it into its
/// `"type"` tag and `"data"` payload, and stamps [`EventMetadata`] built from
/// the command context.
///
/// # Arguments
///
/// * `event` - The domain event to encode.
/// * `ctx` - Command context carrying actor and correlation ID.
/// * `causation` - The upstream notification being processed, if any.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event does not serialize to a tagged
/// JSON object.
pub fn encode_domain_event<A: Aggregate>(
    event: &A::DomainEvent,
    ctx: &CommandContext,
    causation: Option<Causation>,
) -> serde_json::Result<ProposedEvent> {
    use serde::ser::Error as _;

    // {"type": "Sent"} for unit variants, {"type": "Errored", "data": {...}}
    // for variants with fields.
    let Value::Object(mut obj) = serde_json::to_value(event)? else {
        return Err(serde_json::Error::custom(
            "domain event must serialize to a JSON object",
        ));
    };
    let event_type = match obj.remove("type") {
        Some(Value::String(tag)) => tag,
        _ => {
            return Err(serde_json::Error::custom(
                "domain event must carry a string `type` tag",
            ));
        }
    };
    let payload = obj.remove("data").unwrap_or(Value::Null);

    Ok(ProposedEvent {
        event_id: Uuid::new_v4(),
        event_type,
        payload,
        metadata: EventMetadata {
            aggregate_type: A::AGGREGATE_TYPE.to_string(),
            actor: ctx.actor.clone(),
            correlation_id: ctx.correlation_id.clone(),
            causation,
        },
    })
}

/// Decode an event kind and payload back into `A::DomainEvent`.
///
/// # Returns
///
/// `None` for unknown kinds or malformed payloads.
pub fn decode_domain_event<A: Aggregate>(
    event_type: &str,
    payload: &Value,
) -> Option<A::DomainEvent> {
    let tagged = if payload.is_null() {
        serde_json::json!({ "type": event_type })
    } else {
        serde_json::json!({ "type": event_type, "data": payload })
    };
    serde_json::from_value(tagged).ok()
}
