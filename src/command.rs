//! Cross-cutting command metadata.

use serde::{Deserialize, Serialize};

/// Metadata passed alongside a command.
///
/// Carries audit and correlation information without polluting the
/// `Command` or `DomainEvent` types. Fields are copied into
/// [`EventMetadata`](crate::event::EventMetadata) when events are appended.
///
/// # Examples
///
/// ```
/// use eventfold_process::CommandContext;
///
/// let ctx = CommandContext::default()
///     .with_actor("user-42")
///     .with_correlation_id("req-abc-123");
///
/// assert_eq!(ctx.actor.as_deref(), Some("user-42"));
/// assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc-123"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandContext {
    /// Identity of whoever issued the command (a user ID, or the name of the
    /// process application reacting to a notification).
    pub actor: Option<String>,
    /// Correlation ID for tracing a request across applications.
    pub correlation_id: Option<String>,
}

impl CommandContext {
    /// Set the actor identity.
    ///
    /// # Arguments
    ///
    /// * `actor` - Any value convertible to `String` identifying who issued
    ///   the command.
    ///
    /// # Returns
    ///
    /// The updated `CommandContext` with the actor set.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation ID.
    ///
    /// # Arguments
    ///
    /// * `id` - Any value convertible to `String` used to correlate this
    ///   command with work done in other applications.
    ///
    /// # Returns
    ///
    /// The updated `CommandContext` with the correlation ID set.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}
