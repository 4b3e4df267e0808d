//! Reaction of the email application to its own events.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::message::{EmailCommand, EmailEvent, EmailMessage, EmailStatus};
use super::transport::{DeliveryStatus, EmailTransport, OutgoingEmail};
use crate::process::Policy;

/// Error message recorded when the transport never reports an outcome.
pub const UNKNOWN_OUTCOME: &str = "UNKNOWN";

/// How long to wait for the transport to report an outcome.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_process::email::StatusPolling;
///
/// let polling = StatusPolling {
///     attempts: 10,
///     ..StatusPolling::default()
/// };
/// assert_eq!(polling.interval, Duration::from_millis(50));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPolling {
    /// Polls before giving up with [`UNKNOWN_OUTCOME`]. At least one poll
    /// is always made.
    ///
    /// Default: 3.
    pub attempts: u32,

    /// Wait between polls that report `Pending`.
    ///
    /// Default: 50 milliseconds.
    pub interval: Duration,
}

impl Default for StatusPolling {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval: Duration::from_millis(50),
        }
    }
}

/// Sends initiated messages and records their outcome.
///
/// - `Initiated` on a message still `INITIATED`: hand it to the transport.
///   Acceptance yields `MarkSending`, a fault yields `MarkErrored`.
/// - `Sending` on a message still `SENDING`: poll the transport for the
///   outcome. The message is never sent a second time.
///
/// Every other combination issues nothing, which makes seeing a
/// notification twice harmless.
pub struct EmailPolicy {
    transport: Arc<dyn EmailTransport>,
    polling: StatusPolling,
}

impl fmt::Debug for EmailPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailPolicy")
            .field("polling", &self.polling)
            .finish_non_exhaustive()
    }
}

impl EmailPolicy {
    pub fn new(transport: Arc<dyn EmailTransport>, polling: StatusPolling) -> Self {
        Self { transport, polling }
    }

    fn send(&self, message: &EmailMessage) -> EmailCommand {
        let outgoing = OutgoingEmail {
            to: message.to.clone(),
            from: message.from.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
        };
        match self.transport.send(&outgoing) {
            Ok(receipt) => EmailCommand::MarkSending {
                client_reference: receipt.id,
            },
            Err(e) => {
                tracing::warn!(to = %message.to, error = %e, "email transport rejected message");
                EmailCommand::MarkErrored {
                    message: e.to_string(),
                }
            }
        }
    }

    fn poll(&self, reference: &str) -> EmailCommand {
        let attempts = self.polling.attempts.max(1);
        for attempt in 1..=attempts {
            match self.transport.status(reference) {
                Ok(report) => match report.status {
                    DeliveryStatus::Sent => return EmailCommand::MarkSent,
                    DeliveryStatus::Errored { message } => {
                        return EmailCommand::MarkErrored { message };
                    }
                    DeliveryStatus::Pending if attempt < attempts => {
                        std::thread::sleep(self.polling.interval);
                    }
                    DeliveryStatus::Pending => {}
                },
                Err(e) => {
                    tracing::warn!(reference, error = %e, "email status poll failed");
                    return EmailCommand::MarkErrored {
                        message: e.to_string(),
                    };
                }
            }
        }

        tracing::warn!(reference, attempts, "no delivery outcome reported");
        EmailCommand::MarkErrored {
            message: UNKNOWN_OUTCOME.to_owned(),
        }
    }
}

impl Policy for EmailPolicy {
    type Upstream = EmailMessage;
    type Target = EmailMessage;

    fn react(&self, event: &EmailEvent, target: &EmailMessage) -> Vec<EmailCommand> {
        match (event, target.status) {
            (EmailEvent::Initiated { .. }, Some(EmailStatus::Initiated)) => vec![self.send(target)],
            (EmailEvent::Sending { client_reference }, Some(EmailStatus::Sending)) => {
                let reference = target.client_reference.as_deref().unwrap_or(client_reference);
                vec![self.poll(reference)]
            }
            _ => vec![],
        }
    }
}
