//! The `EmailMessage` aggregate.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;

/// Delivery status of an email message.
///
/// Serialized as `"INITIATED"`, `"SENDING"`, `"SENT"` and `"ERRORED"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailStatus {
    /// Accepted, not yet handed to the transport.
    Initiated,
    /// Handed to the transport; waiting for the outcome.
    Sending,
    /// Delivered. Terminal.
    Sent,
    /// Failed. Terminal.
    Errored,
}

impl EmailStatus {
    /// Returns `true` for states no transition leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, EmailStatus::Sent | EmailStatus::Errored)
    }

    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            EmailStatus::Initiated => "INITIATED",
            EmailStatus::Sending => "SENDING",
            EmailStatus::Sent => "SENT",
            EmailStatus::Errored => "ERRORED",
        }
    }
}

impl fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An email message and its delivery progress.
///
/// `status` is `None` only for the default state of a stream that has no
/// events yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmailMessage {
    /// Recipient address.
    pub to: String,
    /// Sender address.
    pub from: String,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
    /// Delivery status.
    pub status: Option<EmailStatus>,
    /// Transport reference, set once the transport accepted the message.
    pub client_reference: Option<String>,
    /// Failure description, set only when `status` is `ERRORED`.
    pub error_message: Option<String>,
}

/// Commands accepted by [`EmailMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailCommand {
    /// Start a new message.
    Create {
        to: String,
        from: String,
        subject: String,
        body: String,
    },
    /// Record that the transport accepted the message.
    MarkSending { client_reference: String },
    /// Record successful delivery.
    MarkSent,
    /// Record a delivery failure.
    MarkErrored { message: String },
}

/// Events of [`EmailMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EmailEvent {
    Initiated {
        to: String,
        #[serde(rename = "from_", alias = "from")]
        from: String,
        subject: String,
        body: String,
    },
    Sending {
        client_reference: String,
    },
    Sent,
    Errored {
        error_message: String,
    },
}

/// Rejection of an [`EmailCommand`].
///
/// Policies guard on status before issuing commands, so these indicate a
/// misbehaving caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmailError {
    #[error("email message already exists")]
    AlreadyExists,

    #[error("email message has not been created")]
    NotCreated,

    #[error("cannot move email message from {from} to {to}")]
    InvalidTransition { from: EmailStatus, to: EmailStatus },
}

impl Aggregate for EmailMessage {
    const AGGREGATE_TYPE: &'static str = "email-message";

    type Command = EmailCommand;
    type DomainEvent = EmailEvent;
    type Error = EmailError;

    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error> {
        let (target, event) = match cmd {
            EmailCommand::Create {
                to,
                from,
                subject,
                body,
            } => {
                if self.status.is_some() {
                    return Err(EmailError::AlreadyExists);
                }
                return Ok(vec![EmailEvent::Initiated {
                    to,
                    from,
                    subject,
                    body,
                }]);
            }
            EmailCommand::MarkSending { client_reference } => (
                EmailStatus::Sending,
                EmailEvent::Sending { client_reference },
            ),
            EmailCommand::MarkSent => (EmailStatus::Sent, EmailEvent::Sent),
            EmailCommand::MarkErrored { message } => (
                EmailStatus::Errored,
                EmailEvent::Errored {
                    error_message: message,
                },
            ),
        };

        let current = self.status.ok_or(EmailError::NotCreated)?;
        let allowed = match target {
            EmailStatus::Sending => current == EmailStatus::Initiated,
            _ => !current.is_terminal(),
        };
        if !allowed {
            return Err(EmailError::InvalidTransition {
                from: current,
                to: target,
            });
        }
        Ok(vec![event])
    }

    fn apply(mut self, event: &Self::DomainEvent) -> Self {
        match event {
            EmailEvent::Initiated {
                to,
                from,
                subject,
                body,
            } => {
                self.to = to.clone();
                self.from = from.clone();
                self.subject = subject.clone();
                self.body = body.clone();
                self.status = Some(EmailStatus::Initiated);
            }
            EmailEvent::Sending { client_reference } => {
                self.status = Some(EmailStatus::Sending);
                self.client_reference = Some(client_reference.clone());
            }
            EmailEvent::Sent => self.status = Some(EmailStatus::Sent),
            EmailEvent::Errored { error_message } => {
                self.status = Some(EmailStatus::Errored);
                self.error_message = Some(error_message.clone());
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create() -> EmailCommand {
        EmailCommand::Create {
            to: "a@x.com".into(),
            from: "b@x.com".into(),
            subject: "Test Message".into(),
            body: "This is only a test".into(),
        }
    }

    fn fold(commands: Vec<EmailCommand>) -> Result<EmailMessage, EmailError> {
        commands
            .into_iter()
            .try_fold(EmailMessage::default(), |state, cmd| {
                let events = state.handle(cmd)?;
                Ok(events.iter().fold(state, |s, e| s.apply(e)))
            })
    }

    #[test]
    fn create_initiates() {
        let msg = fold(vec![create()]).unwrap();
        assert_eq!(msg.status, Some(EmailStatus::Initiated));
        assert_eq!(msg.subject, "Test Message");
        assert_eq!(msg.error_message, None);
    }

    #[test]
    fn sending_then_sent() {
        let msg = fold(vec![
            create(),
            EmailCommand::MarkSending {
                client_reference: "ref-1".into(),
            },
            EmailCommand::MarkSent,
        ])
        .unwrap();
        assert_eq!(msg.status, Some(EmailStatus::Sent));
        assert_eq!(msg.client_reference.as_deref(), Some("ref-1"));
    }

    #[test]
    fn initiated_can_error_directly() {
        let msg = fold(vec![
            create(),
            EmailCommand::MarkErrored {
                message: "BOOM!!".into(),
            },
        ])
        .unwrap();
        assert_eq!(msg.status, Some(EmailStatus::Errored));
        assert_eq!(msg.error_message.as_deref(), Some("BOOM!!"));
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let sent = fold(vec![create(), EmailCommand::MarkSent]).unwrap();
        assert_eq!(
            sent.handle(EmailCommand::MarkErrored {
                message: "late".into()
            }),
            Err(EmailError::InvalidTransition {
                from: EmailStatus::Sent,
                to: EmailStatus::Errored,
            })
        );
        assert!(sent.handle(EmailCommand::MarkSent).is_err());
    }

    #[test]
    fn sending_only_from_initiated() {
        let sending = fold(vec![
            create(),
            EmailCommand::MarkSending {
                client_reference: "r".into(),
            },
        ])
        .unwrap();
        let err = sending
            .handle(EmailCommand::MarkSending {
                client_reference: "again".into(),
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot move email message from SENDING to SENDING");
    }

    #[test]
    fn commands_before_create_are_rejected() {
        assert_eq!(
            EmailMessage::default().handle(EmailCommand::MarkSent),
            Err(EmailError::NotCreated)
        );
        let created = fold(vec![create()]).unwrap();
        assert_eq!(created.handle(create()), Err(EmailError::AlreadyExists));
    }

    #[test]
    fn status_wire_names() {
        let json = serde_json::to_string(&EmailStatus::Errored).unwrap();
        assert_eq!(json, r#""ERRORED""#);
        assert_eq!(EmailStatus::Sending.to_string(), "SENDING");
    }

    #[test]
    fn initiated_payload_uses_from_underscore() {
        let event = EmailEvent::Initiated {
            to: "a".into(),
            from: "b".into(),
            subject: "s".into(),
            body: "x".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Initiated");
        assert_eq!(json["data"]["from_"], "b");
    }
}
