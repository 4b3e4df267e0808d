//! Boundary to the third-party email service.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingEmail {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub body: String,
}

/// Acknowledgment of an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Opaque transport reference used to poll the outcome.
    pub id: String,
}

/// Outcome of a message as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Delivered.
    Sent,
    /// Delivery failed with the transport's description.
    Errored { message: String },
    /// No outcome yet.
    Pending,
}

/// Answer to a status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Reference the report is about.
    pub reference: String,
    pub status: DeliveryStatus,
}

/// A fault raised by the transport.
///
/// Faults never escape the email policy: their description becomes the
/// `error_message` of an `Errored` event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The service refused the request.
    #[error("{0}")]
    Rejected(String),

    /// The service could not be reached.
    #[error("email transport unavailable: {0}")]
    Unavailable(String),

    /// The service does not know the polled reference.
    #[error("unknown message reference {0}")]
    UnknownReference(String),
}

/// The email service as seen by the engine.
///
/// Implementations must be callable from several pipeline workers at once.
pub trait EmailTransport: Send + Sync {
    /// Hand a message to the service.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the service did not accept the message.
    fn send(&self, email: &OutgoingEmail) -> Result<SendReceipt, TransportError>;

    /// Ask for the outcome of a previously accepted message.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the service cannot answer.
    fn status(&self, reference: &str) -> Result<DeliveryReport, TransportError>;
}

impl<T: EmailTransport + ?Sized> EmailTransport for Arc<T> {
    fn send(&self, email: &OutgoingEmail) -> Result<SendReceipt, TransportError> {
        (**self).send(email)
    }

    fn status(&self, reference: &str) -> Result<DeliveryReport, TransportError> {
        (**self).status(reference)
    }
}

/// A transport that accepts every message and reports it delivered.
///
/// Useful for local runs and demos where no real service is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackTransport;

impl EmailTransport for LoopbackTransport {
    fn send(&self, email: &OutgoingEmail) -> Result<SendReceipt, TransportError> {
        let id = Uuid::new_v4().to_string();
        tracing::debug!(to = %email.to, reference = %id, "loopback transport accepted message");
        Ok(SendReceipt { id })
    }

    fn status(&self, reference: &str) -> Result<DeliveryReport, TransportError> {
        Ok(DeliveryReport {
            reference: reference.to_owned(),
            status: DeliveryStatus::Sent,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_accepts_and_reports_sent() {
        let transport = LoopbackTransport;
        let receipt = transport
            .send(&OutgoingEmail {
                to: "a@x.com".into(),
                from: "b@x.com".into(),
                subject: "s".into(),
                body: "b".into(),
            })
            .unwrap();
        let report = transport.status(&receipt.id).unwrap();
        assert_eq!(report.status, DeliveryStatus::Sent);
        assert_eq!(report.reference, receipt.id);
    }

    #[test]
    fn rejected_displays_the_service_message() {
        assert_eq!(TransportError::Rejected("BOOM!!".into()).to_string(), "BOOM!!");
    }

    #[test]
    fn arc_transport_delegates() {
        let transport: Arc<dyn EmailTransport> = Arc::new(LoopbackTransport);
        assert!(transport.status("r").is_ok());
    }
}
