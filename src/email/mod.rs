//! Email delivery: the `EmailMessage` aggregate, the transport boundary,
//! the delivery policy, and the application facade.
//!
//! The email application follows its own notification log. A submitted
//! message is recorded as `Initiated`; the pipeline hands it to the
//! [`EmailTransport`], records `Sending`, then polls for the outcome and
//! records `Sent` or `Errored`.

mod message;
mod policy;
mod system;
mod transport;

pub use message::{EmailCommand, EmailError, EmailEvent, EmailMessage, EmailStatus};
pub use policy::{EmailPolicy, StatusPolling, UNKNOWN_OUTCOME};
pub use system::{EmailApp, EmailConfig, EmailSystem, EmailView};
pub use transport::{
    DeliveryReport, DeliveryStatus, EmailTransport, LoopbackTransport, OutgoingEmail,
    SendReceipt, TransportError,
};
