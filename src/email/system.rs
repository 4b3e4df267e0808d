//! The email application facade and its self-following pipeline.

use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::{EmailCommand, EmailError, EmailMessage, EmailStatus};
use super::policy::{EmailPolicy, StatusPolling};
use super::transport::EmailTransport;
use crate::application::Application;
use crate::command::CommandContext;
use crate::error::{ExecuteError, ProcessError, StateError};
use crate::notification::NotificationLog;
use crate::process::ProcessApplication;
use crate::runner::{Edge, Runner, RunnerConfig};
use crate::store::EventStore;

/// Configuration for an [`EmailSystem`].
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Application name; also names its notification log and tracking
    /// records.
    ///
    /// Default: `"email"`.
    pub app_name: String,

    /// Scheduling and back-off of the pipeline.
    pub runner: RunnerConfig,

    /// Status polling after a message was accepted by the transport.
    pub polling: StatusPolling,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            app_name: "email".to_owned(),
            runner: RunnerConfig::default(),
            polling: StatusPolling::default(),
        }
    }
}

/// What a client sees when asking about a message.
///
/// `error_message` is present only when `status` is `ERRORED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailView {
    /// Recipient address.
    pub to: String,
    /// Sender address, serialized as `from_`.
    #[serde(rename = "from_", alias = "from")]
    pub from: String,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
    /// Delivery status.
    pub status: EmailStatus,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Submit and query email messages.
///
/// `Clone` is cheap.
#[derive(Debug, Clone)]
pub struct EmailApp {
    app: Application<EmailMessage>,
}

impl EmailApp {
    /// Create the email application `name` over `store`.
    pub fn new(name: impl Into<String>, store: EventStore) -> Self {
        Self {
            app: Application::new(name, store),
        }
    }

    /// The underlying generic application.
    pub fn application(&self) -> &Application<EmailMessage> {
        &self.app
    }

    /// The log the delivery pipeline follows.
    pub fn notification_log(&self) -> NotificationLog {
        self.app.notification_log()
    }

    /// Accept a message for delivery.
    ///
    /// Returns once the `Initiated` event is durable; delivery happens in
    /// the background.
    ///
    /// # Returns
    ///
    /// The id to query the message's status with.
    ///
    /// # Errors
    ///
    /// Returns [`ExecuteError::Storage`] if the event cannot be recorded.
    pub fn submit_email(
        &self,
        to: impl Into<String>,
        from: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<Uuid, ExecuteError<EmailError>> {
        let cmd = EmailCommand::Create {
            to: to.into(),
            from: from.into(),
            subject: subject.into(),
            body: body.into(),
        };
        let (id, _) = self.app.create(cmd, &CommandContext::default())?;
        tracing::info!(email_id = %id, "email submitted");
        Ok(id)
    }

    /// Current view of a message.
    ///
    /// # Errors
    ///
    /// - [`StateError::NotFound`] if no message with this id was submitted.
    /// - [`StateError::Storage`] if the read fails.
    pub fn get_status(&self, id: Uuid) -> Result<EmailView, StateError> {
        let message = self.get_message(id)?;
        let Some(status) = message.status else {
            return Err(StateError::NotFound(id));
        };
        Ok(EmailView {
            to: message.to,
            from: message.from,
            subject: message.subject,
            body: message.body,
            status,
            error_message: match status {
                EmailStatus::Errored => message.error_message,
                _ => None,
            },
        })
    }

    /// Full aggregate state of a message.
    ///
    /// # Errors
    ///
    /// Same as [`get_status`](EmailApp::get_status).
    pub fn get_message(&self, id: Uuid) -> Result<EmailMessage, StateError> {
        self.app.load(id).map(|(message, _)| message)
    }
}

/// The email application wired to follow its own notification log.
///
/// Dropping the system stops its runner.
#[derive(Debug)]
pub struct EmailSystem {
    app: EmailApp,
    runner: Runner,
}

impl EmailSystem {
    /// Wire the pipeline without starting it.
    ///
    /// # Errors
    ///
    /// Never fails for a single self-following edge; the `io::Result` is the
    /// runner's constructor contract.
    pub fn new(
        store: EventStore,
        transport: Arc<dyn EmailTransport>,
        config: EmailConfig,
    ) -> io::Result<Self> {
        let app = EmailApp::new(config.app_name, store);
        let process = ProcessApplication::new(
            app.application().clone(),
            EmailPolicy::new(transport, config.polling),
        )
        .with_batch_size(config.runner.batch_size);
        let edges = vec![Edge::new(app.notification_log(), Arc::new(process))];
        let runner = Runner::new(edges, config.runner)?;
        Ok(Self { app, runner })
    }

    /// Wire the pipeline and start its workers.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if a worker thread cannot be spawned.
    pub fn start(
        store: EventStore,
        transport: Arc<dyn EmailTransport>,
        config: EmailConfig,
    ) -> io::Result<Self> {
        let mut system = Self::new(store, transport, config)?;
        system.runner.start()?;
        Ok(system)
    }

    /// The email application.
    pub fn app(&self) -> &EmailApp {
        &self.app
    }

    /// Returns `true` while the pipeline workers run.
    pub fn is_running(&self) -> bool {
        self.runner.is_running()
    }

    /// Drive the pipeline on the calling thread until nothing is left to do.
    ///
    /// # Errors
    ///
    /// Returns the first [`ProcessError`] encountered.
    pub fn run_until_idle(&self) -> Result<usize, ProcessError> {
        self.runner.run_until_idle()
    }

    /// Stop the pipeline workers.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if a worker panicked.
    pub fn stop(&mut self) -> io::Result<()> {
        self.runner.stop()
    }
}
