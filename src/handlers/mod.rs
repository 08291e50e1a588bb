//! Event handlers.
//!
//! Every [`EventKind`] has exactly one [`EventHandler`]. The set is closed:
//! [`HandlerSet`] holds one field per kind and [`HandlerSet::handler_for`]
//! is an exhaustive match, so adding a kind without a handler does not
//! compile.
//!
//! ## Handlers
//!
//! - [`SendEmailHandler`]: `email-send-task` → filtered templated send
//! - [`AccountConfirmationHandler`]: `account-confirmation-task` → user row
//! - [`BounceHandler`]: provider bounce notification → bounce facts
//! - [`ComplaintHandler`]: provider complaint notification → complaint facts

pub mod account_confirmation;
pub mod bounce;
pub mod complaint;
pub mod send_email;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

use crate::event::EventKind;
use crate::identity::{IdentityError, IdentityStore};
use crate::subscription::{SubscriptionError, SubscriptionService};

pub use account_confirmation::AccountConfirmationHandler;
pub use bounce::BounceHandler;
pub use complaint::ComplaintHandler;
pub use send_email::SendEmailHandler;

/// Errors a handler can return. All of them fail the message.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler input is not the JSON it expects
    #[error("error parsing event details: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

impl HandlerError {
    /// Malformed input fails the same way on every delivery.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, HandlerError::Payload(_))
    }
}

/// What a handler did, for the dispatch log line.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerResult {
    pub handler: String,
    pub message: String,
}

impl HandlerResult {
    pub fn success(handler: &str, message: impl Into<String>) -> Self {
        Self {
            handler: handler.to_string(),
            message: message.into(),
        }
    }
}

/// A handler for one event kind.
///
/// `details` is the envelope's `eventDetails` for task kinds and the whole
/// raw envelope for inbound notifications.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, details: &str) -> Result<HandlerResult, HandlerError>;
}

/// The dispatch table: one handler per kind.
#[derive(Clone)]
pub struct HandlerSet {
    pub send_email: Arc<dyn EventHandler>,
    pub confirm_account: Arc<dyn EventHandler>,
    pub bounce: Arc<dyn EventHandler>,
    pub complaint: Arc<dyn EventHandler>,
}

impl HandlerSet {
    /// Wire the built-in handlers to their collaborators.
    pub fn new(subscriptions: Arc<SubscriptionService>, identity: Arc<dyn IdentityStore>) -> Self {
        Self {
            send_email: Arc::new(SendEmailHandler::new(subscriptions.clone())),
            confirm_account: Arc::new(AccountConfirmationHandler::new(identity)),
            bounce: Arc::new(BounceHandler::new(subscriptions.clone())),
            complaint: Arc::new(ComplaintHandler::new(subscriptions)),
        }
    }

    pub fn handler_for(&self, kind: EventKind) -> &Arc<dyn EventHandler> {
        match kind {
            EventKind::SendEmail => &self.send_email,
            EventKind::ConfirmAccount => &self.confirm_account,
            EventKind::Bounce => &self.bounce,
            EventKind::Complaint => &self.complaint,
        }
    }
}

/// The `mail` block shared by bounce and complaint notifications.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationMail {
    pub timestamp: Option<DateTime<Utc>>,
    pub source: String,
    pub message_id: String,
    pub destination: Vec<String>,
}

/// Unix seconds of a notification timestamp, now when it is missing.
pub(crate) fn unix_time_or_now(timestamp: Option<DateTime<Utc>>) -> i64 {
    timestamp.unwrap_or_else(Utc::now).timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_errors_are_terminal() {
        let err = HandlerError::from(serde_json::from_str::<serde_json::Value>("{").unwrap_err());
        assert!(!err.is_retryable());

        let err = HandlerError::from(IdentityError::Connection("refused".to_string()));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unix_time_or_now() {
        let ts: DateTime<Utc> = "2024-01-02T03:04:05Z".parse().unwrap();
        assert_eq!(unix_time_or_now(Some(ts)), 1_704_164_645);

        let before = Utc::now().timestamp();
        assert!(unix_time_or_now(None) >= before);
    }
}
