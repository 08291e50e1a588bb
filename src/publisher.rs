//! Task publishing.
//!
//! Follow-up work is pushed back onto the event stream as ordinary
//! envelopes, so the same worker pool that handles inbound events also
//! sends the mails.

use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use reqwest::Url;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::event::{EmailSendTask, Envelope, EventKind};
use crate::template::VERIFICATION_TEMPLATE;

/// Stream field holding the serialized envelope.
pub const BODY_FIELD: &str = "body";

/// Subject line of subscription verification mails.
pub const VERIFICATION_SUBJECT: &str = "Confirm Your Subscription";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publisher connection error: {0}")]
    Connection(String),

    #[error("publish command failed: {0}")]
    Command(String),

    #[error("failed to serialize task: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid verification link: {0}")]
    InvalidLink(String),
}

/// Enqueues a serialized envelope for asynchronous processing.
#[async_trait]
pub trait TaskPublisher: Send + Sync {
    /// Returns the id the queue assigned to the message.
    async fn publish(&self, serialized: String) -> Result<String, PublishError>;
}

/// Publishes envelopes onto a Redis stream with `XADD`.
#[derive(Clone)]
pub struct RedisTaskPublisher {
    pool: Pool,
    stream: String,
}

impl RedisTaskPublisher {
    pub fn new(pool: Pool, stream: impl Into<String>) -> Self {
        Self {
            pool,
            stream: stream.into(),
        }
    }
}

#[async_trait]
impl TaskPublisher for RedisTaskPublisher {
    async fn publish(&self, serialized: String) -> Result<String, PublishError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| PublishError::Connection(e.to_string()))?;

        let id: String = cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg(BODY_FIELD)
            .arg(&serialized)
            .query_async(&mut conn)
            .await
            .map_err(|e| PublishError::Command(e.to_string()))?;

        debug!(id = %id, stream = %self.stream, "Task published");
        Ok(id)
    }
}

/// Builds and publishes the verification mail for a new subscription.
#[derive(Clone)]
pub struct VerificationNotifier {
    publisher: Arc<dyn TaskPublisher>,
    web_app_domain: String,
    verification_path: String,
    sending_address: String,
}

impl VerificationNotifier {
    pub fn new(
        publisher: Arc<dyn TaskPublisher>,
        web_app_domain: impl Into<String>,
        verification_path: impl Into<String>,
        sending_address: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            web_app_domain: web_app_domain.into(),
            verification_path: verification_path.into(),
            sending_address: sending_address.into(),
        }
    }

    /// `https://{domain}{path}?token={escaped token}`
    pub fn verification_link(&self, token: &str) -> Result<String, PublishError> {
        let base = format!("https://{}{}", self.web_app_domain, self.verification_path);
        let mut url = Url::parse(&base).map_err(|e| PublishError::InvalidLink(format!("{base}: {e}")))?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url.into())
    }

    /// The `email-send-task` envelope for `email`, correlation id left empty.
    pub fn verification_envelope(&self, email: &str, token: &str) -> Result<Envelope, PublishError> {
        let task = EmailSendTask {
            template_name: VERIFICATION_TEMPLATE.to_string(),
            sender_address: self.sending_address.clone(),
            subject_line: VERIFICATION_SUBJECT.to_string(),
            to_addresses: vec![email.to_string()],
            parameters: HashMap::from([(
                "verificationLink".to_string(),
                self.verification_link(token)?,
            )]),
        };

        Ok(Envelope::for_task(EventKind::SendEmail, &task)?)
    }

    pub async fn publish_email_verification_task(&self, email: &str, token: &str) -> Result<(), PublishError> {
        let envelope = self.verification_envelope(email, token)?;
        let id = self.publisher.publish(serde_json::to_string(&envelope)?).await?;

        info!(email = %email, id = %id, "Verification task published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        published: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskPublisher for Recorder {
        async fn publish(&self, serialized: String) -> Result<String, PublishError> {
            let mut published = self.published.lock().await;
            published.push(serialized);
            Ok(format!("{}-0", published.len()))
        }
    }

    fn notifier(publisher: Arc<dyn TaskPublisher>) -> VerificationNotifier {
        VerificationNotifier::new(publisher, "app.example.com", "/verify-email-subscription", "hello@example.com")
    }

    #[test]
    fn test_verification_link_escapes_token() {
        let notifier = notifier(Arc::new(Recorder::default()));
        let link = notifier.verification_link("YUB4LmNvbQ==:ab+c/d=").unwrap();

        assert_eq!(
            link,
            "https://app.example.com/verify-email-subscription?token=YUB4LmNvbQ%3D%3D%3Aab%2Bc%2Fd%3D"
        );
    }

    #[test]
    fn test_link_round_trips_through_unescape() {
        let notifier = notifier(Arc::new(Recorder::default()));
        let issued = token::generate("a@x.com").unwrap();
        let link = notifier.verification_link(&issued).unwrap();

        let escaped = link.split_once("token=").unwrap().1;
        assert_eq!(token::unescape(escaped).unwrap(), issued);
    }

    #[tokio::test]
    async fn test_publish_verification_task() {
        let recorder = Arc::new(Recorder::default());
        let notifier = notifier(recorder.clone());

        notifier
            .publish_email_verification_task("a@x.com", "tok:en")
            .await
            .unwrap();

        let published = recorder.published.lock().await;
        assert_eq!(published.len(), 1);

        let envelope: Envelope = serde_json::from_str(&published[0]).unwrap();
        assert_eq!(envelope.kind(), Some(EventKind::SendEmail));
        assert_eq!(envelope.correlation_id, "");

        let task: EmailSendTask = serde_json::from_str(&envelope.event_details).unwrap();
        assert_eq!(task.template_name, VERIFICATION_TEMPLATE);
        assert_eq!(task.subject_line, VERIFICATION_SUBJECT);
        assert_eq!(task.sender_address, "hello@example.com");
        assert_eq!(task.to_addresses, vec!["a@x.com".to_string()]);
        assert!(task.parameters["verificationLink"].ends_with("?token=tok%3Aen"));
    }
}
