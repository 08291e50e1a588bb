//! Log Gateway - dry-run delivery.
//!
//! The [`LogGateway`] records each outbound message as a structured log
//! line instead of sending it. Useful for local development and staging.

use super::{EmailGateway, GatewayError, OutboundEmail};
use async_trait::async_trait;
use tracing::info;

#[derive(Debug, Clone)]
pub struct LogGateway {
    /// Prefix for log messages
    prefix: String,
}

impl LogGateway {
    pub fn new() -> Self {
        Self {
            prefix: "mail".to_string(),
        }
    }

    /// Create a LogGateway with a custom prefix, e.g. "staging"
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LogGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmailGateway for LogGateway {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<(), GatewayError> {
        info!(
            prefix = %self.prefix,
            sender = %email.sender,
            recipients = ?email.recipients,
            subject = %email.subject,
            body_len = email.body.len(),
            "[{}] Would send '{}' to {} recipient(s)",
            self.prefix,
            email.subject,
            email.recipients.len()
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_gateway_accepts_message() {
        let gateway = LogGateway::with_prefix("test");
        let email = OutboundEmail {
            sender: "noreply@x.com".to_string(),
            recipients: vec!["a@x.com".to_string()],
            subject: "Hi".to_string(),
            body: "<p>Hi</p>".to_string(),
        };

        assert!(gateway.send(&email).await.is_ok());
        assert_eq!(gateway.name(), "log");
    }
}
