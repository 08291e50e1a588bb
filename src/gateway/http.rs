//! HTTP Gateway - hand messages to a mail relay's HTTP API.
//!
//! # Example
//!
//! ```rust,ignore
//! use mailgate::gateway::HttpGateway;
//! use std::time::Duration;
//!
//! let gateway = HttpGateway::new("https://relay.internal/v1/send")
//!     .with_api_key("relay-key")
//!     .with_timeout(Duration::from_secs(10))
//!     .with_retries(1);
//! ```

use super::{EmailGateway, GatewayError, OutboundEmail};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for relay requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of retries on 5xx errors
const DEFAULT_RETRIES: u32 = 1;

/// Gateway that POSTs [`OutboundEmail`] as JSON to a relay endpoint.
///
/// 5xx answers and connection errors are retried up to `retries` times;
/// 4xx answers fail immediately.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    url: String,

    /// HTTP client (reused for connection pooling)
    client: Client,

    api_key: Option<String>,

    timeout: Duration,

    retries: u32,
}

impl HttpGateway {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Client::new(),
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
        }
    }

    /// Send `Authorization: Bearer <key>` with every request
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    async fn post(&self, email: &OutboundEmail) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self.client.post(&self.url).timeout(self.timeout).json(email);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request.send().await
    }
}

#[async_trait]
impl EmailGateway for HttpGateway {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<(), GatewayError> {
        let mut last_error = None;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                debug!(attempt = attempt, max_retries = self.retries, "Retrying relay request");
            }

            match self.post(email).await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        info!(
                            url = %self.url,
                            status = %status,
                            recipients = email.recipients.len(),
                            "Message accepted by relay"
                        );
                        return Ok(());
                    }

                    if status.is_server_error() {
                        warn!(status = %status, url = %self.url, attempt = attempt, "Relay returned server error");
                        last_error = Some(GatewayError::Rejected(format!("server error: {status}")));
                        continue;
                    }

                    // Client error - don't retry
                    let body = response.text().await.unwrap_or_default();
                    warn!(status = %status, url = %self.url, "Relay rejected message");
                    return Err(GatewayError::Rejected(format!("{status}: {body}")));
                }
                Err(e) => {
                    warn!(error = %e, url = %self.url, attempt = attempt, "Relay request failed");
                    last_error = Some(GatewayError::Http(e));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::Rejected("no attempt made".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_gateway_builder() {
        let gateway = HttpGateway::new("https://relay.example.com/send")
            .with_api_key("secret")
            .with_timeout(Duration::from_secs(10))
            .with_retries(3);

        assert_eq!(gateway.url, "https://relay.example.com/send");
        assert_eq!(gateway.api_key.as_deref(), Some("secret"));
        assert_eq!(gateway.timeout, Duration::from_secs(10));
        assert_eq!(gateway.retries, 3);
    }

    #[test]
    fn test_outbound_email_json_shape() {
        let email = OutboundEmail {
            sender: "noreply@x.com".to_string(),
            recipients: vec!["a@x.com".to_string(), "b@x.com".to_string()],
            subject: "Hi".to_string(),
            body: "body".to_string(),
        };

        let json = serde_json::to_value(&email).unwrap();
        assert_eq!(json["sender"], "noreply@x.com");
        assert_eq!(json["recipients"][1], "b@x.com");
        assert_eq!(json["subject"], "Hi");
    }

    #[tokio::test]
    async fn test_unreachable_relay_fails() {
        let gateway = HttpGateway::new("http://127.0.0.1:9/send")
            .with_timeout(Duration::from_millis(200))
            .with_retries(0);
        let email = OutboundEmail {
            sender: "noreply@x.com".to_string(),
            recipients: vec!["a@x.com".to_string()],
            subject: "Hi".to_string(),
            body: "body".to_string(),
        };

        assert!(matches!(gateway.send(&email).await, Err(GatewayError::Http(_))));
    }
}
