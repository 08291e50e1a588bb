//! Event Router - decode, classify, dispatch.
//!
//! The [`Router`] turns a raw queue message into exactly one handler call.
//!
//! # Forwarding
//!
//! ```text
//! eventType                    | handler receives
//! -----------------------------|---------------------------
//! email-send-task              | eventDetails
//! account-confirmation-task    | eventDetails
//! Bounce                       | the whole raw message
//! Complaint                    | the whole raw message
//! ```
//!
//! Every call to [`Router::dispatch`] emits one log record carrying
//! `event_type`, `correlation_id` and `outcome`, whether it succeeds or not.
//!
//! # Example
//!
//! ```rust,ignore
//! use mailgate::handlers::HandlerSet;
//! use mailgate::router::Router;
//!
//! let router = Router::new(HandlerSet::new(subscriptions, identity));
//! let dispatched = router.dispatch(body).await?;
//! ```

use std::str::Utf8Error;
use thiserror::Error;
use tracing::{error, info};

use crate::event::{Envelope, EventKind};
use crate::handlers::{HandlerError, HandlerResult, HandlerSet};

/// Errors that can occur during routing.
#[derive(Error, Debug)]
pub enum RouterError {
    /// The message body is not UTF-8
    #[error("message body is not valid UTF-8: {0}")]
    Encoding(#[from] Utf8Error),

    /// The message body is not an envelope
    #[error("failed to parse envelope: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unsupported event type '{event_type}'")]
    UnsupportedKind {
        event_type: String,
        correlation_id: String,
    },

    /// The handler ran and failed
    #[error("'{kind}' handler failed: {source}")]
    Handler {
        kind: EventKind,
        correlation_id: String,
        #[source]
        source: HandlerError,
    },
}

impl RouterError {
    /// Whether a redelivery could succeed. Informational: the consumer
    /// requeues every failure alike.
    pub fn is_retryable(&self) -> bool {
        match self {
            RouterError::Encoding(_) | RouterError::Parse(_) | RouterError::UnsupportedKind { .. } => false,
            RouterError::Handler { source, .. } => source.is_retryable(),
        }
    }

    fn event_type(&self) -> &str {
        match self {
            RouterError::Encoding(_) | RouterError::Parse(_) => "",
            RouterError::UnsupportedKind { event_type, .. } => event_type,
            RouterError::Handler { kind, .. } => kind.as_str(),
        }
    }

    fn correlation_id(&self) -> &str {
        match self {
            RouterError::Encoding(_) | RouterError::Parse(_) => "",
            RouterError::UnsupportedKind { correlation_id, .. } | RouterError::Handler { correlation_id, .. } => {
                correlation_id
            }
        }
    }
}

/// A successfully handled message.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub kind: EventKind,
    pub correlation_id: String,
    pub result: HandlerResult,
}

/// Routes envelopes to the handler registered for their kind.
///
/// Wrap in `Arc` to share across consumer tasks.
pub struct Router {
    handlers: HandlerSet,
}

impl Router {
    pub fn new(handlers: HandlerSet) -> Self {
        Self { handlers }
    }

    /// Decode `body`, invoke its handler and log the outcome once.
    pub async fn dispatch(&self, body: &[u8]) -> Result<Dispatched, RouterError> {
        let outcome = self.route(body).await;

        match &outcome {
            Ok(dispatched) => info!(
                event_type = %dispatched.kind,
                correlation_id = %dispatched.correlation_id,
                handler = %dispatched.result.handler,
                outcome = "success",
                "{}",
                dispatched.result.message
            ),
            Err(e) => error!(
                event_type = %e.event_type(),
                correlation_id = %e.correlation_id(),
                outcome = "failure",
                retryable = e.is_retryable(),
                error = %e,
                "Event dispatch failed"
            ),
        }

        outcome
    }

    async fn route(&self, body: &[u8]) -> Result<Dispatched, RouterError> {
        let raw = std::str::from_utf8(body)?;
        let envelope: Envelope = serde_json::from_str(raw)?;

        let Some(kind) = envelope.kind() else {
            return Err(RouterError::UnsupportedKind {
                event_type: envelope.event_type,
                correlation_id: envelope.correlation_id,
            });
        };

        let input = if kind.is_inbound_notification() {
            raw
        } else {
            envelope.event_details.as_str()
        };

        match self.handlers.handler_for(kind).handle(input).await {
            Ok(result) => Ok(Dispatched {
                kind,
                correlation_id: envelope.correlation_id,
                result,
            }),
            Err(source) => Err(RouterError::Handler {
                kind,
                correlation_id: envelope.correlation_id,
                source,
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::handlers::EventHandler;
    use crate::identity::IdentityError;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// Handler double: records its input, fails when the input contains
    /// `"fail"`.
    #[derive(Default)]
    pub(crate) struct StubHandler {
        pub inputs: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler for StubHandler {
        fn name(&self) -> &str {
            "stub"
        }

        async fn handle(&self, details: &str) -> Result<HandlerResult, HandlerError> {
            self.inputs.lock().await.push(details.to_string());
            if details.contains("fail") {
                return Err(HandlerError::Identity(IdentityError::Command("stub failure".to_string())));
            }
            Ok(HandlerResult::success("stub", "handled"))
        }
    }

    pub(crate) struct Stubs {
        pub send_email: Arc<StubHandler>,
        pub confirm_account: Arc<StubHandler>,
        pub bounce: Arc<StubHandler>,
        pub complaint: Arc<StubHandler>,
    }

    pub(crate) fn stub_router() -> (Router, Stubs) {
        let stubs = Stubs {
            send_email: Arc::new(StubHandler::default()),
            confirm_account: Arc::new(StubHandler::default()),
            bounce: Arc::new(StubHandler::default()),
            complaint: Arc::new(StubHandler::default()),
        };
        let router = Router::new(HandlerSet {
            send_email: stubs.send_email.clone(),
            confirm_account: stubs.confirm_account.clone(),
            bounce: stubs.bounce.clone(),
            complaint: stubs.complaint.clone(),
        });
        (router, stubs)
    }

    #[tokio::test]
    async fn test_task_kinds_receive_event_details() {
        let (router, stubs) = stub_router();

        let body = br#"{"eventType":"email-send-task","correlationId":"c-1","eventDetails":"{\"x\":1}"}"#;
        let dispatched = router.dispatch(body).await.unwrap();

        assert_eq!(dispatched.kind, EventKind::SendEmail);
        assert_eq!(dispatched.correlation_id, "c-1");
        assert_eq!(*stubs.send_email.inputs.lock().await, vec![r#"{"x":1}"#.to_string()]);
        assert!(stubs.confirm_account.inputs.lock().await.is_empty());

        let body = br#"{"eventType":"account-confirmation-task","eventDetails":"{}"}"#;
        router.dispatch(body).await.unwrap();
        assert_eq!(*stubs.confirm_account.inputs.lock().await, vec!["{}".to_string()]);
    }

    #[tokio::test]
    async fn test_notifications_receive_raw_message() {
        let (router, stubs) = stub_router();

        let bounce = r#"{"eventType":"Bounce","bounce":{"bounceType":"Permanent"}}"#;
        router.dispatch(bounce.as_bytes()).await.unwrap();
        assert_eq!(*stubs.bounce.inputs.lock().await, vec![bounce.to_string()]);

        let complaint = r#"{"eventType":"Complaint","complaint":{}}"#;
        router.dispatch(complaint.as_bytes()).await.unwrap();
        assert_eq!(*stubs.complaint.inputs.lock().await, vec![complaint.to_string()]);
    }

    #[tokio::test]
    async fn test_unsupported_kind() {
        let (router, stubs) = stub_router();

        let result = router
            .dispatch(br#"{"eventType":"bounce","correlationId":"c-9"}"#)
            .await;

        match result {
            Err(e @ RouterError::UnsupportedKind { .. }) => {
                assert!(!e.is_retryable());
                assert_eq!(e.correlation_id(), "c-9");
                assert_eq!(e.event_type(), "bounce");
            }
            other => panic!("expected UnsupportedKind, got {other:?}"),
        }
        assert!(stubs.bounce.inputs.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_is_parse_error() {
        let (router, _) = stub_router();

        assert!(matches!(router.dispatch(b"{not json").await, Err(RouterError::Parse(_))));
        assert!(matches!(router.dispatch(br#"{"correlationId":"x"}"#).await, Err(RouterError::Parse(_))));
        assert!(matches!(router.dispatch(&[0xff, 0xfe]).await, Err(RouterError::Encoding(_))));
    }

    #[tokio::test]
    async fn test_handler_error_carries_context() {
        let (router, _) = stub_router();

        let result = router
            .dispatch(br#"{"eventType":"email-send-task","correlationId":"c-2","eventDetails":"fail"}"#)
            .await;

        match result {
            Err(RouterError::Handler {
                kind,
                correlation_id,
                source,
            }) => {
                assert_eq!(kind, EventKind::SendEmail);
                assert_eq!(correlation_id, "c-2");
                assert!(matches!(source, HandlerError::Identity(_)));
            }
            other => panic!("expected Handler error, got {other:?}"),
        }
    }
}
