//! Outbound mail gateways.
//!
//! An [`EmailGateway`] hands one rendered message to an external transport.
//! A single call covers every recipient; gateways never split or retry per
//! recipient.
//!
//! ## Built-in Gateways
//!
//! - [`LogGateway`]: logs the message instead of sending it (dry run)
//! - [`HttpGateway`]: POSTs the message to a mail relay's HTTP API

pub mod http;
pub mod log;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use http::HttpGateway;
pub use log::LogGateway;

/// Errors that can occur while handing a message to the transport.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The relay answered but refused the message
    #[error("mail relay rejected message: {0}")]
    Rejected(String),
}

/// A fully rendered message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEmail {
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait EmailGateway: Send + Sync {
    /// Gateway name for logs (e.g. "log", "http")
    fn name(&self) -> &str;

    /// Send one message to all of its recipients.
    async fn send(&self, email: &OutboundEmail) -> Result<(), GatewayError>;
}
