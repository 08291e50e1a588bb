//! # mailgate
//!
//! Event-driven email subscriptions with delivery suppression.
//!
//! ## Architecture
//!
//! ```text
//! Producer -> HTTP API -> Redis Stream -> Worker -> Router -> Handler
//!                                                               │
//!                                 SubscriptionService ◀─────────┘
//!                                   │            │
//!                          SuppressionStore   EmailGateway
//! ```
//!
//! ## Modules
//!
//! - [`event`]: envelope and task payload types
//! - [`consumer`] / [`queue`]: concurrent batch consumption and transports
//! - [`router`] / [`handlers`]: envelope classification and per-kind handlers
//! - [`subscription`]: subscription state machine and recipient filtering
//! - [`store`], [`identity`], [`gateway`], [`template`], [`publisher`]:
//!   collaborators behind traits

pub mod config;
pub mod consumer;
pub mod dlq;
pub mod event;
pub mod gateway;
pub mod handlers;
pub mod identity;
pub mod publisher;
pub mod queue;
pub mod router;
pub mod shutdown;
pub mod store;
pub mod subscription;
pub mod template;
pub mod token;

// Re-export commonly used types at crate root
pub use config::MailgateConfig;
pub use consumer::BatchConsumer;
pub use event::{Envelope, EventKind};
pub use router::Router;
pub use subscription::SubscriptionService;

/// Redis stream name for mailgate events
pub const EVENT_STREAM_NAME: &str = "mailgate:events";

/// Default consumer group name
pub const DEFAULT_CONSUMER_GROUP: &str = "mailgate_workers";

/// Install the `tracing` subscriber used by both binaries.
///
/// `RUST_LOG` filters (default `info`); `MAILGATE_LOG_FORMAT=json` switches
/// to JSON lines.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("MAILGATE_LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
