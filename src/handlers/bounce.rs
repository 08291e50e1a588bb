//! Provider bounce notifications.
//!
//! The handler receives the whole raw notification, which is stored
//! verbatim as the bounce details.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

use super::{unix_time_or_now, EventHandler, HandlerError, HandlerResult, NotificationMail};
use crate::subscription::SubscriptionService;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BounceNotification {
    pub event_type: String,
    pub bounce: Bounce,
    pub mail: NotificationMail,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Bounce {
    pub feedback_id: String,
    pub bounce_type: String,
    pub bounce_sub_type: String,
    pub bounced_recipients: Vec<BouncedRecipient>,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "reportingMTA")]
    pub reporting_mta: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BouncedRecipient {
    pub email_address: String,
    pub action: String,
    pub status: String,
    pub diagnostic_code: String,
}

pub struct BounceHandler {
    subscriptions: Arc<SubscriptionService>,
}

impl BounceHandler {
    pub fn new(subscriptions: Arc<SubscriptionService>) -> Self {
        Self { subscriptions }
    }
}

#[async_trait]
impl EventHandler for BounceHandler {
    fn name(&self) -> &str {
        "bounce"
    }

    async fn handle(&self, details: &str) -> Result<HandlerResult, HandlerError> {
        let notification: BounceNotification = serde_json::from_str(details)?;
        let bounce = notification.bounce;

        let addresses: Vec<String> = bounce
            .bounced_recipients
            .into_iter()
            .map(|recipient| recipient.email_address)
            .collect();

        self.subscriptions
            .process_email_bounce(
                &addresses,
                &bounce.bounce_type,
                &bounce.bounce_sub_type,
                details,
                unix_time_or_now(bounce.timestamp),
            )
            .await?;

        Ok(HandlerResult::success(
            self.name(),
            format!("{} bounce for {} recipient(s)", bounce.bounce_type, addresses.len()),
        ))
    }
}
