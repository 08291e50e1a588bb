//! `email-send-task` handler.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{EventHandler, HandlerError, HandlerResult};
use crate::event::EmailSendTask;
use crate::subscription::SubscriptionService;

pub struct SendEmailHandler {
    subscriptions: Arc<SubscriptionService>,
}

impl SendEmailHandler {
    pub fn new(subscriptions: Arc<SubscriptionService>) -> Self {
        Self { subscriptions }
    }
}

#[async_trait]
impl EventHandler for SendEmailHandler {
    fn name(&self) -> &str {
        "send-email"
    }

    async fn handle(&self, details: &str) -> Result<HandlerResult, HandlerError> {
        let task: EmailSendTask = serde_json::from_str(details)?;
        debug!(template = %task.template_name, recipients = task.to_addresses.len(), "Handling send task");

        let sent_to = self
            .subscriptions
            .send_templated_email(
                &task.template_name,
                &task.parameters,
                &task.subject_line,
                &task.sender_address,
                &task.to_addresses,
            )
            .await?;

        Ok(HandlerResult::success(
            self.name(),
            format!("sent '{}' to {} of {} recipient(s)", task.template_name, sent_to.len(), task.to_addresses.len()),
        ))
    }
}
