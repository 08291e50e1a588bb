//! Provider complaint notifications.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

use super::{unix_time_or_now, EventHandler, HandlerError, HandlerResult, NotificationMail};
use crate::subscription::SubscriptionService;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComplaintNotification {
    pub event_type: String,
    pub complaint: Complaint,
    pub mail: NotificationMail,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Complaint {
    pub feedback_id: String,
    pub complaint_sub_type: Option<String>,
    pub complained_recipients: Vec<ComplainedRecipient>,
    pub timestamp: Option<DateTime<Utc>>,
    pub user_agent: String,
    pub complaint_feedback_type: String,
    pub arrival_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComplainedRecipient {
    pub email_address: String,
}

pub struct ComplaintHandler {
    subscriptions: Arc<SubscriptionService>,
}

impl ComplaintHandler {
    pub fn new(subscriptions: Arc<SubscriptionService>) -> Self {
        Self { subscriptions }
    }
}

#[async_trait]
impl EventHandler for ComplaintHandler {
    fn name(&self) -> &str {
        "complaint"
    }

    async fn handle(&self, details: &str) -> Result<HandlerResult, HandlerError> {
        let notification: ComplaintNotification = serde_json::from_str(details)?;
        let complaint = notification.complaint;

        let addresses: Vec<String> = complaint
            .complained_recipients
            .into_iter()
            .map(|recipient| recipient.email_address)
            .collect();

        self.subscriptions
            .process_email_complaint(&addresses, details, unix_time_or_now(complaint.timestamp))
            .await?;

        Ok(HandlerResult::success(
            self.name(),
            format!("complaint for {} recipient(s)", addresses.len()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SuppressionStore;
    use crate::subscription::tests::harness;

    const COMPLAINT: &str = r#"{
        "eventType": "Complaint",
        "complaint": {
            "feedbackId": "0100-def",
            "complaintSubType": null,
            "complainedRecipients": [{"emailAddress": "a@x.com"}],
            "timestamp": "2024-01-02T03:04:05Z",
            "userAgent": "ExampleMail/1.0",
            "complaintFeedbackType": "abuse",
            "arrivalDate": "2024-01-02T03:00:00Z"
        },
        "mail": {"source": "hello@example.com", "messageId": "m-2", "destination": ["a@x.com"]}
    }"#;

    #[tokio::test]
    async fn test_complaint_recorded() {
        let h = harness();
        h.service.create_email_subscription("a@x.com").await.unwrap();
        let handler = ComplaintHandler::new(Arc::new(h.service));

        let result = handler.handle(COMPLAINT).await.unwrap();
        assert_eq!(result.message, "complaint for 1 recipient(s)");

        let record = h.store.get("a@x.com").await.unwrap().unwrap();
        assert!(record.has_complaint);
        assert_eq!(record.complaint_details, COMPLAINT);
        assert_eq!(record.complaint_time_unix, 1_704_164_645);
        assert!(!record.is_eligible());
    }

    #[tokio::test]
    async fn test_missing_timestamp_uses_now() {
        let h = harness();
        h.service.create_email_subscription("a@x.com").await.unwrap();
        let handler = ComplaintHandler::new(Arc::new(h.service));

        let before = Utc::now().timestamp();
        handler
            .handle(r#"{"eventType":"Complaint","complaint":{"complainedRecipients":[{"emailAddress":"a@x.com"}]}}"#)
            .await
            .unwrap();

        let record = h.store.get("a@x.com").await.unwrap().unwrap();
        assert!(record.complaint_time_unix >= before);
    }
}
