//! Core envelope types for mailgate.
//!
//! An [`Envelope`] is the unit of queued work. Producers publish envelopes
//! onto the queue, the worker drains them and the router picks a handler
//! based on the envelope's [`EventKind`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// The closed set of event kinds the worker knows how to handle.
///
/// The wire values are fixed by the producers: task kinds are emitted by
/// mailgate itself, `Bounce` and `Complaint` come straight from the mail
/// provider's notification feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Render a template and send it to a filtered recipient list
    SendEmail,
    /// Create the user row for a freshly confirmed account
    ConfirmAccount,
    /// Provider bounce notification
    Bounce,
    /// Provider complaint notification
    Complaint,
}

impl EventKind {
    /// Every known kind, in dispatch-table order.
    pub const ALL: [EventKind; 4] = [
        EventKind::SendEmail,
        EventKind::ConfirmAccount,
        EventKind::Bounce,
        EventKind::Complaint,
    ];

    /// The `eventType` value used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SendEmail => "email-send-task",
            EventKind::ConfirmAccount => "account-confirmation-task",
            EventKind::Bounce => "Bounce",
            EventKind::Complaint => "Complaint",
        }
    }

    /// Look up a kind by its wire value. Matching is exact.
    pub fn from_wire(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Inbound notifications are re-parsed from the whole raw envelope,
    /// because their context lives next to `eventType` rather than inside
    /// `eventDetails`.
    pub fn is_inbound_notification(&self) -> bool {
        matches!(self, EventKind::Bounce | EventKind::Complaint)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An envelope flowing through the queue.
///
/// # Example
///
/// ```json
/// {
///   "eventType": "email-send-task",
///   "correlationId": "abc123",
///   "eventDetails": "{\"templateName\":\"welcome\", ...}"
/// }
/// ```
///
/// `eventDetails` is itself serialized JSON. Bounce and complaint
/// notifications carry neither `correlationId` nor `eventDetails`, so both
/// default to empty strings.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Envelope {
    /// Event kind tag used for routing
    #[serde(rename = "eventType")]
    pub event_type: String,

    /// Opaque tracing id, may be empty
    #[serde(rename = "correlationId", default)]
    pub correlation_id: String,

    /// Kind-specific serialized payload
    #[serde(rename = "eventDetails", default)]
    pub event_details: String,
}

impl Envelope {
    /// Create an envelope for a known kind with an empty correlation id.
    pub fn new(kind: EventKind, event_details: impl Into<String>) -> Self {
        Self {
            event_type: kind.as_str().to_string(),
            correlation_id: String::new(),
            event_details: event_details.into(),
        }
    }

    /// Serialize `payload` into `eventDetails` and wrap it.
    pub fn for_task<T: Serialize>(kind: EventKind, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_string(payload)?))
    }

    /// Set the correlation ID
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    /// The kind of this envelope, if it is one we recognise.
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_wire(&self.event_type)
    }
}

/// Payload of an `email-send-task` envelope.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EmailSendTask {
    pub template_name: String,
    pub sender_address: String,
    pub subject_line: String,
    #[serde(default)]
    pub to_addresses: Vec<String>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Payload of an `account-confirmation-task` envelope.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountConfirmationTask {
    /// User name issued by the external identity provider
    pub user_name: String,
    pub email_address: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_deserialize() {
        let json_str = r#"{
            "eventType": "email-send-task",
            "correlationId": "abc-123",
            "eventDetails": "{\"templateName\":\"welcome\"}"
        }"#;

        let envelope: Envelope = serde_json::from_str(json_str).unwrap();
        assert_eq!(envelope.kind(), Some(EventKind::SendEmail));
        assert_eq!(envelope.correlation_id, "abc-123");
        assert_eq!(envelope.event_details, r#"{"templateName":"welcome"}"#);
    }

    #[test]
    fn test_notification_envelope_defaults() {
        // Provider notifications carry neither correlationId nor eventDetails
        let json_str = r#"{"eventType": "Bounce", "bounce": {"bounceType": "Permanent"}}"#;

        let envelope: Envelope = serde_json::from_str(json_str).unwrap();
        assert_eq!(envelope.kind(), Some(EventKind::Bounce));
        assert!(envelope.correlation_id.is_empty());
        assert!(envelope.event_details.is_empty());
    }

    #[test]
    fn test_envelope_serialize_uses_wire_names() {
        let envelope = Envelope::new(EventKind::ConfirmAccount, "{}").with_correlation_id("c-1");

        let json_str = serde_json::to_string(&envelope).unwrap();
        assert!(json_str.contains(r#""eventType":"account-confirmation-task""#));
        assert!(json_str.contains(r#""correlationId":"c-1""#));
        assert!(json_str.contains(r#""eventDetails":"{}""#));
    }

    #[test]
    fn test_kind_wire_values() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_wire(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::from_wire("bounce"), None);
        assert_eq!(EventKind::from_wire("user.created"), None);
    }

    #[test]
    fn test_inbound_notification_kinds() {
        assert!(EventKind::Bounce.is_inbound_notification());
        assert!(EventKind::Complaint.is_inbound_notification());
        assert!(!EventKind::SendEmail.is_inbound_notification());
        assert!(!EventKind::ConfirmAccount.is_inbound_notification());
    }

    #[test]
    fn test_for_task_embeds_payload() {
        let task = AccountConfirmationTask {
            user_name: "u-1".to_string(),
            email_address: "a@x.com".to_string(),
        };

        let envelope = Envelope::for_task(EventKind::ConfirmAccount, &task).unwrap();
        let decoded: AccountConfirmationTask = serde_json::from_str(&envelope.event_details).unwrap();
        assert_eq!(decoded, task);
        assert!(envelope.correlation_id.is_empty());
    }
}
