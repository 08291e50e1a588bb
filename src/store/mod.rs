//! Suppression store: per-recipient subscription records.
//!
//! The [`SuppressionStore`] trait is the only shared mutable resource the
//! worker touches. Implementations must provide atomic single-record writes;
//! nothing here assumes multi-record transactions.
//!
//! ## Backends
//!
//! - [`InMemorySuppressionStore`]: process-local map, for tests and local runs
//! - [`RedisSuppressionStore`]: one Redis hash per address

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use thiserror::Error;

pub use memory::InMemorySuppressionStore;
pub use redis::RedisSuppressionStore;

/// Stored bounce value that suppresses all further sends.
pub const PERMANENT_BOUNCE: &str = "Permanent";

/// Errors raised by store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    /// A stored record could not be decoded
    #[error("corrupt subscription record for '{email}': {reason}")]
    Corrupt { email: String, reason: String },
}

/// Bounce classification stored on a record.
///
/// Permanent bounces supersede any sub-classification; transient bounces
/// keep the provider's sub-type verbatim (e.g. `MailboxFull`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BounceType {
    #[default]
    None,
    Transient(String),
    Permanent,
}

impl BounceType {
    /// Classify a provider bounce: `Permanent` when the type says so,
    /// otherwise the sub-type.
    pub fn from_notification(bounce_type: &str, bounce_sub_type: &str) -> Self {
        if bounce_type == PERMANENT_BOUNCE {
            BounceType::Permanent
        } else {
            Self::from_stored(bounce_sub_type)
        }
    }

    /// Decode the stored string form.
    pub fn from_stored(value: &str) -> Self {
        match value {
            "" => BounceType::None,
            PERMANENT_BOUNCE => BounceType::Permanent,
            other => BounceType::Transient(other.to_string()),
        }
    }

    /// The stored string form.
    pub fn as_stored(&self) -> &str {
        match self {
            BounceType::None => "",
            BounceType::Transient(sub_type) => sub_type,
            BounceType::Permanent => PERMANENT_BOUNCE,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, BounceType::Permanent)
    }
}

impl Serialize for BounceType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_stored())
    }
}

impl<'de> Deserialize<'de> for BounceType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::from_stored(&value))
    }
}

/// Why a recipient is excluded from outbound mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressionReason {
    Complaint,
    PermanentBounce,
}

/// One subscription record, keyed by the address exactly as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub email: String,
    #[serde(rename = "email_verified")]
    pub verified: bool,
    /// Set once, never cleared
    pub has_complaint: bool,
    pub has_bounce: bool,
    pub complaint_details: String,
    #[serde(rename = "complaint_date")]
    pub complaint_time_unix: i64,
    pub bounce_type: BounceType,
    pub bounce_details: String,
    #[serde(rename = "bounce_date")]
    pub bounce_time_unix: i64,
    #[serde(rename = "creation_date")]
    pub created_unix: i64,
    pub subscription_token: String,
}

impl SubscriptionRecord {
    /// A fresh, unverified record.
    pub fn new(email: impl Into<String>, subscription_token: impl Into<String>, created_unix: i64) -> Self {
        Self {
            email: email.into(),
            verified: false,
            has_complaint: false,
            has_bounce: false,
            complaint_details: String::new(),
            complaint_time_unix: 0,
            bounce_type: BounceType::None,
            bounce_details: String::new(),
            bounce_time_unix: 0,
            created_unix,
            subscription_token: subscription_token.into(),
        }
    }

    /// The suppression fact that blocks sending, if any.
    pub fn suppression_reason(&self) -> Option<SuppressionReason> {
        if self.has_complaint {
            Some(SuppressionReason::Complaint)
        } else if self.bounce_type.is_permanent() {
            Some(SuppressionReason::PermanentBounce)
        } else {
            None
        }
    }

    /// Verified and not suppressed.
    pub fn is_eligible(&self) -> bool {
        self.verified && self.suppression_reason().is_none()
    }

    /// Layer an update onto the record.
    ///
    /// Complaint and permanent-bounce facts are one-way: a later transient
    /// bounce refreshes details and time but keeps `Permanent`.
    pub fn apply(&mut self, update: &SubscriptionUpdate) {
        match update {
            SubscriptionUpdate::Verify => self.verified = true,
            SubscriptionUpdate::Complaint { details, time_unix } => {
                self.has_complaint = true;
                self.complaint_details = details.clone();
                self.complaint_time_unix = *time_unix;
            }
            SubscriptionUpdate::Bounce {
                bounce_type,
                details,
                time_unix,
            } => {
                self.has_bounce = true;
                if !self.bounce_type.is_permanent() {
                    self.bounce_type = bounce_type.clone();
                }
                self.bounce_details = details.clone();
                self.bounce_time_unix = *time_unix;
            }
        }
    }

    /// Flatten into string fields for hash-shaped backends.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("email", self.email.clone()),
            ("email_verified", self.verified.to_string()),
            ("has_complaint", self.has_complaint.to_string()),
            ("has_bounce", self.has_bounce.to_string()),
            ("complaint_details", self.complaint_details.clone()),
            ("complaint_date", self.complaint_time_unix.to_string()),
            ("bounce_type", self.bounce_type.as_stored().to_string()),
            ("bounce_details", self.bounce_details.clone()),
            ("bounce_date", self.bounce_time_unix.to_string()),
            ("creation_date", self.created_unix.to_string()),
            ("subscription_token", self.subscription_token.clone()),
        ]
    }

    /// Rebuild a record from string fields. Missing fields take their
    /// zero value.
    pub fn from_fields(email: &str, fields: &HashMap<String, String>) -> Result<Self, StoreError> {
        let text = |name: &str| fields.get(name).cloned().unwrap_or_default();
        let flag = |name: &str| -> Result<bool, StoreError> {
            match fields.get(name).map(String::as_str) {
                None | Some("") | Some("false") | Some("0") => Ok(false),
                Some("true") | Some("1") => Ok(true),
                Some(other) => Err(StoreError::Corrupt {
                    email: email.to_string(),
                    reason: format!("field '{name}' is not a boolean: {other}"),
                }),
            }
        };
        let number = |name: &str| -> Result<i64, StoreError> {
            match fields.get(name).map(String::as_str) {
                None | Some("") => Ok(0),
                Some(value) => value.parse().map_err(|_| StoreError::Corrupt {
                    email: email.to_string(),
                    reason: format!("field '{name}' is not an integer: {value}"),
                }),
            }
        };

        Ok(Self {
            email: email.to_string(),
            verified: flag("email_verified")?,
            has_complaint: flag("has_complaint")?,
            has_bounce: flag("has_bounce")?,
            complaint_details: text("complaint_details"),
            complaint_time_unix: number("complaint_date")?,
            bounce_type: BounceType::from_stored(&text("bounce_type")),
            bounce_details: text("bounce_details"),
            bounce_time_unix: number("bounce_date")?,
            created_unix: number("creation_date")?,
            subscription_token: text("subscription_token"),
        })
    }
}

/// A field-group update merged into an existing record.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionUpdate {
    Verify,
    Complaint { details: String, time_unix: i64 },
    Bounce { bounce_type: BounceType, details: String, time_unix: i64 },
}

impl SubscriptionUpdate {
    /// The fields this update writes, in stored form.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        match self {
            SubscriptionUpdate::Verify => vec![("email_verified", "true".to_string())],
            SubscriptionUpdate::Complaint { details, time_unix } => vec![
                ("has_complaint", "true".to_string()),
                ("complaint_date", time_unix.to_string()),
                ("complaint_details", details.clone()),
            ],
            SubscriptionUpdate::Bounce {
                bounce_type,
                details,
                time_unix,
            } => vec![
                ("has_bounce", "true".to_string()),
                ("bounce_date", time_unix.to_string()),
                ("bounce_type", bounce_type.as_stored().to_string()),
                ("bounce_details", details.clone()),
            ],
        }
    }
}

/// Precondition attached to a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// Upsert: creates the record if it is missing
    Always,
    /// Only touch a record that already exists
    RecordExists,
}

/// Persistence contract for subscription records.
#[async_trait]
pub trait SuppressionStore: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Fetch a record, `None` when absent.
    async fn get(&self, email: &str) -> Result<Option<SubscriptionRecord>, StoreError>;

    /// Existence probe.
    async fn exists(&self, email: &str) -> Result<bool, StoreError>;

    /// Insert `record` unless one already exists for its address.
    ///
    /// Returns `false` (and writes nothing) when a record was already there.
    async fn put_if_absent(&self, record: &SubscriptionRecord) -> Result<bool, StoreError>;

    /// Merge a field-group update atomically.
    ///
    /// Returns `false` when `condition` was not met and nothing was written.
    async fn merge(
        &self,
        email: &str,
        update: &SubscriptionUpdate,
        condition: WriteCondition,
    ) -> Result<bool, StoreError>;

    /// Connectivity check used by the health endpoint.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
