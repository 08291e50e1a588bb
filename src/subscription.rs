//! Subscription lifecycle and recipient filtering.
//!
//! ```text
//! absent ──create──▶ pending ──verify(token)──▶ verified
//!                                                  │
//!                     complaint / permanent bounce ▼
//!                                             suppressed (one-way)
//! ```
//!
//! Sends are filtered against the store: recipients without a record, with
//! a complaint, or with a permanent bounce are dropped before the gateway is
//! called. Everything else is sent in a single gateway call.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::gateway::{EmailGateway, GatewayError, OutboundEmail};
use crate::publisher::{PublishError, VerificationNotifier};
use crate::store::{
    BounceType, StoreError, SubscriptionRecord, SubscriptionUpdate, SuppressionStore, WriteCondition,
};
use crate::template::{TemplateError, TemplateRenderer};
use crate::token::{self, TokenError};

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("invalid email address: {0}")]
    Validation(String),

    #[error("no subscription found for '{0}'")]
    NotFound(String),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Basic mailbox syntax check: exactly one plain `local@domain` address.
pub fn is_valid_email(email: &str) -> bool {
    let Ok(list) = mailparse::addrparse(email) else {
        return false;
    };

    match list.extract_single_info() {
        Some(single) if single.display_name.is_none() && single.addr == email.trim() => {
            matches!(single.addr.split_once('@'), Some((local, domain)) if !local.is_empty() && !domain.is_empty())
        }
        _ => false,
    }
}

/// Caller-layer guard for [`SubscriptionService::create_email_subscription`].
pub fn validate_email(email: &str) -> Result<(), SubscriptionError> {
    if is_valid_email(email) {
        Ok(())
    } else {
        Err(SubscriptionError::Validation(email.to_string()))
    }
}

pub struct SubscriptionService {
    store: Arc<dyn SuppressionStore>,
    gateway: Arc<dyn EmailGateway>,
    renderer: Arc<dyn TemplateRenderer>,
    notifier: VerificationNotifier,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn SuppressionStore>,
        gateway: Arc<dyn EmailGateway>,
        renderer: Arc<dyn TemplateRenderer>,
        notifier: VerificationNotifier,
    ) -> Self {
        Self {
            store,
            gateway,
            renderer,
            notifier,
        }
    }

    /// Store a pending subscription and publish its verification mail.
    ///
    /// An existing record is left untouched, but a fresh token is still
    /// issued and mailed. The record is not rolled back if publishing fails.
    pub async fn create_email_subscription(&self, email: &str) -> Result<String, SubscriptionError> {
        let token = token::generate(email)?;
        let record = SubscriptionRecord::new(email, token.as_str(), Utc::now().timestamp());

        if self.store.put_if_absent(&record).await? {
            info!(email = %email, "Subscription created");
        } else {
            debug!(email = %email, "Subscription already stored, keeping existing record");
        }

        self.notifier.publish_email_verification_task(email, &token).await?;
        Ok(token)
    }

    pub async fn email_subscription_exists(&self, email: &str) -> Result<bool, SubscriptionError> {
        Ok(self.store.exists(email).await?)
    }

    /// Mark the subscription named by `token` as verified.
    ///
    /// Only the address half of the token is read. Never creates a record.
    pub async fn verify_email_with_subscription_token(&self, token: &str) -> Result<String, SubscriptionError> {
        let email = token::parse(token)?;

        let updated = self
            .store
            .merge(&email, &SubscriptionUpdate::Verify, WriteCondition::RecordExists)
            .await?;
        if !updated {
            return Err(SubscriptionError::NotFound(email));
        }

        info!(email = %email, "Subscription verified");
        Ok(email)
    }

    /// Record a complaint for every subscribed address in `addresses`.
    ///
    /// Unknown addresses are skipped. The first store error aborts the loop;
    /// addresses before it stay updated.
    pub async fn process_email_complaint(
        &self,
        addresses: &[String],
        details: &str,
        time_unix: i64,
    ) -> Result<(), SubscriptionError> {
        let update = SubscriptionUpdate::Complaint {
            details: details.to_string(),
            time_unix,
        };

        for address in addresses {
            self.apply_if_subscribed(address, &update).await?;
        }
        Ok(())
    }

    /// Record a bounce for every subscribed address in `addresses`.
    ///
    /// Stored as `Permanent` when `bounce_type` is permanent, otherwise as
    /// `bounce_sub_type` verbatim. Same partial-failure rules as complaints.
    pub async fn process_email_bounce(
        &self,
        addresses: &[String],
        bounce_type: &str,
        bounce_sub_type: &str,
        details: &str,
        time_unix: i64,
    ) -> Result<(), SubscriptionError> {
        let update = SubscriptionUpdate::Bounce {
            bounce_type: BounceType::from_notification(bounce_type, bounce_sub_type),
            details: details.to_string(),
            time_unix,
        };

        for address in addresses {
            self.apply_if_subscribed(address, &update).await?;
        }
        Ok(())
    }

    async fn apply_if_subscribed(&self, address: &str, update: &SubscriptionUpdate) -> Result<(), SubscriptionError> {
        let applied = self
            .store
            .merge(address, update, WriteCondition::RecordExists)
            .await
            .inspect_err(|e| warn!(email = %address, error = %e, "Failed to update subscription"))?;

        if applied {
            debug!(email = %address, update = ?update, "Subscription updated");
        } else {
            debug!(email = %address, "No subscription for address, skipping");
        }
        Ok(())
    }

    /// Render `template` once and send it to the eligible subset of
    /// `recipients`.
    ///
    /// Returns the recipients the message went to. An empty result means
    /// nobody was eligible and the gateway was not called.
    pub async fn send_templated_email(
        &self,
        template: &str,
        params: &HashMap<String, String>,
        subject: &str,
        sender: &str,
        recipients: &[String],
    ) -> Result<Vec<String>, SubscriptionError> {
        let mut allowed = Vec::with_capacity(recipients.len());

        for recipient in recipients {
            match self.store.get(recipient).await? {
                None => {
                    info!(email = %recipient, "Skipping recipient without subscription");
                }
                Some(record) => match record.suppression_reason() {
                    Some(reason) => {
                        info!(email = %recipient, reason = ?reason, "Skipping suppressed recipient");
                    }
                    None => {
                        if !record.is_eligible() {
                            // Verification mails go to pending subscribers
                            debug!(email = %recipient, "Recipient not verified yet");
                        }
                        allowed.push(recipient.clone());
                    }
                },
            }
        }

        if allowed.is_empty() {
            info!(template = %template, requested = recipients.len(), "No eligible recipients, nothing sent");
            return Ok(allowed);
        }

        let body = self.renderer.render(template, params)?;
        let email = OutboundEmail {
            sender: sender.to_string(),
            recipients: allowed,
            subject: subject.to_string(),
            body,
        };
        self.gateway.send(&email).await?;

        info!(
            template = %template,
            gateway = %self.gateway.name(),
            requested = recipients.len(),
            sent = email.recipients.len(),
            "Templated email sent"
        );
        Ok(email.recipients)
    }
}
