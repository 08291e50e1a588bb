//! `account-confirmation-task` handler: creates the user row once the
//! identity provider has confirmed the account.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{EventHandler, HandlerError, HandlerResult};
use crate::event::AccountConfirmationTask;
use crate::identity::IdentityStore;

pub struct AccountConfirmationHandler {
    identity: Arc<dyn IdentityStore>,
}

impl AccountConfirmationHandler {
    pub fn new(identity: Arc<dyn IdentityStore>) -> Self {
        Self { identity }
    }
}

#[async_trait]
impl EventHandler for AccountConfirmationHandler {
    fn name(&self) -> &str {
        "account-confirmation"
    }

    async fn handle(&self, details: &str) -> Result<HandlerResult, HandlerError> {
        let task: AccountConfirmationTask = serde_json::from_str(details)?;

        let user_id = self
            .identity
            .create_user(&task.email_address, &task.user_name)
            .await?;

        info!(user_id = %user_id, email = %task.email_address, "Account confirmed");
        Ok(HandlerResult::success(self.name(), format!("created user {user_id}")))
    }
}
