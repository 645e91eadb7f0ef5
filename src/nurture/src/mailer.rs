//! Mail dispatcher for local runs: writes each outbound email to the log.

use async_trait::async_trait;
use nurture_core::collaborators::{CollaboratorResult, MailDispatcher};
use nurture_core::types::OutboundEmail;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl MailDispatcher for LogMailer {
    async fn send(&self, email: &OutboundEmail) -> CollaboratorResult<String> {
        let message_id = format!("log-{}", Uuid::new_v4());
        info!(
            message_id = %message_id,
            recipient = %email.recipient,
            subject = %email.subject,
            template_id = ?email.template_id,
            "Email dispatched"
        );
        Ok(message_id)
    }
}
