//! Team notifications over Slack and Discord incoming webhooks, or email.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nurture_core::collaborators::{CollaboratorResult, MailDispatcher, NotificationDispatcher};
use nurture_core::config::NotifyConfig;
use nurture_core::types::{NotifyMethod, OutboundEmail, TeamNotification};
use nurture_core::CollaboratorError;
use serde_json::json;

use crate::webhook::classify;

pub struct ChatNotifier {
    client: reqwest::Client,
    timeout_ms: u64,
    config: NotifyConfig,
    mailer: Arc<dyn MailDispatcher>,
}

impl ChatNotifier {
    pub fn new(config: NotifyConfig, timeout_ms: u64, mailer: Arc<dyn MailDispatcher>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;
        Ok(Self {
            client,
            timeout_ms,
            config,
            mailer,
        })
    }

    async fn post_json(&self, url: &str, body: serde_json::Value) -> CollaboratorResult<()> {
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify(e, self.timeout_ms))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(CollaboratorError::Transient(format!("notification endpoint returned {status}")));
        }
        if !status.is_success() {
            return Err(CollaboratorError::Permanent(format!("notification endpoint returned {status}")));
        }
        Ok(())
    }
}

fn render(notification: &TeamNotification) -> String {
    let contact = match &notification.contact_name {
        Some(name) => format!("{name} <{}>", notification.contact_email),
        None => notification.contact_email.clone(),
    };
    format!(
        "{}\nWorkflow: {}\nContact: {contact}",
        notification.message, notification.workflow_name
    )
}

fn not_configured(what: &str) -> CollaboratorError {
    CollaboratorError::Permanent(format!("{what} is not configured"))
}

#[async_trait]
impl NotificationDispatcher for ChatNotifier {
    async fn notify(&self, notification: &TeamNotification) -> CollaboratorResult<()> {
        let text = render(notification);
        match notification.method {
            NotifyMethod::Slack => {
                let url = self
                    .config
                    .slack_webhook_url
                    .as_deref()
                    .ok_or_else(|| not_configured("Slack webhook URL"))?;
                self.post_json(url, json!({ "text": text })).await
            }
            NotifyMethod::Discord => {
                let url = self
                    .config
                    .discord_webhook_url
                    .as_deref()
                    .ok_or_else(|| not_configured("Discord webhook URL"))?;
                self.post_json(url, json!({ "content": text })).await
            }
            NotifyMethod::Email => {
                let recipient = self
                    .config
                    .team_email
                    .clone()
                    .ok_or_else(|| not_configured("team email"))?;
                let email = OutboundEmail {
                    recipient,
                    subject: format!("[{}] {}", notification.workflow_name, notification.message),
                    body: text,
                    template_id: None,
                    tracking_token: String::new(),
                };
                self.mailer.send(&email).await.map(|_| ())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nurture_core::memory::RecordingMailer;

    fn notification(method: NotifyMethod) -> TeamNotification {
        TeamNotification {
            method,
            message: "Hot lead".into(),
            workflow_name: "Trial follow-up".into(),
            contact_email: "ada@example.com".into(),
            contact_name: Some("Ada".into()),
        }
    }

    #[test]
    fn test_render_includes_contact() {
        let text = render(&notification(NotifyMethod::Slack));
        assert!(text.starts_with("Hot lead"));
        assert!(text.contains("Workflow: Trial follow-up"));
        assert!(text.contains("Ada <ada@example.com>"));
    }

    #[tokio::test]
    async fn test_email_goes_to_team_address() {
        let mailer = Arc::new(RecordingMailer::new());
        let config = NotifyConfig {
            team_email: Some("team@example.com".into()),
            ..NotifyConfig::default()
        };
        let notifier = ChatNotifier::new(config, 1_000, mailer.clone()).unwrap();
        notifier.notify(&notification(NotifyMethod::Email)).await.unwrap();
        assert_eq!(mailer.sent_to("team@example.com").len(), 1);
    }

    #[tokio::test]
    async fn test_missing_slack_url_is_permanent() {
        let notifier =
            ChatNotifier::new(NotifyConfig::default(), 1_000, Arc::new(RecordingMailer::new())).unwrap();
        let err = notifier.notify(&notification(NotifyMethod::Slack)).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Permanent(_)));
    }
}
