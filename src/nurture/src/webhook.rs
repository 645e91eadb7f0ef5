//! Outbound webhook caller backed by `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use nurture_core::collaborators::{CollaboratorResult, WebhookCaller};
use nurture_core::CollaboratorError;
use tracing::debug;

pub struct HttpWebhookCaller {
    client: reqwest::Client,
    timeout_ms: u64,
}

impl HttpWebhookCaller {
    pub fn new(timeout_ms: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .user_agent(concat!("nurture/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, timeout_ms })
    }
}

/// Maps a transport error onto the collaborator taxonomy.
pub(crate) fn classify(err: reqwest::Error, timeout_ms: u64) -> CollaboratorError {
    if err.is_timeout() {
        CollaboratorError::Timeout(timeout_ms)
    } else if err.is_connect() || err.is_request() {
        CollaboratorError::Transient(err.to_string())
    } else {
        CollaboratorError::Permanent(err.to_string())
    }
}

#[async_trait]
impl WebhookCaller for HttpWebhookCaller {
    async fn post(&self, url: &str, payload: &serde_json::Value) -> CollaboratorResult<u16> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| classify(e, self.timeout_ms))?;

        let status = response.status().as_u16();
        debug!(url, status, "Webhook delivered");
        Ok(status)
    }
}
