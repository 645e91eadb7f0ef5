//! External collaborators consumed by the engine.
//!
//! Every trait here is an async seam to a system the engine does not own:
//! contact/tag storage, purchase lookups, mail transport, team notifications,
//! outbound webhooks and generated content. Timeouts are applied by the
//! caller, so implementations can stay plain request/response.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::CollaboratorError;
use crate::types::{
    Contact, ContactFilter, ContentRequest, GeneratedContent, OutboundEmail, PurchaseSet,
    TeamNotification,
};

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Stream of contacts matching a filter, produced page by page.
pub type ContactStream = BoxStream<'static, CollaboratorResult<Contact>>;

#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn get(&self, contact_id: &str) -> CollaboratorResult<Option<Contact>>;

    async fn find_tag_by_name(&self, name: &str) -> CollaboratorResult<Option<String>>;

    async fn create_tag(&self, name: &str) -> CollaboratorResult<String>;

    async fn add_tag(&self, contact_id: &str, tag_id: &str) -> CollaboratorResult<()>;

    async fn remove_tag(&self, contact_id: &str, tag_id: &str) -> CollaboratorResult<()>;

    /// Streams contacts matching `filter` without loading the full set.
    fn stream_contacts(&self, filter: ContactFilter) -> ContactStream;
}

#[async_trait]
pub trait PurchaseStore: Send + Sync {
    async fn purchases(&self, contact: &Contact) -> CollaboratorResult<PurchaseSet>;
}

#[async_trait]
pub trait MailDispatcher: Send + Sync {
    /// Queues the email and returns the provider's message id.
    async fn send(&self, email: &OutboundEmail) -> CollaboratorResult<String>;
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify(&self, notification: &TeamNotification) -> CollaboratorResult<()>;
}

#[async_trait]
pub trait WebhookCaller: Send + Sync {
    /// POSTs `payload` as JSON and returns the response status.
    async fn post(&self, url: &str, payload: &serde_json::Value) -> CollaboratorResult<u16>;
}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, request: &ContentRequest) -> CollaboratorResult<GeneratedContent>;
}

/// Bundle of collaborator handles injected into the engine.
#[derive(Clone)]
pub struct Collaborators {
    pub contacts: Arc<dyn ContactStore>,
    pub purchases: Arc<dyn PurchaseStore>,
    pub mailer: Arc<dyn MailDispatcher>,
    pub notifier: Arc<dyn NotificationDispatcher>,
    pub webhooks: Arc<dyn WebhookCaller>,
    pub content: Option<Arc<dyn ContentGenerator>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("content_generator", &self.content.is_some())
            .finish_non_exhaustive()
    }
}
