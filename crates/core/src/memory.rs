//! In-memory collaborator implementations for tests and local runs.
//!
//! Each recording collaborator keeps what it was asked to do and can be told
//! to fail, either for the next few calls or until cleared.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::collaborators::{
    CollaboratorResult, Collaborators, ContactStore, ContactStream, ContentGenerator,
    MailDispatcher, NotificationDispatcher, PurchaseStore, WebhookCaller,
};
use crate::error::CollaboratorError;
use crate::types::{
    Contact, ContactFilter, ContentRequest, GeneratedContent, OutboundEmail, PurchaseSet,
    TeamNotification,
};

/// Failure plan shared by the recording collaborators.
#[derive(Default)]
pub struct FailureInjector {
    plan: Mutex<Option<(CollaboratorError, Option<u32>)>>,
}

impl FailureInjector {
    /// Fail every call until `clear` is called.
    pub fn fail_always(&self, error: CollaboratorError) {
        *self.plan.lock() = Some((error, None));
    }

    /// Fail the next `times` calls, then recover.
    pub fn fail_times(&self, error: CollaboratorError, times: u32) {
        *self.plan.lock() = Some((error, Some(times)));
    }

    pub fn clear(&self) {
        *self.plan.lock() = None;
    }

    fn check(&self) -> CollaboratorResult<()> {
        let mut plan = self.plan.lock();
        let Some((error, remaining)) = plan.as_mut() else {
            return Ok(());
        };
        let error = error.clone();
        match remaining {
            None => Err(error),
            Some(0) => {
                *plan = None;
                Ok(())
            }
            Some(n) => {
                *n -= 1;
                if *n == 0 {
                    *plan = None;
                }
                Err(error)
            }
        }
    }
}

// ─── Contacts ───────────────────────────────────────────────────────────────

pub struct InMemoryContactStore {
    contacts: Arc<RwLock<BTreeMap<String, Contact>>>,
    tags: RwLock<BTreeMap<String, String>>,
    page_size: usize,
    /// Applies to lookups and tag writes; streaming is never failed.
    pub failures: FailureInjector,
}

impl InMemoryContactStore {
    pub fn new() -> Self {
        Self {
            contacts: Arc::new(RwLock::new(BTreeMap::new())),
            tags: RwLock::new(BTreeMap::new()),
            page_size: 100,
            failures: FailureInjector::default(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn insert(&self, contact: Contact) {
        self.contacts.write().insert(contact.id.clone(), contact);
    }

    /// Registers a tag and returns its id.
    pub fn insert_tag(&self, tag_id: impl Into<String>, name: impl Into<String>) -> String {
        let tag_id = tag_id.into();
        self.tags.write().insert(tag_id.clone(), name.into());
        tag_id
    }

    pub fn contact(&self, contact_id: &str) -> Option<Contact> {
        self.contacts.read().get(contact_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.contacts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.read().is_empty()
    }
}

impl Default for InMemoryContactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContactStore for InMemoryContactStore {
    async fn get(&self, contact_id: &str) -> CollaboratorResult<Option<Contact>> {
        self.failures.check()?;
        Ok(self.contact(contact_id))
    }

    async fn find_tag_by_name(&self, name: &str) -> CollaboratorResult<Option<String>> {
        self.failures.check()?;
        Ok(self
            .tags
            .read()
            .iter()
            .find(|(_, tag_name)| tag_name.as_str() == name)
            .map(|(id, _)| id.clone()))
    }

    async fn create_tag(&self, name: &str) -> CollaboratorResult<String> {
        if let Some(existing) = self.find_tag_by_name(name).await? {
            return Ok(existing);
        }
        Ok(self.insert_tag(format!("tag-{}", Uuid::new_v4()), name))
    }

    async fn add_tag(&self, contact_id: &str, tag_id: &str) -> CollaboratorResult<()> {
        self.failures.check()?;
        if !self.tags.read().contains_key(tag_id) {
            return Err(CollaboratorError::NotFound {
                kind: "Tag",
                id: tag_id.to_string(),
            });
        }
        let mut contacts = self.contacts.write();
        let contact = contacts
            .get_mut(contact_id)
            .ok_or_else(|| CollaboratorError::NotFound {
                kind: "Contact",
                id: contact_id.to_string(),
            })?;
        contact.tag_ids.insert(tag_id.to_string());
        Ok(())
    }

    async fn remove_tag(&self, contact_id: &str, tag_id: &str) -> CollaboratorResult<()> {
        self.failures.check()?;
        let mut contacts = self.contacts.write();
        let contact = contacts
            .get_mut(contact_id)
            .ok_or_else(|| CollaboratorError::NotFound {
                kind: "Contact",
                id: contact_id.to_string(),
            })?;
        contact.tag_ids.remove(tag_id);
        Ok(())
    }

    fn stream_contacts(&self, filter: ContactFilter) -> ContactStream {
        let contacts = Arc::clone(&self.contacts);
        let page_size = self.page_size;

        // State: `None` once exhausted, otherwise the last key of the previous page.
        futures::stream::unfold(Some(None::<String>), move |cursor| {
            let contacts = Arc::clone(&contacts);
            let filter = filter.clone();
            async move {
                let after = cursor?;
                let start = match after {
                    Some(key) => Bound::Excluded(key),
                    None => Bound::Unbounded,
                };
                let page: Vec<Contact> = contacts
                    .read()
                    .range::<String, _>((start, Bound::Unbounded))
                    .take(page_size)
                    .map(|(_, contact)| contact.clone())
                    .collect();
                if page.is_empty() {
                    return None;
                }
                let next = if page.len() < page_size {
                    None
                } else {
                    page.last().map(|c| Some(c.id.clone()))
                };
                let matching: Vec<CollaboratorResult<Contact>> = page
                    .into_iter()
                    .filter(|c| filter.matches(c))
                    .map(Ok)
                    .collect();
                Some((futures::stream::iter(matching), next))
            }
        })
        .flatten()
        .boxed()
    }
}

// ─── Purchases ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryPurchaseStore {
    purchases: DashMap<String, PurchaseSet>,
    pub failures: FailureInjector,
}

impl InMemoryPurchaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_course(&self, contact_id: &str, course_id: impl Into<String>) {
        self.purchases
            .entry(contact_id.to_string())
            .or_default()
            .course_ids
            .insert(course_id.into());
    }

    pub fn record_product(&self, contact_id: &str, product_id: impl Into<String>) {
        self.purchases
            .entry(contact_id.to_string())
            .or_default()
            .product_ids
            .insert(product_id.into());
    }
}

#[async_trait]
impl PurchaseStore for InMemoryPurchaseStore {
    async fn purchases(&self, contact: &Contact) -> CollaboratorResult<PurchaseSet> {
        self.failures.check()?;
        Ok(self
            .purchases
            .get(&contact.id)
            .map(|p| p.clone())
            .unwrap_or_default())
    }
}

// ─── Mail ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SentEmail {
    pub message_id: String,
    pub email: OutboundEmail,
}

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentEmail>>,
    pub failures: FailureInjector,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn sent_to(&self, recipient: &str) -> Vec<SentEmail> {
        self.sent
            .lock()
            .iter()
            .filter(|s| s.email.recipient == recipient)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MailDispatcher for RecordingMailer {
    async fn send(&self, email: &OutboundEmail) -> CollaboratorResult<String> {
        self.failures.check()?;
        let message_id = format!("msg-{}", Uuid::new_v4());
        self.sent.lock().push(SentEmail {
            message_id: message_id.clone(),
            email: email.clone(),
        });
        Ok(message_id)
    }
}

// ─── Notifications ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<TeamNotification>>,
    pub failures: FailureInjector,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<TeamNotification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingNotifier {
    async fn notify(&self, notification: &TeamNotification) -> CollaboratorResult<()> {
        self.failures.check()?;
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

// ─── Webhooks ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingWebhookCaller {
    calls: Mutex<Vec<(String, serde_json::Value)>>,
    pub failures: FailureInjector,
}

impl RecordingWebhookCaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, serde_json::Value)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl WebhookCaller for RecordingWebhookCaller {
    async fn post(&self, url: &str, payload: &serde_json::Value) -> CollaboratorResult<u16> {
        self.failures.check()?;
        self.calls.lock().push((url.to_string(), payload.clone()));
        Ok(200)
    }
}

// ─── Content ────────────────────────────────────────────────────────────────

/// Content generator that answers every request with a canned template.
#[derive(Default)]
pub struct StaticContentGenerator {
    requests: Mutex<Vec<ContentRequest>>,
    pub failures: FailureInjector,
}

impl StaticContentGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<ContentRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ContentGenerator for StaticContentGenerator {
    async fn generate(&self, request: &ContentRequest) -> CollaboratorResult<GeneratedContent> {
        self.requests.lock().push(request.clone());
        self.failures.check()?;
        Ok(GeneratedContent {
            subject: format!("{} #{} for {}", request.phase, request.email_index + 1, request.course_id),
            body: format!("<p>Generated {} content for course {}</p>", request.phase, request.course_id),
        })
    }
}

/// Handles to a full set of in-memory collaborators.
#[derive(Clone)]
pub struct InMemoryCollaborators {
    pub contacts: Arc<InMemoryContactStore>,
    pub purchases: Arc<InMemoryPurchaseStore>,
    pub mailer: Arc<RecordingMailer>,
    pub notifier: Arc<RecordingNotifier>,
    pub webhooks: Arc<RecordingWebhookCaller>,
    pub content: Arc<StaticContentGenerator>,
}

impl InMemoryCollaborators {
    pub fn new() -> Self {
        Self {
            contacts: Arc::new(InMemoryContactStore::new()),
            purchases: Arc::new(InMemoryPurchaseStore::new()),
            mailer: Arc::new(RecordingMailer::new()),
            notifier: Arc::new(RecordingNotifier::new()),
            webhooks: Arc::new(RecordingWebhookCaller::new()),
            content: Arc::new(StaticContentGenerator::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            contacts: self.contacts.clone(),
            purchases: self.purchases.clone(),
            mailer: self.mailer.clone(),
            notifier: self.notifier.clone(),
            webhooks: self.webhooks.clone(),
            content: Some(self.content.clone()),
        }
    }
}

impl Default for InMemoryCollaborators {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn seeded_store(count: usize, page_size: usize) -> InMemoryContactStore {
        let store = InMemoryContactStore::new().with_page_size(page_size);
        let vip = store.insert_tag("vip", "VIP");
        for i in 0..count {
            let mut contact = Contact::new(format!("c-{:03}", i), format!("c{}@example.com", i));
            if i % 3 == 0 {
                contact.tag_ids.insert(vip.clone());
            }
            store.insert(contact);
        }
        store
    }

    #[tokio::test]
    async fn test_stream_pages_through_all_contacts() {
        let store = seeded_store(25, 4);
        let all: Vec<Contact> = store
            .stream_contacts(ContactFilter::All)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all.len(), 25);
        assert_eq!(all[0].id, "c-000");
        assert_eq!(all[24].id, "c-024");
    }

    #[tokio::test]
    async fn test_stream_applies_filter() {
        let store = seeded_store(10, 3);
        let vips: Vec<Contact> = store
            .stream_contacts(ContactFilter::Tag {
                tag_id: "vip".into(),
            })
            .try_collect()
            .await
            .unwrap();
        assert_eq!(vips.len(), 4);
        let untagged: Vec<Contact> = store
            .stream_contacts(ContactFilter::NoTags)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(untagged.len(), 6);
    }

    #[tokio::test]
    async fn test_tag_lifecycle() {
        let store = seeded_store(1, 10);
        let tag = store.create_tag("Buyer").await.unwrap();
        assert_eq!(store.create_tag("Buyer").await.unwrap(), tag);
        store.add_tag("c-000", &tag).await.unwrap();
        assert!(store.contact("c-000").unwrap().tag_ids.contains(&tag));
        store.remove_tag("c-000", &tag).await.unwrap();
        assert!(!store.contact("c-000").unwrap().tag_ids.contains(&tag));

        let missing = store.add_tag("c-000", "nope").await.unwrap_err();
        assert!(matches!(missing, CollaboratorError::NotFound { kind: "Tag", .. }));
    }

    #[tokio::test]
    async fn test_failure_injector_recovers() {
        let mailer = RecordingMailer::new();
        mailer
            .failures
            .fail_times(CollaboratorError::Transient("503".into()), 2);
        let email = OutboundEmail {
            recipient: "a@example.com".into(),
            subject: "Hi".into(),
            body: "Body".into(),
            template_id: None,
            tracking_token: "t".into(),
        };
        assert!(mailer.send(&email).await.is_err());
        assert!(mailer.send(&email).await.is_err());
        assert!(mailer.send(&email).await.is_ok());
        assert_eq!(mailer.count(), 1);
    }
}
