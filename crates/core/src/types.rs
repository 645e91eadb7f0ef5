use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Contact record as seen by the engine. Owned by the contact store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub tag_ids: BTreeSet<String>,
    #[serde(default)]
    pub segment_ids: BTreeSet<String>,
    pub subscribed_at: DateTime<Utc>,
}

impl Contact {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            first_name: None,
            last_name: None,
            tag_ids: BTreeSet::new(),
            segment_ids: BTreeSet::new(),
            subscribed_at: Utc::now(),
        }
    }

    pub fn display_name(&self) -> Option<String> {
        self.first_name.as_ref().map(|first| {
            format!("{} {}", first, self.last_name.as_deref().unwrap_or(""))
                .trim()
                .to_string()
        })
    }
}

/// Selects the contacts a filtered bulk enrollment streams over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ContactFilter {
    All,
    Tag { tag_id: String },
    Segment { segment_id: String },
    NoTags,
}

impl ContactFilter {
    pub fn matches(&self, contact: &Contact) -> bool {
        match self {
            ContactFilter::All => true,
            ContactFilter::Tag { tag_id } => contact.tag_ids.contains(tag_id),
            ContactFilter::Segment { segment_id } => contact.segment_ids.contains(segment_id),
            ContactFilter::NoTags => contact.tag_ids.is_empty(),
        }
    }
}

/// Purchases known for a contact, by product and by course.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseSet {
    pub product_ids: BTreeSet<String>,
    pub course_ids: BTreeSet<String>,
}

impl PurchaseSet {
    pub fn is_empty(&self) -> bool {
        self.product_ids.is_empty() && self.course_ids.is_empty()
    }
}

/// A message handed to the mail dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    /// Set when the dispatcher renders a stored template instead of `body`.
    pub template_id: Option<String>,
    pub tracking_token: String,
}

/// Delivery feedback arriving from the mail dispatcher after a send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum EmailEvent {
    Delivered,
    Opened,
    Clicked { url: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyMethod {
    Email,
    Slack,
    Discord,
}

/// Team notification raised by a `notify` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamNotification {
    pub method: NotifyMethod,
    pub message: String,
    pub workflow_name: String,
    pub contact_email: String,
    pub contact_name: Option<String>,
}

/// Request for generated course-cycle email content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentRequest {
    pub course_id: String,
    pub phase: String,
    pub email_index: u32,
    pub alternate: bool,
}

/// Generated subject/body pair. Empty strings mean "nothing usable".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub subject: String,
    pub body: String,
}

impl GeneratedContent {
    pub fn is_empty(&self) -> bool {
        self.subject.trim().is_empty() || self.body.trim().is_empty()
    }
}

/// Engine event delivered to the configured `EventSink`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub workflow_id: Uuid,
    pub execution_id: Option<Uuid>,
    pub contact_id: Option<String>,
    pub node_id: Option<String>,
    pub detail: Option<String>,
    pub node: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Workflow definition events
    WorkflowActivated,
    WorkflowDeactivated,
    WorkflowDeleted,
    // Execution lifecycle events
    ExecutionEnrolled,
    ExecutionStepCompleted,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
    ExecutionRetryScheduled,
    // Side-effect events
    EmailSent,
    WebhookFailed,
    NotificationFailed,
    GoalReached,
    // A/B testing events
    VariantAssigned,
    WinnerSelected,
    // Course cycle events
    CourseAdvanced,
    CycleLooped,
}
