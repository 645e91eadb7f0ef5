use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nurture_core::types::NotifyMethod;

use crate::course_cycle::{CourseCycleState, CyclePhase, EngagementWait};
use crate::evaluator::Condition;

/// A workflow definition: a directed graph of typed nodes plus its trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub trigger: Trigger,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub is_active: bool,
    /// Bumped on every graph edit; executions pin the version they enrolled on.
    #[serde(default)]
    pub graph_version: u32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub stats: WorkflowStats,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, trigger: Trigger, nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            trigger,
            nodes,
            edges,
            is_active: false,
            graph_version: 1,
            created_at: now,
            updated_at: now,
            stats: WorkflowStats::default(),
        }
    }
}

/// What enrolls a contact into a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "config")]
pub enum Trigger {
    LeadSignup,
    ProductPurchase {
        #[serde(default, rename = "productId")]
        product_id: Option<String>,
    },
    TagAdded {
        #[serde(rename = "tagId")]
        tag_id: String,
    },
    SegmentMember {
        #[serde(rename = "segmentId")]
        segment_id: String,
    },
    Manual,
    DateTime {
        #[serde(rename = "scheduledAt")]
        scheduled_at: DateTime<Utc>,
    },
    CustomEvent {
        #[serde(rename = "eventName")]
        event_name: String,
    },
}

impl Trigger {
    pub fn type_name(&self) -> &'static str {
        match self {
            Trigger::LeadSignup => "lead_signup",
            Trigger::ProductPurchase { .. } => "product_purchase",
            Trigger::TagAdded { .. } => "tag_added",
            Trigger::SegmentMember { .. } => "segment_member",
            Trigger::Manual => "manual",
            Trigger::DateTime { .. } => "date_time",
            Trigger::CustomEvent { .. } => "custom_event",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// One step in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub position: Position,
    pub kind: NodeKind,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            position: Position::default(),
            kind,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

/// Node payloads keyed by node type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "data")]
pub enum NodeKind {
    Trigger,
    Email(EmailNode),
    Delay(DelayNode),
    Condition(Condition),
    Action(ActionNode),
    Webhook(WebhookNode),
    Split(SplitNode),
    Notify(NotifyNode),
    Goal(GoalNode),
    CourseCycle(CourseCycleNode),
    CourseEmail(CourseEmailNode),
    PurchaseCheck(PurchaseCheckNode),
    CycleLoop,
    Stop,
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Trigger => "trigger",
            NodeKind::Email(_) => "email",
            NodeKind::Delay(_) => "delay",
            NodeKind::Condition(_) => "condition",
            NodeKind::Action(_) => "action",
            NodeKind::Webhook(_) => "webhook",
            NodeKind::Split(_) => "split",
            NodeKind::Notify(_) => "notify",
            NodeKind::Goal(_) => "goal",
            NodeKind::CourseCycle(_) => "courseCycle",
            NodeKind::CourseEmail(_) => "courseEmail",
            NodeKind::PurchaseCheck(_) => "purchaseCheck",
            NodeKind::CycleLoop => "cycleLoop",
            NodeKind::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailMode {
    Template,
    #[default]
    Custom,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailNode {
    #[serde(default)]
    pub mode: EmailMode,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Minutes,
    Hours,
    #[default]
    Days,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayNode {
    pub delay_value: u32,
    #[serde(default)]
    pub delay_unit: DelayUnit,
}

impl DelayNode {
    pub fn duration(&self) -> Duration {
        let value = i64::from(self.delay_value);
        match self.delay_unit {
            DelayUnit::Minutes => Duration::minutes(value),
            DelayUnit::Hours => Duration::hours(value),
            DelayUnit::Days => Duration::days(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagAction {
    AddTag,
    RemoveTag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionNode {
    pub action_type: TagAction,
    #[serde(default)]
    pub tag_id: Option<String>,
    /// Tag referenced by name; add_tag creates it when missing.
    #[serde(default)]
    pub tag_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookNode {
    pub url: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitNode {
    #[serde(default = "default_split_percentage")]
    pub split_percentage: f64,
}

fn default_split_percentage() -> f64 {
    50.0
}

impl Default for SplitNode {
    fn default() -> Self {
        Self {
            split_percentage: default_split_percentage(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyNode {
    #[serde(default = "default_notify_method")]
    pub method: NotifyMethod,
    #[serde(default = "default_notify_message")]
    pub message: String,
}

fn default_notify_method() -> NotifyMethod {
    NotifyMethod::Email
}

fn default_notify_message() -> String {
    "Workflow notification triggered".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalNode {
    pub goal_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub next_workflow_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseCycleNode {
    pub config_id: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseEmailNode {
    /// Restricts the node to one phase; `None` walks nurture then pitch.
    #[serde(default)]
    pub phase: Option<CyclePhase>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseCheckNode {
    #[serde(default)]
    pub purchase_tag_prefix: Option<String>,
}

/// A directed connection, optionally tagged with the output handle it leaves from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub source_handle: Option<String>,
    #[serde(default)]
    pub target_handle: Option<String>,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
        }
    }

    pub fn from_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }
}

/// Immutable snapshot of a workflow graph at one version.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    pub workflow_id: Uuid,
    pub version: u32,
    pub name: String,
    pub trigger: Trigger,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    index: HashMap<String, usize>,
}

impl WorkflowGraph {
    pub fn from_definition(workflow: &WorkflowDefinition) -> Self {
        let index = workflow
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        Self {
            workflow_id: workflow.id,
            version: workflow.graph_version,
            name: workflow.name.clone(),
            trigger: workflow.trigger.clone(),
            nodes: workflow.nodes.clone(),
            edges: workflow.edges.clone(),
            index,
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn trigger_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| matches!(n.kind, NodeKind::Trigger))
    }

    pub fn outgoing<'a, 'b>(
        &'a self,
        node_id: &'b str,
    ) -> impl Iterator<Item = &'a Edge> + use<'a, 'b> {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// Edge leaving `node_id` through `handle`; falls back to the first
    /// outgoing edge when no edge carries that handle.
    pub fn follow(&self, node_id: &str, handle: Option<&str>) -> Option<&Edge> {
        if let Some(handle) = handle {
            if let Some(edge) = self
                .outgoing(node_id)
                .find(|e| e.source_handle.as_deref() == Some(handle))
            {
                return Some(edge);
            }
        }
        self.outgoing(node_id).next()
    }

    /// Edge leaving `node_id` through exactly `handle`, with no fallback.
    pub fn follow_exact(&self, node_id: &str, handle: &str) -> Option<&Edge> {
        self.outgoing(node_id)
            .find(|e| e.source_handle.as_deref() == Some(handle))
    }
}

/// Runtime status of an execution. Ordered: pending → running → terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn rank(&self) -> u8 {
        match self {
            ExecutionStatus::Pending => 0,
            ExecutionStatus::Running => 1,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitPath {
    A,
    B,
}

impl SplitPath {
    pub fn handle(&self) -> &'static str {
        match self {
            SplitPath::A => "a",
            SplitPath::B => "b",
        }
    }
}

/// Variables accumulated on an execution while it walks the graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionVars {
    #[serde(default)]
    pub trigger_type: String,
    #[serde(default)]
    pub enrolled_manually: bool,
    /// Sticky split branch per split node.
    #[serde(default)]
    pub split_paths: BTreeMap<String, SplitPath>,
    /// Sticky A/B variant per email node.
    #[serde(default)]
    pub ab_variants: BTreeMap<String, String>,
    /// Completed ticks per node; part of the side-effect idempotency key.
    #[serde(default)]
    pub node_visits: BTreeMap<String, u32>,
    #[serde(default)]
    pub goals_reached: Vec<String>,
    #[serde(default)]
    pub course_cycle: Option<CourseCycleState>,
    #[serde(default)]
    pub engagement_wait: Option<EngagementWait>,
    #[serde(default)]
    pub retry_attempts: u32,
    /// Execution whose goal node chained this one.
    #[serde(default)]
    pub chained_from: Option<Uuid>,
}

impl ExecutionVars {
    pub fn visits(&self, node_id: &str) -> u32 {
        self.node_visits.get(node_id).copied().unwrap_or(0)
    }
}

/// The per-contact runtime instance walking a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub graph_version: u32,
    pub contact_id: String,
    pub contact_email: String,
    pub status: ExecutionStatus,
    pub current_node_id: String,
    pub scheduled_for: DateTime<Utc>,
    pub vars: ExecutionVars,
    pub error_message: Option<String>,
    pub enrolled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency version; bumped by every claim, commit and cancel.
    pub version: u64,
    pub lease_until: Option<DateTime<Utc>>,
    pub step_history: Vec<StepExecution>,
}

/// Record of a tick that has been executed for an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecution {
    pub node_id: String,
    pub node_type: String,
    pub executed_at: DateTime<Utc>,
    pub outcome: String,
}

/// Email engagement reported for one execution by tracking callbacks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Engagement {
    pub delivered_nodes: BTreeSet<String>,
    pub opened_nodes: BTreeSet<String>,
    pub clicked_nodes: BTreeSet<String>,
    pub clicked_links: Vec<LinkClick>,
    /// Opens plus clicks, used by engagement-timed course cycles.
    pub actions: u32,
}

/// A tracked click on a link inside one email node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkClick {
    pub node_id: String,
    pub url: String,
}

/// Aggregate statistics for a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStats {
    pub total_enrolled: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub goals_reached: u64,
    pub emails_sent: u64,
    pub last_executed: Option<DateTime<Utc>>,
}

/// Outcome of a bulk enrollment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentReport {
    pub enrolled: u64,
    pub skipped: u64,
    pub errors: Vec<String>,
    pub execution_ids: Vec<Uuid>,
}

/// Result of enrolling a single contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum EnrollOutcome {
    Enrolled { execution_id: Uuid },
    AlreadyEnrolled { execution_id: Uuid },
}

impl EnrollOutcome {
    pub fn execution_id(&self) -> Uuid {
        match self {
            EnrollOutcome::Enrolled { execution_id }
            | EnrollOutcome::AlreadyEnrolled { execution_id } => *execution_id,
        }
    }
}

/// Operator view of one contact sitting at a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactAtNode {
    pub execution_id: Uuid,
    pub contact_id: String,
    pub email: String,
    pub status: ExecutionStatus,
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Per-status execution counts for one workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub pending: u64,
    pub pending_overdue: u64,
    pub scheduled_future: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}
