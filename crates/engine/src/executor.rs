//! Advances one execution by exactly one node per tick.
//!
//! A tick claims the execution (lease + version bump), reads the graph
//! snapshot the execution is pinned to, runs the current node, and commits
//! the result with an optimistic version check. Node side effects are keyed
//! by `(execution_id, node_id, visit)` in the effect ledger, so a tick that
//! is re-run after a crash between effect and commit does not repeat them.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use nurture_core::collaborators::Collaborators;
use nurture_core::config::{AppConfig, RetryConfig};
use nurture_core::event_bus::{make_event, EventSink};
use nurture_core::tracking::TrackingToken;
use nurture_core::types::{Contact, EventType, OutboundEmail, PurchaseSet, TeamNotification};
use nurture_core::{CollaboratorError, EngineError, EngineResult};

use crate::ab_test::ABTestController;
use crate::assignment::stable_percent;
use crate::course_cycle::{
    CourseCycleConfig, CourseCycleController, CourseCycleState, CyclePhase, CycleStart,
    EmailFollowUp, LoopDecision, NotPurchased, DEFAULT_PURCHASE_TAG_PREFIX,
};
use crate::enrollment::EnrollmentManager;
use crate::evaluator::{Condition, ConditionEvaluator, ContactSnapshot};
use crate::state_machine::ExecutionStateMachine;
use crate::store::{release_retired, EffectKey, EffectLedger, ExecutionStore, WorkflowStore};
use crate::types::{
    ActionNode, CourseEmailNode, EmailMode, EmailNode, Execution, ExecutionStatus, GoalNode, Node,
    NodeKind, NotifyNode, PurchaseCheckNode, SplitNode, SplitPath, StepExecution, TagAction,
    WebhookNode, WorkflowGraph,
};

/// Step history entries kept per execution; course cycles never end.
const HISTORY_LIMIT: usize = 200;

/// What the current node decided.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    /// Move to `next`, due at `at` (plus the delay when `next` is a delay node).
    Advance { next: String, at: DateTime<Utc> },
    /// Stay on the current node until `until`.
    Stay { until: DateTime<Utc> },
    /// Nothing happened; look again on the next sweep.
    Recheck,
    /// A transient collaborator failure; run the node again at `at`.
    Retry { at: DateTime<Utc>, reason: String },
    Complete,
    Fail(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not runnable (leased, cancelled, or not yet due).
    Skipped,
    Advanced,
    Waiting,
    Retrying,
    Completed,
    Failed,
    /// Lost the commit race to a concurrent writer.
    Discarded,
}

/// Timing knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub lease: Duration,
    pub retry: RetryConfig,
    pub webhook_timeout: StdDuration,
}

impl ExecutorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            lease: Duration::seconds(config.scheduler.lease_secs as i64),
            retry: config.retry.clone(),
            webhook_timeout: StdDuration::from_millis(config.webhook.timeout_ms),
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

pub struct StepExecutor {
    workflows: Arc<WorkflowStore>,
    executions: Arc<ExecutionStore>,
    ledger: Arc<EffectLedger>,
    ab_tests: Arc<ABTestController>,
    course_cycles: Arc<CourseCycleController>,
    enrollment: Arc<EnrollmentManager>,
    collaborators: Collaborators,
    evaluator: ConditionEvaluator,
    state_machine: ExecutionStateMachine,
    settings: ExecutorSettings,
    event_sink: Arc<dyn EventSink>,
}

impl StepExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workflows: Arc<WorkflowStore>,
        executions: Arc<ExecutionStore>,
        ledger: Arc<EffectLedger>,
        ab_tests: Arc<ABTestController>,
        course_cycles: Arc<CourseCycleController>,
        enrollment: Arc<EnrollmentManager>,
        collaborators: Collaborators,
        settings: ExecutorSettings,
        event_sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            workflows,
            executions,
            ledger,
            ab_tests,
            course_cycles,
            enrollment,
            collaborators,
            evaluator: ConditionEvaluator::new(),
            state_machine: ExecutionStateMachine::new(),
            settings,
            event_sink,
        }
    }

    /// Runs one tick for `execution_id` as of `now`.
    pub async fn tick(&self, execution_id: Uuid, now: DateTime<Utc>) -> EngineResult<TickOutcome> {
        let Some(mut execution) = self.executions.claim(execution_id, now, self.settings.lease) else {
            return Ok(TickOutcome::Skipped);
        };
        let claimed_version = execution.version;
        execution.updated_at = now;
        if execution.status == ExecutionStatus::Pending {
            self.state_machine
                .transition(&mut execution, ExecutionStatus::Running)?;
        }

        let node_id = execution.current_node_id.clone();
        let graph = self
            .workflows
            .snapshot(execution.workflow_id, execution.graph_version);
        let (result, node_type) = match graph.as_deref() {
            None => (
                StepResult::Fail(format!(
                    "Workflow {} has no graph version {}",
                    execution.workflow_id, execution.graph_version
                )),
                "unknown",
            ),
            Some(graph) => match graph.node(&node_id) {
                None => (
                    StepResult::Fail(format!("Node {node_id} not found in workflow graph")),
                    "unknown",
                ),
                Some(node) => (
                    self.step(graph, node, &mut execution, now).await,
                    node.type_name(),
                ),
            },
        };

        debug!(%execution_id, node_id = %node_id, node_type, result = ?result, "Step evaluated");
        metrics::counter!("nurture.ticks", "node_type" => node_type).increment(1);

        let outcome = self.apply(graph.as_deref(), &mut execution, &node_id, node_type, result, now)?;

        match self.executions.commit(execution.clone(), claimed_version) {
            Ok(()) => {}
            Err(EngineError::Conflict(_)) => {
                info!(%execution_id, node_id = %node_id, "Tick discarded after concurrent update");
                metrics::counter!("nurture.ticks_discarded").increment(1);
                // A cancel that won the race already released the execution;
                // effects this tick recorded afterwards go too.
                if self
                    .executions
                    .get(execution_id)
                    .is_some_and(|current| current.status.is_terminal())
                {
                    self.ledger.forget_execution(execution_id);
                }
                return Ok(TickOutcome::Discarded);
            }
            Err(err) => return Err(err),
        }

        if execution.status.is_terminal() {
            release_retired(&self.workflows, &self.ledger, &execution);
        }

        self.after_commit(&execution, &node_id, outcome, now);
        Ok(outcome)
    }

    fn apply(
        &self,
        graph: Option<&WorkflowGraph>,
        execution: &mut Execution,
        node_id: &str,
        node_type: &str,
        result: StepResult,
        now: DateTime<Utc>,
    ) -> EngineResult<TickOutcome> {
        let (outcome, label) = match result {
            StepResult::Advance { next, at } => {
                let arrival = match graph.and_then(|g| g.node(&next)).map(|n| &n.kind) {
                    Some(NodeKind::Delay(delay)) => at + delay.duration(),
                    Some(_) => at,
                    None => {
                        return self.apply(
                            graph,
                            execution,
                            node_id,
                            node_type,
                            StepResult::Fail(format!("Edge from {node_id} targets unknown node {next}")),
                            now,
                        );
                    }
                };
                execution.current_node_id = next;
                execution.scheduled_for = arrival;
                let outcome = if arrival > now {
                    TickOutcome::Waiting
                } else {
                    TickOutcome::Advanced
                };
                (outcome, "advanced")
            }
            StepResult::Stay { until } => {
                execution.scheduled_for = until;
                (TickOutcome::Waiting, "waiting")
            }
            StepResult::Recheck => {
                execution.scheduled_for = now;
                return Ok(TickOutcome::Waiting);
            }
            StepResult::Retry { at, reason } => {
                execution.vars.retry_attempts += 1;
                execution.scheduled_for = at;
                warn!(
                    execution_id = %execution.id,
                    node_id,
                    attempt = execution.vars.retry_attempts,
                    retry_at = %at,
                    reason = %reason,
                    "Transient failure, retry scheduled"
                );
                return Ok(TickOutcome::Retrying);
            }
            StepResult::Complete => {
                self.state_machine
                    .transition(execution, ExecutionStatus::Completed)?;
                (TickOutcome::Completed, "completed")
            }
            StepResult::Fail(message) => {
                execution.error_message = Some(message);
                self.state_machine
                    .transition(execution, ExecutionStatus::Failed)?;
                (TickOutcome::Failed, "failed")
            }
        };

        execution.vars.retry_attempts = 0;
        *execution.vars.node_visits.entry(node_id.to_string()).or_insert(0) += 1;
        execution.step_history.push(StepExecution {
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            executed_at: now,
            outcome: label.to_string(),
        });
        if execution.step_history.len() > HISTORY_LIMIT {
            let excess = execution.step_history.len() - HISTORY_LIMIT;
            execution.step_history.drain(..excess);
        }
        Ok(outcome)
    }

    fn after_commit(&self, execution: &Execution, node_id: &str, outcome: TickOutcome, now: DateTime<Utc>) {
        let workflow_id = execution.workflow_id;
        let event = |event_type| {
            make_event(
                event_type,
                workflow_id,
                Some(execution.id),
                Some(execution.contact_id.clone()),
            )
            .at_node(node_id.to_string())
        };

        self.workflows.update_stats(workflow_id, |s| {
            s.last_executed = Some(now);
            match outcome {
                TickOutcome::Completed => s.completed += 1,
                TickOutcome::Failed => s.failed += 1,
                _ => {}
            }
        });

        match outcome {
            TickOutcome::Completed => {
                info!(%workflow_id, execution_id = %execution.id, node_id, "Execution completed");
                metrics::counter!("nurture.executions_completed").increment(1);
                self.event_sink.emit(event(EventType::ExecutionCompleted));
            }
            TickOutcome::Failed => {
                let message = execution.error_message.clone().unwrap_or_default();
                error!(
                    %workflow_id,
                    execution_id = %execution.id,
                    node_id,
                    error = %message,
                    "Execution failed"
                );
                metrics::counter!("nurture.executions_failed").increment(1);
                self.event_sink
                    .emit(event(EventType::ExecutionFailed).with_detail(message));
            }
            TickOutcome::Retrying => {
                self.event_sink.emit(
                    event(EventType::ExecutionRetryScheduled)
                        .with_detail(execution.scheduled_for.to_rfc3339()),
                );
            }
            TickOutcome::Advanced | TickOutcome::Waiting => {
                self.event_sink.emit(event(EventType::ExecutionStepCompleted));
            }
            TickOutcome::Skipped | TickOutcome::Discarded => {}
        }
    }

    async fn step(
        &self,
        graph: &WorkflowGraph,
        node: &Node,
        execution: &mut Execution,
        now: DateTime<Utc>,
    ) -> StepResult {
        match &node.kind {
            NodeKind::Trigger | NodeKind::Delay(_) => follow(graph, &node.id, None, now),
            NodeKind::Email(email) => self.run_email(graph, node, email, execution, now).await,
            NodeKind::Condition(condition) => {
                self.run_condition(graph, node, condition, execution, now)
                    .await
            }
            NodeKind::Action(action) => self.run_action(graph, node, action, execution, now).await,
            NodeKind::Webhook(webhook) => {
                self.run_webhook(graph, node, webhook, execution, now)
                    .await
            }
            NodeKind::Split(split) => run_split(graph, node, split, execution, now),
            NodeKind::Notify(notify) => self.run_notify(graph, node, notify, execution, now).await,
            NodeKind::Goal(goal) => self.run_goal(graph, node, goal, execution, now).await,
            NodeKind::Stop => StepResult::Complete,
            NodeKind::CourseCycle(cycle) => {
                self.run_course_cycle(graph, node, cycle.config_id, execution, now)
                    .await
            }
            NodeKind::CourseEmail(course_email) => {
                self.run_course_email(graph, node, course_email, execution, now)
                    .await
            }
            NodeKind::PurchaseCheck(check) => {
                self.run_purchase_check(graph, node, check, execution, now)
                    .await
            }
            NodeKind::CycleLoop => self.run_cycle_loop(graph, node, execution, now).await,
        }
    }

    // ─── Messaging ──────────────────────────────────────────────────────

    async fn run_email(
        &self,
        graph: &WorkflowGraph,
        node: &Node,
        email: &EmailNode,
        execution: &mut Execution,
        now: DateTime<Utc>,
    ) -> StepResult {
        let workflow_id = execution.workflow_id;
        let sticky = execution
            .vars
            .ab_variants
            .get(&node.id)
            .and_then(|variant_id| self.ab_tests.variant(workflow_id, &node.id, variant_id));
        let variant = match sticky {
            Some(variant) => Some(variant),
            None => {
                let assigned = self.ab_tests.assign(workflow_id, &node.id, execution.id);
                if let Some(variant) = &assigned {
                    execution
                        .vars
                        .ab_variants
                        .insert(node.id.clone(), variant.id.clone());
                    self.event_sink.emit(
                        make_event(
                            EventType::VariantAssigned,
                            workflow_id,
                            Some(execution.id),
                            Some(execution.contact_id.clone()),
                        )
                        .at_node(node.id.clone())
                        .with_detail(variant.id.clone()),
                    );
                }
                assigned
            }
        };

        let key = EffectKey::new(execution.id, &node.id, execution.vars.visits(&node.id));
        if let Some(message_id) = self.ledger.get(&key) {
            debug!(execution_id = %execution.id, node_id = %node.id, %message_id, "Email already sent for this visit");
            return follow(graph, &node.id, None, now);
        }

        let (subject, body) = match &variant {
            Some(v) => (v.subject.clone(), v.body.clone().or_else(|| email.body.clone())),
            None => (email.subject.clone().unwrap_or_default(), email.body.clone()),
        };
        let template_id = match email.mode {
            EmailMode::Template => email.template_id.clone(),
            EmailMode::Custom => None,
        };
        let token = TrackingToken::new(
            execution.id,
            node.id.clone(),
            variant.as_ref().map(|v| v.id.clone()),
        );
        let outbound = OutboundEmail {
            recipient: execution.contact_email.clone(),
            subject,
            body: body.unwrap_or_default(),
            template_id,
            tracking_token: token.encode(),
        };

        match self.collaborators.mailer.send(&outbound).await {
            Ok(message_id) => {
                self.ledger.record(key, message_id.clone());
                if let Some(variant) = &variant {
                    self.ab_tests.record_send(workflow_id, &node.id, &variant.id);
                }
                self.note_email_sent(execution, &node.id, &message_id);
                follow(graph, &node.id, None, now)
            }
            Err(err) => self.collaborator_failure(execution, now, "Email send failed", err),
        }
    }

    fn note_email_sent(&self, execution: &Execution, node_id: &str, message_id: &str) {
        self.workflows
            .update_stats(execution.workflow_id, |s| s.emails_sent += 1);
        metrics::counter!("nurture.emails_sent").increment(1);
        info!(
            execution_id = %execution.id,
            node_id,
            recipient = %execution.contact_email,
            %message_id,
            "Email sent"
        );
        self.event_sink.emit(
            make_event(
                EventType::EmailSent,
                execution.workflow_id,
                Some(execution.id),
                Some(execution.contact_id.clone()),
            )
            .at_node(node_id.to_string())
            .with_detail(message_id.to_string()),
        );
    }

    // ─── Branching ──────────────────────────────────────────────────────

    async fn run_condition(
        &self,
        graph: &WorkflowGraph,
        node: &Node,
        condition: &Condition,
        execution: &mut Execution,
        now: DateTime<Utc>,
    ) -> StepResult {
        let contact = match self.load_contact(execution, now).await {
            Ok(contact) => contact,
            Err(result) => return result,
        };
        let purchases = if matches!(condition, Condition::HasPurchased { .. }) {
            match self.collaborators.purchases.purchases(&contact).await {
                Ok(purchases) => purchases,
                Err(err) => return self.collaborator_failure(execution, now, "Purchase lookup failed", err),
            }
        } else {
            PurchaseSet::default()
        };

        let snapshot = ContactSnapshot {
            tag_ids: contact.tag_ids,
            purchases,
            engagement: self.executions.engagement(execution.id),
            enrolled_at: execution.enrolled_at,
            now,
        };
        let matched = self.evaluator.resolve(condition, &snapshot);
        debug!(execution_id = %execution.id, node_id = %node.id, matched, "Condition evaluated");
        follow(graph, &node.id, Some(if matched { "yes" } else { "no" }), now)
    }

    // ─── Side effects ───────────────────────────────────────────────────

    async fn run_action(
        &self,
        graph: &WorkflowGraph,
        node: &Node,
        action: &ActionNode,
        execution: &mut Execution,
        now: DateTime<Utc>,
    ) -> StepResult {
        let key = EffectKey::new(execution.id, &node.id, execution.vars.visits(&node.id));
        if self.ledger.get(&key).is_some() {
            return follow(graph, &node.id, None, now);
        }

        let tag_id = match self.resolve_tag(action).await {
            Ok(Some(tag_id)) => tag_id,
            Ok(None) => {
                let name = action.tag_name.as_deref().unwrap_or_default();
                return StepResult::Fail(format!("Tag \"{name}\" not found"));
            }
            Err(err) => return self.collaborator_failure(execution, now, "Tag lookup failed", err),
        };

        let contacts = &self.collaborators.contacts;
        let result = match action.action_type {
            TagAction::AddTag => contacts.add_tag(&execution.contact_id, &tag_id).await,
            TagAction::RemoveTag => contacts.remove_tag(&execution.contact_id, &tag_id).await,
        };
        match result {
            Ok(()) => {
                info!(
                    execution_id = %execution.id,
                    node_id = %node.id,
                    action = ?action.action_type,
                    tag_id = %tag_id,
                    "Tag action applied"
                );
                self.ledger.record(key, tag_id);
                follow(graph, &node.id, None, now)
            }
            Err(err) => self.collaborator_failure(execution, now, "Tag action failed", err),
        }
    }

    async fn resolve_tag(&self, action: &ActionNode) -> Result<Option<String>, CollaboratorError> {
        if let Some(tag_id) = action.tag_id.as_deref().filter(|t| !t.is_empty()) {
            return Ok(Some(tag_id.to_string()));
        }
        let Some(name) = action.tag_name.as_deref().filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        let contacts = &self.collaborators.contacts;
        match (contacts.find_tag_by_name(name).await?, action.action_type) {
            (Some(tag_id), _) => Ok(Some(tag_id)),
            (None, TagAction::AddTag) => contacts.create_tag(name).await.map(Some),
            (None, TagAction::RemoveTag) => Ok(None),
        }
    }

    async fn run_webhook(
        &self,
        graph: &WorkflowGraph,
        node: &Node,
        webhook: &WebhookNode,
        execution: &mut Execution,
        now: DateTime<Utc>,
    ) -> StepResult {
        let key = EffectKey::new(execution.id, &node.id, execution.vars.visits(&node.id));
        if self.ledger.get(&key).is_some() {
            return follow(graph, &node.id, None, now);
        }

        let payload = webhook.payload.clone().unwrap_or_else(|| {
            json!({
                "event": "workflow_webhook",
                "workflowId": execution.workflow_id,
                "workflowName": graph.name,
                "executionId": execution.id,
                "contactId": execution.contact_id,
                "email": execution.contact_email,
                "nodeId": node.id,
                "timestamp": now.to_rfc3339(),
            })
        });

        let call = self.collaborators.webhooks.post(&webhook.url, &payload);
        let failure = match tokio::time::timeout(self.settings.webhook_timeout, call).await {
            Ok(Ok(status)) if (200..300).contains(&status) => {
                debug!(execution_id = %execution.id, url = %webhook.url, status, "Webhook delivered");
                None
            }
            Ok(Ok(status)) => Some(format!("HTTP {status}")),
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => Some(CollaboratorError::Timeout(self.settings.webhook_timeout.as_millis() as u64).to_string()),
        };

        match failure {
            None => self.ledger.record(key, "delivered"),
            Some(reason) => {
                // Tolerated: the execution moves on, the call is never repeated.
                warn!(
                    execution_id = %execution.id,
                    node_id = %node.id,
                    url = %webhook.url,
                    reason = %reason,
                    "Webhook call failed"
                );
                metrics::counter!("nurture.webhook_failures").increment(1);
                self.ledger.record(key, format!("failed: {reason}"));
                self.emit_failure(EventType::WebhookFailed, execution, &node.id, reason);
            }
        }
        follow(graph, &node.id, None, now)
    }

    async fn run_notify(
        &self,
        graph: &WorkflowGraph,
        node: &Node,
        notify: &NotifyNode,
        execution: &mut Execution,
        now: DateTime<Utc>,
    ) -> StepResult {
        let key = EffectKey::new(execution.id, &node.id, execution.vars.visits(&node.id));
        if self.ledger.get(&key).is_some() {
            return follow(graph, &node.id, None, now);
        }

        let contact_name = match self.collaborators.contacts.get(&execution.contact_id).await {
            Ok(Some(contact)) => contact.display_name(),
            _ => None,
        };
        let notification = TeamNotification {
            method: notify.method,
            message: notify.message.clone(),
            workflow_name: graph.name.clone(),
            contact_email: execution.contact_email.clone(),
            contact_name,
        };

        let call = self.collaborators.notifier.notify(&notification);
        let result = match tokio::time::timeout(self.settings.webhook_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::Timeout(self.settings.webhook_timeout.as_millis() as u64)),
        };
        match result {
            Ok(()) => {
                info!(execution_id = %execution.id, node_id = %node.id, method = ?notify.method, "Team notified");
                self.ledger.record(key, "sent");
            }
            Err(err) => {
                warn!(execution_id = %execution.id, node_id = %node.id, error = %err, "Team notification failed");
                metrics::counter!("nurture.notification_failures").increment(1);
                self.ledger.record(key, format!("failed: {err}"));
                self.emit_failure(EventType::NotificationFailed, execution, &node.id, err.to_string());
            }
        }
        follow(graph, &node.id, None, now)
    }

    async fn run_goal(
        &self,
        graph: &WorkflowGraph,
        node: &Node,
        goal: &GoalNode,
        execution: &mut Execution,
        now: DateTime<Utc>,
    ) -> StepResult {
        if !execution.vars.goals_reached.contains(&node.id) {
            execution.vars.goals_reached.push(node.id.clone());
        }

        let key = EffectKey::new(execution.id, &node.id, execution.vars.visits(&node.id));
        if self.ledger.get(&key).is_none() {
            self.workflows
                .update_stats(execution.workflow_id, |s| s.goals_reached += 1);
            metrics::counter!("nurture.goals_reached").increment(1);
            info!(
                execution_id = %execution.id,
                node_id = %node.id,
                goal_type = %goal.goal_type,
                "Goal reached"
            );
            self.event_sink.emit(
                make_event(
                    EventType::GoalReached,
                    execution.workflow_id,
                    Some(execution.id),
                    Some(execution.contact_id.clone()),
                )
                .at_node(node.id.clone())
                .with_detail(goal.goal_type.clone()),
            );

            let detail = match goal.next_workflow_id {
                Some(next) => match self.enrollment.enroll_chained(execution, next, now).await {
                    Ok(outcome) => outcome.execution_id().to_string(),
                    Err(err) => {
                        warn!(
                            execution_id = %execution.id,
                            next_workflow_id = %next,
                            error = %err,
                            "Chained enrollment failed"
                        );
                        format!("chain failed: {err}")
                    }
                },
                None => "reached".to_string(),
            };
            self.ledger.record(key, detail);
        }

        follow(graph, &node.id, None, now)
    }

    // ─── Course cycle ───────────────────────────────────────────────────

    async fn run_course_cycle(
        &self,
        graph: &WorkflowGraph,
        node: &Node,
        config_id: Uuid,
        execution: &mut Execution,
        now: DateTime<Utc>,
    ) -> StepResult {
        let Some(config) = self.course_cycles.config(config_id) else {
            return StepResult::Fail(format!("Course cycle config {config_id} not found"));
        };
        let purchases = match self.load_purchases(execution, now).await {
            Ok(purchases) => purchases,
            Err(result) => return result,
        };

        match self
            .course_cycles
            .start(&config, execution.vars.course_cycle.as_ref(), &purchases.course_ids)
        {
            CycleStart::Started(state) => {
                info!(
                    execution_id = %execution.id,
                    config_id = %config_id,
                    course_index = state.current_course_index,
                    cycle = state.cycle_count,
                    "Course cycle started"
                );
                execution.vars.course_cycle = Some(state);
                execution.vars.engagement_wait = None;
                follow(graph, &node.id, None, now)
            }
            CycleStart::AllPurchased => {
                info!(execution_id = %execution.id, config_id = %config_id, "Every course already purchased");
                StepResult::Complete
            }
        }
    }

    async fn run_course_email(
        &self,
        graph: &WorkflowGraph,
        node: &Node,
        course_email: &CourseEmailNode,
        execution: &mut Execution,
        now: DateTime<Utc>,
    ) -> StepResult {
        let (mut state, config) = match self.cycle_context(execution) {
            Ok(context) => context,
            Err(result) => return result,
        };
        let Some(timing) = config
            .course_at(state.current_course_index)
            .and_then(|course_id| config.timing(course_id))
            .cloned()
        else {
            return StepResult::Fail(format!(
                "No timing for course index {} in cycle {}",
                state.current_course_index, config.id
            ));
        };
        let actions = self.executions.engagement(execution.id).actions;

        if let Some(wait) = execution
            .vars
            .engagement_wait
            .clone()
            .filter(|w| w.node_id == node.id)
        {
            if !wait.is_resolved(actions, now) {
                return StepResult::Recheck;
            }
            debug!(execution_id = %execution.id, node_id = %node.id, actions, "Engagement wait resolved");
            execution.vars.engagement_wait = None;
            if wait.exit_after {
                return follow(graph, &node.id, None, now);
            }
        }

        match (course_email.phase, state.phase) {
            (Some(CyclePhase::Pitch), CyclePhase::Nurture) => {
                state.phase = CyclePhase::Pitch;
                state.email_index = 0;
            }
            (Some(CyclePhase::Nurture), CyclePhase::Pitch) => {
                return follow(graph, &node.id, None, now);
            }
            _ => {}
        }

        let key = EffectKey::new(execution.id, &node.id, execution.vars.visits(&node.id));
        if self.ledger.get(&key).is_none() {
            match self.course_cycles.content_for(&state).await {
                Some(email) => {
                    let token = TrackingToken::new(execution.id, node.id.clone(), None)
                        .with_cycle_email(email.id);
                    let outbound = OutboundEmail {
                        recipient: execution.contact_email.clone(),
                        subject: email.subject.clone(),
                        body: email.body.clone(),
                        template_id: None,
                        tracking_token: token.encode(),
                    };
                    match self.collaborators.mailer.send(&outbound).await {
                        Ok(message_id) => {
                            self.ledger.record(key, message_id.clone());
                            self.course_cycles.record_sent(email.id);
                            self.note_email_sent(execution, &node.id, &message_id);
                        }
                        Err(err) => {
                            return self.collaborator_failure(execution, now, "Course email send failed", err);
                        }
                    }
                }
                None => {
                    warn!(
                        execution_id = %execution.id,
                        node_id = %node.id,
                        phase = state.phase.as_str(),
                        email_index = state.email_index,
                        "No content for course email, skipping send"
                    );
                    self.ledger.record(key, "skipped");
                }
            }
        }

        match self
            .course_cycles
            .after_send(&timing, &state, &node.id, course_email.phase, actions, now)
        {
            EmailFollowUp::SendNextAt { state, at } => {
                execution.vars.course_cycle = Some(state);
                StepResult::Stay { until: at }
            }
            EmailFollowUp::AwaitEngagement { state, wait } => {
                execution.vars.course_cycle = Some(state);
                execution.vars.engagement_wait = Some(wait);
                StepResult::Stay { until: now }
            }
            EmailFollowUp::Leave { state, at } => {
                execution.vars.course_cycle = Some(state);
                follow(graph, &node.id, None, at)
            }
        }
    }

    async fn run_purchase_check(
        &self,
        graph: &WorkflowGraph,
        node: &Node,
        check: &PurchaseCheckNode,
        execution: &mut Execution,
        now: DateTime<Utc>,
    ) -> StepResult {
        let (mut state, config) = match self.cycle_context(execution) {
            Ok(context) => context,
            Err(result) => return result,
        };
        let Some(course_id) = config.course_at(state.current_course_index).map(str::to_string) else {
            return StepResult::Fail(format!(
                "Course index {} out of range for cycle {}",
                state.current_course_index, config.id
            ));
        };
        let purchases = match self.load_purchases(execution, now).await {
            Ok(purchases) => purchases,
            Err(result) => return result,
        };

        let purchased = purchases.course_ids.contains(&course_id)
            || state.purchased_course_ids.contains(&course_id);
        if purchased {
            let key = EffectKey::new(execution.id, &node.id, execution.vars.visits(&node.id));
            if self.ledger.get(&key).is_none() {
                let prefix = check
                    .purchase_tag_prefix
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .unwrap_or(DEFAULT_PURCHASE_TAG_PREFIX);
                let tag_name = format!("{prefix}{course_id}");
                match self.tag_by_name(&execution.contact_id, &tag_name).await {
                    Ok(tag_id) => self.ledger.record(key, tag_id),
                    Err(err) => {
                        warn!(
                            execution_id = %execution.id,
                            tag = %tag_name,
                            error = %err,
                            "Could not tag purchaser"
                        );
                        self.ledger.record(key, format!("failed: {err}"));
                    }
                }
            }
            info!(execution_id = %execution.id, course_id = %course_id, "Course purchased");
            state.purchased_course_ids.insert(course_id.clone());
            execution.vars.course_cycle = Some(state);
            self.emit_course_event(EventType::CourseAdvanced, execution, &node.id, format!("purchased:{course_id}"));
            return follow(graph, &node.id, Some("purchased"), now);
        }

        match self.course_cycles.on_not_purchased(&config, &state) {
            NotPurchased::Repitch(next) => {
                info!(
                    execution_id = %execution.id,
                    course_id = %course_id,
                    repitch = next.repitch_count,
                    "Course not purchased, repitching"
                );
                execution.vars.course_cycle = Some(next);
                follow(graph, &node.id, Some("not_purchased"), now)
            }
            NotPurchased::Advance => {
                debug!(execution_id = %execution.id, course_id = %course_id, "Course not purchased, advancing");
                match graph.follow_exact(&node.id, "advance") {
                    Some(edge) => StepResult::Advance {
                        next: edge.target.clone(),
                        at: now,
                    },
                    None => follow(graph, &node.id, Some("purchased"), now),
                }
            }
        }
    }

    async fn run_cycle_loop(
        &self,
        graph: &WorkflowGraph,
        node: &Node,
        execution: &mut Execution,
        now: DateTime<Utc>,
    ) -> StepResult {
        let (mut state, config) = match self.cycle_context(execution) {
            Ok(context) => context,
            Err(result) => return result,
        };
        // Purchases made outside a purchase check still skip their course.
        let purchases = match self.load_purchases(execution, now).await {
            Ok(purchases) => purchases,
            Err(result) => return result,
        };
        state.purchased_course_ids.extend(
            config
                .course_ids
                .iter()
                .filter(|c| purchases.course_ids.contains(*c))
                .cloned(),
        );

        match self.course_cycles.next_course(&config, &state) {
            LoopDecision::Next(next) => {
                let course_id = config
                    .course_at(next.current_course_index)
                    .unwrap_or_default()
                    .to_string();
                execution.vars.course_cycle = Some(next);
                self.emit_course_event(EventType::CourseAdvanced, execution, &node.id, course_id);
                follow(graph, &node.id, Some("next"), now)
            }
            LoopDecision::Looped(next) => {
                info!(
                    execution_id = %execution.id,
                    cycle = next.cycle_count,
                    content_set = ?next.content_set,
                    "Course playlist looped"
                );
                let detail = format!("cycle {}", next.cycle_count);
                execution.vars.course_cycle = Some(next);
                self.emit_course_event(EventType::CycleLooped, execution, &node.id, detail);
                follow(graph, &node.id, Some("next"), now)
            }
            LoopDecision::Finished => {
                execution.vars.course_cycle = Some(state);
                match graph.follow_exact(&node.id, "complete") {
                    Some(edge) => StepResult::Advance {
                        next: edge.target.clone(),
                        at: now,
                    },
                    None => StepResult::Complete,
                }
            }
            LoopDecision::AllPurchased => {
                info!(execution_id = %execution.id, "Every course in the playlist purchased");
                execution.vars.course_cycle = Some(state);
                StepResult::Complete
            }
        }
    }

    fn cycle_context(
        &self,
        execution: &Execution,
    ) -> Result<(CourseCycleState, Arc<CourseCycleConfig>), StepResult> {
        let state = execution.vars.course_cycle.clone().ok_or_else(|| {
            StepResult::Fail("Course node reached without an active course cycle".into())
        })?;
        let config = self.course_cycles.config(state.config_id).ok_or_else(|| {
            StepResult::Fail(format!("Course cycle config {} not found", state.config_id))
        })?;
        Ok((state, config))
    }

    // ─── Collaborator helpers ───────────────────────────────────────────

    async fn load_contact(&self, execution: &Execution, now: DateTime<Utc>) -> Result<Contact, StepResult> {
        match self.collaborators.contacts.get(&execution.contact_id).await {
            Ok(Some(contact)) => Ok(contact),
            Ok(None) => Err(StepResult::Fail(format!("Contact {} not found", execution.contact_id))),
            Err(err) => Err(self.collaborator_failure(execution, now, "Contact lookup failed", err)),
        }
    }

    async fn load_purchases(&self, execution: &Execution, now: DateTime<Utc>) -> Result<PurchaseSet, StepResult> {
        let contact = self.load_contact(execution, now).await?;
        self.collaborators
            .purchases
            .purchases(&contact)
            .await
            .map_err(|err| self.collaborator_failure(execution, now, "Purchase lookup failed", err))
    }

    async fn tag_by_name(&self, contact_id: &str, name: &str) -> Result<String, CollaboratorError> {
        let contacts = &self.collaborators.contacts;
        let tag_id = match contacts.find_tag_by_name(name).await? {
            Some(tag_id) => tag_id,
            None => contacts.create_tag(name).await?,
        };
        contacts.add_tag(contact_id, &tag_id).await?;
        Ok(tag_id)
    }

    /// Transient failures retry with backoff until attempts run out; the rest fail.
    fn collaborator_failure(
        &self,
        execution: &Execution,
        now: DateTime<Utc>,
        what: &str,
        err: CollaboratorError,
    ) -> StepResult {
        let attempt = execution.vars.retry_attempts + 1;
        let reason = format!("{what}: {err}");
        if err.is_transient() && attempt < self.settings.retry.max_attempts {
            let backoff = self.settings.retry.backoff_secs(attempt) as i64;
            StepResult::Retry {
                at: now + Duration::seconds(backoff),
                reason,
            }
        } else {
            StepResult::Fail(reason)
        }
    }

    fn emit_failure(&self, event_type: EventType, execution: &Execution, node_id: &str, reason: String) {
        self.event_sink.emit(
            make_event(
                event_type,
                execution.workflow_id,
                Some(execution.id),
                Some(execution.contact_id.clone()),
            )
            .at_node(node_id.to_string())
            .with_detail(reason),
        );
    }

    fn emit_course_event(&self, event_type: EventType, execution: &Execution, node_id: &str, detail: String) {
        self.event_sink.emit(
            make_event(
                event_type,
                execution.workflow_id,
                Some(execution.id),
                Some(execution.contact_id.clone()),
            )
            .at_node(node_id.to_string())
            .with_detail(detail),
        );
    }
}

fn follow(graph: &WorkflowGraph, node_id: &str, handle: Option<&str>, at: DateTime<Utc>) -> StepResult {
    match graph.follow(node_id, handle) {
        Some(edge) => StepResult::Advance {
            next: edge.target.clone(),
            at,
        },
        None => StepResult::Complete,
    }
}

fn run_split(
    graph: &WorkflowGraph,
    node: &Node,
    split: &SplitNode,
    execution: &mut Execution,
    now: DateTime<Utc>,
) -> StepResult {
    let execution_id = execution.id;
    let path = *execution
        .vars
        .split_paths
        .entry(node.id.clone())
        .or_insert_with(|| {
            if stable_percent(execution_id, &node.id) < split.split_percentage {
                SplitPath::A
            } else {
                SplitPath::B
            }
        });
    debug!(%execution_id, node_id = %node.id, path = path.handle(), "Split path chosen");
    follow(graph, &node.id, Some(path.handle()), now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Edge, WorkflowDefinition, Trigger};

    fn split_graph(percentage: f64) -> WorkflowGraph {
        let workflow = WorkflowDefinition::new(
            "Split",
            Trigger::Manual,
            vec![
                Node::new("t", NodeKind::Trigger),
                Node::new("s", NodeKind::Split(SplitNode { split_percentage: percentage })),
                Node::new("a", NodeKind::Stop),
                Node::new("b", NodeKind::Stop),
            ],
            vec![
                Edge::new("e1", "t", "s"),
                Edge::new("e2", "s", "a").from_handle("a"),
                Edge::new("e3", "s", "b").from_handle("b"),
            ],
        );
        WorkflowGraph::from_definition(&workflow)
    }

    fn execution() -> Execution {
        let now = Utc::now();
        Execution {
            id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            graph_version: 1,
            contact_id: "c1".into(),
            contact_email: "c1@example.com".into(),
            status: ExecutionStatus::Running,
            current_node_id: "s".into(),
            scheduled_for: now,
            vars: Default::default(),
            error_message: None,
            enrolled_at: now,
            started_at: Some(now),
            updated_at: now,
            completed_at: None,
            version: 1,
            lease_until: None,
            step_history: Vec::new(),
        }
    }

    #[test]
    fn test_split_is_sticky() {
        let graph = split_graph(50.0);
        let node = graph.node("s").unwrap().clone();
        let NodeKind::Split(split) = &node.kind else { unreachable!() };
        let now = Utc::now();
        let mut exec = execution();

        let first = run_split(&graph, &node, split, &mut exec, now);
        for _ in 0..10 {
            assert_eq!(run_split(&graph, &node, split, &mut exec, now), first);
        }
        // A fresh copy of the execution recomputes the same branch.
        let mut replay = exec.clone();
        replay.vars.split_paths.clear();
        assert_eq!(run_split(&graph, &node, split, &mut replay, now), first);
    }

    #[test]
    fn test_split_extremes() {
        let now = Utc::now();
        for (percentage, expected) in [(100.0, "a"), (0.0, "b")] {
            let graph = split_graph(percentage);
            let node = graph.node("s").unwrap().clone();
            let NodeKind::Split(split) = &node.kind else { unreachable!() };
            for _ in 0..20 {
                let mut exec = execution();
                let StepResult::Advance { next, .. } = run_split(&graph, &node, split, &mut exec, now) else {
                    panic!("split must advance");
                };
                assert_eq!(next, expected);
            }
        }
    }

    #[test]
    fn test_follow_without_edge_completes() {
        let graph = split_graph(50.0);
        assert_eq!(follow(&graph, "a", None, Utc::now()), StepResult::Complete);
    }
}
