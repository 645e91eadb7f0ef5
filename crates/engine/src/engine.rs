use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use nurture_core::collaborators::Collaborators;
use nurture_core::config::AppConfig;
use nurture_core::event_bus::{make_event, noop_sink, EventSink};
use nurture_core::tracking::TrackingToken;
use nurture_core::types::{ContactFilter, EmailEvent, EventType};
use nurture_core::{EngineError, EngineResult, ValidationError};

use crate::ab_test::{ABTestConfig, ABTestController, ABTestView, VariantEvent, VariantStat, WinnerSelection};
use crate::course_cycle::{CourseCycleConfig, CourseCycleController, CycleEmail};
use crate::enrollment::{EnrollSource, EnrollmentManager, TriggerEvent};
use crate::executor::{ExecutorSettings, StepExecutor, TickOutcome};
use crate::scheduler::{Scheduler, SweepReport};
use crate::store::{CancelOutcome, EffectLedger, ExecutionStore, WorkflowStore};
use crate::types::{
    ContactAtNode, Edge, EnrollOutcome, EnrollmentReport, Execution, ExecutionStatus,
    ExecutionSummary, LinkClick, Node, NodeKind, WorkflowDefinition, WorkflowStats,
};
use crate::validator::validate;

/// Entry point for everything outside the engine: workflow CRUD, enrollment,
/// tracking callbacks, A/B tests, course cycles, and the scheduler.
#[derive(Clone)]
pub struct WorkflowEngine {
    workflows: Arc<WorkflowStore>,
    executions: Arc<ExecutionStore>,
    ledger: Arc<EffectLedger>,
    ab_tests: Arc<ABTestController>,
    course_cycles: Arc<CourseCycleController>,
    enrollment: Arc<EnrollmentManager>,
    executor: Arc<StepExecutor>,
    scheduler: Arc<Scheduler>,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflows", &self.workflows.list().len())
            .field("queued", &self.executions.queued())
            .field("effects", &self.ledger.len())
            .finish()
    }
}

impl WorkflowEngine {
    pub fn new(config: &AppConfig, collaborators: Collaborators) -> Self {
        Self::with_event_sink(config, collaborators, noop_sink())
    }

    /// Builds the engine with every component reporting to `sink`.
    pub fn with_event_sink(config: &AppConfig, collaborators: Collaborators, sink: Arc<dyn EventSink>) -> Self {
        let workflows = Arc::new(WorkflowStore::new());
        let executions = Arc::new(ExecutionStore::new());
        let ledger = Arc::new(EffectLedger::new());
        let ab_tests = Arc::new(ABTestController::new().with_event_sink(Arc::clone(&sink)));
        let course_cycles = Arc::new(CourseCycleController::new(
            collaborators.content.clone(),
            StdDuration::from_millis(config.content.timeout_ms),
        ));
        let enrollment = Arc::new(EnrollmentManager::new(
            Arc::clone(&workflows),
            Arc::clone(&executions),
            Arc::clone(&ledger),
            Arc::clone(&collaborators.contacts),
            config.scheduler.enrollment_chunk_size,
            Arc::clone(&sink),
        ));
        let executor = Arc::new(StepExecutor::new(
            Arc::clone(&workflows),
            Arc::clone(&executions),
            Arc::clone(&ledger),
            Arc::clone(&ab_tests),
            Arc::clone(&course_cycles),
            Arc::clone(&enrollment),
            collaborators,
            ExecutorSettings::from_config(config),
            Arc::clone(&sink),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&executions),
            Arc::clone(&executor),
            &config.scheduler,
        ));

        Self {
            workflows,
            executions,
            ledger,
            ab_tests,
            course_cycles,
            enrollment,
            executor,
            scheduler,
            event_sink: sink,
        }
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        self.scheduler.sweep(now).await
    }

    pub async fn tick(&self, execution_id: Uuid, now: DateTime<Utc>) -> EngineResult<TickOutcome> {
        self.executor.tick(execution_id, now).await
    }

    // ─── Workflow CRUD ──────────────────────────────────────────────────

    /// Stores a new, inactive workflow.
    pub fn create_workflow(&self, mut workflow: WorkflowDefinition) -> EngineResult<WorkflowDefinition> {
        if self.workflows.get(workflow.id).is_some() {
            return Err(EngineError::Config(format!("Workflow {} already exists", workflow.id)));
        }
        workflow.is_active = false;
        workflow.graph_version = workflow.graph_version.max(1);
        workflow.stats = WorkflowStats::default();
        info!(workflow_id = %workflow.id, name = %workflow.name, trigger = workflow.trigger.type_name(), "Creating workflow");
        self.workflows.insert(workflow.clone());
        Ok(workflow)
    }

    pub fn get_workflow(&self, id: Uuid) -> Option<WorkflowDefinition> {
        self.workflows.get(id)
    }

    pub fn list_workflows(&self) -> Vec<WorkflowDefinition> {
        self.workflows.list()
    }

    /// Replaces the graph. Running executions stay on the version they enrolled on.
    pub fn update_graph(&self, id: Uuid, nodes: Vec<Node>, edges: Vec<Edge>) -> EngineResult<WorkflowDefinition> {
        let updated = self.workflows.update(id, |workflow| {
            if workflow.is_active {
                let errors = validate(&nodes, &edges);
                if !errors.is_empty() {
                    return Err(EngineError::Validation(errors));
                }
            }
            workflow.nodes = nodes;
            workflow.edges = edges;
            workflow.graph_version += 1;
            workflow.updated_at = Utc::now();
            Ok(())
        })?;
        info!(workflow_id = %id, graph_version = updated.graph_version, "Workflow graph updated");
        Ok(updated)
    }

    /// Runs the validator; activation refuses any workflow with errors.
    pub fn activate(&self, id: Uuid) -> EngineResult<WorkflowDefinition> {
        let updated = self.workflows.update(id, |workflow| {
            let errors = validate(&workflow.nodes, &workflow.edges);
            if !errors.is_empty() {
                return Err(EngineError::Validation(errors));
            }
            workflow.is_active = true;
            workflow.updated_at = Utc::now();
            Ok(())
        })?;
        info!(workflow_id = %id, name = %updated.name, "Workflow activated");
        self.event_sink
            .emit(make_event(EventType::WorkflowActivated, id, None, None));
        Ok(updated)
    }

    /// Stops new enrollments; executions already running carry on.
    pub fn deactivate(&self, id: Uuid) -> EngineResult<WorkflowDefinition> {
        let updated = self.workflows.update(id, |workflow| {
            workflow.is_active = false;
            workflow.updated_at = Utc::now();
            Ok(())
        })?;
        info!(workflow_id = %id, "Workflow deactivated");
        self.event_sink
            .emit(make_event(EventType::WorkflowDeactivated, id, None, None));
        Ok(updated)
    }

    /// Deletes a workflow, cancelling its active executions first.
    pub fn delete_workflow(&self, id: Uuid) -> EngineResult<usize> {
        if self.workflows.get(id).is_none() {
            return Err(EngineError::not_found("Workflow", id));
        }
        let now = Utc::now();
        let executions = self.executions.for_workflow(id);
        for execution in executions.iter().filter(|e| e.status.is_active()) {
            self.enrollment.cancel(execution.id, now)?;
        }
        let removed = self.executions.remove_workflow(id);
        let tests = self.ab_tests.delete_workflow(id);
        self.workflows.remove(id);
        info!(workflow_id = %id, executions = removed, ab_tests = tests, "Workflow deleted");
        self.event_sink
            .emit(make_event(EventType::WorkflowDeleted, id, None, None));
        Ok(removed)
    }

    /// Copies the graph and A/B tests into a new inactive workflow.
    pub fn duplicate_workflow(&self, id: Uuid) -> EngineResult<WorkflowDefinition> {
        let source = self
            .workflows
            .get(id)
            .ok_or_else(|| EngineError::not_found("Workflow", id))?;
        let mut copy = WorkflowDefinition::new(
            format!("{} (Copy)", source.name),
            source.trigger.clone(),
            source.nodes.clone(),
            source.edges.clone(),
        );
        copy.description = source.description.clone();
        let copy = self.create_workflow(copy)?;
        let tests = self.ab_tests.copy_workflow(id, copy.id)?;
        info!(workflow_id = %id, copy_id = %copy.id, ab_tests = tests, "Workflow duplicated");
        Ok(copy)
    }

    pub fn lint(&self, id: Uuid) -> EngineResult<Vec<ValidationError>> {
        let workflow = self
            .workflows
            .get(id)
            .ok_or_else(|| EngineError::not_found("Workflow", id))?;
        Ok(validate(&workflow.nodes, &workflow.edges))
    }

    // ─── Enrollment ─────────────────────────────────────────────────────

    pub async fn enroll(&self, workflow_id: Uuid, contact_id: &str) -> EngineResult<EnrollOutcome> {
        self.enrollment
            .enroll(workflow_id, contact_id, EnrollSource::Manual, Utc::now())
            .await
    }

    pub async fn enroll_bulk(&self, workflow_id: Uuid, contact_ids: &[String]) -> EngineResult<EnrollmentReport> {
        self.enrollment
            .enroll_bulk(workflow_id, contact_ids, Utc::now())
            .await
    }

    pub async fn enroll_all_by_filter(
        &self,
        workflow_id: Uuid,
        filter: ContactFilter,
    ) -> EngineResult<EnrollmentReport> {
        self.enrollment
            .enroll_all_by_filter(workflow_id, filter, Utc::now())
            .await
    }

    pub fn cancel(&self, execution_id: Uuid) -> EngineResult<CancelOutcome> {
        self.enrollment.cancel(execution_id, Utc::now())
    }

    pub fn cancel_for_contact(&self, contact_id: &str) -> EngineResult<usize> {
        self.enrollment.cancel_for_contact(contact_id, Utc::now())
    }

    pub async fn handle_trigger_event(&self, event: &TriggerEvent) -> EngineResult<EnrollmentReport> {
        self.enrollment
            .handle_trigger_event(event, Utc::now())
            .await
    }

    pub async fn reenroll_failed(&self, workflow_id: Uuid) -> EngineResult<EnrollmentReport> {
        self.enrollment.reenroll_failed(workflow_id, Utc::now()).await
    }

    // ─── Monitoring ─────────────────────────────────────────────────────

    pub fn get_execution(&self, execution_id: Uuid) -> Option<Execution> {
        self.executions.get(execution_id)
    }

    pub fn executions_for_workflow(&self, workflow_id: Uuid) -> Vec<Execution> {
        self.executions.for_workflow(workflow_id)
    }

    /// Active executions currently positioned at `node_id`.
    pub fn get_executions_at_node(&self, workflow_id: Uuid, node_id: &str) -> Vec<ContactAtNode> {
        self.executions
            .list(|e| e.workflow_id == workflow_id && e.current_node_id == node_id && e.status.is_active())
            .into_iter()
            .map(|e| ContactAtNode {
                execution_id: e.id,
                contact_id: e.contact_id,
                email: e.contact_email,
                status: e.status,
                scheduled_for: e.scheduled_for,
                started_at: e.started_at,
            })
            .collect()
    }

    /// Active execution count per node.
    pub fn node_execution_counts(&self, workflow_id: Uuid) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for execution in self
            .executions
            .list(|e| e.workflow_id == workflow_id && e.status.is_active())
        {
            *counts.entry(execution.current_node_id).or_insert(0) += 1;
        }
        counts
    }

    pub fn execution_summary(&self, workflow_id: Uuid) -> ExecutionSummary {
        let now = Utc::now();
        let mut summary = ExecutionSummary::default();
        for execution in self.executions.for_workflow(workflow_id) {
            match execution.status {
                ExecutionStatus::Pending => summary.pending += 1,
                ExecutionStatus::Running => summary.running += 1,
                ExecutionStatus::Completed => summary.completed += 1,
                ExecutionStatus::Failed => summary.failed += 1,
                ExecutionStatus::Cancelled => summary.cancelled += 1,
            }
            if execution.status.is_active() {
                if execution.scheduled_for <= now {
                    summary.pending_overdue += 1;
                } else {
                    summary.scheduled_future += 1;
                }
            }
        }
        summary
    }

    /// Graph versions still held for a workflow: the current one plus any a live execution is pinned to.
    pub fn graph_versions(&self, workflow_id: Uuid) -> Vec<u32> {
        self.workflows.snapshot_versions(workflow_id)
    }

    /// Side-effect records held for executions that have not retired yet.
    pub fn recorded_effects(&self) -> usize {
        self.ledger.len()
    }

    /// Makes an execution waiting at a delay node due at `now`.
    pub fn skip_delay(&self, execution_id: Uuid, now: DateTime<Utc>) -> EngineResult<Execution> {
        let execution = self
            .executions
            .get(execution_id)
            .ok_or_else(|| EngineError::not_found("Execution", execution_id))?;
        let at_delay = self
            .workflows
            .snapshot(execution.workflow_id, execution.graph_version)
            .and_then(|graph| {
                graph
                    .node(&execution.current_node_id)
                    .map(|n| matches!(n.kind, NodeKind::Delay(_)))
            })
            .unwrap_or(false);
        if !at_delay {
            return Err(EngineError::Execution(format!(
                "Execution {execution_id} is not waiting at a delay node"
            )));
        }
        info!(%execution_id, node_id = %execution.current_node_id, "Skipping delay");
        self.executions.reschedule(execution_id, now, now)
    }

    // ─── Tracking callbacks ─────────────────────────────────────────────

    /// Applies a delivery, open, or click callback carrying a tracking token.
    pub fn record_email_event(&self, token: &str, event: EmailEvent) -> EngineResult<()> {
        let token = TrackingToken::decode(token)
            .ok_or_else(|| EngineError::not_found("Tracking token", token))?;
        let execution = self
            .executions
            .get(token.execution_id)
            .ok_or_else(|| EngineError::not_found("Execution", token.execution_id))?;

        let node_id = token.node_id.clone();
        self.executions
            .record_engagement(execution.id, |engagement| match &event {
                EmailEvent::Delivered => {
                    engagement.delivered_nodes.insert(node_id);
                }
                EmailEvent::Opened => {
                    engagement.opened_nodes.insert(node_id);
                    engagement.actions += 1;
                }
                EmailEvent::Clicked { url } => {
                    if let Some(url) = url {
                        engagement.clicked_links.push(LinkClick {
                            node_id: node_id.clone(),
                            url: url.clone(),
                        });
                    }
                    engagement.clicked_nodes.insert(node_id);
                    engagement.actions += 1;
                }
            });

        if let Some(variant_id) = token.variant_id.as_deref() {
            let variant_event = match event {
                EmailEvent::Delivered => VariantEvent::Delivered,
                EmailEvent::Opened => VariantEvent::Opened,
                EmailEvent::Clicked { .. } => VariantEvent::Clicked,
            };
            self.ab_tests
                .record_event(execution.workflow_id, &token.node_id, variant_id, variant_event);
        }
        if let Some(email_id) = token.cycle_email_id {
            self.course_cycles.record_email_event(email_id, &event);
        }

        debug!(execution_id = %execution.id, node_id = %token.node_id, ?event, "Email event recorded");
        Ok(())
    }

    // ─── A/B tests ──────────────────────────────────────────────────────

    pub fn save_ab_test(&self, config: ABTestConfig) -> EngineResult<ABTestView> {
        if self.workflows.get(config.workflow_id).is_none() {
            return Err(EngineError::not_found("Workflow", config.workflow_id));
        }
        self.ab_tests.save(config)
    }

    pub fn get_ab_test(&self, workflow_id: Uuid, node_id: &str) -> Option<ABTestView> {
        self.ab_tests.get(workflow_id, node_id)
    }

    pub fn list_ab_tests(&self, workflow_id: Uuid) -> Vec<ABTestView> {
        self.ab_tests.list_for_workflow(workflow_id)
    }

    pub fn select_winner(&self, workflow_id: Uuid, node_id: &str, variant_id: &str) -> EngineResult<WinnerSelection> {
        self.ab_tests.select_winner(workflow_id, node_id, variant_id)
    }

    pub fn reset_stats(&self, workflow_id: Uuid, node_id: &str) -> EngineResult<()> {
        self.ab_tests.reset_stats(workflow_id, node_id)
    }

    pub fn variant_stats(&self, workflow_id: Uuid, node_id: &str) -> EngineResult<Vec<VariantStat>> {
        self.ab_tests.variant_stats(workflow_id, node_id)
    }

    pub fn delete_ab_test(&self, workflow_id: Uuid, node_id: &str) -> bool {
        self.ab_tests.delete(workflow_id, node_id)
    }

    // ─── Course cycles ──────────────────────────────────────────────────

    pub fn save_cycle_config(&self, config: CourseCycleConfig) -> EngineResult<CourseCycleConfig> {
        self.course_cycles.save_config(config)
    }

    pub fn get_cycle_config(&self, id: Uuid) -> Option<CourseCycleConfig> {
        self.course_cycles.config(id).map(|c| (*c).clone())
    }

    pub fn list_cycle_configs(&self) -> Vec<CourseCycleConfig> {
        self.course_cycles.list_configs()
    }

    pub fn delete_cycle_config(&self, id: Uuid) -> bool {
        self.course_cycles.delete_config(id)
    }

    pub fn save_cycle_email(&self, email: CycleEmail) -> EngineResult<CycleEmail> {
        self.course_cycles.save_cycle_email(email)
    }

    pub fn cycle_emails(&self, config_id: Uuid) -> Vec<CycleEmail> {
        self.course_cycles.cycle_emails(config_id)
    }
}
