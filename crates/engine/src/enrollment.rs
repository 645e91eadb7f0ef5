use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use nurture_core::collaborators::ContactStore;
use nurture_core::event_bus::{make_event, EventSink};
use nurture_core::types::{Contact, ContactFilter, EventType};
use nurture_core::{EngineError, EngineResult};

use crate::store::{release_retired, CancelOutcome, EffectLedger, ExecutionStore, WorkflowStore};
use crate::types::{
    EnrollOutcome, EnrollmentReport, Execution, ExecutionStatus, ExecutionVars, Trigger,
    WorkflowDefinition,
};

/// Something that happened to a contact which may start workflows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TriggerEvent {
    LeadSignup {
        contact_id: String,
    },
    ProductPurchase {
        contact_id: String,
        product_id: String,
    },
    TagAdded {
        contact_id: String,
        tag_id: String,
    },
    SegmentJoined {
        contact_id: String,
        segment_id: String,
    },
    CustomEvent {
        contact_id: String,
        event_name: String,
    },
}

impl TriggerEvent {
    pub fn contact_id(&self) -> &str {
        match self {
            TriggerEvent::LeadSignup { contact_id }
            | TriggerEvent::ProductPurchase { contact_id, .. }
            | TriggerEvent::TagAdded { contact_id, .. }
            | TriggerEvent::SegmentJoined { contact_id, .. }
            | TriggerEvent::CustomEvent { contact_id, .. } => contact_id,
        }
    }

    /// Whether a workflow with `trigger` starts on this event.
    pub fn matches(&self, trigger: &Trigger) -> bool {
        match (self, trigger) {
            (TriggerEvent::LeadSignup { .. }, Trigger::LeadSignup) => true,
            (TriggerEvent::ProductPurchase { product_id, .. }, Trigger::ProductPurchase { product_id: wanted }) => {
                wanted.as_ref().map_or(true, |w| w == product_id)
            }
            (TriggerEvent::TagAdded { tag_id, .. }, Trigger::TagAdded { tag_id: wanted }) => tag_id == wanted,
            (TriggerEvent::SegmentJoined { segment_id, .. }, Trigger::SegmentMember { segment_id: wanted }) => {
                segment_id == wanted
            }
            (TriggerEvent::CustomEvent { event_name, .. }, Trigger::CustomEvent { event_name: wanted }) => {
                event_name == wanted
            }
            _ => false,
        }
    }
}

/// How an execution came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollSource {
    Manual,
    Trigger,
    Chained(Uuid),
}

/// Creates executions for contacts, one active execution per (workflow, contact).
pub struct EnrollmentManager {
    workflows: Arc<WorkflowStore>,
    executions: Arc<ExecutionStore>,
    ledger: Arc<EffectLedger>,
    contacts: Arc<dyn ContactStore>,
    chunk_size: usize,
    event_sink: Arc<dyn EventSink>,
}

impl EnrollmentManager {
    pub fn new(
        workflows: Arc<WorkflowStore>,
        executions: Arc<ExecutionStore>,
        ledger: Arc<EffectLedger>,
        contacts: Arc<dyn ContactStore>,
        chunk_size: usize,
        event_sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            workflows,
            executions,
            ledger,
            contacts,
            chunk_size: chunk_size.max(1),
            event_sink,
        }
    }

    fn active_workflow(&self, workflow_id: Uuid) -> EngineResult<WorkflowDefinition> {
        let workflow = self
            .workflows
            .get(workflow_id)
            .ok_or_else(|| EngineError::not_found("Workflow", workflow_id))?;
        if !workflow.is_active {
            return Err(EngineError::Inactive(workflow_id));
        }
        Ok(workflow)
    }

    async fn contact(&self, contact_id: &str) -> EngineResult<Contact> {
        self.contacts
            .get(contact_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Contact", contact_id))
    }

    /// Enrolls one contact; an already-enrolled contact is reported, not duplicated.
    pub async fn enroll(
        &self,
        workflow_id: Uuid,
        contact_id: &str,
        source: EnrollSource,
        now: DateTime<Utc>,
    ) -> EngineResult<EnrollOutcome> {
        let workflow = self.active_workflow(workflow_id)?;
        let contact = self.contact(contact_id).await?;
        self.enroll_contact(&workflow, &contact, source, now)
    }

    fn enroll_contact(
        &self,
        workflow: &WorkflowDefinition,
        contact: &Contact,
        source: EnrollSource,
        now: DateTime<Utc>,
    ) -> EngineResult<EnrollOutcome> {
        // A concurrent graph edit may have dropped the version read earlier.
        let graph = self
            .workflows
            .pin(workflow.id, workflow.graph_version)
            .or_else(|| {
                let current = self.workflows.get(workflow.id)?;
                self.workflows.pin(current.id, current.graph_version)
            })
            .ok_or_else(|| EngineError::Execution(format!("Workflow {} has no graph snapshot", workflow.id)))?;
        let trigger = graph
            .trigger_node()
            .ok_or_else(|| EngineError::Execution(format!("Workflow {} has no trigger node", workflow.id)))?;

        let scheduled_for = match &workflow.trigger {
            Trigger::DateTime { scheduled_at } => *scheduled_at,
            _ => now,
        };
        let vars = ExecutionVars {
            trigger_type: workflow.trigger.type_name().to_string(),
            enrolled_manually: source == EnrollSource::Manual,
            chained_from: match source {
                EnrollSource::Chained(parent) => Some(parent),
                _ => None,
            },
            ..ExecutionVars::default()
        };

        let execution = Execution {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            graph_version: graph.version,
            contact_id: contact.id.clone(),
            contact_email: contact.email.clone(),
            status: ExecutionStatus::Pending,
            current_node_id: trigger.id.clone(),
            scheduled_for,
            vars,
            error_message: None,
            enrolled_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
            version: 0,
            lease_until: None,
            step_history: Vec::new(),
        };

        let outcome = self.executions.insert_if_absent(execution);
        if let EnrollOutcome::AlreadyEnrolled { .. } = outcome {
            self.workflows.unpin(workflow.id, graph.version);
        }
        match outcome {
            EnrollOutcome::Enrolled { execution_id } => {
                self.workflows.update_stats(workflow.id, |s| s.total_enrolled += 1);
                metrics::counter!("nurture.enrollments", "trigger" => workflow.trigger.type_name()).increment(1);
                info!(
                    workflow_id = %workflow.id,
                    %execution_id,
                    contact_id = %contact.id,
                    scheduled_for = %scheduled_for,
                    "Contact enrolled"
                );
                self.event_sink.emit(make_event(
                    EventType::ExecutionEnrolled,
                    workflow.id,
                    Some(execution_id),
                    Some(contact.id.clone()),
                ));
            }
            EnrollOutcome::AlreadyEnrolled { execution_id } => {
                debug!(
                    workflow_id = %workflow.id,
                    %execution_id,
                    contact_id = %contact.id,
                    "Contact already enrolled, skipping"
                );
            }
        }
        Ok(outcome)
    }

    fn tally(
        &self,
        report: &mut EnrollmentReport,
        workflow: &WorkflowDefinition,
        contact: &Contact,
        now: DateTime<Utc>,
    ) {
        match self.enroll_contact(workflow, contact, EnrollSource::Manual, now) {
            Ok(EnrollOutcome::Enrolled { execution_id }) => {
                report.enrolled += 1;
                report.execution_ids.push(execution_id);
            }
            Ok(EnrollOutcome::AlreadyEnrolled { .. }) => report.skipped += 1,
            Err(err) => report.errors.push(format!("{}: {err}", contact.id)),
        }
    }

    /// Enrolls a list of contacts; duplicates and already-enrolled contacts are skipped.
    pub async fn enroll_bulk(
        &self,
        workflow_id: Uuid,
        contact_ids: &[String],
        now: DateTime<Utc>,
    ) -> EngineResult<EnrollmentReport> {
        let workflow = self.active_workflow(workflow_id)?;
        let mut report = EnrollmentReport::default();
        let mut seen = HashSet::new();

        for contact_id in contact_ids {
            if !seen.insert(contact_id.as_str()) {
                report.skipped += 1;
                continue;
            }
            match self.contacts.get(contact_id).await {
                Ok(Some(contact)) => self.tally(&mut report, &workflow, &contact, now),
                Ok(None) => report.errors.push(format!("Contact {contact_id} not found")),
                Err(err) => report.errors.push(format!("{contact_id}: {err}")),
            }
        }

        info!(
            %workflow_id,
            enrolled = report.enrolled,
            skipped = report.skipped,
            errors = report.errors.len(),
            "Bulk enrollment finished"
        );
        Ok(report)
    }

    /// Streams every contact matching `filter` into the workflow, chunk by chunk.
    pub async fn enroll_all_by_filter(
        &self,
        workflow_id: Uuid,
        filter: ContactFilter,
        now: DateTime<Utc>,
    ) -> EngineResult<EnrollmentReport> {
        let workflow = self.active_workflow(workflow_id)?;
        let mut report = EnrollmentReport::default();
        let mut chunks = self.contacts.stream_contacts(filter.clone()).chunks(self.chunk_size);
        let mut chunk_count = 0usize;

        while let Some(chunk) = chunks.next().await {
            chunk_count += 1;
            for item in chunk {
                match item {
                    Ok(contact) => self.tally(&mut report, &workflow, &contact, now),
                    Err(err) => report.errors.push(err.to_string()),
                }
            }
            debug!(%workflow_id, chunk = chunk_count, enrolled = report.enrolled, "Enrollment chunk processed");
        }

        info!(
            %workflow_id,
            filter = ?filter,
            chunks = chunk_count,
            enrolled = report.enrolled,
            skipped = report.skipped,
            errors = report.errors.len(),
            "Filtered enrollment finished"
        );
        Ok(report)
    }

    /// Cancels one execution. Repeated or late cancels are no-ops.
    pub fn cancel(&self, execution_id: Uuid, now: DateTime<Utc>) -> EngineResult<CancelOutcome> {
        let (outcome, execution) = self.executions.cancel(execution_id, now)?;
        match outcome {
            CancelOutcome::Cancelled => {
                release_retired(&self.workflows, &self.ledger, &execution);
                self.workflows
                    .update_stats(execution.workflow_id, |s| s.cancelled += 1);
                metrics::counter!("nurture.executions_cancelled").increment(1);
                info!(
                    workflow_id = %execution.workflow_id,
                    %execution_id,
                    node_id = %execution.current_node_id,
                    "Execution cancelled"
                );
                self.event_sink.emit(
                    make_event(
                        EventType::ExecutionCancelled,
                        execution.workflow_id,
                        Some(execution_id),
                        Some(execution.contact_id.clone()),
                    )
                    .at_node(execution.current_node_id.clone()),
                );
            }
            CancelOutcome::AlreadyCancelled => {
                debug!(%execution_id, "Execution already cancelled");
            }
            CancelOutcome::AlreadyFinished(status) => {
                info!(%execution_id, ?status, "Execution already finished, nothing to cancel");
            }
        }
        Ok(outcome)
    }

    /// Cancels every active execution of a contact (unsubscribe).
    pub fn cancel_for_contact(&self, contact_id: &str, now: DateTime<Utc>) -> EngineResult<usize> {
        let mut cancelled = 0;
        for execution_id in self.executions.active_for_contact(contact_id) {
            if self.cancel(execution_id, now)? == CancelOutcome::Cancelled {
                cancelled += 1;
            }
        }
        info!(contact_id, cancelled, "Cancelled executions for contact");
        Ok(cancelled)
    }

    /// Enrolls the event's contact into every active workflow whose trigger matches.
    pub async fn handle_trigger_event(
        &self,
        event: &TriggerEvent,
        now: DateTime<Utc>,
    ) -> EngineResult<EnrollmentReport> {
        let contact = self.contact(event.contact_id()).await?;
        let mut report = EnrollmentReport::default();

        for workflow in self.workflows.active() {
            if !event.matches(&workflow.trigger) {
                continue;
            }
            match self.enroll_contact(&workflow, &contact, EnrollSource::Trigger, now) {
                Ok(EnrollOutcome::Enrolled { execution_id }) => {
                    report.enrolled += 1;
                    report.execution_ids.push(execution_id);
                }
                Ok(EnrollOutcome::AlreadyEnrolled { .. }) => report.skipped += 1,
                Err(err) => {
                    warn!(workflow_id = %workflow.id, error = %err, "Trigger enrollment failed");
                    report.errors.push(format!("{}: {err}", workflow.id));
                }
            }
        }

        debug!(?event, enrolled = report.enrolled, "Trigger event handled");
        Ok(report)
    }

    /// Operator re-enrollment of contacts whose executions failed.
    pub async fn reenroll_failed(&self, workflow_id: Uuid, now: DateTime<Utc>) -> EngineResult<EnrollmentReport> {
        let workflow = self.active_workflow(workflow_id)?;
        // A contact qualifies when nothing was enrolled at or after its latest failure.
        let executions = self.executions.list(|e| e.workflow_id == workflow_id);
        let mut last_failure: HashMap<&str, DateTime<Utc>> = HashMap::new();
        for execution in executions.iter().filter(|e| e.status == ExecutionStatus::Failed) {
            let at = last_failure.entry(execution.contact_id.as_str()).or_insert(execution.enrolled_at);
            *at = (*at).max(execution.enrolled_at);
        }
        for execution in executions.iter().filter(|e| e.status != ExecutionStatus::Failed) {
            if let Some(failed_at) = last_failure.get(execution.contact_id.as_str()) {
                if execution.enrolled_at >= *failed_at {
                    last_failure.remove(execution.contact_id.as_str());
                }
            }
        }
        let mut failed_contacts: Vec<String> = last_failure.into_keys().map(str::to_owned).collect();
        failed_contacts.sort();

        let report = self.enroll_bulk(workflow.id, &failed_contacts, now).await?;
        info!(%workflow_id, reenrolled = report.enrolled, "Re-enrolled failed executions");
        Ok(report)
    }

    /// Enrolls into a follow-up workflow from a goal node.
    pub async fn enroll_chained(
        &self,
        parent: &Execution,
        next_workflow_id: Uuid,
        now: DateTime<Utc>,
    ) -> EngineResult<EnrollOutcome> {
        self.enroll(
            next_workflow_id,
            &parent.contact_id,
            EnrollSource::Chained(parent.id),
            now,
        )
        .await
    }
}
