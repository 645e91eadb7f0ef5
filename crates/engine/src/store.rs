//! In-process storage for workflows, executions and side-effect records.
//!
//! Executions are advanced through a claim/commit protocol: `claim` takes a
//! short lease and bumps the execution's version, `commit` only lands when
//! the version is still the one handed out by the claim. Anything that
//! touched the execution in between (a cancel, another sweep after lease
//! expiry) wins, and the stale tick is discarded.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use nurture_core::{EngineError, EngineResult};

use crate::state_machine::ExecutionStateMachine;
use crate::types::{
    Engagement, EnrollOutcome, Execution, ExecutionStatus, WorkflowDefinition, WorkflowGraph,
    WorkflowStats,
};

// ─── Workflows ──────────────────────────────────────────────────────────────

/// A graph version plus the number of live executions pinned to it.
struct PinnedGraph {
    graph: Arc<WorkflowGraph>,
    pins: usize,
}

/// Workflow definitions plus every graph version a live execution is pinned to.
///
/// The current version is always kept; older versions are dropped once their
/// last pinned execution retires.
#[derive(Default)]
pub struct WorkflowStore {
    definitions: DashMap<Uuid, WorkflowDefinition>,
    snapshots: DashMap<(Uuid, u32), PinnedGraph>,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, workflow: WorkflowDefinition) {
        self.snapshot_of(&workflow);
        self.definitions.insert(workflow.id, workflow);
    }

    pub fn get(&self, id: Uuid) -> Option<WorkflowDefinition> {
        self.definitions.get(&id).map(|w| w.clone())
    }

    pub fn list(&self) -> Vec<WorkflowDefinition> {
        let mut all: Vec<_> = self.definitions.iter().map(|w| w.clone()).collect();
        all.sort_by_key(|w| w.created_at);
        all
    }

    pub fn active(&self) -> Vec<WorkflowDefinition> {
        self.definitions
            .iter()
            .filter(|w| w.is_active)
            .map(|w| w.clone())
            .collect()
    }

    /// Applies `f` to the stored definition and returns the updated copy.
    pub fn update<F>(&self, id: Uuid, f: F) -> EngineResult<WorkflowDefinition>
    where
        F: FnOnce(&mut WorkflowDefinition) -> EngineResult<()>,
    {
        let (previous_version, updated) = {
            let mut entry = self
                .definitions
                .get_mut(&id)
                .ok_or_else(|| EngineError::not_found("Workflow", id))?;
            let previous_version = entry.graph_version;
            f(entry.value_mut())?;
            entry.updated_at = Utc::now();
            (previous_version, entry.clone())
        };
        self.snapshot_of(&updated);
        if previous_version != updated.graph_version {
            self.snapshots
                .remove_if(&(id, previous_version), |_, pinned| pinned.pins == 0);
        }
        Ok(updated)
    }

    pub fn update_stats(&self, id: Uuid, f: impl FnOnce(&mut WorkflowStats)) {
        if let Some(mut workflow) = self.definitions.get_mut(&id) {
            f(&mut workflow.stats);
        }
    }

    pub fn remove(&self, id: Uuid) -> Option<WorkflowDefinition> {
        self.snapshots.retain(|(wf, _), _| *wf != id);
        self.definitions.remove(&id).map(|(_, w)| w)
    }

    /// Graph snapshot at a specific version.
    pub fn snapshot(&self, id: Uuid, version: u32) -> Option<Arc<WorkflowGraph>> {
        self.snapshots
            .get(&(id, version))
            .map(|pinned| Arc::clone(&pinned.graph))
    }

    /// Pins a graph version for a new execution and returns it.
    pub fn pin(&self, id: Uuid, version: u32) -> Option<Arc<WorkflowGraph>> {
        let mut pinned = self.snapshots.get_mut(&(id, version))?;
        pinned.pins += 1;
        Some(Arc::clone(&pinned.graph))
    }

    /// Releases a pin; a superseded version goes away with its last pin.
    pub fn unpin(&self, id: Uuid, version: u32) {
        if let Some(mut pinned) = self.snapshots.get_mut(&(id, version)) {
            pinned.pins = pinned.pins.saturating_sub(1);
        }
        let current = self.definitions.get(&id).map(|w| w.graph_version);
        self.snapshots.remove_if(&(id, version), |_, pinned| {
            pinned.pins == 0 && current != Some(version)
        });
    }

    /// Graph versions still held for a workflow, oldest first.
    pub fn snapshot_versions(&self, id: Uuid) -> Vec<u32> {
        let mut versions: Vec<u32> = self
            .snapshots
            .iter()
            .filter(|s| s.key().0 == id)
            .map(|s| s.key().1)
            .collect();
        versions.sort_unstable();
        versions
    }

    fn snapshot_of(&self, workflow: &WorkflowDefinition) {
        self.snapshots
            .entry((workflow.id, workflow.graph_version))
            .or_insert_with(|| PinnedGraph {
                graph: Arc::new(WorkflowGraph::from_definition(workflow)),
                pins: 0,
            });
    }
}

// ─── Due queue ──────────────────────────────────────────────────────────────

/// Time-ordered index of executions waiting for their next tick.
#[derive(Default)]
struct DueQueue {
    by_time: BTreeSet<(DateTime<Utc>, Uuid)>,
    by_id: HashMap<Uuid, DateTime<Utc>>,
}

impl DueQueue {
    fn schedule(&mut self, id: Uuid, at: DateTime<Utc>) {
        if let Some(previous) = self.by_id.insert(id, at) {
            self.by_time.remove(&(previous, id));
        }
        self.by_time.insert((at, id));
    }

    fn remove(&mut self, id: Uuid) {
        if let Some(at) = self.by_id.remove(&id) {
            self.by_time.remove(&(at, id));
        }
    }

    fn due(&self, now: DateTime<Utc>, limit: usize) -> Vec<Uuid> {
        self.by_time
            .iter()
            .take_while(|(at, _)| *at <= now)
            .take(limit)
            .map(|(_, id)| *id)
            .collect()
    }

    fn len(&self) -> usize {
        self.by_id.len()
    }
}

/// What a cancel request found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyCancelled,
    AlreadyFinished(ExecutionStatus),
}

// ─── Executions ─────────────────────────────────────────────────────────────

pub struct ExecutionStore {
    executions: DashMap<Uuid, Execution>,
    /// Active execution per (workflow, contact); guarantees single enrollment.
    active: DashMap<(Uuid, String), Uuid>,
    due: Mutex<DueQueue>,
    engagement: DashMap<Uuid, Engagement>,
    state_machine: ExecutionStateMachine,
}

impl ExecutionStore {
    pub fn new() -> Self {
        Self {
            executions: DashMap::new(),
            active: DashMap::new(),
            due: Mutex::new(DueQueue::default()),
            engagement: DashMap::new(),
            state_machine: ExecutionStateMachine::new(),
        }
    }

    /// Inserts `execution` unless the contact already has an active one in the workflow.
    pub fn insert_if_absent(&self, execution: Execution) -> EnrollOutcome {
        let key = (execution.workflow_id, execution.contact_id.clone());
        let execution_id = execution.id;
        // The index slot stays locked until the execution is stored.
        match self.active.entry(key) {
            Entry::Occupied(mut slot) => {
                let existing = *slot.get();
                if self.is_active(existing) {
                    return EnrollOutcome::AlreadyEnrolled {
                        execution_id: existing,
                    };
                }
                slot.insert(execution_id);
                self.store_new(execution);
            }
            Entry::Vacant(slot) => {
                let _slot = slot.insert(execution_id);
                self.store_new(execution);
            }
        }
        EnrollOutcome::Enrolled { execution_id }
    }

    fn store_new(&self, execution: Execution) {
        self.due.lock().schedule(execution.id, execution.scheduled_for);
        self.executions.insert(execution.id, execution);
    }

    pub fn get(&self, id: Uuid) -> Option<Execution> {
        self.executions.get(&id).map(|e| e.clone())
    }

    fn is_active(&self, id: Uuid) -> bool {
        self.executions
            .get(&id)
            .map_or(false, |e| e.status.is_active())
    }

    /// Ids whose next tick is due at or before `now`, earliest first.
    pub fn due(&self, now: DateTime<Utc>, limit: usize) -> Vec<Uuid> {
        self.due.lock().due(now, limit)
    }

    pub fn queued(&self) -> usize {
        self.due.lock().len()
    }

    /// Leases a due execution for one tick. `None` when it is not runnable.
    pub fn claim(&self, id: Uuid, now: DateTime<Utc>, lease: Duration) -> Option<Execution> {
        let claimed = {
            let mut entry = self.executions.get_mut(&id)?;
            if !entry.status.is_active() {
                None
            } else if entry.scheduled_for > now || entry.lease_until.is_some_and(|l| l > now) {
                return None;
            } else {
                let lease_until = now + lease;
                entry.lease_until = Some(lease_until);
                entry.version += 1;
                Some(entry.clone())
            }
        };

        let mut due = self.due.lock();
        match &claimed {
            // An abandoned lease becomes due again once it expires.
            Some(execution) => {
                if let Some(lease_until) = execution.lease_until {
                    due.schedule(id, lease_until);
                }
            }
            None => due.remove(id),
        }
        claimed
    }

    /// Writes back a ticked execution if nobody touched it since the claim.
    pub fn commit(&self, mut execution: Execution, claimed_version: u64) -> EngineResult<()> {
        let id = execution.id;
        {
            let mut entry = self
                .executions
                .get_mut(&id)
                .ok_or_else(|| EngineError::not_found("Execution", id))?;
            if entry.version != claimed_version || entry.status.is_terminal() {
                debug!(execution_id = %id, "Discarding stale tick");
                return Err(EngineError::Conflict(id));
            }
            execution.version = claimed_version + 1;
            execution.lease_until = None;
            *entry = execution.clone();
        }

        if execution.status.is_active() {
            self.due.lock().schedule(id, execution.scheduled_for);
        } else {
            self.retire(&execution);
        }
        Ok(())
    }

    /// Cancels an execution; idempotent.
    pub fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> EngineResult<(CancelOutcome, Execution)> {
        let (outcome, snapshot) = {
            let mut entry = self
                .executions
                .get_mut(&id)
                .ok_or_else(|| EngineError::not_found("Execution", id))?;
            let outcome = match entry.status {
                ExecutionStatus::Cancelled => CancelOutcome::AlreadyCancelled,
                status if status.is_terminal() => CancelOutcome::AlreadyFinished(status),
                _ => {
                    entry.updated_at = now;
                    self.state_machine
                        .transition(entry.value_mut(), ExecutionStatus::Cancelled)?;
                    entry.version += 1;
                    entry.lease_until = None;
                    CancelOutcome::Cancelled
                }
            };
            (outcome, entry.clone())
        };

        if outcome == CancelOutcome::Cancelled {
            self.retire(&snapshot);
        }
        Ok((outcome, snapshot))
    }

    /// Moves a waiting execution's next tick to `at`.
    pub fn reschedule(&self, id: Uuid, at: DateTime<Utc>, now: DateTime<Utc>) -> EngineResult<Execution> {
        let updated = {
            let mut entry = self
                .executions
                .get_mut(&id)
                .ok_or_else(|| EngineError::not_found("Execution", id))?;
            if !entry.status.is_active() {
                return Err(EngineError::Execution(format!(
                    "Execution {id} is {:?} and cannot be rescheduled",
                    entry.status
                )));
            }
            if entry.lease_until.is_some_and(|l| l > now) {
                return Err(EngineError::Conflict(id));
            }
            entry.scheduled_for = at;
            entry.updated_at = now;
            entry.version += 1;
            entry.clone()
        };
        self.due.lock().schedule(id, at);
        Ok(updated)
    }

    fn retire(&self, execution: &Execution) {
        self.due.lock().remove(execution.id);
        self.active.remove_if(
            &(execution.workflow_id, execution.contact_id.clone()),
            |_, active_id| *active_id == execution.id,
        );
    }

    pub fn list(&self, filter: impl Fn(&Execution) -> bool) -> Vec<Execution> {
        let mut matching: Vec<Execution> = self
            .executions
            .iter()
            .filter(|e| filter(e.value()))
            .map(|e| e.clone())
            .collect();
        matching.sort_by_key(|e| (e.enrolled_at, e.id));
        matching
    }

    pub fn for_workflow(&self, workflow_id: Uuid) -> Vec<Execution> {
        self.list(|e| e.workflow_id == workflow_id)
    }

    pub fn active_for_contact(&self, contact_id: &str) -> Vec<Uuid> {
        self.list(|e| e.contact_id == contact_id && e.status.is_active())
            .into_iter()
            .map(|e| e.id)
            .collect()
    }

    /// Removes every execution of a workflow. Callers cancel active ones first.
    pub fn remove_workflow(&self, workflow_id: Uuid) -> usize {
        let ids: Vec<Uuid> = self
            .executions
            .iter()
            .filter(|e| e.workflow_id == workflow_id)
            .map(|e| e.id)
            .collect();
        {
            let mut due = self.due.lock();
            for id in &ids {
                due.remove(*id);
            }
        }
        for id in &ids {
            self.executions.remove(id);
            self.engagement.remove(id);
        }
        self.active.retain(|(wf, _), _| *wf != workflow_id);
        ids.len()
    }

    // ─── Engagement ─────────────────────────────────────────────────────

    pub fn record_engagement(&self, id: Uuid, f: impl FnOnce(&mut Engagement)) {
        f(&mut self.engagement.entry(id).or_default());
    }

    pub fn engagement(&self, id: Uuid) -> Engagement {
        self.engagement
            .get(&id)
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

impl Default for ExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Drops what a retired execution held: its effect records and its graph pin.
pub fn release_retired(workflows: &WorkflowStore, ledger: &EffectLedger, execution: &Execution) {
    ledger.forget_execution(execution.id);
    workflows.unpin(execution.workflow_id, execution.graph_version);
}

// ─── Effect ledger ──────────────────────────────────────────────────────────

/// Identifies one side effect: the n-th visit of an execution to a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EffectKey {
    pub execution_id: Uuid,
    pub node_id: String,
    pub visit: u32,
}

impl EffectKey {
    pub fn new(execution_id: Uuid, node_id: impl Into<String>, visit: u32) -> Self {
        Self {
            execution_id,
            node_id: node_id.into(),
            visit,
        }
    }
}

/// Records side effects that already happened so a re-run tick skips them.
///
/// Only the latest visit per node is kept, since visit counts never go back.
/// An execution's entries are dropped when it retires.
#[derive(Default)]
pub struct EffectLedger {
    entries: DashMap<Uuid, HashMap<String, (u32, String)>>,
}

impl EffectLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detail recorded for a completed effect (message id, status code, ...).
    pub fn get(&self, key: &EffectKey) -> Option<String> {
        self.entries.get(&key.execution_id).and_then(|effects| {
            effects
                .get(&key.node_id)
                .filter(|(visit, _)| *visit == key.visit)
                .map(|(_, detail)| detail.clone())
        })
    }

    pub fn record(&self, key: EffectKey, detail: impl Into<String>) {
        self.entries
            .entry(key.execution_id)
            .or_default()
            .insert(key.node_id, (key.visit, detail.into()));
    }

    pub fn forget_execution(&self, execution_id: Uuid) {
        self.entries.remove(&execution_id);
    }

    /// Number of recorded effects across all executions.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|e| e.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionVars;

    fn execution(workflow_id: Uuid, contact_id: &str, at: DateTime<Utc>) -> Execution {
        Execution {
            id: Uuid::new_v4(),
            workflow_id,
            graph_version: 1,
            contact_id: contact_id.into(),
            contact_email: format!("{contact_id}@example.com"),
            status: ExecutionStatus::Pending,
            current_node_id: "trigger".into(),
            scheduled_for: at,
            vars: ExecutionVars::default(),
            error_message: None,
            enrolled_at: at,
            started_at: None,
            updated_at: at,
            completed_at: None,
            version: 0,
            lease_until: None,
            step_history: Vec::new(),
        }
    }

    #[test]
    fn test_single_active_execution_per_contact() {
        let store = ExecutionStore::new();
        let wf = Uuid::new_v4();
        let now = Utc::now();
        let first = store.insert_if_absent(execution(wf, "c1", now));
        let second = store.insert_if_absent(execution(wf, "c1", now));
        assert!(matches!(first, EnrollOutcome::Enrolled { .. }));
        assert_eq!(
            second,
            EnrollOutcome::AlreadyEnrolled {
                execution_id: first.execution_id()
            }
        );

        // Once finished, the contact may enroll again.
        store.cancel(first.execution_id(), now).unwrap();
        let third = store.insert_if_absent(execution(wf, "c1", now));
        assert!(matches!(third, EnrollOutcome::Enrolled { .. }));
    }

    #[test]
    fn test_due_ordering_and_limit() {
        let store = ExecutionStore::new();
        let wf = Uuid::new_v4();
        let now = Utc::now();
        let late = store.insert_if_absent(execution(wf, "late", now - Duration::minutes(1)));
        let early = store.insert_if_absent(execution(wf, "early", now - Duration::hours(1)));
        let future = store.insert_if_absent(execution(wf, "future", now + Duration::hours(1)));

        let due = store.due(now, 10);
        assert_eq!(due, vec![early.execution_id(), late.execution_id()]);
        assert_eq!(store.due(now, 1).len(), 1);
        assert!(!due.contains(&future.execution_id()));
    }

    #[test]
    fn test_claim_commit_and_conflict() {
        let store = ExecutionStore::new();
        let now = Utc::now();
        let id = store
            .insert_if_absent(execution(Uuid::new_v4(), "c1", now))
            .execution_id();

        let claimed = store.claim(id, now, Duration::minutes(5)).unwrap();
        // Leased: a second sweep cannot take it.
        assert!(store.claim(id, now, Duration::minutes(5)).is_none());
        assert!(store.due(now, 10).is_empty());

        let mut next = claimed.clone();
        next.status = ExecutionStatus::Running;
        next.scheduled_for = now + Duration::days(2);
        store.commit(next.clone(), claimed.version).unwrap();
        assert_eq!(store.get(id).unwrap().version, claimed.version + 1);

        // Replaying the same claim is rejected.
        assert!(matches!(
            store.commit(next, claimed.version),
            Err(EngineError::Conflict(_))
        ));
    }

    #[test]
    fn test_cancel_during_tick_wins() {
        let store = ExecutionStore::new();
        let now = Utc::now();
        let id = store
            .insert_if_absent(execution(Uuid::new_v4(), "c1", now))
            .execution_id();
        let claimed = store.claim(id, now, Duration::minutes(5)).unwrap();

        let (outcome, _) = store.cancel(id, now).unwrap();
        assert_eq!(outcome, CancelOutcome::Cancelled);
        assert!(store.commit(claimed.clone(), claimed.version).is_err());
        assert_eq!(store.get(id).unwrap().status, ExecutionStatus::Cancelled);

        let (again, _) = store.cancel(id, now).unwrap();
        assert_eq!(again, CancelOutcome::AlreadyCancelled);
        assert!(store.due(now + Duration::days(30), 10).is_empty());
    }

    #[test]
    fn test_expired_lease_is_reclaimable() {
        let store = ExecutionStore::new();
        let now = Utc::now();
        let id = store
            .insert_if_absent(execution(Uuid::new_v4(), "c1", now))
            .execution_id();
        let lease = Duration::minutes(5);
        store.claim(id, now, lease).unwrap();

        let later = now + Duration::minutes(6);
        assert_eq!(store.due(later, 10), vec![id]);
        assert!(store.claim(id, later, lease).is_some());
    }

    #[test]
    fn test_superseded_graph_dropped_with_last_pin() {
        let store = WorkflowStore::new();
        let workflow = WorkflowDefinition::new("Pinned", crate::types::Trigger::Manual, Vec::new(), Vec::new());
        let id = workflow.id;
        store.insert(workflow);

        assert!(store.pin(id, 1).is_some());
        store
            .update(id, |w| {
                w.graph_version += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(store.snapshot_versions(id), vec![1, 2]);

        store.unpin(id, 1);
        assert_eq!(store.snapshot_versions(id), vec![2]);

        // The current version survives even without pins.
        store.pin(id, 2);
        store.unpin(id, 2);
        assert_eq!(store.snapshot_versions(id), vec![2]);

        // Nothing pinned: an edit drops the old version right away.
        store
            .update(id, |w| {
                w.graph_version += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(store.snapshot_versions(id), vec![3]);
    }

    #[test]
    fn test_effect_ledger() {
        let ledger = EffectLedger::new();
        let id = Uuid::new_v4();
        let key = EffectKey::new(id, "hook", 0);
        assert!(ledger.get(&key).is_none());
        ledger.record(key.clone(), "200");
        assert_eq!(ledger.get(&key).as_deref(), Some("200"));
        assert!(ledger.get(&EffectKey::new(id, "hook", 1)).is_none());

        // A later visit replaces the earlier one.
        ledger.record(EffectKey::new(id, "hook", 1), "202");
        assert_eq!(ledger.len(), 1);
        assert!(ledger.get(&key).is_none());
        assert_eq!(ledger.get(&EffectKey::new(id, "hook", 1)).as_deref(), Some("202"));

        ledger.forget_execution(id);
        assert!(ledger.is_empty());
    }
}
