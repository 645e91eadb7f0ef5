use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nurture_core::{EngineError, EngineResult};

use crate::types::{Execution, ExecutionStatus};

/// Describes a single valid status transition for an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
    pub trigger: &'static str,
}

/// Guards execution lifecycle: statuses only move forward, and terminal
/// statuses never change.
#[derive(Debug, Clone)]
pub struct ExecutionStateMachine {
    transitions: Vec<StatusTransition>,
}

impl ExecutionStateMachine {
    pub fn new() -> Self {
        use ExecutionStatus::*;

        let transitions = vec![
            // Pending ->
            StatusTransition { from: Pending, to: Running, trigger: "first_tick" },
            StatusTransition { from: Pending, to: Completed, trigger: "first_tick_terminal" },
            StatusTransition { from: Pending, to: Failed, trigger: "first_tick_error" },
            StatusTransition { from: Pending, to: Cancelled, trigger: "cancel_before_start" },
            // Running ->
            StatusTransition { from: Running, to: Running, trigger: "advance" },
            StatusTransition { from: Running, to: Completed, trigger: "workflow_complete" },
            StatusTransition { from: Running, to: Failed, trigger: "tick_error" },
            StatusTransition { from: Running, to: Cancelled, trigger: "cancel" },
        ];

        Self { transitions }
    }

    pub fn can_transition(&self, from: ExecutionStatus, to: ExecutionStatus) -> bool {
        self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    /// Moves `execution` to `to`, stamping start/completion times.
    pub fn transition(&self, execution: &mut Execution, to: ExecutionStatus) -> EngineResult<()> {
        if !self.can_transition(execution.status, to) {
            return Err(invalid(execution.id, execution.status, to));
        }
        let now = execution.updated_at;
        if execution.started_at.is_none() && to != ExecutionStatus::Cancelled {
            execution.started_at = Some(now);
        }
        if to.is_terminal() {
            execution.completed_at = Some(now);
        }
        execution.status = to;
        Ok(())
    }
}

impl Default for ExecutionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(id: Uuid, from: ExecutionStatus, to: ExecutionStatus) -> EngineError {
    EngineError::Execution(format!(
        "Invalid status transition for execution {id} from {from:?} to {to:?}"
    ))
}
