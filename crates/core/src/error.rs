use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type EngineResult<T> = Result<T, EngineError>;

/// A single static-analysis finding against a workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
    pub message: String,
}

impl ValidationError {
    pub fn node(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            edge_id: None,
            message: message.into(),
        }
    }

    pub fn edge(
        edge_id: impl Into<String>,
        node_id: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            node_id,
            edge_id: Some(edge_id.into()),
            message: message.into(),
        }
    }

    pub fn graph(message: impl Into<String>) -> Self {
        Self {
            node_id: None,
            edge_id: None,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.node_id, &self.edge_id) {
            (_, Some(edge)) => write!(f, "edge {}: {}", edge, self.message),
            (Some(node), None) => write!(f, "node {}: {}", node, self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

/// Failure reported by an external collaborator (mail, webhook, stores, AI).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
}

impl CollaboratorError {
    /// Timeouts and transient errors may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transient(_))
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Workflow validation failed with {} error(s)", .0.len())]
    Validation(Vec<ValidationError>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Workflow {0} is not active")]
    Inactive(Uuid),

    #[error("Concurrent modification of execution {0}")]
    Conflict(Uuid),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::edge("e1", Some("n2".into()), "back-to-back");
        assert_eq!(err.to_string(), "edge e1: back-to-back");
        let err = ValidationError::node("n1", "not connected");
        assert_eq!(err.to_string(), "node n1: not connected");
    }

    #[test]
    fn test_transient_classification() {
        assert!(CollaboratorError::Timeout(500).is_transient());
        assert!(CollaboratorError::Transient("503".into()).is_transient());
        assert!(!CollaboratorError::Permanent("bad address".into()).is_transient());
        let engine: EngineError = CollaboratorError::Timeout(10).into();
        assert!(engine.to_string().contains("timed out"));
    }
}
