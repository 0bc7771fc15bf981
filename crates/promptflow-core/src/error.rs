use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Structural errors, raised before anything runs
    #[error("Flow validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    // Node errors
    #[error("Model execution failed in node {node_id}: {source}")]
    ModelExecution {
        node_id: String,
        #[source]
        source: ModelError,
    },

    #[error("Unresolved variables in node {node_id}: {}", .missing.join(", "))]
    VariableResolution {
        node_id: String,
        missing: Vec<String>,
    },

    #[error("Node {node_id} failed: {message}")]
    NodeExecution { node_id: String, message: String },

    #[error("Execution cancelled")]
    Cancelled,

    // Collaborator lookups
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    pub fn node(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NodeExecution {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    /// The node this error is attributed to, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::ModelExecution { node_id, .. }
            | Self::VariableResolution { node_id, .. }
            | Self::NodeExecution { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, FlowError>;

/// Failure reported by a model provider.
///
/// `transient` marks failures worth retrying (rate limits, timeouts,
/// upstream 5xx). The engine itself never retries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ModelError {
    pub message: String,
    pub transient: bool,
}

impl ModelError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

/// Category of a structural flow problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    DanglingEdge,
    OrphanNode,
    InvalidCycle,
    MissingRequiredField,
    DuplicateBranch,
    DuplicateNodeId,
    InvalidLoopBody,
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DanglingEdge => "DANGLING_EDGE",
            Self::OrphanNode => "ORPHAN_NODE",
            Self::InvalidCycle => "INVALID_CYCLE",
            Self::MissingRequiredField => "MISSING_REQUIRED_FIELD",
            Self::DuplicateBranch => "DUPLICATE_BRANCH",
            Self::DuplicateNodeId => "DUPLICATE_NODE_ID",
            Self::InvalidLoopBody => "INVALID_LOOP_BODY",
        };
        f.write_str(s)
    }
}

/// A single structural problem found in a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
    pub message: String,
}

impl ValidationError {
    pub fn for_node(
        kind: ValidationErrorKind,
        node_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            node_id: Some(node_id.into()),
            edge_id: None,
            message: message.into(),
        }
    }

    pub fn for_edge(
        kind: ValidationErrorKind,
        edge_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            node_id: None,
            edge_id: Some(edge_id.into()),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let location = match (&self.node_id, &self.edge_id) {
            (Some(n), _) => format!("node {}", n),
            (None, Some(e)) => format!("edge {}", e),
            (None, None) => "flow".to_string(),
        };
        write!(f, "[{}] {}: {}", self.kind, location, self.message)
    }
}
