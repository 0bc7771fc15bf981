//! Execution records produced by flow and batch runs.
//!
//! Records are created once by the run that owns them and never shared
//! across runs. A finalized `NodeExecution` is not touched again.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::flow::NodeKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A failed ForEach item that did not stop the loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub message: String,
}

/// One node dispatch within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub node_id: String,
    pub kind: NodeKind,
    pub status: NodeStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// ForEach iteration this record belongs to, for loop body nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item_errors: Vec<ItemError>,
}

impl NodeExecution {
    /// Open a record for a node that is about to run.
    pub fn start(node_id: impl Into<String>, kind: NodeKind, input: Value) -> Self {
        Self {
            node_id: node_id.into(),
            kind,
            status: NodeStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            input,
            output: Value::Null,
            error: None,
            duration_ms: 0,
            iteration: None,
            item_errors: Vec::new(),
        }
    }

    /// A node that never ran because no incoming edge was taken.
    pub fn skipped(node_id: impl Into<String>, kind: NodeKind) -> Self {
        let now = Utc::now();
        Self {
            status: NodeStatus::Skipped,
            end_time: Some(now),
            start_time: now,
            ..Self::start(node_id, kind, Value::Null)
        }
    }

    pub fn complete(mut self, output: Value) -> Self {
        self.status = NodeStatus::Completed;
        self.output = output;
        self.finish()
    }

    pub fn fail(mut self, error: impl Into<String>) -> Self {
        self.status = NodeStatus::Failed;
        self.error = Some(error.into());
        self.finish()
    }

    pub fn cancel(mut self) -> Self {
        self.status = NodeStatus::Cancelled;
        self.error = Some("execution cancelled".to_string());
        self.finish()
    }

    pub fn in_iteration(mut self, index: usize) -> Self {
        self.iteration = Some(index);
        self
    }

    fn finish(mut self) -> Self {
        let end = Utc::now();
        self.duration_ms = (end - self.start_time).num_milliseconds().max(0) as u64;
        self.end_time = Some(end);
        self
    }
}

/// Lifecycle of a single flow run. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Result of one flow run. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowExecutionResult {
    pub execution_id: Uuid,
    pub flow_id: String,
    pub success: bool,
    pub status: RunStatus,
    /// Terminal output: the single Output node's value, or a map keyed by
    /// node id when the flow has several.
    pub output: Value,
    pub execution_time_ms: u64,
    pub node_executions: Vec<NodeExecution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_node_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_cost: f64,
}

impl FlowExecutionResult {
    /// A result for a run that failed before dispatching any node.
    pub fn rejected(flow_id: impl Into<String>, error: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            execution_id: Uuid::new_v4(),
            flow_id: flow_id.into(),
            success: false,
            status: RunStatus::Failed,
            output: Value::Null,
            execution_time_ms: 0,
            node_executions: Vec::new(),
            error: Some(error.into()),
            failed_node_id: None,
            started_at: now,
            completed_at: now,
            total_tokens: 0,
            total_cost: 0.0,
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeExecution> {
        self.node_executions.iter().find(|n| n.node_id == node_id)
    }

    /// Status counts over this run's node records.
    pub fn status_counts(&self) -> HashMap<NodeStatus, usize> {
        let mut counts = HashMap::new();
        for exec in &self.node_executions {
            *counts.entry(exec.status).or_insert(0) += 1;
        }
        counts
    }
}

/// One batch item: the variable set it ran with and its run result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub index: usize,
    pub variables: HashMap<String, String>,
    #[serde(flatten)]
    pub result: FlowExecutionResult,
}

/// Aggregate result of a batch run, sorted by item index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchExecutionResult {
    pub batch_id: Uuid,
    pub status: RunStatus,
    pub total_count: usize,
    pub processed_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub cancelled_count: usize,
    pub item_results: Vec<BatchItemResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl BatchExecutionResult {
    pub fn item(&self, index: usize) -> Option<&BatchItemResult> {
        self.item_results.iter().find(|i| i.index == index)
    }
}

/// Live progress snapshot, emitted after each finished batch item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchExecutionProgress {
    pub processed_count: usize,
    pub total_count: usize,
    /// Index of the item that just finished.
    pub current_item: usize,
    pub success: bool,
}
