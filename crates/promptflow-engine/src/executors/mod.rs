//! One executor per node kind.
//!
//! Executors see the node's payload, the run's bindings and the values of
//! the predecessors whose edges were taken. They return a [`NodeOutput`] or
//! an error; they never touch the run's records directly.

pub mod conditional;
pub mod for_each;
pub mod output;
pub mod prompt;
pub mod transform;
pub mod variable;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use promptflow_core::config::EngineConfig;
use promptflow_core::execution::ItemError;
use promptflow_core::traits::{ModelProvider, TemplateStore};

use crate::bindings::Bindings;

/// Everything an executor may read.
pub struct NodeContext<'a> {
    pub node_id: &'a str,
    pub bindings: &'a Bindings,
    /// `(node id, value)` of predecessors reached through taken edges.
    pub upstream: &'a [(String, Value)],
    pub cancel: &'a CancellationToken,
    pub config: &'a EngineConfig,
    pub provider: &'a dyn ModelProvider,
    pub templates: Option<&'a dyn TemplateStore>,
}

/// What a node produced.
#[derive(Debug, Clone, Default)]
pub struct NodeOutput {
    /// Bound for downstream nodes under the node id.
    pub value: Value,
    /// Recorded on the node's execution record instead of `value`.
    pub detail: Option<Value>,
    /// Additional binding name for `value`.
    pub bind_as: Option<String>,
    /// Branch taken by a Conditional.
    pub branch: Option<bool>,
    pub item_errors: Vec<ItemError>,
}

impl NodeOutput {
    pub fn value(value: Value) -> Self {
        Self {
            value,
            ..Default::default()
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn bind_as(mut self, name: Option<String>) -> Self {
        self.bind_as = name;
        self
    }

    /// The value written to the execution record.
    pub fn recorded(&self) -> Value {
        self.detail.clone().unwrap_or_else(|| self.value.clone())
    }
}
