use std::collections::HashMap;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use promptflow_core::error::Result;
use promptflow_core::execution::{BatchExecutionResult, FlowExecutionResult};
use promptflow_core::flow::PromptFlow;
use promptflow_core::traits::{ExecutionSink, TemplateStore};
use promptflow_core::types::PromptTemplate;

/// In-memory template store and execution history.
#[derive(Default)]
pub struct MemoryStore {
    templates: RwLock<HashMap<String, PromptTemplate>>,
    flows: RwLock<HashMap<String, PromptFlow>>,
    flow_runs: RwLock<Vec<FlowExecutionResult>>,
    batch_runs: RwLock<Vec<BatchExecutionResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from already-loaded definitions.
    pub fn with_definitions(templates: Vec<PromptTemplate>, flows: Vec<PromptFlow>) -> Self {
        Self {
            templates: RwLock::new(templates.into_iter().map(|t| (t.id.clone(), t)).collect()),
            flows: RwLock::new(flows.into_iter().map(|f| (f.id.clone(), f)).collect()),
            ..Default::default()
        }
    }

    pub async fn insert_template(&self, template: PromptTemplate) {
        self.templates
            .write()
            .await
            .insert(template.id.clone(), template);
    }

    pub async fn insert_flow(&self, flow: PromptFlow) {
        self.flows.write().await.insert(flow.id.clone(), flow);
    }

    /// Recorded flow runs, in recording order.
    pub async fn flow_runs(&self) -> Vec<FlowExecutionResult> {
        self.flow_runs.read().await.clone()
    }

    pub async fn batch_runs(&self) -> Vec<BatchExecutionResult> {
        self.batch_runs.read().await.clone()
    }
}

impl TemplateStore for MemoryStore {
    fn get_template(&self, id: &str) -> BoxFuture<'_, Result<Option<PromptTemplate>>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.templates.read().await.get(&id).cloned()) })
    }

    fn get_flow(&self, id: &str) -> BoxFuture<'_, Result<Option<PromptFlow>>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.flows.read().await.get(&id).cloned()) })
    }
}

impl ExecutionSink for MemoryStore {
    fn record_flow(&self, result: &FlowExecutionResult) -> BoxFuture<'_, Result<()>> {
        let result = result.clone();
        Box::pin(async move {
            self.flow_runs.write().await.push(result);
            Ok(())
        })
    }

    fn record_batch(&self, result: &BatchExecutionResult) -> BoxFuture<'_, Result<()>> {
        let result = result.clone();
        Box::pin(async move {
            self.batch_runs.write().await.push(result);
            Ok(())
        })
    }
}
