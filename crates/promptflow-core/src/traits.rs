use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{ModelError, Result};
use crate::execution::{BatchExecutionResult, FlowExecutionResult};
use crate::flow::PromptFlow;
use crate::types::{ModelRequest, ModelResponse, PromptTemplate};

/// Executes a resolved prompt against a model.
///
/// Implementations own any rate limiting or connection pooling. The engine
/// treats every `Err` as a node failure.
pub trait ModelProvider: Send + Sync + 'static {
    /// Provider name, for logs.
    fn name(&self) -> &str;

    /// Run one request.
    fn execute(
        &self,
        request: ModelRequest,
    ) -> BoxFuture<'_, std::result::Result<ModelResponse, ModelError>>;
}

impl<P: ModelProvider + ?Sized> ModelProvider for Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn execute(
        &self,
        request: ModelRequest,
    ) -> BoxFuture<'_, std::result::Result<ModelResponse, ModelError>> {
        (**self).execute(request)
    }
}

/// Read access to stored templates and flows.
pub trait TemplateStore: Send + Sync + 'static {
    fn get_template(&self, id: &str) -> BoxFuture<'_, Result<Option<PromptTemplate>>>;

    fn get_flow(&self, id: &str) -> BoxFuture<'_, Result<Option<PromptFlow>>>;
}

/// Receives finished flow and batch results.
pub trait ExecutionSink: Send + Sync + 'static {
    fn record_flow(&self, result: &FlowExecutionResult) -> BoxFuture<'_, Result<()>>;

    fn record_batch(&self, result: &BatchExecutionResult) -> BoxFuture<'_, Result<()>>;
}
