use std::time::Duration;

use futures::future::BoxFuture;

use promptflow_core::error::ModelError;
use promptflow_core::traits::ModelProvider;
use promptflow_core::types::{ModelRequest, ModelResponse, TokenUsage};

/// Dry-run provider: answers every request with the resolved prompt.
///
/// Token usage is a whitespace word count, so run summaries stay
/// meaningful without a real model.
pub struct EchoProvider {
    latency: Duration,
}

impl EchoProvider {
    pub fn new(latency_ms: u64) -> Self {
        Self {
            latency: Duration::from_millis(latency_ms),
        }
    }
}

impl ModelProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    fn execute(
        &self,
        request: ModelRequest,
    ) -> BoxFuture<'_, std::result::Result<ModelResponse, ModelError>> {
        Box::pin(async move {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            let words = request.prompt.split_whitespace().count() as u64;
            Ok(ModelResponse::text(request.prompt).with_usage(TokenUsage::new(words, words), 0.0))
        })
    }
}
