use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use promptflow_core::config::RetryConfig;
use promptflow_core::error::ModelError;
use promptflow_core::traits::ModelProvider;
use promptflow_core::types::{ModelRequest, ModelResponse};

/// A model provider that retries transient failures with exponential backoff.
pub struct RetryingProvider {
    inner: Arc<dyn ModelProvider>,
    retry_config: RetryConfig,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn ModelProvider>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let base = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((base as f64 * jitter) as u64)
}

impl ModelProvider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn execute(
        &self,
        request: ModelRequest,
    ) -> BoxFuture<'_, std::result::Result<ModelResponse, ModelError>> {
        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;
            let mut attempt = 0;
            loop {
                match self.inner.execute(request.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(e) if e.transient && attempt < max_retries => {
                        let backoff = calculate_backoff(attempt, &self.retry_config);
                        warn!(
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            model = %request.model_id,
                            error = %e,
                            "Retrying model request"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}
