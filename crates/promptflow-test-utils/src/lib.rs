//! Mock model providers and flow fixtures shared by the workspace tests.

pub mod fixtures;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{Notify, Semaphore};

use promptflow_core::error::ModelError;
use promptflow_core::traits::ModelProvider;
use promptflow_core::types::{ModelRequest, ModelResponse, TokenUsage};

enum Reply {
    Echo,
    Fixed(String),
}

/// Scripted model provider.
///
/// Answers `echo: <prompt>` (or a fixed text), fails when the prompt
/// contains a configured substring, and logs every request.
pub struct MockProvider {
    reply: Reply,
    failures: Vec<(String, ModelError)>,
    usage: Option<(TokenUsage, f64)>,
    delay: Option<Duration>,
    calls: Mutex<Vec<ModelRequest>>,
}

impl MockProvider {
    pub fn echo() -> Self {
        Self::with_reply(Reply::Echo)
    }

    pub fn fixed(text: impl Into<String>) -> Self {
        Self::with_reply(Reply::Fixed(text.into()))
    }

    fn with_reply(reply: Reply) -> Self {
        Self {
            reply,
            failures: Vec::new(),
            usage: None,
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail any request whose prompt contains `needle`.
    pub fn fail_when(mut self, needle: impl Into<String>, error: ModelError) -> Self {
        self.failures.push((needle.into(), error));
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage, cost: f64) -> Self {
        self.usage = Some((usage, cost));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<ModelRequest> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn execute(
        &self,
        request: ModelRequest,
    ) -> BoxFuture<'_, std::result::Result<ModelResponse, ModelError>> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(request.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some((_, error)) = self
                .failures
                .iter()
                .find(|(needle, _)| request.prompt.contains(needle.as_str()))
            {
                return Err(error.clone());
            }
            let text = match &self.reply {
                Reply::Echo => format!("echo: {}", request.prompt),
                Reply::Fixed(text) => text.clone(),
            };
            let response = ModelResponse::text(text);
            Ok(match self.usage {
                Some((usage, cost)) => response.with_usage(usage, cost),
                None => response,
            })
        })
    }
}

/// Provider whose calls block until the test releases them.
///
/// Answers like `MockProvider::echo` once released.
pub struct GatedProvider {
    started: AtomicUsize,
    notify: Notify,
    gate: Semaphore,
}

impl GatedProvider {
    pub fn new() -> Self {
        Self {
            started: AtomicUsize::new(0),
            notify: Notify::new(),
            gate: Semaphore::new(0),
        }
    }

    /// Calls that have entered the provider so far.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Let `n` blocked (or future) calls through.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Resolve once at least `n` calls have started.
    pub async fn wait_for_started(&self, n: usize) {
        loop {
            let notified = self.notify.notified();
            if self.started() >= n {
                return;
            }
            notified.await;
        }
    }
}

impl ModelProvider for GatedProvider {
    fn name(&self) -> &str {
        "gated"
    }

    fn execute(
        &self,
        request: ModelRequest,
    ) -> BoxFuture<'_, std::result::Result<ModelResponse, ModelError>> {
        Box::pin(async move {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.notify.notify_waiters();
            match self.gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(ModelError::permanent("gate closed")),
            }
            Ok(ModelResponse::text(format!("echo: {}", request.prompt)))
        })
    }
}

impl Default for GatedProvider {
    fn default() -> Self {
        Self::new()
    }
}
