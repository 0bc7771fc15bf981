use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use promptflow_core::config::BatchConfig;
use promptflow_core::error::Result;
use promptflow_core::event::FlowEvent;
use promptflow_core::execution::{
    BatchExecutionProgress, BatchExecutionResult, BatchItemResult, FlowExecutionResult, RunStatus,
};
use promptflow_core::flow::PromptFlow;
use promptflow_core::traits::ExecutionSink;
use promptflow_core::types::PromptTemplate;

use crate::engine::FlowEngine;
use crate::validation::FlowPlan;

/// What a batch runs.
#[derive(Debug, Clone)]
pub enum BatchTarget {
    Flow(PromptFlow),
    /// Wrapped into a `prompt -> output` flow.
    Template(PromptTemplate),
}

impl BatchTarget {
    fn to_flow(&self) -> PromptFlow {
        match self {
            Self::Flow(flow) => flow.clone(),
            Self::Template(template) => PromptFlow::from_template(template),
        }
    }
}

/// Runs one flow over many variable sets with bounded concurrency.
///
/// Fail-soft: an item's failure is recorded and the batch moves on.
/// Cancellation stops dispatching new items; running items finish and are
/// included in the result.
pub struct BatchCoordinator {
    engine: Arc<FlowEngine>,
    config: BatchConfig,
    sink: Option<Arc<dyn ExecutionSink>>,
}

impl BatchCoordinator {
    pub fn new(engine: Arc<FlowEngine>, config: BatchConfig) -> Self {
        Self {
            engine,
            config,
            sink: None,
        }
    }

    /// Attach a sink that receives the finished batch summary.
    pub fn with_sink(mut self, sink: Arc<dyn ExecutionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// A progress channel sized from the batch config.
    pub fn progress_channel(
        &self,
    ) -> (
        mpsc::Sender<BatchExecutionProgress>,
        mpsc::Receiver<BatchExecutionProgress>,
    ) {
        mpsc::channel(self.config.progress_buffer.max(1))
    }

    /// Run `target` once per variable set.
    ///
    /// The flow is validated once, up front; a validation failure rejects
    /// the whole batch. `concurrency` of `None` or `0` falls back to the
    /// configured default. Progress snapshots are delivered with
    /// `try_send`: a full channel drops the snapshot instead of stalling.
    pub async fn execute_batch(
        &self,
        target: &BatchTarget,
        variable_sets: Vec<HashMap<String, String>>,
        concurrency: Option<usize>,
        progress: Option<mpsc::Sender<BatchExecutionProgress>>,
        cancel: &CancellationToken,
    ) -> Result<BatchExecutionResult> {
        let flow = target.to_flow();
        let plan = Arc::new(FlowPlan::compile(&flow)?);
        let concurrency = match concurrency {
            Some(n) if n > 0 => n,
            _ => self.config.default_concurrency.max(1),
        };

        let batch_id = Uuid::new_v4();
        let started_at = Utc::now();
        let total_count = variable_sets.len();
        info!(
            batch_id = %batch_id,
            flow_id = %flow.id,
            total_count,
            concurrency,
            "Batch started"
        );

        let mut queue: VecDeque<(usize, HashMap<String, String>)> =
            variable_sets.into_iter().enumerate().collect();
        let mut join_set: JoinSet<BatchItemResult> = JoinSet::new();
        let mut items: Vec<BatchItemResult> = Vec::with_capacity(total_count);
        let mut stopped_early = false;
        let (mut success_count, mut failure_count, mut cancelled_count) = (0, 0, 0);

        loop {
            while join_set.len() < concurrency && !queue.is_empty() {
                if cancel.is_cancelled() {
                    break;
                }
                if let Some((index, variables)) = queue.pop_front() {
                    debug!(batch_id = %batch_id, index, "Dispatching batch item");
                    self.spawn_item(&mut join_set, plan.clone(), index, variables, cancel);
                }
            }
            if cancel.is_cancelled() && !queue.is_empty() {
                info!(
                    batch_id = %batch_id,
                    undispatched = queue.len(),
                    "Batch cancelled, no further items dispatched"
                );
                queue.clear();
                stopped_early = true;
            }
            if join_set.is_empty() {
                break;
            }

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled(), if !queue.is_empty() => continue,
                joined = join_set.join_next() => joined,
            };
            let Some(joined) = joined else {
                continue;
            };
            let item = match joined {
                Ok(item) => item,
                Err(e) => {
                    error!(batch_id = %batch_id, error = %e, "Batch worker task failed");
                    continue;
                }
            };

            match item.result.status {
                RunStatus::Completed => success_count += 1,
                RunStatus::Cancelled => cancelled_count += 1,
                _ => {
                    failure_count += 1;
                    warn!(
                        batch_id = %batch_id,
                        index = item.index,
                        error = item.result.error.as_deref().unwrap_or_default(),
                        "Batch item failed"
                    );
                }
            }
            self.engine.event_bus().publish(FlowEvent::BatchItemFinished {
                batch_id,
                index: item.index,
                success: item.result.success,
            });
            items.push(item);

            if let (Some(tx), Some(last)) = (&progress, items.last()) {
                let snapshot = BatchExecutionProgress {
                    processed_count: items.len(),
                    total_count,
                    current_item: last.index,
                    success: last.result.success,
                };
                match tx.try_send(snapshot) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(batch_id = %batch_id, "Progress channel full, snapshot dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }

        items.sort_by_key(|item| item.index);
        let status = if stopped_early || cancelled_count > 0 {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        let result = BatchExecutionResult {
            batch_id,
            status,
            total_count,
            processed_count: items.len(),
            success_count,
            failure_count,
            cancelled_count,
            item_results: items,
            started_at,
            completed_at: Utc::now(),
        };

        info!(
            batch_id = %batch_id,
            status = %result.status,
            processed = result.processed_count,
            succeeded = result.success_count,
            failed = result.failure_count,
            cancelled = result.cancelled_count,
            "Batch finished"
        );
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.record_batch(&result).await {
                warn!(batch_id = %batch_id, error = %e, "Failed to record batch");
            }
        }
        Ok(result)
    }

    fn spawn_item(
        &self,
        join_set: &mut JoinSet<BatchItemResult>,
        plan: Arc<FlowPlan>,
        index: usize,
        variables: HashMap<String, String>,
        cancel: &CancellationToken,
    ) {
        let engine = self.engine.clone();
        let cancel = cancel.clone();
        join_set.spawn(async move {
            let inputs: HashMap<String, Value> = variables
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            let run = AssertUnwindSafe(engine.execute_plan(&plan, inputs, &cancel))
                .catch_unwind()
                .await;
            let result = run.unwrap_or_else(|_| {
                error!(index, "Batch item panicked");
                FlowExecutionResult::rejected(&plan.flow().id, "batch item panicked")
            });
            BatchItemResult {
                index,
                variables,
                result,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use promptflow_core::error::{FlowError, ModelError};
    use promptflow_test_utils::{fixtures, GatedProvider, MockProvider};

    use crate::store::MemoryStore;

    fn sets(codes: &[&str]) -> Vec<HashMap<String, String>> {
        codes
            .iter()
            .map(|c| HashMap::from([("code".to_string(), c.to_string())]))
            .collect()
    }

    fn coordinator(engine: FlowEngine) -> BatchCoordinator {
        BatchCoordinator::new(Arc::new(engine), BatchConfig::default())
    }

    #[tokio::test]
    async fn failing_item_does_not_abort_batch() {
        let provider = MockProvider::echo().fail_when("FAIL", ModelError::permanent("refused"));
        let store = Arc::new(MemoryStore::new());
        let batch = coordinator(FlowEngine::new(provider)).with_sink(store.clone());
        let (tx, mut rx) = batch.progress_channel();

        let result = batch
            .execute_batch(
                &BatchTarget::Flow(fixtures::review_flow()),
                sets(&["a", "b", "FAIL", "d", "e"]),
                Some(2),
                Some(tx),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.total_count, 5);
        assert_eq!(result.processed_count, 5);
        assert_eq!(result.success_count, 4);
        assert_eq!(result.failure_count, 1);
        let indexes: Vec<usize> = result.item_results.iter().map(|i| i.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4]);
        let failed = result.item(2).unwrap();
        assert_eq!(failed.result.failed_node_id.as_deref(), Some("review"));
        assert_eq!(failed.variables["code"], "FAIL");

        let mut snapshots = Vec::new();
        while let Ok(p) = rx.try_recv() {
            snapshots.push(p);
        }
        assert_eq!(snapshots.len(), 5);
        assert_eq!(snapshots.last().unwrap().processed_count, 5);
        assert_eq!(store.batch_runs().await.len(), 1);
    }

    #[tokio::test]
    async fn full_progress_channel_does_not_stall() {
        let batch = coordinator(FlowEngine::new(MockProvider::echo()));
        let (tx, _rx) = mpsc::channel(1);
        let result = batch
            .execute_batch(
                &BatchTarget::Flow(fixtures::review_flow()),
                sets(&["a", "b", "c", "d"]),
                None,
                Some(tx),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.success_count, 4);
    }

    #[tokio::test]
    async fn invalid_target_is_rejected() {
        let batch = coordinator(FlowEngine::new(MockProvider::echo()));
        let flow = fixtures::review_flow().connect("ghost", "out");
        let err = batch
            .execute_batch(
                &BatchTarget::Flow(flow),
                sets(&["a"]),
                None,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));
    }

    #[tokio::test]
    async fn template_target() {
        let batch = coordinator(FlowEngine::new(MockProvider::echo()));
        let template = PromptTemplate::new("t", "T", "Explain {{code}}", "m");
        let result = batch
            .execute_batch(
                &BatchTarget::Template(template),
                sets(&["x", "y"]),
                Some(0),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.success_count, 2);
        assert_eq!(result.item(1).unwrap().result.output, serde_json::json!("echo: Explain y"));
    }

    #[tokio::test]
    async fn cancel_stops_dispatch() {
        let provider = Arc::new(GatedProvider::new());
        let batch = Arc::new(coordinator(FlowEngine::new(provider.clone())));
        let cancel = CancellationToken::new();

        let handle = {
            let batch = batch.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                batch
                    .execute_batch(
                        &BatchTarget::Flow(fixtures::review_flow()),
                        sets(&["1", "2", "3", "4", "5"]),
                        Some(2),
                        None,
                        &cancel,
                    )
                    .await
            })
        };

        tokio::time::timeout(Duration::from_secs(5), provider.wait_for_started(2))
            .await
            .unwrap();
        cancel.cancel();
        provider.release(2);

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.processed_count, 2);
        assert_eq!(result.item_results.len(), 2);
        assert_eq!(provider.started(), 2);
    }
}
