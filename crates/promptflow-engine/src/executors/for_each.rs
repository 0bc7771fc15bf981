//! ForEach: run the loop body once per element of a list binding.
//!
//! The executor owns iteration and aggregation; running the body itself is
//! delegated to a [`BodyRunner`] so the engine can reuse its scope loop.

use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use promptflow_core::error::{FlowError, Result};
use promptflow_core::execution::{ItemError, NodeExecution};
use promptflow_core::flow::{ForEachNode, IterationMode};

use super::{NodeContext, NodeOutput};
use crate::bindings::{as_list, Bindings};

/// Result of one body run.
#[derive(Debug)]
pub struct ItemOutcome {
    pub index: usize,
    pub output: Result<Value>,
    /// Body node that failed, when `output` is an error.
    pub failed_node: Option<String>,
    /// Body records, already tagged with the iteration index.
    pub records: Vec<NodeExecution>,
}

/// Runs the loop body for one item.
pub trait BodyRunner: Send + Sync {
    fn run_item(&self, index: usize, bindings: Bindings) -> BoxFuture<'_, ItemOutcome>;
}

/// Execute the loop. Returns the node outcome plus the body records in
/// item order; the records are returned even when the loop fails.
pub async fn execute(
    node: &ForEachNode,
    ctx: &NodeContext<'_>,
    runner: &dyn BodyRunner,
) -> (Result<NodeOutput>, Vec<NodeExecution>) {
    let items = match source_items(node, ctx) {
        Ok(items) => items,
        Err(e) => return (Err(e), Vec::new()),
    };
    debug!(
        node_id = %ctx.node_id,
        items = items.len(),
        mode = ?node.iteration_mode,
        "Running loop"
    );

    match node.iteration_mode {
        IterationMode::Sequential => sequential(node, ctx, runner, items).await,
        IterationMode::Parallel => parallel(node, ctx, runner, items).await,
    }
}

fn source_items(node: &ForEachNode, ctx: &NodeContext<'_>) -> Result<Vec<Value>> {
    let source = ctx.bindings.get_path(node.source_variable.trim()).ok_or_else(|| {
        FlowError::node(
            ctx.node_id,
            format!("source variable '{}' is not bound", node.source_variable),
        )
    })?;
    let items = as_list(source).ok_or_else(|| {
        FlowError::node(
            ctx.node_id,
            format!("source variable '{}' is not a list", node.source_variable),
        )
    })?;
    if items.len() > ctx.config.max_foreach_items {
        return Err(FlowError::node(
            ctx.node_id,
            format!(
                "list has {} items, limit is {}",
                items.len(),
                ctx.config.max_foreach_items
            ),
        ));
    }
    Ok(items)
}

fn item_bindings(
    node: &ForEachNode,
    ctx: &NodeContext<'_>,
    index: usize,
    item: Value,
) -> Bindings {
    let mut bindings = ctx.bindings.clone();
    bindings.set(node.item_variable.clone(), item);
    bindings.set(node.index_variable.clone(), json!(index));
    bindings
}

async fn sequential(
    node: &ForEachNode,
    ctx: &NodeContext<'_>,
    runner: &dyn BodyRunner,
    items: Vec<Value>,
) -> (Result<NodeOutput>, Vec<NodeExecution>) {
    let mut outputs = Vec::with_capacity(items.len());
    let mut records = Vec::new();
    for (index, item) in items.into_iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            return (Err(FlowError::Cancelled), records);
        }
        let outcome = runner.run_item(index, item_bindings(node, ctx, index, item)).await;
        records.extend(outcome.records);
        match outcome.output {
            Ok(value) => outputs.push(value),
            Err(e) => return (Err(e), records),
        }
    }
    (Ok(NodeOutput::value(Value::Array(outputs))), records)
}

async fn parallel(
    node: &ForEachNode,
    ctx: &NodeContext<'_>,
    runner: &dyn BodyRunner,
    items: Vec<Value>,
) -> (Result<NodeOutput>, Vec<NodeExecution>) {
    let limit = node
        .max_parallelism
        .unwrap_or(ctx.config.foreach_parallelism)
        .max(1);
    let semaphore = Arc::new(Semaphore::new(limit));

    let runs = items.into_iter().enumerate().map(|(index, item)| {
        let bindings = item_bindings(node, ctx, index, item);
        let semaphore = semaphore.clone();
        async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return ItemOutcome {
                    index,
                    output: Err(FlowError::Cancelled),
                    failed_node: None,
                    records: Vec::new(),
                };
            };
            if ctx.cancel.is_cancelled() {
                return ItemOutcome {
                    index,
                    output: Err(FlowError::Cancelled),
                    failed_node: None,
                    records: Vec::new(),
                };
            }
            runner.run_item(index, bindings).await
        }
    });
    // join_all keeps input order, so outcomes line up with the source list.
    let outcomes = join_all(runs).await;

    let mut outputs = Vec::with_capacity(outcomes.len());
    let mut records = Vec::new();
    let mut item_errors = Vec::new();
    let mut cancelled = false;
    for outcome in outcomes {
        records.extend(outcome.records);
        match outcome.output {
            Ok(value) => outputs.push(value),
            Err(FlowError::Cancelled) => {
                cancelled = true;
                outputs.push(Value::Null);
            }
            Err(e) => {
                warn!(
                    node_id = %ctx.node_id,
                    index = outcome.index,
                    error = %e,
                    "Loop item failed"
                );
                item_errors.push(ItemError {
                    index: outcome.index,
                    node_id: outcome.failed_node.or_else(|| e.node_id().map(str::to_string)),
                    message: e.to_string(),
                });
                outputs.push(Value::Null);
            }
        }
    }

    if cancelled {
        return (Err(FlowError::Cancelled), records);
    }
    let mut output = NodeOutput::value(Value::Array(outputs));
    output.item_errors = item_errors;
    (Ok(output), records)
}
