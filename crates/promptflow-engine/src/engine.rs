use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use promptflow_core::config::EngineConfig;
use promptflow_core::error::{FlowError, Result};
use promptflow_core::event::{EventBus, FlowEvent};
use promptflow_core::execution::{FlowExecutionResult, NodeExecution, NodeStatus, RunStatus};
use promptflow_core::flow::{parse_branch_handle, NodeData, NodeKind, PromptFlow};
use promptflow_core::traits::{ExecutionSink, ModelProvider, TemplateStore};
use promptflow_core::types::PromptTemplate;

use crate::bindings::Bindings;
use crate::executors::for_each::{self, BodyRunner, ItemOutcome};
use crate::executors::{conditional, output, prompt, transform, variable};
use crate::executors::{NodeContext, NodeOutput};
use crate::validation::{FlowPlan, ScopeEdge, ScopePlan};

/// Runs validated flows against a model provider.
///
/// Within one run nodes are dispatched one at a time in topological order;
/// only a parallel ForEach runs work concurrently. The engine is shareable
/// across concurrent runs.
pub struct FlowEngine {
    provider: Arc<dyn ModelProvider>,
    templates: Option<Arc<dyn TemplateStore>>,
    sink: Option<Arc<dyn ExecutionSink>>,
    event_bus: Arc<EventBus>,
    config: EngineConfig,
}

impl FlowEngine {
    pub fn new(provider: impl ModelProvider) -> Self {
        Self::with_provider(Arc::new(provider))
    }

    pub fn with_provider(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            provider,
            templates: None,
            sink: None,
            event_bus: Arc::new(EventBus::default()),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach the store TemplateRef nodes and `execute_by_id` read from.
    pub fn with_templates(mut self, templates: Arc<dyn TemplateStore>) -> Self {
        self.templates = Some(templates);
        self
    }

    /// Attach a sink that receives every finished run.
    pub fn with_sink(mut self, sink: Arc<dyn ExecutionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate and run `flow`. Validation errors are returned as
    /// `Err(FlowError::Validation)` and no node runs; every other failure
    /// is reported on the returned result.
    pub async fn execute(
        &self,
        flow: &PromptFlow,
        inputs: HashMap<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<FlowExecutionResult> {
        let plan = FlowPlan::compile(flow)?;
        Ok(self.execute_plan(&plan, inputs, cancel).await)
    }

    /// Run a single template as a `prompt -> output` flow.
    pub async fn execute_template(
        &self,
        template: &PromptTemplate,
        inputs: HashMap<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<FlowExecutionResult> {
        self.execute(&PromptFlow::from_template(template), inputs, cancel)
            .await
    }

    /// Load a flow from the attached store and run it.
    pub async fn execute_by_id(
        &self,
        flow_id: &str,
        inputs: HashMap<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<FlowExecutionResult> {
        let store = self
            .templates
            .as_ref()
            .ok_or_else(|| FlowError::FlowNotFound(flow_id.to_string()))?;
        let flow = store
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| FlowError::FlowNotFound(flow_id.to_string()))?;
        self.execute(&flow, inputs, cancel).await
    }

    /// Run an already compiled plan.
    pub async fn execute_plan(
        &self,
        plan: &FlowPlan,
        inputs: HashMap<String, Value>,
        cancel: &CancellationToken,
    ) -> FlowExecutionResult {
        let flow = plan.flow();
        let execution_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();

        info!(
            execution_id = %execution_id,
            flow_id = %flow.id,
            nodes = flow.nodes.len(),
            "Flow run started"
        );
        self.event_bus.publish(FlowEvent::RunStarted {
            execution_id,
            flow_id: flow.id.clone(),
        });

        // Caller inputs win over flow-level defaults.
        let mut bindings = Bindings::from_map(flow.variables.clone());
        bindings.extend(inputs);

        let run = RunContext {
            engine: self,
            plan,
            execution_id,
            cancel,
        };
        let outcome = run.run_scope(plan.root(), bindings, None).await;

        let status = match &outcome.failure {
            None => RunStatus::Completed,
            Some(f) if f.error.is_cancelled() => RunStatus::Cancelled,
            Some(_) => RunStatus::Failed,
        };
        let output = collect_output(plan, &outcome);
        let (total_tokens, total_cost) = usage_totals(&outcome.records);
        let execution_time_ms = start.elapsed().as_millis() as u64;

        let (error, failed_node_id) = match outcome.failure {
            Some(f) => (Some(f.error.to_string()), f.node_id),
            None => (None, None),
        };
        let result = FlowExecutionResult {
            execution_id,
            flow_id: flow.id.clone(),
            success: status == RunStatus::Completed,
            status,
            output,
            execution_time_ms,
            node_executions: outcome.records,
            error,
            failed_node_id,
            started_at,
            completed_at: Utc::now(),
            total_tokens,
            total_cost,
        };

        info!(
            execution_id = %execution_id,
            flow_id = %flow.id,
            status = %result.status,
            elapsed_ms = execution_time_ms,
            total_tokens,
            "Flow run finished"
        );
        self.event_bus.publish(FlowEvent::RunFinished {
            execution_id,
            flow_id: flow.id.clone(),
            status: result.status,
            execution_time_ms,
        });

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.record_flow(&result).await {
                warn!(execution_id = %execution_id, error = %e, "Failed to record flow run");
            }
        }
        result
    }
}

/// Why a scope stopped early.
#[derive(Debug)]
struct ScopeFailure {
    error: FlowError,
    node_id: Option<String>,
}

/// What running one scope produced.
#[derive(Debug, Default)]
struct ScopeOutcome {
    /// Records in dispatch order, loop bodies inlined after their ForEach.
    records: Vec<NodeExecution>,
    /// Values of completed members.
    values: HashMap<usize, Value>,
    /// Completed members in dispatch order.
    completed: Vec<usize>,
    failure: Option<ScopeFailure>,
}

/// Per-run state shared by the top level and every loop body.
struct RunContext<'a> {
    engine: &'a FlowEngine,
    plan: &'a FlowPlan,
    execution_id: Uuid,
    cancel: &'a CancellationToken,
}

impl<'a> RunContext<'a> {
    fn run_scope(
        &'a self,
        scope: &'a ScopePlan,
        mut bindings: Bindings,
        iteration: Option<usize>,
    ) -> BoxFuture<'a, ScopeOutcome> {
        Box::pin(async move {
            let mut outcome = ScopeOutcome::default();
            let mut status: HashMap<usize, NodeStatus> = HashMap::new();
            let mut branches: HashMap<usize, bool> = HashMap::new();

            for &idx in &scope.order {
                let node = self.plan.node(idx);
                if self.cancel.is_cancelled() {
                    debug!(node_id = %node.id, "Cancelled before dispatch");
                    outcome.failure = Some(ScopeFailure {
                        error: FlowError::Cancelled,
                        node_id: None,
                    });
                    break;
                }

                let taken: Vec<&ScopeEdge> = scope
                    .incoming(idx)
                    .iter()
                    .filter(|e| edge_taken(e, &status, &branches))
                    .collect();
                if !scope.incoming(idx).is_empty() && taken.is_empty() {
                    let record = tag(NodeExecution::skipped(&node.id, node.kind()), iteration);
                    debug!(node_id = %node.id, "Skipping node, no incoming edge taken");
                    self.publish_finished(&record);
                    status.insert(idx, NodeStatus::Skipped);
                    outcome.records.push(record);
                    continue;
                }

                let mut upstream: Vec<(String, Value)> = Vec::new();
                for edge in &taken {
                    let id = &self.plan.node(edge.source).id;
                    if upstream.iter().any(|(seen, _)| seen == id) {
                        continue;
                    }
                    if let Some(value) = outcome.values.get(&edge.source) {
                        upstream.push((id.clone(), value.clone()));
                    }
                }
                let input: Map<String, Value> = upstream.iter().cloned().collect();
                let record = tag(
                    NodeExecution::start(&node.id, node.kind(), Value::Object(input)),
                    iteration,
                );

                debug!(node_id = %node.id, kind = %node.kind(), ?iteration, "Dispatching node");
                self.engine.event_bus.publish(FlowEvent::NodeStarted {
                    execution_id: self.execution_id,
                    node_id: node.id.clone(),
                    kind: node.kind(),
                    iteration,
                });

                let (result, children) = self
                    .dispatch(idx, &node.data, &node.id, &bindings, &upstream)
                    .await;

                match result {
                    Ok(out) => {
                        let mut record = record.complete(out.recorded());
                        record.item_errors = out.item_errors;
                        self.publish_finished(&record);
                        outcome.records.push(record);
                        outcome.records.extend(children);

                        bindings.set(node.id.clone(), out.value.clone());
                        if let Some(alias) = out.bind_as {
                            bindings.set(alias, out.value.clone());
                        }
                        if let Some(branch) = out.branch {
                            branches.insert(idx, branch);
                        }
                        status.insert(idx, NodeStatus::Completed);
                        outcome.values.insert(idx, out.value);
                        outcome.completed.push(idx);
                    }
                    Err(e) => {
                        let record = if e.is_cancelled() {
                            debug!(node_id = %node.id, "Node stopped on cancellation");
                            record.cancel()
                        } else {
                            error!(node_id = %node.id, error = %e, "Node failed");
                            record.fail(e.to_string())
                        };
                        self.publish_finished(&record);
                        outcome.records.push(record);
                        outcome.records.extend(children);
                        // A failure inside a loop body names the body node.
                        let node_id = if e.is_cancelled() {
                            e.node_id().map(str::to_string)
                        } else {
                            Some(e.node_id().unwrap_or(&node.id).to_string())
                        };
                        outcome.failure = Some(ScopeFailure { error: e, node_id });
                        break;
                    }
                }
            }
            outcome
        })
    }

    async fn dispatch(
        &self,
        idx: usize,
        data: &NodeData,
        node_id: &str,
        bindings: &Bindings,
        upstream: &[(String, Value)],
    ) -> (Result<NodeOutput>, Vec<NodeExecution>) {
        let engine = self.engine;
        let ctx = NodeContext {
            node_id,
            bindings,
            upstream,
            cancel: self.cancel,
            config: &engine.config,
            provider: engine.provider.as_ref(),
            templates: engine.templates.as_deref(),
        };
        match data {
            NodeData::Prompt(node) => (prompt::execute(node, &ctx).await, Vec::new()),
            NodeData::TemplateRef(node) => {
                (prompt::execute_template_ref(node, &ctx).await, Vec::new())
            }
            NodeData::Variable(node) => (Ok(variable::execute(node, &ctx)), Vec::new()),
            NodeData::Conditional(node) => (Ok(conditional::execute(node, &ctx)), Vec::new()),
            NodeData::Transform(node) => (transform::execute(node, &ctx), Vec::new()),
            NodeData::Output(node) => (Ok(output::execute(node, &ctx)), Vec::new()),
            NodeData::ForEach(node) => {
                let Some(body) = self.plan.body(idx) else {
                    return (
                        Err(FlowError::node(node_id, "loop body was not planned")),
                        Vec::new(),
                    );
                };
                let runner = LoopBody { run: self, body };
                for_each::execute(node, &ctx, &runner).await
            }
        }
    }

    fn publish_finished(&self, record: &NodeExecution) {
        self.engine.event_bus.publish(FlowEvent::NodeFinished {
            execution_id: self.execution_id,
            node_id: record.node_id.clone(),
            status: record.status,
            duration_ms: record.duration_ms,
            iteration: record.iteration,
        });
    }
}

/// Runs one loop body through the engine's scope loop.
struct LoopBody<'r, 'a> {
    run: &'r RunContext<'a>,
    body: &'a ScopePlan,
}

impl BodyRunner for LoopBody<'_, '_> {
    fn run_item(&self, index: usize, bindings: Bindings) -> BoxFuture<'_, ItemOutcome> {
        Box::pin(async move {
            let outcome = self.run.run_scope(self.body, bindings, Some(index)).await;
            let (output, failed_node) = match outcome.failure {
                Some(f) => (Err(f.error), f.node_id),
                None => (Ok(body_result(self.run.plan, self.body, &outcome.values)), None),
            };
            ItemOutcome {
                index,
                output,
                failed_node,
                records: outcome.records,
            }
        })
    }
}

fn tag(record: NodeExecution, iteration: Option<usize>) -> NodeExecution {
    match iteration {
        Some(i) => record.in_iteration(i),
        None => record,
    }
}

/// An edge is taken when its source completed and, for a Conditional,
/// the handle names the branch that was chosen.
fn edge_taken(
    edge: &ScopeEdge,
    status: &HashMap<usize, NodeStatus>,
    branches: &HashMap<usize, bool>,
) -> bool {
    if status.get(&edge.source) != Some(&NodeStatus::Completed) {
        return false;
    }
    match (&edge.handle, branches.get(&edge.source)) {
        (Some(handle), Some(&branch)) => parse_branch_handle(handle) == Some(branch),
        _ => true,
    }
}

/// One item's value: the single terminal's value, or a map of completed
/// terminals keyed by node id.
fn body_result(plan: &FlowPlan, body: &ScopePlan, values: &HashMap<usize, Value>) -> Value {
    let terminals = body.terminals();
    if let [only] = terminals.as_slice() {
        return values.get(only).cloned().unwrap_or(Value::Null);
    }
    let map: Map<String, Value> = terminals
        .iter()
        .filter_map(|t| values.get(t).map(|v| (plan.node(*t).id.clone(), v.clone())))
        .collect();
    Value::Object(map)
}

/// The run's terminal output: the single top-level Output node's value, a
/// map keyed by node id when there are several, or the last completed
/// value when the flow has none.
fn collect_output(plan: &FlowPlan, outcome: &ScopeOutcome) -> Value {
    let outputs: Vec<usize> = plan
        .root()
        .order
        .iter()
        .copied()
        .filter(|&i| plan.node(i).kind() == NodeKind::Output)
        .collect();
    match outputs.as_slice() {
        [] => outcome
            .completed
            .last()
            .and_then(|i| outcome.values.get(i))
            .cloned()
            .unwrap_or(Value::Null),
        [only] => outcome.values.get(only).cloned().unwrap_or(Value::Null),
        many => {
            let map: Map<String, Value> = many
                .iter()
                .filter_map(|i| {
                    outcome
                        .values
                        .get(i)
                        .map(|v| (plan.node(*i).id.clone(), v.clone()))
                })
                .collect();
            Value::Object(map)
        }
    }
}

/// Token and cost totals over completed model calls.
fn usage_totals(records: &[NodeExecution]) -> (u64, f64) {
    records
        .iter()
        .filter(|r| r.status == NodeStatus::Completed)
        .filter(|r| matches!(r.kind, NodeKind::Prompt | NodeKind::TemplateRef))
        .fold((0, 0.0), |(tokens, cost), r| {
            let usage = &r.output["usage"];
            let t = usage["input_tokens"].as_u64().unwrap_or(0)
                + usage["output_tokens"].as_u64().unwrap_or(0);
            (tokens + t, cost + r.output["cost"].as_f64().unwrap_or(0.0))
        })
}
