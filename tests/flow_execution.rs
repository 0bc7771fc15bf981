use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use promptflow_core::config::EngineConfig;
use promptflow_core::error::FlowError;
use promptflow_core::execution::{NodeStatus, RunStatus};
use promptflow_core::flow::{FlowNode, IterationMode, OutputFormat, PromptFlow, TransformNode};
use promptflow_core::template;
use promptflow_engine::{FlowEngine, JsonlHistorySink};
use promptflow_test_utils::{fixtures, GatedProvider, MockProvider};

fn inputs(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

#[tokio::test]
async fn review_flow_resolves_every_placeholder() {
    let engine = FlowEngine::new(MockProvider::echo());
    let result = engine
        .execute(
            &fixtures::review_flow(),
            inputs(&[("code", json!("let x=1;"))]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.node_executions.len(), 3);
    for id in ["lang", "review", "out"] {
        let count = result
            .node_executions
            .iter()
            .filter(|n| n.node_id == id)
            .count();
        assert_eq!(count, 1, "node {}", id);
    }
    let text = result.output.as_str().unwrap();
    assert!(text.contains("javascript"));
    assert!(text.contains("let x=1;"));
    assert!(template::extract_variable_names(text).is_empty());
}

#[tokio::test]
async fn flow_json_round_trip_executes() {
    let text = serde_json::to_string(&fixtures::branching_flow()).unwrap();
    let flow: PromptFlow = serde_json::from_str(&text).unwrap();

    let engine = FlowEngine::new(MockProvider::fixed("noted"));
    let result = engine
        .execute(&flow, inputs(&[("score", json!(2))]), &CancellationToken::new())
        .await
        .unwrap();

    let counts = result.status_counts();
    assert_eq!(counts.get(&NodeStatus::Skipped), Some(&2));
    assert_eq!(result.output, json!({ "critique_out": "noted" }));
}

#[tokio::test]
async fn for_each_output_matches_source_length() {
    let files: Vec<String> = (0..7).map(|i| format!("file{}.rs", i)).collect();
    for mode in [IterationMode::Sequential, IterationMode::Parallel] {
        let engine = FlowEngine::new(MockProvider::echo().with_delay(Duration::from_millis(2)));
        let result = engine
            .execute(
                &fixtures::for_each_flow(mode),
                inputs(&[("files", json!(files))]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let list = result.output.as_array().expect("json list output");
        assert_eq!(list.len(), files.len());
        for (i, entry) in list.iter().enumerate() {
            assert_eq!(entry, &json!(format!("echo: Summarize file{}.rs", i)));
        }
    }
}

#[tokio::test]
async fn strict_variables_fail_the_prompt_node() {
    let engine = FlowEngine::new(MockProvider::echo()).with_config(EngineConfig {
        strict_variables: true,
        ..Default::default()
    });
    let result = engine
        .execute(&fixtures::review_flow(), HashMap::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.failed_node_id.as_deref(), Some("review"));
    assert!(result.error.unwrap().contains("code"));
}

#[tokio::test]
async fn unknown_expression_function_fails_with_node_id() {
    let flow = PromptFlow::new("expr", "Expr")
        .with_node(FlowNode::transform(
            "calc",
            TransformNode::Expression {
                expression: "name | shout".into(),
            },
        ))
        .with_node(FlowNode::output("out", OutputFormat::PlainText))
        .connect("calc", "out");
    let engine = FlowEngine::new(MockProvider::echo());
    let result = engine
        .execute(&flow, HashMap::new(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.failed_node_id.as_deref(), Some("calc"));
    assert_eq!(result.node("calc").unwrap().status, NodeStatus::Failed);
}

#[tokio::test]
async fn validation_errors_block_execution() {
    let flow = fixtures::review_flow()
        .with_node(FlowNode::prompt("stray", "unused", "m"));
    let engine = FlowEngine::new(MockProvider::echo());
    let err = engine
        .execute(&flow, HashMap::new(), &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        FlowError::Validation(errors) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].node_id.as_deref(), Some("stray"));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn cancelled_run_keeps_partial_records() {
    let provider = Arc::new(GatedProvider::new());
    let engine = Arc::new(FlowEngine::new(provider.clone()));
    let cancel = CancellationToken::new();

    let handle = {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            engine
                .execute(&fixtures::review_flow(), inputs(&[("code", json!("x"))]), &cancel)
                .await
        })
    };

    tokio::time::timeout(Duration::from_secs(5), provider.wait_for_started(1))
        .await
        .unwrap();
    cancel.cancel();
    provider.release(1);

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.status, RunStatus::Cancelled);
    let ids: Vec<&str> = result
        .node_executions
        .iter()
        .map(|n| n.node_id.as_str())
        .collect();
    assert_eq!(ids, vec!["lang", "review"]);
}

#[tokio::test]
async fn history_sink_records_runs() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(JsonlHistorySink::new(dir.path()));
    let engine = FlowEngine::new(MockProvider::echo()).with_sink(sink.clone());

    for code in ["a", "b"] {
        engine
            .execute(
                &fixtures::review_flow(),
                inputs(&[("code", json!(code))]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    let runs = sink.flow_runs("code-review").await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.success));
}
