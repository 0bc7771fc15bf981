use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use promptflow_core::config::BatchConfig;
use promptflow_core::error::ModelError;
use promptflow_core::execution::RunStatus;
use promptflow_core::types::PromptTemplate;
use promptflow_engine::{BatchCoordinator, BatchTarget, FlowEngine};
use promptflow_test_utils::{fixtures, GatedProvider, MockProvider};

fn sets(k: usize, failing: usize) -> Vec<HashMap<String, String>> {
    (0..k)
        .map(|i| {
            let code = if i == failing {
                "FAIL".to_string()
            } else {
                format!("fn f{}() {{}}", i)
            };
            HashMap::from([("code".to_string(), code)])
        })
        .collect()
}

#[tokio::test]
async fn one_failing_item_is_isolated() {
    let k = 8;
    let provider = MockProvider::echo()
        .fail_when("FAIL", ModelError::permanent("rejected"))
        .with_delay(Duration::from_millis(2));
    let coordinator =
        BatchCoordinator::new(Arc::new(FlowEngine::new(provider)), BatchConfig::default());

    let result = coordinator
        .execute_batch(
            &BatchTarget::Flow(fixtures::review_flow()),
            sets(k, 3),
            Some(3),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.total_count, k);
    assert_eq!(result.failure_count, 1);
    assert_eq!(result.success_count, k - 1);
    assert_eq!(result.item_results.len(), k);
    let failed: Vec<usize> = result
        .item_results
        .iter()
        .filter(|i| !i.result.success)
        .map(|i| i.index)
        .collect();
    assert_eq!(failed, vec![3]);
}

#[tokio::test]
async fn progress_reports_every_item() {
    let coordinator = BatchCoordinator::new(
        Arc::new(FlowEngine::new(MockProvider::echo())),
        BatchConfig::default(),
    );
    let (tx, mut rx) = coordinator.progress_channel();
    let template = PromptTemplate::new("explain", "Explain", "Explain {{code}}", "m");

    let result = coordinator
        .execute_batch(
            &BatchTarget::Template(template),
            sets(4, usize::MAX),
            None,
            Some(tx),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.success_count, 4);

    let mut seen = Vec::new();
    while let Some(p) = rx.recv().await {
        assert_eq!(p.total_count, 4);
        seen.push(p.current_item);
    }
    seen.sort();
    assert_eq!(seen, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn cancel_after_two_started() {
    let provider = Arc::new(GatedProvider::new());
    let coordinator = Arc::new(BatchCoordinator::new(
        Arc::new(FlowEngine::new(provider.clone())),
        BatchConfig::default(),
    ));
    let cancel = CancellationToken::new();

    let handle = {
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            coordinator
                .execute_batch(
                    &BatchTarget::Flow(fixtures::review_flow()),
                    sets(5, usize::MAX),
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

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(result.processed_count, 2);
    assert_eq!(result.total_count, 5);
    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(provider.started(), 2);
}
