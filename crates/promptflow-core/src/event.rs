use serde::Serialize;
use uuid::Uuid;

use crate::execution::{NodeStatus, RunStatus};
use crate::flow::NodeKind;

/// Execution lifecycle events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FlowEvent {
    RunStarted {
        execution_id: Uuid,
        flow_id: String,
    },
    NodeStarted {
        execution_id: Uuid,
        node_id: String,
        kind: NodeKind,
        iteration: Option<usize>,
    },
    NodeFinished {
        execution_id: Uuid,
        node_id: String,
        status: NodeStatus,
        duration_ms: u64,
        iteration: Option<usize>,
    },
    RunFinished {
        execution_id: Uuid,
        flow_id: String,
        status: RunStatus,
        execution_time_ms: u64,
    },
    BatchItemFinished {
        batch_id: Uuid,
        index: usize,
        success: bool,
    },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
