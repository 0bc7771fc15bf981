use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use promptflow_core::error::{FlowError, Result};
use promptflow_core::execution::{BatchExecutionResult, FlowExecutionResult};
use promptflow_core::traits::ExecutionSink;

/// Append-only JSONL execution history.
///
/// Flow runs go to `{dir}/flows/{flow_id}.jsonl`, batch summaries to
/// `{dir}/batches.jsonl`. One JSON object per line, flushed after each
/// write, so a crash never corrupts earlier entries.
pub struct JsonlHistorySink {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlHistorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn flow_log_path(&self, flow_id: &str) -> PathBuf {
        self.dir
            .join("flows")
            .join(format!("{}.jsonl", sanitize(flow_id)))
    }

    pub fn batch_log_path(&self) -> PathBuf {
        self.dir.join("batches.jsonl")
    }

    /// Read back every recorded run of a flow, oldest first.
    pub async fn flow_runs(&self, flow_id: &str) -> Result<Vec<FlowExecutionResult>> {
        let path = self.flow_log_path(flow_id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(FlowError::from))
            .collect()
    }

    async fn append<T: Serialize>(&self, path: &Path, entry: &T) -> Result<()> {
        let line = format!("{}\n", serde_json::to_string(entry)?);
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!(path = %path.display(), "Appended history entry");
        Ok(())
    }
}

/// Keep flow ids safe as file names.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl ExecutionSink for JsonlHistorySink {
    fn record_flow(&self, result: &FlowExecutionResult) -> BoxFuture<'_, Result<()>> {
        let path = self.flow_log_path(&result.flow_id);
        let result = result.clone();
        Box::pin(async move { self.append(&path, &result).await })
    }

    fn record_batch(&self, result: &BatchExecutionResult) -> BoxFuture<'_, Result<()>> {
        let path = self.batch_log_path();
        let result = result.clone();
        Box::pin(async move { self.append(&path, &result).await })
    }
}
