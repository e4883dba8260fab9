use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, error};

use weft_core::{
    NodeResult, Result, Run, RunId, RunSink, RunSummary, TransformRecord, WeftError,
};

/// Append-only writer in front of a [`RunSink`].
///
/// The executor awaits every call before it lets dependents run.
pub struct RunRecorder {
    sink: Arc<dyn RunSink>,
}

impl RunRecorder {
    pub fn new(sink: Arc<dyn RunSink>) -> Self {
        Self { sink }
    }

    pub async fn begin(&self, run: &Run) -> Result<()> {
        self.sink.begin_run(run.clone()).await.inspect_err(|e| {
            error!(run_id = %run.id, error = %e, "Failed to record run start");
        })
    }

    pub async fn transform(&self, record: TransformRecord) -> Result<()> {
        let run_id = record.run_id.clone();
        let edge_id = record.edge_id.clone();
        self.sink.record_transform(record).await.inspect_err(|e| {
            error!(run_id = %run_id, edge_id = %edge_id, error = %e, "Failed to record transform");
        })
    }

    pub async fn node(&self, run_id: &RunId, result: NodeResult) -> Result<()> {
        let node_id = result.node_id.clone();
        self.sink
            .record_node(run_id.clone(), result)
            .await
            .inspect(|_| debug!(run_id = %run_id, node_id = %node_id, "Node result recorded"))
            .inspect_err(|e| {
                error!(run_id = %run_id, node_id = %node_id, error = %e, "Failed to record node result");
            })
    }

    pub async fn finish(&self, run: Run) -> Result<()> {
        let run_id = run.id.clone();
        self.sink.finish_run(run).await.inspect_err(|e| {
            error!(run_id = %run_id, error = %e, "Failed to seal run");
        })
    }

    pub async fn load(&self, run_id: &RunId) -> Result<Option<Run>> {
        self.sink.load_run(run_id.clone()).await
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<RunSummary>> {
        self.sink.list_runs(limit).await
    }
}

/// Keeps runs in process memory.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<RunId, Run>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn open_run<'a>(runs: &'a mut HashMap<RunId, Run>, run_id: &RunId) -> Result<&'a mut Run> {
    let run = runs
        .get_mut(run_id)
        .ok_or_else(|| WeftError::RunNotFound(run_id.to_string()))?;
    if run.status.is_terminal() {
        return Err(WeftError::RunSealed(run_id.to_string()));
    }
    Ok(run)
}

impl RunSink for MemoryRunStore {
    fn begin_run(&self, run: Run) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut runs = self.runs.lock().await;
            if let Some(existing) = runs.get(&run.id) {
                if existing.status.is_terminal() {
                    return Err(WeftError::RunSealed(run.id.to_string()));
                }
            }
            let mut stored = run;
            stored.node_results.clear();
            stored.transforms.clear();
            stored.total_cost = 0.0;
            runs.insert(stored.id.clone(), stored);
            Ok(())
        })
    }

    fn record_transform(&self, record: TransformRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut runs = self.runs.lock().await;
            let run = open_run(&mut runs, &record.run_id)?;
            run.total_cost += record.cost;
            run.transforms.push(record);
            Ok(())
        })
    }

    fn record_node(&self, run_id: RunId, result: NodeResult) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut runs = self.runs.lock().await;
            let run = open_run(&mut runs, &run_id)?;
            if run.node_result(&result.node_id).is_some() {
                return Err(WeftError::DuplicateNodeResult {
                    run_id: run_id.to_string(),
                    node_id: result.node_id,
                });
            }
            run.total_cost += result.cost;
            run.node_results.push(result);
            Ok(())
        })
    }

    fn finish_run(&self, run: Run) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut runs = self.runs.lock().await;
            let stored = open_run(&mut runs, &run.id)?;
            stored.status = run.status;
            stored.completed_at = run.completed_at;
            stored.error = run.error;
            Ok(())
        })
    }

    fn load_run(&self, run_id: RunId) -> BoxFuture<'_, Result<Option<Run>>> {
        Box::pin(async move { Ok(self.runs.lock().await.get(&run_id).cloned()) })
    }

    fn list_runs(&self, limit: usize) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        Box::pin(async move {
            let runs = self.runs.lock().await;
            let mut summaries: Vec<RunSummary> = runs.values().map(Run::summary).collect();
            summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            summaries.truncate(limit);
            Ok(summaries)
        })
    }
}
