use futures::future::BoxFuture;
use serde_json::Value;

use crate::catalog::CatalogSnapshot;
use crate::error::{InvocationError, Result};
use crate::types::*;

/// Calls a remote agent.
pub trait AgentInvoker: Send + Sync + 'static {
    fn invoke(
        &self,
        request: InvocationRequest,
    ) -> BoxFuture<'_, std::result::Result<InvocationResponse, InvocationError>>;
}

/// Produces a target-shaped object from upstream values. Output is untrusted.
pub trait GenerativeTransformer: Send + Sync + 'static {
    fn generate(&self, request: GenerativeRequest) -> BoxFuture<'_, Result<Value>>;
}

/// Read side of the stored recipe collection.
pub trait RecipeStore: Send + Sync + 'static {
    fn lookup(
        &self,
        source_agent_id: String,
        target_agent_id: String,
    ) -> BoxFuture<'_, Result<Vec<Recipe>>>;
}

/// Source of catalog snapshots, pulled once per submission.
pub trait CatalogSource: Send + Sync + 'static {
    fn snapshot(&self) -> BoxFuture<'_, Result<CatalogSnapshot>>;
}

/// Append-only persistence for runs.
///
/// Implementations must reject writes to a run whose status is terminal and
/// must keep at most one result per (run, node).
pub trait RunSink: Send + Sync + 'static {
    fn begin_run(&self, run: Run) -> BoxFuture<'_, Result<()>>;

    fn record_transform(&self, record: TransformRecord) -> BoxFuture<'_, Result<()>>;

    fn record_node(&self, run_id: RunId, result: NodeResult) -> BoxFuture<'_, Result<()>>;

    /// Seal the run with its terminal status.
    fn finish_run(&self, run: Run) -> BoxFuture<'_, Result<()>>;

    fn load_run(&self, run_id: RunId) -> BoxFuture<'_, Result<Option<Run>>>;

    fn list_runs(&self, limit: usize) -> BoxFuture<'_, Result<Vec<RunSummary>>>;
}
