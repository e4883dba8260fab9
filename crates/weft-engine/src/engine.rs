use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weft_core::{
    AgentInvoker, CatalogSource, ChainDefinition, CompatibilityResult, ErrorKind, EventBus,
    GenerativeTransformer, RecipeStore, Result, Run, RunError, RunId, RunSink, RunStatus,
    RunSummary, SchemaDescriptor, WeftConfig, WeftError,
};

use crate::confirmation::ConfirmationBroker;
use crate::executor::{Executor, RunOptions};
use crate::matcher::{SchemaCache, SchemaMatcher};
use crate::recorder::{MemoryRunStore, RunRecorder};
use crate::resolver::TransformResolver;
use crate::run_log::RunLogger;
use crate::validator::{self, ValidatedGraph, ValidationError};

/// Assembles an [`Engine`] from its collaborators.
///
/// A catalog and an agent invoker are required. Runs default to the
/// in-memory store; recipes and the generative collaborator are optional.
pub struct EngineBuilder {
    config: WeftConfig,
    catalog: Option<Arc<dyn CatalogSource>>,
    invoker: Option<Arc<dyn AgentInvoker>>,
    sink: Option<Arc<dyn RunSink>>,
    recipes: Option<Arc<dyn RecipeStore>>,
    generator: Option<Arc<dyn GenerativeTransformer>>,
    event_bus: Option<Arc<EventBus>>,
    run_logs: Option<(PathBuf, u8)>,
}

impl EngineBuilder {
    pub fn new(config: WeftConfig) -> Self {
        Self {
            config,
            catalog: None,
            invoker: None,
            sink: None,
            recipes: None,
            generator: None,
            event_bus: None,
            run_logs: None,
        }
    }

    pub fn catalog(mut self, catalog: Arc<dyn CatalogSource>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn invoker(mut self, invoker: Arc<dyn AgentInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn RunSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn recipes(mut self, recipes: Arc<dyn RecipeStore>) -> Self {
        self.recipes = Some(recipes);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn GenerativeTransformer>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Write a JSONL log per run under `log_dir`.
    pub fn run_logs(mut self, log_dir: PathBuf, level: u8) -> Self {
        self.run_logs = Some((log_dir, level));
        self
    }

    pub fn build(self) -> Result<Engine> {
        let catalog = self
            .catalog
            .ok_or_else(|| WeftError::Config("engine needs a catalog source".into()))?;
        let invoker = self
            .invoker
            .ok_or_else(|| WeftError::Config("engine needs an agent invoker".into()))?;
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(MemoryRunStore::new()) as Arc<dyn RunSink>);
        let event_bus = self.event_bus.unwrap_or_default();

        let config = self.config;
        let matcher = Arc::new(SchemaMatcher::new(config.matcher.clone(), config.thresholds));
        let broker = Arc::new(ConfirmationBroker::new(event_bus.clone()));
        let resolver = Arc::new(TransformResolver::new(
            config.pricing.clone(),
            config.generative.clone(),
            self.recipes,
            self.generator,
            broker.clone(),
        ));
        let recorder = Arc::new(RunRecorder::new(sink));
        let executor = Executor::new(
            matcher.clone(),
            Arc::new(SchemaCache::new()),
            resolver.clone(),
            invoker,
            recorder.clone(),
            event_bus.clone(),
            config.engine.clone(),
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                config,
                catalog,
                matcher,
                resolver,
                recorder,
                executor,
                broker,
                event_bus,
                run_logs: self.run_logs,
                active: Mutex::new(HashMap::new()),
            }),
        })
    }
}

struct EngineInner {
    config: WeftConfig,
    catalog: Arc<dyn CatalogSource>,
    matcher: Arc<SchemaMatcher>,
    resolver: Arc<TransformResolver>,
    recorder: Arc<RunRecorder>,
    executor: Executor,
    broker: Arc<ConfirmationBroker>,
    event_bus: Arc<EventBus>,
    run_logs: Option<(PathBuf, u8)>,
    active: Mutex<HashMap<RunId, CancellationToken>>,
}

/// Submission surface: validate, execute, observe and cancel chains.
///
/// Cheap to clone; clones share the same stores, broker and event bus.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(config: WeftConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &WeftConfig {
        &self.inner.config
    }

    pub fn broker(&self) -> Arc<ConfirmationBroker> {
        self.inner.broker.clone()
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.inner.event_bus.clone()
    }

    /// Validate a chain against a fresh catalog snapshot.
    pub async fn validate(
        &self,
        chain: &ChainDefinition,
    ) -> std::result::Result<ValidatedGraph, ValidationError> {
        let snapshot = self
            .inner
            .catalog
            .snapshot()
            .await
            .map_err(|e| ValidationError::Catalog(e.to_string()))?;
        validator::validate(
            chain,
            &snapshot,
            &self.inner.matcher,
            self.inner.resolver.generative_enabled(),
        )
    }

    /// Score how well `source` satisfies `target`.
    pub fn score(&self, source: &SchemaDescriptor, target: &SchemaDescriptor) -> CompatibilityResult {
        self.inner.matcher.score(source, target)
    }

    /// Run a chain to completion. Failures are reported inside the returned run.
    pub async fn execute(&self, chain: ChainDefinition, options: RunOptions) -> Run {
        let run_id = RunId::new();
        let cancel = self.register(&run_id).await;
        let run = self.drive(run_id.clone(), chain, options, cancel).await;
        self.release(&run_id).await;
        run
    }

    /// Start a chain in the background and return its id immediately.
    pub async fn submit(&self, chain: ChainDefinition, options: RunOptions) -> RunId {
        let run_id = RunId::new();
        let cancel = self.register(&run_id).await;
        let engine = self.clone();
        let id = run_id.clone();
        tokio::spawn(async move {
            engine.drive(id.clone(), chain, options, cancel).await;
            engine.release(&id).await;
        });
        run_id
    }

    /// Cancel an in-flight run. Returns false if it is not running here.
    pub async fn cancel(&self, run_id: &RunId) -> bool {
        let Some(token) = self.inner.active.lock().await.get(run_id).cloned() else {
            return false;
        };
        info!(run_id = %run_id, "Cancelling run");
        token.cancel();
        let dropped = self.inner.broker.discard_run(run_id).await;
        if dropped > 0 {
            debug!(run_id = %run_id, dropped, "Dropped pending confirmations");
        }
        true
    }

    /// Forget a finished run; nothing of it stays pending.
    async fn release(&self, run_id: &RunId) {
        self.inner.active.lock().await.remove(run_id);
        self.inner.broker.discard_run(run_id).await;
    }

    pub async fn is_active(&self, run_id: &RunId) -> bool {
        self.inner.active.lock().await.contains_key(run_id)
    }

    pub async fn load_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        self.inner.recorder.load(run_id).await
    }

    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        self.inner.recorder.list(limit).await
    }

    async fn register(&self, run_id: &RunId) -> CancellationToken {
        let token = CancellationToken::new();
        self.inner
            .active
            .lock()
            .await
            .insert(run_id.clone(), token.clone());
        token
    }

    async fn drive(
        &self,
        run_id: RunId,
        chain: ChainDefinition,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Run {
        // Subscribe before anything is published for this run
        let log_task = self.inner.run_logs.as_ref().map(|(dir, level)| {
            let rx = self.inner.event_bus.subscribe();
            tokio::spawn(RunLogger::new(dir.clone(), *level).run(
                rx,
                run_id.clone(),
                cancel.child_token(),
            ))
        });

        let run = match self.validate(&chain).await {
            Ok(graph) => {
                self.inner
                    .executor
                    .execute(Arc::new(graph), run_id, &options, cancel)
                    .await
            }
            Err(e) => self.reject(run_id, chain, e).await,
        };

        if let Some(handle) = log_task {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!(run_id = %run.id, "Run log did not finish in time");
            }
        }
        run
    }

    /// Record a chain that failed validation as a failed run with no node results.
    async fn reject(&self, run_id: RunId, chain: ChainDefinition, err: ValidationError) -> Run {
        warn!(run_id = %run_id, error = %err, "Chain rejected");

        let mut error = RunError::new(ErrorKind::Validation, err.to_string());
        error.node_id = err.node_id().map(str::to_string);
        error.edge_id = err.edge_id().map(str::to_string);

        let mut run = Run::new(run_id, chain, "");
        if let Ok(snapshot) = self.inner.catalog.snapshot().await {
            run.catalog_version = snapshot.version;
        }
        run.status = RunStatus::Running;
        if let Err(e) = self.inner.recorder.begin(&run).await {
            warn!(run_id = %run.id, error = %e, "Could not persist rejected run");
        }
        run.status = RunStatus::Failed;
        run.error = Some(error);
        run.completed_at = Some(Utc::now());
        if let Err(e) = self.inner.recorder.finish(run.clone()).await {
            warn!(run_id = %run.id, error = %e, "Could not seal rejected run");
        }

        self.inner.event_bus.publish(weft_core::EngineEvent::RunFinished {
            run_id: run.id.clone(),
            status: run.status,
            total_cost: 0.0,
        });
        run
    }
}
