use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::config::EngineConfig;
use weft_core::{
    AgentDescriptor, AgentInvoker, Edge, EdgeId, EngineEvent, ErrorKind, EventBus, GraphNode,
    InvocationError, InvocationRequest, InvocationResponse, NodeId, NodeKind, NodeResult,
    NodeStatus, Provenance, Run, RunError, RunId, RunStatus, SchemaDescriptor, TransformRecord,
    TransformSpec,
};

use crate::matcher::{SchemaCache, SchemaMatcher};
use crate::merge::{merge, Contribution, Merged};
use crate::recorder::RunRecorder;
use crate::resolver::{ConfirmationPolicy, EdgeContext, TransformResolver};
use crate::validator::ValidatedGraph;

/// An agent call is attempted at most this many times.
const MAX_ATTEMPTS: u32 = 2;

/// Per-submission knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOptions {
    /// Allow the generative tier on every edge without asking.
    #[serde(default)]
    pub confirm_all_generative: bool,
    /// Edges pre-confirmed for the generative tier.
    #[serde(default)]
    pub confirmed_edges: HashSet<EdgeId>,
    /// Ask through the confirmation broker for edges not pre-confirmed.
    #[serde(default)]
    pub interactive: bool,
}

impl RunOptions {
    pub fn confirmation_policy(&self) -> ConfirmationPolicy {
        ConfirmationPolicy {
            confirm_all: self.confirm_all_generative,
            confirmed_edges: self.confirmed_edges.clone(),
            interactive: self.interactive,
        }
    }
}

/// What a node task hands back to the scheduler. `result` is `None` when the
/// node was interrupted by cancellation; its transforms are still reported.
struct NodeOutcome {
    node_id: NodeId,
    transforms: Vec<TransformRecord>,
    result: Option<NodeResult>,
}

struct NodeSuccess {
    output: Value,
    provenance: BTreeMap<String, Provenance>,
    cost: f64,
    attempts: u32,
}

/// Drives a validated graph to a terminal run.
///
/// The scheduler loop owns the outputs map, the ready set and the run record;
/// node tasks only compute and return their own result.
#[derive(Clone)]
pub struct Executor {
    matcher: Arc<SchemaMatcher>,
    cache: Arc<SchemaCache>,
    resolver: Arc<TransformResolver>,
    invoker: Arc<dyn AgentInvoker>,
    recorder: Arc<RunRecorder>,
    event_bus: Arc<EventBus>,
    config: EngineConfig,
}

impl Executor {
    pub fn new(
        matcher: Arc<SchemaMatcher>,
        cache: Arc<SchemaCache>,
        resolver: Arc<TransformResolver>,
        invoker: Arc<dyn AgentInvoker>,
        recorder: Arc<RunRecorder>,
        event_bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            matcher,
            cache,
            resolver,
            invoker,
            recorder,
            event_bus,
            config,
        }
    }

    pub async fn execute(
        &self,
        graph: Arc<ValidatedGraph>,
        run_id: RunId,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> Run {
        let mut run = Run::new(run_id, graph.chain().clone(), graph.catalog_version());
        run.status = RunStatus::Running;

        info!(run_id = %run.id, nodes = graph.len(), "Run started");
        self.event_bus.publish(EngineEvent::RunStarted {
            run_id: run.id.clone(),
            nodes: graph.len(),
        });

        if let Err(e) = self.recorder.begin(&run).await {
            run.error = Some(RunError::new(ErrorKind::Recorder, e.to_string()));
            run.status = RunStatus::Failed;
            run.completed_at = Some(Utc::now());
            self.publish_finished(&run);
            return run;
        }

        let policy = Arc::new(options.confirmation_policy());
        let max_parallel = self.config.max_parallel_nodes.max(1);

        let mut indegree: HashMap<NodeId, usize> = graph
            .order()
            .iter()
            .map(|id| (id.clone(), graph.predecessors(id).len()))
            .collect();
        let mut ready: BTreeSet<NodeId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| id.clone())
            .collect();
        let mut outputs: HashMap<NodeId, Value> = HashMap::new();
        let mut skipped: HashSet<NodeId> = HashSet::new();
        let mut settled = 0usize;
        let mut halted = false;
        let mut tasks: JoinSet<NodeOutcome> = JoinSet::new();

        loop {
            while !halted && !cancel.is_cancelled() && tasks.len() < max_parallel {
                let Some(node_id) = ready.pop_first() else { break };
                let upstream: Vec<(Edge, Value)> = graph
                    .incoming(&node_id)
                    .iter()
                    .filter_map(|e| outputs.get(&e.source).map(|v| (e.clone(), v.clone())))
                    .collect();
                debug!(run_id = %run.id, node_id = %node_id, "Scheduling node");
                tasks.spawn(self.clone().run_node(
                    graph.clone(),
                    run.id.clone(),
                    node_id,
                    upstream,
                    policy.clone(),
                    cancel.clone(),
                ));
            }

            let Some(joined) = tasks.join_next().await else { break };
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(run_id = %run.id, error = %e, "Node task aborted");
                    run.error.get_or_insert_with(|| {
                        RunError::new(ErrorKind::AgentInvocation, format!("node task aborted: {}", e))
                    });
                    halted = true;
                    continue;
                }
            };

            // Persist before any dependent can become eligible. Transforms of an
            // interrupted node are kept; their cost was already incurred.
            for record in outcome.transforms {
                if let Err(e) = self.recorder.transform(record.clone()).await {
                    run.error
                        .get_or_insert_with(|| RunError::new(ErrorKind::Recorder, e.to_string()));
                    halted = true;
                }
                run.total_cost += record.cost;
                run.transforms.push(record);
            }

            let Some(result) = outcome.result else {
                debug!(run_id = %run.id, node_id = %outcome.node_id, "Node cancelled in flight");
                continue;
            };

            if let Err(e) = self.recorder.node(&run.id, result.clone()).await {
                run.error.get_or_insert_with(|| {
                    RunError::new(ErrorKind::Recorder, e.to_string()).at_node(&result.node_id)
                });
                halted = true;
            }

            run.total_cost += result.cost;
            settled += 1;

            match result.status {
                NodeStatus::Succeeded => {
                    self.event_bus.publish(EngineEvent::NodeCompleted {
                        run_id: run.id.clone(),
                        node_id: result.node_id.clone(),
                        cost: result.cost,
                        duration_ms: result.duration_ms,
                    });
                    if let Some(ref output) = result.output {
                        outputs.insert(result.node_id.clone(), output.clone());
                    }
                    for succ in graph.successors(&result.node_id) {
                        if let Some(d) = indegree.get_mut(succ) {
                            *d = d.saturating_sub(1);
                            if *d == 0 && !skipped.contains(succ) {
                                ready.insert(succ.clone());
                            }
                        }
                    }
                }
                NodeStatus::Failed => {
                    let error = result.error.clone().unwrap_or_else(|| {
                        RunError::new(ErrorKind::AgentInvocation, "node failed")
                            .at_node(&result.node_id)
                    });
                    self.event_bus.publish(EngineEvent::NodeFailed {
                        run_id: run.id.clone(),
                        node_id: result.node_id.clone(),
                        error: error.clone(),
                    });
                    let critical = graph.node(&result.node_id).map_or(true, |n| n.critical);
                    if critical {
                        warn!(run_id = %run.id, node_id = %result.node_id, error = %error, "Critical node failed, halting run");
                        run.error.get_or_insert(error);
                        halted = true;
                    } else {
                        let newly = skip_descendants(&graph, &result.node_id, &mut skipped);
                        warn!(
                            run_id = %run.id,
                            node_id = %result.node_id,
                            skipped = newly,
                            "Non-critical node failed, skipping descendants"
                        );
                        settled += newly;
                    }
                }
            }

            run.node_results.push(result);
        }

        if run.error.is_none() && cancel.is_cancelled() && settled < graph.len() {
            run.error = Some(RunError::new(ErrorKind::Cancelled, "run cancelled"));
        }
        run.status = if run.error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        run.completed_at = Some(Utc::now());

        if let Err(e) = self.recorder.finish(run.clone()).await {
            run.status = RunStatus::Failed;
            run.error
                .get_or_insert_with(|| RunError::new(ErrorKind::Recorder, e.to_string()));
        }

        self.publish_finished(&run);
        run
    }

    fn publish_finished(&self, run: &Run) {
        info!(
            run_id = %run.id,
            status = %run.status,
            total_cost = run.total_cost,
            nodes_recorded = run.node_results.len(),
            "Run finished"
        );
        self.event_bus.publish(EngineEvent::RunFinished {
            run_id: run.id.clone(),
            status: run.status,
            total_cost: run.total_cost,
        });
    }

    async fn run_node(
        self,
        graph: Arc<ValidatedGraph>,
        run_id: RunId,
        node_id: NodeId,
        upstream: Vec<(Edge, Value)>,
        policy: Arc<ConfirmationPolicy>,
        cancel: CancellationToken,
    ) -> NodeOutcome {
        if cancel.is_cancelled() {
            return NodeOutcome {
                node_id,
                transforms: vec![],
                result: None,
            };
        }

        self.event_bus.publish(EngineEvent::NodeStarted {
            run_id: run_id.clone(),
            node_id: node_id.clone(),
        });

        self.node_body(&graph, &run_id, &node_id, &upstream, &policy, &cancel)
            .await
    }

    async fn node_body(
        &self,
        graph: &ValidatedGraph,
        run_id: &RunId,
        node_id: &str,
        upstream: &[(Edge, Value)],
        policy: &ConfirmationPolicy,
        cancel: &CancellationToken,
    ) -> NodeOutcome {
        let started = Instant::now();
        let mut transforms = Vec::new();

        let Some(node) = graph.node(node_id) else {
            let error = RunError::new(ErrorKind::Validation, "node missing from validated graph")
                .at_node(node_id);
            return NodeOutcome {
                node_id: node_id.to_string(),
                transforms,
                result: Some(failed_result(node_id, Value::Null, error, 0, started, None)),
            };
        };

        let trust = graph.agent(node_id).map(|a| a.trust);
        let (input, outcome) = match &node.kind {
            NodeKind::Input { value } => (value.clone(), Ok(literal_output(value))),
            NodeKind::Agent { parameters, .. } => {
                self.agent_node(graph, run_id, node, parameters, upstream, policy, cancel, &mut transforms)
                    .await
            }
            NodeKind::Transform { method, .. } => {
                self.transform_node(graph, run_id, node, method, upstream, policy, cancel, &mut transforms)
                    .await
            }
        };

        let result = match outcome {
            // Interrupted, not failed: the run carries the cancellation
            Err(_) if cancel.is_cancelled() => None,
            Ok(success) => Some(NodeResult {
                node_id: node_id.to_string(),
                status: NodeStatus::Succeeded,
                input,
                output: Some(success.output),
                provenance: success.provenance,
                cost: success.cost,
                duration_ms: started.elapsed().as_millis() as u64,
                attempts: success.attempts,
                error: None,
                trust,
                recorded_at: Utc::now(),
            }),
            Err((error, attempts)) => {
                warn!(run_id = %run_id, node_id, error = %error, "Node failed");
                Some(failed_result(node_id, input, error, attempts, started, trust))
            }
        };

        NodeOutcome {
            node_id: node_id.to_string(),
            transforms,
            result,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn agent_node(
        &self,
        graph: &ValidatedGraph,
        run_id: &RunId,
        node: &GraphNode,
        parameters: &Map<String, Value>,
        upstream: &[(Edge, Value)],
        policy: &ConfirmationPolicy,
        cancel: &CancellationToken,
        transforms: &mut Vec<TransformRecord>,
    ) -> (Value, Result<NodeSuccess, (RunError, u32)>) {
        let Some(agent) = graph.agent(&node.id) else {
            let error = RunError::new(ErrorKind::Validation, "agent missing from catalog snapshot")
                .at_node(&node.id);
            return (Value::Null, Err((error, 0)));
        };
        let schema = &agent.input_schema;

        let mut merged = match self
            .assemble(graph, run_id, node, schema, &TransformSpec::Auto, parameters, upstream, policy, cancel, transforms)
            .await
        {
            Ok(m) => m,
            Err(e) => return (upstream_snapshot(upstream), Err((e, 0))),
        };
        for (name, value) in parameters {
            merged.fill(name, value, Provenance::Parameter);
        }
        fill_defaults(&mut merged, schema);

        let input = Value::Object(merged.fields.clone());
        if let Err(e) = check_required(&merged, schema, &node.id) {
            return (input, Err((e, 0)));
        }

        let invocation = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = self.invoke_agent(run_id, &node.id, agent, input.clone()) => Some(outcome),
        };
        let Some((response, attempts)) = invocation else {
            let error = RunError::new(ErrorKind::Cancelled, "run cancelled").at_node(&node.id);
            return (input, Err((error, 0)));
        };
        match response {
            Ok(output) => (
                input,
                Ok(NodeSuccess {
                    output,
                    provenance: merged.provenance,
                    cost: agent.price,
                    attempts,
                }),
            ),
            Err(e) => {
                let error = RunError::new(ErrorKind::AgentInvocation, e.to_string()).at_node(&node.id);
                (input, Err((error, attempts)))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn transform_node(
        &self,
        graph: &ValidatedGraph,
        run_id: &RunId,
        node: &GraphNode,
        method: &TransformSpec,
        upstream: &[(Edge, Value)],
        policy: &ConfirmationPolicy,
        cancel: &CancellationToken,
        transforms: &mut Vec<TransformRecord>,
    ) -> (Value, Result<NodeSuccess, (RunError, u32)>) {
        let input = upstream_snapshot(upstream);
        let empty = SchemaDescriptor::new();
        let schema = graph.output_schema(&node.id).unwrap_or(&empty);

        let mut merged = match self
            .assemble(graph, run_id, node, schema, method, &Map::new(), upstream, policy, cancel, transforms)
            .await
        {
            Ok(m) => m,
            Err(e) => return (input, Err((e, 0))),
        };
        fill_defaults(&mut merged, schema);
        if let Err(e) = check_required(&merged, schema, &node.id) {
            return (input, Err((e, 0)));
        }

        (
            input,
            Ok(NodeSuccess {
                output: Value::Object(merged.fields),
                provenance: merged.provenance,
                cost: 0.0,
                attempts: 0,
            }),
        )
    }

    /// Score, transform and merge every incoming edge of `node` against `target`.
    #[allow(clippy::too_many_arguments)]
    async fn assemble(
        &self,
        graph: &ValidatedGraph,
        run_id: &RunId,
        node: &GraphNode,
        target: &SchemaDescriptor,
        method: &TransformSpec,
        parameters: &Map<String, Value>,
        upstream: &[(Edge, Value)],
        policy: &ConfirmationPolicy,
        cancel: &CancellationToken,
        transforms: &mut Vec<TransformRecord>,
    ) -> Result<Merged, RunError> {
        let sources: Vec<SchemaDescriptor> = upstream
            .iter()
            .map(|(edge, value)| source_schema(graph, &edge.source, value))
            .collect();
        let target_agent_id = node
            .agent_id()
            .map(str::to_string)
            .or_else(|| first_successor_agent(graph, &node.id));

        let mut contributions = Vec::with_capacity(upstream.len());
        for (i, (edge, value)) in upstream.iter().enumerate() {
            // Fields only a parameter or another edge can supply are not this edge's concern
            let elsewhere: BTreeSet<&str> = target
                .fields()
                .iter()
                .filter(|(name, spec)| {
                    !self.matcher.supplies(&sources[i], name, spec)
                        && (parameters.contains_key(name.as_str())
                            || sources
                                .iter()
                                .enumerate()
                                .any(|(j, s)| j != i && self.matcher.supplies(s, name, spec)))
                })
                .map(|(name, _)| name.as_str())
                .collect();
            let edge_target = target.retain(|name| !elsewhere.contains(name));

            let compat = self.cache.score(&self.matcher, &sources[i], &edge_target);
            let ctx = EdgeContext {
                run_id: run_id.clone(),
                edge_id: edge.id(),
                node_id: node.id.clone(),
                source_agent_id: graph
                    .node(&edge.source)
                    .and_then(|n| n.agent_id())
                    .map(str::to_string),
                target_agent_id: target_agent_id.clone(),
                target_schema: edge_target,
                method: method.clone(),
                cancel: cancel.clone(),
            };

            let outcome = self.resolver.resolve(&ctx, &compat, value, policy).await;
            self.event_bus.publish(EngineEvent::TransformApplied {
                run_id: run_id.clone(),
                edge_id: ctx.edge_id.clone(),
                method: outcome.method(),
                succeeded: outcome.record.succeeded,
                cost: outcome.record.cost,
            });
            let method_used = outcome.method();
            transforms.push(outcome.record);

            match outcome.result {
                Ok(fields) => contributions.push(Contribution {
                    node_id: edge.source.clone(),
                    edge_id: ctx.edge_id,
                    priority: edge.priority,
                    method: method_used,
                    fields,
                }),
                Err(e) => {
                    return Err(RunError::new(ErrorKind::Compatibility, e.to_string())
                        .at_node(&node.id)
                        .at_edge(ctx.edge_id));
                }
            }
        }

        merge(graph.merge_policy(&node.id), contributions).map_err(|conflict| {
            RunError::new(ErrorKind::MergeConflict, conflict.to_string()).at_node(&node.id)
        })
    }

    /// Call an agent with a per-attempt timeout; one retry on transient failure.
    async fn invoke_agent(
        &self,
        run_id: &RunId,
        node_id: &str,
        agent: &AgentDescriptor,
        payload: Value,
    ) -> (Result<Value, InvocationError>, u32) {
        let timeout_ms = self.config.agent_timeout_secs.saturating_mul(1000);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = InvocationRequest {
                agent_id: agent.id.clone(),
                endpoint: agent.endpoint.clone(),
                payload: payload.clone(),
                signing_secret: agent.signing_secret.clone(),
                timeout_ms,
            };

            let result = match tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                self.invoker.invoke(request),
            )
            .await
            {
                Ok(response) => response.and_then(parse_response),
                Err(_) => Err(InvocationError::Timeout { after_ms: timeout_ms }),
            };

            match result {
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    let backoff = retry_backoff(self.config.retry_backoff_ms);
                    warn!(
                        run_id = %run_id,
                        node_id,
                        agent_id = %agent.id,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Transient agent failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                other => return (other, attempt),
            }
        }
    }
}

/// Jittered delay: 0.8x to 1.2x of the configured base.
fn retry_backoff(base_ms: u64) -> Duration {
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((base_ms as f64 * jitter) as u64)
}

/// Non-2xx and non-JSON bodies are failures; non-object JSON is wrapped as `value`.
fn parse_response(response: InvocationResponse) -> Result<Value, InvocationError> {
    if !(200..300).contains(&response.status) {
        return Err(InvocationError::Status {
            status: response.status,
            body: truncate(&response.body, 500),
        });
    }
    let value: Value = serde_json::from_str(&response.body)
        .map_err(|e| InvocationError::MalformedBody(e.to_string()))?;
    Ok(match value {
        Value::Object(_) => value,
        other => {
            let mut wrapped = Map::new();
            wrapped.insert("value".into(), other);
            Value::Object(wrapped)
        }
    })
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Input literals: objects pass through, anything else becomes `{"text": value}`.
fn literal_output(value: &Value) -> NodeSuccess {
    let output = match value {
        Value::Object(_) => value.clone(),
        Value::Null => Value::Object(Map::new()),
        other => {
            let mut wrapped = Map::new();
            wrapped.insert("text".into(), other.clone());
            Value::Object(wrapped)
        }
    };
    let provenance = output
        .as_object()
        .map(|o| o.keys().map(|k| (k.clone(), Provenance::Literal)).collect())
        .unwrap_or_default();
    NodeSuccess {
        output,
        provenance,
        cost: 0.0,
        attempts: 0,
    }
}

/// Declared output schema of the source node, or the shape of its actual value.
fn source_schema(graph: &ValidatedGraph, source: &str, value: &Value) -> SchemaDescriptor {
    match graph.output_schema(source) {
        Some(schema) if !schema.is_empty() => schema.clone(),
        _ => SchemaDescriptor::infer(value),
    }
}

fn first_successor_agent(graph: &ValidatedGraph, node_id: &str) -> Option<String> {
    graph
        .successors(node_id)
        .iter()
        .filter_map(|s| graph.node(s))
        .find_map(|n| n.agent_id().map(str::to_string))
}

fn upstream_snapshot(upstream: &[(Edge, Value)]) -> Value {
    match upstream {
        [(_, value)] => value.clone(),
        many => Value::Object(
            many.iter()
                .map(|(edge, value)| (edge.source.clone(), value.clone()))
                .collect(),
        ),
    }
}

fn fill_defaults(merged: &mut Merged, schema: &SchemaDescriptor) {
    for (name, spec) in schema.fields() {
        if let Some(ref default) = spec.default {
            merged.fill(name, default, Provenance::Default);
        }
    }
}

fn check_required(merged: &Merged, schema: &SchemaDescriptor, node_id: &str) -> Result<(), RunError> {
    let missing: Vec<&str> = schema
        .required_fields()
        .filter(|(name, _)| merged.fields.get(*name).map_or(true, Value::is_null))
        .map(|(name, _)| name.as_str())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(RunError::new(
            ErrorKind::Compatibility,
            format!("missing required input fields: {}", missing.join(", ")),
        )
        .at_node(node_id))
    }
}

fn failed_result(
    node_id: &str,
    input: Value,
    error: RunError,
    attempts: u32,
    started: Instant,
    trust: Option<weft_core::TrustTier>,
) -> NodeResult {
    NodeResult {
        node_id: node_id.to_string(),
        status: NodeStatus::Failed,
        input,
        output: None,
        provenance: BTreeMap::new(),
        cost: 0.0,
        duration_ms: started.elapsed().as_millis() as u64,
        attempts,
        error: Some(error),
        trust,
        recorded_at: Utc::now(),
    }
}

/// Mark every not-yet-skipped descendant of `node_id`. Returns how many were added.
fn skip_descendants(graph: &ValidatedGraph, node_id: &str, skipped: &mut HashSet<NodeId>) -> usize {
    let mut added = 0;
    let mut queue: VecDeque<&str> = graph.successors(node_id).iter().map(String::as_str).collect();
    while let Some(id) = queue.pop_front() {
        if skipped.insert(id.to_string()) {
            added += 1;
            queue.extend(graph.successors(id).iter().map(String::as_str));
        }
    }
    added
}
