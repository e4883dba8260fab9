use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::catalog::TrustTier;
use crate::chain::{ChainDefinition, EdgeId, NodeId};
use crate::mapping::FieldMapping;
use crate::schema::SchemaDescriptor;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    Failed,
}

/// Compatibility band of an edge, or the method a transform ended up using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Direct,
    Deterministic,
    Assisted,
    Generative,
    Incompatible,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Deterministic => "deterministic",
            Self::Assisted => "assisted",
            Self::Generative => "generative",
            Self::Incompatible => "incompatible",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of scoring one schema against another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityResult {
    pub score: f64,
    pub mapping: FieldMapping,
    pub classification: Classification,
    #[serde(default)]
    pub unmatched_required: Vec<String>,
    #[serde(default)]
    pub unmatched_optional: Vec<String>,
}

/// Where one field of a node's effective input came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Provenance {
    Upstream {
        node_id: NodeId,
        edge_id: EdgeId,
        method: Classification,
    },
    Parameter,
    Default,
    Literal,
}

/// One applied (or failed) transform on an edge. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRecord {
    pub id: String,
    pub run_id: RunId,
    pub edge_id: EdgeId,
    /// The node whose input this transform produced.
    pub node_id: NodeId,
    pub method: Classification,
    #[serde(default)]
    pub escalations: Vec<Classification>,
    pub input: Value,
    pub output: Option<Value>,
    pub confidence: f64,
    pub cost: f64,
    pub duration_ms: u64,
    pub succeeded: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Compatibility,
    AgentInvocation,
    MergeConflict,
    Cancelled,
    Recorder,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Compatibility => "compatibility",
            Self::AgentInvocation => "agent_invocation",
            Self::MergeConflict => "merge_conflict",
            Self::Cancelled => "cancelled",
            Self::Recorder => "recorder",
        };
        f.write_str(s)
    }
}

/// Serializable error attached to a run or node result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<EdgeId>,
}

impl RunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            node_id: None,
            edge_id: None,
        }
    }

    pub fn at_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn at_edge(mut self, edge_id: impl Into<String>) -> Self {
        self.edge_id = Some(edge_id.into());
        self
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(ref node) = self.node_id {
            write!(f, " (node {})", node)?;
        }
        if let Some(ref edge) = self.edge_id {
            write!(f, " (edge {})", edge)?;
        }
        Ok(())
    }
}

/// Recorded outcome of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub input: Value,
    pub output: Option<Value>,
    #[serde(default)]
    pub provenance: BTreeMap<String, Provenance>,
    pub cost: f64,
    pub duration_ms: u64,
    pub attempts: u32,
    #[serde(default)]
    pub error: Option<RunError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust: Option<TrustTier>,
    pub recorded_at: DateTime<Utc>,
}

/// A chain execution and everything that happened in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub chain: ChainDefinition,
    pub catalog_version: String,
    pub status: RunStatus,
    #[serde(default)]
    pub node_results: Vec<NodeResult>,
    #[serde(default)]
    pub transforms: Vec<TransformRecord>,
    pub total_cost: f64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<RunError>,
}

impl Run {
    pub fn new(id: RunId, chain: ChainDefinition, catalog_version: impl Into<String>) -> Self {
        Self {
            id,
            chain,
            catalog_version: catalog_version.into(),
            status: RunStatus::Pending,
            node_results: vec![],
            transforms: vec![],
            total_cost: 0.0,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn node_result(&self, node_id: &str) -> Option<&NodeResult> {
        self.node_results.iter().find(|r| r.node_id == node_id)
    }

    pub fn transforms_for(&self, node_id: &str) -> impl Iterator<Item = &TransformRecord> {
        let node_id = node_id.to_string();
        self.transforms.iter().filter(move |t| t.node_id == node_id)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id.clone(),
            chain_id: self.chain.id.clone(),
            status: self.status,
            total_cost: self.total_cost,
            nodes_recorded: self.node_results.len(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
        }
    }
}

/// Listing row for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: RunId,
    pub chain_id: Option<String>,
    pub status: RunStatus,
    pub total_cost: f64,
    pub nodes_recorded: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<RunError>,
}

/// A pending request for permission to run a generative transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub id: String,
    pub run_id: RunId,
    pub edge_id: EdgeId,
    pub node_id: NodeId,
    pub score: f64,
    pub estimated_cost: f64,
    pub unmatched_required: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ConfirmationDecision {
    Approved,
    Denied { reason: String },
}

/// Events published on the engine's bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStarted {
        run_id: RunId,
        nodes: usize,
    },
    NodeStarted {
        run_id: RunId,
        node_id: NodeId,
    },
    NodeCompleted {
        run_id: RunId,
        node_id: NodeId,
        cost: f64,
        duration_ms: u64,
    },
    NodeFailed {
        run_id: RunId,
        node_id: NodeId,
        error: RunError,
    },
    TransformApplied {
        run_id: RunId,
        edge_id: EdgeId,
        method: Classification,
        succeeded: bool,
        cost: f64,
    },
    ConfirmationRequested {
        request: ConfirmationRequest,
    },
    ConfirmationResolved {
        request_id: String,
        decision: ConfirmationDecision,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
        total_cost: f64,
    },
}

impl EngineEvent {
    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeCompleted { run_id, .. }
            | Self::NodeFailed { run_id, .. }
            | Self::TransformApplied { run_id, .. }
            | Self::RunFinished { run_id, .. } => Some(run_id),
            Self::ConfirmationRequested { request } => Some(&request.run_id),
            Self::ConfirmationResolved { .. } => None,
        }
    }
}

/// One call to a remote agent.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub agent_id: String,
    pub endpoint: String,
    pub payload: Value,
    pub signing_secret: Option<String>,
    pub timeout_ms: u64,
}

/// Raw response; the engine decides what counts as success.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResponse {
    pub status: u16,
    pub body: String,
}

/// Input to the generative collaborator.
#[derive(Debug, Clone)]
pub struct GenerativeRequest {
    pub template: Option<String>,
    pub upstream: Map<String, Value>,
    pub target_schema: SchemaDescriptor,
    pub max_tokens: u32,
    pub max_output_bytes: usize,
}

/// A stored, previously accepted mapping between two agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub source_agent_id: String,
    pub target_agent_id: String,
    pub mapping: FieldMapping,
    pub confidence: f64,
    pub accepted_at: DateTime<Utc>,
}
