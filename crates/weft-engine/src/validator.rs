//! Structural and schema-level checks run before any node executes.
//!
//! Checks run in a fixed order and stop at the first failure; the validator
//! never repairs a graph.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use thiserror::Error;

use weft_core::{
    AgentDescriptor, CatalogSnapshot, ChainDefinition, Edge, EdgeId, GraphNode, MergePolicy,
    NodeId, NodeKind, SchemaDescriptor, TransformSpec,
};

use crate::matcher::SchemaMatcher;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("chain has no nodes")]
    EmptyChain,

    #[error("duplicate node id '{0}'")]
    DuplicateNode(NodeId),

    #[error("duplicate edge id '{0}'")]
    DuplicateEdge(EdgeId),

    #[error("edge '{edge_id}' connects node '{node_id}' to itself")]
    SelfLoop { edge_id: EdgeId, node_id: NodeId },

    #[error("edge '{edge_id}' references unknown node '{node_id}'")]
    DanglingEdge { edge_id: EdgeId, node_id: NodeId },

    #[error("node '{node_id}' references unknown agent '{agent_id}'")]
    UnknownAgent { node_id: NodeId, agent_id: String },

    #[error("cycle detected through node '{0}'")]
    Cycle(NodeId),

    #[error("input node '{0}' cannot have incoming edges")]
    InputHasIncoming(NodeId),

    #[error("node '{0}' is not reachable from any input node")]
    Unreachable(NodeId),

    #[error("node '{0}' has several sources but no merge policy")]
    MissingMergePolicy(NodeId),

    #[error("incoming edges of node '{0}' declare conflicting merge policies")]
    InconsistentMergePolicy(NodeId),

    #[error("required field '{field}' of node '{node_id}' cannot be satisfied")]
    UnsatisfiableInput { node_id: NodeId, field: String },

    #[error("node '{0}' requires a generative transform but generative fallback is disabled")]
    GenerativeUnavailable(NodeId),

    #[error("catalog unavailable: {0}")]
    Catalog(String),
}

impl ValidationError {
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::DuplicateNode(id)
            | Self::Cycle(id)
            | Self::InputHasIncoming(id)
            | Self::Unreachable(id)
            | Self::MissingMergePolicy(id)
            | Self::InconsistentMergePolicy(id)
            | Self::GenerativeUnavailable(id) => Some(id),
            Self::SelfLoop { node_id, .. }
            | Self::DanglingEdge { node_id, .. }
            | Self::UnknownAgent { node_id, .. }
            | Self::UnsatisfiableInput { node_id, .. } => Some(node_id),
            Self::EmptyChain | Self::DuplicateEdge(_) | Self::Catalog(_) => None,
        }
    }

    pub fn edge_id(&self) -> Option<&str> {
        match self {
            Self::DuplicateEdge(id) => Some(id),
            Self::SelfLoop { edge_id, .. } | Self::DanglingEdge { edge_id, .. } => Some(edge_id),
            _ => None,
        }
    }
}

/// A chain that passed validation, with everything the executor needs precomputed.
#[derive(Debug, Clone)]
pub struct ValidatedGraph {
    chain: ChainDefinition,
    catalog_version: String,
    order: Vec<NodeId>,
    predecessors: HashMap<NodeId, Vec<NodeId>>,
    successors: HashMap<NodeId, Vec<NodeId>>,
    incoming: HashMap<NodeId, Vec<Edge>>,
    input_schemas: HashMap<NodeId, SchemaDescriptor>,
    output_schemas: HashMap<NodeId, SchemaDescriptor>,
    agents: HashMap<NodeId, AgentDescriptor>,
    merge_policies: HashMap<NodeId, MergePolicy>,
}

impl ValidatedGraph {
    pub fn chain(&self) -> &ChainDefinition {
        &self.chain
    }

    pub fn catalog_version(&self) -> &str {
        &self.catalog_version
    }

    /// Kahn topological order, ties broken by node id.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.chain.node(id)
    }

    pub fn predecessors(&self, id: &str) -> &[NodeId] {
        self.predecessors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn successors(&self, id: &str) -> &[NodeId] {
        self.successors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Incoming edges, sorted by edge id.
    pub fn incoming(&self, id: &str) -> &[Edge] {
        self.incoming.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn input_schema(&self, id: &str) -> Option<&SchemaDescriptor> {
        self.input_schemas.get(id)
    }

    pub fn output_schema(&self, id: &str) -> Option<&SchemaDescriptor> {
        self.output_schemas.get(id)
    }

    pub fn agent(&self, id: &str) -> Option<&AgentDescriptor> {
        self.agents.get(id)
    }

    pub fn merge_policy(&self, id: &str) -> Option<MergePolicy> {
        self.merge_policies.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Validate `chain` against a catalog snapshot.
pub fn validate(
    chain: &ChainDefinition,
    catalog: &CatalogSnapshot,
    matcher: &SchemaMatcher,
    generative_enabled: bool,
) -> Result<ValidatedGraph, ValidationError> {
    check_basics(chain)?;
    let agents = check_references(chain, catalog)?;

    let mut successors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    let mut predecessors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    let mut incoming: HashMap<NodeId, Vec<Edge>> = HashMap::new();
    for node in &chain.nodes {
        successors.insert(node.id.clone(), vec![]);
        predecessors.insert(node.id.clone(), vec![]);
        incoming.insert(node.id.clone(), vec![]);
    }
    for edge in &chain.edges {
        push_unique(successors.entry(edge.source.clone()).or_default(), &edge.target);
        push_unique(predecessors.entry(edge.target.clone()).or_default(), &edge.source);
        incoming.entry(edge.target.clone()).or_default().push(edge.clone());
    }
    for edges in incoming.values_mut() {
        edges.sort_by_key(|e| e.id());
    }

    detect_cycles(chain, &successors)?;
    check_reachability(chain, &successors, &incoming)?;
    let merge_policies = check_merge_policies(&incoming)?;

    let order = topological_order(chain, &successors, &predecessors);
    let (input_schemas, output_schemas) =
        compute_schemas(chain, &order, &agents, &successors, &predecessors);

    check_satisfiable(
        chain,
        &predecessors,
        &input_schemas,
        &output_schemas,
        matcher,
        generative_enabled,
    )?;

    Ok(ValidatedGraph {
        chain: chain.clone(),
        catalog_version: catalog.version.clone(),
        order,
        predecessors,
        successors,
        incoming,
        input_schemas,
        output_schemas,
        agents,
        merge_policies,
    })
}

fn push_unique(list: &mut Vec<NodeId>, id: &str) {
    if !list.iter().any(|x| x == id) {
        list.push(id.to_string());
    }
}

fn check_basics(chain: &ChainDefinition) -> Result<(), ValidationError> {
    if chain.nodes.is_empty() {
        return Err(ValidationError::EmptyChain);
    }
    let mut ids = HashSet::new();
    for node in &chain.nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(ValidationError::DuplicateNode(node.id.clone()));
        }
    }
    let mut edge_ids = HashSet::new();
    for edge in &chain.edges {
        let id = edge.id();
        if edge.source == edge.target {
            return Err(ValidationError::SelfLoop {
                edge_id: id,
                node_id: edge.source.clone(),
            });
        }
        if !edge_ids.insert(id.clone()) {
            return Err(ValidationError::DuplicateEdge(id));
        }
    }
    Ok(())
}

fn check_references(
    chain: &ChainDefinition,
    catalog: &CatalogSnapshot,
) -> Result<HashMap<NodeId, AgentDescriptor>, ValidationError> {
    for edge in &chain.edges {
        for endpoint in [&edge.source, &edge.target] {
            if chain.node(endpoint).is_none() {
                return Err(ValidationError::DanglingEdge {
                    edge_id: edge.id(),
                    node_id: endpoint.clone(),
                });
            }
        }
    }

    let mut agents = HashMap::new();
    for node in &chain.nodes {
        if let NodeKind::Agent { ref agent_id, .. } = node.kind {
            let agent = catalog
                .get(agent_id)
                .ok_or_else(|| ValidationError::UnknownAgent {
                    node_id: node.id.clone(),
                    agent_id: agent_id.clone(),
                })?;
            agents.insert(node.id.clone(), agent.clone());
        }
    }
    Ok(agents)
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Grey,
    Black,
}

/// DFS coloring; reports the node where a back edge lands.
fn detect_cycles(
    chain: &ChainDefinition,
    successors: &HashMap<NodeId, Vec<NodeId>>,
) -> Result<(), ValidationError> {
    fn visit(
        id: &str,
        successors: &HashMap<NodeId, Vec<NodeId>>,
        colors: &mut HashMap<String, Color>,
    ) -> Result<(), ValidationError> {
        colors.insert(id.to_string(), Color::Grey);
        let mut next: Vec<&NodeId> = successors.get(id).map(|s| s.iter().collect()).unwrap_or_default();
        next.sort();
        for succ in next {
            match colors.get(succ.as_str()).copied().unwrap_or(Color::White) {
                Color::Grey => return Err(ValidationError::Cycle(succ.clone())),
                Color::White => visit(succ, successors, colors)?,
                Color::Black => {}
            }
        }
        colors.insert(id.to_string(), Color::Black);
        Ok(())
    }

    let mut colors: HashMap<String, Color> = HashMap::new();
    let mut ids: Vec<&str> = chain.nodes.iter().map(|n| n.id.as_str()).collect();
    ids.sort();
    for id in ids {
        if colors.get(id).copied().unwrap_or(Color::White) == Color::White {
            visit(id, successors, &mut colors)?;
        }
    }
    Ok(())
}

fn check_reachability(
    chain: &ChainDefinition,
    successors: &HashMap<NodeId, Vec<NodeId>>,
    incoming: &HashMap<NodeId, Vec<Edge>>,
) -> Result<(), ValidationError> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    for node in chain.nodes.iter().filter(|n| n.is_input()) {
        if incoming.get(&node.id).is_some_and(|e| !e.is_empty()) {
            return Err(ValidationError::InputHasIncoming(node.id.clone()));
        }
        seen.insert(node.id.as_str());
        queue.push_back(node.id.as_str());
    }

    while let Some(id) = queue.pop_front() {
        for succ in successors.get(id).into_iter().flatten() {
            if seen.insert(succ.as_str()) {
                queue.push_back(succ.as_str());
            }
        }
    }

    let mut unreached: Vec<&str> = chain
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| !seen.contains(id))
        .collect();
    unreached.sort();
    match unreached.first() {
        Some(id) => Err(ValidationError::Unreachable(id.to_string())),
        None => Ok(()),
    }
}

fn check_merge_policies(
    incoming: &HashMap<NodeId, Vec<Edge>>,
) -> Result<HashMap<NodeId, MergePolicy>, ValidationError> {
    let mut policies = HashMap::new();
    let mut targets: Vec<&NodeId> = incoming.keys().collect();
    targets.sort();
    for target in targets {
        let edges = &incoming[target];
        let declared: HashSet<MergePolicy> = edges.iter().filter_map(|e| e.merge).collect();
        if declared.len() > 1 {
            return Err(ValidationError::InconsistentMergePolicy(target.clone()));
        }
        let sources: HashSet<&str> = edges.iter().map(|e| e.source.as_str()).collect();
        match declared.into_iter().next() {
            Some(policy) => {
                policies.insert(target.clone(), policy);
            }
            None if sources.len() > 1 => {
                return Err(ValidationError::MissingMergePolicy(target.clone()))
            }
            None => {}
        }
    }
    Ok(policies)
}

fn topological_order(
    chain: &ChainDefinition,
    successors: &HashMap<NodeId, Vec<NodeId>>,
    predecessors: &HashMap<NodeId, Vec<NodeId>>,
) -> Vec<NodeId> {
    let mut indegree: HashMap<&str, usize> = chain
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), predecessors.get(&n.id).map_or(0, Vec::len)))
        .collect();
    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut order = Vec::with_capacity(chain.nodes.len());
    while let Some(id) = ready.pop_first() {
        order.push(id.to_string());
        for succ in successors.get(id).into_iter().flatten() {
            if let Some(d) = indegree.get_mut(succ.as_str()) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(succ.as_str());
                }
            }
        }
    }
    order
}

fn compute_schemas(
    chain: &ChainDefinition,
    order: &[NodeId],
    agents: &HashMap<NodeId, AgentDescriptor>,
    successors: &HashMap<NodeId, Vec<NodeId>>,
    predecessors: &HashMap<NodeId, Vec<NodeId>>,
) -> (HashMap<NodeId, SchemaDescriptor>, HashMap<NodeId, SchemaDescriptor>) {
    let mut inputs = HashMap::new();
    let mut outputs: HashMap<NodeId, SchemaDescriptor> = HashMap::new();

    for id in order {
        let Some(node) = chain.node(id) else { continue };
        let upstream = || {
            let preds = predecessors.get(id).map(Vec::as_slice).unwrap_or(&[]);
            SchemaDescriptor::union(preds.iter().filter_map(|p| outputs.get(p)))
        };

        let (input, output) = match &node.kind {
            NodeKind::Input { value } => (SchemaDescriptor::new(), SchemaDescriptor::infer(value)),
            NodeKind::Agent { .. } => match agents.get(id) {
                Some(agent) => (agent.input_schema.clone(), agent.output_schema.clone()),
                None => (SchemaDescriptor::new(), SchemaDescriptor::new()),
            },
            NodeKind::Transform { target_schema, .. } => {
                let target = target_schema
                    .clone()
                    .or_else(|| first_successor_input(chain, id, agents, successors))
                    .unwrap_or_else(|| upstream());
                (upstream(), target)
            }
        };
        inputs.insert(id.clone(), input);
        outputs.insert(id.clone(), output);
    }
    (inputs, outputs)
}

/// Input schema of the first successor (in edge order) that is an agent,
/// minus the fields that successor takes from its own parameters.
fn first_successor_input(
    chain: &ChainDefinition,
    id: &str,
    agents: &HashMap<NodeId, AgentDescriptor>,
    successors: &HashMap<NodeId, Vec<NodeId>>,
) -> Option<SchemaDescriptor> {
    successors.get(id)?.iter().find_map(|s| {
        let NodeKind::Agent { parameters, .. } = &chain.node(s)?.kind else {
            return None;
        };
        let agent = agents.get(s)?;
        Some(agent.input_schema.retain(|name| !parameters.contains_key(name)))
    })
}

fn check_satisfiable(
    chain: &ChainDefinition,
    predecessors: &HashMap<NodeId, Vec<NodeId>>,
    input_schemas: &HashMap<NodeId, SchemaDescriptor>,
    output_schemas: &HashMap<NodeId, SchemaDescriptor>,
    matcher: &SchemaMatcher,
    generative_enabled: bool,
) -> Result<(), ValidationError> {
    let mut nodes: Vec<&GraphNode> = chain.nodes.iter().collect();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));

    for node in nodes {
        let preds = predecessors.get(&node.id).map(Vec::as_slice).unwrap_or(&[]);
        let sources: Vec<&SchemaDescriptor> =
            preds.iter().filter_map(|p| output_schemas.get(p)).collect();
        let has_incoming = !preds.is_empty();

        let unsatisfiable = |field: &str| ValidationError::UnsatisfiableInput {
            node_id: node.id.clone(),
            field: field.to_string(),
        };

        match &node.kind {
            NodeKind::Input { .. } => {}
            NodeKind::Agent { parameters, .. } => {
                let Some(schema) = input_schemas.get(&node.id) else { continue };
                for (field, _) in schema.required_fields() {
                    let ok = parameters.contains_key(field)
                        || matcher.can_satisfy(sources.iter().copied(), schema, field)
                        || (generative_enabled && has_incoming);
                    if !ok {
                        return Err(unsatisfiable(field));
                    }
                }
            }
            NodeKind::Transform { method, .. } => {
                let Some(schema) = output_schemas.get(&node.id) else { continue };
                match method {
                    TransformSpec::Generative { .. } if !generative_enabled => {
                        return Err(ValidationError::GenerativeUnavailable(node.id.clone()));
                    }
                    TransformSpec::Generative { .. } => {}
                    TransformSpec::Mapping { mapping } => {
                        for (field, spec) in schema.required_fields() {
                            if mapping.get(field).is_none() && spec.default.is_none() {
                                return Err(unsatisfiable(field));
                            }
                        }
                    }
                    TransformSpec::Auto | TransformSpec::Recipe => {
                        for (field, _) in schema.required_fields() {
                            let ok = matcher.can_satisfy(sources.iter().copied(), schema, field)
                                || (generative_enabled && has_incoming);
                            if !ok {
                                return Err(unsatisfiable(field));
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
