use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::mapping::FieldMapping;
use crate::schema::SchemaDescriptor;

pub type NodeId = String;
pub type EdgeId = String;

/// How a multi-source node combines its predecessors' contributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Highest-priority predecessor wins each field; lower priorities fill gaps.
    Authoritative,
    /// Conflicting values for the same field are an error.
    Strict,
}

impl std::fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authoritative => write!(f, "authoritative"),
            Self::Strict => write!(f, "strict"),
        }
    }
}

/// Declared transform method of a Transform node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformSpec {
    /// Pick a tier from the compatibility score.
    #[default]
    Auto,
    /// Apply a fixed field mapping.
    Mapping { mapping: FieldMapping },
    /// Use the best stored recipe for the surrounding agent pair.
    Recipe,
    /// Always use the generative collaborator.
    Generative {
        #[serde(default)]
        template: Option<String>,
    },
}

/// Behaviour of a graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Input {
        value: Value,
    },
    Agent {
        agent_id: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        parameters: Map<String, Value>,
    },
    Transform {
        #[serde(default)]
        method: TransformSpec,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_schema: Option<SchemaDescriptor>,
    },
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Input { .. } => "input",
            Self::Agent { .. } => "agent",
            Self::Transform { .. } => "transform",
        }
    }
}

fn default_critical() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: NodeId,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default = "default_critical")]
    pub critical: bool,
    /// Editor coordinates; never read by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
}

impl GraphNode {
    pub fn input(id: impl Into<String>, value: Value) -> Self {
        Self::new(id, NodeKind::Input { value })
    }

    pub fn agent(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::Agent {
                agent_id: agent_id.into(),
                parameters: Map::new(),
            },
        )
    }

    pub fn transform(id: impl Into<String>, method: TransformSpec) -> Self {
        Self::new(
            id,
            NodeKind::Transform {
                method,
                target_schema: None,
            },
        )
    }

    fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            critical: true,
            position: None,
        }
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        if let NodeKind::Agent { ref mut parameters, .. } = self.kind {
            parameters.insert(name.into(), value);
        }
        self
    }

    pub fn agent_id(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Agent { agent_id, .. } => Some(agent_id),
            _ => None,
        }
    }

    pub fn is_input(&self) -> bool {
        matches!(self.kind, NodeKind::Input { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EdgeId>,
    #[serde(alias = "from")]
    pub source: NodeId,
    #[serde(alias = "to")]
    pub target: NodeId,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergePolicy>,
    /// Score cached by the editor; recomputed at run time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: None,
            source: source.into(),
            target: target.into(),
            priority: 0,
            merge: None,
            score: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_merge(mut self, merge: MergePolicy) -> Self {
        self.merge = Some(merge);
        self
    }

    /// Declared id, or `"{source}->{target}"`.
    pub fn id(&self) -> EdgeId {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}->{}", self.source, self.target))
    }
}

/// A submitted graph of nodes and edges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainDefinition {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub version: Option<u32>,
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl ChainDefinition {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Incoming edges of a node, in declaration order.
    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.target == id)
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_editor_payload() {
        let chain: ChainDefinition = serde_json::from_value(json!({
            "id": "demo",
            "nodes": [
                {"id": "in", "kind": "input", "value": "hello", "position": {"x": 0, "y": 0}},
                {"id": "sum", "kind": "agent", "agent_id": "summarizer", "critical": false},
                {"id": "fix", "kind": "transform", "method": {"type": "generative", "template": "t"}}
            ],
            "edges": [
                {"from": "in", "to": "sum"},
                {"source": "sum", "target": "fix", "priority": 2, "merge": "strict"}
            ]
        }))
        .unwrap();

        assert_eq!(chain.nodes.len(), 3);
        assert!(chain.nodes[0].critical);
        assert!(!chain.nodes[1].critical);
        assert_eq!(chain.nodes[1].agent_id(), Some("summarizer"));
        assert!(matches!(
            chain.nodes[2].kind,
            NodeKind::Transform {
                method: TransformSpec::Generative { .. },
                ..
            }
        ));
        assert_eq!(chain.edges[0].id(), "in->sum");
        assert_eq!(chain.edges[1].merge, Some(MergePolicy::Strict));
    }

    #[test]
    fn transform_method_defaults_to_auto() {
        let node: GraphNode =
            serde_json::from_value(json!({"id": "t", "kind": "transform"})).unwrap();
        assert!(matches!(
            node.kind,
            NodeKind::Transform {
                method: TransformSpec::Auto,
                target_schema: None
            }
        ));
    }

    #[test]
    fn incoming_and_outgoing() {
        let chain = ChainDefinition {
            nodes: vec![
                GraphNode::input("a", json!({})),
                GraphNode::agent("b", "x"),
                GraphNode::agent("c", "y"),
            ],
            edges: vec![Edge::new("a", "b"), Edge::new("a", "c"), Edge::new("b", "c")],
            ..Default::default()
        };
        assert_eq!(chain.outgoing("a").count(), 2);
        assert_eq!(chain.incoming("c").count(), 2);
        assert!(chain.node("z").is_none());
    }
}
