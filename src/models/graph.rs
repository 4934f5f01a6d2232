// Workflow graph - nodes, edges, tagged parameter values, validation

//! # Workflow Graph Model
//!
//! A workflow is a directed graph. Nodes carry a role (`trigger`, `action`,
//! `transform`, `condition`, `loop`), the connector binding for action and
//! trigger roles, and a parameter tree whose leaves are either literals,
//! references to other nodes' outputs, or inline expressions.
//!
//! The graph is a DAG; loops are NOT back-edges but declared body subgraphs
//! (a `loop` node names the node ids it iterates). Validation rejects true
//! cycles; the runtime appends anything unreachable by Kahn's algorithm to
//! the tail marked `cycle_suspected` rather than refusing to run.
//!
//! ## Serialization
//!
//! Graphs round-trip byte-for-byte up to key ordering: every field the
//! builder sends is either modeled or preserved inside `parameters` /
//! `config` as raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use crate::{Result, SwitchyardError};

/// Node role, the prefix of the node `type` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Trigger,
    Action,
    Transform,
    Condition,
    Loop,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NodeRole::Trigger => "trigger",
            NodeRole::Action => "action",
            NodeRole::Transform => "transform",
            NodeRole::Condition => "condition",
            NodeRole::Loop => "loop",
        };
        write!(f, "{label}")
    }
}

/// Parsed form of a node `type` string.
///
/// Action and trigger nodes use `role.connector.function`
/// (`action.slack.send_message`); structural roles are bare (`condition`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeType {
    pub role: NodeRole,
    pub app_id: Option<String>,
    pub function_id: Option<String>,
}

impl NodeType {
    /// Parse a raw type string. Unknown role prefixes are an error; missing
    /// connector/function parts on action/trigger nodes are caught later by
    /// graph validation, not here.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.splitn(3, '.');
        let role = match parts.next().unwrap_or_default() {
            "trigger" => NodeRole::Trigger,
            "action" => NodeRole::Action,
            "transform" => NodeRole::Transform,
            "condition" => NodeRole::Condition,
            "loop" => NodeRole::Loop,
            _ => return Err(SwitchyardError::UnknownNodeType(raw.to_string())),
        };
        Ok(NodeType {
            role,
            app_id: parts.next().map(str::to_string),
            function_id: parts.next().map(str::to_string),
        })
    }
}

/// A leaf in a node's parameter tree, classified.
///
/// Parameters are stored as raw JSON so graphs round-trip unchanged; the
/// resolver classifies each leaf with [`ParameterValue::classify`] and
/// pattern-matches on the result.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue<'a> {
    /// `{ "mode": "ref", "nodeId": "...", "path": "..." }`
    Ref { node_id: &'a str, path: &'a str },
    /// `{ "mode": "expr", "expression": "...", "fallback": ...,
    ///    "expectedResultSchema": "string" }`
    Expr {
        expression: &'a str,
        fallback: Option<&'a Value>,
        /// Expected JSON type name of the result, when declared.
        expected: Option<&'a str>,
    },
    /// Anything else is copied verbatim.
    Literal(&'a Value),
}

impl<'a> ParameterValue<'a> {
    /// Classify a JSON value as a directive or a literal.
    pub fn classify(value: &'a Value) -> ParameterValue<'a> {
        if let Value::Object(map) = value {
            match map.get("mode").and_then(Value::as_str) {
                Some("ref") => {
                    if let (Some(node_id), Some(path)) = (
                        map.get("nodeId").and_then(Value::as_str),
                        map.get("path").and_then(Value::as_str),
                    ) {
                        return ParameterValue::Ref { node_id, path };
                    }
                }
                Some("expr") => {
                    if let Some(expression) = map.get("expression").and_then(Value::as_str) {
                        return ParameterValue::Expr {
                            expression,
                            fallback: map.get("fallback"),
                            expected: map.get("expectedResultSchema").and_then(Value::as_str),
                        };
                    }
                }
                _ => {}
            }
        }
        ParameterValue::Literal(value)
    }
}

/// Loop-node configuration, read from `data.config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Node ids forming the loop body subgraph.
    #[serde(default)]
    pub body: Vec<String>,
    /// Scope alias for the current element. Default `item`.
    #[serde(default)]
    pub item_alias: Option<String>,
    /// Scope alias for the iteration index; absent means not exposed.
    #[serde(default)]
    pub index_alias: Option<String>,
    /// Upper bound on iterations; absent means unbounded.
    #[serde(default)]
    pub max_iterations: Option<usize>,
}

/// One rule on a condition node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionRule {
    /// Expression evaluated against the resolved scope.
    pub expression: String,
    /// Branch value selected when the expression is truthy.
    pub branch: Value,
}

/// Condition-node configuration, read from `data.config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionConfig {
    #[serde(default)]
    pub rules: Vec<ConditionRule>,
    /// Branch value selected when no rule matches.
    #[serde(default)]
    pub default_branch: Option<Value>,
}

/// Node payload: label, connector binding, parameters, role config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Connector id for action/trigger nodes (mirrors the type string).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    /// Function id for action/trigger nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// Raw parameter tree; leaves may be ref/expr directives.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    /// Stored connection reference for action/trigger nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Role-specific configuration (loop body, condition rules, retry
    /// policy overrides), kept as raw JSON for round-tripping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

/// Canvas position. UI-only; the engine ignores it but preserves it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePosition {
    pub x: f64,
    pub y: f64,
}

/// One node in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    /// Raw type string, e.g. `action.slack.send_message` or `condition`.
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub data: NodeData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<NodePosition>,
}

impl WorkflowNode {
    /// Parse this node's type string.
    pub fn parsed_type(&self) -> Result<NodeType> {
        NodeType::parse(&self.node_type)
    }

    /// Resolve the connector/function pair, preferring the explicit `data`
    /// fields over the type-string encoding.
    pub fn binding(&self) -> Result<(Option<String>, Option<String>)> {
        let parsed = self.parsed_type()?;
        Ok((
            self.data.app.clone().or(parsed.app_id),
            self.data.function.clone().or(parsed.function_id),
        ))
    }

    /// Loop configuration, if this is a loop node with one declared.
    pub fn loop_config(&self) -> Option<LoopConfig> {
        self.data
            .config
            .as_ref()
            .and_then(|c| serde_json::from_value(c.clone()).ok())
    }

    /// Condition configuration, if declared.
    pub fn condition_config(&self) -> Option<ConditionConfig> {
        self.data
            .config
            .as_ref()
            .and_then(|c| serde_json::from_value(c.clone()).ok())
    }
}

/// One edge in a workflow graph. `branch` carries the condition branch
/// value or label this edge is taken for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// The complete workflow graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowGraph {
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

/// A structural validation failure, one per finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphValidationError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl WorkflowGraph {
    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing edges of a node, in declaration order.
    pub fn edges_from<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a WorkflowEdge> {
        self.edges.iter().filter(move |e| e.source == id)
    }

    /// Structural validation.
    ///
    /// Checks, in order: node ids unique; every edge references existing
    /// ids; at least one trigger node; node type strings parse; action and
    /// trigger nodes carry a connector binding; the graph outside declared
    /// loop bodies is acyclic.
    pub fn validate(&self) -> Vec<GraphValidationError> {
        let mut errors = Vec::new();

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                errors.push(GraphValidationError {
                    code: "INVALID_GRAPH".into(),
                    message: format!("duplicate node id: {}", node.id),
                    node_id: Some(node.id.clone()),
                });
            }
        }

        for edge in &self.edges {
            for end in [&edge.source, &edge.target] {
                if self.node(end).is_none() {
                    errors.push(GraphValidationError {
                        code: "INVALID_GRAPH".into(),
                        message: format!("edge references unknown node: {end}"),
                        node_id: Some(end.clone()),
                    });
                }
            }
        }

        let mut has_trigger = false;
        for node in &self.nodes {
            match node.parsed_type() {
                Ok(parsed) => {
                    if parsed.role == NodeRole::Trigger {
                        has_trigger = true;
                    }
                    if matches!(parsed.role, NodeRole::Action | NodeRole::Trigger) {
                        match node.binding() {
                            Ok((Some(_), Some(_))) => {}
                            Ok((None, _)) => errors.push(GraphValidationError {
                                code: "MISSING_APP".into(),
                                message: format!("node {} has no connector", node.id),
                                node_id: Some(node.id.clone()),
                            }),
                            Ok((_, None)) => errors.push(GraphValidationError {
                                code: "MISSING_FUNCTION".into(),
                                message: format!("node {} has no function", node.id),
                                node_id: Some(node.id.clone()),
                            }),
                            Err(_) => {}
                        }
                    }
                }
                Err(_) => errors.push(GraphValidationError {
                    code: "UNKNOWN_NODE_TYPE".into(),
                    message: format!("node {} has unknown type {}", node.id, node.node_type),
                    node_id: Some(node.id.clone()),
                }),
            }
        }
        if !has_trigger {
            errors.push(GraphValidationError {
                code: "INVALID_GRAPH".into(),
                message: "graph has no trigger node".into(),
                node_id: None,
            });
        }

        let (order, suspected) = self.topological_order();
        if !suspected.is_empty() && order.len() == self.nodes.len() {
            // Unreachable-by-Kahn nodes outside any declared loop body are a
            // true cycle.
            let loop_bodies: HashSet<String> = self
                .nodes
                .iter()
                .filter_map(|n| n.loop_config())
                .flat_map(|c| c.body)
                .collect();
            for id in &suspected {
                if !loop_bodies.contains(id) {
                    errors.push(GraphValidationError {
                        code: "INVALID_GRAPH".into(),
                        message: format!("cycle suspected at node {id}"),
                        node_id: Some(id.clone()),
                    });
                }
            }
        }

        errors
    }

    /// Kahn's algorithm over the edge map.
    ///
    /// Returns the visit order (always covering every node: any nodes left
    /// unvisited by Kahn are appended in stable declaration order) and the
    /// set of node ids that were appended, i.e. `cycle_suspected`.
    pub fn topological_order(&self) -> (Vec<String>, Vec<String>) {
        let mut indegree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.edges {
            // Edges to unknown nodes were already reported by validate().
            if indegree.contains_key(edge.source.as_str()) {
                if let Some(d) = indegree.get_mut(edge.target.as_str()) {
                    *d += 1;
                    adjacency
                        .entry(edge.source.as_str())
                        .or_default()
                        .push(edge.target.as_str());
                }
            }
        }

        // Seed the queue in declaration order for deterministic output.
        let mut queue: VecDeque<&str> = self
            .nodes
            .iter()
            .filter(|n| indegree.get(n.id.as_str()) == Some(&0))
            .map(|n| n.id.as_str())
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        let mut visited = HashSet::new();
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            visited.insert(id);
            for &next in adjacency.get(id).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        let mut suspected = Vec::new();
        for node in &self.nodes {
            if !visited.contains(node.id.as_str()) {
                order.push(node.id.clone());
                suspected.push(node.id.clone());
            }
        }
        (order, suspected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph(json: Value) -> WorkflowGraph {
        serde_json::from_value(json).unwrap()
    }

    fn sample() -> Value {
        json!({
            "nodes": [
                {"id": "start", "type": "trigger.slack.message_received",
                 "data": {"app": "slack", "function": "message_received"}},
                {"id": "check", "type": "condition",
                 "data": {"config": {"rules": [{"expression": "trigger.ok == true", "branch": "yes"}],
                                      "default_branch": "no"}}},
                {"id": "notify", "type": "action.slack.send_message",
                 "data": {"app": "slack", "function": "send_message",
                          "parameters": {"text": {"mode": "ref", "nodeId": "start", "path": "text"}}}}
            ],
            "edges": [
                {"source": "start", "target": "check"},
                {"source": "check", "target": "notify", "branch": "yes"}
            ]
        })
    }

    #[test]
    fn valid_graph_passes() {
        assert!(graph(sample()).validate().is_empty());
    }

    #[test]
    fn round_trips_up_to_key_order() {
        let input = sample();
        let parsed: WorkflowGraph = serde_json::from_value(input.clone()).unwrap();
        let out = serde_json::to_value(&parsed).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn duplicate_ids_and_dangling_edges_rejected() {
        let g = graph(json!({
            "nodes": [
                {"id": "a", "type": "trigger.x.y"},
                {"id": "a", "type": "transform"}
            ],
            "edges": [{"source": "a", "target": "ghost"}]
        }));
        let errors = g.validate();
        assert!(errors.iter().any(|e| e.message.contains("duplicate")));
        assert!(errors.iter().any(|e| e.message.contains("ghost")));
    }

    #[test]
    fn graph_without_trigger_rejected() {
        let g = graph(json!({
            "nodes": [{"id": "t", "type": "transform"}],
            "edges": []
        }));
        assert!(g
            .validate()
            .iter()
            .any(|e| e.message.contains("no trigger")));
    }

    #[test]
    fn cycle_is_detected() {
        let g = graph(json!({
            "nodes": [
                {"id": "start", "type": "trigger.x.y", "data": {"app": "x", "function": "y"}},
                {"id": "a", "type": "transform"},
                {"id": "b", "type": "transform"}
            ],
            "edges": [
                {"source": "start", "target": "a"},
                {"source": "a", "target": "b"},
                {"source": "b", "target": "a"}
            ]
        }));
        assert!(g.validate().iter().any(|e| e.message.contains("cycle")));
        let (order, suspected) = g.topological_order();
        assert_eq!(order.len(), 3);
        assert_eq!(suspected, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn topological_order_respects_edges() {
        let g = graph(sample());
        let (order, suspected) = g.topological_order();
        assert!(suspected.is_empty());
        let pos = |id: &str| order.iter().position(|n| n == id).unwrap();
        assert!(pos("start") < pos("check"));
        assert!(pos("check") < pos("notify"));
    }

    #[test]
    fn parameter_classification() {
        let r = json!({"mode": "ref", "nodeId": "n1", "path": "a.b"});
        match ParameterValue::classify(&r) {
            ParameterValue::Ref { node_id, path } => {
                assert_eq!(node_id, "n1");
                assert_eq!(path, "a.b");
            }
            other => panic!("expected ref, got {other:?}"),
        }

        let e = json!({"mode": "expr", "expression": "1 + 2", "fallback": 0,
                       "expectedResultSchema": "number"});
        match ParameterValue::classify(&e) {
            ParameterValue::Expr {
                expression,
                fallback,
                expected,
            } => {
                assert_eq!(expression, "1 + 2");
                assert_eq!(fallback, Some(&json!(0)));
                assert_eq!(expected, Some("number"));
            }
            other => panic!("expected expr, got {other:?}"),
        }

        // A mode field with an unknown value is a literal, not a directive.
        let l = json!({"mode": "chaos"});
        assert!(matches!(
            ParameterValue::classify(&l),
            ParameterValue::Literal(_)
        ));
    }
}
