// Parameter resolution - lazy references into the running node-output map

//! # Parameter Resolver
//!
//! Nodes declare parameters as a JSON tree whose leaves are literals,
//! `ref` directives (`{mode, nodeId, path}`) or `expr` directives
//! (`{mode, expression, fallback?}`). The resolver walks the tree against
//! the execution's node-output map and produces the concrete parameter
//! values a node runs with.
//!
//! ## Path grammar
//!
//! ```text
//! path     := segment ( '.' segment )*
//! segment  := ident
//!           | ident '[' index ']'
//!           | ident '[' '"' key '"' ']'
//!           | ident '[' predicate ']'
//! predicate := field op literal        op in { ==, !=, >, <, >=, <= }
//! ```
//!
//! A predicate filter produces the collection of matching elements and
//! subsequent `.field` segments project across that collection:
//! `recommendations[score > 0.9].product` yields the products of every
//! high-scoring recommendation.
//!
//! ## Failure semantics
//!
//! Resolution never throws for missing data: a reference into a missing
//! path yields `undefined` (surfaced as JSON `null` plus a diagnostic).
//! Malformed paths are diagnostics too; whether a missing parameter blocks
//! the node is the runtime's call.

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::models::ParameterValue;

use super::expression::{self, EvalScope};

/// One parsed path segment.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    /// `.field`
    Field(String),
    /// `[3]`
    Index(usize),
    /// `["some key"]`
    Key(String),
    /// `[score > 0.9]`
    Filter {
        field: String,
        op: FilterOp,
        literal: Value,
    },
}

/// Predicate comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl FilterOp {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "==" => Some(FilterOp::Eq),
            "!=" => Some(FilterOp::Ne),
            ">" => Some(FilterOp::Gt),
            "<" => Some(FilterOp::Lt),
            ">=" => Some(FilterOp::Ge),
            "<=" => Some(FilterOp::Le),
            _ => None,
        }
    }

    fn apply(&self, left: &Value, right: &Value) -> bool {
        match self {
            FilterOp::Eq => json_eq(left, right),
            FilterOp::Ne => !json_eq(left, right),
            FilterOp::Gt | FilterOp::Lt | FilterOp::Ge | FilterOp::Le => {
                let (Some(l), Some(r)) = (value_as_f64(left), value_as_f64(right)) else {
                    return false;
                };
                match self {
                    FilterOp::Gt => l > r,
                    FilterOp::Lt => l < r,
                    FilterOp::Ge => l >= r,
                    FilterOp::Le => l <= r,
                    _ => unreachable!(),
                }
            }
        }
    }
}

fn json_eq(left: &Value, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (value_as_f64(left), value_as_f64(right)) {
        return (l - r).abs() < f64::EPSILON;
    }
    left == right
}

fn value_as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// Parse a path string into segments. Returns `None` on malformed input;
/// callers convert that into a diagnostic, not an error.
pub fn parse_path(path: &str) -> Option<Vec<PathSegment>> {
    let mut segments = Vec::new();
    let mut rest = path;

    while !rest.is_empty() {
        // Leading dot between segments.
        rest = rest.strip_prefix('.').unwrap_or(rest);
        if rest.is_empty() {
            return None;
        }

        // Identifier part (may be empty when a segment chains brackets).
        let ident_end = rest
            .find(|c: char| c == '.' || c == '[')
            .unwrap_or(rest.len());
        let ident = &rest[..ident_end];
        if !ident.is_empty() {
            if !is_identifier(ident) {
                return None;
            }
            segments.push(PathSegment::Field(ident.to_string()));
        }
        rest = &rest[ident_end..];

        // Zero or more bracket segments.
        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped.find(']')?;
            let inner = stripped[..close].trim();
            segments.push(parse_bracket(inner)?);
            rest = &stripped[close + 1..];
        }
    }

    if segments.is_empty() {
        None
    } else {
        Some(segments)
    }
}

fn parse_bracket(inner: &str) -> Option<PathSegment> {
    if inner.is_empty() {
        return None;
    }
    // ["quoted key"]
    if let Some(stripped) = inner.strip_prefix('"') {
        let key = stripped.strip_suffix('"')?;
        return Some(PathSegment::Key(key.to_string()));
    }
    // [42]
    if let Ok(index) = inner.parse::<usize>() {
        return Some(PathSegment::Index(index));
    }
    // [field op literal] — scan for the operator, longest first.
    for op_str in ["==", "!=", ">=", "<=", ">", "<"] {
        if let Some(pos) = inner.find(op_str) {
            let field = inner[..pos].trim();
            let raw_literal = inner[pos + op_str.len()..].trim();
            if !is_identifier(field) || raw_literal.is_empty() {
                return None;
            }
            let literal = parse_literal(raw_literal)?;
            return Some(PathSegment::Filter {
                field: field.to_string(),
                op: FilterOp::parse(op_str)?,
                literal,
            });
        }
    }
    None
}

fn parse_literal(raw: &str) -> Option<Value> {
    if let Some(stripped) = raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Some(Value::String(stripped.to_string()));
    }
    if let Some(stripped) = raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        return Some(Value::String(stripped.to_string()));
    }
    match raw {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" => return Some(Value::Null),
        _ => {}
    }
    serde_json::from_str::<serde_json::Number>(raw)
        .ok()
        .map(Value::Number)
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_' || c == '$')
        && s.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

/// Intermediate resolution state: a filter switches from a single value to
/// a projected collection.
enum Cursor {
    Single(Value),
    Collection(Vec<Value>),
}

/// Resolve a parsed path against a root value. Missing paths yield `None`.
pub fn resolve_segments(root: &Value, segments: &[PathSegment]) -> Option<Value> {
    let mut cursor = Cursor::Single(root.clone());

    for segment in segments {
        cursor = match (cursor, segment) {
            (Cursor::Single(value), PathSegment::Field(field)) => {
                Cursor::Single(value.as_object()?.get(field)?.clone())
            }
            (Cursor::Single(value), PathSegment::Key(key)) => {
                Cursor::Single(value.as_object()?.get(key)?.clone())
            }
            (Cursor::Single(value), PathSegment::Index(index)) => {
                Cursor::Single(value.as_array()?.get(*index)?.clone())
            }
            (Cursor::Single(value), PathSegment::Filter { field, op, literal }) => {
                let array = value.as_array()?;
                Cursor::Collection(
                    array
                        .iter()
                        .filter(|item| {
                            item.as_object()
                                .and_then(|o| o.get(field))
                                .map(|v| op.apply(v, literal))
                                .unwrap_or(false)
                        })
                        .cloned()
                        .collect(),
                )
            }
            // Projection across a filtered collection.
            (Cursor::Collection(items), PathSegment::Field(field)) => Cursor::Collection(
                items
                    .iter()
                    .filter_map(|item| item.as_object().and_then(|o| o.get(field)).cloned())
                    .collect(),
            ),
            (Cursor::Collection(items), PathSegment::Key(key)) => Cursor::Collection(
                items
                    .iter()
                    .filter_map(|item| item.as_object().and_then(|o| o.get(key)).cloned())
                    .collect(),
            ),
            (Cursor::Collection(items), PathSegment::Index(index)) => {
                Cursor::Single(items.get(*index)?.clone())
            }
            (Cursor::Collection(items), PathSegment::Filter { field, op, literal }) => {
                Cursor::Collection(
                    items
                        .iter()
                        .filter(|item| {
                            item.as_object()
                                .and_then(|o| o.get(field))
                                .map(|v| op.apply(v, literal))
                                .unwrap_or(false)
                        })
                        .cloned()
                        .collect(),
                )
            }
        };
    }

    Some(match cursor {
        Cursor::Single(value) => value,
        Cursor::Collection(items) => Value::Array(items),
    })
}

/// Outcome of resolving one node's parameter tree.
#[derive(Debug, Clone, Default)]
pub struct ResolvedParameters {
    pub values: Map<String, Value>,
    /// Human-readable notes about refs that resolved to nothing or
    /// expressions that failed; surfaced in node diagnostics.
    pub diagnostics: Vec<String>,
}

/// Resolves node parameters against the execution's output map.
pub struct ParameterResolver;

impl ParameterResolver {
    /// Resolve a `ref` directive. `None` means the path was malformed or
    /// led nowhere.
    pub fn resolve_ref(
        outputs: &HashMap<String, Value>,
        node_id: &str,
        path: &str,
    ) -> Option<Value> {
        let root = outputs.get(node_id)?;
        let segments = parse_path(path)?;
        resolve_segments(root, &segments)
    }

    /// Resolve a whole parameter tree. Ref and expr directives may appear
    /// at any depth; everything else is copied verbatim.
    pub fn resolve_tree(
        parameters: &Map<String, Value>,
        outputs: &HashMap<String, Value>,
    ) -> ResolvedParameters {
        let mut resolved = ResolvedParameters::default();
        let scope = EvalScope::from_outputs(outputs);
        for (key, value) in parameters {
            let out = Self::resolve_value(value, outputs, &scope, key, &mut resolved.diagnostics);
            resolved.values.insert(key.clone(), out);
        }
        resolved
    }

    fn resolve_value(
        value: &Value,
        outputs: &HashMap<String, Value>,
        scope: &EvalScope,
        key_path: &str,
        diagnostics: &mut Vec<String>,
    ) -> Value {
        match ParameterValue::classify(value) {
            ParameterValue::Ref { node_id, path } => {
                match Self::resolve_ref(outputs, node_id, path) {
                    Some(v) => v,
                    None => {
                        diagnostics.push(format!(
                            "{key_path}: reference {node_id}.{path} resolved to nothing"
                        ));
                        Value::Null
                    }
                }
            }
            ParameterValue::Expr {
                expression: expr,
                fallback,
                expected,
            } => {
                let outcome = expression::evaluate_with_schema(expr, scope, expected);
                for note in &outcome.diagnostics {
                    diagnostics.push(format!("{key_path}: {note}"));
                }
                match (outcome.valid, outcome.value, fallback) {
                    (true, Some(v), _) => v,
                    (_, _, Some(fb)) => fb.clone(),
                    _ => Value::Null,
                }
            }
            ParameterValue::Literal(_) => match value {
                // Recurse into containers so nested directives resolve.
                Value::Object(map) => {
                    let mut out = Map::with_capacity(map.len());
                    for (k, v) in map {
                        let child_key = format!("{key_path}.{k}");
                        out.insert(
                            k.clone(),
                            Self::resolve_value(v, outputs, scope, &child_key, diagnostics),
                        );
                    }
                    Value::Object(out)
                }
                Value::Array(items) => Value::Array(
                    items
                        .iter()
                        .enumerate()
                        .map(|(i, v)| {
                            let child_key = format!("{key_path}[{i}]");
                            Self::resolve_value(v, outputs, scope, &child_key, diagnostics)
                        })
                        .collect(),
                ),
                other => other.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert(
            "enrichment".to_string(),
            json!({
                "recommendations": [
                    {"product": "Premium Support", "score": 0.92},
                    {"product": "Analytics Add-on", "score": 0.81}
                ],
                "customer": {"name": "Acme", "weird key": 7}
            }),
        );
        map.insert("trigger".to_string(), json!({"order": {"id": "o-1"}}));
        map
    }

    #[test]
    fn predicate_filter_projects_across_matches() {
        let value = ParameterResolver::resolve_ref(
            &outputs(),
            "enrichment",
            "recommendations[score > 0.9].product",
        )
        .unwrap();
        assert_eq!(value, json!(["Premium Support"]));
    }

    #[test]
    fn index_and_quoted_key_segments() {
        let out = outputs();
        assert_eq!(
            ParameterResolver::resolve_ref(&out, "enrichment", "recommendations[1].product"),
            Some(json!("Analytics Add-on"))
        );
        assert_eq!(
            ParameterResolver::resolve_ref(&out, "enrichment", "customer[\"weird key\"]"),
            Some(json!(7))
        );
    }

    #[test]
    fn missing_paths_are_undefined_not_errors() {
        let out = outputs();
        assert_eq!(
            ParameterResolver::resolve_ref(&out, "enrichment", "nope.nothing"),
            None
        );
        assert_eq!(ParameterResolver::resolve_ref(&out, "ghost", "x"), None);
    }

    #[test]
    fn malformed_path_is_rejected() {
        assert!(parse_path("").is_none());
        assert!(parse_path("a..b").is_none());
        assert!(parse_path("a[unclosed").is_none());
        assert!(parse_path("a[=>3]").is_none());
    }

    #[test]
    fn filter_ops() {
        assert!(FilterOp::Ge.apply(&json!(0.9), &json!(0.9)));
        assert!(FilterOp::Ne.apply(&json!("a"), &json!("b")));
        assert!(!FilterOp::Gt.apply(&json!("not a number"), &json!(1)));
    }

    #[test]
    fn tree_resolution_handles_nested_directives() {
        let parameters = serde_json::from_value::<Map<String, Value>>(json!({
            "subject": "hello",
            "body": {
                "order": {"mode": "ref", "nodeId": "trigger", "path": "order.id"},
                "top": [
                    {"mode": "ref", "nodeId": "enrichment",
                     "path": "recommendations[score > 0.9].product"}
                ]
            },
            "missing": {"mode": "ref", "nodeId": "enrichment", "path": "void"}
        }))
        .unwrap();

        let resolved = ParameterResolver::resolve_tree(&parameters, &outputs());
        assert_eq!(resolved.values["subject"], json!("hello"));
        assert_eq!(resolved.values["body"]["order"], json!("o-1"));
        assert_eq!(resolved.values["body"]["top"], json!([["Premium Support"]]));
        assert_eq!(resolved.values["missing"], Value::Null);
        assert_eq!(resolved.diagnostics.len(), 1);
        assert!(resolved.diagnostics[0].contains("missing"));
    }
}
