//! Structural matching engine.
//!
//! Flattens a rendered UI tree into nodes and scores it against declarative
//! expected-component specs. Matchers are decided once at spec-load time as
//! an explicit tagged variant; evaluation never re-inspects matcher shape.

use regex::Regex;
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

// ─── Component tree ──────────────────────────────────────────────────────────

/// One node of a rendered component tree. `path` is a stable positional
/// identifier (`root`, `root/0`, `root/0/1`) assigned at construction and
/// never recomputed.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentNode {
    pub kind: String,
    pub props: serde_json::Map<String, Value>,
    pub children: Vec<ComponentNode>,
    pub path: String,
}

impl ComponentNode {
    /// Build a node tree from a canonical JSON tree. Missing `type` becomes
    /// `Unknown`; missing `props`/`children` become empty.
    pub fn from_value(tree: &Value) -> Self {
        Self::build(tree, "root".to_string())
    }

    fn build(tree: &Value, path: String) -> Self {
        let kind = tree
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();
        let props = tree
            .get("props")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let children = tree
            .get("children")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .enumerate()
                    .map(|(i, child)| Self::build(child, format!("{path}/{i}")))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            kind,
            props,
            children,
            path,
        }
    }

    /// Pre-order walk visiting every node exactly once.
    pub fn flatten(&self) -> Vec<&ComponentNode> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(node.children.iter().rev());
        }
        out
    }
}

// ─── Matcher specs ───────────────────────────────────────────────────────────

/// Property matcher, decided once when the spec is loaded.
///
/// Wire forms: a bare string (exact), an array (one-of), `{"regex": "..."}`
/// or `{"exists": bool}`.
#[derive(Debug, Clone)]
pub enum PropMatcher {
    Exact(String),
    OneOf(Vec<Value>),
    Regex(Regex),
    Exists(bool),
}

impl PropMatcher {
    /// Apply the matcher to a (possibly absent) property value.
    pub fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Self::Exact(expected) => {
                matches!(value, Some(Value::String(s)) if s == expected)
            }
            Self::OneOf(allowed) => value.is_some_and(|v| allowed.contains(v)),
            Self::Regex(pattern) => match value {
                // Absent and falsy values never match, even patterns that
                // would match the empty string.
                Some(v) if json_truthy(v) => match v {
                    Value::String(s) => pattern.is_match(s),
                    other => pattern.is_match(&other.to_string()),
                },
                _ => false,
            },
            Self::Exists(wanted) => {
                let present = matches!(value, Some(v) if !v.is_null());
                present == *wanted
            }
        }
    }
}

/// Falsy: null, false, zero, and empty strings/arrays/objects.
fn json_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

impl<'de> Deserialize<'de> for PropMatcher {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        match raw {
            Value::String(s) => Ok(Self::Exact(s)),
            Value::Array(items) => Ok(Self::OneOf(items)),
            Value::Object(map) => {
                if let Some(pattern) = map.get("regex") {
                    let pattern = pattern
                        .as_str()
                        .ok_or_else(|| D::Error::custom("regex matcher wants a string pattern"))?;
                    let compiled = Regex::new(pattern)
                        .map_err(|e| D::Error::custom(format!("invalid regex: {e}")))?;
                    Ok(Self::Regex(compiled))
                } else if let Some(wanted) = map.get("exists") {
                    let wanted = wanted
                        .as_bool()
                        .ok_or_else(|| D::Error::custom("exists matcher wants a bool"))?;
                    Ok(Self::Exists(wanted))
                } else {
                    Err(D::Error::custom(
                        "matcher object needs a \"regex\" or \"exists\" key",
                    ))
                }
            }
            other => Err(D::Error::custom(format!(
                "unsupported matcher shape: {other}"
            ))),
        }
    }
}

impl Serialize for PropMatcher {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Exact(s) => serializer.serialize_str(s),
            Self::OneOf(items) => items.serialize(serializer),
            Self::Regex(pattern) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("regex", pattern.as_str())?;
                map.end()
            }
            Self::Exists(wanted) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("exists", wanted)?;
                map.end()
            }
        }
    }
}

fn default_count() -> usize {
    1
}

/// One expected component: a type, a minimum count, and per-prop matchers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedComponent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default, rename = "required_props", alias = "requiredProps")]
    pub required_props: BTreeMap<String, PropMatcher>,
}

// ─── Evaluation ──────────────────────────────────────────────────────────────

/// Per expected-component result. Coverage passes when enough nodes of the
/// type exist; each required prop passes when at least one matching-type
/// node satisfies it (existential, not universal).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentEval {
    #[serde(rename = "type")]
    pub kind: String,
    pub coverage_pass: bool,
    pub prop_results: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSummary {
    pub component_coverage: f64,
    pub prop_fidelity: f64,
}

pub fn evaluate(expected: &[ExpectedComponent], nodes: &[&ComponentNode]) -> Vec<ComponentEval> {
    expected
        .iter()
        .map(|spec| {
            let candidates: Vec<&&ComponentNode> =
                nodes.iter().filter(|n| n.kind == spec.kind).collect();
            let coverage_pass = candidates.len() >= spec.count;
            let prop_results = spec
                .required_props
                .iter()
                .map(|(prop, matcher)| {
                    let pass = candidates
                        .iter()
                        .any(|node| matcher.matches(node.props.get(prop)));
                    (prop.clone(), pass)
                })
                .collect();
            ComponentEval {
                kind: spec.kind.clone(),
                coverage_pass,
                prop_results,
            }
        })
        .collect()
}

/// Fold evals into the two headline fractions. Both are 0.0 (never NaN)
/// when there is nothing to count.
pub fn summarize(evals: &[ComponentEval]) -> MatchSummary {
    let cov_total = evals.len();
    let cov_passed = evals.iter().filter(|e| e.coverage_pass).count();
    let prop_total: usize = evals.iter().map(|e| e.prop_results.len()).sum();
    let prop_passed: usize = evals
        .iter()
        .map(|e| e.prop_results.values().filter(|v| **v).count())
        .sum();

    MatchSummary {
        component_coverage: ratio(cov_passed, cov_total),
        prop_fidelity: ratio(prop_passed, prop_total),
    }
}

fn ratio(passed: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        passed as f64 / total as f64
    }
}
