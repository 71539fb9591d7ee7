//! Condition node handler
//!
//! A condition evaluates to a boolean that decides which outgoing branch
//! edges are traversed. Two modes:
//!
//! - `expression` (default): a comparison over the node's inputs and the
//!   execution variables, e.g. `x > 0` or `status == 'done'`.
//! - `max_iterations`: true once the upstream loop node has reached its
//!   iteration cap, providing the loop's exit path.

use async_trait::async_trait;
use dipeo_core::{Envelope, HandlerContext, HandlerError, Inputs, Node, NodeHandler};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

pub struct ConditionHandler;

#[async_trait]
impl NodeHandler for ConditionHandler {
    async fn handle(
        &self,
        node: &Node,
        inputs: &Inputs,
        ctx: &HandlerContext<'_>,
    ) -> Result<Envelope, HandlerError> {
        let condition_type = node
            .data
            .get("condition_type")
            .and_then(Value::as_str)
            .unwrap_or("expression");

        let result = match condition_type {
            "max_iterations" => upstream_at_cap(ctx),
            "expression" => {
                let expression = node
                    .data
                    .get("expression")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let mut scope: BTreeMap<String, Value> = ctx.variables.clone();
                scope.extend(inputs.to_value_map());
                evaluate_expression(&node.id, expression, &scope)?
            }
            other => {
                return Err(HandlerError::Validation(format!(
                    "node {} has unknown condition_type '{other}'",
                    node.id
                )))
            }
        };

        debug!(node_id = %node.id, condition_type, result, "condition evaluated");
        Ok(Envelope::json(&node.id, Value::Bool(result)))
    }
}

/// True when the condition's upstream node has hit its iteration cap or
/// already produced the cap-skip marker.
fn upstream_at_cap(ctx: &HandlerContext<'_>) -> bool {
    let Some(upstream) = ctx.upstream.first() else {
        return false;
    };
    if let Some(cap) = ctx.iteration_cap(upstream) {
        if ctx.exec_count(upstream) >= cap {
            return true;
        }
    }
    ctx.node_output(upstream)
        .map(Envelope::is_max_iterations_marker)
        .unwrap_or(false)
}

const OPERATORS: &[&str] = &[" not_contains ", " contains ", "==", "!=", ">=", "<=", ">", "<"];

/// Evaluate a comparison expression against a variable scope.
///
/// Grammar: `operand [op operand]` where an operand is an identifier, a
/// quoted string, a number, or a boolean literal. A bare operand evaluates
/// to its truthiness. An empty expression is false.
pub fn evaluate_expression(
    node_id: &str,
    expression: &str,
    scope: &BTreeMap<String, Value>,
) -> Result<bool, HandlerError> {
    let expression = expression.trim();
    if expression.is_empty() {
        return Ok(false);
    }

    for op in OPERATORS {
        if let Some(pos) = expression.find(op) {
            let left = parse_operand(&expression[..pos], scope);
            let right = parse_operand(&expression[pos + op.len()..], scope);
            return apply_operator(node_id, op.trim(), &left, &right);
        }
    }

    Ok(truthy(&parse_operand(expression, scope)))
}

fn parse_operand(raw: &str, scope: &BTreeMap<String, Value>) -> Value {
    let raw = raw.trim();
    if (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
        || (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
    {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    if raw == "true" {
        return Value::Bool(true);
    }
    if raw == "false" {
        return Value::Bool(false);
    }
    if let Ok(number) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(number) {
            return Value::Number(n);
        }
    }
    scope.get(raw).cloned().unwrap_or(Value::Null)
}

fn apply_operator(
    node_id: &str,
    op: &str,
    left: &Value,
    right: &Value,
) -> Result<bool, HandlerError> {
    match op {
        "==" => Ok(loose_eq(left, right)),
        "!=" => Ok(!loose_eq(left, right)),
        ">" | "<" | ">=" | "<=" => {
            let ordering = compare(left, right).ok_or_else(|| {
                HandlerError::Validation(format!(
                    "node {node_id}: cannot order {left} and {right}"
                ))
            })?;
            Ok(match op {
                ">" => ordering.is_gt(),
                "<" => ordering.is_lt(),
                ">=" => ordering.is_ge(),
                _ => ordering.is_le(),
            })
        }
        "contains" => Ok(contains(left, right)),
        "not_contains" => Ok(!contains(left, right)),
        other => Err(HandlerError::Validation(format!(
            "node {node_id}: unknown operator '{other}'"
        ))),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return a == b;
    }
    left == right
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return a.partial_cmp(&b);
    }
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(left: &Value, right: &Value) -> bool {
    match left {
        Value::Array(items) => items.iter().any(|item| loose_eq(item, right)),
        other => {
            let haystack = match other {
                Value::String(s) => s.clone(),
                v => v.to_string(),
            };
            let needle = match right {
                Value::String(s) => s.clone(),
                v => v.to_string(),
            };
            haystack.contains(&needle)
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::TestCtx;
    use dipeo_core::NodeType;
    use serde_json::json;

    fn scope(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_numeric_comparisons() {
        let s = scope(&[("x", json!(5))]);
        assert!(evaluate_expression("n", "x > 0", &s).unwrap());
        assert!(!evaluate_expression("n", "x > 10", &s).unwrap());
        assert!(evaluate_expression("n", "x >= 5", &s).unwrap());
        assert!(evaluate_expression("n", "x <= 5", &s).unwrap());
        assert!(evaluate_expression("n", "x < 10", &s).unwrap());
    }

    #[test]
    fn test_equality_with_numeric_strings() {
        let s = scope(&[("count", json!("3"))]);
        assert!(evaluate_expression("n", "count == 3", &s).unwrap());
        assert!(evaluate_expression("n", "count != 4", &s).unwrap());
    }

    #[test]
    fn test_string_comparison_and_contains() {
        let s = scope(&[("status", json!("in_progress"))]);
        assert!(evaluate_expression("n", "status == 'in_progress'", &s).unwrap());
        assert!(evaluate_expression("n", "status contains 'progress'", &s).unwrap());
        assert!(evaluate_expression("n", "status not_contains 'done'", &s).unwrap());
    }

    #[test]
    fn test_array_contains() {
        let s = scope(&[("tags", json!(["a", "b"]))]);
        assert!(evaluate_expression("n", "tags contains 'a'", &s).unwrap());
        assert!(!evaluate_expression("n", "tags contains 'z'", &s).unwrap());
    }

    #[test]
    fn test_bare_operand_truthiness() {
        let s = scope(&[("flag", json!(true)), ("empty", json!(""))]);
        assert!(evaluate_expression("n", "flag", &s).unwrap());
        assert!(!evaluate_expression("n", "empty", &s).unwrap());
        // Unknown identifiers are null, so false.
        assert!(!evaluate_expression("n", "missing", &s).unwrap());
        assert!(!evaluate_expression("n", "", &s).unwrap());
    }

    #[test]
    fn test_unorderable_values_error() {
        let s = scope(&[("x", json!({"a": 1}))]);
        assert!(matches!(
            evaluate_expression("n", "x > 3", &s),
            Err(HandlerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_expression_mode_reads_variables() {
        let mut state = TestCtx::new();
        state.variables.insert("x".into(), json!(5));

        let node =
            Node::new("cond", NodeType::Condition).with_data("expression", json!("x > 0"));
        let envelope = ConditionHandler
            .handle(&node, &Inputs::new(), &state.ctx())
            .await
            .unwrap();
        assert!(envelope.is_truthy());
    }

    #[tokio::test]
    async fn test_max_iterations_mode() {
        let mut state = TestCtx::new();
        state.upstream.push("loop".into());
        state.iteration_caps.insert("loop".into(), 3);
        state.exec_counts.insert("loop".into(), 2);

        let node = Node::new("cond", NodeType::Condition)
            .with_data("condition_type", json!("max_iterations"));

        let below_cap = ConditionHandler
            .handle(&node, &Inputs::new(), &state.ctx())
            .await
            .unwrap();
        assert!(!below_cap.is_truthy());

        state.exec_counts.insert("loop".into(), 3);
        let at_cap = ConditionHandler
            .handle(&node, &Inputs::new(), &state.ctx())
            .await
            .unwrap();
        assert!(at_cap.is_truthy());
    }

    #[tokio::test]
    async fn test_max_iterations_detects_skip_marker() {
        let mut state = TestCtx::new();
        state.upstream.push("loop".into());
        state
            .outputs
            .insert("loop".into(), Envelope::max_iterations_marker("loop"));

        let node = Node::new("cond", NodeType::Condition)
            .with_data("condition_type", json!("max_iterations"));
        let envelope = ConditionHandler
            .handle(&node, &Inputs::new(), &state.ctx())
            .await
            .unwrap();
        assert!(envelope.is_truthy());
    }

    #[tokio::test]
    async fn test_unknown_condition_type_is_validation_error() {
        let state = TestCtx::new();
        let node =
            Node::new("cond", NodeType::Condition).with_data("condition_type", json!("magic"));
        let result = ConditionHandler
            .handle(&node, &Inputs::new(), &state.ctx())
            .await;
        assert!(matches!(result, Err(HandlerError::Validation(_))));
    }
}
