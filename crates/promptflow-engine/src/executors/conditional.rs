use serde_json::json;

use promptflow_core::flow::ConditionalNode;

use super::{NodeContext, NodeOutput};
use crate::condition::{evaluate, resolve_operand};

/// Evaluate the comparison and pick the `"true"` or `"false"` branch.
pub fn execute(node: &ConditionalNode, ctx: &NodeContext<'_>) -> NodeOutput {
    let left = resolve_operand(&node.left, ctx.bindings);
    let right = node
        .right
        .as_ref()
        .and_then(|op| resolve_operand(op, ctx.bindings));
    let result = evaluate(node.operator, left.as_ref(), right.as_ref());

    NodeOutput {
        branch: Some(result),
        ..NodeOutput::value(json!(result))
    }
    .with_detail(json!({
        "left": left,
        "operator": node.operator,
        "right": right,
        "result": result,
    }))
}
