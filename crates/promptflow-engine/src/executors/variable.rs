use serde_json::Value;

use promptflow_core::flow::VariableNode;

use super::{NodeContext, NodeOutput};

/// Pass a named value through to downstream bindings. Never fails: an
/// unbound name with no default yields `null`.
pub fn execute(node: &VariableNode, ctx: &NodeContext<'_>) -> NodeOutput {
    let value = ctx
        .bindings
        .get(&node.name)
        .cloned()
        .or_else(|| node.default.clone())
        .unwrap_or(Value::Null);
    NodeOutput::value(value).bind_as(Some(node.name.clone()))
}
