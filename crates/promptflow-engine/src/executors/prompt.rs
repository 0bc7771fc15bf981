use serde_json::{json, Map, Value};
use tracing::debug;

use promptflow_core::error::{FlowError, Result};
use promptflow_core::flow::{PromptNode, TemplateRefNode};
use promptflow_core::types::ModelRequest;

use super::{NodeContext, NodeOutput};

pub async fn execute(node: &PromptNode, ctx: &NodeContext<'_>) -> Result<NodeOutput> {
    call_model(
        ctx,
        &node.template,
        &node.model,
        node.parameters.clone(),
        node.output_variable.clone(),
    )
    .await
}

/// Look the template up in the store, then run it like a prompt node.
pub async fn execute_template_ref(
    node: &TemplateRefNode,
    ctx: &NodeContext<'_>,
) -> Result<NodeOutput> {
    let store = ctx.templates.ok_or_else(|| {
        FlowError::node(ctx.node_id, "no template store is attached to the engine")
    })?;
    let template = store
        .get_template(&node.template_id)
        .await?
        .ok_or_else(|| FlowError::TemplateNotFound(node.template_id.clone()))?;

    let model = node.model.clone().unwrap_or(template.model);
    let mut parameters = template.parameters;
    parameters.extend(node.parameters.clone());

    call_model(
        ctx,
        &template.content,
        &model,
        parameters,
        node.output_variable.clone(),
    )
    .await
}

async fn call_model(
    ctx: &NodeContext<'_>,
    template: &str,
    model: &str,
    parameters: Map<String, Value>,
    output_variable: Option<String>,
) -> Result<NodeOutput> {
    if ctx.config.strict_variables {
        let missing = ctx.bindings.missing(template);
        if !missing.is_empty() {
            return Err(FlowError::VariableResolution {
                node_id: ctx.node_id.to_string(),
                missing,
            });
        }
    }
    if ctx.cancel.is_cancelled() {
        return Err(FlowError::Cancelled);
    }

    let prompt = ctx.bindings.render(template);
    debug!(
        node_id = %ctx.node_id,
        model = %model,
        provider = ctx.provider.name(),
        prompt_chars = prompt.len(),
        "Calling model"
    );

    let request = ModelRequest {
        prompt: prompt.clone(),
        model_id: model.to_string(),
        parameters,
    };
    // Not raced against cancellation: an in-flight call is allowed to finish.
    let response = ctx
        .provider
        .execute(request)
        .await
        .map_err(|source| FlowError::ModelExecution {
            node_id: ctx.node_id.to_string(),
            source,
        })?;

    let detail = json!({
        "prompt": prompt,
        "model": model,
        "text": response.text,
        "usage": response.usage,
        "cost": response.cost,
    });
    Ok(NodeOutput::value(Value::String(response.text))
        .with_detail(detail)
        .bind_as(output_variable))
}
