use serde_json::{json, Map, Value};

use promptflow_core::flow::{OutputFormat, OutputNode};

use super::{NodeContext, NodeOutput};
use crate::bindings::value_to_text;

/// Format upstream values (or the rendered template) as the flow's result.
pub fn execute(node: &OutputNode, ctx: &NodeContext<'_>) -> NodeOutput {
    let value = match &node.template {
        Some(template) => {
            let rendered = ctx.bindings.render(template);
            match node.format {
                OutputFormat::Json => embed_json(&rendered),
                OutputFormat::PlainText | OutputFormat::Markdown => Value::String(rendered),
            }
        }
        None => match node.format {
            OutputFormat::PlainText => Value::String(plain_text(ctx.upstream)),
            OutputFormat::Json => json_output(ctx.upstream),
            OutputFormat::Markdown => Value::String(markdown(ctx.upstream)),
        },
    };
    NodeOutput::value(value)
}

fn plain_text(upstream: &[(String, Value)]) -> String {
    upstream
        .iter()
        .map(|(_, v)| value_to_text(v))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn markdown(upstream: &[(String, Value)]) -> String {
    match upstream {
        [(_, only)] => value_to_text(only),
        _ => upstream
            .iter()
            .map(|(id, v)| format!("## {}\n\n{}", id, value_to_text(v)))
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}

fn json_output(upstream: &[(String, Value)]) -> Value {
    match upstream {
        [] => Value::Null,
        [(_, only)] => to_json(only),
        _ => {
            let map: Map<String, Value> = upstream
                .iter()
                .map(|(id, v)| (id.clone(), to_json(v)))
                .collect();
            Value::Object(map)
        }
    }
}

fn to_json(value: &Value) -> Value {
    match value {
        Value::String(s) => embed_json(s),
        other => other.clone(),
    }
}

/// Text that parses as JSON is embedded as JSON; anything else is wrapped.
fn embed_json(text: &str) -> Value {
    serde_json::from_str(text.trim()).unwrap_or_else(|_| json!({ "content": text }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptflow_core::config::EngineConfig;
    use promptflow_test_utils::MockProvider;
    use tokio_util::sync::CancellationToken;

    use crate::bindings::Bindings;

    fn run(node: &OutputNode, upstream: &[(String, Value)]) -> Value {
        let provider = MockProvider::echo();
        let config = EngineConfig::default();
        let cancel = CancellationToken::new();
        let mut bindings = Bindings::new();
        bindings.set_str("title", "Report");
        let ctx = NodeContext {
            node_id: "out",
            bindings: &bindings,
            upstream,
            cancel: &cancel,
            config: &config,
            provider: &provider,
            templates: None,
        };
        execute(node, &ctx).value
    }

    fn node(format: OutputFormat) -> OutputNode {
        OutputNode {
            format,
            template: None,
        }
    }

    fn up(pairs: &[(&str, Value)]) -> Vec<(String, Value)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn plain_text_single() {
        let upstream = up(&[("p", json!("looks good"))]);
        assert_eq!(run(&node(OutputFormat::PlainText), &upstream), json!("looks good"));
    }

    #[test]
    fn json_embeds_or_wraps() {
        let upstream = up(&[("p", json!("{\"score\": 7}"))]);
        assert_eq!(run(&node(OutputFormat::Json), &upstream), json!({"score": 7}));

        let upstream = up(&[("p", json!("not json"))]);
        assert_eq!(
            run(&node(OutputFormat::Json), &upstream),
            json!({"content": "not json"})
        );

        let upstream = up(&[("a", json!(1)), ("b", json!("[2]"))]);
        assert_eq!(
            run(&node(OutputFormat::Json), &upstream),
            json!({"a": 1, "b": [2]})
        );
    }

    #[test]
    fn markdown_sections() {
        let upstream = up(&[("summary", json!("short")), ("risks", json!("none"))]);
        assert_eq!(
            run(&node(OutputFormat::Markdown), &upstream),
            json!("## summary\n\nshort\n\n## risks\n\nnone")
        );
    }

    #[test]
    fn template_renders_bindings() {
        let node = OutputNode {
            format: OutputFormat::Markdown,
            template: Some("# {{title}}".into()),
        };
        assert_eq!(run(&node, &[]), json!("# Report"));
    }
}
