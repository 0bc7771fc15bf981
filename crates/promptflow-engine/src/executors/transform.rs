//! Deterministic, side-effect-free transforms.
//!
//! Expressions are a binding path followed by `|`-separated functions:
//!
//! ```text
//! review.tags | join(", ") | upper
//! summary | default("none") | trim
//! ```
//!
//! Functions: `upper`, `lower`, `trim`, `length`, `first`, `last`,
//! `reverse`, `json`, `join(sep)`, `split(sep)`, `default(text)`.
//! A quoted first segment is a string literal.

use serde_json::{json, Value};

use promptflow_core::error::{FlowError, Result};
use promptflow_core::flow::{ConditionOperator, TransformNode};
use promptflow_core::template;

use super::{NodeContext, NodeOutput};
use crate::bindings::{as_list, lookup_path, value_to_text, Bindings};
use crate::condition::evaluate;

pub fn execute(node: &TransformNode, ctx: &NodeContext<'_>) -> Result<NodeOutput> {
    let value = match node {
        TransformNode::Format { template } => Value::String(ctx.bindings.render(template)),
        TransformNode::Filter {
            source,
            field,
            operator,
            value,
        } => {
            let items = source_list(ctx, source)?;
            Value::Array(filter(items, field.as_deref(), *operator, value.as_ref()))
        }
        TransformNode::Map { source, template } => {
            let items = source_list(ctx, source)?;
            Value::Array(map(ctx.bindings, items, template))
        }
        TransformNode::Expression { expression } => {
            evaluate_expression(expression, ctx.bindings)
                .map_err(|msg| FlowError::node(ctx.node_id, msg))?
        }
    };
    Ok(NodeOutput::value(value))
}

fn source_list(ctx: &NodeContext<'_>, source: &str) -> Result<Vec<Value>> {
    let value = ctx
        .bindings
        .get_path(source.trim())
        .ok_or_else(|| FlowError::node(ctx.node_id, format!("binding '{}' is not set", source)))?;
    as_list(value)
        .ok_or_else(|| FlowError::node(ctx.node_id, format!("binding '{}' is not a list", source)))
}

fn filter(
    items: Vec<Value>,
    field: Option<&str>,
    operator: ConditionOperator,
    expected: Option<&Value>,
) -> Vec<Value> {
    items
        .into_iter()
        .filter(|item| {
            let subject = match field {
                Some(f) => lookup_path(item, f),
                None => Some(item),
            };
            evaluate(operator, subject, expected)
        })
        .collect()
}

/// Render `template` once per element; `item`, `item.<path>` and `index`
/// resolve against the element, everything else against the bindings.
fn map(bindings: &Bindings, items: Vec<Value>, template_text: &str) -> Vec<Value> {
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let rendered = template::resolve_with(template_text, |name| {
                if name == "index" {
                    return Some(index.to_string());
                }
                if name == "item" {
                    return Some(value_to_text(item));
                }
                if let Some(path) = name.strip_prefix("item.") {
                    return lookup_path(item, path).map(value_to_text);
                }
                bindings.get_path(name).map(value_to_text)
            });
            Value::String(rendered)
        })
        .collect()
}

/// Evaluate an expression against the bindings. Errors are plain messages;
/// the caller attaches the node id.
pub fn evaluate_expression(
    expression: &str,
    bindings: &Bindings,
) -> std::result::Result<Value, String> {
    let mut stages = split_stages(expression).into_iter();
    let head = stages.next().unwrap_or_default();
    let mut value = match parse_literal(&head) {
        Some(text) => Value::String(text),
        None => bindings.get_path(&head).cloned().unwrap_or(Value::Null),
    };
    for stage in stages {
        let (name, arg) = parse_call(&stage)?;
        value = apply(&name, arg.as_deref(), value)?;
    }
    Ok(value)
}

/// Split on `|` outside of quotes.
fn split_stages(expression: &str) -> Vec<String> {
    let mut stages = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in expression.chars() {
        match (c, quote) {
            ('"' | '\'', None) => {
                quote = Some(c);
                current.push(c);
            }
            (c, Some(q)) if c == q => {
                quote = None;
                current.push(c);
            }
            ('|', None) => stages.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(c),
        }
    }
    stages.push(current.trim().to_string());
    stages
}

fn parse_literal(segment: &str) -> Option<String> {
    let s = segment.trim();
    for q in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return Some(s[1..s.len() - 1].to_string());
        }
    }
    None
}

fn parse_call(stage: &str) -> std::result::Result<(String, Option<String>), String> {
    let stage = stage.trim();
    match stage.split_once('(') {
        None => Ok((stage.to_string(), None)),
        Some((name, rest)) => {
            let inner = rest
                .strip_suffix(')')
                .ok_or_else(|| format!("unclosed argument list in '{}'", stage))?;
            let arg = parse_literal(inner).unwrap_or_else(|| inner.trim().to_string());
            Ok((name.trim().to_string(), Some(arg)))
        }
    }
}

fn apply(name: &str, arg: Option<&str>, value: Value) -> std::result::Result<Value, String> {
    let out = match name {
        "upper" => json!(value_to_text(&value).to_uppercase()),
        "lower" => json!(value_to_text(&value).to_lowercase()),
        "trim" => json!(value_to_text(&value).trim()),
        "length" => json!(match &value {
            Value::Array(items) => items.len(),
            Value::Object(map) => map.len(),
            Value::Null => 0,
            other => value_to_text(other).chars().count(),
        }),
        "first" | "last" => match as_list(&value) {
            Some(items) => {
                let picked = if name == "first" {
                    items.first()
                } else {
                    items.last()
                };
                picked.cloned().unwrap_or(Value::Null)
            }
            None => {
                let text = value_to_text(&value);
                let c = if name == "first" {
                    text.chars().next()
                } else {
                    text.chars().last()
                };
                c.map(|c| json!(c.to_string())).unwrap_or(Value::Null)
            }
        },
        "reverse" => match as_list(&value) {
            Some(mut items) => {
                items.reverse();
                Value::Array(items)
            }
            None => json!(value_to_text(&value).chars().rev().collect::<String>()),
        },
        "json" => match &value {
            Value::String(s) => {
                serde_json::from_str(s).map_err(|e| format!("json(): {}", e))?
            }
            _ => value,
        },
        "join" => {
            let sep = arg.unwrap_or(",");
            let items = as_list(&value).ok_or("join() needs a list")?;
            json!(items.iter().map(value_to_text).collect::<Vec<_>>().join(sep))
        }
        "split" => {
            let sep = arg.unwrap_or(",");
            let text = value_to_text(&value);
            Value::Array(text.split(sep).map(|s| json!(s)).collect())
        }
        "default" => {
            let empty = value.is_null() || value.as_str().is_some_and(str::is_empty);
            if empty {
                json!(arg.unwrap_or_default())
            } else {
                value
            }
        }
        other => return Err(format!("unknown function '{}'", other)),
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptflow_core::config::EngineConfig;
    use promptflow_test_utils::MockProvider;
    use tokio_util::sync::CancellationToken;

    fn run(node: &TransformNode, bindings: &Bindings) -> Result<NodeOutput> {
        let provider = MockProvider::echo();
        let config = EngineConfig::default();
        let cancel = CancellationToken::new();
        let ctx = NodeContext {
            node_id: "t",
            bindings,
            upstream: &[],
            cancel: &cancel,
            config: &config,
            provider: &provider,
            templates: None,
        };
        execute(node, &ctx)
    }

    fn bindings() -> Bindings {
        let mut b = Bindings::new();
        b.set("files", json!([
            {"name": "a.rs", "lines": 120},
            {"name": "b.rs", "lines": 8},
            {"name": "c.py", "lines": 300}
        ]));
        b.set_str("lang", "rust");
        b.set_str("csv", "x, y ,z");
        b
    }

    #[test]
    fn format() {
        let node = TransformNode::Format {
            template: "lang={{lang}}".into(),
        };
        assert_eq!(run(&node, &bindings()).unwrap().value, json!("lang=rust"));
    }

    #[test]
    fn filter_by_field() {
        let node = TransformNode::Filter {
            source: "files".into(),
            field: Some("lines".into()),
            operator: ConditionOperator::GreaterThan,
            value: Some(json!(100)),
        };
        let out = run(&node, &bindings()).unwrap().value;
        let names: Vec<&str> = out
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.rs", "c.py"]);
    }

    #[test]
    fn map_items() {
        let node = TransformNode::Map {
            source: "files".into(),
            template: "{{index}}:{{item.name}} ({{lang}})".into(),
        };
        let out = run(&node, &bindings()).unwrap().value;
        assert_eq!(out, json!(["0:a.rs (rust)", "1:b.rs (rust)", "2:c.py (rust)"]));
    }

    #[test]
    fn filter_non_list_fails() {
        let node = TransformNode::Map {
            source: "lang".into(),
            template: "{{item}}".into(),
        };
        let err = run(&node, &bindings()).unwrap_err();
        assert_eq!(err.node_id(), Some("t"));
    }

    #[test]
    fn expressions() {
        let b = bindings();
        assert_eq!(evaluate_expression("lang | upper", &b).unwrap(), json!("RUST"));
        assert_eq!(evaluate_expression("files | length", &b).unwrap(), json!(3));
        assert_eq!(
            evaluate_expression("files | first", &b).unwrap()["name"],
            json!("a.rs")
        );
        assert_eq!(
            evaluate_expression("csv | split(\",\") | last | trim", &b).unwrap(),
            json!("z")
        );
        assert_eq!(
            evaluate_expression("missing | default('n/a')", &b).unwrap(),
            json!("n/a")
        );
        assert_eq!(
            evaluate_expression("'a|b' | split('|') | join(\"-\")", &b).unwrap(),
            json!("a-b")
        );
        assert!(evaluate_expression("lang | explode", &b).is_err());
    }
}
