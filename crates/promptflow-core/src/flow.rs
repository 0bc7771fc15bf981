//! In-memory flow graph: nodes with kind-specific payloads, connected by edges.
//!
//! Flows are authored elsewhere and handed to the engine as read-only
//! snapshots. Edges reference nodes by id; whether those ids exist is the
//! validator's business, not the edge's.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::PromptTemplate;

/// Behavioral category of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Prompt,
    Variable,
    Conditional,
    Transform,
    ForEach,
    Output,
    TemplateRef,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Prompt => "prompt",
            Self::Variable => "variable",
            Self::Conditional => "conditional",
            Self::Transform => "transform",
            Self::ForEach => "for_each",
            Self::Output => "output",
            Self::TemplateRef => "template_ref",
        };
        f.write_str(s)
    }
}

/// Calls the model provider with a rendered template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptNode {
    pub template: String,
    /// Model identifier passed to the provider. Required.
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Extra binding name for the response text, besides the node id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
}

/// Injects a named value into the bindings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableNode {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    Exists,
}

/// One side of a comparison: a JSON literal, or a binding reference.
///
/// References are dot paths into the bindings, e.g. `review.score` or
/// `items.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Operand {
    Literal(Value),
    Binding(String),
}

impl Operand {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    pub fn binding(path: impl Into<String>) -> Self {
        Self::Binding(path.into())
    }
}

/// Evaluates `left <operator> right` and routes to the `"true"` or
/// `"false"` branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalNode {
    pub left: Operand,
    pub operator: ConditionOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<Operand>,
}

/// Built-in, side-effect-free transforms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum TransformNode {
    /// Render a template over the bindings.
    Format { template: String },
    /// Keep the elements of an array binding that satisfy a comparison.
    Filter {
        source: String,
        /// Field of each element to compare; the element itself when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        operator: ConditionOperator,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
    /// Render a template once per element of an array binding.
    Map { source: String, template: String },
    /// A binding path followed by `|`-separated functions.
    Expression { expression: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationMode {
    #[default]
    Sequential,
    Parallel,
}

/// Runs a sub-region of the flow once per element of a list binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForEachNode {
    pub source_variable: String,
    #[serde(default = "default_item_variable")]
    pub item_variable: String,
    #[serde(default = "default_index_variable")]
    pub index_variable: String,
    /// Node ids forming the loop body. They must be acyclic among themselves.
    #[serde(default)]
    pub body: Vec<String>,
    #[serde(default)]
    pub iteration_mode: IterationMode,
    /// Upper bound on concurrent items in parallel mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallelism: Option<usize>,
}

impl Default for ForEachNode {
    fn default() -> Self {
        Self {
            source_variable: String::new(),
            item_variable: default_item_variable(),
            index_variable: default_index_variable(),
            body: Vec::new(),
            iteration_mode: IterationMode::default(),
            max_parallelism: None,
        }
    }
}

fn default_item_variable() -> String {
    "item".to_string()
}

fn default_index_variable() -> String {
    "index".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    PlainText,
    Json,
    Markdown,
}

/// Formats upstream results into a terminal flow output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputNode {
    #[serde(default)]
    pub format: OutputFormat,
    /// Rendered over the bindings instead of using upstream values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Executes a stored template, looked up by id at run time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateRefNode {
    pub template_id: String,
    /// Overrides the stored template's model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Merged over the stored template's parameters.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
}

/// Kind-specific node payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeData {
    Prompt(PromptNode),
    Variable(VariableNode),
    Conditional(ConditionalNode),
    Transform(TransformNode),
    ForEach(ForEachNode),
    Output(OutputNode),
    TemplateRef(TemplateRefNode),
}

impl NodeData {
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Prompt(_) => NodeKind::Prompt,
            Self::Variable(_) => NodeKind::Variable,
            Self::Conditional(_) => NodeKind::Conditional,
            Self::Transform(_) => NodeKind::Transform,
            Self::ForEach(_) => NodeKind::ForEach,
            Self::Output(_) => NodeKind::Output,
            Self::TemplateRef(_) => NodeKind::TemplateRef,
        }
    }
}

/// A node in a flow. Owned by its flow; `id` is unique within it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub data: NodeData,
}

impl FlowNode {
    pub fn new(id: impl Into<String>, data: NodeData) -> Self {
        Self {
            id: id.into(),
            label: None,
            data,
        }
    }

    pub fn prompt(
        id: impl Into<String>,
        template: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            NodeData::Prompt(PromptNode {
                template: template.into(),
                model: model.into(),
                ..Default::default()
            }),
        )
    }

    pub fn variable(
        id: impl Into<String>,
        name: impl Into<String>,
        default: Option<Value>,
    ) -> Self {
        Self::new(
            id,
            NodeData::Variable(VariableNode {
                name: name.into(),
                default,
            }),
        )
    }

    pub fn conditional(
        id: impl Into<String>,
        left: Operand,
        operator: ConditionOperator,
        right: Option<Operand>,
    ) -> Self {
        Self::new(
            id,
            NodeData::Conditional(ConditionalNode {
                left,
                operator,
                right,
            }),
        )
    }

    pub fn transform(id: impl Into<String>, transform: TransformNode) -> Self {
        Self::new(id, NodeData::Transform(transform))
    }

    pub fn for_each(id: impl Into<String>, node: ForEachNode) -> Self {
        Self::new(id, NodeData::ForEach(node))
    }

    pub fn output(id: impl Into<String>, format: OutputFormat) -> Self {
        Self::new(
            id,
            NodeData::Output(OutputNode {
                format,
                template: None,
            }),
        )
    }

    pub fn template_ref(id: impl Into<String>, template_id: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeData::TemplateRef(TemplateRefNode {
                template_id: template_id.into(),
                ..Default::default()
            }),
        )
    }

    pub fn kind(&self) -> NodeKind {
        self.data.kind()
    }
}

/// A directed connection between two nodes.
///
/// `source_handle` discriminates Conditional branches (`"true"` / `"false"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub id: String,
    pub source_node_id: String,
    pub target_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

impl FlowEdge {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_node_id: source.into(),
            target_node_id: target.into(),
            source_handle: None,
        }
    }

    /// An edge leaving a Conditional on the given branch.
    pub fn branch(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        branch: bool,
    ) -> Self {
        Self {
            source_handle: Some(branch.to_string()),
            ..Self::new(id, source, target)
        }
    }

    /// The Conditional branch this edge leaves on, if its handle names one.
    pub fn branch_value(&self) -> Option<bool> {
        self.source_handle.as_deref().and_then(parse_branch_handle)
    }
}

/// Read a branch handle. Matching ignores surrounding whitespace and ASCII
/// case, so `"TRUE"` and `" true "` both name the true branch.
pub fn parse_branch_handle(handle: &str) -> Option<bool> {
    let handle = handle.trim();
    if handle.eq_ignore_ascii_case("true") {
        Some(true)
    } else if handle.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// A named, executable prompt pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptFlow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
    /// Flow-level initial bindings.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Nodes allowed to have no incoming edge. When empty, every Variable
    /// node plus the first declared node qualify.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry_nodes: Vec<String>,
}

impl PromptFlow {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_node(mut self, node: FlowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: FlowEdge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Connect `source` to `target` with an auto-named edge.
    pub fn connect(self, source: &str, target: &str) -> Self {
        let id = format!("{}->{}", source, target);
        self.with_edge(FlowEdge::new(id, source, target))
    }

    /// Connect a Conditional's branch to `target` with an auto-named edge.
    pub fn connect_branch(self, source: &str, target: &str, branch: bool) -> Self {
        let id = format!("{}:{}->{}", source, branch, target);
        self.with_edge(FlowEdge::branch(id, source, target, branch))
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Wrap a stored template into a `prompt -> output` flow.
    pub fn from_template(template: &PromptTemplate) -> Self {
        let prompt = FlowNode::new(
            "prompt",
            NodeData::Prompt(PromptNode {
                template: template.content.clone(),
                model: template.model.clone(),
                parameters: template.parameters.clone(),
                output_variable: None,
            }),
        );
        Self::new(format!("template:{}", template.id), template.name.clone())
            .with_node(prompt)
            .with_node(FlowNode::output("output", OutputFormat::PlainText))
            .connect("prompt", "output")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_json_shape() {
        let json = serde_json::json!({
            "id": "p1",
            "data": {
                "kind": "prompt",
                "template": "Hello {{name}}",
                "model": "gpt-4o",
                "parameters": {"temperature": 0.2}
            }
        });
        let node: FlowNode = serde_json::from_value(json).unwrap();
        assert_eq!(node.kind(), NodeKind::Prompt);
        match node.data {
            NodeData::Prompt(p) => {
                assert_eq!(p.model, "gpt-4o");
                assert_eq!(p.parameters["temperature"], serde_json::json!(0.2));
            }
            other => panic!("expected prompt, got {:?}", other.kind()),
        }
    }

    #[test]
    fn for_each_defaults() {
        let json = serde_json::json!({
            "id": "loop",
            "data": {"kind": "for_each", "source_variable": "files", "body": ["p"]}
        });
        let node: FlowNode = serde_json::from_value(json).unwrap();
        let NodeData::ForEach(fe) = node.data else {
            panic!("expected for_each");
        };
        assert_eq!(fe.item_variable, "item");
        assert_eq!(fe.index_variable, "index");
        assert_eq!(fe.iteration_mode, IterationMode::Sequential);
    }

    #[test]
    fn conditional_operands() {
        let json = serde_json::json!({
            "id": "c",
            "data": {
                "kind": "conditional",
                "left": {"type": "binding", "value": "review.score"},
                "operator": "greater_than",
                "right": {"type": "literal", "value": 7}
            }
        });
        let node: FlowNode = serde_json::from_value(json).unwrap();
        let NodeData::Conditional(c) = node.data else {
            panic!("expected conditional");
        };
        assert_eq!(c.left, Operand::binding("review.score"));
        assert_eq!(c.right, Some(Operand::literal(7)));
    }

    #[test]
    fn branch_edge_handle() {
        let e = FlowEdge::branch("e", "c", "t", true);
        assert_eq!(e.source_handle.as_deref(), Some("true"));
        let e = FlowEdge::branch("e", "c", "f", false);
        assert_eq!(e.source_handle.as_deref(), Some("false"));
    }

    #[test]
    fn template_wraps_into_flow() {
        let template = PromptTemplate::new("t1", "Greeter", "Hi {{name}}", "gpt-4o");
        let flow = PromptFlow::from_template(&template);
        assert_eq!(flow.nodes.len(), 2);
        assert_eq!(flow.edges.len(), 1);
        assert_eq!(flow.nodes[0].kind(), NodeKind::Prompt);
        assert_eq!(flow.nodes[1].kind(), NodeKind::Output);
    }
}
