use serde_json::json;

use promptflow_core::flow::{
    ConditionOperator, FlowNode, ForEachNode, IterationMode, Operand, OutputFormat, PromptFlow,
};

/// `Variable(lang = "javascript") -> Prompt -> Output(plain_text)`.
pub fn review_flow() -> PromptFlow {
    PromptFlow::new("code-review", "Code review")
        .with_node(FlowNode::variable("lang", "lang", Some(json!("javascript"))))
        .with_node(FlowNode::prompt(
            "review",
            "Review this {{lang}} code: {{code}}",
            "gpt-4o-mini",
        ))
        .with_node(FlowNode::output("out", OutputFormat::PlainText))
        .connect("lang", "review")
        .connect("review", "out")
}

/// `score > 5` picks between two prompt/output branches.
pub fn branching_flow() -> PromptFlow {
    PromptFlow::new("triage", "Triage")
        .with_node(FlowNode::variable("score", "score", Some(json!(0))))
        .with_node(FlowNode::conditional(
            "check",
            Operand::binding("score"),
            ConditionOperator::GreaterThan,
            Some(Operand::literal(5)),
        ))
        .with_node(FlowNode::prompt("praise", "Praise a score of {{score}}", "gpt-4o-mini"))
        .with_node(FlowNode::prompt(
            "critique",
            "Critique a score of {{score}}",
            "gpt-4o-mini",
        ))
        .with_node(FlowNode::output("praise_out", OutputFormat::PlainText))
        .with_node(FlowNode::output("critique_out", OutputFormat::PlainText))
        .connect("score", "check")
        .connect_branch("check", "praise", true)
        .connect_branch("check", "critique", false)
        .connect("praise", "praise_out")
        .connect("critique", "critique_out")
}

/// `files -> loop[summarize] -> out(json)`.
pub fn for_each_flow(mode: IterationMode) -> PromptFlow {
    PromptFlow::new("summaries", "Summaries")
        .with_node(FlowNode::variable("files", "files", Some(json!([]))))
        .with_node(FlowNode::for_each(
            "loop",
            ForEachNode {
                source_variable: "files".into(),
                body: vec!["summarize".into()],
                iteration_mode: mode,
                max_parallelism: Some(2),
                ..Default::default()
            },
        ))
        .with_node(FlowNode::prompt("summarize", "Summarize {{item}}", "gpt-4o-mini"))
        .with_node(FlowNode::output("out", OutputFormat::Json))
        .connect("files", "loop")
        .connect("loop", "summarize")
        .connect("summarize", "loop")
        .connect("loop", "out")
}
