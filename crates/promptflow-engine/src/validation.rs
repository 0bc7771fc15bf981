//! Structural validation and execution planning.
//!
//! A flow is organised into scopes: the top level, plus one scope per
//! ForEach body. Inside a scope, nodes that belong to a nested loop are
//! represented by that loop's ForEach node, so every scope is a plain graph
//! that must be acyclic. Edges between a ForEach and its own body (entry
//! edges and back-edges) are internal to the loop and ignored by the
//! enclosing scope.

use std::collections::{BTreeSet, HashMap, HashSet};

use promptflow_core::error::{FlowError, Result, ValidationError, ValidationErrorKind};
use promptflow_core::flow::{
    ConditionOperator, FlowNode, NodeData, NodeKind, PromptFlow, TransformNode,
};

/// An edge as seen from inside one scope.
#[derive(Debug, Clone)]
pub struct ScopeEdge {
    /// Index into `PromptFlow::edges`.
    pub edge: usize,
    /// Scope member the edge leaves from.
    pub source: usize,
    /// Scope member the edge enters.
    pub target: usize,
    /// Branch discriminator, kept only when `source` is the edge's own
    /// source node.
    pub handle: Option<String>,
}

/// Execution plan for one scope.
#[derive(Debug, Clone, Default)]
pub struct ScopePlan {
    /// Members in dispatch order (topological, ties broken by declaration order).
    pub order: Vec<usize>,
    pub incoming: HashMap<usize, Vec<ScopeEdge>>,
    pub outgoing: HashMap<usize, Vec<ScopeEdge>>,
}

impl ScopePlan {
    pub fn incoming(&self, node: usize) -> &[ScopeEdge] {
        self.incoming.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Members with no outgoing edge inside the scope.
    pub fn terminals(&self) -> Vec<usize> {
        self.order
            .iter()
            .copied()
            .filter(|n| self.outgoing.get(n).map_or(true, |e| e.is_empty()))
            .collect()
    }
}

/// A validated flow with its precomputed execution plan.
///
/// Compile once, run many times: the plan is immutable and can be shared
/// across concurrent runs.
#[derive(Debug, Clone)]
pub struct FlowPlan {
    flow: PromptFlow,
    root: ScopePlan,
    bodies: HashMap<usize, ScopePlan>,
}

impl FlowPlan {
    /// Validate `flow` and build its plan. Any validation error rejects the
    /// whole flow.
    pub fn compile(flow: &PromptFlow) -> Result<Self> {
        let mut graph = Graph::new(flow);
        let errors = graph.validate();
        if !errors.is_empty() {
            return Err(FlowError::Validation(errors));
        }
        let root = graph.scope_plan(None);
        let bodies = graph
            .loops()
            .map(|fe| (fe, graph.scope_plan(Some(fe))))
            .collect();
        Ok(Self {
            flow: flow.clone(),
            root,
            bodies,
        })
    }

    pub fn flow(&self) -> &PromptFlow {
        &self.flow
    }

    pub fn root(&self) -> &ScopePlan {
        &self.root
    }

    /// Body plan of the ForEach node at `index`.
    pub fn body(&self, index: usize) -> Option<&ScopePlan> {
        self.bodies.get(&index)
    }

    pub fn node(&self, index: usize) -> &FlowNode {
        &self.flow.nodes[index]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.flow.nodes.iter().position(|n| n.id == id)
    }
}

/// Check `flow` for structural problems. An empty list means it can run.
pub fn validate(flow: &PromptFlow) -> Vec<ValidationError> {
    Graph::new(flow).validate()
}

struct Graph<'a> {
    flow: &'a PromptFlow,
    index: HashMap<&'a str, usize>,
    /// Direct owning ForEach of each loop body member.
    owner: HashMap<usize, usize>,
    /// False when loop ownership is cyclic; scope checks are then skipped.
    nesting_ok: bool,
    errors: Vec<ValidationError>,
}

impl<'a> Graph<'a> {
    fn new(flow: &'a PromptFlow) -> Self {
        let mut errors = Vec::new();
        let mut index = HashMap::new();
        for (i, node) in flow.nodes.iter().enumerate() {
            if index.insert(node.id.as_str(), i).is_some() {
                errors.push(ValidationError::for_node(
                    ValidationErrorKind::DuplicateNodeId,
                    &node.id,
                    "node id is declared more than once",
                ));
            }
        }

        let mut owner: HashMap<usize, usize> = HashMap::new();
        for (i, node) in flow.nodes.iter().enumerate() {
            let NodeData::ForEach(fe) = &node.data else {
                continue;
            };
            for member in &fe.body {
                match index.get(member.as_str()) {
                    None => errors.push(ValidationError::for_node(
                        ValidationErrorKind::InvalidLoopBody,
                        &node.id,
                        format!("body references unknown node '{}'", member),
                    )),
                    Some(&m) if m == i => errors.push(ValidationError::for_node(
                        ValidationErrorKind::InvalidLoopBody,
                        &node.id,
                        "loop body contains the loop itself",
                    )),
                    Some(&m) => {
                        if let Some(&other) = owner.get(&m) {
                            if other != i {
                                errors.push(ValidationError::for_node(
                                    ValidationErrorKind::InvalidLoopBody,
                                    member,
                                    format!(
                                        "node belongs to two loop bodies ('{}' and '{}')",
                                        flow.nodes[other].id, node.id
                                    ),
                                ));
                            }
                            continue;
                        }
                        owner.insert(m, i);
                    }
                }
            }
        }

        let mut graph = Self {
            flow,
            index,
            owner,
            nesting_ok: true,
            errors,
        };
        graph.check_nesting();
        graph
    }

    /// Loop ownership must form a tree: no loop may (transitively) contain itself.
    fn check_nesting(&mut self) {
        let mut broken = Vec::new();
        for &start in self.owner.keys() {
            let mut seen = HashSet::from([start]);
            let mut current = start;
            while let Some(&parent) = self.owner.get(&current) {
                if !seen.insert(parent) {
                    broken.push(start);
                    break;
                }
                current = parent;
            }
        }
        broken.sort_unstable();
        if !broken.is_empty() {
            self.nesting_ok = false;
            self.owner.clear();
        }
        for node in broken {
            self.errors.push(ValidationError::for_node(
                ValidationErrorKind::InvalidLoopBody,
                &self.flow.nodes[node].id,
                "loop bodies are nested in a cycle",
            ));
        }
    }

    fn loops(&self) -> impl Iterator<Item = usize> + '_ {
        self.flow
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.kind() == NodeKind::ForEach)
            .map(|(i, _)| i)
    }

    /// The member of `scope` that stands for `node`: the node itself, or
    /// the nested loop that contains it. `None` when `node` lies outside.
    fn representative(&self, scope: Option<usize>, node: usize) -> Option<usize> {
        let mut current = node;
        for _ in 0..=self.flow.nodes.len() {
            let parent = self.owner.get(&current).copied();
            if parent == scope {
                return Some(current);
            }
            current = parent?;
        }
        None
    }

    fn members(&self, scope: Option<usize>) -> Vec<usize> {
        (0..self.flow.nodes.len())
            .filter(|n| self.owner.get(n).copied() == scope)
            .collect()
    }

    fn scope_edges(&self, scope: Option<usize>) -> Vec<ScopeEdge> {
        let mut edges = Vec::new();
        for (i, edge) in self.flow.edges.iter().enumerate() {
            let (Some(&src), Some(&tgt)) = (
                self.index.get(edge.source_node_id.as_str()),
                self.index.get(edge.target_node_id.as_str()),
            ) else {
                continue;
            };
            let (Some(source), Some(target)) =
                (self.representative(scope, src), self.representative(scope, tgt))
            else {
                continue;
            };
            if source == target {
                continue;
            }
            edges.push(ScopeEdge {
                edge: i,
                source,
                target,
                handle: if source == src {
                    edge.source_handle.clone()
                } else {
                    None
                },
            });
        }
        edges
    }

    fn scope_plan(&self, scope: Option<usize>) -> ScopePlan {
        let members = self.members(scope);
        let mut plan = ScopePlan::default();
        for edge in self.scope_edges(scope) {
            plan.outgoing.entry(edge.source).or_default().push(edge.clone());
            plan.incoming.entry(edge.target).or_default().push(edge);
        }

        // Kahn's algorithm; the BTreeSet keeps ties in declaration order.
        let mut in_degree: HashMap<usize, usize> = members
            .iter()
            .map(|&m| (m, plan.incoming(m).len()))
            .collect();
        let mut ready: BTreeSet<usize> = members
            .iter()
            .copied()
            .filter(|m| in_degree[m] == 0)
            .collect();
        while let Some(next) = ready.pop_first() {
            plan.order.push(next);
            for edge in plan.outgoing.get(&next).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(&edge.target) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(edge.target);
                    }
                }
            }
        }
        plan
    }

    fn validate(&mut self) -> Vec<ValidationError> {
        self.check_edges();
        self.check_payloads();
        self.check_branches();
        if self.nesting_ok {
            self.check_scope(None);
            let loops: Vec<usize> = self.loops().collect();
            for fe in loops {
                self.check_scope(Some(fe));
            }
        }
        std::mem::take(&mut self.errors)
    }

    fn check_edges(&mut self) {
        for edge in &self.flow.edges {
            for (end, id) in [
                ("source", &edge.source_node_id),
                ("target", &edge.target_node_id),
            ] {
                if !self.index.contains_key(id.as_str()) {
                    self.errors.push(ValidationError::for_edge(
                        ValidationErrorKind::DanglingEdge,
                        &edge.id,
                        format!("{} '{}' does not exist", end, id),
                    ));
                }
            }
        }
    }

    fn check_payloads(&mut self) {
        for node in &self.flow.nodes {
            for field in missing_fields(node) {
                self.errors.push(ValidationError::for_node(
                    ValidationErrorKind::MissingRequiredField,
                    &node.id,
                    format!("{} node requires '{}'", node.kind(), field),
                ));
            }
        }
    }

    /// At most one outgoing edge per branch of a Conditional. Handles are
    /// compared the way the engine reads them.
    fn check_branches(&mut self) {
        for node in &self.flow.nodes {
            if node.kind() != NodeKind::Conditional {
                continue;
            }
            for branch in [true, false] {
                let count = self
                    .flow
                    .edges
                    .iter()
                    .filter(|e| e.source_node_id == node.id && e.branch_value() == Some(branch))
                    .count();
                if count > 1 {
                    self.errors.push(ValidationError::for_node(
                        ValidationErrorKind::DuplicateBranch,
                        &node.id,
                        format!("{} edges leave the '{}' branch", count, branch),
                    ));
                }
            }
        }
    }

    fn check_scope(&mut self, scope: Option<usize>) {
        let members = self.members(scope);
        let edges = self.scope_edges(scope);

        let mut adjacency: HashMap<usize, Vec<usize>> = HashMap::new();
        for e in &edges {
            adjacency.entry(e.source).or_default().push(e.target);
        }

        // Orphans only matter at the top level; loop bodies are entered by
        // their ForEach.
        if scope.is_none() {
            let entries = self.entry_nodes();
            let has_incoming: HashSet<usize> = edges.iter().map(|e| e.target).collect();
            for &m in &members {
                if !has_incoming.contains(&m) && !entries.contains(&m) {
                    self.errors.push(ValidationError::for_node(
                        ValidationErrorKind::OrphanNode,
                        &self.flow.nodes[m].id,
                        "node has no incoming edge and is not an entry node",
                    ));
                }
            }
        }

        let mut visited = HashSet::new();
        let mut reported = HashSet::new();
        for &m in &members {
            if !visited.contains(&m) {
                self.find_cycles(m, &adjacency, &mut visited, &mut reported);
            }
        }
    }

    /// Depth-first search from `start` with an explicit stack of
    /// `(node, next child index)` frames; a back-edge to a node still on the
    /// stack is a cycle.
    fn find_cycles(
        &mut self,
        start: usize,
        adjacency: &HashMap<usize, Vec<usize>>,
        visited: &mut HashSet<usize>,
        reported: &mut HashSet<usize>,
    ) {
        let no_children: &[usize] = &[];
        let children = |n: usize| adjacency.get(&n).map(Vec::as_slice).unwrap_or(no_children);

        let mut on_stack = HashSet::from([start]);
        let mut stack = vec![(start, 0usize)];
        visited.insert(start);

        while let Some(frame) = stack.last_mut() {
            let (node, child) = *frame;
            let Some(&next) = children(node).get(child) else {
                on_stack.remove(&node);
                stack.pop();
                continue;
            };
            frame.1 += 1;

            if on_stack.contains(&next) {
                if reported.insert(next) {
                    self.errors.push(ValidationError::for_node(
                        ValidationErrorKind::InvalidCycle,
                        &self.flow.nodes[next].id,
                        format!(
                            "cycle through '{}' -> '{}'",
                            self.flow.nodes[node].id, self.flow.nodes[next].id
                        ),
                    ));
                }
            } else if visited.insert(next) {
                on_stack.insert(next);
                stack.push((next, 0));
            }
        }
    }

    fn entry_nodes(&self) -> HashSet<usize> {
        if !self.flow.entry_nodes.is_empty() {
            return self
                .flow
                .entry_nodes
                .iter()
                .filter_map(|id| self.index.get(id.as_str()).copied())
                .collect();
        }
        let mut entries: HashSet<usize> = self
            .flow
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.kind() == NodeKind::Variable)
            .map(|(i, _)| i)
            .collect();
        if let Some(first) = self.members(None).first() {
            entries.insert(*first);
        }
        entries
    }
}

fn missing_fields(node: &FlowNode) -> Vec<&'static str> {
    let mut missing = Vec::new();
    let mut require = |present: bool, field: &'static str| {
        if !present {
            missing.push(field);
        }
    };
    match &node.data {
        NodeData::Prompt(p) => {
            require(!p.template.trim().is_empty(), "template");
            require(!p.model.trim().is_empty(), "model");
        }
        NodeData::Variable(v) => require(!v.name.trim().is_empty(), "name"),
        NodeData::Conditional(c) => {
            require(
                c.operator == ConditionOperator::Exists || c.right.is_some(),
                "right",
            );
        }
        NodeData::Transform(t) => match t {
            TransformNode::Format { template } => require(!template.is_empty(), "template"),
            TransformNode::Filter {
                source,
                operator,
                value,
                ..
            } => {
                require(!source.trim().is_empty(), "source");
                require(*operator == ConditionOperator::Exists || value.is_some(), "value");
            }
            TransformNode::Map { source, template } => {
                require(!source.trim().is_empty(), "source");
                require(!template.is_empty(), "template");
            }
            TransformNode::Expression { expression } => {
                require(!expression.trim().is_empty(), "expression");
            }
        },
        NodeData::ForEach(fe) => {
            require(!fe.source_variable.trim().is_empty(), "source_variable");
            require(!fe.item_variable.trim().is_empty(), "item_variable");
            require(!fe.body.is_empty(), "body");
        }
        NodeData::Output(_) => {}
        NodeData::TemplateRef(t) => require(!t.template_id.trim().is_empty(), "template_id"),
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptflow_core::flow::{
        FlowEdge, FlowNode, ForEachNode, Operand, OutputFormat, PromptFlow,
    };
    use serde_json::json;

    fn kinds(errors: &[ValidationError]) -> Vec<ValidationErrorKind> {
        errors.iter().map(|e| e.kind).collect()
    }

    fn linear() -> PromptFlow {
        PromptFlow::new("f", "Linear")
            .with_node(FlowNode::variable("lang", "lang", Some(json!("javascript"))))
            .with_node(FlowNode::prompt("review", "Review {{lang}}", "gpt-4o"))
            .with_node(FlowNode::output("out", OutputFormat::PlainText))
            .connect("lang", "review")
            .connect("review", "out")
    }

    fn looped() -> PromptFlow {
        PromptFlow::new("f", "Loop")
            .with_node(FlowNode::variable("files", "files", Some(json!(["a", "b"]))))
            .with_node(FlowNode::for_each(
                "loop",
                ForEachNode {
                    source_variable: "files".into(),
                    item_variable: "item".into(),
                    index_variable: "index".into(),
                    body: vec!["summarize".into(), "shorten".into()],
                    ..Default::default()
                },
            ))
            .with_node(FlowNode::prompt("summarize", "Summarize {{item}}", "m"))
            .with_node(FlowNode::prompt("shorten", "Shorten {{summarize}}", "m"))
            .with_node(FlowNode::output("out", OutputFormat::Json))
            .connect("files", "loop")
            .connect("loop", "summarize")
            .connect("summarize", "shorten")
            .connect("shorten", "loop")
            .connect("loop", "out")
    }

    #[test]
    fn valid_linear_flow() {
        assert!(validate(&linear()).is_empty());
        let plan = FlowPlan::compile(&linear()).unwrap();
        let ids: Vec<&str> = plan.root().order.iter().map(|&i| plan.node(i).id.as_str()).collect();
        assert_eq!(ids, vec!["lang", "review", "out"]);
    }

    #[test]
    fn dangling_edge() {
        let flow = linear().connect("review", "ghost");
        let errors = validate(&flow);
        assert_eq!(kinds(&errors), vec![ValidationErrorKind::DanglingEdge]);
        assert_eq!(errors[0].edge_id.as_deref(), Some("review->ghost"));
    }

    #[test]
    fn orphan_node() {
        let flow = linear().with_node(FlowNode::prompt("lonely", "hi", "m"));
        let errors = validate(&flow);
        assert_eq!(kinds(&errors), vec![ValidationErrorKind::OrphanNode]);
        assert_eq!(errors[0].node_id.as_deref(), Some("lonely"));
    }

    #[test]
    fn declared_entry_nodes() {
        let mut flow = linear().with_node(FlowNode::prompt("second", "hi", "m"));
        flow.entry_nodes = vec!["lang".into(), "second".into()];
        assert!(validate(&flow).is_empty());
    }

    #[test]
    fn cycle_detected() {
        let flow = linear().connect("out", "review");
        let errors = validate(&flow);
        assert!(kinds(&errors).contains(&ValidationErrorKind::InvalidCycle));
        assert!(FlowPlan::compile(&flow).is_err());
    }

    #[test]
    fn missing_model() {
        let flow = linear().with_node(FlowNode::prompt("p2", "text", "")).connect("out", "p2");
        let errors = validate(&flow);
        assert_eq!(kinds(&errors), vec![ValidationErrorKind::MissingRequiredField]);
        assert!(errors[0].message.contains("model"));
    }

    #[test]
    fn duplicate_branch() {
        let flow = PromptFlow::new("f", "Branch")
            .with_node(FlowNode::variable("v", "v", None))
            .with_node(FlowNode::conditional(
                "c",
                Operand::binding("v"),
                ConditionOperator::Exists,
                None,
            ))
            .with_node(FlowNode::output("a", OutputFormat::PlainText))
            .with_node(FlowNode::output("b", OutputFormat::PlainText))
            .connect("v", "c")
            .connect_branch("c", "a", true)
            .with_edge(FlowEdge::branch("dup", "c", "b", true));
        assert_eq!(kinds(&validate(&flow)), vec![ValidationErrorKind::DuplicateBranch]);
    }

    #[test]
    fn loop_back_edges_are_not_cycles() {
        let flow = looped();
        assert!(validate(&flow).is_empty(), "{:?}", validate(&flow));

        let plan = FlowPlan::compile(&flow).unwrap();
        let root: Vec<&str> = plan.root().order.iter().map(|&i| plan.node(i).id.as_str()).collect();
        assert_eq!(root, vec!["files", "loop", "out"]);

        let fe = plan.index_of("loop").unwrap();
        let body = plan.body(fe).unwrap();
        let ids: Vec<&str> = body.order.iter().map(|&i| plan.node(i).id.as_str()).collect();
        assert_eq!(ids, vec!["summarize", "shorten"]);
        assert_eq!(body.terminals(), vec![plan.index_of("shorten").unwrap()]);
    }

    #[test]
    fn cycle_inside_loop_body() {
        let flow = looped().connect("shorten", "summarize");
        let errors = validate(&flow);
        assert!(kinds(&errors).contains(&ValidationErrorKind::InvalidCycle));
    }

    #[test]
    fn unknown_body_member() {
        let mut flow = looped();
        if let NodeData::ForEach(fe) = &mut flow.nodes[1].data {
            fe.body.push("nowhere".into());
        }
        assert!(kinds(&validate(&flow)).contains(&ValidationErrorKind::InvalidLoopBody));
    }

    #[test]
    fn branch_handles_compare_case_insensitively() {
        let mut upper = FlowEdge::branch("upper", "c", "b", true);
        upper.source_handle = Some(" TRUE ".into());
        let flow = PromptFlow::new("f", "Branch")
            .with_node(FlowNode::variable("v", "v", None))
            .with_node(FlowNode::conditional(
                "c",
                Operand::binding("v"),
                ConditionOperator::Exists,
                None,
            ))
            .with_node(FlowNode::output("a", OutputFormat::PlainText))
            .with_node(FlowNode::output("b", OutputFormat::PlainText))
            .connect("v", "c")
            .connect_branch("c", "a", true)
            .with_edge(upper);
        let errors = validate(&flow);
        assert_eq!(kinds(&errors), vec![ValidationErrorKind::DuplicateBranch]);
        assert_eq!(errors[0].node_id.as_deref(), Some("c"));
    }

    #[test]
    fn long_chain_validates_without_recursion() {
        let mut flow = PromptFlow::new("chain", "Chain")
            .with_node(FlowNode::variable("n0", "seed", Some(json!("x"))));
        for i in 1..10_000 {
            flow = flow.with_node(FlowNode::transform(
                format!("n{}", i),
                TransformNode::Format {
                    template: "{{seed}}".into(),
                },
            ));
            flow = flow.connect(&format!("n{}", i - 1), &format!("n{}", i));
        }
        assert!(validate(&flow).is_empty());
        let plan = FlowPlan::compile(&flow).unwrap();
        assert_eq!(plan.root().order.len(), 10_000);

        let closed = flow.connect("n9999", "n1");
        assert!(kinds(&validate(&closed)).contains(&ValidationErrorKind::InvalidCycle));
    }

    #[test]
    fn nested_loops_get_their_own_scopes() {
        let flow = PromptFlow::new("f", "Nested")
            .with_node(FlowNode::variable("groups", "groups", Some(json!([]))))
            .with_node(FlowNode::for_each(
                "outer",
                ForEachNode {
                    source_variable: "groups".into(),
                    item_variable: "group".into(),
                    body: vec!["inner".into()],
                    ..Default::default()
                },
            ))
            .with_node(FlowNode::for_each(
                "inner",
                ForEachNode {
                    source_variable: "group".into(),
                    item_variable: "word".into(),
                    body: vec!["shout".into()],
                    ..Default::default()
                },
            ))
            .with_node(FlowNode::prompt("shout", "{{word}}", "m"))
            .with_node(FlowNode::output("out", OutputFormat::Json))
            .connect("groups", "outer")
            .connect("outer", "inner")
            .connect("inner", "shout")
            .connect("shout", "inner")
            .connect("inner", "outer")
            .connect("outer", "out");
        assert!(validate(&flow).is_empty(), "{:?}", validate(&flow));

        let plan = FlowPlan::compile(&flow).unwrap();
        let ids = |scope: &ScopePlan| -> Vec<String> {
            scope.order.iter().map(|&i| plan.node(i).id.clone()).collect()
        };
        assert_eq!(ids(plan.root()), vec!["groups", "outer", "out"]);
        let outer = plan.body(plan.index_of("outer").unwrap()).unwrap();
        assert_eq!(ids(outer), vec!["inner"]);
        let inner = plan.body(plan.index_of("inner").unwrap()).unwrap();
        assert_eq!(ids(inner), vec!["shout"]);
    }

    #[test]
    fn loops_nested_in_each_other_are_rejected() {
        let flow = PromptFlow::new("f", "Knot")
            .with_node(FlowNode::variable("xs", "xs", Some(json!([]))))
            .with_node(FlowNode::for_each(
                "a",
                ForEachNode {
                    source_variable: "xs".into(),
                    body: vec!["b".into()],
                    ..Default::default()
                },
            ))
            .with_node(FlowNode::for_each(
                "b",
                ForEachNode {
                    source_variable: "xs".into(),
                    body: vec!["a".into()],
                    ..Default::default()
                },
            ))
            .connect("xs", "a");
        let errors = validate(&flow);
        assert!(errors
            .iter()
            .any(|e| e.kind == ValidationErrorKind::InvalidLoopBody
                && e.message.contains("nested in a cycle")));
    }

    #[test]
    fn duplicate_node_ids() {
        let flow = linear().with_node(FlowNode::output("out", OutputFormat::Json));
        assert!(kinds(&validate(&flow)).contains(&ValidationErrorKind::DuplicateNodeId));
    }
}
