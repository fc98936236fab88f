use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::ast::{
    Call, CommandPart, Document, Expr, ExprKind, Span, StringPart, Workflow, WorkflowNode,
};
use crate::checker::{
    CheckError, ErrorKind, StructEnv, resolve_callee_sig, resolve_type,
};
use crate::types::Type;

// ---------------------------------------------------------------------------
// Node identity
// ---------------------------------------------------------------------------

/// Stable graph node id: `decl-x`, `call-t`, `scatter-0`, `if-1`,
/// `scatter-0-decl-x` (section-scoped), `gather-scatter-0-decl-x`,
/// `output-y`.
pub type NodeId = String;

#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum NodeKind {
    Decl {
        name: String,
        ty: Type,
        expr: Option<Expr>,
        /// Bound from run inputs rather than evaluated.
        input: bool,
    },
    Call {
        call: Call,
        /// Output name → declared type (resolved).
        outputs: Vec<(String, Type)>,
    },
    Scatter {
        variable: String,
        collection: Expr,
    },
    Conditional {
        predicate: Expr,
    },
    /// Exposes an inner section value under its lifted type.
    Gather {
        inner: NodeId,
    },
    Output {
        name: String,
        ty: Type,
        expr: Expr,
    },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Enclosing section ids, outermost first.
    pub path: Vec<NodeId>,
    pub deps: BTreeSet<NodeId>,
    /// Observable type (lifted, for gathers). Calls expose a namespace
    /// rather than one type.
    pub ty: Option<Type>,
    pub span: Span,
}

impl Node {
    /// The id of the immediately enclosing section, if any.
    pub fn section(&self) -> Option<&NodeId> {
        self.path.last()
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// The workflow dependency graph: deterministic node ids, forward edges,
/// per-section gather nodes. Immutable once built.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: BTreeMap<NodeId, Node>,
    /// Document order, for deterministic scheduling.
    order: Vec<NodeId>,
}

impl Graph {
    /// Node ids in document order.
    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.order.iter()
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn dependencies(&self, id: &str) -> Option<&BTreeSet<NodeId>> {
        self.nodes.get(id).map(|n| &n.deps)
    }

    pub fn section_of(&self, id: &str) -> Option<&NodeId> {
        self.nodes.get(id).and_then(|n| n.section())
    }

    /// Nodes immediately inside the given section, in document order.
    pub fn children(&self, section: &str) -> impl Iterator<Item = &Node> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(move |n| n.section().map(|s| s.as_str()) == Some(section))
    }

    /// Top-level nodes (no enclosing section), in document order.
    pub fn top_level(&self) -> impl Iterator<Item = &Node> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|n| n.path.is_empty())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

/// Lower a checked workflow into its dependency graph. Assumes
/// `check_document` reported no errors; unknown references are skipped
/// rather than re-reported.
pub fn build_graph(
    wf: &Workflow,
    doc: &Document,
    structs: &StructEnv,
) -> Result<Graph, CheckError> {
    let mut b = Builder {
        doc,
        structs,
        nodes: BTreeMap::new(),
        order: Vec::new(),
        defs: HashMap::new(),
        section_counter: 0,
    };

    let mut scratch = Vec::new();

    // Workflow inputs and unbound top-level declarations become input nodes.
    for d in &wf.inputs {
        let ty = resolve_type(&d.ty, structs, d.span, &mut scratch);
        b.add_decl(d, ty, true, &[]);
    }
    b.walk_body(&wf.body, &[]);

    // The output block is an implicit final section at top level.
    if let Some(outputs) = &wf.outputs {
        for d in outputs {
            let ty = resolve_type(&d.ty, structs, d.span, &mut scratch);
            let id = format!("output-{}", d.name);
            let expr = d.expr.clone().unwrap_or(Expr::new(d.span, ExprKind::None));
            b.push(Node {
                id: id.clone(),
                kind: NodeKind::Output {
                    name: d.name.clone(),
                    ty: ty.clone(),
                    expr,
                },
                path: Vec::new(),
                deps: BTreeSet::new(),
                ty: Some(ty),
                span: d.span,
            });
        }
    }

    b.resolve_deps();
    let graph = Graph {
        nodes: b.nodes,
        order: b.order,
    };
    check_acyclic(&graph)?;
    Ok(graph)
}

/// A definition site: where a name is introduced and in which section
/// nesting.
#[derive(Debug, Clone)]
struct Def {
    node_id: NodeId,
    path: Vec<NodeId>,
}

struct Builder<'a> {
    doc: &'a Document,
    structs: &'a StructEnv,
    nodes: BTreeMap<NodeId, Node>,
    order: Vec<NodeId>,
    /// Definition sites per name. Workflow names are unique, but scatter
    /// variables may repeat across sibling sections.
    defs: HashMap<String, Vec<Def>>,
    section_counter: usize,
}

impl Builder<'_> {
    fn push(&mut self, node: Node) {
        self.order.push(node.id.clone());
        self.nodes.insert(node.id.clone(), node);
    }

    fn add_decl(&mut self, d: &crate::ast::Decl, ty: Type, input: bool, path: &[NodeId]) {
        let base = format!("decl-{}", d.name);
        let id = scoped_id(path, &base);
        self.defs.entry(d.name.clone()).or_default().push(Def {
            node_id: id.clone(),
            path: path.to_vec(),
        });
        self.push(Node {
            id,
            kind: NodeKind::Decl {
                name: d.name.clone(),
                ty: ty.clone(),
                expr: d.expr.clone(),
                input,
            },
            path: path.to_vec(),
            deps: BTreeSet::new(),
            ty: Some(ty),
            span: d.span,
        });
    }

    fn walk_body(&mut self, body: &[WorkflowNode], path: &[NodeId]) {
        let mut scratch = Vec::new();
        for node in body {
            match node {
                WorkflowNode::Decl(d) => {
                    let ty = resolve_type(&d.ty, self.structs, d.span, &mut scratch);
                    // A valueless declaration outside the input block still
                    // binds from run inputs (draft-2 style).
                    let input = d.expr.is_none() && path.is_empty();
                    self.add_decl(d, ty, input, path);
                }
                WorkflowNode::Call(c) => {
                    let outputs = resolve_callee_sig(self.doc, &c.callee, &mut scratch)
                        .map(|sig| sig.outputs)
                        .unwrap_or_default();
                    let base = format!("call-{}", c.name());
                    let id = scoped_id(path, &base);
                    self.defs.entry(c.name().to_string()).or_default().push(Def {
                        node_id: id.clone(),
                        path: path.to_vec(),
                    });
                    self.push(Node {
                        id,
                        kind: NodeKind::Call {
                            call: c.clone(),
                            outputs,
                        },
                        path: path.to_vec(),
                        deps: BTreeSet::new(),
                        ty: None,
                        span: c.span,
                    });
                }
                WorkflowNode::Scatter(s) => {
                    let sid = format!("scatter-{}", self.section_counter);
                    self.section_counter += 1;
                    self.push(Node {
                        id: sid.clone(),
                        kind: NodeKind::Scatter {
                            variable: s.variable.clone(),
                            collection: s.collection.clone(),
                        },
                        path: path.to_vec(),
                        deps: BTreeSet::new(),
                        ty: None,
                        span: s.span,
                    });
                    let mut inner_path = path.to_vec();
                    inner_path.push(sid.clone());
                    // The bound variable resolves to the section itself.
                    self.defs.entry(s.variable.clone()).or_default().push(Def {
                        node_id: sid,
                        path: inner_path.clone(),
                    });
                    self.walk_body(&s.body, &inner_path);
                }
                WorkflowNode::Conditional(c) => {
                    let sid = format!("if-{}", self.section_counter);
                    self.section_counter += 1;
                    self.push(Node {
                        id: sid.clone(),
                        kind: NodeKind::Conditional {
                            predicate: c.predicate.clone(),
                        },
                        path: path.to_vec(),
                        deps: BTreeSet::new(),
                        ty: None,
                        span: c.span,
                    });
                    let mut inner_path = path.to_vec();
                    inner_path.push(sid);
                    self.walk_body(&c.body, &inner_path);
                }
            }
        }
    }

    /// Second pass: compute each node's dependency set, synthesizing
    /// gathers for cross-section references.
    fn resolve_deps(&mut self) {
        let ids: Vec<NodeId> = self.order.clone();
        for id in ids {
            let Some(node) = self.nodes.get(&id) else { continue };
            let path = node.path.clone();
            let mut names = Vec::new();
            match &node.kind {
                NodeKind::Decl { expr, .. } => {
                    if let Some(e) = expr {
                        free_vars(e, &mut names);
                    }
                }
                NodeKind::Call { call, .. } => {
                    for (_, e) in &call.inputs {
                        free_vars(e, &mut names);
                    }
                    for after in &call.afters {
                        names.push(after.clone());
                    }
                }
                NodeKind::Scatter { collection, .. } => free_vars(collection, &mut names),
                NodeKind::Conditional { predicate } => free_vars(predicate, &mut names),
                NodeKind::Output { expr, .. } => free_vars(expr, &mut names),
                NodeKind::Gather { .. } => continue,
            }

            let mut deps = BTreeSet::new();
            for name in names {
                if let Some(dep) = self.dep_for(&name, &path) {
                    if dep != id {
                        deps.insert(dep);
                    }
                }
            }
            if let Some(node) = self.nodes.get_mut(&id) {
                node.deps = deps;
            }
        }
    }

    /// Resolve a referenced name from a node at `from_path` to the id it
    /// depends on, creating gather nodes when the reference crosses out of
    /// sections.
    fn dep_for(&mut self, name: &str, from_path: &[NodeId]) -> Option<NodeId> {
        let sites = self.defs.get(name)?;

        // Prefer the innermost definition whose sections enclose the
        // referencing node: direct edge; at runtime both instances share
        // the scatter path.
        if let Some(def) = sites
            .iter()
            .filter(|d| is_prefix(&d.path, from_path))
            .max_by_key(|d| d.path.len())
        {
            return Some(def.node_id.clone());
        }
        // Otherwise the reference crosses sections; workflow names are
        // unique, so a single sibling definition site remains.
        let def = sites.first()?.clone();

        // Cross-section: lift through each section between the definition
        // and the deepest common ancestor, innermost first.
        let common = common_prefix_len(&def.path, from_path);
        let mut inner = def.node_id.clone();
        for j in (common..def.path.len()).rev() {
            let gather_id = format!("gather-{inner}");
            if !self.nodes.contains_key(&gather_id) {
                let section_id = def.path[j].clone();
                let lifted = self.lifted_type(&inner, &section_id);
                let node = Node {
                    id: gather_id.clone(),
                    kind: NodeKind::Gather {
                        inner: inner.clone(),
                    },
                    path: def.path[..j].to_vec(),
                    deps: BTreeSet::from([inner.clone()]),
                    ty: lifted,
                    span: Span::default(),
                };
                self.push(node);
            }
            inner = gather_id;
        }
        Some(inner)
    }

    /// Observable type of `inner` lifted through one section.
    fn lifted_type(&self, inner: &str, section_id: &str) -> Option<Type> {
        let inner_ty = self.nodes.get(inner).and_then(|n| n.ty.clone())?;
        let section = self.nodes.get(section_id)?;
        Some(match section.kind {
            NodeKind::Scatter { .. } => inner_ty.lifted_by_scatter(),
            NodeKind::Conditional { .. } => inner_ty.lifted_by_conditional(),
            _ => return None,
        })
    }
}

fn scoped_id(path: &[NodeId], base: &str) -> NodeId {
    match path.last() {
        Some(section) => format!("{section}-{base}"),
        None => base.to_string(),
    }
}

fn is_prefix(prefix: &[NodeId], path: &[NodeId]) -> bool {
    prefix.len() <= path.len() && prefix.iter().zip(path.iter()).all(|(a, b)| a == b)
}

fn common_prefix_len(a: &[NodeId], b: &[NodeId]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

// ---------------------------------------------------------------------------
// Free variables
// ---------------------------------------------------------------------------

/// Collect identifiers an expression references. `call.output` contributes
/// the call's name.
pub fn free_vars(expr: &Expr, out: &mut Vec<String>) {
    match &expr.kind {
        ExprKind::Ident(name) => out.push(name.clone()),
        ExprKind::Member { expr: base, .. } => {
            // The member chain bottoms out at an identifier; the binding is
            // what the graph edge points at.
            free_vars(base, out);
        }
        ExprKind::String(parts) => {
            for p in parts {
                if let StringPart::Placeholder(ph) = p {
                    free_vars(&ph.expr, out);
                }
            }
        }
        ExprKind::Array(items) => {
            for e in items {
                free_vars(e, out);
            }
        }
        ExprKind::Map(entries) => {
            for (k, v) in entries {
                free_vars(k, out);
                free_vars(v, out);
            }
        }
        ExprKind::Pair(l, r) => {
            free_vars(l, out);
            free_vars(r, out);
        }
        ExprKind::Object { members, .. } => {
            for (_, e) in members {
                free_vars(e, out);
            }
        }
        ExprKind::Index { expr: base, index } => {
            free_vars(base, out);
            free_vars(index, out);
        }
        ExprKind::Unary { operand, .. } => free_vars(operand, out),
        ExprKind::Binary { left, right, .. } => {
            free_vars(left, out);
            free_vars(right, out);
        }
        ExprKind::Ternary { cond, then, els } => {
            free_vars(cond, out);
            free_vars(then, out);
            free_vars(els, out);
        }
        ExprKind::Apply { args, .. } => {
            for a in args {
                free_vars(a, out);
            }
        }
        ExprKind::Boolean(_) | ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::None => {}
    }
}

/// Placeholder expressions inside a command template.
pub fn command_free_vars(parts: &[CommandPart], out: &mut Vec<String>) {
    for part in parts {
        if let CommandPart::Placeholder(ph) = part {
            free_vars(&ph.expr, out);
        }
    }
}

// ---------------------------------------------------------------------------
// Acyclicity
// ---------------------------------------------------------------------------

fn check_acyclic(graph: &Graph) -> Result<(), CheckError> {
    let mut in_degree: HashMap<&NodeId, usize> = HashMap::new();
    let mut rdeps: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
    for id in graph.ids() {
        let node = graph.get(id).unwrap();
        in_degree.insert(id, node.deps.len());
        for dep in &node.deps {
            rdeps.entry(dep).or_default().push(id);
        }
    }

    let mut queue: VecDeque<&NodeId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        for r in rdeps.get(id).into_iter().flatten() {
            let d = in_degree.get_mut(r).unwrap();
            *d -= 1;
            if *d == 0 {
                queue.push_back(r);
            }
        }
    }

    if visited != graph.len() {
        let stuck: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| id.as_str())
            .collect();
        return Err(CheckError::error(
            ErrorKind::GraphCycle,
            Span::default(),
            format!("dependency cycle among: {}", stuck.join(", ")),
        ));
    }
    Ok(())
}
