use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use rw_core::env::Env;
use rw_core::json::RunInputs;
use rw_core::{Stdlib, Value, eval};
use rw_lang::ast::Document;
use rw_lang::graph::{Graph, Node, NodeKind};
use rw_lang::types::Type;
use rw_lang::NodeId;

// ---------------------------------------------------------------------------
// Instances and jobs
// ---------------------------------------------------------------------------

/// Indices locating one instance within its enclosing scatters.
pub type ScatterPath = Vec<usize>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub node: NodeId,
    pub path: ScatterPath,
}

impl InstanceKey {
    fn new(node: &str, path: ScatterPath) -> Self {
        InstanceKey {
            node: node.to_string(),
            path,
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.node)
        } else {
            let idx: Vec<String> = self.path.iter().map(|i| i.to_string()).collect();
            write!(f, "{}[{}]", self.node, idx.join(","))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// A `call` instance that became ready: the driver executes it as a task
/// attempt (or a nested sub-workflow) and reports back via `complete`.
#[derive(Debug, Clone)]
pub struct CallJob {
    pub id: JobId,
    pub key: InstanceKey,
    /// The name the call binds in its scope (alias-aware).
    pub call_name: String,
    pub callee: Vec<String>,
    /// Evaluated inputs, with JSON call overrides already folded in.
    pub inputs: Vec<(String, Value)>,
}

/// Failure details reported back for one call.
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub kind: String,
    pub message: String,
    pub exit_status: Option<i32>,
    pub stderr_path: Option<PathBuf>,
    pub attempts: u32,
}

pub type TaskResult = Result<Vec<(String, Value)>, JobFailure>;

/// Terminal failure of the whole run.
#[derive(Debug, Clone)]
pub struct RunFailure {
    pub kind: String,
    pub message: String,
    pub exit_status: Option<i32>,
}

/// Produced values: plain for declarations and gathers, a namespace for
/// calls.
#[derive(Debug, Clone)]
enum InstValue {
    Value(Value),
    Namespace(Vec<(String, Value)>),
}

// ---------------------------------------------------------------------------
// StateMachine
// ---------------------------------------------------------------------------

/// The workflow state machine: a pure data structure the director drives
/// via `step` (advance everything advanceable, emit ready call jobs) and
/// `complete` (fold one call result back in). Declarations evaluate
/// inline; only calls leave the machine.
pub struct StateMachine {
    doc: Arc<Document>,
    graph: Arc<Graph>,
    stdlib: Stdlib,
    inputs: RunInputs,
    instances: HashMap<InstanceKey, Status>,
    order: Vec<InstanceKey>,
    values: HashMap<InstanceKey, InstValue>,
    /// Scatter instance → expansion width.
    expansions: HashMap<InstanceKey, usize>,
    /// Conditional instance → predicate value.
    predicates: HashMap<InstanceKey, bool>,
    running: HashMap<JobId, InstanceKey>,
    next_job: u64,
    cancelled: bool,
    failure: Option<RunFailure>,
    fail_slow: bool,
}

impl StateMachine {
    pub fn new(
        doc: Arc<Document>,
        graph: Arc<Graph>,
        stdlib: Stdlib,
        inputs: RunInputs,
        fail_slow: bool,
    ) -> Self {
        let mut sm = StateMachine {
            doc,
            graph,
            stdlib,
            inputs,
            instances: HashMap::new(),
            order: Vec::new(),
            values: HashMap::new(),
            expansions: HashMap::new(),
            predicates: HashMap::new(),
            running: HashMap::new(),
            next_job: 0,
            cancelled: false,
            failure: None,
            fail_slow,
        };

        let top: Vec<NodeId> = sm
            .graph
            .top_level()
            .map(|n| n.id.clone())
            .collect();
        for id in top {
            sm.create_instance(&id, Vec::new());
        }
        sm
    }

    fn create_instance(&mut self, node: &str, path: ScatterPath) {
        let key = InstanceKey::new(node, path);
        self.instances.insert(key.clone(), Status::Pending);
        self.order.push(key);
    }

    // -- public surface -------------------------------------------------

    /// Advance every advanceable instance; returns the call jobs that
    /// became ready, in deterministic document order.
    pub fn step(&mut self) -> Vec<CallJob> {
        let mut jobs = Vec::new();
        if self.cancelled || self.failure.is_some() {
            return jobs;
        }
        loop {
            let mut progressed = false;
            let mut idx = 0;
            while idx < self.order.len() {
                let key = self.order[idx].clone();
                idx += 1;
                if self.instances.get(&key) != Some(&Status::Pending) {
                    continue;
                }
                if !self.deps_ready(&key) {
                    continue;
                }
                match self.advance(&key, &mut jobs) {
                    Ok(()) => progressed = true,
                    Err(failure) => {
                        self.fail(failure);
                        return jobs;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        jobs
    }

    /// Fold a finished call back into the state.
    pub fn complete(&mut self, job: JobId, result: TaskResult) {
        let Some(key) = self.running.remove(&job) else {
            rw_warn!(flow, job = %job, "completion for unknown job");
            return;
        };
        match result {
            Ok(outputs) => {
                rw_debug!(flow, instance = %key, "call succeeded");
                self.values.insert(key.clone(), InstValue::Namespace(outputs));
                self.instances.insert(key, Status::Succeeded);
            }
            Err(f) => {
                rw_warn!(flow, instance = %key, error = %f.message, "call failed");
                self.instances.insert(key.clone(), Status::Failed);
                self.fail(RunFailure {
                    kind: f.kind,
                    message: format!("call `{}` failed: {}", key, f.message),
                    exit_status: f.exit_status,
                });
            }
        }
    }

    /// Refuse further jobs; running instances are failed once their
    /// drivers observe cancellation.
    pub fn cancel(&mut self) {
        if !self.cancelled {
            self.cancelled = true;
            if self.failure.is_none() {
                self.failure = Some(RunFailure {
                    kind: "Interrupted".to_string(),
                    message: "run cancelled".to_string(),
                    exit_status: None,
                });
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn fail_slow(&self) -> bool {
        self.fail_slow
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Terminal when nothing is running and nothing can advance.
    pub fn is_done(&self) -> bool {
        if !self.running.is_empty() {
            return false;
        }
        if self.failure.is_some() {
            return true;
        }
        self.instances
            .values()
            .all(|s| matches!(s, Status::Succeeded | Status::Failed))
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        self.failure.as_ref()
    }

    /// Workflow outputs, once done and successful.
    pub fn outputs(&self) -> Option<Vec<(String, Value)>> {
        if self.failure.is_some() || !self.is_done() {
            return None;
        }
        let mut out = Vec::new();
        for node in self.graph.top_level() {
            if let NodeKind::Output { name, .. } = &node.kind {
                let key = InstanceKey::new(&node.id, Vec::new());
                match self.values.get(&key) {
                    Some(InstValue::Value(v)) => out.push((name.clone(), v.clone())),
                    _ => return None,
                }
            }
        }
        Some(out)
    }

    // -- readiness ------------------------------------------------------

    fn scatters_in(&self, path: &[NodeId]) -> usize {
        path.iter()
            .filter(|sid| {
                matches!(
                    self.graph.get(sid).map(|n| &n.kind),
                    Some(NodeKind::Scatter { .. })
                )
            })
            .count()
    }

    /// The instance of `dep` visible from an instance at `path`.
    fn dep_instance(&self, dep: &Node, from_path: &[usize], from_node: &Node) -> InstanceKey {
        let mut depth = self.scatters_in(&dep.path);
        // A reference to a scatter's bound variable points at the section
        // node from inside it: the per-element binding adds one index.
        if matches!(dep.kind, NodeKind::Scatter { .. }) && from_node.path.contains(&dep.id) {
            depth += 1;
        }
        InstanceKey::new(&dep.id, from_path[..depth.min(from_path.len())].to_vec())
    }

    fn deps_ready(&self, key: &InstanceKey) -> bool {
        let Some(node) = self.graph.get(&key.node) else {
            return false;
        };
        if let NodeKind::Gather { inner } = &node.kind {
            return self.gather_ready(key, inner);
        }
        for dep_id in &node.deps {
            let Some(dep) = self.graph.get(dep_id) else {
                return false;
            };
            let dep_key = self.dep_instance(dep, &key.path, node);
            match self.instances.get(&dep_key) {
                Some(Status::Succeeded) => {}
                _ => return false,
            }
        }
        true
    }

    fn gather_ready(&self, key: &InstanceKey, inner: &str) -> bool {
        let Some(inner_node) = self.graph.get(inner) else {
            return false;
        };
        let Some(section_id) = inner_node.path.last() else {
            return false;
        };
        let section_key = InstanceKey::new(section_id, key.path.clone());
        if self.instances.get(&section_key) != Some(&Status::Succeeded) {
            return false;
        }
        match self.graph.get(section_id).map(|n| &n.kind) {
            Some(NodeKind::Scatter { .. }) => {
                let Some(&n) = self.expansions.get(&section_key) else {
                    return false;
                };
                (0..n).all(|i| {
                    let mut p = key.path.clone();
                    p.push(i);
                    self.instances.get(&InstanceKey::new(inner, p))
                        == Some(&Status::Succeeded)
                })
            }
            Some(NodeKind::Conditional { .. }) => {
                match self.predicates.get(&section_key) {
                    Some(true) => {
                        self.instances
                            .get(&InstanceKey::new(inner, key.path.clone()))
                            == Some(&Status::Succeeded)
                    }
                    Some(false) => true,
                    None => false,
                }
            }
            _ => false,
        }
    }

    // -- advancing ------------------------------------------------------

    fn advance(&mut self, key: &InstanceKey, jobs: &mut Vec<CallJob>) -> Result<(), RunFailure> {
        let node = self
            .graph
            .get(&key.node)
            .expect("instance without node")
            .clone();
        match &node.kind {
            NodeKind::Decl {
                name,
                ty,
                expr,
                input,
            } => {
                let value = self.decl_value(key, &node, name, ty, expr.as_ref(), *input)?;
                self.values.insert(key.clone(), InstValue::Value(value));
                self.instances.insert(key.clone(), Status::Succeeded);
            }
            NodeKind::Output { name: _, ty, expr } => {
                let env = self.build_env(key, &node);
                let value = eval(expr, &env, &self.stdlib)
                    .and_then(|v| v.coerce_to(ty))
                    .map_err(|e| eval_failure(&node.id, e))?;
                self.values.insert(key.clone(), InstValue::Value(value));
                self.instances.insert(key.clone(), Status::Succeeded);
            }
            NodeKind::Scatter { variable: _, collection } => {
                let env = self.build_env(key, &node);
                let coll = eval(collection, &env, &self.stdlib)
                    .map_err(|e| eval_failure(&node.id, e))?;
                let items = coll
                    .as_array()
                    .map_err(|e| eval_failure(&node.id, e))?
                    .to_vec();
                let n = items.len();
                rw_debug!(flow, section = %key, width = n, "scatter expanded");
                self.expansions.insert(key.clone(), n);
                for (i, item) in items.into_iter().enumerate() {
                    let mut child_path = key.path.clone();
                    child_path.push(i);
                    // The bound variable's per-element value. The indexed
                    // section instance is marked succeeded so inner nodes
                    // depending on the variable become ready.
                    let var_key = InstanceKey::new(&node.id, child_path.clone());
                    self.values.insert(var_key.clone(), InstValue::Value(item));
                    self.instances.insert(var_key, Status::Succeeded);
                    let children: Vec<NodeId> = self
                        .graph
                        .children(&node.id)
                        .map(|c| c.id.clone())
                        .collect();
                    for child in children {
                        self.create_instance(&child, child_path.clone());
                    }
                }
                self.instances.insert(key.clone(), Status::Succeeded);
            }
            NodeKind::Conditional { predicate } => {
                let env = self.build_env(key, &node);
                let pred = eval(predicate, &env, &self.stdlib)
                    .and_then(|v| v.as_bool())
                    .map_err(|e| eval_failure(&node.id, e))?;
                rw_debug!(flow, section = %key, predicate = pred, "conditional evaluated");
                self.predicates.insert(key.clone(), pred);
                if pred {
                    let children: Vec<NodeId> = self
                        .graph
                        .children(&node.id)
                        .map(|c| c.id.clone())
                        .collect();
                    for child in children {
                        self.create_instance(&child, key.path.clone());
                    }
                }
                self.instances.insert(key.clone(), Status::Succeeded);
            }
            NodeKind::Gather { inner } => {
                let value = self.gather_value(key, inner)?;
                self.values.insert(key.clone(), value);
                self.instances.insert(key.clone(), Status::Succeeded);
            }
            NodeKind::Call { call, .. } => {
                let inputs = self.call_inputs(key, &node, call)?;
                let id = JobId(self.next_job);
                self.next_job += 1;
                self.running.insert(id, key.clone());
                self.instances.insert(key.clone(), Status::Running);
                jobs.push(CallJob {
                    id,
                    key: key.clone(),
                    call_name: call.name().to_string(),
                    callee: call.callee.clone(),
                    inputs,
                });
            }
            _ => unreachable!("NodeKind is non_exhaustive but all variants are handled"),
        }
        Ok(())
    }

    fn decl_value(
        &self,
        key: &InstanceKey,
        node: &Node,
        name: &str,
        ty: &Type,
        expr: Option<&rw_lang::ast::Expr>,
        input: bool,
    ) -> Result<Value, RunFailure> {
        if input {
            if let Some(provided) = self.inputs.direct.get(name) {
                return provided.coerce_to(ty).map_err(|e| input_failure(name, e));
            }
        }
        if let Some(expr) = expr {
            let env = self.build_env(key, node);
            return eval(expr, &env, &self.stdlib)
                .and_then(|v| v.coerce_to(ty))
                .map_err(|e| eval_failure(&node.id, e));
        }
        if ty.optional {
            return Ok(Value::Null(ty.required()));
        }
        Err(RunFailure {
            kind: "InputError".to_string(),
            message: format!("required input `{name}` was not provided"),
            exit_status: None,
        })
    }

    fn gather_value(&self, key: &InstanceKey, inner: &str) -> Result<InstValue, RunFailure> {
        let inner_node = self.graph.get(inner).expect("gather without inner");
        let section_id = inner_node.path.last().expect("inner without section");
        let section_key = InstanceKey::new(section_id, key.path.clone());
        let section = self.graph.get(section_id).expect("missing section");

        match &section.kind {
            NodeKind::Scatter { .. } => {
                let n = self.expansions[&section_key];
                let mut collected: Vec<&InstValue> = Vec::with_capacity(n);
                for i in 0..n {
                    let mut p = key.path.clone();
                    p.push(i);
                    collected.push(&self.values[&InstanceKey::new(inner, p)]);
                }
                Ok(self.lift_scatter(&collected, inner_node))
            }
            NodeKind::Conditional { .. } => {
                let pred = self.predicates[&section_key];
                if pred {
                    let inner_val = &self.values[&InstanceKey::new(inner, key.path.clone())];
                    Ok(inner_val.clone())
                } else {
                    Ok(self.absent_value(inner_node))
                }
            }
            _ => Err(RunFailure {
                kind: "RunFailure".to_string(),
                message: format!("gather over non-section node `{section_id}`"),
                exit_status: None,
            }),
        }
    }

    fn call_inputs(
        &self,
        key: &InstanceKey,
        node: &Node,
        call: &rw_lang::ast::Call,
    ) -> Result<Vec<(String, Value)>, RunFailure> {
        let env = self.build_env(key, node);
        let mut inputs = Vec::with_capacity(call.inputs.len());
        for (name, expr) in &call.inputs {
            let value =
                eval(expr, &env, &self.stdlib).map_err(|e| eval_failure(&node.id, e))?;
            inputs.push((name.clone(), value));
        }

        // JSON call overrides fill inputs the call body leaves unset.
        if let Some(overrides) = self.inputs.calls.get(call.name()) {
            let mut scratch = Vec::new();
            let sig =
                rw_lang::checker::resolve_callee_sig(&self.doc, &call.callee, &mut scratch);
            for (iname, raw) in overrides {
                if inputs.iter().any(|(n, _)| n == iname) {
                    continue;
                }
                let ty = sig
                    .as_ref()
                    .and_then(|s| s.inputs.iter().find(|(n, _, _)| n == iname))
                    .map(|(_, t, _)| t.clone())
                    .unwrap_or_else(Type::any);
                let value = Value::from_json(raw, &ty).map_err(|e| RunFailure {
                    kind: "InputError".to_string(),
                    message: format!("input `{}.{iname}`: {e}", call.name()),
                    exit_status: None,
                })?;
                inputs.push((iname.clone(), value));
            }
        }
        Ok(inputs)
    }

    // -- environment assembly -------------------------------------------

    /// Environment for evaluating a node instance: one binding per graph
    /// dependency, named after what the dependency defines.
    fn build_env(&self, key: &InstanceKey, node: &Node) -> Env {
        let mut env = Env::new();
        for dep_id in &node.deps {
            let Some(dep) = self.graph.get(dep_id) else { continue };
            let Some(name) = self.binding_name(dep) else { continue };
            let dep_key = self.dep_instance(dep, &key.path, node);
            match self.values.get(&dep_key) {
                Some(InstValue::Value(v)) => env = env.bind(name, v.clone()),
                Some(InstValue::Namespace(outputs)) => {
                    let mut ns = Env::new();
                    for (n, v) in outputs {
                        ns = ns.bind(n.clone(), v.clone());
                    }
                    env = env.bind_namespace(name, ns);
                }
                None => {}
            }
        }
        env
    }

    /// The scope name a node's value binds to.
    fn binding_name<'a>(&'a self, node: &'a Node) -> Option<String> {
        match &node.kind {
            NodeKind::Decl { name, .. } | NodeKind::Output { name, .. } => Some(name.clone()),
            NodeKind::Call { call, .. } => Some(call.name().to_string()),
            NodeKind::Scatter { variable, .. } => Some(variable.clone()),
            NodeKind::Gather { inner } => {
                let inner_node = self.graph.get(inner)?;
                self.binding_name(inner_node)
            }
            NodeKind::Conditional { .. } => None,
            _ => unreachable!("NodeKind is non_exhaustive but all variants are handled"),
        }
    }

    fn fail(&mut self, failure: RunFailure) {
        rw_warn!(flow, kind = %failure.kind, message = %failure.message, "run entering failure drain");
        if self.failure.is_none() {
            self.failure = Some(failure);
        }
    }

    // -- lifting helpers ------------------------------------------------

    /// Output names of a (possibly nested-gathered) call node.
    fn namespace_outputs<'a>(&'a self, node: &'a Node) -> Option<&'a [(String, Type)]> {
        match &node.kind {
            NodeKind::Call { outputs, .. } => Some(outputs),
            NodeKind::Gather { inner } => {
                self.namespace_outputs(self.graph.get(inner)?)
            }
            _ => None,
        }
    }

    fn lift_scatter(&self, collected: &[&InstValue], inner_node: &Node) -> InstValue {
        if let Some(outputs) = self.namespace_outputs(inner_node) {
            // Gathering a call: one index-ordered array per output name.
            let mut gathered: Vec<(String, Value)> = Vec::with_capacity(outputs.len());
            for (name, _) in outputs {
                let items: Vec<Value> = collected
                    .iter()
                    .filter_map(|v| match v {
                        InstValue::Namespace(outs) => outs
                            .iter()
                            .find(|(n, _)| n == name)
                            .map(|(_, v)| v.clone()),
                        InstValue::Value(_) => None,
                    })
                    .collect();
                let item = rw_lang::types::unify(
                    &items.iter().map(Value::wdl_type).collect::<Vec<_>>(),
                )
                .unwrap_or_else(Type::any);
                gathered.push((name.clone(), Value::Array { item, items }));
            }
            return InstValue::Namespace(gathered);
        }

        let item = inner_node.ty.clone().unwrap_or_else(Type::any);
        let items: Vec<Value> = collected
            .iter()
            .filter_map(|v| match v {
                InstValue::Value(v) => Some(v.clone()),
                InstValue::Namespace(_) => None,
            })
            .collect();
        InstValue::Value(Value::Array { item, items })
    }

    fn absent_value(&self, inner_node: &Node) -> InstValue {
        match self.namespace_outputs(inner_node) {
            Some(outputs) => InstValue::Namespace(
                outputs
                    .iter()
                    .map(|(n, t)| (n.clone(), Value::Null(t.clone())))
                    .collect(),
            ),
            None => {
                let ty = inner_node.ty.clone().unwrap_or_else(Type::any);
                InstValue::Value(Value::Null(ty))
            }
        }
    }
}

fn eval_failure(node: &str, e: rw_core::CoreError) -> RunFailure {
    RunFailure {
        kind: "EvalError".to_string(),
        message: format!("evaluating `{node}`: {e}"),
        exit_status: None,
    }
}

fn input_failure(name: &str, e: rw_core::CoreError) -> RunFailure {
    RunFailure {
        kind: "InputError".to_string(),
        message: format!("input `{name}`: {e}"),
        exit_status: None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests;
