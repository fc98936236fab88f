use std::collections::HashSet;

use crate::ast::{CommandPart, Document, PlaceholderOption, Task, Workflow, WorkflowNode};
use crate::graph::free_vars;

use super::{CheckError, ErrorKind};

/// Run advisory lint checks on a linked document. Lint diagnostics never
/// fail a run; `check --strict` promotes them.
pub fn lint_document(doc: &Document) -> Vec<CheckError> {
    let mut warnings = Vec::new();
    for task in &doc.tasks {
        lint_task(task, &mut warnings);
    }
    if let Some(wf) = &doc.workflow {
        lint_workflow(wf, &mut warnings);
    }
    warnings
}

// ---------------------------------------------------------------------------
// W001: unused declaration
// ---------------------------------------------------------------------------

fn lint_workflow(wf: &Workflow, warnings: &mut Vec<CheckError>) {
    let mut used: Vec<String> = Vec::new();
    collect_used(&wf.body, &mut used);
    for d in wf.outputs.iter().flatten() {
        if let Some(e) = &d.expr {
            free_vars(e, &mut used);
        }
    }
    let used: HashSet<&str> = used.iter().map(|s| s.as_str()).collect();

    for d in &wf.inputs {
        if !used.contains(d.name.as_str()) {
            warnings.push(CheckError::warning(
                ErrorKind::Lint,
                d.span,
                format!("[W001] workflow input `{}` is never referenced", d.name),
            ));
        }
    }
    for node in &wf.body {
        if let WorkflowNode::Decl(d) = node {
            if !used.contains(d.name.as_str()) {
                warnings.push(CheckError::warning(
                    ErrorKind::Lint,
                    d.span,
                    format!("[W001] declaration `{}` is never referenced", d.name),
                ));
            }
        }
    }
}

fn collect_used(nodes: &[WorkflowNode], used: &mut Vec<String>) {
    for node in nodes {
        match node {
            WorkflowNode::Decl(d) => {
                if let Some(e) = &d.expr {
                    free_vars(e, used);
                }
            }
            WorkflowNode::Call(c) => {
                for (_, e) in &c.inputs {
                    free_vars(e, used);
                }
                used.extend(c.afters.iter().cloned());
            }
            WorkflowNode::Scatter(s) => {
                free_vars(&s.collection, used);
                collect_used(&s.body, used);
            }
            WorkflowNode::Conditional(c) => {
                free_vars(&c.predicate, used);
                collect_used(&c.body, used);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// W002 / W003: task hygiene
// ---------------------------------------------------------------------------

fn lint_task(task: &Task, warnings: &mut Vec<CheckError>) {
    if task.runtime_attr("docker").is_none() && task.runtime_attr("container").is_none() {
        warnings.push(CheckError::warning(
            ErrorKind::Lint,
            task.span,
            format!(
                "[W002] task `{}` declares no container image; the configured default applies",
                task.name
            ),
        ));
    }

    // W003: interpolating an optional input without a default renders as
    // an empty string, which is rarely intended.
    let optional_inputs: HashSet<&str> = task
        .inputs
        .iter()
        .filter(|d| d.ty.optional && d.expr.is_none())
        .map(|d| d.name.as_str())
        .collect();
    for part in &task.command.parts {
        let CommandPart::Placeholder(ph) = part else { continue };
        let has_default = ph
            .options
            .iter()
            .any(|o| matches!(o, PlaceholderOption::Default(_)));
        if has_default {
            continue;
        }
        if let crate::ast::ExprKind::Ident(name) = &ph.expr.kind {
            if optional_inputs.contains(name.as_str()) {
                warnings.push(CheckError::warning(
                    ErrorKind::Lint,
                    ph.span,
                    format!(
                        "[W003] optional input `{name}` is interpolated without `default=`; \
                         an absent value renders as the empty string"
                    ),
                ));
            }
        }
    }

    // W001 for tasks: unused inputs.
    let mut used: Vec<String> = Vec::new();
    for d in task.inputs.iter().chain(task.postinputs.iter()) {
        if let Some(e) = &d.expr {
            free_vars(e, &mut used);
        }
    }
    for part in &task.command.parts {
        if let CommandPart::Placeholder(ph) = part {
            free_vars(&ph.expr, &mut used);
        }
    }
    for d in &task.outputs {
        if let Some(e) = &d.expr {
            free_vars(e, &mut used);
        }
    }
    for (_, e) in task.runtime.iter().chain(task.hints.iter()) {
        free_vars(e, &mut used);
    }
    let used: HashSet<&str> = used.iter().map(|s| s.as_str()).collect();
    for d in &task.inputs {
        if !d.env && !used.contains(d.name.as_str()) {
            warnings.push(CheckError::warning(
                ErrorKind::Lint,
                d.span,
                format!("[W001] task input `{}` is never referenced", d.name),
            ));
        }
    }
}
