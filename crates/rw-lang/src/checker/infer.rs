use crate::ast::{
    Call, CommandPart, Conditional, Decl, Document, Expr, ExprKind, Placeholder,
    PlaceholderOption, Scatter, Span, StringPart, Task, UnaryOp, Workflow, WorkflowNode,
};
use crate::ast::BinOp;
use crate::types::{Type, TypeKind, unify};

use super::funcs::infer_apply;
use super::scope::{Scope, ScopeBinding};
use super::{
    CheckError, CheckOptions, ErrorKind, StructEnv, check_assignable, resolve_callee_sig,
    resolve_type,
};

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

pub(crate) struct ExprCtx<'a> {
    pub doc: &'a Document,
    pub structs: &'a StructEnv,
    pub opts: &'a CheckOptions,
    /// Whether `stdout()` / `stderr()` / `glob()` are in scope (task output
    /// sections only).
    pub task_output: bool,
}

// ---------------------------------------------------------------------------
// Task checking
// ---------------------------------------------------------------------------

pub(crate) fn check_task(
    task: &Task,
    doc: &Document,
    structs: &StructEnv,
    opts: &CheckOptions,
    errors: &mut Vec<CheckError>,
) {
    let mut ctx = ExprCtx {
        doc,
        structs,
        opts,
        task_output: false,
    };
    let mut scope = Scope::new();

    // Hoist inputs and post-input declarations.
    let decls: Vec<&Decl> = task.inputs.iter().chain(task.postinputs.iter()).collect();
    for (i, d) in decls.iter().enumerate() {
        let ty = resolve_type(&d.ty, structs, d.span, errors);
        if !scope.bind(&d.name, i, ScopeBinding::Value(ty), false) {
            errors.push(CheckError::error(
                ErrorKind::NameCollision,
                d.span,
                format!("duplicate declaration `{}` in task `{}`", d.name, task.name),
            ));
        }
    }

    // Check declaration initializers in order.
    for (i, d) in decls.iter().enumerate() {
        scope.advance(i);
        check_decl(d, &scope, &ctx, errors);
    }
    scope.advance(decls.len());

    // Command placeholders.
    for part in &task.command.parts {
        if let CommandPart::Placeholder(ph) = part {
            check_placeholder(ph, &scope, &ctx, errors);
        }
    }

    // Runtime and hints expressions.
    for (_, expr) in task.runtime.iter().chain(task.hints.iter()) {
        infer_expr(expr, &scope, &ctx, errors);
    }

    // Outputs: post-execution filesystem functions become available, and
    // each output may reference the ones before it.
    ctx.task_output = true;
    let base = decls.len();
    let mut out_scope = scope.child();
    for (i, d) in task.outputs.iter().enumerate() {
        let ty = resolve_type(&d.ty, structs, d.span, errors);
        if !out_scope.bind(&d.name, base + i, ScopeBinding::Value(ty), false) {
            errors.push(CheckError::error(
                ErrorKind::NameCollision,
                d.span,
                format!("duplicate output `{}` in task `{}`", d.name, task.name),
            ));
        }
    }
    for (i, d) in task.outputs.iter().enumerate() {
        out_scope.advance(base + i);
        if d.expr.is_none() {
            errors.push(CheckError::error(
                ErrorKind::StaticTypeMismatch,
                d.span,
                format!("task output `{}` requires an expression", d.name),
            ));
        }
        check_decl(d, &out_scope, &ctx, errors);
    }
}

// ---------------------------------------------------------------------------
// Workflow checking
// ---------------------------------------------------------------------------

pub(crate) fn check_workflow(
    wf: &Workflow,
    doc: &Document,
    structs: &StructEnv,
    opts: &CheckOptions,
    errors: &mut Vec<CheckError>,
) {
    let ctx = ExprCtx {
        doc,
        structs,
        opts,
        task_output: false,
    };
    let mut scope = Scope::new();

    // Hoist workflow inputs.
    for (i, d) in wf.inputs.iter().enumerate() {
        let ty = resolve_type(&d.ty, structs, d.span, errors);
        bind_checked(&mut scope, &d.name, i, ScopeBinding::Value(ty), false, false, d.span, &ctx, errors);
    }
    let base = wf.inputs.len();

    // Hoist body nodes (and expose section internals, lifted).
    bind_level(&wf.body, &mut scope, base, &ctx, errors);

    // Hoist output declarations (the implicit final section).
    let out_base = base + wf.body.len();
    if let Some(outputs) = &wf.outputs {
        for (i, d) in outputs.iter().enumerate() {
            let ty = resolve_type(&d.ty, structs, d.span, errors);
            bind_checked(
                &mut scope,
                &d.name,
                out_base + i,
                ScopeBinding::Value(ty),
                false,
                false,
                d.span,
                &ctx,
                errors,
            );
        }
    }

    // Check input defaults, then the body, then outputs.
    for (i, d) in wf.inputs.iter().enumerate() {
        scope.advance(i);
        check_decl(d, &scope, &ctx, errors);
    }
    check_level(&wf.body, &scope, base, &ctx, errors);

    scope.advance(out_base);
    if let Some(outputs) = &wf.outputs {
        for (i, d) in outputs.iter().enumerate() {
            scope.advance(out_base + i);
            if d.expr.is_none() {
                errors.push(CheckError::error(
                    ErrorKind::StaticTypeMismatch,
                    d.span,
                    format!("workflow output `{}` requires an expression", d.name),
                ));
            }
            check_decl(d, &scope, &ctx, errors);
        }
    }
}

/// Bind into `scope`, reporting collisions. Declarations and aliases may
/// not take a task/workflow name from this document; an unaliased `call
/// t` binding its own callee's name is the one sanctioned overlap.
fn bind_checked(
    scope: &mut Scope<'_>,
    name: &str,
    order: usize,
    binding: ScopeBinding,
    exposure: bool,
    owns_doc_name: bool,
    span: Span,
    ctx: &ExprCtx<'_>,
    errors: &mut Vec<CheckError>,
) {
    if !exposure
        && !owns_doc_name
        && (ctx.doc.task(name).is_some()
            || ctx.doc.workflow.as_ref().is_some_and(|w| w.name == name))
    {
        errors.push(CheckError::error(
            ErrorKind::NameCollision,
            span,
            format!("`{name}` collides with a task or workflow name in this document"),
        ));
        return;
    }
    if !scope.bind(name, order, binding, exposure) {
        errors.push(CheckError::error(
            ErrorKind::NameCollision,
            span,
            format!("name `{name}` is already bound in this scope"),
        ));
    }
}

/// Pass A over one nesting level: hoist declarations, calls, and section
/// exposures (lifted through the section).
fn bind_level(
    nodes: &[WorkflowNode],
    scope: &mut Scope<'_>,
    base: usize,
    ctx: &ExprCtx<'_>,
    errors: &mut Vec<CheckError>,
) {
    for (i, node) in nodes.iter().enumerate() {
        let order = base + i;
        match node {
            WorkflowNode::Decl(d) => {
                let ty = resolve_type(&d.ty, ctx.structs, d.span, errors);
                bind_checked(scope, &d.name, order, ScopeBinding::Value(ty), false, false, d.span, ctx, errors);
            }
            WorkflowNode::Call(c) => {
                let outputs = match resolve_callee_sig(ctx.doc, &c.callee, errors) {
                    Some(sig) => sig
                        .outputs
                        .iter()
                        .map(|(n, t)| (n.clone(), t.clone()))
                        .collect(),
                    None => {
                        errors.push(CheckError::error(
                            ErrorKind::UnknownIdentifier,
                            c.span,
                            format!("no task or workflow named `{}`", c.callee.join(".")),
                        ));
                        Vec::new()
                    }
                };
                let owns_doc_name =
                    c.alias.is_none() && c.callee.last().map(String::as_str) == Some(c.name());
                bind_checked(
                    scope,
                    c.name(),
                    order,
                    ScopeBinding::Call(outputs),
                    false,
                    owns_doc_name,
                    c.span,
                    ctx,
                    errors,
                );
            }
            WorkflowNode::Scatter(s) => {
                for (name, binding) in section_exposures(&s.body, ctx, errors) {
                    let lifted = lift_binding(binding, |t| t.lifted_by_scatter());
                    bind_checked(scope, &name, order, lifted, true, false, s.span, ctx, errors);
                }
            }
            WorkflowNode::Conditional(c) => {
                for (name, binding) in section_exposures(&c.body, ctx, errors) {
                    let lifted = lift_binding(binding, |t| t.lifted_by_conditional());
                    bind_checked(scope, &name, order, lifted, true, false, c.span, ctx, errors);
                }
            }
        }
    }
}

/// Names a section exposes to its siblings (unlifted; the caller applies
/// the section's lift).
fn section_exposures(
    body: &[WorkflowNode],
    ctx: &ExprCtx<'_>,
    errors: &mut Vec<CheckError>,
) -> Vec<(String, ScopeBinding)> {
    let mut out = Vec::new();
    for node in body {
        match node {
            WorkflowNode::Decl(d) => {
                let ty = resolve_type(&d.ty, ctx.structs, d.span, errors);
                out.push((d.name.clone(), ScopeBinding::Value(ty)));
            }
            WorkflowNode::Call(c) => {
                let mut scratch = Vec::new();
                let outputs = resolve_callee_sig(ctx.doc, &c.callee, &mut scratch)
                    .map(|sig| sig.outputs)
                    .unwrap_or_default();
                out.push((c.name().to_string(), ScopeBinding::Call(outputs)));
            }
            WorkflowNode::Scatter(s) => {
                for (name, b) in section_exposures(&s.body, ctx, errors) {
                    out.push((name, lift_binding(b, |t| t.lifted_by_scatter())));
                }
            }
            WorkflowNode::Conditional(c) => {
                for (name, b) in section_exposures(&c.body, ctx, errors) {
                    out.push((name, lift_binding(b, |t| t.lifted_by_conditional())));
                }
            }
        }
    }
    out
}

fn lift_binding(binding: ScopeBinding, lift: impl Fn(&Type) -> Type) -> ScopeBinding {
    match binding {
        ScopeBinding::Value(t) => ScopeBinding::Value(lift(&t)),
        ScopeBinding::Call(outputs) => {
            ScopeBinding::Call(outputs.into_iter().map(|(n, t)| (n, lift(&t))).collect())
        }
    }
}

/// Pass B over one nesting level: check every expression.
fn check_level(
    nodes: &[WorkflowNode],
    scope: &Scope<'_>,
    base: usize,
    ctx: &ExprCtx<'_>,
    errors: &mut Vec<CheckError>,
) {
    for (i, node) in nodes.iter().enumerate() {
        scope.advance(base + i);
        match node {
            WorkflowNode::Decl(d) => check_decl(d, scope, ctx, errors),
            WorkflowNode::Call(c) => check_call(c, scope, ctx, errors),
            WorkflowNode::Scatter(s) => check_scatter(s, scope, ctx, errors),
            WorkflowNode::Conditional(c) => check_conditional(c, scope, ctx, errors),
        }
    }
}

fn check_decl(d: &Decl, scope: &Scope<'_>, ctx: &ExprCtx<'_>, errors: &mut Vec<CheckError>) {
    let declared = resolve_type(&d.ty, ctx.structs, d.span, errors);
    if let Some(expr) = &d.expr {
        let actual = infer_expr(expr, scope, ctx, errors);
        check_assignable(
            &actual,
            &declared,
            expr.span,
            &format!("value of `{}`", d.name),
            ctx.opts,
            errors,
        );
    }
}

fn check_call(c: &Call, scope: &Scope<'_>, ctx: &ExprCtx<'_>, errors: &mut Vec<CheckError>) {
    let mut scratch = Vec::new();
    let sig = resolve_callee_sig(ctx.doc, &c.callee, &mut scratch);

    for (name, expr) in &c.inputs {
        let actual = infer_expr(expr, scope, ctx, errors);
        match sig
            .as_ref()
            .and_then(|s| s.inputs.iter().find(|(n, _, _)| n == name))
        {
            Some((_, declared, _)) => check_assignable(
                &actual,
                declared,
                expr.span,
                &format!("input `{name}` of call `{}`", c.name()),
                ctx.opts,
                errors,
            ),
            None => {
                if sig.is_some() {
                    errors.push(CheckError::error(
                        ErrorKind::NoSuchMember,
                        expr.span,
                        format!("`{}` has no input named `{name}`", c.callee.join(".")),
                    ));
                }
            }
        }
    }

    for after in &c.afters {
        match scope.resolve(after) {
            Some(r) if matches!(r.entry.binding, ScopeBinding::Call(_)) => {}
            Some(_) => errors.push(CheckError::error(
                ErrorKind::IncompatibleOperand,
                c.span,
                format!("`after {after}` must reference a call"),
            )),
            None => errors.push(CheckError::error(
                ErrorKind::UnknownIdentifier,
                c.span,
                format!("`after {after}` references an unknown name"),
            )),
        }
    }
}

fn check_scatter(s: &Scatter, scope: &Scope<'_>, ctx: &ExprCtx<'_>, errors: &mut Vec<CheckError>) {
    let coll = infer_expr(&s.collection, scope, ctx, errors);
    let item = match &coll.kind {
        TypeKind::Array { item, .. } => (**item).clone(),
        TypeKind::Any => Type::any(),
        _ => {
            errors.push(CheckError::error(
                ErrorKind::StaticTypeMismatch,
                s.collection.span,
                format!("scatter collection must be an Array, got {coll}"),
            ));
            Type::any()
        }
    };

    let mut inner = scope.child();
    bind_checked(&mut inner, &s.variable, 0, ScopeBinding::Value(item), false, false, s.span, ctx, errors);
    bind_level(&s.body, &mut inner, 1, ctx, errors);
    check_level(&s.body, &inner, 1, ctx, errors);
}

fn check_conditional(
    c: &Conditional,
    scope: &Scope<'_>,
    ctx: &ExprCtx<'_>,
    errors: &mut Vec<CheckError>,
) {
    let pred = infer_expr(&c.predicate, scope, ctx, errors);
    if !matches!(pred.kind, TypeKind::Boolean | TypeKind::Any) || pred.optional {
        errors.push(CheckError::error(
            ErrorKind::StaticTypeMismatch,
            c.predicate.span,
            format!("conditional predicate must be Boolean, got {pred}"),
        ));
    }

    let mut inner = scope.child();
    bind_level(&c.body, &mut inner, 0, ctx, errors);
    check_level(&c.body, &inner, 0, ctx, errors);
}

// ---------------------------------------------------------------------------
// Expression type inference
// ---------------------------------------------------------------------------

/// Infer the type of an expression bottom-up, pushing diagnostics for every
/// ill-typed subterm. Returns `Any` where no type can be assigned, so one
/// mistake does not cascade.
pub(crate) fn infer_expr(
    expr: &Expr,
    scope: &Scope<'_>,
    ctx: &ExprCtx<'_>,
    errors: &mut Vec<CheckError>,
) -> Type {
    match &expr.kind {
        ExprKind::Boolean(_) => Type::boolean(),
        ExprKind::Int(_) => Type::int(),
        ExprKind::Float(_) => Type::float(),
        ExprKind::None => Type::any().with_optional(true),
        ExprKind::String(parts) => {
            for part in parts {
                if let StringPart::Placeholder(ph) = part {
                    check_placeholder(ph, scope, ctx, errors);
                }
            }
            Type::string()
        }
        ExprKind::Ident(name) => resolve_value_ident(name, expr.span, scope, ctx, errors),
        ExprKind::Array(items) => {
            if items.is_empty() {
                return Type::array(Type::any());
            }
            let item_types: Vec<Type> = items
                .iter()
                .map(|e| infer_expr(e, scope, ctx, errors))
                .collect();
            match unify(&item_types) {
                Some(t) => Type::array_nonempty(t),
                None => {
                    errors.push(CheckError::error(
                        ErrorKind::StaticTypeMismatch,
                        expr.span,
                        "array literal items have no common type",
                    ));
                    Type::array(Type::any())
                }
            }
        }
        ExprKind::Map(entries) => {
            if entries.is_empty() {
                return Type::map(Type::any(), Type::any());
            }
            let keys: Vec<Type> = entries
                .iter()
                .map(|(k, _)| infer_expr(k, scope, ctx, errors))
                .collect();
            let values: Vec<Type> = entries
                .iter()
                .map(|(_, v)| infer_expr(v, scope, ctx, errors))
                .collect();
            match (unify(&keys), unify(&values)) {
                (Some(k), Some(v)) => Type::map(k, v),
                _ => {
                    errors.push(CheckError::error(
                        ErrorKind::StaticTypeMismatch,
                        expr.span,
                        "map literal entries have no common type",
                    ));
                    Type::map(Type::any(), Type::any())
                }
            }
        }
        ExprKind::Pair(l, r) => Type::pair(
            infer_expr(l, scope, ctx, errors),
            infer_expr(r, scope, ctx, errors),
        ),
        ExprKind::Object { type_name, members } => {
            infer_object(expr.span, type_name.as_deref(), members, scope, ctx, errors)
        }
        ExprKind::Index { expr: base, index } => {
            let base_ty = infer_expr(base, scope, ctx, errors);
            let index_ty = infer_expr(index, scope, ctx, errors);
            match &base_ty.kind {
                TypeKind::Array { item, .. } => {
                    check_assignable(&index_ty, &Type::int(), index.span, "array index", ctx.opts, errors);
                    (**item).clone()
                }
                TypeKind::Map { key, value } => {
                    check_assignable(&index_ty, key, index.span, "map key", ctx.opts, errors);
                    (**value).clone()
                }
                TypeKind::Any => Type::any(),
                _ => {
                    errors.push(CheckError::error(
                        ErrorKind::IncompatibleOperand,
                        expr.span,
                        format!("cannot index into {base_ty}"),
                    ));
                    Type::any()
                }
            }
        }
        ExprKind::Member { expr: base, name } => {
            infer_member(expr.span, base, name, scope, ctx, errors)
        }
        ExprKind::Unary { op, operand } => {
            let t = infer_expr(operand, scope, ctx, errors);
            match op {
                UnaryOp::Not => {
                    if !matches!(t.kind, TypeKind::Boolean | TypeKind::Any) {
                        errors.push(CheckError::error(
                            ErrorKind::IncompatibleOperand,
                            expr.span,
                            format!("`!` requires a Boolean operand, got {t}"),
                        ));
                    }
                    Type::boolean()
                }
                UnaryOp::Neg => {
                    if !t.is_numeric() && !t.is_any() {
                        errors.push(CheckError::error(
                            ErrorKind::IncompatibleOperand,
                            expr.span,
                            format!("`-` requires a numeric operand, got {t}"),
                        ));
                    }
                    t.required()
                }
            }
        }
        ExprKind::Binary { op, left, right } => {
            infer_binary(expr.span, *op, left, right, scope, ctx, errors)
        }
        ExprKind::Ternary { cond, then, els } => {
            let cond_ty = infer_expr(cond, scope, ctx, errors);
            if !matches!(cond_ty.kind, TypeKind::Boolean | TypeKind::Any) {
                errors.push(CheckError::error(
                    ErrorKind::StaticTypeMismatch,
                    cond.span,
                    format!("conditional expression requires a Boolean, got {cond_ty}"),
                ));
            }
            let t = infer_expr(then, scope, ctx, errors);
            let e = infer_expr(els, scope, ctx, errors);
            match unify(&[t.clone(), e.clone()]) {
                Some(u) => u,
                None => {
                    errors.push(CheckError::error(
                        ErrorKind::StaticTypeMismatch,
                        expr.span,
                        format!("conditional branches have incompatible types {t} and {e}"),
                    ));
                    Type::any()
                }
            }
        }
        ExprKind::Apply { name, args } => {
            let arg_types: Vec<Type> = args
                .iter()
                .map(|a| infer_expr(a, scope, ctx, errors))
                .collect();
            infer_apply(name, args, &arg_types, expr.span, ctx, errors)
        }
    }
}

fn resolve_value_ident(
    name: &str,
    span: Span,
    scope: &Scope<'_>,
    ctx: &ExprCtx<'_>,
    errors: &mut Vec<CheckError>,
) -> Type {
    match scope.resolve(name) {
        Some(r) => {
            if r.forward {
                report_forward(name, span, ctx, errors);
            }
            match &r.entry.binding {
                ScopeBinding::Value(t) => t.clone(),
                ScopeBinding::Call(_) => {
                    errors.push(CheckError::error(
                        ErrorKind::IncompatibleOperand,
                        span,
                        format!("`{name}` is a call; reference one of its outputs"),
                    ));
                    Type::any()
                }
            }
        }
        None => {
            errors.push(CheckError::error(
                ErrorKind::UnknownIdentifier,
                span,
                format!("unknown identifier `{name}`"),
            ));
            Type::any()
        }
    }
}

fn report_forward(name: &str, span: Span, ctx: &ExprCtx<'_>, errors: &mut Vec<CheckError>) {
    let suppressed = ctx.opts.suppressed(ErrorKind::ForwardReference);
    let e = if suppressed {
        CheckError::warning(
            ErrorKind::ForwardReference,
            span,
            format!("`{name}` is referenced before its definition"),
        )
    } else {
        CheckError::error(
            ErrorKind::ForwardReference,
            span,
            format!(
                "`{name}` is referenced before its definition \
                 (suppress `forward-reference` to allow)"
            ),
        )
    };
    errors.push(e);
}

fn infer_member(
    span: Span,
    base: &Expr,
    name: &str,
    scope: &Scope<'_>,
    ctx: &ExprCtx<'_>,
    errors: &mut Vec<CheckError>,
) -> Type {
    // `call.output` resolves through the call binding, not a value type.
    if let ExprKind::Ident(base_name) = &base.kind {
        if let Some((t, forward)) = scope.call_output(base_name, name) {
            if forward {
                report_forward(base_name, span, ctx, errors);
            }
            return t;
        }
        if let Some(r) = scope.resolve(base_name) {
            if matches!(r.entry.binding, ScopeBinding::Call(_)) {
                errors.push(CheckError::error(
                    ErrorKind::NoSuchMember,
                    span,
                    format!("call `{base_name}` has no output named `{name}`"),
                ));
                return Type::any();
            }
        }
    }

    let base_ty = infer_expr(base, scope, ctx, errors);
    match &base_ty.kind {
        TypeKind::Pair { left, right } => match name {
            "left" => (**left).clone(),
            "right" => (**right).clone(),
            _ => {
                errors.push(CheckError::error(
                    ErrorKind::NoSuchMember,
                    span,
                    format!("Pair has no member `{name}` (use .left / .right)"),
                ));
                Type::any()
            }
        },
        TypeKind::StructInstance {
            name: struct_name,
            members,
        } => match members.iter().find(|(n, _)| n == name) {
            Some((_, t)) => t.clone(),
            None => {
                errors.push(CheckError::error(
                    ErrorKind::NoSuchMember,
                    span,
                    format!("struct `{struct_name}` has no member `{name}`"),
                ));
                Type::any()
            }
        },
        TypeKind::Object | TypeKind::Any => Type::any(),
        _ => {
            errors.push(CheckError::error(
                ErrorKind::NoSuchMember,
                span,
                format!("{base_ty} has no members"),
            ));
            Type::any()
        }
    }
}

fn infer_object(
    span: Span,
    type_name: Option<&str>,
    members: &[(String, Expr)],
    scope: &Scope<'_>,
    ctx: &ExprCtx<'_>,
    errors: &mut Vec<CheckError>,
) -> Type {
    let member_types: Vec<(String, Type)> = members
        .iter()
        .map(|(n, e)| (n.clone(), infer_expr(e, scope, ctx, errors)))
        .collect();

    let Some(name) = type_name else {
        return Type::object();
    };

    let Some(declared) = ctx.structs.get(name) else {
        errors.push(CheckError::error(
            ErrorKind::UnknownType,
            span,
            format!("unknown struct `{name}`"),
        ));
        return Type::any();
    };

    for (member_name, actual) in &member_types {
        match declared.iter().find(|(n, _)| n == member_name) {
            Some((_, expected)) => check_assignable(
                actual,
                expected,
                span,
                &format!("member `{member_name}` of `{name}`"),
                ctx.opts,
                errors,
            ),
            None => errors.push(CheckError::error(
                ErrorKind::NoSuchMember,
                span,
                format!("struct `{name}` has no member `{member_name}`"),
            )),
        }
    }
    for (member_name, expected) in declared {
        if !expected.optional && !member_types.iter().any(|(n, _)| n == member_name) {
            errors.push(CheckError::error(
                ErrorKind::StaticTypeMismatch,
                span,
                format!("member `{member_name}` of struct `{name}` is not initialized"),
            ));
        }
    }

    Type::new(TypeKind::StructInstance {
        name: name.to_string(),
        members: declared.clone(),
    })
}

fn infer_binary(
    span: Span,
    op: BinOp,
    left: &Expr,
    right: &Expr,
    scope: &Scope<'_>,
    ctx: &ExprCtx<'_>,
    errors: &mut Vec<CheckError>,
) -> Type {
    let lt = infer_expr(left, scope, ctx, errors);
    let rt = infer_expr(right, scope, ctx, errors);

    match op {
        BinOp::And | BinOp::Or => {
            for (t, side) in [(&lt, "left"), (&rt, "right")] {
                if !matches!(t.kind, TypeKind::Boolean | TypeKind::Any) {
                    errors.push(CheckError::error(
                        ErrorKind::IncompatibleOperand,
                        span,
                        format!("`{}` requires Boolean operands, {side} side is {t}", op.symbol()),
                    ));
                }
            }
            Type::boolean()
        }
        BinOp::Eq | BinOp::Ne => {
            if crate::types::coerce(&lt, &rt).is_err() && crate::types::coerce(&rt, &lt).is_err() {
                errors.push(CheckError::error(
                    ErrorKind::IncompatibleOperand,
                    span,
                    format!("`{}` between incompatible types {lt} and {rt}", op.symbol()),
                ));
            }
            Type::boolean()
        }
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let orderable = |t: &Type| {
                t.is_numeric() || matches!(t.kind, TypeKind::String | TypeKind::Any)
            };
            for (t, side) in [(&lt, "left"), (&rt, "right")] {
                if !orderable(t) {
                    errors.push(CheckError::error(
                        ErrorKind::IncompatibleOperand,
                        span,
                        format!(
                            "`{}` requires numeric or String operands, {side} side is {t}",
                            op.symbol()
                        ),
                    ));
                }
            }
            Type::boolean()
        }
        BinOp::Add => {
            // String concatenation absorbs any stringable operand.
            if matches!(lt.kind, TypeKind::String) || matches!(rt.kind, TypeKind::String) {
                for (t, side) in [(&lt, "left"), (&rt, "right")] {
                    if !t.is_stringable() && !t.is_any() {
                        errors.push(CheckError::error(
                            ErrorKind::IncompatibleOperand,
                            span,
                            format!("`+` cannot concatenate {t} ({side} side)"),
                        ));
                    }
                }
                return Type::string();
            }
            numeric_result(span, op, &lt, &rt, errors)
        }
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
            numeric_result(span, op, &lt, &rt, errors)
        }
    }
}

fn numeric_result(
    span: Span,
    op: BinOp,
    lt: &Type,
    rt: &Type,
    errors: &mut Vec<CheckError>,
) -> Type {
    for (t, side) in [(lt, "left"), (rt, "right")] {
        if !t.is_numeric() && !t.is_any() {
            errors.push(CheckError::error(
                ErrorKind::IncompatibleOperand,
                span,
                format!("`{}` requires numeric operands, {side} side is {t}", op.symbol()),
            ));
            return Type::any();
        }
    }
    if matches!(lt.kind, TypeKind::Float) || matches!(rt.kind, TypeKind::Float) {
        Type::float()
    } else if lt.is_any() || rt.is_any() {
        Type::any()
    } else {
        Type::int()
    }
}

/// Check a `~{...}` placeholder: the inner expression plus its options.
pub(crate) fn check_placeholder(
    ph: &Placeholder,
    scope: &Scope<'_>,
    ctx: &ExprCtx<'_>,
    errors: &mut Vec<CheckError>,
) {
    let t = infer_expr(&ph.expr, scope, ctx, errors);
    let has_sep = ph
        .options
        .iter()
        .any(|o| matches!(o, PlaceholderOption::Sep(_)));
    let has_truefalse = ph
        .options
        .iter()
        .any(|o| matches!(o, PlaceholderOption::TrueFalse(..)));

    match &t.kind {
        TypeKind::Array { item, .. } => {
            if !has_sep {
                errors.push(CheckError::error(
                    ErrorKind::StaticTypeMismatch,
                    ph.span,
                    format!("cannot interpolate {t} without a `sep=` option"),
                ));
            } else if !item.is_stringable() && !item.is_any() {
                errors.push(CheckError::error(
                    ErrorKind::StaticTypeMismatch,
                    ph.span,
                    format!("cannot interpolate array items of type {item}"),
                ));
            }
        }
        TypeKind::Boolean => {}
        TypeKind::Map { .. } | TypeKind::Pair { .. } | TypeKind::StructInstance { .. }
        | TypeKind::Object => {
            errors.push(CheckError::error(
                ErrorKind::StaticTypeMismatch,
                ph.span,
                format!("cannot interpolate a value of type {t}"),
            ));
        }
        _ => {}
    }
    if has_truefalse && !matches!(t.kind, TypeKind::Boolean | TypeKind::Any) {
        errors.push(CheckError::error(
            ErrorKind::StaticTypeMismatch,
            ph.span,
            format!("`true=`/`false=` options require a Boolean, got {t}"),
        ));
    }
}
