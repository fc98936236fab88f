use std::collections::HashMap;

use crate::ast::{Decl, Document, Span, Task, Workflow};
use crate::types::{Coercion, CoercionWarning, Type, TypeKind, check_quant, coerce};

pub mod imports;
pub mod lint;

mod funcs;
mod infer;
mod scope;

#[cfg(test)]
mod tests;

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// Diagnostic kinds. `kind_str()` yields the stable error-kind string used
/// in machine-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    StaticTypeMismatch,
    NoSuchFunction,
    NoSuchMember,
    IncompatibleOperand,
    NameCollision,
    ForwardReference,
    QuantityCoercion,
    UnknownIdentifier,
    UnknownType,
    StructCycle,
    GraphCycle,
    ImportError,
    // Warnings
    StringCoercion,
    FileCoercion,
    EmptyNonempty,
    VersionDefaulted,
    Lint,
}

impl ErrorKind {
    pub fn kind_str(self) -> &'static str {
        match self {
            ErrorKind::ImportError => "ImportError",
            ErrorKind::Lint => "Lint",
            ErrorKind::StringCoercion
            | ErrorKind::FileCoercion
            | ErrorKind::EmptyNonempty
            | ErrorKind::VersionDefaulted => "Warning",
            _ => "TypeError",
        }
    }

    /// Key accepted by `--suppress`.
    pub fn suppress_key(self) -> &'static str {
        match self {
            ErrorKind::StringCoercion => "string-coercion",
            ErrorKind::FileCoercion => "file-coercion",
            ErrorKind::EmptyNonempty => "empty-nonempty",
            ErrorKind::ForwardReference => "forward-reference",
            ErrorKind::VersionDefaulted => "version-defaulted",
            ErrorKind::Lint => "lint",
            _ => "",
        }
    }
}

/// One checker diagnostic, pinned to a span of the offending document.
#[derive(Debug, Clone)]
pub struct CheckError {
    pub severity: Severity,
    pub kind: ErrorKind,
    pub span: Span,
    pub message: String,
}

impl CheckError {
    pub fn error(kind: ErrorKind, span: Span, message: impl Into<String>) -> Self {
        CheckError {
            severity: Severity::Error,
            kind,
            span,
            message: message.into(),
        }
    }

    pub fn warning(kind: ErrorKind, span: Span, message: impl Into<String>) -> Self {
        CheckError {
            severity: Severity::Warning,
            kind,
            span,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{tag}[{}]: {}", self.kind.kind_str(), self.message)
    }
}

/// Policy knobs for the checker.
#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    /// Relax `T? -> T` quantifier enforcement.
    pub relaxed_quant: bool,
    /// Downgrade the listed suppressible kinds to warnings / drop them.
    pub suppress: Vec<String>,
    /// Ignore the suppress list entirely (report everything).
    pub no_suppress: bool,
}

impl CheckOptions {
    pub(crate) fn suppressed(&self, kind: ErrorKind) -> bool {
        if self.no_suppress {
            return false;
        }
        let key = kind.suppress_key();
        !key.is_empty() && self.suppress.iter().any(|s| s == key)
    }
}

// ---------------------------------------------------------------------------
// Struct environment
// ---------------------------------------------------------------------------

/// Fully-resolved struct typedefs visible in one document, including
/// imported structs under their aliases.
pub type StructEnv = HashMap<String, Vec<(String, Type)>>;

/// Build the struct environment for a document: local typedefs plus every
/// import's structs (renamed through `alias S as T`). Member types are
/// resolved recursively; cycles and name collisions are reported.
pub fn build_struct_env(doc: &Document, errors: &mut Vec<CheckError>) -> StructEnv {
    // Gather raw defs first (imports shallow: their envs are already legal
    // in their own documents, so only names cross the boundary).
    let mut raw: HashMap<String, (Span, Vec<(String, Type)>)> = HashMap::new();
    for import in &doc.imports {
        let Some(child) = &import.doc else { continue };
        let mut child_errors = Vec::new();
        let child_env = build_struct_env(child, &mut child_errors);
        for td in &child.struct_typedefs {
            let exported = import
                .aliases
                .iter()
                .find(|(from, _)| from == &td.name)
                .map(|(_, to)| to.clone())
                .unwrap_or_else(|| td.name.clone());
            if let Some(members) = child_env.get(&td.name) {
                if raw.insert(exported.clone(), (import.span, members.clone())).is_some() {
                    errors.push(CheckError::error(
                        ErrorKind::NameCollision,
                        import.span,
                        format!("struct name `{exported}` collides with another struct"),
                    ));
                }
            }
        }
    }
    for td in &doc.struct_typedefs {
        let mut seen = std::collections::HashSet::new();
        for (member, _) in &td.members {
            if !seen.insert(member.as_str()) {
                errors.push(CheckError::error(
                    ErrorKind::NameCollision,
                    td.span,
                    format!("duplicate member `{member}` in struct `{}`", td.name),
                ));
            }
        }
        if raw.insert(td.name.clone(), (td.span, td.members.clone())).is_some() {
            errors.push(CheckError::error(
                ErrorKind::NameCollision,
                td.span,
                format!("struct name `{}` collides with another struct", td.name),
            ));
        }
    }

    // Resolve member types, detecting cycles.
    let mut env: StructEnv = HashMap::new();
    let names: Vec<String> = raw.keys().cloned().collect();
    for name in names {
        let mut visiting = vec![name.clone()];
        resolve_struct(&name, &raw, &mut env, &mut visiting, errors);
    }
    env
}

fn resolve_struct(
    name: &str,
    raw: &HashMap<String, (Span, Vec<(String, Type)>)>,
    env: &mut StructEnv,
    visiting: &mut Vec<String>,
    errors: &mut Vec<CheckError>,
) -> Option<Vec<(String, Type)>> {
    if let Some(done) = env.get(name) {
        return Some(done.clone());
    }
    let (span, members) = raw.get(name)?;
    let mut resolved = Vec::with_capacity(members.len());
    for (member, ty) in members {
        match resolve_type_inner(ty, raw, env, visiting, *span, errors) {
            Some(t) => resolved.push((member.clone(), t)),
            None => return None,
        }
    }
    env.insert(name.to_string(), resolved.clone());
    Some(resolved)
}

fn resolve_type_inner(
    ty: &Type,
    raw: &HashMap<String, (Span, Vec<(String, Type)>)>,
    env: &mut StructEnv,
    visiting: &mut Vec<String>,
    span: Span,
    errors: &mut Vec<CheckError>,
) -> Option<Type> {
    let kind = match &ty.kind {
        TypeKind::StructInstance { name, members } if members.is_empty() => {
            if visiting.contains(name) {
                errors.push(CheckError::error(
                    ErrorKind::StructCycle,
                    span,
                    format!("struct `{name}` is part of a definition cycle"),
                ));
                return None;
            }
            visiting.push(name.clone());
            let resolved = resolve_struct(name, raw, env, visiting, errors);
            visiting.pop();
            match resolved {
                Some(members) => TypeKind::StructInstance {
                    name: name.clone(),
                    members,
                },
                None => {
                    errors.push(CheckError::error(
                        ErrorKind::UnknownType,
                        span,
                        format!("unknown type `{name}`"),
                    ));
                    return None;
                }
            }
        }
        TypeKind::Array { item, nonempty } => TypeKind::Array {
            item: Box::new(resolve_type_inner(item, raw, env, visiting, span, errors)?),
            nonempty: *nonempty,
        },
        TypeKind::Map { key, value } => TypeKind::Map {
            key: Box::new(resolve_type_inner(key, raw, env, visiting, span, errors)?),
            value: Box::new(resolve_type_inner(value, raw, env, visiting, span, errors)?),
        },
        TypeKind::Pair { left, right } => TypeKind::Pair {
            left: Box::new(resolve_type_inner(left, raw, env, visiting, span, errors)?),
            right: Box::new(resolve_type_inner(right, raw, env, visiting, span, errors)?),
        },
        other => other.clone(),
    };
    Some(Type {
        kind,
        optional: ty.optional,
    })
}

/// Resolve struct name references in a declared type against the
/// document's struct environment.
pub fn resolve_type(
    ty: &Type,
    structs: &StructEnv,
    span: Span,
    errors: &mut Vec<CheckError>,
) -> Type {
    let kind = match &ty.kind {
        TypeKind::StructInstance { name, members } if members.is_empty() => {
            match structs.get(name) {
                Some(resolved) => TypeKind::StructInstance {
                    name: name.clone(),
                    members: resolved.clone(),
                },
                None => {
                    errors.push(CheckError::error(
                        ErrorKind::UnknownType,
                        span,
                        format!("unknown type `{name}`"),
                    ));
                    TypeKind::Any
                }
            }
        }
        TypeKind::Array { item, nonempty } => TypeKind::Array {
            item: Box::new(resolve_type(item, structs, span, errors)),
            nonempty: *nonempty,
        },
        TypeKind::Map { key, value } => TypeKind::Map {
            key: Box::new(resolve_type(key, structs, span, errors)),
            value: Box::new(resolve_type(value, structs, span, errors)),
        },
        TypeKind::Pair { left, right } => TypeKind::Pair {
            left: Box::new(resolve_type(left, structs, span, errors)),
            right: Box::new(resolve_type(right, structs, span, errors)),
        },
        other => other.clone(),
    };
    Type {
        kind,
        optional: ty.optional,
    }
}

// ---------------------------------------------------------------------------
// Callee signatures
// ---------------------------------------------------------------------------

/// The callable surface of a task or workflow, as seen from a `call`.
#[derive(Debug, Clone)]
pub struct CalleeSig {
    pub name: String,
    pub is_task: bool,
    /// `(name, type, required)`
    pub inputs: Vec<(String, Type, bool)>,
    pub outputs: Vec<(String, Type)>,
}

/// Resolve a possibly-dotted callee path against a document and its
/// imports.
pub fn resolve_callee_sig(
    doc: &Document,
    path: &[String],
    errors: &mut Vec<CheckError>,
) -> Option<CalleeSig> {
    match path {
        [single] => {
            if let Some(task) = doc.task(single) {
                let mut scratch = Vec::new();
                let structs = build_struct_env(doc, &mut scratch);
                return Some(task_sig(task, &structs, errors));
            }
            None
        }
        [ns, rest @ ..] => {
            let import = doc.import(ns)?;
            let child = import.doc.as_ref()?;
            if rest.len() == 1 {
                let mut scratch = Vec::new();
                let structs = build_struct_env(child, &mut scratch);
                if let Some(task) = child.task(&rest[0]) {
                    return Some(task_sig(task, &structs, errors));
                }
                if let Some(wf) = child.workflow.as_ref().filter(|w| w.name == rest[0]) {
                    return Some(workflow_sig(wf, &structs, errors));
                }
                return None;
            }
            resolve_callee_sig(child, rest, errors)
        }
        [] => None,
    }
}

fn task_sig(task: &Task, structs: &StructEnv, errors: &mut Vec<CheckError>) -> CalleeSig {
    CalleeSig {
        name: task.name.clone(),
        is_task: true,
        inputs: decl_sigs(&task.inputs, structs, errors),
        outputs: task
            .outputs
            .iter()
            .map(|d| (d.name.clone(), resolve_type(&d.ty, structs, d.span, errors)))
            .collect(),
    }
}

fn workflow_sig(wf: &Workflow, structs: &StructEnv, errors: &mut Vec<CheckError>) -> CalleeSig {
    CalleeSig {
        name: wf.name.clone(),
        is_task: false,
        inputs: decl_sigs(&wf.inputs, structs, errors),
        outputs: wf
            .outputs
            .iter()
            .flatten()
            .map(|d| (d.name.clone(), resolve_type(&d.ty, structs, d.span, errors)))
            .collect(),
    }
}

fn decl_sigs(
    decls: &[Decl],
    structs: &StructEnv,
    errors: &mut Vec<CheckError>,
) -> Vec<(String, Type, bool)> {
    decls
        .iter()
        .map(|d| {
            let ty = resolve_type(&d.ty, structs, d.span, errors);
            let required = d.expr.is_none() && !ty.optional;
            (d.name.clone(), ty, required)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Coercion checking with policy
// ---------------------------------------------------------------------------

/// Check that `from` may flow into a `to` slot, reporting mismatches,
/// coercion warnings, and quantifier violations per the options.
pub(crate) fn check_assignable(
    from: &Type,
    to: &Type,
    span: Span,
    what: &str,
    opts: &CheckOptions,
    errors: &mut Vec<CheckError>,
) {
    match coerce(from, to) {
        Coercion::Ok => {}
        Coercion::Warn(w) => {
            let kind = match w {
                CoercionWarning::StringCoercion => ErrorKind::StringCoercion,
                CoercionWarning::FileCoercion => ErrorKind::FileCoercion,
                CoercionWarning::EmptyNonempty => ErrorKind::EmptyNonempty,
            };
            if !opts.suppressed(kind) {
                errors.push(CheckError::warning(
                    kind,
                    span,
                    format!("{what}: implicit coercion of {from} to {to}"),
                ));
            }
        }
        Coercion::Err => {
            errors.push(CheckError::error(
                ErrorKind::StaticTypeMismatch,
                span,
                format!("{what}: expected {to}, got {from}"),
            ));
            return;
        }
    }
    if !check_quant(from, to, opts.relaxed_quant) {
        errors.push(CheckError::error(
            ErrorKind::QuantityCoercion,
            span,
            format!(
                "{what}: {from} may be absent and cannot flow into non-optional {to} \
                 (pass --no-quant-check to allow)"
            ),
        ));
    }
}

// ---------------------------------------------------------------------------
// Document checking
// ---------------------------------------------------------------------------

/// Statically check a linked document: struct definitions, task bodies,
/// the workflow (scopes, types, calls), and document-level name rules.
/// Returns every diagnostic found; the document is sound when no
/// `Severity::Error` entry is present.
pub fn check_document(doc: &Document, opts: &CheckOptions) -> Vec<CheckError> {
    let mut errors = Vec::new();

    if doc.version_defaulted && !opts.suppressed(ErrorKind::VersionDefaulted) {
        errors.push(CheckError::warning(
            ErrorKind::VersionDefaulted,
            Span::default(),
            "no `version` statement; assuming draft-2",
        ));
    }

    let structs = build_struct_env(doc, &mut errors);

    // Document-level name collisions: tasks and the workflow share one
    // namespace.
    let mut names: HashMap<&str, Span> = HashMap::new();
    for task in &doc.tasks {
        if names.insert(task.name.as_str(), task.span).is_some() {
            errors.push(CheckError::error(
                ErrorKind::NameCollision,
                task.span,
                format!("duplicate task name `{}`", task.name),
            ));
        }
    }
    if let Some(wf) = &doc.workflow {
        if names.contains_key(wf.name.as_str()) {
            errors.push(CheckError::error(
                ErrorKind::NameCollision,
                wf.span,
                format!("workflow `{}` collides with a task of the same name", wf.name),
            ));
        }
    }

    for task in &doc.tasks {
        infer::check_task(task, doc, &structs, opts, &mut errors);
    }
    if let Some(wf) = &doc.workflow {
        infer::check_workflow(wf, doc, &structs, opts, &mut errors);
    }

    // Imported documents are checked in their own right; their spans point
    // into their own sources, so the message carries the URI.
    for import in &doc.imports {
        if let Some(child) = &import.doc {
            for mut e in check_document(child, opts) {
                e.message = format!("{}: {}", child.uri, e.message);
                errors.push(e);
            }
        }
    }

    errors
}

/// True when no error-severity diagnostic is present.
pub fn is_clean(errors: &[CheckError]) -> bool {
    !errors.iter().any(|e| e.severity == Severity::Error)
}
