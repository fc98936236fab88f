use crate::ast::{Expr, Span};
use crate::types::{Type, TypeKind, coerce};

use super::infer::ExprCtx;
use super::{CheckError, ErrorKind, check_assignable};

// ---------------------------------------------------------------------------
// Standard-library signatures
// ---------------------------------------------------------------------------

/// Type a standard-library application. Static functions check a fixed
/// signature; polymorphic ones compute their result from the argument
/// types. Unknown names report `NoSuchFunction`.
pub(crate) fn infer_apply(
    name: &str,
    args: &[Expr],
    arg_types: &[Type],
    span: Span,
    ctx: &ExprCtx<'_>,
    errors: &mut Vec<CheckError>,
) -> Type {
    let mut sig = SigCheck {
        name,
        args,
        arg_types,
        span,
        ctx,
        errors,
    };

    match name {
        // -- numeric ---------------------------------------------------
        "floor" | "ceil" | "round" => {
            sig.arity(1);
            sig.arg(0, &Type::float());
            Type::int()
        }
        "min" | "max" => {
            sig.arity(2);
            let mut float = false;
            for i in 0..2 {
                match sig.ty(i).map(|t| t.kind.clone()) {
                    Some(TypeKind::Int) | Some(TypeKind::Any) | None => {}
                    Some(TypeKind::Float) => float = true,
                    Some(_) => sig.wrong_arg(i, "Int or Float"),
                }
            }
            if float { Type::float() } else { Type::int() }
        }

        // -- containers ------------------------------------------------
        "length" => {
            sig.arity(1);
            match sig.item_of(0) {
                Some(_) => {}
                None => sig.wrong_arg(0, "Array"),
            }
            Type::int()
        }
        "range" => {
            sig.arity(1);
            sig.arg(0, &Type::int());
            Type::array(Type::int())
        }
        "flatten" => {
            sig.arity(1);
            match sig.item_of(0) {
                Some(inner) => match inner.kind {
                    TypeKind::Array { ref item, .. } => Type::array((**item).clone()),
                    TypeKind::Any => Type::array(Type::any()),
                    _ => {
                        sig.wrong_arg(0, "Array[Array[X]]");
                        Type::array(Type::any())
                    }
                },
                None => {
                    sig.wrong_arg(0, "Array[Array[X]]");
                    Type::array(Type::any())
                }
            }
        }
        "transpose" => {
            sig.arity(1);
            match sig.item_of(0) {
                Some(inner) if matches!(inner.kind, TypeKind::Array { .. } | TypeKind::Any) => {
                    sig.ty(0).cloned().unwrap_or_else(Type::any)
                }
                _ => {
                    sig.wrong_arg(0, "Array[Array[X]]");
                    Type::any()
                }
            }
        }
        "zip" | "cross" => {
            sig.arity(2);
            let a = sig.item_of(0).unwrap_or_else(|| {
                sig.wrong_arg(0, "Array");
                Type::any()
            });
            let b = sig.item_of(1).unwrap_or_else(|| {
                sig.wrong_arg(1, "Array");
                Type::any()
            });
            Type::array(Type::pair(a, b))
        }
        "keys" => {
            sig.arity(1);
            match sig.ty(0).map(|t| t.kind.clone()) {
                Some(TypeKind::Map { key, .. }) => Type::array((*key).clone()),
                Some(TypeKind::Any) | None => Type::array(Type::any()),
                Some(_) => {
                    sig.wrong_arg(0, "Map");
                    Type::array(Type::any())
                }
            }
        }

        // -- optionals -------------------------------------------------
        "defined" => {
            sig.arity(1);
            Type::boolean()
        }
        "select_first" => {
            sig.arity(1);
            match sig.item_of(0) {
                Some(item) => item.required(),
                None => {
                    sig.wrong_arg(0, "Array[X?]");
                    Type::any()
                }
            }
        }
        "select_all" => {
            sig.arity(1);
            match sig.item_of(0) {
                Some(item) => Type::array(item.required()),
                None => {
                    sig.wrong_arg(0, "Array[X?]");
                    Type::array(Type::any())
                }
            }
        }

        // -- strings ---------------------------------------------------
        "sub" => {
            sig.arity(3);
            for i in 0..3 {
                sig.arg(i, &Type::string());
            }
            Type::string()
        }
        "basename" => {
            sig.arity_range(1, 2);
            match sig.ty(0).map(|t| t.kind.clone()) {
                Some(TypeKind::File | TypeKind::Directory | TypeKind::String | TypeKind::Any)
                | None => {}
                Some(_) => sig.wrong_arg(0, "File or String"),
            }
            if sig.arg_types.len() == 2 {
                sig.arg(1, &Type::string());
            }
            Type::string()
        }
        "sep" => {
            sig.arity(2);
            sig.arg(0, &Type::string());
            match sig.item_of(1) {
                Some(item) if item.is_stringable() || item.is_any() => {}
                Some(_) | None => sig.wrong_arg(1, "Array of printable values"),
            }
            Type::string()
        }
        "prefix" | "suffix" => {
            sig.arity(2);
            sig.arg(0, &Type::string());
            match sig.item_of(1) {
                Some(item) if item.is_stringable() || item.is_any() => {}
                Some(_) | None => sig.wrong_arg(1, "Array of printable values"),
            }
            Type::array(Type::string())
        }
        "quote" | "squote" => {
            sig.arity(1);
            match sig.item_of(0) {
                Some(item) if item.is_stringable() || item.is_any() => {}
                Some(_) | None => sig.wrong_arg(0, "Array of printable values"),
            }
            Type::array(Type::string())
        }

        // -- filesystem ------------------------------------------------
        "size" => {
            sig.arity_range(1, 2);
            let ok = match sig.ty(0).map(|t| t.kind.clone()) {
                Some(TypeKind::File | TypeKind::Directory | TypeKind::String | TypeKind::Any)
                | None => true,
                Some(TypeKind::Array { ref item, .. }) => matches!(
                    item.kind,
                    TypeKind::File | TypeKind::Directory | TypeKind::String | TypeKind::Any
                ),
                Some(_) => false,
            };
            if !ok {
                sig.wrong_arg(0, "File, File?, or Array[File]");
            }
            if sig.arg_types.len() == 2 {
                sig.arg(1, &Type::string());
            }
            Type::float()
        }
        "stdout" | "stderr" => {
            sig.arity(0);
            if !sig.ctx.task_output {
                sig.errors.push(CheckError::error(
                    ErrorKind::NoSuchFunction,
                    span,
                    format!("{name}() is only available in task output sections"),
                ));
            }
            Type::file()
        }
        "glob" => {
            sig.arity(1);
            sig.arg(0, &Type::string());
            if !sig.ctx.task_output {
                sig.errors.push(CheckError::error(
                    ErrorKind::NoSuchFunction,
                    span,
                    "glob() is only available in task output sections",
                ));
            }
            Type::array(Type::file())
        }

        // -- readers ---------------------------------------------------
        "read_string" => sig.reader(Type::string()),
        "read_int" => sig.reader(Type::int()),
        "read_float" => sig.reader(Type::float()),
        "read_boolean" => sig.reader(Type::boolean()),
        "read_lines" => sig.reader(Type::array(Type::string())),
        "read_tsv" => sig.reader(Type::array(Type::array(Type::string()))),
        "read_map" => sig.reader(Type::map(Type::string(), Type::string())),
        "read_json" => sig.reader(Type::any()),
        "read_object" => sig.reader(Type::object()),

        // -- writers ---------------------------------------------------
        "write_lines" => {
            sig.arity(1);
            sig.arg(0, &Type::array(Type::string()));
            Type::file()
        }
        "write_tsv" => {
            sig.arity(1);
            sig.arg(0, &Type::array(Type::array(Type::string())));
            Type::file()
        }
        "write_map" => {
            sig.arity(1);
            sig.arg(0, &Type::map(Type::string(), Type::string()));
            Type::file()
        }
        "write_json" => {
            sig.arity(1);
            Type::file()
        }

        _ => {
            sig.errors.push(CheckError::error(
                ErrorKind::NoSuchFunction,
                span,
                format!("no function named `{name}`"),
            ));
            Type::any()
        }
    }
}

// ---------------------------------------------------------------------------
// SigCheck — small helper over one application site
// ---------------------------------------------------------------------------

struct SigCheck<'a, 'e> {
    name: &'a str,
    args: &'a [Expr],
    arg_types: &'a [Type],
    span: Span,
    ctx: &'a ExprCtx<'a>,
    errors: &'e mut Vec<CheckError>,
}

impl<'a> SigCheck<'a, '_> {
    fn arity(&mut self, n: usize) {
        if self.arg_types.len() != n {
            self.errors.push(CheckError::error(
                ErrorKind::StaticTypeMismatch,
                self.span,
                format!(
                    "{}() takes {n} argument{}, got {}",
                    self.name,
                    if n == 1 { "" } else { "s" },
                    self.arg_types.len()
                ),
            ));
        }
    }

    fn arity_range(&mut self, min: usize, max: usize) {
        let n = self.arg_types.len();
        if n < min || n > max {
            self.errors.push(CheckError::error(
                ErrorKind::StaticTypeMismatch,
                self.span,
                format!("{}() takes {min}..{max} arguments, got {n}", self.name),
            ));
        }
    }

    fn ty(&self, i: usize) -> Option<&'a Type> {
        self.arg_types.get(i)
    }

    fn arg_span(&self, i: usize) -> Span {
        self.args.get(i).map(|a| a.span).unwrap_or(self.span)
    }

    /// Check argument `i` against an expected type, with coercions.
    fn arg(&mut self, i: usize, expected: &Type) {
        if let Some(actual) = self.arg_types.get(i) {
            check_assignable(
                actual,
                expected,
                self.arg_span(i),
                &format!("argument {} of {}()", i + 1, self.name),
                self.ctx.opts,
                self.errors,
            );
        }
    }

    fn wrong_arg(&mut self, i: usize, expected: &str) {
        let got = self
            .ty(i)
            .map(|t| t.to_string())
            .unwrap_or_else(|| "nothing".to_string());
        self.errors.push(CheckError::error(
            ErrorKind::StaticTypeMismatch,
            self.arg_span(i),
            format!("argument {} of {}() must be {expected}, got {got}", i + 1, self.name),
        ));
    }

    /// Item type of an Array argument (Any arrays yield Any).
    fn item_of(&self, i: usize) -> Option<Type> {
        match self.ty(i).map(|t| &t.kind) {
            Some(TypeKind::Array { item, .. }) => Some((**item).clone()),
            Some(TypeKind::Any) => Some(Type::any()),
            _ => None,
        }
    }

    /// `read_*` signature: one File (or coercible) argument.
    fn reader(&mut self, result: Type) -> Type {
        self.arity(1);
        if let Some(actual) = self.ty(0) {
            if coerce(actual, &Type::file()).is_err() {
                let msg = format!(
                    "argument 1 of {}() must be a File, got {actual}",
                    self.name
                );
                let span = self.arg_span(0);
                self.errors
                    .push(CheckError::error(ErrorKind::StaticTypeMismatch, span, msg));
            }
        }
        result
    }
}
