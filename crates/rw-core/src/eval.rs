use orion_error::prelude::*;

use rw_lang::ast::{
    BinOp, CommandPart, Expr, ExprKind, Placeholder, PlaceholderOption, StringPart, UnaryOp,
};
use rw_lang::types::Type;

use crate::env::{Binding, Env};
use crate::error::{CoreReason, CoreResult};
use crate::stdlib::Stdlib;
use crate::value::Value;

// ---------------------------------------------------------------------------
// Expression evaluation
// ---------------------------------------------------------------------------

/// Evaluate a typed expression against an environment. Pure except for
/// standard-library filesystem functions, which go through the stdlib's
/// `PathMapper`.
pub fn eval(expr: &Expr, env: &Env, stdlib: &Stdlib) -> CoreResult<Value> {
    match &expr.kind {
        ExprKind::Boolean(b) => Ok(Value::Boolean(*b)),
        ExprKind::Int(i) => Ok(Value::Int(*i)),
        ExprKind::Float(f) => Ok(Value::Float(*f)),
        ExprKind::None => Ok(Value::none()),
        ExprKind::String(parts) => {
            let mut out = String::new();
            for part in parts {
                match part {
                    StringPart::Literal(s) => out.push_str(s),
                    StringPart::Placeholder(ph) => {
                        out.push_str(&eval_placeholder(ph, env, stdlib)?)
                    }
                    _ => unreachable!("StringPart is non_exhaustive but all variants are handled"),
                }
            }
            Ok(Value::String(out))
        }
        ExprKind::Ident(name) => match env.lookup(name) {
            Some(Binding::Value(v)) => Ok(v.clone()),
            Some(Binding::Namespace(_)) => StructError::from(CoreReason::Eval)
                .with_detail(format!("`{name}` is a namespace, not a value"))
                .err(),
            None => StructError::from(CoreReason::Eval)
                .with_detail(format!("`{name}` is not bound"))
                .err(),
        },
        ExprKind::Array(items) => {
            let values: CoreResult<Vec<Value>> =
                items.iter().map(|e| eval(e, env, stdlib)).collect();
            let values = values?;
            let item = rw_lang::types::unify(
                &values.iter().map(Value::wdl_type).collect::<Vec<_>>(),
            )
            .unwrap_or_else(Type::any);
            Ok(Value::Array {
                item,
                items: values,
            })
        }
        ExprKind::Map(entries) => {
            let mut out = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                out.push((eval(k, env, stdlib)?, eval(v, env, stdlib)?));
            }
            let key = rw_lang::types::unify(
                &out.iter().map(|(k, _)| k.wdl_type()).collect::<Vec<_>>(),
            )
            .unwrap_or_else(Type::any);
            let value = rw_lang::types::unify(
                &out.iter().map(|(_, v)| v.wdl_type()).collect::<Vec<_>>(),
            )
            .unwrap_or_else(Type::any);
            Ok(Value::Map {
                key,
                value,
                entries: out,
            })
        }
        ExprKind::Pair(l, r) => Ok(Value::Pair(
            Box::new(eval(l, env, stdlib)?),
            Box::new(eval(r, env, stdlib)?),
        )),
        ExprKind::Object { type_name, members } => {
            let mut out = Vec::with_capacity(members.len());
            for (n, e) in members {
                out.push((n.clone(), eval(e, env, stdlib)?));
            }
            Ok(Value::Struct {
                type_name: type_name.clone(),
                members: out,
            })
        }
        ExprKind::Index { expr: base, index } => {
            let base_v = eval(base, env, stdlib)?;
            let index_v = eval(index, env, stdlib)?;
            eval_index(&base_v, &index_v)
        }
        ExprKind::Member { expr: base, name } => {
            // `call.output` and namespaced names resolve through the
            // environment before value-level member access applies.
            if let Some(path) = dotted_path(expr) {
                if let Some(Binding::Value(v)) = env.lookup(&path) {
                    return Ok(v.clone());
                }
            }
            let base_v = eval(base, env, stdlib)?;
            eval_member(&base_v, name)
        }
        ExprKind::Unary { op, operand } => {
            let v = eval(operand, env, stdlib)?;
            match op {
                UnaryOp::Not => Ok(Value::Boolean(!v.as_bool()?)),
                UnaryOp::Neg => match v {
                    Value::Int(i) => Ok(Value::Int(-i)),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    other => StructError::from(CoreReason::Eval)
                        .with_detail(format!("cannot negate {}", other.wdl_type()))
                        .err(),
                },
                _ => unreachable!("UnaryOp is non_exhaustive but all variants are handled"),
            }
        }
        ExprKind::Binary { op, left, right } => eval_binary(*op, left, right, env, stdlib),
        ExprKind::Ternary { cond, then, els } => {
            if eval(cond, env, stdlib)?.as_bool()? {
                eval(then, env, stdlib)
            } else {
                eval(els, env, stdlib)
            }
        }
        ExprKind::Apply { name, args } => {
            let values: CoreResult<Vec<Value>> =
                args.iter().map(|a| eval(a, env, stdlib)).collect();
            stdlib.call(name, values?)
        }
        _ => unreachable!("ExprKind is non_exhaustive but all variants are handled"),
    }
}

/// Flatten a pure `Member` chain rooted at an identifier into a dotted
/// name (`ns.call.out`).
fn dotted_path(expr: &Expr) -> Option<String> {
    match &expr.kind {
        ExprKind::Ident(name) => Some(name.clone()),
        ExprKind::Member { expr: base, name } => {
            let mut path = dotted_path(base)?;
            path.push('.');
            path.push_str(name);
            Some(path)
        }
        _ => None,
    }
}

fn eval_index(base: &Value, index: &Value) -> CoreResult<Value> {
    match base {
        Value::Array { items, .. } => {
            let i = index.as_int()?;
            if i < 0 || i as usize >= items.len() {
                return StructError::from(CoreReason::Eval)
                    .with_detail(format!(
                        "array index {i} out of bounds (length {})",
                        items.len()
                    ))
                    .err();
            }
            Ok(items[i as usize].clone())
        }
        Value::Map { entries, .. } => {
            for (k, v) in entries {
                if values_equal(k, index) {
                    return Ok(v.clone());
                }
            }
            StructError::from(CoreReason::Eval)
                .with_detail(format!("map has no key {}", index.display_string()?))
                .err()
        }
        other => StructError::from(CoreReason::Eval)
            .with_detail(format!("cannot index into {}", other.wdl_type()))
            .err(),
    }
}

fn eval_member(base: &Value, name: &str) -> CoreResult<Value> {
    match base {
        Value::Pair(l, r) => match name {
            "left" => Ok((**l).clone()),
            "right" => Ok((**r).clone()),
            _ => StructError::from(CoreReason::Eval)
                .with_detail(format!("Pair has no member `{name}`"))
                .err(),
        },
        Value::Struct { members, .. } => members
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| {
                StructError::from(CoreReason::Eval)
                    .with_detail(format!("no member `{name}`"))
            }),
        other => StructError::from(CoreReason::Eval)
            .with_detail(format!("{} has no members", other.wdl_type()))
            .err(),
    }
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

fn eval_binary(
    op: BinOp,
    left: &Expr,
    right: &Expr,
    env: &Env,
    stdlib: &Stdlib,
) -> CoreResult<Value> {
    // Short-circuit logic first.
    match op {
        BinOp::And => {
            if !eval(left, env, stdlib)?.as_bool()? {
                return Ok(Value::Boolean(false));
            }
            return Ok(Value::Boolean(eval(right, env, stdlib)?.as_bool()?));
        }
        BinOp::Or => {
            if eval(left, env, stdlib)?.as_bool()? {
                return Ok(Value::Boolean(true));
            }
            return Ok(Value::Boolean(eval(right, env, stdlib)?.as_bool()?));
        }
        _ => {}
    }

    let lv = eval(left, env, stdlib)?;
    let rv = eval(right, env, stdlib)?;

    match op {
        BinOp::Eq => Ok(Value::Boolean(values_equal(&lv, &rv))),
        BinOp::Ne => Ok(Value::Boolean(!values_equal(&lv, &rv))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => compare(op, &lv, &rv),
        BinOp::Add => add(&lv, &rv),
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => arith(op, &lv, &rv),
        BinOp::And | BinOp::Or => unreachable!("handled above"),
        _ => unreachable!("BinOp is non_exhaustive but all variants are handled"),
    }
}

/// Equality with numeric promotion; File handles compare by virtualized
/// path.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => *x as f64 == *y,
        _ => a == b,
    }
}

fn compare(op: BinOp, lv: &Value, rv: &Value) -> CoreResult<Value> {
    use std::cmp::Ordering;
    let ord = match (lv, rv) {
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
        _ => {
            let (a, b) = (lv.as_float()?, rv.as_float()?);
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
    };
    let out = match op {
        BinOp::Lt => ord == Ordering::Less,
        BinOp::Le => ord != Ordering::Greater,
        BinOp::Gt => ord == Ordering::Greater,
        BinOp::Ge => ord != Ordering::Less,
        _ => unreachable!(),
    };
    Ok(Value::Boolean(out))
}

fn add(lv: &Value, rv: &Value) -> CoreResult<Value> {
    // String concatenation absorbs the other side.
    if matches!(lv, Value::String(_)) || matches!(rv, Value::String(_)) {
        return Ok(Value::String(format!(
            "{}{}",
            lv.display_string()?,
            rv.display_string()?
        )));
    }
    arith(BinOp::Add, lv, rv)
}

fn arith(op: BinOp, lv: &Value, rv: &Value) -> CoreResult<Value> {
    if let (Value::Int(a), Value::Int(b)) = (lv, rv) {
        let (a, b) = (*a, *b);
        let out = match op {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div => {
                if b == 0 {
                    return div_by_zero();
                }
                floor_div(a, b)
            }
            BinOp::Rem => {
                if b == 0 {
                    return div_by_zero();
                }
                floor_mod(a, b)
            }
            _ => unreachable!(),
        };
        return Ok(Value::Int(out));
    }

    let (a, b) = (lv.as_float()?, rv.as_float()?);
    let out = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return div_by_zero();
            }
            a / b
        }
        BinOp::Rem => {
            if b == 0.0 {
                return div_by_zero();
            }
            a % b
        }
        _ => unreachable!(),
    };
    Ok(Value::Float(out))
}

fn div_by_zero<T>() -> CoreResult<T> {
    StructError::from(CoreReason::Eval)
        .with_detail("division by zero")
        .err()
}

/// Floor division, matching the reference semantics for negatives.
fn floor_div(a: i64, b: i64) -> i64 {
    let q = a / b;
    let r = a % b;
    if r != 0 && (r < 0) != (b < 0) { q - 1 } else { q }
}

fn floor_mod(a: i64, b: i64) -> i64 {
    let r = a % b;
    if r != 0 && (r < 0) != (b < 0) { r + b } else { r }
}

// ---------------------------------------------------------------------------
// Placeholders and command interpolation
// ---------------------------------------------------------------------------

/// Render one `~{...}` placeholder: evaluate, then apply `sep=`,
/// `default=`, and `true=`/`false=` options.
pub fn eval_placeholder(ph: &Placeholder, env: &Env, stdlib: &Stdlib) -> CoreResult<String> {
    let value = eval(&ph.expr, env, stdlib)?;

    if value.is_null() {
        for opt in &ph.options {
            if let PlaceholderOption::Default(d) = opt {
                return Ok(d.clone());
            }
        }
        return Ok(String::new());
    }

    if let Value::Boolean(b) = value {
        for opt in &ph.options {
            if let PlaceholderOption::TrueFalse(t, f) = opt {
                return Ok(if b { t.clone() } else { f.clone() });
            }
        }
    }

    if let Value::Array { ref items, .. } = value {
        let sep = ph.options.iter().find_map(|o| match o {
            PlaceholderOption::Sep(s) => Some(s.as_str()),
            _ => None,
        });
        let Some(sep) = sep else {
            return StructError::from(CoreReason::Eval)
                .with_detail("array placeholder requires a `sep=` option")
                .err();
        };
        let rendered: CoreResult<Vec<String>> =
            items.iter().map(Value::display_string).collect();
        return Ok(rendered?.join(sep));
    }

    value.display_string()
}

/// Assemble a task command from its template. When a placeholder guard
/// regex is configured, every interpolated value must match it; a
/// mismatch aborts with a command error (the template-injection guard).
pub fn interpolate_command(
    parts: &[CommandPart],
    env: &Env,
    stdlib: &Stdlib,
    placeholder_guard: Option<&regex::Regex>,
) -> CoreResult<String> {
    let mut out = String::new();
    for part in parts {
        match part {
            CommandPart::Literal(s) => out.push_str(s),
            CommandPart::Placeholder(ph) => {
                let rendered = eval_placeholder(ph, env, stdlib)?;
                if let Some(guard) = placeholder_guard {
                    if !guard.is_match(&rendered) {
                        return StructError::from(CoreReason::Command)
                            .with_detail(format!(
                                "interpolated value {rendered:?} rejected by the placeholder guard"
                            ))
                            .err();
                    }
                }
                out.push_str(&rendered);
            }
            _ => unreachable!("CommandPart is non_exhaustive but all variants are handled"),
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rw_lang::ast::Span;

    fn stdlib() -> Stdlib {
        Stdlib::pure_only()
    }

    fn parse_expr(text: &str) -> Expr {
        // Ride the declaration grammar to get a bare expression.
        let src = format!("version 1.0\nworkflow w {{\n  Int x = {text}\n}}\n");
        let doc = rw_lang::parse_document(&src, "eval-test.wdl").unwrap();
        let wf = doc.workflow.unwrap();
        match wf.body.into_iter().next().unwrap() {
            rw_lang::ast::WorkflowNode::Decl(d) => d.expr.unwrap(),
            _ => unreachable!(),
        }
    }

    fn eval_str(text: &str, env: &Env) -> CoreResult<Value> {
        eval(&parse_expr(text), env, &stdlib())
    }

    #[test]
    fn arithmetic_and_promotion() {
        let env = Env::new();
        assert_eq!(eval_str("1 + 2 * 3", &env).unwrap(), Value::Int(7));
        assert_eq!(eval_str("1 + 0.5", &env).unwrap(), Value::Float(1.5));
        assert_eq!(eval_str("7 / 2", &env).unwrap(), Value::Int(3));
        assert_eq!(eval_str("-7 / 2", &env).unwrap(), Value::Int(-4));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let env = Env::new();
        assert!(eval_str("1 / 0", &env).is_err());
        assert!(eval_str("1 % 0", &env).is_err());
    }

    #[test]
    fn short_circuit_avoids_rhs() {
        // The right side would fail on an unbound name; && must not reach it.
        let env = Env::new().bind("ok", Value::Boolean(false));
        assert_eq!(
            eval_str("ok && missing", &env).unwrap(),
            Value::Boolean(false)
        );
    }

    #[test]
    fn ternary_selects_branch() {
        let env = Env::new().bind("go", Value::Boolean(true));
        assert_eq!(eval_str("if go then 1 else 2", &env).unwrap(), Value::Int(1));
    }

    #[test]
    fn string_interpolation() {
        let env = Env::new().bind("who", Value::String("Alyssa".into()));
        assert_eq!(
            eval_str("\"Hello, ~{who}!\"", &env).unwrap(),
            Value::String("Hello, Alyssa!".into())
        );
    }

    #[test]
    fn namespace_member_lookup() {
        let outputs = Env::new().bind("out", Value::Int(9));
        let env = Env::new().bind_namespace("t", outputs);
        assert_eq!(eval_str("t.out", &env).unwrap(), Value::Int(9));
    }

    #[test]
    fn indexing() {
        let env = Env::new().bind(
            "xs",
            Value::array_of(Type::int(), vec![Value::Int(10), Value::Int(20)]),
        );
        assert_eq!(eval_str("xs[1]", &env).unwrap(), Value::Int(20));
        assert!(eval_str("xs[5]", &env).is_err());
    }

    #[test]
    fn unbound_identifier_is_an_eval_error() {
        assert!(eval_str("nope", &Env::new()).is_err());
    }

    #[test]
    fn placeholder_options_apply() {
        let stdlib = stdlib();
        let env = Env::new()
            .bind(
                "xs",
                Value::array_of(
                    Type::string(),
                    vec![Value::String("a".into()), Value::String("b".into())],
                ),
            )
            .bind("flag", Value::Boolean(true))
            .bind("n", Value::Null(Type::int()));

        let ph = |text: &str| -> Placeholder {
            let e = parse_expr(text);
            match e.kind {
                ExprKind::String(parts) => parts
                    .into_iter()
                    .find_map(|p| match p {
                        StringPart::Placeholder(ph) => Some(ph),
                        _ => None,
                    })
                    .unwrap(),
                _ => panic!("expected string"),
            }
        };

        let sep = ph("\"~{sep=\",\" xs}\"");
        assert_eq!(eval_placeholder(&sep, &env, &stdlib).unwrap(), "a,b");

        let tf = ph("\"~{true=\"yes\" false=\"no\" flag}\"");
        assert_eq!(eval_placeholder(&tf, &env, &stdlib).unwrap(), "yes");

        let def = ph("\"~{default=\"42\" n}\"");
        assert_eq!(eval_placeholder(&def, &env, &stdlib).unwrap(), "42");
    }

    #[test]
    fn command_guard_rejects_mismatches() {
        let env = Env::new().bind("arg", Value::String("good; rm -rf /".into()));
        let guard = regex::Regex::new(r"^[\w./-]*$").unwrap();
        let e = parse_expr("\"~{arg}\"");
        let ExprKind::String(parts) = e.kind else { panic!() };
        let ph = parts
            .into_iter()
            .find_map(|p| match p {
                StringPart::Placeholder(ph) => Some(ph),
                _ => None,
            })
            .unwrap();
        let parts = vec![
            CommandPart::Literal("echo ".into()),
            CommandPart::Placeholder(ph.clone()),
        ];
        let err = interpolate_command(&parts, &env, &stdlib(), Some(&guard)).unwrap_err();
        assert!(err.to_string().contains("placeholder guard"), "{err}");
    }
}
