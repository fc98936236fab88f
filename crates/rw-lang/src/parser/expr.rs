use winnow::combinator::{alt, cut_err, opt, peek};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::prelude::*;
use winnow::stream::{Location, Stream};
use winnow::token::{any, literal};

use crate::ast::{
    BinOp, Expr, ExprKind, Placeholder, PlaceholderOption, Span, StringPart, UnaryOp,
};
use crate::parse_utils::{In, Number, ident, kw, number, plain_string, unescape, ws_skip};

// ---------------------------------------------------------------------------
// Entry point — precedence ladder
// ---------------------------------------------------------------------------

/// Parse a WDL expression. Precedence, loosest first:
/// ternary, `||`, `&&`, equality, relational, additive, multiplicative,
/// unary, postfix (index / member access), primary.
pub(crate) fn expr(input: &mut In<'_>) -> ModalResult<Expr> {
    ws_skip.parse_next(input)?;
    ternary.parse_next(input)
}

fn ternary(input: &mut In<'_>) -> ModalResult<Expr> {
    let start = input.current_token_start();
    if opt(kw("if")).parse_next(input)?.is_some() {
        let cond = cut_err(expr).parse_next(input)?;
        ws_skip.parse_next(input)?;
        cut_err(kw("then"))
            .context(StrContext::Expected(StrContextValue::Description(
                "'then' in conditional expression",
            )))
            .parse_next(input)?;
        let then = cut_err(expr).parse_next(input)?;
        ws_skip.parse_next(input)?;
        cut_err(kw("else"))
            .context(StrContext::Expected(StrContextValue::Description(
                "'else' in conditional expression",
            )))
            .parse_next(input)?;
        let els = cut_err(expr).parse_next(input)?;
        let end = els.span.end;
        return Ok(Expr::new(
            Span { start, end },
            ExprKind::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                els: Box::new(els),
            },
        ));
    }
    or_expr.parse_next(input)
}

fn or_expr(input: &mut In<'_>) -> ModalResult<Expr> {
    bin_chain(input, &[("||", BinOp::Or)], and_expr)
}

fn and_expr(input: &mut In<'_>) -> ModalResult<Expr> {
    bin_chain(input, &[("&&", BinOp::And)], eq_expr)
}

fn eq_expr(input: &mut In<'_>) -> ModalResult<Expr> {
    bin_chain(input, &[("==", BinOp::Eq), ("!=", BinOp::Ne)], rel_expr)
}

fn rel_expr(input: &mut In<'_>) -> ModalResult<Expr> {
    bin_chain(
        input,
        &[
            ("<=", BinOp::Le),
            (">=", BinOp::Ge),
            ("<", BinOp::Lt),
            (">", BinOp::Gt),
        ],
        add_expr,
    )
}

fn add_expr(input: &mut In<'_>) -> ModalResult<Expr> {
    bin_chain(input, &[("+", BinOp::Add), ("-", BinOp::Sub)], mul_expr)
}

fn mul_expr(input: &mut In<'_>) -> ModalResult<Expr> {
    bin_chain(
        input,
        &[("*", BinOp::Mul), ("/", BinOp::Div), ("%", BinOp::Rem)],
        unary_expr,
    )
}

/// Left-associative binary operator chain over `next`.
fn bin_chain(
    input: &mut In<'_>,
    ops: &[(&'static str, BinOp)],
    mut next: impl FnMut(&mut In<'_>) -> ModalResult<Expr>,
) -> ModalResult<Expr> {
    let mut left = next(input)?;
    'outer: loop {
        let start = input.checkpoint();
        ws_skip.parse_next(input)?;
        for (sym, op) in ops {
            if opt(literal(*sym)).parse_next(input)?.is_some() {
                ws_skip.parse_next(input)?;
                let right = cut_err(&mut next).parse_next(input)?;
                let span = Span {
                    start: left.span.start,
                    end: right.span.end,
                };
                left = Expr::new(
                    span,
                    ExprKind::Binary {
                        op: *op,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                );
                continue 'outer;
            }
        }
        input.reset(&start);
        break;
    }
    Ok(left)
}

fn unary_expr(input: &mut In<'_>) -> ModalResult<Expr> {
    ws_skip.parse_next(input)?;
    let start = input.current_token_start();
    if opt(literal("!")).parse_next(input)?.is_some() {
        let operand = cut_err(unary_expr).parse_next(input)?;
        let span = Span {
            start,
            end: operand.span.end,
        };
        return Ok(Expr::new(
            span,
            ExprKind::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            },
        ));
    }
    if opt(literal("-")).parse_next(input)?.is_some() {
        let operand = cut_err(unary_expr).parse_next(input)?;
        let span = Span {
            start,
            end: operand.span.end,
        };
        return Ok(Expr::new(
            span,
            ExprKind::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            },
        ));
    }
    postfix_expr.parse_next(input)
}

// ---------------------------------------------------------------------------
// Postfix: indexing and member access
// ---------------------------------------------------------------------------

fn postfix_expr(input: &mut In<'_>) -> ModalResult<Expr> {
    let mut base = primary.parse_next(input)?;
    loop {
        // Postfix operators bind tightly: no whitespace skipping before `.`
        // would be too strict (WDL allows it), so skip but backtrack fully.
        let start = input.checkpoint();
        ws_skip.parse_next(input)?;
        if opt(literal("[")).parse_next(input)?.is_some() {
            let index = cut_err(expr).parse_next(input)?;
            ws_skip.parse_next(input)?;
            cut_err(literal("]")).parse_next(input)?;
            let end = input.previous_token_end();
            base = Expr::new(
                Span {
                    start: base.span.start,
                    end,
                },
                ExprKind::Index {
                    expr: Box::new(base),
                    index: Box::new(index),
                },
            );
            continue;
        }
        if opt(literal(".")).parse_next(input)?.is_some() {
            match opt(ident).parse_next(input)? {
                Some(name) => {
                    let end = input.previous_token_end();
                    base = Expr::new(
                        Span {
                            start: base.span.start,
                            end,
                        },
                        ExprKind::Member {
                            expr: Box::new(base),
                            name: name.to_string(),
                        },
                    );
                    continue;
                }
                None => {
                    input.reset(&start);
                    break;
                }
            }
        }
        input.reset(&start);
        break;
    }
    Ok(base)
}

// ---------------------------------------------------------------------------
// Primary expressions
// ---------------------------------------------------------------------------

fn primary(input: &mut In<'_>) -> ModalResult<Expr> {
    ws_skip.parse_next(input)?;
    alt((
        paren_or_pair,
        array_literal,
        map_literal,
        string_literal,
        literal_kw("true", ExprKind::Boolean(true)),
        literal_kw("false", ExprKind::Boolean(false)),
        literal_kw("None", ExprKind::None),
        object_literal,
        number_literal,
        apply_or_ident,
    ))
    .parse_next(input)
}

fn literal_kw<'a>(
    keyword: &'static str,
    kind: ExprKind,
) -> impl FnMut(&mut In<'a>) -> ModalResult<Expr> {
    move |input: &mut In<'a>| {
        let ((), span) = kw(keyword).with_span().parse_next(input)?;
        Ok(Expr::new(Span::from(span), kind.clone()))
    }
}

fn number_literal(input: &mut In<'_>) -> ModalResult<Expr> {
    let (n, span) = number.with_span().parse_next(input)?;
    let kind = match n {
        Number::Int(i) => ExprKind::Int(i),
        Number::Float(f) => ExprKind::Float(f),
    };
    Ok(Expr::new(Span::from(span), kind))
}

/// `( expr )` grouping or `( left, right )` pair literal.
fn paren_or_pair(input: &mut In<'_>) -> ModalResult<Expr> {
    let start = input.current_token_start();
    literal("(").parse_next(input)?;
    let first = cut_err(expr).parse_next(input)?;
    ws_skip.parse_next(input)?;
    if opt(literal(",")).parse_next(input)?.is_some() {
        let second = cut_err(expr).parse_next(input)?;
        ws_skip.parse_next(input)?;
        cut_err(literal(")")).parse_next(input)?;
        let end = input.previous_token_end();
        return Ok(Expr::new(
            Span { start, end },
            ExprKind::Pair(Box::new(first), Box::new(second)),
        ));
    }
    cut_err(literal(")")).parse_next(input)?;
    Ok(first)
}

fn array_literal(input: &mut In<'_>) -> ModalResult<Expr> {
    let start = input.current_token_start();
    literal("[").parse_next(input)?;
    let mut items = Vec::new();
    loop {
        ws_skip.parse_next(input)?;
        if opt(literal("]")).parse_next(input)?.is_some() {
            break;
        }
        items.push(cut_err(expr).parse_next(input)?);
        ws_skip.parse_next(input)?;
        let _ = opt(literal(",")).parse_next(input)?;
    }
    let end = input.previous_token_end();
    Ok(Expr::new(Span { start, end }, ExprKind::Array(items)))
}

/// `{ key_expr: value_expr, ... }` map literal.
fn map_literal(input: &mut In<'_>) -> ModalResult<Expr> {
    let start = input.current_token_start();
    literal("{").parse_next(input)?;
    let mut entries = Vec::new();
    loop {
        ws_skip.parse_next(input)?;
        if opt(literal("}")).parse_next(input)?.is_some() {
            break;
        }
        let key = cut_err(expr).parse_next(input)?;
        ws_skip.parse_next(input)?;
        cut_err(literal(":")).parse_next(input)?;
        let value = cut_err(expr).parse_next(input)?;
        entries.push((key, value));
        ws_skip.parse_next(input)?;
        let _ = opt(literal(",")).parse_next(input)?;
    }
    let end = input.previous_token_end();
    Ok(Expr::new(Span { start, end }, ExprKind::Map(entries)))
}

/// `object { a: 1 }` or `StructName { a: 1 }`.
fn object_literal(input: &mut In<'_>) -> ModalResult<Expr> {
    let start = input.current_token_start();
    let type_name = if opt(kw("object")).parse_next(input)?.is_some() {
        None
    } else {
        let name = ident.parse_next(input)?.to_string();
        ws_skip.parse_next(input)?;
        // Only a literal when a brace follows; otherwise backtrack to ident.
        peek(literal("{")).parse_next(input)?;
        Some(name)
    };
    ws_skip.parse_next(input)?;
    literal("{").parse_next(input)?;

    let mut members = Vec::new();
    loop {
        ws_skip.parse_next(input)?;
        if opt(literal("}")).parse_next(input)?.is_some() {
            break;
        }
        let name = cut_err(ident).parse_next(input)?.to_string();
        ws_skip.parse_next(input)?;
        cut_err(literal(":")).parse_next(input)?;
        let value = cut_err(expr).parse_next(input)?;
        members.push((name, value));
        ws_skip.parse_next(input)?;
        let _ = opt(literal(",")).parse_next(input)?;
    }
    let end = input.previous_token_end();
    Ok(Expr::new(
        Span { start, end },
        ExprKind::Object { type_name, members },
    ))
}

fn apply_or_ident(input: &mut In<'_>) -> ModalResult<Expr> {
    let (name, span) = ident.with_span().parse_next(input)?;
    let start = span.start;

    let mark = input.checkpoint();
    ws_skip.parse_next(input)?;
    if opt(literal("(")).parse_next(input)?.is_some() {
        let mut args = Vec::new();
        loop {
            ws_skip.parse_next(input)?;
            if opt(literal(")")).parse_next(input)?.is_some() {
                break;
            }
            args.push(cut_err(expr).parse_next(input)?);
            ws_skip.parse_next(input)?;
            let _ = opt(literal(",")).parse_next(input)?;
        }
        let end = input.previous_token_end();
        return Ok(Expr::new(
            Span { start, end },
            ExprKind::Apply {
                name: name.to_string(),
                args,
            },
        ));
    }
    input.reset(&mark);
    Ok(Expr::new(
        Span::from(span),
        ExprKind::Ident(name.to_string()),
    ))
}

// ---------------------------------------------------------------------------
// String literals with interpolation
// ---------------------------------------------------------------------------

fn string_literal(input: &mut In<'_>) -> ModalResult<Expr> {
    let start = input.current_token_start();
    let quote = alt((literal("\""), literal("'"))).parse_next(input)?;
    let close = quote.chars().next().unwrap();

    let mut parts: Vec<StringPart> = Vec::new();
    let mut lit = String::new();
    loop {
        // Interpolation open?
        if opt(alt((literal("~{"), literal("${")))).parse_next(input)?.is_some() {
            if !lit.is_empty() {
                parts.push(StringPart::Literal(std::mem::take(&mut lit)));
            }
            let ph = placeholder_after_open.parse_next(input)?;
            parts.push(StringPart::Placeholder(ph));
            continue;
        }
        let c = any
            .context(StrContext::Expected(StrContextValue::Description(
                "closing quote",
            )))
            .parse_next(input)?;
        match c {
            '\\' => {
                let e = any.parse_next(input)?;
                lit.push(unescape(e));
            }
            c if c == close => break,
            c => lit.push(c),
        }
    }
    if !lit.is_empty() || parts.is_empty() {
        parts.push(StringPart::Literal(lit));
    }
    let end = input.previous_token_end();
    Ok(Expr::new(Span { start, end }, ExprKind::String(parts)))
}

// ---------------------------------------------------------------------------
// Placeholders — shared between strings and command templates
// ---------------------------------------------------------------------------

/// Parse the inside of a placeholder after the opening `~{` / `${`:
/// options, the expression, and the closing brace.
pub(crate) fn placeholder_after_open(input: &mut In<'_>) -> ModalResult<Placeholder> {
    let start = input.current_token_start();
    let raw_options = placeholder_options.parse_next(input)?;
    let inner = cut_err(expr).parse_next(input)?;
    ws_skip.parse_next(input)?;
    cut_err(literal("}"))
        .context(StrContext::Expected(StrContextValue::Description(
            "closing '}' of placeholder",
        )))
        .parse_next(input)?;
    let end = input.previous_token_end();

    let options = assemble_options(raw_options)?;
    Ok(Placeholder {
        span: Span { start, end },
        options,
        expr: Box::new(inner),
    })
}

fn placeholder_options(input: &mut In<'_>) -> ModalResult<Vec<(String, String)>> {
    let mut out = Vec::new();
    loop {
        let start = input.checkpoint();
        ws_skip.parse_next(input)?;
        let Some(key) = opt(ident).parse_next(input)? else {
            input.reset(&start);
            break;
        };
        if !matches!(key, "sep" | "default" | "true" | "false") {
            input.reset(&start);
            break;
        }
        ws_skip.parse_next(input)?;
        if opt(literal("=")).parse_next(input)?.is_none() {
            input.reset(&start);
            break;
        }
        ws_skip.parse_next(input)?;
        let value = cut_err(option_value).parse_next(input)?;
        out.push((key.to_string(), value));
    }
    Ok(out)
}

fn option_value(input: &mut In<'_>) -> ModalResult<String> {
    alt((
        plain_string,
        kw("true").map(|_| "true".to_string()),
        kw("false").map(|_| "false".to_string()),
        number.map(|n| match n {
            Number::Int(i) => i.to_string(),
            Number::Float(f) => f.to_string(),
        }),
    ))
    .parse_next(input)
}

fn assemble_options(raw: Vec<(String, String)>) -> Result<Vec<PlaceholderOption>, ErrMode<ContextError>> {
    let mut options = Vec::new();
    let mut true_val: Option<String> = None;
    let mut false_val: Option<String> = None;
    for (key, value) in raw {
        match key.as_str() {
            "sep" => options.push(PlaceholderOption::Sep(value)),
            "default" => options.push(PlaceholderOption::Default(value)),
            "true" => true_val = Some(value),
            "false" => false_val = Some(value),
            _ => unreachable!(),
        }
    }
    match (true_val, false_val) {
        (Some(t), Some(f)) => options.push(PlaceholderOption::TrueFalse(t, f)),
        (None, None) => {}
        // `true=` without `false=` (or vice versa) is malformed.
        _ => return Err(ErrMode::Cut(ContextError::new())),
    }
    Ok(options)
}
