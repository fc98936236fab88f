use winnow::combinator::{cut_err, opt};
use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;
use winnow::stream::{Location, Stream};
use winnow::token::literal;

use crate::ast::{CommandTemplate, Decl, Expr, MetaValue, Span, Task, WdlVersion};
use crate::parse_utils::{In, ident, kw, tok, ws_skip};

use super::command::command_block;
use super::expr::expr;
use super::meta_value;
use super::ty::type_expr;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

pub(crate) fn task<'a>(version: WdlVersion) -> impl FnMut(&mut In<'a>) -> ModalResult<Task> {
    move |input: &mut In<'a>| {
        let start = input.current_token_start();
        kw("task")(input)?;
        ws_skip.parse_next(input)?;
        let name = cut_err(ident).parse_next(input)?.to_string();
        tok("{")(input)?;

        let mut inputs: Vec<Decl> = Vec::new();
        let mut postinputs: Vec<Decl> = Vec::new();
        let mut command: Option<CommandTemplate> = None;
        let mut outputs: Vec<Decl> = Vec::new();
        let mut runtime: Vec<(String, Expr)> = Vec::new();
        let mut meta: Vec<(String, MetaValue)> = Vec::new();
        let mut parameter_meta: Vec<(String, MetaValue)> = Vec::new();
        let mut hints: Vec<(String, Expr)> = Vec::new();

        loop {
            ws_skip.parse_next(input)?;
            if opt(literal("}")).parse_next(input)?.is_some() {
                break;
            }
            if opt(kw("input")).parse_next(input)?.is_some() {
                tok("{")(input)?;
                decl_block(input, &mut inputs)?;
                continue;
            }
            if opt(kw("command")).parse_next(input)?.is_some() {
                command = Some(command_block(version)(input)?);
                continue;
            }
            if opt(kw("output")).parse_next(input)?.is_some() {
                tok("{")(input)?;
                decl_block(input, &mut outputs)?;
                continue;
            }
            if opt(kw("runtime")).parse_next(input)?.is_some() {
                tok("{")(input)?;
                expr_block(input, &mut runtime)?;
                continue;
            }
            if opt(kw("hints")).parse_next(input)?.is_some() {
                tok("{")(input)?;
                expr_block(input, &mut hints)?;
                continue;
            }
            if opt(kw("meta")).parse_next(input)?.is_some() {
                tok("{")(input)?;
                meta_block(input, &mut meta)?;
                continue;
            }
            if opt(kw("parameter_meta")).parse_next(input)?.is_some() {
                tok("{")(input)?;
                meta_block(input, &mut parameter_meta)?;
                continue;
            }
            // Bare declaration. In draft-2 these are caller-overridable
            // inputs; from 1.0 on they are private post-input values.
            if let Some(d) = opt(decl).parse_next(input)? {
                if version == WdlVersion::Draft2 && command.is_none() {
                    inputs.push(d);
                } else {
                    postinputs.push(d);
                }
                continue;
            }
            return Err(ErrMode::Cut(ContextError::new()));
        }

        let end = input.previous_token_end();
        let command = command.ok_or_else(|| ErrMode::Cut(ContextError::new()))?;
        Ok(Task {
            span: Span { start, end },
            name,
            inputs,
            postinputs,
            command,
            outputs,
            runtime,
            meta,
            parameter_meta,
            hints,
        })
    }
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// `[env] TYPE NAME [= EXPR]`
pub(crate) fn decl(input: &mut In<'_>) -> ModalResult<Decl> {
    let start = input.current_token_start();
    let env = opt(kw("env")).parse_next(input)?.is_some();
    if env {
        ws_skip.parse_next(input)?;
    }
    let ty = type_expr.parse_next(input)?;
    ws_skip.parse_next(input)?;
    let name = ident.parse_next(input)?.to_string();

    let mark = input.checkpoint();
    ws_skip.parse_next(input)?;
    let init = if opt(literal("=")).parse_next(input)?.is_some() {
        Some(cut_err(expr).parse_next(input)?)
    } else {
        input.reset(&mark);
        None
    };

    let end = input.previous_token_end();
    Ok(Decl {
        span: Span { start, end },
        name,
        ty,
        expr: init,
        env,
    })
}

/// Declarations until the closing `}` (already inside the block).
pub(crate) fn decl_block(input: &mut In<'_>, out: &mut Vec<Decl>) -> ModalResult<()> {
    loop {
        ws_skip.parse_next(input)?;
        if opt(literal("}")).parse_next(input)?.is_some() {
            return Ok(());
        }
        let d = cut_err(decl).parse_next(input)?;
        out.push(d);
    }
}

/// `key: expr` entries until `}` — runtime and hints sections. Entries are
/// newline-separated; a trailing comma is tolerated.
fn expr_block(input: &mut In<'_>, out: &mut Vec<(String, Expr)>) -> ModalResult<()> {
    loop {
        ws_skip.parse_next(input)?;
        if opt(literal("}")).parse_next(input)?.is_some() {
            return Ok(());
        }
        let key = cut_err(ident).parse_next(input)?.to_string();
        tok(":")(input)?;
        let value = cut_err(expr).parse_next(input)?;
        out.push((key, value));
        ws_skip.parse_next(input)?;
        let _ = opt(literal(",")).parse_next(input)?;
    }
}

/// `key: meta_value` entries until `}`.
fn meta_block(input: &mut In<'_>, out: &mut Vec<(String, MetaValue)>) -> ModalResult<()> {
    loop {
        ws_skip.parse_next(input)?;
        if opt(literal("}")).parse_next(input)?.is_some() {
            return Ok(());
        }
        let key = cut_err(ident).parse_next(input)?.to_string();
        tok(":")(input)?;
        let value = cut_err(meta_value).parse_next(input)?;
        out.push((key, value));
        ws_skip.parse_next(input)?;
        let _ = opt(literal(",")).parse_next(input)?;
    }
}
