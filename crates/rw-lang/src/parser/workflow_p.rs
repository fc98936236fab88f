use winnow::combinator::{cut_err, opt};
use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;
use winnow::stream::{Location, Stream};
use winnow::token::literal;

use crate::ast::{
    Call, Conditional, Decl, Expr, MetaValue, Scatter, Span, Workflow, WorkflowNode,
};
use crate::parse_utils::{In, ident, kw, tok, ws_skip};

use super::dotted_ident;
use super::expr::expr;
use super::meta_value;
use super::task_p::{decl, decl_block};

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

pub(crate) fn workflow(input: &mut In<'_>) -> ModalResult<Workflow> {
    let start = input.current_token_start();
    kw("workflow")(input)?;
    ws_skip.parse_next(input)?;
    let name = cut_err(ident).parse_next(input)?.to_string();
    tok("{")(input)?;

    let mut inputs: Vec<Decl> = Vec::new();
    let mut body: Vec<WorkflowNode> = Vec::new();
    let mut outputs: Option<Vec<Decl>> = None;
    let mut meta: Vec<(String, MetaValue)> = Vec::new();
    let mut parameter_meta: Vec<(String, MetaValue)> = Vec::new();

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
        if opt(kw("output")).parse_next(input)?.is_some() {
            tok("{")(input)?;
            let mut decls = Vec::new();
            decl_block(input, &mut decls)?;
            outputs = Some(decls);
            continue;
        }
        if opt(kw("meta")).parse_next(input)?.is_some() {
            tok("{")(input)?;
            wf_meta_block(input, &mut meta)?;
            continue;
        }
        if opt(kw("parameter_meta")).parse_next(input)?.is_some() {
            tok("{")(input)?;
            wf_meta_block(input, &mut parameter_meta)?;
            continue;
        }
        body.push(workflow_node.parse_next(input)?);
    }

    let end = input.previous_token_end();
    Ok(Workflow {
        span: Span { start, end },
        name,
        inputs,
        body,
        outputs,
        meta,
        parameter_meta,
    })
}

// ---------------------------------------------------------------------------
// Body nodes
// ---------------------------------------------------------------------------

pub(crate) fn workflow_node(input: &mut In<'_>) -> ModalResult<WorkflowNode> {
    ws_skip.parse_next(input)?;
    if let Some(c) = opt(call).parse_next(input)? {
        return Ok(WorkflowNode::Call(c));
    }
    if let Some(s) = opt(scatter).parse_next(input)? {
        return Ok(WorkflowNode::Scatter(s));
    }
    if let Some(c) = opt(conditional).parse_next(input)? {
        return Ok(WorkflowNode::Conditional(c));
    }
    if let Some(d) = opt(decl).parse_next(input)? {
        return Ok(WorkflowNode::Decl(d));
    }
    Err(ErrMode::Cut(ContextError::new()))
}

/// `call ns.task [as alias] [after other]* [{ [input:] k = v, ... }]`
fn call(input: &mut In<'_>) -> ModalResult<Call> {
    let start = input.current_token_start();
    kw("call")(input)?;
    ws_skip.parse_next(input)?;
    let callee = cut_err(dotted_ident).parse_next(input)?;

    ws_skip.parse_next(input)?;
    let alias = if opt(kw("as")).parse_next(input)?.is_some() {
        ws_skip.parse_next(input)?;
        Some(cut_err(ident).parse_next(input)?.to_string())
    } else {
        None
    };

    let mut afters = Vec::new();
    loop {
        ws_skip.parse_next(input)?;
        if opt(kw("after")).parse_next(input)?.is_none() {
            break;
        }
        ws_skip.parse_next(input)?;
        afters.push(cut_err(ident).parse_next(input)?.to_string());
    }

    let mut inputs: Vec<(String, Expr)> = Vec::new();
    let mark = input.checkpoint();
    ws_skip.parse_next(input)?;
    if opt(literal("{")).parse_next(input)?.is_some() {
        ws_skip.parse_next(input)?;
        // The `input:` prelude is required through 1.0, optional in 1.1.
        if opt(kw("input")).parse_next(input)?.is_some() {
            tok(":")(input)?;
        }
        loop {
            ws_skip.parse_next(input)?;
            if opt(literal("}")).parse_next(input)?.is_some() {
                break;
            }
            let name = cut_err(ident).parse_next(input)?.to_string();
            ws_skip.parse_next(input)?;
            // `k = expr` or bare `k` shorthand (binds the like-named value).
            let value = if opt(literal("=")).parse_next(input)?.is_some() {
                cut_err(expr).parse_next(input)?
            } else {
                Expr::new(
                    Span {
                        start: input.previous_token_end(),
                        end: input.previous_token_end(),
                    },
                    crate::ast::ExprKind::Ident(name.clone()),
                )
            };
            inputs.push((name, value));
            ws_skip.parse_next(input)?;
            let _ = opt(literal(",")).parse_next(input)?;
        }
    } else {
        input.reset(&mark);
    }

    let end = input.previous_token_end();
    Ok(Call {
        span: Span { start, end },
        callee,
        alias,
        inputs,
        afters,
    })
}

/// `scatter ( x in expr ) { body }`
fn scatter(input: &mut In<'_>) -> ModalResult<Scatter> {
    let start = input.current_token_start();
    kw("scatter")(input)?;
    tok("(")(input)?;
    ws_skip.parse_next(input)?;
    let variable = cut_err(ident).parse_next(input)?.to_string();
    ws_skip.parse_next(input)?;
    cut_err(kw("in")).parse_next(input)?;
    let collection = cut_err(expr).parse_next(input)?;
    tok(")")(input)?;
    tok("{")(input)?;

    let mut body = Vec::new();
    loop {
        ws_skip.parse_next(input)?;
        if opt(literal("}")).parse_next(input)?.is_some() {
            break;
        }
        body.push(workflow_node.parse_next(input)?);
    }
    let end = input.previous_token_end();
    Ok(Scatter {
        span: Span { start, end },
        variable,
        collection,
        body,
    })
}

/// `if ( expr ) { body }`
fn conditional(input: &mut In<'_>) -> ModalResult<Conditional> {
    let start = input.current_token_start();
    kw("if")(input)?;
    tok("(")(input)?;
    let predicate = cut_err(expr).parse_next(input)?;
    tok(")")(input)?;
    tok("{")(input)?;

    let mut body = Vec::new();
    loop {
        ws_skip.parse_next(input)?;
        if opt(literal("}")).parse_next(input)?.is_some() {
            break;
        }
        body.push(workflow_node.parse_next(input)?);
    }
    let end = input.previous_token_end();
    Ok(Conditional {
        span: Span { start, end },
        predicate,
        body,
    })
}

fn wf_meta_block(input: &mut In<'_>, out: &mut Vec<(String, MetaValue)>) -> ModalResult<()> {
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
