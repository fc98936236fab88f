use winnow::combinator::{alt, opt};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::prelude::*;
use winnow::stream::Location;
use winnow::token::{any, literal};

use crate::ast::{CommandPart, CommandTemplate, Span, WdlVersion};
use crate::parse_utils::{In, ws_skip};

use super::expr::placeholder_after_open;

// ---------------------------------------------------------------------------
// Command blocks
// ---------------------------------------------------------------------------

/// Parse the body after the `command` keyword: either the `<<< ... >>>`
/// heredoc form or the legacy `{ ... }` brace form. The raw text between
/// placeholders is kept verbatim except for un-indent normalization.
pub(crate) fn command_block<'a>(
    version: WdlVersion,
) -> impl FnMut(&mut In<'a>) -> ModalResult<CommandTemplate> {
    move |input: &mut In<'a>| {
        ws_skip.parse_next(input)?;
        let start = input.current_token_start();
        let parts = if opt(literal("<<<")).parse_next(input)?.is_some() {
            heredoc_parts.parse_next(input)?
        } else if opt(literal("{")).parse_next(input)?.is_some() {
            brace_parts(input, version)?
        } else {
            return Err(ErrMode::Cut(ContextError::new()));
        };
        let end = input.previous_token_end();
        Ok(CommandTemplate {
            span: Span { start, end },
            parts: normalize(parts),
        })
    }
}

/// Heredoc form: text until `>>>`, placeholders open with `~{` only.
fn heredoc_parts(input: &mut In<'_>) -> ModalResult<Vec<CommandPart>> {
    let mut parts = Vec::new();
    let mut lit = String::new();
    loop {
        if opt(literal(">>>")).parse_next(input)?.is_some() {
            break;
        }
        if opt(literal("~{")).parse_next(input)?.is_some() {
            flush(&mut parts, &mut lit);
            let ph = placeholder_after_open.parse_next(input)?;
            parts.push(CommandPart::Placeholder(ph));
            continue;
        }
        let c = any
            .context(StrContext::Expected(StrContextValue::Description(
                "'>>>' terminating command",
            )))
            .parse_next(input)?;
        lit.push(c);
    }
    flush(&mut parts, &mut lit);
    Ok(parts)
}

/// Brace form: text until the matching `}` (nested braces counted), with
/// `~{` placeholders, plus `${` in draft-2 documents.
fn brace_parts(input: &mut In<'_>, version: WdlVersion) -> ModalResult<Vec<CommandPart>> {
    let mut parts = Vec::new();
    let mut lit = String::new();
    let mut depth: u32 = 1;
    loop {
        let open: ModalResult<&str> = if version.dollar_placeholders() {
            alt((literal("~{"), literal("${"))).parse_next(input)
        } else {
            literal("~{").parse_next(input)
        };
        if open.is_ok() {
            flush(&mut parts, &mut lit);
            let ph = placeholder_after_open.parse_next(input)?;
            parts.push(CommandPart::Placeholder(ph));
            continue;
        }
        let c = any
            .context(StrContext::Expected(StrContextValue::Description(
                "'}' terminating command",
            )))
            .parse_next(input)?;
        match c {
            '{' => {
                depth += 1;
                lit.push(c);
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
                lit.push(c);
            }
            c => lit.push(c),
        }
    }
    flush(&mut parts, &mut lit);
    Ok(parts)
}

fn flush(parts: &mut Vec<CommandPart>, lit: &mut String) {
    if !lit.is_empty() {
        parts.push(CommandPart::Literal(std::mem::take(lit)));
    }
}

// ---------------------------------------------------------------------------
// Un-indent normalization
// ---------------------------------------------------------------------------

/// Normalize a command body: drop the leading blank line after the opening
/// delimiter, trim trailing whitespace before the closing delimiter, and
/// strip the longest common leading-whitespace prefix of non-empty lines.
/// A `\` immediately before a newline continues the line, so the newline
/// neither starts a new line for prefix computation nor gets stripped.
pub(crate) fn normalize(parts: Vec<CommandPart>) -> Vec<CommandPart> {
    let parts = trim_edges(parts);
    let prefix = common_indent(&parts);
    if prefix.is_empty() {
        return parts;
    }
    strip_indent(parts, &prefix)
}

fn trim_edges(mut parts: Vec<CommandPart>) -> Vec<CommandPart> {
    // Leading: drop spaces/tabs up to and including the first newline.
    if let Some(CommandPart::Literal(first)) = parts.first_mut() {
        let head: String = first.chars().take_while(|c| *c == ' ' || *c == '\t').collect();
        if first[head.len()..].starts_with('\n') {
            first.drain(..head.len() + 1);
        }
    }
    // Trailing: drop whitespace after the final newline.
    if let Some(CommandPart::Literal(last)) = parts.last_mut() {
        if let Some(idx) = last.rfind('\n') {
            if last[idx + 1..].chars().all(|c| c == ' ' || c == '\t') {
                last.truncate(idx + 1);
            }
        }
    }
    parts.retain(|p| !matches!(p, CommandPart::Literal(s) if s.is_empty()));
    parts
}

/// Longest common leading-whitespace prefix across non-empty lines. A line
/// containing a placeholder counts as non-empty; whitespace-only lines are
/// ignored.
fn common_indent(parts: &[CommandPart]) -> String {
    let mut prefix: Option<String> = None;
    let mut line_indent = String::new();
    let mut in_leading = true;
    let mut has_content = false;
    let mut prev_backslash = false;

    let mut close_line = |indent: &mut String, has_content: &mut bool, in_leading: &mut bool,
                          prefix: &mut Option<String>| {
        if *has_content {
            let candidate = std::mem::take(indent);
            *prefix = Some(match prefix.take() {
                None => candidate,
                Some(p) => common_prefix(&p, &candidate),
            });
        } else {
            indent.clear();
        }
        *has_content = false;
        *in_leading = true;
    };

    for part in parts {
        match part {
            CommandPart::Placeholder(_) => {
                in_leading = false;
                has_content = true;
                prev_backslash = false;
            }
            CommandPart::Literal(text) => {
                for c in text.chars() {
                    match c {
                        '\n' if prev_backslash => {
                            // Line continuation: not a line boundary.
                            prev_backslash = false;
                        }
                        '\n' => {
                            close_line(&mut line_indent, &mut has_content, &mut in_leading, &mut prefix);
                        }
                        ' ' | '\t' if in_leading => {
                            line_indent.push(c);
                            prev_backslash = false;
                        }
                        c => {
                            in_leading = false;
                            has_content = true;
                            prev_backslash = c == '\\';
                        }
                    }
                }
            }
        }
    }
    close_line(&mut line_indent, &mut has_content, &mut in_leading, &mut prefix);
    prefix.unwrap_or_default()
}

fn common_prefix(a: &str, b: &str) -> String {
    a.chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x)
        .collect()
}

/// Strip `prefix` (or the matching portion of it, on short whitespace-only
/// lines) at each line start inside literal parts.
fn strip_indent(parts: Vec<CommandPart>, prefix: &str) -> Vec<CommandPart> {
    let mut out = Vec::with_capacity(parts.len());
    let mut at_line_start = true;
    let mut to_skip = 0usize;
    let mut prev_backslash = false;

    for part in parts {
        match part {
            CommandPart::Placeholder(ph) => {
                at_line_start = false;
                to_skip = 0;
                prev_backslash = false;
                out.push(CommandPart::Placeholder(ph));
            }
            CommandPart::Literal(text) => {
                let mut stripped = String::with_capacity(text.len());
                for c in text.chars() {
                    if at_line_start && to_skip < prefix.len() {
                        let expected = prefix[to_skip..].chars().next().unwrap();
                        if c == expected {
                            to_skip += expected.len_utf8();
                            continue;
                        }
                        at_line_start = false;
                        to_skip = 0;
                    }
                    match c {
                        '\n' if prev_backslash => {
                            prev_backslash = false;
                            stripped.push(c);
                        }
                        '\n' => {
                            at_line_start = true;
                            to_skip = 0;
                            stripped.push(c);
                        }
                        c => {
                            at_line_start = false;
                            to_skip = 0;
                            prev_backslash = c == '\\';
                            stripped.push(c);
                        }
                    }
                }
                out.push(CommandPart::Literal(stripped));
            }
        }
    }
    out
}
