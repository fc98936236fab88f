use winnow::combinator::{alt, eof, opt, peek};
use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;
use winnow::stream::{LocatingSlice, Stream};
use winnow::token::take_while;

mod command;
mod expr;
mod task_p;
mod ty;
mod workflow_p;

#[cfg(test)]
mod tests;

use crate::ast::{Document, Import, LineIndex, Pos, Span, StructTypeDef, WdlVersion};
use crate::parse_utils::{In, ident, kw, plain_string, tok, ws_skip};
use crate::parser::ty::type_expr;

// ---------------------------------------------------------------------------
// SyntaxError
// ---------------------------------------------------------------------------

/// A lexical or grammatical failure, pinned to a source position.
#[derive(Debug, Clone)]
pub struct SyntaxError {
    pub pos: Pos,
    pub message: String,
}

impl std::fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: syntax error: {}", self.pos, self.message)
    }
}

impl std::error::Error for SyntaxError {}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Parse one WDL document. Imports are left unlinked (`Import.doc == None`);
/// use [`crate::checker::imports::load_document`] to parse and link a whole
/// import tree.
pub fn parse_document(source: &str, uri: &str) -> Result<Document, SyntaxError> {
    let (version, version_defaulted) = scan_version(source);

    let mut items = DocumentItems::default();
    let result = (|input: &mut In<'_>| document_items(input, version, &mut items))
        .parse(LocatingSlice::new(source));

    match result {
        Ok(()) => Ok(Document {
            uri: uri.to_string(),
            source: source.to_string(),
            version,
            version_defaulted,
            imports: items.imports,
            struct_typedefs: items.structs,
            tasks: items.tasks,
            workflow: items.workflow,
        }),
        Err(e) => {
            let offset = e.offset().min(source.len());
            let index = LineIndex::new(source);
            let (line, column) = index.line_col(offset);
            let message = {
                let m = e.inner().to_string();
                if m.is_empty() {
                    "unexpected input".to_string()
                } else {
                    m
                }
            };
            Err(SyntaxError {
                pos: Pos {
                    uri: uri.to_string(),
                    line,
                    column,
                    end_line: line,
                    end_column: column,
                },
                message,
            })
        }
    }
}

/// Pre-scan for the `version` statement so the grammar can gate on it
/// before the full parse. Missing statement defaults to draft-2.
fn scan_version(source: &str) -> (WdlVersion, bool) {
    for line in source.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("version") {
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                let token = rest.trim().split_whitespace().next().unwrap_or("");
                return (
                    WdlVersion::parse(token).unwrap_or(WdlVersion::Development),
                    false,
                );
            }
        }
        break;
    }
    (WdlVersion::Draft2, true)
}

// ---------------------------------------------------------------------------
// Document grammar
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DocumentItems {
    imports: Vec<Import>,
    structs: Vec<StructTypeDef>,
    tasks: Vec<crate::ast::Task>,
    workflow: Option<crate::ast::Workflow>,
}

fn document_items(
    input: &mut In<'_>,
    version: WdlVersion,
    items: &mut DocumentItems,
) -> ModalResult<()> {
    ws_skip.parse_next(input)?;
    let _ = opt(version_stmt).parse_next(input)?;

    loop {
        ws_skip.parse_next(input)?;
        if opt(peek(eof)).parse_next(input)?.is_some() {
            break;
        }
        if let Some(import) = opt(import_decl).parse_next(input)? {
            items.imports.push(import);
            continue;
        }
        if let Some(s) = opt(struct_def).parse_next(input)? {
            items.structs.push(s);
            continue;
        }
        if let Some(task) = opt(task_p::task(version)).parse_next(input)? {
            items.tasks.push(task);
            continue;
        }
        if let Some(wf) = opt(workflow_p::workflow).parse_next(input)? {
            if items.workflow.is_some() {
                // A document holds at most one workflow.
                return Err(ErrMode::Cut(ContextError::new()));
            }
            items.workflow = Some(wf);
            continue;
        }
        return Err(ErrMode::Cut(ContextError::new()));
    }
    Ok(())
}

fn version_stmt(input: &mut In<'_>) -> ModalResult<()> {
    kw("version")(input)?;
    ws_skip.parse_next(input)?;
    let _ = take_while(1.., |c: char| !c.is_whitespace()).parse_next(input)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// import declaration
// ---------------------------------------------------------------------------

fn import_decl(input: &mut In<'_>) -> ModalResult<Import> {
    let ((uri, explicit_namespace, aliases), span) = (|input: &mut In<'_>| {
        kw("import")(input)?;
        ws_skip.parse_next(input)?;
        let uri = winnow::combinator::cut_err(plain_string).parse_next(input)?;

        ws_skip.parse_next(input)?;
        let ns = if opt(kw("as")).parse_next(input)?.is_some() {
            ws_skip.parse_next(input)?;
            Some(winnow::combinator::cut_err(ident).parse_next(input)?.to_string())
        } else {
            None
        };

        let mut aliases = Vec::new();
        loop {
            ws_skip.parse_next(input)?;
            if opt(kw("alias")).parse_next(input)?.is_none() {
                break;
            }
            ws_skip.parse_next(input)?;
            let from = winnow::combinator::cut_err(ident).parse_next(input)?.to_string();
            ws_skip.parse_next(input)?;
            winnow::combinator::cut_err(kw("as")).parse_next(input)?;
            ws_skip.parse_next(input)?;
            let to = winnow::combinator::cut_err(ident).parse_next(input)?.to_string();
            aliases.push((from, to));
        }
        Ok((uri, ns, aliases))
    })
    .with_span()
    .parse_next(input)?;

    Ok(Import {
        span: Span::from(span),
        uri,
        explicit_namespace,
        aliases,
        doc: None,
    })
}

// ---------------------------------------------------------------------------
// struct definition
// ---------------------------------------------------------------------------

fn struct_def(input: &mut In<'_>) -> ModalResult<StructTypeDef> {
    let ((name, members), span) = (|input: &mut In<'_>| {
        kw("struct")(input)?;
        ws_skip.parse_next(input)?;
        let name = winnow::combinator::cut_err(ident).parse_next(input)?.to_string();
        tok("{")(input)?;

        let mut members: Vec<(String, crate::types::Type)> = Vec::new();
        loop {
            ws_skip.parse_next(input)?;
            if opt(winnow::token::literal("}")).parse_next(input)?.is_some() {
                break;
            }
            let ty = winnow::combinator::cut_err(type_expr).parse_next(input)?;
            ws_skip.parse_next(input)?;
            let member = winnow::combinator::cut_err(ident).parse_next(input)?.to_string();
            members.push((member, ty));
        }
        Ok((name, members))
    })
    .with_span()
    .parse_next(input)?;

    Ok(StructTypeDef {
        span: Span::from(span),
        name,
        members,
    })
}

// ---------------------------------------------------------------------------
// Shared small grammars
// ---------------------------------------------------------------------------

/// `a.b.c` — dotted identifier path.
pub(crate) fn dotted_ident(input: &mut In<'_>) -> ModalResult<Vec<String>> {
    let first = ident.parse_next(input)?.to_string();
    let mut parts = vec![first];
    loop {
        let start = input.checkpoint();
        if opt(winnow::token::literal(".")).parse_next(input)?.is_some() {
            match opt(ident).parse_next(input)? {
                Some(seg) => parts.push(seg.to_string()),
                None => {
                    input.reset(&start);
                    break;
                }
            }
        } else {
            input.reset(&start);
            break;
        }
    }
    Ok(parts)
}

/// Meta values: a JSON-ish literal tree.
pub(crate) fn meta_value(input: &mut In<'_>) -> ModalResult<crate::ast::MetaValue> {
    use crate::ast::MetaValue;
    use crate::parse_utils::{Number, number};

    ws_skip.parse_next(input)?;
    alt((
        kw("null").map(|_| MetaValue::Null),
        kw("true").map(|_| MetaValue::Boolean(true)),
        kw("false").map(|_| MetaValue::Boolean(false)),
        plain_string.map(MetaValue::String),
        (|input: &mut In<'_>| {
            let neg = opt(winnow::token::literal("-")).parse_next(input)?.is_some();
            let n = number.parse_next(input)?;
            Ok(match n {
                Number::Int(i) => MetaValue::Int(if neg { -i } else { i }),
                Number::Float(f) => MetaValue::Float(if neg { -f } else { f }),
            })
        }),
        meta_array,
        meta_object,
    ))
    .parse_next(input)
}

fn meta_array(input: &mut In<'_>) -> ModalResult<crate::ast::MetaValue> {
    winnow::token::literal("[").parse_next(input)?;
    let mut items = Vec::new();
    loop {
        ws_skip.parse_next(input)?;
        if opt(winnow::token::literal("]")).parse_next(input)?.is_some() {
            break;
        }
        items.push(meta_value.parse_next(input)?);
        ws_skip.parse_next(input)?;
        let _ = opt(winnow::token::literal(",")).parse_next(input)?;
    }
    Ok(crate::ast::MetaValue::Array(items))
}

fn meta_object(input: &mut In<'_>) -> ModalResult<crate::ast::MetaValue> {
    winnow::token::literal("{").parse_next(input)?;
    let mut members = Vec::new();
    loop {
        ws_skip.parse_next(input)?;
        if opt(winnow::token::literal("}")).parse_next(input)?.is_some() {
            break;
        }
        let key = ident.parse_next(input)?.to_string();
        tok(":")(input)?;
        let value = meta_value.parse_next(input)?;
        members.push((key, value));
        ws_skip.parse_next(input)?;
        let _ = opt(winnow::token::literal(",")).parse_next(input)?;
    }
    Ok(crate::ast::MetaValue::Object(members))
}
