use winnow::ascii::multispace0;
use winnow::combinator::{alt, opt};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::prelude::*;
use winnow::stream::{LocatingSlice, Stream};
use winnow::token::{literal, take_while};

/// Parser input: a source slice that tracks byte offsets for spans.
pub(crate) type In<'a> = LocatingSlice<&'a str>;

// ---------------------------------------------------------------------------
// Identifiers and keywords
// ---------------------------------------------------------------------------

pub(crate) fn ident<'a>(input: &mut In<'a>) -> ModalResult<&'a str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}

/// Match an exact keyword, rejecting identifiers that merely start with it.
pub(crate) fn kw<'a>(keyword: &'static str) -> impl FnMut(&mut In<'a>) -> ModalResult<()> {
    move |input: &mut In<'a>| {
        let start = input.checkpoint();
        let id = ident.parse_next(input)?;
        if id != keyword {
            input.reset(&start);
            return Err(ErrMode::Backtrack(ContextError::new()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Whitespace & comments
// ---------------------------------------------------------------------------

/// Skip whitespace and `# ...` line comments.
pub(crate) fn ws_skip(input: &mut In<'_>) -> ModalResult<()> {
    loop {
        let _ = multispace0.parse_next(input)?;
        if opt(literal("#")).parse_next(input)?.is_some() {
            let _ = take_while(0.., |c: char| c != '\n').parse_next(input)?;
        } else {
            break;
        }
    }
    Ok(())
}

/// `ws_skip`, then the given literal token, with a cut on failure.
pub(crate) fn tok<'a>(t: &'static str) -> impl FnMut(&mut In<'a>) -> ModalResult<()> {
    move |input: &mut In<'a>| {
        ws_skip.parse_next(input)?;
        winnow::combinator::cut_err(literal(t))
            .context(StrContext::Expected(StrContextValue::StringLiteral(t)))
            .parse_next(input)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Strings without interpolation
// ---------------------------------------------------------------------------

/// A quoted string with standard escapes and no `~{}` interpolation —
/// import URIs, placeholder option values, meta strings.
pub(crate) fn plain_string(input: &mut In<'_>) -> ModalResult<String> {
    let quote = alt((literal("\""), literal("'"))).parse_next(input)?;
    let close = quote.chars().next().unwrap();
    let mut out = String::new();
    loop {
        let c = winnow::token::any
            .context(StrContext::Expected(StrContextValue::Description(
                "closing quote",
            )))
            .parse_next(input)?;
        match c {
            '\\' => {
                let e = winnow::token::any.parse_next(input)?;
                out.push(unescape(e));
            }
            c if c == close => break,
            c => out.push(c),
        }
    }
    Ok(out)
}

pub(crate) fn unescape(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        '0' => '\0',
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Numbers
// ---------------------------------------------------------------------------

pub(crate) enum Number {
    Int(i64),
    Float(f64),
}

pub(crate) fn number(input: &mut In<'_>) -> ModalResult<Number> {
    let text = (
        take_while(1.., |c: char| c.is_ascii_digit()),
        opt((literal("."), take_while(1.., |c: char| c.is_ascii_digit()))),
        opt((
            alt((literal("e"), literal("E"))),
            opt(alt((literal("+"), literal("-")))),
            take_while(1.., |c: char| c.is_ascii_digit()),
        )),
    )
        .take()
        .parse_next(input)?;

    if text.contains('.') || text.contains('e') || text.contains('E') {
        text.parse::<f64>()
            .map(Number::Float)
            .map_err(|_| ErrMode::Cut(ContextError::new()))
    } else {
        text.parse::<i64>()
            .map(Number::Int)
            .map_err(|_| ErrMode::Cut(ContextError::new()))
    }
}
