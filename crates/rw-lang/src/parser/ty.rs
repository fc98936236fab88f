use winnow::combinator::{alt, cut_err, opt};
use winnow::prelude::*;
use winnow::token::literal;

use crate::parse_utils::{In, ident, kw, tok, ws_skip};
use crate::types::{Type, TypeKind};

// ---------------------------------------------------------------------------
// Type expressions
// ---------------------------------------------------------------------------

/// `Array[Int]+?`, `Map[String,File]`, `Pair[Int,Int]`, `MyStruct?`, ...
///
/// Struct names parse as [`TypeKind::StructInstance`] with empty members;
/// the checker resolves them against the document's typedefs.
pub(crate) fn type_expr(input: &mut In<'_>) -> ModalResult<Type> {
    ws_skip.parse_next(input)?;
    let kind = alt((
        array_type,
        map_type,
        pair_type,
        kw("Boolean").map(|_| TypeKind::Boolean),
        kw("Int").map(|_| TypeKind::Int),
        kw("Float").map(|_| TypeKind::Float),
        kw("String").map(|_| TypeKind::String),
        kw("File").map(|_| TypeKind::File),
        kw("Directory").map(|_| TypeKind::Directory),
        kw("Object").map(|_| TypeKind::Object),
        ident.map(|name: &str| TypeKind::StructInstance {
            name: name.to_string(),
            members: Vec::new(),
        }),
    ))
    .parse_next(input)?;

    let optional = opt(literal("?")).parse_next(input)?.is_some();
    Ok(Type { kind, optional })
}

fn array_type(input: &mut In<'_>) -> ModalResult<TypeKind> {
    kw("Array")(input)?;
    tok("[")(input)?;
    let item = cut_err(type_expr).parse_next(input)?;
    tok("]")(input)?;
    let nonempty = opt(literal("+")).parse_next(input)?.is_some();
    Ok(TypeKind::Array {
        item: Box::new(item),
        nonempty,
    })
}

fn map_type(input: &mut In<'_>) -> ModalResult<TypeKind> {
    kw("Map")(input)?;
    tok("[")(input)?;
    let key = cut_err(type_expr).parse_next(input)?;
    tok(",")(input)?;
    let value = cut_err(type_expr).parse_next(input)?;
    tok("]")(input)?;
    Ok(TypeKind::Map {
        key: Box::new(key),
        value: Box::new(value),
    })
}

fn pair_type(input: &mut In<'_>) -> ModalResult<TypeKind> {
    kw("Pair")(input)?;
    tok("[")(input)?;
    let left = cut_err(type_expr).parse_next(input)?;
    tok(",")(input)?;
    let right = cut_err(type_expr).parse_next(input)?;
    tok("]")(input)?;
    Ok(TypeKind::Pair {
        left: Box::new(left),
        right: Box::new(right),
    })
}
