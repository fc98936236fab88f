pub mod ast;
pub mod checker;
pub mod graph;
pub mod parser;
pub mod types;

mod parse_utils;

pub use ast::{Document, Span, WdlVersion};
pub use checker::{CheckError, CheckOptions, ErrorKind, Severity, check_document};
pub use checker::imports::{FileResolver, ImportResolver, load_document};
pub use graph::{Graph, NodeId};
pub use parser::{SyntaxError, parse_document};
pub use types::{Coercion, CoercionWarning, Type, TypeKind};
