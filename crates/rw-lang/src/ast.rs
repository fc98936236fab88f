use std::fmt;
use std::sync::Arc;

use crate::types::Type;

// ---------------------------------------------------------------------------
// Source positions
// ---------------------------------------------------------------------------

/// Byte-offset span into a document's source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl From<std::ops::Range<usize>> for Span {
    fn from(r: std::ops::Range<usize>) -> Self {
        Span {
            start: r.start,
            end: r.end,
        }
    }
}

/// A resolved source position (1-based line/column).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pos {
    pub uri: String,
    pub line: u32,
    pub column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.uri, self.line, self.column)
    }
}

/// Maps byte offsets to 1-based line/column pairs.
#[derive(Debug, Clone)]
pub struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        LineIndex { line_starts }
    }

    pub fn line_col(&self, offset: usize) -> (u32, u32) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let col = offset - self.line_starts[line];
        (line as u32 + 1, col as u32 + 1)
    }
}

// ---------------------------------------------------------------------------
// Versions
// ---------------------------------------------------------------------------

/// Declared WDL grammar version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum WdlVersion {
    Draft2,
    V1_0,
    V1_1,
    Development,
}

impl WdlVersion {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft-2" => Some(WdlVersion::Draft2),
            "1.0" => Some(WdlVersion::V1_0),
            "1.1" => Some(WdlVersion::V1_1),
            "development" => Some(WdlVersion::Development),
            _ => None,
        }
    }

    /// draft-2 commands use `${}` placeholders; 1.0+ use `~{}`.
    pub fn dollar_placeholders(self) -> bool {
        matches!(self, WdlVersion::Draft2)
    }

    /// Struct typedefs arrived in 1.0.
    pub fn has_structs(self) -> bool {
        !matches!(self, WdlVersion::Draft2)
    }
}

impl fmt::Display for WdlVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WdlVersion::Draft2 => "draft-2",
            WdlVersion::V1_0 => "1.0",
            WdlVersion::V1_1 => "1.1",
            WdlVersion::Development => "development",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A parsed (and, after import resolution, linked) WDL document.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Document {
    pub uri: String,
    pub source: String,
    pub version: WdlVersion,
    /// Set when the version statement was missing and draft-2 was assumed.
    pub version_defaulted: bool,
    pub imports: Vec<Import>,
    pub struct_typedefs: Vec<StructTypeDef>,
    pub tasks: Vec<Task>,
    pub workflow: Option<Workflow>,
}

impl Document {
    pub fn line_index(&self) -> LineIndex {
        LineIndex::new(&self.source)
    }

    pub fn pos(&self, span: Span) -> Pos {
        let index = self.line_index();
        let (line, column) = index.line_col(span.start);
        let (end_line, end_column) = index.line_col(span.end);
        Pos {
            uri: self.uri.clone(),
            line,
            column,
            end_line,
            end_column,
        }
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn import(&self, namespace: &str) -> Option<&Import> {
        self.imports.iter().find(|i| i.namespace() == namespace)
    }
}

/// `import "URI" [as NAME] [alias S as T]*`
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Import {
    pub span: Span,
    pub uri: String,
    pub explicit_namespace: Option<String>,
    pub aliases: Vec<(String, String)>,
    /// Filled by the import resolver; `None` only in unlinked documents.
    pub doc: Option<Arc<Document>>,
}

impl Import {
    /// Effective namespace: the `as NAME` override, else the URI basename
    /// with its `.wdl` extension stripped.
    pub fn namespace(&self) -> &str {
        if let Some(ref ns) = self.explicit_namespace {
            return ns;
        }
        let base = self.uri.rsplit('/').next().unwrap_or(&self.uri);
        base.strip_suffix(".wdl").unwrap_or(base)
    }
}

/// `struct NAME { TYPE member ... }`
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct StructTypeDef {
    pub span: Span,
    pub name: String,
    pub members: Vec<(String, Type)>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Task {
    pub span: Span,
    pub name: String,
    pub inputs: Vec<Decl>,
    /// Declarations after the input block (not overridable by callers).
    pub postinputs: Vec<Decl>,
    pub command: CommandTemplate,
    pub outputs: Vec<Decl>,
    pub runtime: Vec<(String, Expr)>,
    pub meta: Vec<(String, MetaValue)>,
    pub parameter_meta: Vec<(String, MetaValue)>,
    pub hints: Vec<(String, Expr)>,
}

impl Task {
    pub fn runtime_attr(&self, key: &str) -> Option<&Expr> {
        self.runtime
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, e)| e)
    }

    /// Required inputs: no default expression and not optional.
    pub fn required_inputs(&self) -> impl Iterator<Item = &Decl> {
        self.inputs
            .iter()
            .filter(|d| d.expr.is_none() && !d.ty.optional)
    }
}

/// `TYPE NAME [= EXPR]`, possibly flagged `env`.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Decl {
    pub span: Span,
    pub name: String,
    pub ty: Type,
    pub expr: Option<Expr>,
    /// `env`-flagged task inputs are exported as container environment
    /// variables.
    pub env: bool,
}

/// Alternating literal/placeholder command template.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct CommandTemplate {
    pub span: Span,
    pub parts: Vec<CommandPart>,
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CommandPart {
    Literal(String),
    Placeholder(Placeholder),
}

/// `~{ [options] expr }` inside a command or interpolated string.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Placeholder {
    pub span: Span,
    pub options: Vec<PlaceholderOption>,
    pub expr: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum PlaceholderOption {
    /// `sep=", "` — join array items.
    Sep(String),
    /// `default="x"` — substitute when the value is absent.
    Default(String),
    /// `true="yes" false="no"` — render a Boolean.
    TrueFalse(String, String),
}

/// Metadata values (meta / parameter_meta) — an untyped JSON-like tree.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum MetaValue {
    Null,
    Boolean(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<MetaValue>),
    Object(Vec<(String, MetaValue)>),
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Workflow {
    pub span: Span,
    pub name: String,
    pub inputs: Vec<Decl>,
    pub body: Vec<WorkflowNode>,
    pub outputs: Option<Vec<Decl>>,
    pub meta: Vec<(String, MetaValue)>,
    pub parameter_meta: Vec<(String, MetaValue)>,
}

impl Workflow {
    pub fn required_inputs(&self) -> impl Iterator<Item = &Decl> {
        self.inputs
            .iter()
            .filter(|d| d.expr.is_none() && !d.ty.optional)
    }
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum WorkflowNode {
    Decl(Decl),
    Call(Call),
    Scatter(Scatter),
    Conditional(Conditional),
}

/// `call ns.task [as alias] { input: name = expr, ... } [after other]`
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Call {
    pub span: Span,
    /// Possibly dotted callee path, e.g. `lib.align`.
    pub callee: Vec<String>,
    pub alias: Option<String>,
    pub inputs: Vec<(String, Expr)>,
    pub afters: Vec<String>,
}

impl Call {
    /// Name the call binds in its scope: the alias, else the last callee
    /// segment.
    pub fn name(&self) -> &str {
        self.alias
            .as_deref()
            .unwrap_or_else(|| self.callee.last().map(|s| s.as_str()).unwrap_or(""))
    }
}

/// `scatter (x in expr) { body }`
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Scatter {
    pub span: Span,
    pub variable: String,
    pub collection: Expr,
    pub body: Vec<WorkflowNode>,
}

/// `if (expr) { body }`
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Conditional {
    pub span: Span,
    pub predicate: Expr,
    pub body: Vec<WorkflowNode>,
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Expr {
    pub span: Span,
    pub kind: ExprKind,
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ExprKind {
    Boolean(bool),
    Int(i64),
    Float(f64),
    /// String literal; interpolations appear as placeholder parts.
    String(Vec<StringPart>),
    /// The `None` literal (1.1+).
    None,
    Ident(String),
    Array(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    Pair(Box<Expr>, Box<Expr>),
    /// `object { a: 1 }` or `StructName { a: 1 }`.
    Object {
        type_name: Option<String>,
        members: Vec<(String, Expr)>,
    },
    /// `expr[index]`
    Index {
        expr: Box<Expr>,
        index: Box<Expr>,
    },
    /// `expr.member`
    Member {
        expr: Box<Expr>,
        name: String,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `if cond then a else b`
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        els: Box<Expr>,
    },
    /// `name(args...)`
    Apply {
        name: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum StringPart {
    Literal(String),
    Placeholder(Placeholder),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Or => "||",
            BinOp::And => "&&",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
        }
    }
}

impl Expr {
    pub fn new(span: Span, kind: ExprKind) -> Self {
        Expr { span, kind }
    }

    /// Literal string content, when the expression is a plain string with
    /// no interpolation.
    pub fn as_plain_string(&self) -> Option<String> {
        if let ExprKind::String(parts) = &self.kind {
            let mut out = String::new();
            for p in parts {
                match p {
                    StringPart::Literal(s) => out.push_str(s),
                    StringPart::Placeholder(_) => return None,
                }
            }
            return Some(out);
        }
        None
    }
}
