use super::parse_document;
use crate::ast::*;

fn parse_ok(source: &str) -> Document {
    match parse_document(source, "test.wdl") {
        Ok(doc) => doc,
        Err(e) => panic!("parse failed: {e}\nsource:\n{source}"),
    }
}

// ---------------------------------------------------------------------------
// Documents and versions
// ---------------------------------------------------------------------------

#[test]
fn parses_version_statement() {
    let doc = parse_ok("version 1.1\ntask t { command <<<true>>> }\n");
    assert_eq!(doc.version, WdlVersion::V1_1);
    assert!(!doc.version_defaulted);
}

#[test]
fn missing_version_defaults_to_draft2() {
    let doc = parse_ok("task t { command { echo hi } }\n");
    assert_eq!(doc.version, WdlVersion::Draft2);
    assert!(doc.version_defaulted);
}

#[test]
fn comments_before_version_are_skipped() {
    let doc = parse_ok("# header\n\n# more\nversion 1.0\ntask t { command <<<true>>> }\n");
    assert_eq!(doc.version, WdlVersion::V1_0);
}

#[test]
fn parses_imports_with_alias() {
    let doc = parse_ok(
        "version 1.0\nimport \"lib/align.wdl\" as aln alias Reads as LibReads\n\
         task t { command <<<true>>> }\n",
    );
    assert_eq!(doc.imports.len(), 1);
    let imp = &doc.imports[0];
    assert_eq!(imp.uri, "lib/align.wdl");
    assert_eq!(imp.namespace(), "aln");
    assert_eq!(imp.aliases, vec![("Reads".to_string(), "LibReads".to_string())]);
}

#[test]
fn import_namespace_defaults_to_basename() {
    let doc = parse_ok("version 1.0\nimport \"tools/samtools.wdl\"\ntask t { command <<<true>>> }\n");
    assert_eq!(doc.imports[0].namespace(), "samtools");
}

#[test]
fn syntax_error_carries_position() {
    let err = parse_document("version 1.0\ntask t {\n  command <<<true>>>\n", "x.wdl")
        .unwrap_err();
    assert_eq!(err.pos.uri, "x.wdl");
    assert!(err.pos.line >= 3, "line was {}", err.pos.line);
}

// ---------------------------------------------------------------------------
// Types and declarations
// ---------------------------------------------------------------------------

#[test]
fn parses_type_shapes() {
    let doc = parse_ok(
        "version 1.0\nworkflow w {\n  input {\n    Array[Int]+ xs\n    Map[String,File]? m\n    Pair[Int,Array[String]] p\n    Sample s\n  }\n}\n",
    );
    let wf = doc.workflow.unwrap();
    assert_eq!(wf.inputs[0].ty.to_string(), "Array[Int]+");
    assert_eq!(wf.inputs[1].ty.to_string(), "Map[String,File]?");
    assert_eq!(wf.inputs[2].ty.to_string(), "Pair[Int,Array[String]]");
    assert_eq!(wf.inputs[3].ty.to_string(), "Sample");
}

#[test]
fn parses_struct_typedef() {
    let doc = parse_ok("version 1.0\nstruct Sample {\n  String id\n  Array[File] reads\n}\n");
    assert_eq!(doc.struct_typedefs.len(), 1);
    let td = &doc.struct_typedefs[0];
    assert_eq!(td.name, "Sample");
    assert_eq!(td.members.len(), 2);
    assert_eq!(td.members[1].0, "reads");
}

#[test]
fn parses_env_decl() {
    let doc = parse_ok(
        "version development\ntask t {\n  input { env String TOKEN }\n  command <<<true>>>\n}\n",
    );
    assert!(doc.tasks[0].inputs[0].env);
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

fn parse_decl_expr(expr: &str) -> Expr {
    let src = format!("version 1.0\nworkflow w {{\n  Int x = {expr}\n}}\n");
    let doc = parse_ok(&src);
    let wf = doc.workflow.unwrap();
    match &wf.body[0] {
        WorkflowNode::Decl(d) => d.expr.clone().unwrap(),
        other => panic!("expected decl, got {other:?}"),
    }
}

#[test]
fn arithmetic_precedence() {
    let e = parse_decl_expr("1 + 2 * 3");
    let ExprKind::Binary { op: BinOp::Add, right, .. } = &e.kind else {
        panic!("expected top-level +, got {:?}", e.kind);
    };
    assert!(matches!(right.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
}

#[test]
fn comparison_binds_looser_than_addition() {
    let e = parse_decl_expr("1 + 1 < 3");
    assert!(matches!(e.kind, ExprKind::Binary { op: BinOp::Lt, .. }));
}

#[test]
fn ternary_expression() {
    let e = parse_decl_expr("if done then 1 else 0");
    assert!(matches!(e.kind, ExprKind::Ternary { .. }));
}

#[test]
fn pair_literal_and_member_access() {
    let e = parse_decl_expr("(1, \"a\").left");
    let ExprKind::Member { expr, name } = &e.kind else {
        panic!("expected member access");
    };
    assert_eq!(name, "left");
    assert!(matches!(expr.kind, ExprKind::Pair(..)));
}

#[test]
fn index_chain() {
    let e = parse_decl_expr("rows[0][1]");
    let ExprKind::Index { expr, .. } = &e.kind else {
        panic!("expected index");
    };
    assert!(matches!(expr.kind, ExprKind::Index { .. }));
}

#[test]
fn apply_with_args() {
    let e = parse_decl_expr("select_first([x, 42])");
    let ExprKind::Apply { name, args } = &e.kind else {
        panic!("expected apply");
    };
    assert_eq!(name, "select_first");
    assert_eq!(args.len(), 1);
}

#[test]
fn string_interpolation_parts() {
    let e = parse_decl_expr("\"Hello, ~{who}!\"");
    let ExprKind::String(parts) = &e.kind else {
        panic!("expected string");
    };
    assert_eq!(parts.len(), 3);
    assert!(matches!(&parts[0], StringPart::Literal(s) if s == "Hello, "));
    assert!(matches!(&parts[1], StringPart::Placeholder(_)));
    assert!(matches!(&parts[2], StringPart::Literal(s) if s == "!"));
}

#[test]
fn string_escapes() {
    let e = parse_decl_expr("\"a\\tb\\n\"");
    let ExprKind::String(parts) = &e.kind else {
        panic!("expected string");
    };
    assert!(matches!(&parts[0], StringPart::Literal(s) if s == "a\tb\n"));
}

#[test]
fn object_and_map_literals() {
    let e = parse_decl_expr("object { id: 1, name: \"s\" }");
    assert!(matches!(e.kind, ExprKind::Object { type_name: None, .. }));

    let e = parse_decl_expr("Sample { id: \"a\" }");
    let ExprKind::Object { type_name, .. } = &e.kind else {
        panic!("expected struct literal");
    };
    assert_eq!(type_name.as_deref(), Some("Sample"));

    let e = parse_decl_expr("{ \"a\": 1, \"b\": 2 }");
    assert!(matches!(e.kind, ExprKind::Map(ref m) if m.len() == 2));
}

#[test]
fn negative_numbers_and_not() {
    let e = parse_decl_expr("-x");
    assert!(matches!(e.kind, ExprKind::Unary { op: UnaryOp::Neg, .. }));
    let e = parse_decl_expr("!flag");
    assert!(matches!(e.kind, ExprKind::Unary { op: UnaryOp::Not, .. }));
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[test]
fn heredoc_command_with_placeholder() {
    let doc = parse_ok(
        "version 1.0\ntask hello {\n  input { String who }\n  command <<<\n    echo \"Hello, ~{who}!\" > m.txt\n  >>>\n  output { File m = \"m.txt\" }\n}\n",
    );
    let parts = &doc.tasks[0].command.parts;
    assert_eq!(parts.len(), 3);
    assert!(matches!(&parts[0], CommandPart::Literal(s) if s.starts_with("echo")));
    assert!(matches!(&parts[1], CommandPart::Placeholder(_)));
}

#[test]
fn heredoc_dedent_strips_common_prefix() {
    let doc = parse_ok(
        "version 1.0\ntask t {\n  command <<<\n    line one\n      indented\n    line two\n  >>>\n}\n",
    );
    let CommandPart::Literal(text) = &doc.tasks[0].command.parts[0] else {
        panic!("expected literal");
    };
    assert_eq!(text, "line one\n  indented\nline two\n");
}

#[test]
fn brace_command_counts_nested_braces() {
    let doc = parse_ok("version 1.0\ntask t {\n  command {\n    awk '{ print $1 }' in.txt\n  }\n}\n");
    let CommandPart::Literal(text) = &doc.tasks[0].command.parts[0] else {
        panic!("expected literal");
    };
    assert!(text.contains("awk '{ print $1 }'"), "got {text:?}");
}

#[test]
fn draft2_dollar_placeholders() {
    let doc = parse_ok("task t {\n  String who\n  command {\n    echo ${who}\n  }\n}\n");
    let parts = &doc.tasks[0].command.parts;
    assert!(parts.iter().any(|p| matches!(p, CommandPart::Placeholder(_))));
    // Pre-command bare decls are inputs in draft-2.
    assert_eq!(doc.tasks[0].inputs.len(), 1);
}

#[test]
fn placeholder_options() {
    let doc = parse_ok(
        "version 1.0\ntask t {\n  input { Array[String] xs\n Boolean flag\n Int? n }\n  command <<<\n    cmd ~{sep=\",\" xs} ~{true=\"--on\" false=\"\" flag} ~{default=\"0\" n}\n  >>>\n}\n",
    );
    let placeholders: Vec<&Placeholder> = doc.tasks[0]
        .command
        .parts
        .iter()
        .filter_map(|p| match p {
            CommandPart::Placeholder(ph) => Some(ph),
            _ => None,
        })
        .collect();
    assert_eq!(placeholders.len(), 3);
    assert!(matches!(placeholders[0].options[0], PlaceholderOption::Sep(ref s) if s == ","));
    assert!(matches!(
        placeholders[1].options[0],
        PlaceholderOption::TrueFalse(ref t, ref f) if t == "--on" && f.is_empty()
    ));
    assert!(matches!(placeholders[2].options[0], PlaceholderOption::Default(ref d) if d == "0"));
}

#[test]
fn line_continuation_survives_dedent() {
    let doc = parse_ok(
        "version 1.0\ntask t {\n  command <<<\n    echo one \\\n      two\n  >>>\n}\n",
    );
    let CommandPart::Literal(text) = &doc.tasks[0].command.parts[0] else {
        panic!("expected literal");
    };
    assert_eq!(text, "echo one \\\n      two\n");
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

#[test]
fn parses_scatter_workflow() {
    let doc = parse_ok(
        "version 1.0\nworkflow squares {\n  scatter (i in range(4)) {\n    Int sq = (i + 1) * (i + 1)\n  }\n  output { Array[Int] out = sq }\n}\n",
    );
    let wf = doc.workflow.unwrap();
    let WorkflowNode::Scatter(s) = &wf.body[0] else {
        panic!("expected scatter");
    };
    assert_eq!(s.variable, "i");
    assert_eq!(s.body.len(), 1);
    assert_eq!(wf.outputs.as_ref().unwrap().len(), 1);
}

#[test]
fn parses_conditional() {
    let doc = parse_ok(
        "version 1.0\nworkflow w {\n  input { Boolean go }\n  if (go) {\n    call t\n  }\n}\ntask t { command <<<true>>> }\n",
    );
    let wf = doc.workflow.unwrap();
    assert!(matches!(wf.body[0], WorkflowNode::Conditional(_)));
}

#[test]
fn call_forms() {
    let doc = parse_ok(
        "version 1.1\nworkflow w {\n  call t\n  call t as t2 { n = 1 }\n  call lib.t as t3 after t2 { input: n = 2, m }\n}\n",
    );
    let wf = doc.workflow.unwrap();
    let calls: Vec<&Call> = wf
        .body
        .iter()
        .filter_map(|n| match n {
            WorkflowNode::Call(c) => Some(c),
            _ => None,
        })
        .collect();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].name(), "t");
    assert_eq!(calls[1].name(), "t2");
    assert_eq!(calls[1].inputs.len(), 1);
    assert_eq!(calls[2].callee, vec!["lib".to_string(), "t".to_string()]);
    assert_eq!(calls[2].afters, vec!["t2".to_string()]);
    // `m` shorthand expands to `m = m`.
    assert!(matches!(calls[2].inputs[1].1.kind, ExprKind::Ident(ref n) if n == "m"));
}

#[test]
fn task_meta_and_runtime() {
    let doc = parse_ok(
        "version 1.0\ntask t {\n  input { Int n }\n  command <<<true>>>\n  runtime {\n    docker: \"ubuntu:22.04\"\n    cpu: 2\n    maxRetries: 1\n  }\n  meta { description: \"demo\", tags: [\"a\", \"b\"] }\n}\n",
    );
    let task = &doc.tasks[0];
    assert_eq!(task.runtime.len(), 3);
    assert!(task.runtime_attr("docker").is_some());
    assert!(matches!(
        task.meta[1].1,
        MetaValue::Array(ref items) if items.len() == 2
    ));
}
