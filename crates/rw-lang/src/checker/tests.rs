use super::*;
use crate::ast::Document;
use crate::graph::{NodeKind, build_graph};
use crate::parser::parse_document;

fn parse(source: &str) -> Document {
    parse_document(source, "test.wdl").expect("parse failed")
}

fn check(source: &str) -> Vec<CheckError> {
    check_document(&parse(source), &CheckOptions::default())
}

fn check_with(source: &str, opts: &CheckOptions) -> Vec<CheckError> {
    check_document(&parse(source), opts)
}

fn errors_of(diags: &[CheckError]) -> Vec<&CheckError> {
    diags.iter().filter(|d| d.severity == Severity::Error).collect()
}

fn has_error(diags: &[CheckError], kind: ErrorKind) -> bool {
    diags
        .iter()
        .any(|d| d.kind == kind && d.severity == Severity::Error)
}

// ---------------------------------------------------------------------------
// Declarations and coercions
// ---------------------------------------------------------------------------

#[test]
fn clean_workflow_checks() {
    let diags = check(
        "version 1.0\nworkflow w {\n  input { Int n }\n  Int m = n + 1\n  Float f = m\n  output { Float out = f * 2.0 }\n}\n",
    );
    assert!(errors_of(&diags).is_empty(), "unexpected: {diags:?}");
}

#[test]
fn type_mismatch_is_reported() {
    let diags = check("version 1.0\nworkflow w {\n  Int n = \"nope\"\n}\n");
    assert!(has_error(&diags, ErrorKind::StaticTypeMismatch), "{diags:?}");
}

#[test]
fn string_coercion_warns() {
    let diags = check("version 1.0\nworkflow w {\n  input { Int n }\n  String s = n\n}\n");
    assert!(diags
        .iter()
        .any(|d| d.kind == ErrorKind::StringCoercion && d.severity == Severity::Warning));
    assert!(errors_of(&diags).is_empty(), "{diags:?}");
}

#[test]
fn optional_into_required_is_quant_violation() {
    let src = "version 1.0\nworkflow w {\n  input { Int? i }\n  String s = i\n}\n";
    let diags = check(src);
    assert!(has_error(&diags, ErrorKind::QuantityCoercion), "{diags:?}");

    let relaxed = CheckOptions {
        relaxed_quant: true,
        ..Default::default()
    };
    let diags = check_with(src, &relaxed);
    assert!(!has_error(&diags, ErrorKind::QuantityCoercion), "{diags:?}");
}

#[test]
fn unknown_identifier_reported() {
    let diags = check("version 1.0\nworkflow w {\n  Int n = missing\n}\n");
    assert!(has_error(&diags, ErrorKind::UnknownIdentifier), "{diags:?}");
}

#[test]
fn forward_reference_policy() {
    let src = "version 1.0\nworkflow w {\n  Int a = b\n  Int b = 1\n}\n";
    let diags = check(src);
    assert!(has_error(&diags, ErrorKind::ForwardReference), "{diags:?}");

    let opts = CheckOptions {
        suppress: vec!["forward-reference".to_string()],
        ..Default::default()
    };
    let diags = check_with(src, &opts);
    assert!(!has_error(&diags, ErrorKind::ForwardReference), "{diags:?}");
    assert!(diags.iter().any(|d| d.kind == ErrorKind::ForwardReference));
}

// ---------------------------------------------------------------------------
// Name rules
// ---------------------------------------------------------------------------

#[test]
fn decl_colliding_with_task_name_is_fatal() {
    let diags = check(
        "version 1.0\ntask t { command <<<true>>> }\nworkflow w {\n  Int t = 1\n}\n",
    );
    assert!(has_error(&diags, ErrorKind::NameCollision), "{diags:?}");
}

#[test]
fn duplicate_names_in_scope_collide() {
    let diags = check("version 1.0\nworkflow w {\n  Int x = 1\n  Float x = 2.0\n}\n");
    assert!(has_error(&diags, ErrorKind::NameCollision), "{diags:?}");
}

#[test]
fn inner_decl_may_shadow_only_its_own_exposure() {
    // The scatter-internal name is re-exposed (lifted) at workflow level;
    // that is not a collision.
    let diags = check(
        "version 1.0\nworkflow w {\n  scatter (i in [1, 2]) {\n    Int sq = i * i\n  }\n  Array[Int] all = sq\n}\n",
    );
    assert!(errors_of(&diags).is_empty(), "{diags:?}");
}

// ---------------------------------------------------------------------------
// Sections and lifting
// ---------------------------------------------------------------------------

#[test]
fn scatter_lifts_to_nonempty_array() {
    let diags = check(
        "version 1.0\nworkflow w {\n  scatter (i in [1, 2, 3]) {\n    Int sq = i * i\n  }\n  output { Array[Int] squares = sq }\n}\n",
    );
    assert!(errors_of(&diags).is_empty(), "{diags:?}");
}

#[test]
fn conditional_lifts_to_optional() {
    let diags = check(
        "version 1.0\nworkflow w {\n  input { Boolean go }\n  if (go) {\n    Int x = 1\n  }\n  Int y = select_first([x, 0])\n}\n",
    );
    assert!(errors_of(&diags).is_empty(), "{diags:?}");
}

#[test]
fn conditional_value_needs_unwrapping() {
    let diags = check(
        "version 1.0\nworkflow w {\n  input { Boolean go }\n  if (go) {\n    Int x = 1\n  }\n  Int y = x\n}\n",
    );
    assert!(has_error(&diags, ErrorKind::QuantityCoercion), "{diags:?}");
}

#[test]
fn scatter_collection_must_be_array() {
    let diags = check("version 1.0\nworkflow w {\n  scatter (i in 42) {\n    Int x = i\n  }\n}\n");
    assert!(has_error(&diags, ErrorKind::StaticTypeMismatch), "{diags:?}");
}

#[test]
fn nested_lifting_composes() {
    let diags = check(
        "version 1.0\nworkflow w {\n  input { Boolean go }\n  if (go) {\n    scatter (i in [1]) {\n      Int v = i\n    }\n  }\n  output { Array[Int]? vs = v }\n}\n",
    );
    assert!(errors_of(&diags).is_empty(), "{diags:?}");
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

const TASK_LIB: &str = "task addone {\n  input { Int n\n Int bump = 1 }\n  command <<<echo $(( ~{n} + ~{bump} ))>>>\n  output { Int out = read_int(stdout()) }\n}\n";

#[test]
fn call_binds_outputs() {
    let diags = check(&format!(
        "version 1.0\n{TASK_LIB}workflow w {{\n  call addone {{ input: n = 41 }}\n  output {{ Int r = addone.out }}\n}}\n",
    ));
    assert!(errors_of(&diags).is_empty(), "{diags:?}");
}

#[test]
fn call_unknown_input_reported() {
    let diags = check(&format!(
        "version 1.0\n{TASK_LIB}workflow w {{\n  call addone {{ input: wrong = 1 }}\n}}\n",
    ));
    assert!(has_error(&diags, ErrorKind::NoSuchMember), "{diags:?}");
}

#[test]
fn call_input_type_checked() {
    let diags = check(&format!(
        "version 1.0\n{TASK_LIB}workflow w {{\n  call addone {{ input: n = \"x\" }}\n}}\n",
    ));
    assert!(has_error(&diags, ErrorKind::StaticTypeMismatch), "{diags:?}");
}

#[test]
fn call_unknown_output_reported() {
    let diags = check(&format!(
        "version 1.0\n{TASK_LIB}workflow w {{\n  call addone {{ input: n = 1 }}\n  Int r = addone.nope\n}}\n",
    ));
    assert!(has_error(&diags, ErrorKind::NoSuchMember), "{diags:?}");
}

#[test]
fn after_must_reference_a_call() {
    let diags = check(&format!(
        "version 1.1\n{TASK_LIB}workflow w {{\n  Int x = 1\n  call addone after x {{ input: n = 1 }}\n}}\n",
    ));
    assert!(has_error(&diags, ErrorKind::IncompatibleOperand), "{diags:?}");
}

// ---------------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------------

#[test]
fn unknown_function_reported() {
    let diags = check("version 1.0\nworkflow w {\n  Int x = frobnicate(1)\n}\n");
    assert!(has_error(&diags, ErrorKind::NoSuchFunction), "{diags:?}");
}

#[test]
fn select_first_unwraps_optionals() {
    let diags = check(
        "version 1.0\nworkflow w {\n  input { Int? x }\n  Int y = select_first([x, 42])\n}\n",
    );
    assert!(errors_of(&diags).is_empty(), "{diags:?}");
}

#[test]
fn glob_outside_task_outputs_rejected() {
    let diags = check("version 1.0\nworkflow w {\n  Array[File] fs = glob(\"*.txt\")\n}\n");
    assert!(has_error(&diags, ErrorKind::NoSuchFunction), "{diags:?}");
}

#[test]
fn stdout_allowed_in_task_outputs() {
    let diags = check(
        "version 1.0\ntask t {\n  command <<<echo hi>>>\n  output { String s = read_string(stdout()) }\n}\n",
    );
    assert!(errors_of(&diags).is_empty(), "{diags:?}");
}

// ---------------------------------------------------------------------------
// Structs
// ---------------------------------------------------------------------------

#[test]
fn struct_member_access_typed() {
    let diags = check(
        "version 1.0\nstruct Sample { String id\n Int depth }\nworkflow w {\n  input { Sample s }\n  Int d = s.depth\n  String bad = s.nope\n}\n",
    );
    assert!(has_error(&diags, ErrorKind::NoSuchMember), "{diags:?}");
    // Only the bad member is an error.
    assert_eq!(errors_of(&diags).len(), 1, "{diags:?}");
}

#[test]
fn struct_cycles_detected() {
    let diags = check("version 1.0\nstruct A { B b }\nstruct B { A a }\n");
    assert!(has_error(&diags, ErrorKind::StructCycle), "{diags:?}");
}

#[test]
fn struct_literal_checks_members() {
    let diags = check(
        "version 1.0\nstruct Sample { String id }\nworkflow w {\n  Sample s = Sample { id: \"a\", extra: 1 }\n}\n",
    );
    assert!(has_error(&diags, ErrorKind::NoSuchMember), "{diags:?}");
}

// ---------------------------------------------------------------------------
// Dependency graph
// ---------------------------------------------------------------------------

fn graph_for(source: &str) -> crate::graph::Graph {
    let doc = parse(source);
    let mut errors = Vec::new();
    let structs = build_struct_env(&doc, &mut errors);
    let wf = doc.workflow.as_ref().expect("workflow");
    build_graph(wf, &doc, &structs).expect("graph")
}

#[test]
fn graph_ids_are_deterministic() {
    let g = graph_for(
        "version 1.0\nworkflow w {\n  input { Int n }\n  Int m = n + 1\n  scatter (i in range(m)) {\n    Int sq = i * i\n  }\n  output { Array[Int] out = sq }\n}\n",
    );
    let ids: Vec<&str> = g.ids().map(|s| s.as_str()).collect();
    assert!(ids.contains(&"decl-n"));
    assert!(ids.contains(&"decl-m"));
    assert!(ids.contains(&"scatter-0"));
    assert!(ids.contains(&"scatter-0-decl-sq"));
    assert!(ids.contains(&"output-out"));
    assert!(ids.contains(&"gather-scatter-0-decl-sq"));
}

#[test]
fn graph_edges_follow_references() {
    let g = graph_for(
        "version 1.0\nworkflow w {\n  input { Int n }\n  Int m = n + 1\n  scatter (i in range(m)) {\n    Int sq = i * i\n  }\n  output { Array[Int] out = sq }\n}\n",
    );
    assert!(g.dependencies("decl-m").unwrap().contains("decl-n"));
    assert!(g.dependencies("scatter-0").unwrap().contains("decl-m"));
    // Inside the scatter the square depends on the bound variable, i.e. the
    // section itself.
    assert!(g.dependencies("scatter-0-decl-sq").unwrap().contains("scatter-0"));
    // The output reaches the inner value through its gather.
    assert!(g
        .dependencies("output-out")
        .unwrap()
        .contains("gather-scatter-0-decl-sq"));
}

#[test]
fn gather_type_is_lifted() {
    let g = graph_for(
        "version 1.0\nworkflow w {\n  scatter (i in [1, 2]) {\n    Int sq = i * i\n  }\n  output { Array[Int] out = sq }\n}\n",
    );
    let gather = g.get("gather-scatter-0-decl-sq").unwrap();
    assert_eq!(gather.ty.as_ref().unwrap().to_string(), "Array[Int]+");
    assert!(matches!(gather.kind, NodeKind::Gather { .. }));
}

#[test]
fn nested_gather_types_compose() {
    let g = graph_for(
        "version 1.0\nworkflow w {\n  input { Boolean go }\n  if (go) {\n    scatter (i in [1]) {\n      Int v = i\n    }\n  }\n  output { Array[Int]? vs = v }\n}\n",
    );
    // Innermost gather lifts to Array[Int]+, outer to Array[Int]+?.
    let inner = g.get("gather-scatter-1-decl-v").unwrap();
    assert_eq!(inner.ty.as_ref().unwrap().to_string(), "Array[Int]+");
    let outer = g.get("gather-gather-scatter-1-decl-v").unwrap();
    assert_eq!(outer.ty.as_ref().unwrap().to_string(), "Array[Int]+?");
    assert!(g
        .dependencies("output-vs")
        .unwrap()
        .contains("gather-gather-scatter-1-decl-v"));
}

#[test]
fn afters_add_edges() {
    let src = format!(
        "version 1.1\n{TASK_LIB}workflow w {{\n  call addone {{ input: n = 1 }}\n  call addone as second after addone {{ input: n = 2 }}\n}}\n",
    );
    let g = graph_for(&src);
    assert!(g.dependencies("call-second").unwrap().contains("call-addone"));
}

#[test]
fn section_nesting_is_recorded() {
    let g = graph_for(
        "version 1.0\nworkflow w {\n  scatter (i in [1]) {\n    scatter (j in [2]) {\n      Int x = i + j\n    }\n  }\n}\n",
    );
    assert_eq!(g.section_of("scatter-1"), Some(&"scatter-0".to_string()));
    assert_eq!(
        g.section_of("scatter-1-decl-x"),
        Some(&"scatter-1".to_string())
    );
    let children: Vec<&str> = g.children("scatter-1").map(|n| n.id.as_str()).collect();
    assert_eq!(children, vec!["scatter-1-decl-x"]);
}
