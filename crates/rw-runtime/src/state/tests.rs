use std::collections::HashMap;
use std::sync::Arc;

use rw_core::json::RunInputs;
use rw_core::{Stdlib, Value};
use rw_lang::checker::{CheckOptions, build_struct_env, check_document, is_clean};
use rw_lang::graph::build_graph;

use super::*;

fn machine(source: &str, inputs_json: &str) -> StateMachine {
    let doc = Arc::new(rw_lang::parse_document(source, "state-test.wdl").expect("parse"));
    let diags = check_document(&doc, &CheckOptions::default());
    assert!(is_clean(&diags), "checker errors: {diags:?}");

    let mut scratch = Vec::new();
    let structs = build_struct_env(&doc, &mut scratch);
    let wf = doc.workflow.as_ref().expect("workflow");
    let graph = Arc::new(build_graph(wf, &doc, &structs).expect("graph"));

    let mut input_types = HashMap::new();
    for d in &wf.inputs {
        input_types.insert(d.name.clone(), d.ty.clone());
    }
    let json: serde_json::Value = serde_json::from_str(inputs_json).unwrap();
    let inputs =
        rw_core::json::parse_run_inputs(&json, &wf.name, &input_types).expect("inputs");

    StateMachine::new(doc, graph, Stdlib::pure_only(), inputs, false)
}

fn run_to_completion(sm: &mut StateMachine) -> Vec<(String, Value)> {
    let jobs = sm.step();
    assert!(jobs.is_empty(), "unexpected call jobs: {jobs:?}");
    assert!(sm.is_done(), "state machine stalled");
    sm.outputs().expect("outputs")
}

// ---------------------------------------------------------------------------
// Declarations and outputs
// ---------------------------------------------------------------------------

#[test]
fn straight_line_evaluation() {
    let mut sm = machine(
        "version 1.0\nworkflow w {\n  input { Int n }\n  Int m = n + 1\n  output { Int out = m * 2 }\n}\n",
        r#"{"w.n": 20}"#,
    );
    let outputs = run_to_completion(&mut sm);
    assert_eq!(outputs, vec![("out".to_string(), Value::Int(42))]);
}

#[test]
fn missing_required_input_fails_the_run() {
    let mut sm = machine(
        "version 1.0\nworkflow w {\n  input { Int n }\n  output { Int out = n }\n}\n",
        "{}",
    );
    let jobs = sm.step();
    assert!(jobs.is_empty());
    assert!(sm.is_done());
    let failure = sm.failure().expect("failure");
    assert_eq!(failure.kind, "InputError");
    assert!(sm.outputs().is_none());
}

#[test]
fn optional_input_defaults_to_absent() {
    let mut sm = machine(
        "version 1.0\nworkflow w {\n  input { Int? x }\n  output { Int out = select_first([x, 42]) }\n}\n",
        "{}",
    );
    let outputs = run_to_completion(&mut sm);
    assert_eq!(outputs, vec![("out".to_string(), Value::Int(42))]);
}

#[test]
fn provided_optional_wins() {
    let mut sm = machine(
        "version 1.0\nworkflow w {\n  input { Int? x }\n  output { Int out = select_first([x, 42]) }\n}\n",
        r#"{"w.x": 7}"#,
    );
    let outputs = run_to_completion(&mut sm);
    assert_eq!(outputs, vec![("out".to_string(), Value::Int(7))]);
}

#[test]
fn eval_error_fails_the_run() {
    let mut sm = machine(
        "version 1.0\nworkflow w {\n  input { Int n }\n  Int bad = 1 / (n - n)\n  output { Int out = bad }\n}\n",
        r#"{"w.n": 3}"#,
    );
    sm.step();
    assert!(sm.is_done());
    assert_eq!(sm.failure().unwrap().kind, "EvalError");
}

// ---------------------------------------------------------------------------
// Scatter
// ---------------------------------------------------------------------------

#[test]
fn scatter_squares_in_index_order() {
    let mut sm = machine(
        "version 1.0\nworkflow squares {\n  scatter (i in range(4)) {\n    Int sq = (i + 1) * (i + 1)\n  }\n  output { Array[Int] out = sq }\n}\n",
        "{}",
    );
    let outputs = run_to_completion(&mut sm);
    let (name, value) = &outputs[0];
    assert_eq!(name, "out");
    assert_eq!(
        value.as_array().unwrap(),
        &[Value::Int(1), Value::Int(4), Value::Int(9), Value::Int(16)]
    );
}

#[test]
fn empty_scatter_gathers_empty_array() {
    let mut sm = machine(
        "version 1.0\nworkflow w {\n  scatter (i in range(0)) {\n    Int x = i\n  }\n  output { Array[Int] out = x }\n}\n",
        "{}",
    );
    let outputs = run_to_completion(&mut sm);
    assert_eq!(outputs[0].1.as_array().unwrap().len(), 0);
}

#[test]
fn nested_scatter_composes() {
    let mut sm = machine(
        "version 1.0\nworkflow w {\n  scatter (i in range(2)) {\n    scatter (j in range(3)) {\n      Int v = i * 3 + j\n    }\n  }\n  output { Array[Array[Int]] out = v }\n}\n",
        "{}",
    );
    let outputs = run_to_completion(&mut sm);
    let rows = outputs[0].1.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(
        rows[1].as_array().unwrap(),
        &[Value::Int(3), Value::Int(4), Value::Int(5)]
    );
}

// ---------------------------------------------------------------------------
// Conditionals
// ---------------------------------------------------------------------------

#[test]
fn false_conditional_yields_absent() {
    let mut sm = machine(
        "version 1.0\nworkflow w {\n  input { Boolean go }\n  if (go) {\n    Int x = 1\n  }\n  output { Int out = select_first([x, 99]) }\n}\n",
        r#"{"w.go": false}"#,
    );
    let outputs = run_to_completion(&mut sm);
    assert_eq!(outputs[0].1, Value::Int(99));
}

#[test]
fn true_conditional_yields_value() {
    let mut sm = machine(
        "version 1.0\nworkflow w {\n  input { Boolean go }\n  if (go) {\n    Int x = 1\n  }\n  output { Int out = select_first([x, 99]) }\n}\n",
        r#"{"w.go": true}"#,
    );
    let outputs = run_to_completion(&mut sm);
    assert_eq!(outputs[0].1, Value::Int(1));
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

const ADD_TASK: &str = "task add {\n  input { Int a\n Int b }\n  command <<<echo $(( ~{a} + ~{b} ))>>>\n  output { Int sum = read_int(stdout()) }\n}\n";

#[test]
fn call_jobs_are_emitted_and_completed() {
    let src = format!(
        "version 1.0\n{ADD_TASK}workflow w {{\n  call add {{ input: a = 1, b = 2 }}\n  output {{ Int out = add.sum }}\n}}\n"
    );
    let mut sm = machine(&src, "{}");

    let jobs = sm.step();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.call_name, "add");
    assert_eq!(job.callee, vec!["add".to_string()]);
    assert_eq!(
        job.inputs,
        vec![
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::Int(2)),
        ]
    );
    assert!(!sm.is_done());

    sm.complete(job.id, Ok(vec![("sum".to_string(), Value::Int(3))]));
    let more = sm.step();
    assert!(more.is_empty());
    assert!(sm.is_done());
    assert_eq!(sm.outputs().unwrap()[0].1, Value::Int(3));
}

#[test]
fn scattered_calls_gather_outputs_in_order() {
    let src = format!(
        "version 1.0\n{ADD_TASK}workflow w {{\n  scatter (i in range(3)) {{\n    call add {{ input: a = i, b = 10 }}\n  }}\n  output {{ Array[Int] out = add.sum }}\n}}\n"
    );
    let mut sm = machine(&src, "{}");

    let jobs = sm.step();
    assert_eq!(jobs.len(), 3);
    // Complete out of order; the gather must still be index-ordered.
    for job in jobs.iter().rev() {
        let a = job.inputs[0].1.as_int().unwrap();
        sm.complete(job.id, Ok(vec![("sum".to_string(), Value::Int(a + 10))]));
    }
    sm.step();
    assert!(sm.is_done());
    assert_eq!(
        sm.outputs().unwrap()[0].1.as_array().unwrap(),
        &[Value::Int(10), Value::Int(11), Value::Int(12)]
    );
}

#[test]
fn call_override_inputs_fill_unset_values() {
    let src = format!(
        "version 1.0\n{ADD_TASK}workflow w {{\n  call add {{ input: a = 1 }}\n  output {{ Int out = add.sum }}\n}}\n"
    );
    let mut sm = machine(&src, r#"{"w.add.b": 41}"#);
    let jobs = sm.step();
    assert_eq!(jobs[0].inputs.len(), 2);
    assert_eq!(jobs[0].inputs[1], ("b".to_string(), Value::Int(41)));
}

#[test]
fn dependent_calls_run_in_sequence() {
    let src = format!(
        "version 1.0\n{ADD_TASK}workflow w {{\n  call add {{ input: a = 1, b = 1 }}\n  call add as again {{ input: a = add.sum, b = 1 }}\n  output {{ Int out = again.sum }}\n}}\n"
    );
    let mut sm = machine(&src, "{}");

    let first = sm.step();
    assert_eq!(first.len(), 1, "second call must wait for the first");
    sm.complete(first[0].id, Ok(vec![("sum".to_string(), Value::Int(2))]));

    let second = sm.step();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].inputs[0].1, Value::Int(2));
    sm.complete(second[0].id, Ok(vec![("sum".to_string(), Value::Int(3))]));
    sm.step();
    assert_eq!(sm.outputs().unwrap()[0].1, Value::Int(3));
}

#[test]
fn failure_blocks_new_jobs() {
    let src = format!(
        "version 1.0\n{ADD_TASK}workflow w {{\n  call add {{ input: a = 1, b = 1 }}\n  call add as second {{ input: a = add.sum, b = 1 }}\n  output {{ Int out = second.sum }}\n}}\n"
    );
    let mut sm = machine(&src, "{}");
    let jobs = sm.step();
    sm.complete(
        jobs[0].id,
        Err(JobFailure {
            kind: "TaskFailure".to_string(),
            message: "exit 1".to_string(),
            exit_status: Some(1),
            stderr_path: None,
            attempts: 1,
        }),
    );
    assert!(sm.step().is_empty());
    assert!(sm.is_done());
    assert_eq!(sm.failure().unwrap().kind, "TaskFailure");
    assert!(sm.outputs().is_none());
}

#[test]
fn cancel_blocks_emission() {
    let src = format!(
        "version 1.0\n{ADD_TASK}workflow w {{\n  call add {{ input: a = 1, b = 1 }}\n  output {{ Int out = add.sum }}\n}}\n"
    );
    let mut sm = machine(&src, "{}");
    sm.cancel();
    assert!(sm.step().is_empty());
    assert!(sm.is_done());
    assert_eq!(sm.failure().unwrap().kind, "Interrupted");
}

#[test]
fn ready_jobs_are_in_document_order() {
    let src = format!(
        "version 1.0\n{ADD_TASK}workflow w {{\n  call add as alpha {{ input: a = 1, b = 1 }}\n  call add as beta {{ input: a = 2, b = 2 }}\n  output {{ Int out = alpha.sum + beta.sum }}\n}}\n"
    );
    let mut sm = machine(&src, "{}");
    let jobs = sm.step();
    let names: Vec<&str> = jobs.iter().map(|j| j.call_name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta"]);
}
