use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::state::{CallJob, JobFailure, JobId, StateMachine, TaskResult};

// ---------------------------------------------------------------------------
// JobExecutor — how ready calls actually run
// ---------------------------------------------------------------------------

/// Executes one ready call: a container task attempt chain, or a nested
/// sub-workflow. Implementations observe `task_cancel` at their poll
/// points and return an `Interrupted` failure promptly after it fires.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: CallJob, task_cancel: CancellationToken) -> TaskResult;
}

// ---------------------------------------------------------------------------
// drive — the cooperative loop around the pure state machine
// ---------------------------------------------------------------------------

/// Advance a workflow to completion: emit ready jobs, execute them
/// concurrently, and fold completions back in arrival order. On
/// cancellation no new containers start; on failure the run drains
/// (immediately under fail-fast, after running siblings finish under
/// fail-slow).
pub async fn drive(
    mut sm: StateMachine,
    executor: Arc<dyn JobExecutor>,
    cancel: CancellationToken,
) -> StateMachine {
    let task_cancel = cancel.child_token();
    let (tx, mut rx) = mpsc::channel::<(JobId, TaskResult)>(64);
    let mut inflight = JoinSet::new();

    loop {
        for job in sm.step() {
            rw_info!(flow, job = %job.id, call = %job.key, "launching call");
            let executor = Arc::clone(&executor);
            let tx = tx.clone();
            let task_cancel = task_cancel.clone();
            let id = job.id;
            inflight.spawn(async move {
                let result = executor.execute(job, task_cancel).await;
                let _ = tx.send((id, result)).await;
            });
        }

        if sm.is_done() {
            break;
        }

        tokio::select! {
            Some((id, result)) = rx.recv() => {
                sm.complete(id, result);
                // Fail-fast: stop sibling containers as soon as one call
                // fails; fail-slow lets them finish (no new ones start
                // either way).
                if sm.failure().is_some() && !sm.is_cancelled() && !sm.fail_slow() {
                    task_cancel.cancel();
                }
            }
            _ = cancel.cancelled(), if !sm.is_cancelled() => {
                rw_info!(flow, "cancellation requested; draining running calls");
                sm.cancel();
                task_cancel.cancel();
            }
        }
    }

    // Reap any leftover executor tasks (their results are no-ops now).
    inflight.abort_all();
    while inflight.join_next().await.is_some() {}
    sm
}

/// A standard interrupted-job failure for executors observing cancel.
pub fn interrupted_failure(attempts: u32) -> JobFailure {
    JobFailure {
        kind: "Interrupted".to_string(),
        message: "cancelled".to_string(),
        exit_status: None,
        stderr_path: None,
        attempts,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rw_core::{Stdlib, Value};
    use rw_lang::checker::{CheckOptions, build_struct_env, check_document, is_clean};
    use rw_lang::graph::build_graph;

    use super::*;

    fn machine(source: &str, inputs_json: &str) -> StateMachine {
        let doc = Arc::new(rw_lang::parse_document(source, "driver-test.wdl").unwrap());
        let diags = check_document(&doc, &CheckOptions::default());
        assert!(is_clean(&diags), "checker errors: {diags:?}");
        let mut scratch = Vec::new();
        let structs = build_struct_env(&doc, &mut scratch);
        let wf = doc.workflow.as_ref().unwrap();
        let graph = Arc::new(build_graph(wf, &doc, &structs).unwrap());
        let mut input_types = HashMap::new();
        for d in &wf.inputs {
            input_types.insert(d.name.clone(), d.ty.clone());
        }
        let json: serde_json::Value = serde_json::from_str(inputs_json).unwrap();
        let inputs = rw_core::json::parse_run_inputs(&json, &wf.name, &input_types).unwrap();
        StateMachine::new(doc, graph, Stdlib::pure_only(), inputs, false)
    }

    /// Sums the two inputs, counting concurrent executions.
    struct AddExecutor {
        concurrent: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl JobExecutor for AddExecutor {
        async fn execute(&self, job: CallJob, _cancel: CancellationToken) -> TaskResult {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            let a = job.inputs[0].1.as_int().unwrap();
            let b = job.inputs[1].1.as_int().unwrap();
            Ok(vec![("sum".to_string(), Value::Int(a + b))])
        }
    }

    const ADD_TASK: &str = "task add {\n  input { Int a\n Int b }\n  command <<<echo $(( ~{a} + ~{b} ))>>>\n  output { Int sum = read_int(stdout()) }\n}\n";

    #[tokio::test]
    async fn drives_scattered_calls_in_parallel() {
        let src = format!(
            "version 1.0\n{ADD_TASK}workflow w {{\n  scatter (i in range(4)) {{\n    call add {{ input: a = i, b = 100 }}\n  }}\n  output {{ Array[Int] out = add.sum }}\n}}\n"
        );
        let sm = machine(&src, "{}");
        let executor = Arc::new(AddExecutor {
            concurrent: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let done = drive(sm, executor.clone(), CancellationToken::new()).await;
        let outputs = done.outputs().expect("outputs");
        assert_eq!(
            outputs[0].1.as_array().unwrap(),
            &[
                Value::Int(100),
                Value::Int(101),
                Value::Int(102),
                Value::Int(103)
            ]
        );
        assert!(
            executor.peak.load(Ordering::SeqCst) > 1,
            "scattered calls should overlap"
        );
    }

    /// Always fails; records how many jobs were attempted.
    struct FailingExecutor {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl JobExecutor for FailingExecutor {
        async fn execute(&self, _job: CallJob, _cancel: CancellationToken) -> TaskResult {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(JobFailure {
                kind: "TaskFailure".to_string(),
                message: "exit 1".to_string(),
                exit_status: Some(1),
                stderr_path: None,
                attempts: 1,
            })
        }
    }

    #[tokio::test]
    async fn failure_drains_without_new_jobs() {
        let src = format!(
            "version 1.0\n{ADD_TASK}workflow w {{\n  call add {{ input: a = 1, b = 1 }}\n  call add as second {{ input: a = add.sum, b = 1 }}\n  output {{ Int out = second.sum }}\n}}\n"
        );
        let sm = machine(&src, "{}");
        let executor = Arc::new(FailingExecutor {
            attempts: AtomicUsize::new(0),
        });

        let done = drive(sm, executor.clone(), CancellationToken::new()).await;
        assert_eq!(done.failure().unwrap().kind, "TaskFailure");
        // The dependent call never launched.
        assert_eq!(executor.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_emission() {
        let src = format!(
            "version 1.0\n{ADD_TASK}workflow w {{\n  call add {{ input: a = 1, b = 1 }}\n  output {{ Int out = add.sum }}\n}}\n"
        );
        let sm = machine(&src, "{}");

        /// Blocks until cancelled.
        struct HangingExecutor;
        #[async_trait]
        impl JobExecutor for HangingExecutor {
            async fn execute(&self, _job: CallJob, cancel: CancellationToken) -> TaskResult {
                cancel.cancelled().await;
                Err(interrupted_failure(1))
            }
        }

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let done = drive(sm, Arc::new(HangingExecutor), cancel).await;
        assert_eq!(done.failure().unwrap().kind, "Interrupted");
    }
}
