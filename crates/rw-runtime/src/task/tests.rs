use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use rw_config::RunnerConfig;
use rw_core::Value;
use rw_lang::ast::Document;

use crate::admission::Admission;
use crate::backend::{
    ChildTable, ContainerBackend, ContainerStatus, ImageHandle, RunHandle, RunSpec,
};
use crate::cache::CallCache;
use crate::error::RuntimeResult;

use super::*;

// ---------------------------------------------------------------------------
// A host-process backend for exercising the attempt chain without an
// engine: the "container" is a plain bash subprocess.
// ---------------------------------------------------------------------------

struct LocalExec {
    children: ChildTable,
}

impl LocalExec {
    fn new() -> Self {
        LocalExec {
            children: ChildTable::default(),
        }
    }
}

#[async_trait]
impl ContainerBackend for LocalExec {
    async fn prepare_image(&self, image: &str) -> RuntimeResult<ImageHandle> {
        Ok(ImageHandle(image.to_string()))
    }

    async fn run(&self, spec: &RunSpec) -> RuntimeResult<RunHandle> {
        let child = tokio::process::Command::new("bash")
            .arg("-c")
            .arg(spec.shell_line())
            .spawn()
            .expect("spawn bash");
        let id = self.children.insert(child);
        Ok(RunHandle {
            id,
            name: spec.container_name.clone(),
        })
    }

    async fn poll(&self, handle: &RunHandle) -> RuntimeResult<ContainerStatus> {
        self.children.poll(&handle.id)
    }

    async fn kill(&self, handle: &RunHandle) -> RuntimeResult<()> {
        self.children.kill(&handle.id);
        Ok(())
    }
}

fn test_config() -> Arc<RunnerConfig> {
    let cfg: RunnerConfig = "[task]\npoll_interval = \"10ms\"\n".parse().unwrap();
    Arc::new(cfg)
}

fn context(cache: Option<Arc<CallCache>>) -> TaskContext {
    let config = test_config();
    TaskContext {
        admission: Admission::new(&config.scheduler),
        backend: Arc::new(LocalExec::new()),
        cache,
        verbose: false,
        extra_env: Vec::new(),
        config,
    }
}

fn parse_task(source: &str) -> (Arc<Document>, Task) {
    let doc = Arc::new(rw_lang::parse_document(source, "task-test.wdl").expect("parse"));
    let task = doc.tasks[0].clone();
    (doc, task)
}

fn spec(
    doc: &Arc<Document>,
    task: &Task,
    call_dir: PathBuf,
    inputs: Vec<(String, Value)>,
) -> TaskSpec {
    TaskSpec {
        task: task.clone(),
        doc: Arc::clone(doc),
        call_dir,
        inputs,
        name: task.name.clone(),
    }
}

// ---------------------------------------------------------------------------
// End-to-end attempts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hello_task_produces_file_output() {
    let tmp = tempfile::tempdir().unwrap();
    let (doc, task) = parse_task(
        "version 1.0\ntask hello {\n  input { String who }\n  command <<<\n    echo \"Hello, ~{who}!\" > m.txt\n  >>>\n  output { File m = \"m.txt\" }\n}\n",
    );
    let ctx = context(None);
    let call_dir = tmp.path().join("call-hello");
    let outputs = run_task(
        &ctx,
        spec(&doc, &task, call_dir.clone(), vec![(
            "who".to_string(),
            Value::String("Alyssa".to_string()),
        )]),
        CancellationToken::new(),
    )
    .await
    .expect("task should succeed");

    let (name, value) = &outputs[0];
    assert_eq!(name, "m");
    let Value::File(path) = value else { panic!("expected File") };
    assert_eq!(std::fs::read_to_string(path).unwrap(), "Hello, Alyssa!\n");
    assert!(call_dir.join("outputs.json").exists());
    assert!(call_dir.join("work").exists());
    assert!(call_dir.join("stdout.txt").exists());
}

#[tokio::test]
async fn retry_preserves_attempt_dirs() {
    let tmp = tempfile::tempdir().unwrap();
    // Fails on the first attempt, succeeds on the second; the marker lives
    // in the (shared, mounted) call directory.
    let (doc, task) = parse_task(
        "version 1.0\ntask flaky {\n  command <<<\n    if [ -f ../marker ]; then exit 0; else touch ../marker; exit 1; fi\n  >>>\n  runtime { maxRetries: 1 }\n}\n",
    );
    let ctx = context(None);
    let call_dir = tmp.path().join("call-flaky");
    run_task(
        &ctx,
        spec(&doc, &task, call_dir.clone(), vec![]),
        CancellationToken::new(),
    )
    .await
    .expect("second attempt should succeed");

    assert!(call_dir.join("work").exists(), "first attempt preserved");
    assert!(call_dir.join("work2").exists(), "retry ran in work2");
    assert!(call_dir.join("outputs.json").exists());
}

#[tokio::test]
async fn exhausted_retries_fail_with_exit_status() {
    let tmp = tempfile::tempdir().unwrap();
    let (doc, task) = parse_task(
        "version 1.0\ntask nope {\n  command <<<exit 3>>>\n}\n",
    );
    let ctx = context(None);
    let call_dir = tmp.path().join("call-nope");
    let failure = run_task(
        &ctx,
        spec(&doc, &task, call_dir.clone(), vec![]),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(failure.kind, "TaskFailure");
    assert_eq!(failure.exit_status, Some(3));
    assert!(call_dir.join("error.json").exists());
    assert!(!call_dir.join("outputs.json").exists());
}

#[tokio::test]
async fn return_codes_star_accepts_any_exit() {
    let tmp = tempfile::tempdir().unwrap();
    let (doc, task) = parse_task(
        "version 1.0\ntask anyexit {\n  command <<<exit 7>>>\n  runtime { returnCodes: \"*\" }\n}\n",
    );
    let ctx = context(None);
    run_task(
        &ctx,
        spec(&doc, &task, tmp.path().join("call-anyexit"), vec![]),
        CancellationToken::new(),
    )
    .await
    .expect("any exit code is a success");
}

#[tokio::test]
async fn outward_file_output_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let outside = tmp.path().join("outside.txt");
    std::fs::write(&outside, "leak").unwrap();

    let src = format!(
        "version 1.0\ntask bad {{\n  command <<<true>>>\n  output {{ File f = \"{}\" }}\n}}\n",
        outside.display()
    );
    let (doc, task) = parse_task(&src);
    let ctx = context(None);
    let call_dir = tmp.path().join("call-bad");
    let failure = run_task(
        &ctx,
        spec(&doc, &task, call_dir.clone(), vec![]),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(failure.kind, "FilesystemError");
    assert!(!call_dir.join("outputs.json").exists());
    assert!(call_dir.join("error.json").exists());
}

#[tokio::test]
async fn stdout_collection_and_read_int() {
    let tmp = tempfile::tempdir().unwrap();
    let (doc, task) = parse_task(
        "version 1.0\ntask count {\n  input { Int n }\n  command <<<echo $(( ~{n} * 2 ))>>>\n  output { Int doubled = read_int(stdout()) }\n}\n",
    );
    let ctx = context(None);
    let outputs = run_task(
        &ctx,
        spec(
            &doc,
            &task,
            tmp.path().join("call-count"),
            vec![("n".to_string(), Value::Int(21))],
        ),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(outputs[0].1, Value::Int(42));
}

#[tokio::test]
async fn env_flagged_inputs_are_exported() {
    let tmp = tempfile::tempdir().unwrap();
    let (doc, task) = parse_task(
        "version development\ntask secret {\n  input { env String TOKEN }\n  command <<<echo \"$TOKEN\">>>\n  output { String echoed = read_string(stdout()) }\n}\n",
    );
    let ctx = context(None);
    let outputs = run_task(
        &ctx,
        spec(
            &doc,
            &task,
            tmp.path().join("call-secret"),
            vec![("TOKEN".to_string(), Value::String("it's a value".to_string()))],
        ),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(outputs[0].1, Value::String("it's a value".to_string()));
}

#[tokio::test]
async fn call_cache_short_circuits_second_run() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("lines.txt");
    std::fs::write(&input, "a\nb\nc\n").unwrap();

    let (doc, task) = parse_task(
        "version 1.0\ntask wc {\n  input { File f }\n  command <<<wc -l < ~{f} > n.txt>>>\n  output { Int n = read_int(\"n.txt\") }\n}\n",
    );
    let cache = Arc::new(
        CallCache::from_config(&rw_config::CallCacheConfig {
            get: true,
            put: true,
            dir: Some(tmp.path().join("cache")),
        })
        .unwrap(),
    );
    let ctx = context(Some(cache));
    let inputs = vec![(
        "f".to_string(),
        Value::File(input.to_string_lossy().into_owned()),
    )];

    let first_dir = tmp.path().join("call-wc-1");
    let first = run_task(
        &ctx,
        spec(&doc, &task, first_dir.clone(), inputs.clone()),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(first[0].1, Value::Int(3));
    assert!(first_dir.join("work").exists());

    // Second run: same digests → no container, no work directory.
    let second_dir = tmp.path().join("call-wc-2");
    let second = run_task(
        &ctx,
        spec(&doc, &task, second_dir.clone(), inputs.clone()),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(second[0].1, Value::Int(3));
    assert!(!second_dir.join("work").exists(), "cache hit must skip work/");
    assert!(second_dir.join("outputs.json").exists());

    // Touching the input invalidates the entry.
    std::thread::sleep(std::time::Duration::from_millis(20));
    std::fs::write(&input, "a\nb\nc\nd\n").unwrap();
    let third_dir = tmp.path().join("call-wc-3");
    let third = run_task(
        &ctx,
        spec(&doc, &task, third_dir.clone(), inputs),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(third[0].1, Value::Int(4));
    assert!(third_dir.join("work").exists(), "invalidated entry must re-run");
}

#[tokio::test]
async fn cancel_while_queued_on_admission_starts_no_container() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts `run()` invocations; any count above zero after a cancel is
    /// a started container that should not exist.
    struct CountingBackend {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl ContainerBackend for CountingBackend {
        async fn prepare_image(&self, image: &str) -> RuntimeResult<ImageHandle> {
            Ok(ImageHandle(image.to_string()))
        }

        async fn run(&self, spec: &RunSpec) -> RuntimeResult<RunHandle> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(RunHandle {
                id: "counted".to_string(),
                name: spec.container_name.clone(),
            })
        }

        async fn poll(&self, _handle: &RunHandle) -> RuntimeResult<ContainerStatus> {
            Ok(ContainerStatus::Exited(0))
        }

        async fn kill(&self, _handle: &RunHandle) -> RuntimeResult<()> {
            Ok(())
        }
    }

    let tmp = tempfile::tempdir().unwrap();
    let config: Arc<RunnerConfig> = Arc::new(
        "[scheduler]\ncpu = 1\n\n[task]\npoll_interval = \"10ms\"\n"
            .parse()
            .unwrap(),
    );
    let backend = Arc::new(CountingBackend {
        runs: AtomicUsize::new(0),
    });
    let ctx = TaskContext {
        admission: Admission::new(&config.scheduler),
        backend: backend.clone(),
        cache: None,
        verbose: false,
        extra_env: Vec::new(),
        config,
    };

    // Hold the whole CPU budget so the attempt queues on admission.
    let held = ctx.admission.acquire(1, 1 << 20).await;

    let (doc, task) = parse_task("version 1.0\ntask idle {\n  command <<<true>>>\n}\n");
    let cancel = CancellationToken::new();
    let run_fut = run_task(
        &ctx,
        spec(&doc, &task, tmp.path().join("call-idle"), vec![]),
        cancel.clone(),
    );
    tokio::pin!(run_fut);

    // Let the attempt reach the admission wait.
    tokio::select! {
        _ = &mut run_fut => panic!("attempt should be queued behind the held budget"),
        _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
    }

    // The signal arrives while queued, then killing siblings frees the
    // budget; the freed permit must not turn into a fresh container.
    cancel.cancel();
    drop(held);

    let failure = run_fut.await.unwrap_err();
    assert_eq!(failure.kind, "Interrupted");
    assert_eq!(
        backend.runs.load(Ordering::SeqCst),
        0,
        "no container may start after the cancel signal"
    );
}

#[tokio::test]
async fn missing_required_input_is_an_input_error() {
    let tmp = tempfile::tempdir().unwrap();
    let (doc, task) = parse_task(
        "version 1.0\ntask needy {\n  input { Int n }\n  command <<<echo ~{n}>>>\n}\n",
    );
    let ctx = context(None);
    let failure = run_task(
        &ctx,
        spec(&doc, &task, tmp.path().join("call-needy"), vec![]),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert_eq!(failure.kind, "InputError");
}

#[tokio::test]
async fn input_defaults_evaluate_in_dependency_order() {
    let tmp = tempfile::tempdir().unwrap();
    let (doc, task) = parse_task(
        "version 1.0\ntask chain {\n  input { Int a = b + 1\n Int b = 1 }\n  command <<<echo $(( ~{a} + ~{b} ))>>>\n  output { Int out = read_int(stdout()) }\n}\n",
    );
    let ctx = context(None);
    let outputs = run_task(
        &ctx,
        spec(&doc, &task, tmp.path().join("call-chain"), vec![]),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(outputs[0].1, Value::Int(3));
}
