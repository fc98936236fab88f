use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use fs2::FileExt;
use tokio_util::sync::CancellationToken;

use rw_config::RunnerConfig;
use rw_core::json::{RunInputs, check_required, outputs_json, parse_run_inputs};
use rw_core::{Stdlib, Value};
use rw_lang::ast::{Document, Task, Workflow};
use rw_lang::checker::{build_struct_env, resolve_type};
use rw_lang::graph::build_graph;
use rw_lang::types::Type;

use crate::admission::Admission;
use crate::backend::backend_for;
use crate::cache::CallCache;
use crate::download::DownloadOrchestrator;
use crate::driver::{JobExecutor, drive};
use crate::state::{CallJob, InstanceKey, JobFailure, StateMachine, TaskResult};
use crate::task::{TaskContext, TaskSpec, run_task};

// ---------------------------------------------------------------------------
// Options and outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Parent for the timestamped run directory; a path ending in `/.` is
    /// used verbatim.
    pub dir: Option<PathBuf>,
    /// Execute a single task instead of the workflow.
    pub task: Option<String>,
    pub copy_input_files: bool,
    pub verbose: bool,
    pub no_cache: bool,
    /// Extra container environment (`--env K=V`).
    pub env: Vec<(String, String)>,
}

/// Terminal state of one invocation.
#[derive(Debug)]
pub struct RunOutcome {
    pub dir: PathBuf,
    pub result: Result<serde_json::Value, RunErrorReport>,
}

#[derive(Debug, Clone)]
pub struct RunErrorReport {
    pub kind: String,
    pub message: String,
    pub exit_status: Option<i32>,
}

// ---------------------------------------------------------------------------
// RunDirector
// ---------------------------------------------------------------------------

/// Owns one top-level invocation: directory layout, the workflow log
/// flock, input decoding, download localization, the scheduler loop, and
/// result JSON.
pub struct RunDirector {
    config: Arc<RunnerConfig>,
    options: RunOptions,
}

impl RunDirector {
    pub fn new(config: Arc<RunnerConfig>, options: RunOptions) -> Self {
        RunDirector { config, options }
    }

    /// Create the run directory (timestamp-prefixed unless `--dir X/.`)
    /// and maintain the `_LAST` convenience symlink beside it.
    pub fn create_run_dir(&self, target: &str) -> anyhow::Result<PathBuf> {
        let run_dir = match &self.options.dir {
            // `--dir X/.` means "use X itself, no timestamp prefix".
            Some(dir) if dir.to_string_lossy().ends_with("/.") => {
                PathBuf::from(dir.to_string_lossy().trim_end_matches("/."))
            }
            other => {
                let parent = other.clone().unwrap_or_else(|| PathBuf::from("."));
                let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
                parent.join(format!("{stamp}_{target}"))
            }
        };
        std::fs::create_dir_all(&run_dir)?;

        if let Some(parent) = run_dir.parent() {
            let last = parent.join("_LAST");
            let _ = std::fs::remove_file(&last);
            #[cfg(unix)]
            let _ = std::os::unix::fs::symlink(&run_dir, &last);
        }
        Ok(run_dir)
    }

    /// Execute the loaded document against the given inputs inside an
    /// existing run directory. `cancel` is wired to the process signal
    /// handler by the CLI.
    pub async fn execute(
        &self,
        doc: Arc<Document>,
        inputs_json: &serde_json::Value,
        run_dir: &Path,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunOutcome> {
        // Advisory liveness lock for the run's lifetime.
        let log_path = run_dir.join(if self.options.task.is_some() {
            "task.log"
        } else {
            "workflow.log"
        });
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        log_file
            .try_lock_exclusive()
            .map_err(|e| anyhow::anyhow!("run directory is already in use: {e}"))?;

        self.copy_sources(&doc, run_dir)?;
        std::fs::write(
            run_dir.join("inputs.json"),
            serde_json::to_string_pretty(inputs_json)?,
        )?;
        self.write_rerun_script(&doc, run_dir)?;

        // Decode namespaced inputs against the target's declared types.
        let mut scratch = Vec::new();
        let structs = build_struct_env(&doc, &mut scratch);
        let (target_name, input_decls): (String, Vec<(String, Type, bool)>) =
            match &self.options.task {
                Some(task_name) => {
                    let task = doc.task(task_name).ok_or_else(|| {
                        anyhow::anyhow!("no task named `{task_name}` in this document")
                    })?;
                    (
                        task.name.clone(),
                        task.inputs
                            .iter()
                            .map(|d| {
                                let ty = resolve_type(&d.ty, &structs, d.span, &mut scratch);
                                let required = d.expr.is_none() && !ty.optional;
                                (d.name.clone(), ty, required)
                            })
                            .collect(),
                    )
                }
                None => {
                    let wf = doc
                        .workflow
                        .as_ref()
                        .ok_or_else(|| anyhow::anyhow!("document has no workflow (use --task)"))?;
                    (
                        wf.name.clone(),
                        wf.inputs
                            .iter()
                            .map(|d| {
                                let ty = resolve_type(&d.ty, &structs, d.span, &mut scratch);
                                let required = d.expr.is_none() && !ty.optional;
                                (d.name.clone(), ty, required)
                            })
                            .collect(),
                    )
                }
            };
        let input_types: HashMap<String, Type> = input_decls
            .iter()
            .map(|(n, t, _)| (n.clone(), t.clone()))
            .collect();
        let required: Vec<String> = input_decls
            .iter()
            .filter(|(_, _, r)| *r)
            .map(|(n, _, _)| n.clone())
            .collect();

        let inputs = match parse_run_inputs(inputs_json, &target_name, &input_types)
            .and_then(|inputs| {
                check_required(&inputs, &target_name, &required)?;
                Ok(inputs)
            }) {
            Ok(inputs) => inputs,
            Err(e) => {
                let report = RunErrorReport {
                    kind: "InputError".to_string(),
                    message: e.to_string(),
                    exit_status: None,
                };
                self.write_error_json(run_dir, &report);
                return Ok(RunOutcome {
                    dir: run_dir.to_path_buf(),
                    result: Err(report),
                });
            }
        };

        // Shared task machinery.
        let mut config = (*self.config).clone();
        if self.options.copy_input_files {
            config.task.copy_input_files = true;
        }
        let config = Arc::new(config);
        let cache = if self.options.no_cache {
            None
        } else {
            CallCache::from_config(&config.call_cache).map(Arc::new)
        };
        let ctx = Arc::new(TaskContext {
            backend: backend_for(&config.container),
            admission: Admission::new(&config.scheduler),
            cache,
            verbose: self.options.verbose,
            extra_env: self.options.env.clone(),
            config: Arc::clone(&config),
        });

        // Localize URI inputs before anything schedules. The orchestrator
        // holds shared flocks on download-cache entries until the run ends.
        let mut downloader =
            DownloadOrchestrator::new(&ctx, run_dir, &config.download_cache);
        let inputs = match downloader.localize_inputs(inputs, &cancel).await {
            Ok(inputs) => inputs,
            Err(f) => {
                let report = RunErrorReport {
                    kind: f.kind,
                    message: f.message,
                    exit_status: f.exit_status,
                };
                self.write_error_json(run_dir, &report);
                return Ok(RunOutcome {
                    dir: run_dir.to_path_buf(),
                    result: Err(report),
                });
            }
        };

        let result = match &self.options.task {
            Some(task_name) => {
                let task = doc.task(task_name).expect("checked above").clone();
                self.execute_bare_task(&ctx, &doc, task, inputs, run_dir, cancel)
                    .await
            }
            None => {
                let wf = doc.workflow.as_ref().expect("checked above");
                self.execute_workflow(&ctx, &doc, wf, inputs, run_dir, cancel)
                    .await
            }
        };

        match result {
            Ok(outputs) => {
                let qualified = outputs_json(&target_name, &outputs);
                let payload = serde_json::json!({
                    "outputs": qualified,
                    "dir": run_dir.to_string_lossy(),
                });
                std::fs::write(
                    run_dir.join("outputs.json"),
                    serde_json::to_string_pretty(&payload)?,
                )?;
                crate::task::link_output_tree(&run_dir.join("out"), &outputs);
                rw_info!(sys, dir = %run_dir.display(), "run succeeded");
                Ok(RunOutcome {
                    dir: run_dir.to_path_buf(),
                    result: Ok(payload),
                })
            }
            Err(report) => {
                self.write_error_json(run_dir, &report);
                rw_error!(sys, kind = %report.kind, message = %report.message, "run failed");
                Ok(RunOutcome {
                    dir: run_dir.to_path_buf(),
                    result: Err(report),
                })
            }
        }
    }

    async fn execute_bare_task(
        &self,
        ctx: &Arc<TaskContext>,
        doc: &Arc<Document>,
        task: Task,
        inputs: RunInputs,
        run_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<Vec<(String, Value)>, RunErrorReport> {
        let call_dir = run_dir.join(format!("call-{}", task.name));
        let provided: Vec<(String, Value)> = inputs.direct.into_iter().collect();
        let name = task.name.clone();
        run_task(
            ctx,
            TaskSpec {
                task,
                doc: Arc::clone(doc),
                call_dir,
                inputs: provided,
                name,
            },
            cancel,
        )
        .await
        .map_err(report_from_failure)
    }

    async fn execute_workflow(
        &self,
        ctx: &Arc<TaskContext>,
        doc: &Arc<Document>,
        wf: &Workflow,
        inputs: RunInputs,
        run_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<Vec<(String, Value)>, RunErrorReport> {
        let mut scratch = Vec::new();
        let structs = build_struct_env(doc, &mut scratch);
        let graph = build_graph(wf, doc, &structs).map_err(|e| RunErrorReport {
            kind: "TypeError".to_string(),
            message: e.to_string(),
            exit_status: None,
        })?;

        let stdlib = Stdlib::new(
            run_dir.join("write_"),
            Arc::new(rw_core::IdentityMapper),
        );
        let sm = StateMachine::new(
            Arc::clone(doc),
            Arc::new(graph),
            stdlib,
            inputs,
            self.config.scheduler.fail_slow,
        );
        let executor = Arc::new(RunnerExecutor {
            ctx: Arc::clone(ctx),
            doc: Arc::clone(doc),
            run_dir: run_dir.to_path_buf(),
            fail_slow: self.config.scheduler.fail_slow,
        });

        let done = drive(sm, executor, cancel).await;
        match done.outputs() {
            Some(outputs) => Ok(outputs),
            None => {
                let failure = done.failure();
                Err(RunErrorReport {
                    kind: failure.map(|f| f.kind.clone()).unwrap_or_else(|| "RunFailure".into()),
                    message: failure
                        .map(|f| f.message.clone())
                        .unwrap_or_else(|| "workflow did not complete".into()),
                    exit_status: failure.and_then(|f| f.exit_status),
                })
            }
        }
    }

    // -- run directory contents ----------------------------------------

    /// Copy the executed source and its import tree into `wdl/`.
    fn copy_sources(&self, doc: &Document, run_dir: &Path) -> anyhow::Result<()> {
        let wdl_dir = run_dir.join("wdl");
        std::fs::create_dir_all(&wdl_dir)?;
        copy_doc_source(doc, &wdl_dir)?;
        Ok(())
    }

    fn write_rerun_script(&self, doc: &Document, run_dir: &Path) -> anyhow::Result<()> {
        let source_name = file_basename(&doc.uri);
        let mut script = String::from("#!/bin/sh\n# Re-invoke this run with identical inputs.\n");
        script.push_str(&format!(
            "exec runwdl run \"$(dirname \"$0\")/wdl/{source_name}\" -i \"$(dirname \"$0\")/inputs.json\""
        ));
        if let Some(task) = &self.options.task {
            script.push_str(&format!(" --task {task}"));
        }
        if self.options.copy_input_files {
            script.push_str(" --copy-input-files");
        }
        script.push('\n');
        let path = run_dir.join("rerun");
        std::fs::write(&path, script)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        }
        Ok(())
    }

    fn write_error_json(&self, run_dir: &Path, report: &RunErrorReport) {
        let json = serde_json::json!({
            "error": report.kind,
            "message": report.message,
            "cause": {
                "exit_status": report.exit_status,
            },
        });
        let _ = std::fs::write(
            run_dir.join("error.json"),
            serde_json::to_string_pretty(&json).unwrap_or_default(),
        );
    }
}

fn copy_doc_source(doc: &Document, wdl_dir: &Path) -> anyhow::Result<()> {
    let dest = wdl_dir.join(file_basename(&doc.uri));
    if !dest.exists() {
        std::fs::write(&dest, &doc.source)?;
    }
    for import in &doc.imports {
        if let Some(child) = &import.doc {
            copy_doc_source(child, wdl_dir)?;
        }
    }
    Ok(())
}

fn file_basename(uri: &str) -> String {
    uri.rsplit('/').next().unwrap_or(uri).to_string()
}

fn report_from_failure(f: JobFailure) -> RunErrorReport {
    RunErrorReport {
        kind: f.kind,
        message: f.message,
        exit_status: f.exit_status,
    }
}

// ---------------------------------------------------------------------------
// RunnerExecutor — calls become tasks or nested workflows
// ---------------------------------------------------------------------------

enum CalleeDef {
    Task(Task),
    Workflow(Workflow),
}

fn resolve_callee(doc: &Arc<Document>, path: &[String]) -> Option<(Arc<Document>, CalleeDef)> {
    match path {
        [single] => doc
            .task(single)
            .map(|t| (Arc::clone(doc), CalleeDef::Task(t.clone()))),
        [ns, rest @ ..] => {
            let import = doc.import(ns)?;
            let child = import.doc.as_ref()?;
            if rest.len() == 1 {
                if let Some(t) = child.task(&rest[0]) {
                    return Some((Arc::clone(child), CalleeDef::Task(t.clone())));
                }
                if let Some(wf) = child.workflow.as_ref().filter(|w| w.name == rest[0]) {
                    return Some((Arc::clone(child), CalleeDef::Workflow(wf.clone())));
                }
                return None;
            }
            resolve_callee(child, rest)
        }
        [] => None,
    }
}

/// Per-run executor: resolves each ready call to a task attempt chain or
/// a recursive sub-workflow run in its own `call-NAME` directory.
struct RunnerExecutor {
    ctx: Arc<TaskContext>,
    doc: Arc<Document>,
    run_dir: PathBuf,
    fail_slow: bool,
}

fn call_dir_name(key: &InstanceKey, call_name: &str) -> String {
    let mut name = format!("call-{call_name}");
    for idx in &key.path {
        name.push_str(&format!("-{idx}"));
    }
    name
}

#[async_trait]
impl JobExecutor for RunnerExecutor {
    async fn execute(&self, job: CallJob, task_cancel: CancellationToken) -> TaskResult {
        let Some((callee_doc, callee)) = resolve_callee(&self.doc, &job.callee) else {
            return Err(JobFailure {
                kind: "TypeError".to_string(),
                message: format!("cannot resolve callee `{}`", job.callee.join(".")),
                exit_status: None,
                stderr_path: None,
                attempts: 0,
            });
        };
        let call_dir = self.run_dir.join(call_dir_name(&job.key, &job.call_name));

        match callee {
            CalleeDef::Task(task) => {
                run_task(
                    &self.ctx,
                    TaskSpec {
                        task,
                        doc: callee_doc,
                        call_dir,
                        inputs: job.inputs,
                        name: job.call_name,
                    },
                    task_cancel,
                )
                .await
            }
            CalleeDef::Workflow(wf) => {
                self.run_sub_workflow(callee_doc, wf, job, call_dir, task_cancel)
                    .await
            }
        }
    }
}

impl RunnerExecutor {
    async fn run_sub_workflow(
        &self,
        doc: Arc<Document>,
        wf: Workflow,
        job: CallJob,
        call_dir: PathBuf,
        task_cancel: CancellationToken,
    ) -> TaskResult {
        std::fs::create_dir_all(&call_dir).map_err(|e| JobFailure {
            kind: "FilesystemError".to_string(),
            message: format!("{}: {e}", call_dir.display()),
            exit_status: None,
            stderr_path: None,
            attempts: 0,
        })?;

        let mut scratch = Vec::new();
        let structs = build_struct_env(&doc, &mut scratch);
        let graph = build_graph(&wf, &doc, &structs).map_err(|e| JobFailure {
            kind: "TypeError".to_string(),
            message: e.to_string(),
            exit_status: None,
            stderr_path: None,
            attempts: 0,
        })?;

        let inputs = RunInputs {
            direct: job.inputs.into_iter().collect(),
            calls: HashMap::new(),
        };
        let stdlib = Stdlib::new(
            call_dir.join("write_"),
            Arc::new(rw_core::IdentityMapper),
        );
        let sm = StateMachine::new(doc.clone(), Arc::new(graph), stdlib, inputs, self.fail_slow);

        let executor = Arc::new(RunnerExecutor {
            ctx: Arc::clone(&self.ctx),
            doc,
            run_dir: call_dir,
            fail_slow: self.fail_slow,
        });
        let done = drive(sm, executor, task_cancel).await;
        match done.outputs() {
            Some(outputs) => Ok(outputs),
            None => {
                let failure = done.failure();
                Err(JobFailure {
                    kind: failure.map(|f| f.kind.clone()).unwrap_or_else(|| "RunFailure".into()),
                    message: failure
                        .map(|f| f.message.clone())
                        .unwrap_or_else(|| "sub-workflow did not complete".into()),
                    exit_status: failure.and_then(|f| f.exit_status),
                    stderr_path: None,
                    attempts: 1,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Translate SIGINT/SIGTERM into cooperative cancellation; a second
/// signal escalates to an immediate exit after the backends have been
/// asked to kill.
pub async fn wait_for_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to listen for SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                rw_info!(sys, signal = "SIGINT", "received signal, cancelling run");
            }
            _ = sigterm.recv() => {
                rw_info!(sys, signal = "SIGTERM", "received signal, cancelling run");
            }
        }
        cancel.cancel();

        // Second signal: stop waiting for graceful drain.
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        rw_warn!(sys, "second signal received, exiting immediately");
        std::process::exit(130);
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl-C");
        cancel.cancel();
    }
}
