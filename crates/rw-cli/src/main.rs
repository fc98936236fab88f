use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use rw_config::RunnerConfig;
use rw_lang::checker::lint::lint_document;
use rw_lang::checker::{CheckOptions, check_document, is_clean};
use rw_lang::{CheckError, FileResolver, Severity, load_document};
use rw_runtime::director::wait_for_signal;
use rw_runtime::{RunDirector, RunOptions};

mod inputs;

// ---------------------------------------------------------------------------
// CLI surface
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "runwdl", about = "Local WDL workflow runner", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow (or, with --task, a single task)
    Run {
        /// WDL source file
        source: PathBuf,
        /// NAME=VALUE inputs (repeat a NAME to build an array)
        #[arg(value_name = "INPUTS")]
        input_pairs: Vec<String>,
        /// Run directory (timestamped subdirectory unless it ends in /.)
        #[arg(long)]
        dir: Option<PathBuf>,
        /// JSON inputs file
        #[arg(short = 'i', long = "input")]
        input_file: Option<PathBuf>,
        /// Run this task instead of the workflow
        #[arg(long)]
        task: Option<String>,
        /// Copy input files into the work directory instead of mounting
        #[arg(long)]
        copy_input_files: bool,
        /// Echo task stdout samples to the console
        #[arg(long, short)]
        verbose: bool,
        /// Disable the call cache for this run
        #[arg(long)]
        no_cache: bool,
        /// Force an empty array for this input
        #[arg(long, value_name = "NAME")]
        empty: Vec<String>,
        /// Force an absent optional for this input
        #[arg(long, value_name = "NAME")]
        none: Vec<String>,
        /// Extra container environment variables (K or K=V)
        #[arg(long, value_name = "K[=V]")]
        env: Vec<String>,
    },

    /// Parse, typecheck, and lint a WDL document
    Check {
        source: PathBuf,
        /// Additional import roots (allows imports outside the source dir)
        #[arg(long = "path", short = 'p')]
        paths: Vec<PathBuf>,
        /// Exit non-zero on warnings too
        #[arg(long)]
        strict: bool,
        /// Suppress warning kinds (comma-separated keys)
        #[arg(long, value_delimiter = ',')]
        suppress: Vec<String>,
        /// Ignore all suppressions
        #[arg(long)]
        no_suppress: bool,
        /// Relax the T? -> T quantifier check
        #[arg(long)]
        no_quant_check: bool,
    },

    /// Print a JSON skeleton of a document's required inputs
    InputTemplate { source: PathBuf },

    /// Pre-populate the download cache for a source + inputs pair
    Localize { source: PathBuf, inputs: PathBuf },

    /// Execute a canned trivial workflow end-to-end
    #[command(name = "run_self_test")]
    RunSelfTest {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("runwdl: error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn dispatch(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Run {
            source,
            input_pairs,
            dir,
            input_file,
            task,
            copy_input_files,
            verbose,
            no_cache,
            empty,
            none,
            env,
        } => cmd_run(
            source,
            input_pairs,
            dir,
            input_file,
            task,
            copy_input_files,
            verbose,
            no_cache,
            empty,
            none,
            env,
        ),
        Commands::Check {
            source,
            paths,
            strict,
            suppress,
            no_suppress,
            no_quant_check,
        } => cmd_check(source, paths, strict, suppress, no_suppress, no_quant_check),
        Commands::InputTemplate { source } => cmd_input_template(source),
        Commands::Localize { source, inputs } => cmd_localize(source, inputs),
        Commands::RunSelfTest { dir } => cmd_self_test(dir),
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    source: PathBuf,
    input_pairs: Vec<String>,
    dir: Option<PathBuf>,
    input_file: Option<PathBuf>,
    task: Option<String>,
    copy_input_files: bool,
    verbose: bool,
    no_cache: bool,
    empty: Vec<String>,
    none: Vec<String>,
    env: Vec<String>,
) -> Result<ExitCode> {
    let config = Arc::new(RunnerConfig::load()?);
    let doc = load_and_check(&source, &[], &CheckOptions::default())?;

    let target = match &task {
        Some(name) => name.clone(),
        None => doc
            .workflow
            .as_ref()
            .map(|w| w.name.clone())
            .or_else(|| {
                // A document holding exactly one task runs it directly.
                (doc.tasks.len() == 1).then(|| doc.tasks[0].name.clone())
            })
            .ok_or_else(|| anyhow::anyhow!("document has no workflow; pass --task"))?,
    };
    let task = task.or_else(|| {
        (doc.workflow.is_none() && doc.tasks.len() == 1).then(|| target.clone())
    });

    let inputs_json = inputs::assemble_inputs(
        &target,
        input_file.as_deref(),
        &input_pairs,
        &empty,
        &none,
    )?;
    let env = env
        .into_iter()
        .map(|e| match e.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => {
                let value = std::env::var(&e).unwrap_or_default();
                (e, value)
            }
        })
        .collect();

    let log_name = if task.is_some() { "task.log" } else { "workflow.log" };
    let options = RunOptions {
        dir,
        task,
        copy_input_files,
        verbose,
        no_cache,
        env,
    };
    let director = RunDirector::new(Arc::clone(&config), options);
    let run_dir = director.create_run_dir(&target)?;
    let _log_guard =
        rw_runtime::tracing_init::init_tracing(&config.logging, &run_dir.join(log_name))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let outcome = runtime.block_on(async {
        let cancel = CancellationToken::new();
        tokio::spawn(wait_for_signal(cancel.clone()));
        director.execute(doc, &inputs_json, &run_dir, cancel).await
    })?;

    match outcome.result {
        Ok(payload) => {
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(report) => {
            eprintln!("runwdl: {}: {}", report.kind, report.message);
            let code = match report.kind.as_str() {
                "TaskFailure" => report
                    .exit_status
                    .map(|c| (c.clamp(1, 255)) as u8)
                    .unwrap_or(1),
                _ => 2,
            };
            Ok(ExitCode::from(code))
        }
    }
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

fn cmd_check(
    source: PathBuf,
    paths: Vec<PathBuf>,
    strict: bool,
    suppress: Vec<String>,
    no_suppress: bool,
    no_quant_check: bool,
) -> Result<ExitCode> {
    let opts = CheckOptions {
        relaxed_quant: no_quant_check,
        suppress,
        no_suppress,
    };
    let doc = match load_and_check_diagnosing(&source, &paths, &opts) {
        Ok((doc, diags)) => {
            let lint = lint_document(&doc);
            let mut warnings = 0usize;
            for d in diags.iter().chain(lint.iter()) {
                print_diagnostic(&doc, d);
                if d.severity == Severity::Warning {
                    warnings += 1;
                }
            }
            if !is_clean(&diags) {
                return Ok(ExitCode::from(2));
            }
            if strict && warnings > 0 {
                return Ok(ExitCode::from(2));
            }
            doc
        }
        Err(e) => {
            eprintln!("{e}");
            return Ok(ExitCode::from(2));
        }
    };
    let tasks = doc.tasks.len();
    let workflows = doc.workflow.is_some() as usize;
    eprintln!("ok: {tasks} task(s), {workflows} workflow(s)");
    Ok(ExitCode::SUCCESS)
}

fn print_diagnostic(doc: &rw_lang::Document, d: &CheckError) {
    let pos = doc.pos(d.span);
    let tag = match d.severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
    };
    eprintln!("{pos}: {tag}[{}]: {}", d.kind.kind_str(), d.message);
}

// ---------------------------------------------------------------------------
// input-template
// ---------------------------------------------------------------------------

fn cmd_input_template(source: PathBuf) -> Result<ExitCode> {
    let doc = load_and_check(&source, &[], &CheckOptions::default())?;
    let (target, decls): (String, Vec<(String, String)>) = match &doc.workflow {
        Some(wf) => (
            wf.name.clone(),
            wf.required_inputs()
                .map(|d| (d.name.clone(), d.ty.to_string()))
                .collect(),
        ),
        None => {
            let task = doc
                .tasks
                .first()
                .ok_or_else(|| anyhow::anyhow!("document has no workflow or tasks"))?;
            (
                task.name.clone(),
                task.required_inputs()
                    .map(|d| (d.name.clone(), d.ty.to_string()))
                    .collect(),
            )
        }
    };
    let template = inputs::input_template(&target, decls.into_iter());
    println!("{}", serde_json::to_string_pretty(&template)?);
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// localize / run_self_test
// ---------------------------------------------------------------------------

fn cmd_localize(source: PathBuf, inputs_path: PathBuf) -> Result<ExitCode> {
    let config = Arc::new(RunnerConfig::load()?);
    if !config.download_cache.enabled {
        anyhow::bail!("download cache is not enabled in the configuration");
    }
    let doc = load_and_check(&source, &[], &CheckOptions::default())?;
    let text = std::fs::read_to_string(&inputs_path)?;
    let inputs_json: serde_json::Value = serde_json::from_str(&text)?;

    // Localization is a bare run that stops after the download phase: run
    // the director against a temp directory with downloads routed through
    // the shared cache.
    let tmp = std::env::temp_dir().join(format!("runwdl-localize-{}", std::process::id()));
    std::fs::create_dir_all(&tmp)?;

    let target = doc
        .workflow
        .as_ref()
        .map(|w| w.name.clone())
        .or_else(|| doc.tasks.first().map(|t| t.name.clone()))
        .ok_or_else(|| anyhow::anyhow!("document has no workflow or tasks"))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        use rw_runtime::download::DownloadOrchestrator;
        use rw_runtime::task::TaskContext;

        let ctx = TaskContext {
            backend: rw_runtime::backend::backend_for(&config.container),
            admission: rw_runtime::admission::Admission::new(&config.scheduler),
            cache: None,
            verbose: false,
            extra_env: Vec::new(),
            config: Arc::clone(&config),
        };
        let mut input_types = std::collections::HashMap::new();
        if let Some(wf) = &doc.workflow {
            for d in &wf.inputs {
                input_types.insert(d.name.clone(), d.ty.clone());
            }
        }
        let run_inputs =
            rw_core::json::parse_run_inputs(&inputs_json, &target, &input_types)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
        let mut orchestrator = DownloadOrchestrator::new(&ctx, &tmp, &config.download_cache);
        orchestrator
            .localize_inputs(run_inputs, &CancellationToken::new())
            .await
            .map_err(|f| anyhow::anyhow!("{}: {}", f.kind, f.message))?;
        anyhow::Ok(())
    })?;
    eprintln!("download cache populated");
    Ok(ExitCode::SUCCESS)
}

const SELF_TEST_WDL: &str = r#"version 1.0
task hello {
  input { String who }
  command <<<
    echo "Hello, ~{who}!" > message.txt
  >>>
  output { File message = "message.txt" }
}
workflow self_test {
  input { Array[String] names = ["Alyssa", "Ben"] }
  scatter (name in names) {
    call hello { input: who = name }
  }
  output { Array[File] messages = hello.message }
}
"#;

fn cmd_self_test(dir: Option<PathBuf>) -> Result<ExitCode> {
    let tmp = dir.unwrap_or_else(std::env::temp_dir);
    let source = tmp.join("runwdl_self_test.wdl");
    std::fs::write(&source, SELF_TEST_WDL)?;
    eprintln!("self test: running canned workflow via the configured backend");
    cmd_run(
        source,
        vec![],
        Some(tmp),
        None,
        None,
        true,
        true,
        true,
        vec![],
        vec![],
        vec![],
    )
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

fn load_and_check(
    source: &Path,
    extra_paths: &[PathBuf],
    opts: &CheckOptions,
) -> Result<Arc<rw_lang::Document>> {
    let (doc, diags) = load_and_check_diagnosing(source, extra_paths, opts)?;
    for d in &diags {
        print_diagnostic(&doc, d);
    }
    if !is_clean(&diags) {
        anyhow::bail!("document has type errors");
    }
    Ok(doc)
}

fn load_and_check_diagnosing(
    source: &Path,
    extra_paths: &[PathBuf],
    opts: &CheckOptions,
) -> Result<(Arc<rw_lang::Document>, Vec<CheckError>)> {
    let root = source
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    let mut resolver = FileResolver::new(root);
    // Extra --path roots relax the outside-import denial.
    resolver.allow_outside = !extra_paths.is_empty();

    let canonical = source
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("cannot open {}: {e}", source.display()))?;
    let doc = load_document(canonical.to_string_lossy().as_ref(), &resolver)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let diags = check_document(&doc, opts);
    Ok((doc, diags))
}
