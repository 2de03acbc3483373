//! Task Run Engine.
//!
//! Materializes one accepted `start`/`extract` command into a wrapper
//! invocation: resolves the wrapper, builds the task environment, writes
//! the startup script through the variable encoder, launches the
//! interpreter through `process`, waits for it (racing an abort signal),
//! and converts the outcome into the wire request the run-status actor
//! enqueues. `execute` handles exactly one run end to end; `status` owns
//! the actor wiring that invokes it and the abort signal it races
//! against.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::backoff::BackoffSchedule;
use crate::config::AgentConfig;
use crate::errors::{Aborted, TaskRunError};
use crate::factory::{self, RunKind, WrapperFlavor};
use crate::process::{self, ProcessSpec};
use crate::protocol::{self, ExecuteRunInfo, ExtractRunInfo};
use crate::queue::{OutgoingRequest, RequestQueueHandle};
use crate::result::{ResultCode, TaskResult};
use crate::vars::{self, Environment, Value};

/// One accepted command, owned by its run for the run's whole lifetime.
#[derive(Debug, Clone)]
pub enum RunDescriptor {
    Execution(ExecuteRunInfo),
    Extraction(ExtractRunInfo),
}

impl RunDescriptor {
    pub fn run_kind(&self) -> RunKind {
        match self {
            RunDescriptor::Execution(_) => RunKind::Execution,
            RunDescriptor::Extraction(_) => RunKind::Extraction,
        }
    }

    fn task(&self) -> &protocol::Task {
        match self {
            RunDescriptor::Execution(info) => &info.task,
            RunDescriptor::Extraction(info) => &info.task,
        }
    }

    fn inputs(&self) -> &IndexMap<String, protocol::Input> {
        match self {
            RunDescriptor::Execution(info) => &info.inputs,
            RunDescriptor::Extraction(info) => &info.inputs,
        }
    }

    fn outputs(&self) -> &[String] {
        match self {
            RunDescriptor::Execution(info) => &info.outputs,
            RunDescriptor::Extraction(info) => &info.outputs,
        }
    }

    fn wrapper_name(&self) -> Option<&str> {
        self.task().parameter("sf.wrapper")
    }
}

/// A cooperative, idempotent abort signal shared between the run-status
/// actor and the worker task executing one run. `request` is safe to
/// call any number of times, from any task.
#[derive(Clone)]
pub struct AbortSignal {
    notify: Arc<Notify>,
    requested: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            self.notify.notify_one();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        if self.is_requested() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

static SANITIZE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\W").expect("valid sanitize regex"));

/// `sanitize(taskId)`: non-word characters become `_`; a leading digit
/// gets an `X` prefix so the result is a legal identifier in every
/// target language's variable syntax.
fn sanitize(task_id: &str) -> String {
    let replaced = SANITIZE_RE.replace_all(task_id, "_").to_string();
    match replaced.chars().next() {
        Some(c) if c.is_ascii_digit() => format!("X{replaced}"),
        _ => replaced,
    }
}

fn startup_extension(language: &str) -> &'static str {
    match language {
        "shell" => "sh",
        "batch" => "bat",
        "make" => "mk",
        "perl" => "pl",
        "python" => "py",
        "ruby" => "rb",
        "ant" => "xml",
        "nant" => "build",
        "wsh" => "wsf",
        other => unreachable!("unknown wrapper language {other}"),
    }
}

/// Runs one command end to end and returns the wire request to report
/// back to the coordinator, or `None` when nothing should be reported —
/// an extraction run with no extractor wrapper configured is silently
/// skipped, and a `Result{code: ignore}` suppresses the report too.
pub async fn execute(
    descriptor: RunDescriptor,
    config: Arc<AgentConfig>,
    queue: RequestQueueHandle,
    windows: bool,
    abort: AbortSignal,
) -> Option<OutgoingRequest> {
    let result = run_one(&descriptor, &config, &queue, windows, &abort).await;

    if result.is_ignored() {
        return None;
    }

    Some(match &descriptor {
        RunDescriptor::Execution(info) => protocol::build_task_done_execution(&info.run, &result),
        RunDescriptor::Extraction(info) => {
            protocol::build_task_done_extraction(&info.shadow_id, &result)
        }
    })
}

async fn run_one(
    descriptor: &RunDescriptor,
    config: &Arc<AgentConfig>,
    queue: &RequestQueueHandle,
    windows: bool,
    abort: &AbortSignal,
) -> TaskResult {
    let run_kind = descriptor.run_kind();
    let Some(wrapper_name) = descriptor.wrapper_name() else {
        return TaskResult::error("task parameter 'sf.wrapper' is not set");
    };

    let resolved = factory::resolve(
        &config.wrapper_dirs,
        wrapper_name,
        WrapperFlavor::Normal(run_kind),
        windows,
    );
    let resolved = match (resolved, run_kind) {
        (Some(r), _) => r,
        (None, RunKind::Extraction) => {
            info!(wrapper = %wrapper_name, "no extractor wrapper configured, skipping extraction");
            return TaskResult {
                code: Some(ResultCode::Ignore),
                ..Default::default()
            };
        }
        (None, RunKind::Execution) => {
            return TaskResult::error(TaskRunError::NoWrapper(wrapper_name.to_string()).cause_chain());
        }
    };

    let output_dir = output_dir_for(descriptor, config);
    if let Err(err) = create_output_dir(&output_dir).await {
        return TaskResult::error(err.cause_chain());
    }

    advertise_report_url(descriptor, config, queue);

    let flavor_files = WrapperFlavor::Normal(run_kind).files();
    let results_file = flavor_files.results_file.map(|f| output_dir.join(f));

    let environment = match build_environment(descriptor, config, &output_dir, &resolved.path, results_file.as_deref()) {
        Ok(env) => env,
        Err(err) => return TaskResult::error(err.cause_chain()),
    };

    let startup_path = output_dir.join(format!(
        "{}.{}",
        flavor_files.startup_basename,
        startup_extension(resolved.language)
    ));
    if let Err(err) = write_startup_script(resolved.language, &environment, &resolved.path, &startup_path) {
        return TaskResult::error(err.cause_chain());
    }

    let (argv, env_deltas) =
        build_invocation(resolved.language, &output_dir, &resolved.path, &startup_path);

    let log_label = format!("{wrapper_name}/{}", flavor_files.log_file);
    let spec = ProcessSpec {
        argv,
        working_dir: output_dir.clone(),
        env: env_deltas,
        process_wrapper: config.generic.process_wrapper.clone(),
        log_label,
    };

    let running = match process::start(spec).await {
        Ok(p) => p,
        Err(err) => return TaskResult::error(TaskRunError::Launch(err).cause_chain()),
    };

    let abort_handle = running.abort_handle();
    let wait_future = running.wait();
    tokio::pin!(wait_future);

    let exit_code = tokio::select! {
        code = &mut wait_future => code,
        _ = abort.wait() => {
            spawn_abort_wrapper(descriptor.clone(), config.clone(), output_dir.clone(), windows);
            abort_handle.abort().await;
            wait_future.await
        }
    };

    if abort.is_requested() {
        return TaskResult::error(Aborted.to_string());
    }

    let exit_code = match exit_code {
        Ok(code) => code,
        Err(err) => return TaskResult::error(TaskRunError::Launch(err).cause_chain()),
    };

    if let Some(result) = TaskResult::from_wrapper_exit_code(exit_code) {
        return result;
    }

    let Some(results_path) = results_file else {
        return TaskResult::default();
    };

    match crate::result::parse_file(&results_path) {
        Ok(Ok(result)) => result,
        Ok(Err(parse_err)) => TaskResult::error(TaskRunError::from(parse_err).cause_chain()),
        Err(io_err) if io_err.kind() == std::io::ErrorKind::NotFound => {
            TaskResult::error(TaskRunError::MissingResultsFile(results_path.display().to_string()).cause_chain())
        }
        Err(io_err) => TaskResult::error(
            TaskRunError::ResultsFile {
                path: results_path.display().to_string(),
                source: io_err,
            }
            .cause_chain(),
        ),
    }
}

/// Resolves and launches the `_abort` companion wrapper, if any, without
/// blocking the caller — the main child is terminated regardless of
/// whether an abort wrapper exists or how it finishes.
fn spawn_abort_wrapper(
    descriptor: RunDescriptor,
    config: Arc<AgentConfig>,
    output_dir: PathBuf,
    windows: bool,
) {
    tokio::spawn(async move {
        let Some(wrapper_name) = descriptor.wrapper_name() else {
            return;
        };
        let run_kind = descriptor.run_kind();
        let Some(resolved) = factory::resolve(
            &config.wrapper_dirs,
            wrapper_name,
            WrapperFlavor::Abort(run_kind),
            windows,
        ) else {
            return;
        };

        let flavor_files = WrapperFlavor::Abort(run_kind).files();
        let environment = match build_environment(&descriptor, &config, &output_dir, &resolved.path, None) {
            Ok(env) => env,
            Err(err) => {
                warn!(error = %err, "failed to build abort wrapper environment");
                return;
            }
        };

        let startup_path = output_dir.join(format!(
            "{}.{}",
            flavor_files.startup_basename,
            startup_extension(resolved.language)
        ));
        if let Err(err) = write_startup_script(resolved.language, &environment, &resolved.path, &startup_path) {
            warn!(error = %err, "failed to write abort startup script");
            return;
        }

        let (argv, env_deltas) =
            build_invocation(resolved.language, &output_dir, &resolved.path, &startup_path);
        let spec = ProcessSpec {
            argv,
            working_dir: output_dir.clone(),
            env: env_deltas,
            process_wrapper: config.generic.process_wrapper.clone(),
            log_label: format!("{wrapper_name}/{}", flavor_files.log_file),
        };

        match process::start(spec).await {
            Ok(running) => match running.wait().await {
                Ok(code) => info!(wrapper = %wrapper_name, exit_code = code, "abort wrapper finished"),
                Err(err) => warn!(error = %err, "abort wrapper wait failed"),
            },
            Err(err) => warn!(error = %err, "failed to launch abort wrapper"),
        }
    });
}

fn output_dir_for(descriptor: &RunDescriptor, config: &AgentConfig) -> PathBuf {
    match descriptor {
        RunDescriptor::Execution(info) => {
            let job_path = protocol::job_path(&info.run.job_id);
            config.output.report_base_dir.join(job_path).join(&info.run.task_id)
        }
        RunDescriptor::Extraction(info) => {
            config.output.report_base_dir.join("shadow").join(&info.shadow_id)
        }
    }
}

/// Advertises this run's report URL to the coordinator via `TaskReport`,
/// guarded by `output.reportBaseURL` being configured and only for
/// execution runs — an extraction is identified by `shadowId` alone,
/// with no `TaskReport` counterpart in the wire protocol. Best-effort:
/// enqueued like any other outgoing request, never awaited or allowed
/// to fail the run.
fn advertise_report_url(descriptor: &RunDescriptor, config: &AgentConfig, queue: &RequestQueueHandle) {
    let RunDescriptor::Execution(info) = descriptor else {
        return;
    };
    let Some(base_url) = &config.output.report_base_url else {
        return;
    };
    let report_url = report_url_for(base_url, &info.run.job_id, &info.run.task_id);
    let _ = queue.submit(protocol::build_task_report(&info.run, &report_url));
}

/// `reportBaseURL + jobPath + "/" + taskId + "/"`, the location of the
/// output directory as seen from the coordinator's side.
fn report_url_for(base_url: &str, job_id: &str, task_id: &str) -> String {
    let base_url = if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{base_url}/")
    };
    let job_path = protocol::job_path(job_id);
    format!("{base_url}{job_path}/{task_id}/")
}

async fn create_output_dir(dir: &Path) -> Result<(), TaskRunError> {
    let schedule = BackoffSchedule::output_dir_creation();
    schedule
        .retry(|_attempt| async move { std::fs::create_dir_all(dir) })
        .await
        .map_err(|source| TaskRunError::OutputDir {
            path: dir.display().to_string(),
            source,
        })
}

/// Builds the full `SF_*` environment tree for one run. `wrapper_path`
/// is the resolved wrapper file (used only to derive `SF_WRAPPER_ROOT`);
/// `results_file` is `None` when building the abort wrapper's
/// environment, which reports nothing.
fn build_environment(
    descriptor: &RunDescriptor,
    config: &AgentConfig,
    output_dir: &Path,
    wrapper_path: &Path,
    results_file: Option<&Path>,
) -> Result<Environment, TaskRunError> {
    let mut env: Environment = IndexMap::new();

    let wrapper_root = wrapper_path
        .parent()
        .and_then(Path::parent)
        .and_then(Path::parent)
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    env.insert("SF_REPORT_ROOT".into(), Value::str(config.output.report_base_dir.display().to_string()));
    env.insert("SF_PRODUCT_ROOT".into(), Value::str(config.output.product_base_dir.display().to_string()));
    env.insert("SF_WRAPPER_ROOT".into(), Value::str(wrapper_root));

    match descriptor {
        RunDescriptor::Execution(info) => {
            env.insert("SF_JOB_ID".into(), Value::str(info.run.job_id.clone()));
            env.insert("SF_TASK_ID".into(), Value::str(info.run.task_id.clone()));
        }
        RunDescriptor::Extraction(info) => {
            env.insert("SF_TASK_ID".into(), Value::str(info.shadow_id.clone()));
        }
    }
    env.insert("SF_TARGET".into(), Value::str(descriptor.task().target.clone()));
    env.insert("SF_CC_URL".into(), Value::str(config.control_center.server_base_url.clone()));

    let inputs = descriptor.inputs();
    let input_names: Vec<Value> = inputs.keys().map(|k| Value::str(k.clone())).collect();
    env.insert("SF_INPUTS".into(), Value::Seq(input_names));

    let mut prod: IndexMap<String, Value> = IndexMap::new();
    for (name, input) in inputs {
        env.insert(name.clone(), Value::str(input.locator.clone()));
        if input.is_combined() {
            let mut seen = std::collections::HashSet::new();
            let mut producers_map: IndexMap<String, Value> = IndexMap::new();
            for producer in input.producers.values() {
                let key = sanitize(&producer.task_id);
                if !seen.insert(key.clone()) {
                    return Err(TaskRunError::DuplicateSanitizedTaskId(key));
                }
                let mut rec: IndexMap<String, Value> = IndexMap::new();
                rec.insert("TASK".into(), Value::str(producer.task_id.clone()));
                rec.insert("RESULT".into(), Value::str(producer.result.clone().unwrap_or_default()));
                rec.insert("LOCATOR".into(), Value::str(producer.locator.clone()));
                producers_map.insert(key, Value::Map(rec));
            }
            prod.insert(name.clone(), Value::Map(producers_map));
        }
    }
    if !prod.is_empty() {
        env.insert("SF_PROD".into(), Value::Map(prod));
    }

    let mut sorted_outputs: Vec<String> = descriptor.outputs().to_vec();
    sorted_outputs.sort();
    env.insert(
        "SF_OUTPUTS".into(),
        Value::Seq(sorted_outputs.into_iter().map(Value::str).collect()),
    );

    if let RunDescriptor::Execution(info) = descriptor {
        let refs: Vec<Value> = info.resources.keys().map(|k| Value::str(k.clone())).collect();
        env.insert("SF_RESOURCES".into(), Value::Seq(refs));
        for (reference, resource) in &info.resources {
            env.insert(reference.clone(), Value::str(resource.locator.clone()));
        }
    }

    for (name, value) in &descriptor.task().parameters {
        if !name.starts_with("sf.") {
            env.insert(name.clone(), Value::str(value.clone()));
        }
    }

    if let Some(results_path) = results_file {
        env.insert("SF_RESULTS".into(), Value::str(results_path.display().to_string()));
    }

    for (name, value) in &config.parameters {
        env.insert(name.clone(), Value::str(value.clone()));
    }

    Ok(env)
}

fn write_startup_script(
    language: &str,
    env: &Environment,
    wrapper_path: &Path,
    startup_path: &Path,
) -> Result<(), TaskRunError> {
    let content = match language {
        "shell" => vars::lang::shell::render_startup_script(env, wrapper_path),
        "batch" => vars::lang::batch::render_startup_script(env, wrapper_path),
        "make" => vars::lang::make::render_startup_script(env, wrapper_path),
        "perl" => vars::lang::perl::render_startup_script(env, wrapper_path),
        "python" => vars::lang::python::render_startup_script(env, wrapper_path),
        "ruby" => vars::lang::ruby::render_startup_script(env, wrapper_path),
        "ant" => vars::lang::ant::render_startup_script(env, wrapper_path),
        "nant" => vars::lang::nant::render_startup_script(env, wrapper_path),
        "wsh" => {
            let common_scripts = common_scripts_for(wrapper_path);
            vars::lang::wsh::render_startup_script(env, wrapper_path, &common_scripts)
        }
        other => unreachable!("unknown wrapper language {other}"),
    };
    std::fs::write(startup_path, content).map_err(|source| TaskRunError::StartupScript {
        path: startup_path.display().to_string(),
        source,
    })
}

/// WSH wrapper directories keep shared helper scripts in a `common`
/// subdirectory; every `.vbs`/`.js` file there gets included in the
/// generated job script alongside the wrapper proper.
fn common_scripts_for(wrapper_path: &Path) -> Vec<PathBuf> {
    let Some(wrapper_dir) = wrapper_path.parent() else {
        return Vec::new();
    };
    let common_dir = wrapper_dir.join("common");
    let Ok(entries) = std::fs::read_dir(&common_dir) else {
        return Vec::new();
    };
    let mut scripts: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("vbs") | Some("js")))
        .collect();
    scripts.sort();
    scripts
}

/// Builds argv and the per-language environment deltas for launching
/// the generated startup script.
fn build_invocation(
    language: &str,
    output_dir: &Path,
    wrapper_path: &Path,
    startup_path: &Path,
) -> (Vec<String>, HashMap<String, String>) {
    let mut env_deltas = HashMap::new();
    let startup = startup_path.display().to_string();

    let argv = match language {
        "shell" => {
            let interpreter = factory::shell_interpreter(wrapper_path);
            vec![interpreter, startup]
        }
        "batch" => vec![startup],
        "make" => vec![
            "make".to_string(),
            "-C".to_string(),
            output_dir.display().to_string(),
            "-f".to_string(),
            startup,
        ],
        "perl" => {
            env_deltas.insert("PERL_UNICODE".to_string(), "SDA".to_string());
            vec!["perl".to_string(), "-w".to_string(), startup]
        }
        "python" => {
            env_deltas.insert("PYTHONIOENCODING".to_string(), "UTF-8".to_string());
            env_deltas.insert("PYTHONUTF8".to_string(), "1".to_string());
            vec!["python".to_string(), "-u".to_string(), startup]
        }
        "ruby" => vec![
            "ruby".to_string(),
            "--external-encoding=UTF-8".to_string(),
            startup,
        ],
        "ant" => vec!["ant".to_string(), "-f".to_string(), startup],
        "nant" => vec!["nant".to_string(), format!("-buildfile:{startup}")],
        "wsh" => vec!["CScript".to_string(), "//Nologo".to_string(), startup],
        other => unreachable!("unknown wrapper language {other}"),
    };

    (argv, env_deltas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControlCenterConfig, GenericConfig, OutputConfig};
    use crate::protocol::{Input, RunIdentity, Task};

    fn sample_config() -> AgentConfig {
        AgentConfig {
            control_center: ControlCenterConfig {
                server_base_url: "http://cc.example/".into(),
                token_id: "a".into(),
                token_pass: "b".into(),
            },
            output: OutputConfig {
                report_base_dir: PathBuf::from("/var/reports"),
                product_base_dir: PathBuf::from("/var/products"),
                report_base_url: None,
                product_base_url: None,
            },
            generic: GenericConfig {
                log_file: None,
                log_level: "INFO".into(),
                process_wrapper: None,
            },
            wrapper_dirs: vec![],
            parameters: HashMap::from([("SITE".to_string(), "factory-1".to_string())]),
        }
    }

    fn sample_execution() -> ExecuteRunInfo {
        let mut task = Task::default();
        task.target = "unit".into();
        task.parameters.insert("sf.wrapper".into(), "junit".into());
        task.parameters.insert("FOO".into(), "bar".into());

        let mut inputs = IndexMap::new();
        inputs.insert(
            "ARTIFACT".to_string(),
            Input {
                name: "ARTIFACT".into(),
                locator: "/var/products/artifact.jar".into(),
                producers: IndexMap::new(),
            },
        );

        ExecuteRunInfo {
            run: RunIdentity {
                job_id: "230101-1200-ABCD".into(),
                task_id: "build".into(),
                run_id: "0".into(),
            },
            task,
            inputs,
            outputs: vec!["report".into()],
            resources: IndexMap::new(),
        }
    }

    #[test]
    fn sanitize_replaces_non_word_characters() {
        assert_eq!(sanitize("build-42"), "build_42");
    }

    #[test]
    fn sanitize_prefixes_leading_digit() {
        assert_eq!(sanitize("42-build"), "X42_build");
    }

    #[test]
    fn output_dir_uses_job_path_and_task_id() {
        let config = sample_config();
        let descriptor = RunDescriptor::Execution(sample_execution());
        let dir = output_dir_for(&descriptor, &config);
        assert_eq!(dir, PathBuf::from("/var/reports/230101/1200-ABCD/build"));
    }

    #[test]
    fn extraction_output_dir_is_keyed_by_shadow_id() {
        let config = sample_config();
        let mut task = Task::default();
        task.parameters.insert("sf.wrapper".into(), "coverage".into());
        let descriptor = RunDescriptor::Extraction(ExtractRunInfo {
            shadow_id: "SID-7".into(),
            task,
            inputs: IndexMap::new(),
            outputs: vec![],
        });
        let dir = output_dir_for(&descriptor, &config);
        assert_eq!(dir, PathBuf::from("/var/reports/shadow/SID-7"));
    }

    #[test]
    fn build_environment_sets_core_sf_variables() {
        let config = sample_config();
        let descriptor = RunDescriptor::Execution(sample_execution());
        let output_dir = PathBuf::from("/var/reports/230101/1200-ABCD/build");
        let wrapper_path = PathBuf::from("/opt/wrappers/junit/wrapper.sh");
        let results_path = output_dir.join("results");

        let env = build_environment(&descriptor, &config, &output_dir, &wrapper_path, Some(&results_path)).unwrap();

        assert!(matches!(env.get("SF_JOB_ID"), Some(Value::Str(s)) if s == "230101-1200-ABCD"));
        assert!(matches!(env.get("SF_TASK_ID"), Some(Value::Str(s)) if s == "build"));
        assert!(matches!(env.get("SF_TARGET"), Some(Value::Str(s)) if s == "unit"));
        assert!(matches!(env.get("SF_WRAPPER_ROOT"), Some(Value::Str(s)) if s == "/opt/wrappers"));
        assert!(matches!(env.get("ARTIFACT"), Some(Value::Str(s)) if s == "/var/products/artifact.jar"));
        assert!(matches!(env.get("FOO"), Some(Value::Str(s)) if s == "bar"));
        assert!(env.get("sf.wrapper").is_none());
        assert!(matches!(env.get("SITE"), Some(Value::Str(s)) if s == "factory-1"));
        assert!(matches!(env.get("SF_RESULTS"), Some(Value::Str(_))));
    }

    #[test]
    fn combined_input_builds_sf_prod_tree() {
        let config = sample_config();
        let mut task = Task::default();
        task.parameters.insert("sf.wrapper".into(), "junit".into());

        let mut producers = IndexMap::new();
        producers.insert(
            "upstream-1".to_string(),
            protocol::Producer {
                task_id: "upstream-1".into(),
                locator: "/var/products/a.jar".into(),
                result: Some("ok".into()),
            },
        );
        let mut inputs = IndexMap::new();
        inputs.insert(
            "COMBINED".to_string(),
            Input {
                name: "COMBINED".into(),
                locator: "/var/products/combined".into(),
                producers,
            },
        );

        let descriptor = RunDescriptor::Execution(ExecuteRunInfo {
            run: RunIdentity { job_id: "J".into(), task_id: "T".into(), run_id: "0".into() },
            task,
            inputs,
            outputs: vec![],
            resources: IndexMap::new(),
        });

        let output_dir = PathBuf::from("/var/reports/J/T");
        let wrapper_path = PathBuf::from("/opt/wrappers/junit/wrapper.sh");
        let env = build_environment(&descriptor, &config, &output_dir, &wrapper_path, None).unwrap();

        match env.get("SF_PROD") {
            Some(Value::Map(prod)) => match prod.get("COMBINED") {
                Some(Value::Map(producers)) => {
                    assert!(producers.contains_key("upstream_1"));
                }
                other => panic!("expected nested map, got {other:?}"),
            },
            other => panic!("expected SF_PROD map, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_sanitized_producer_ids_are_rejected() {
        let config = sample_config();
        let mut task = Task::default();
        task.parameters.insert("sf.wrapper".into(), "junit".into());

        let mut producers = IndexMap::new();
        producers.insert(
            "a".to_string(),
            protocol::Producer { task_id: "a!".into(), locator: "x".into(), result: None },
        );
        producers.insert(
            "b".to_string(),
            protocol::Producer { task_id: "a?".into(), locator: "y".into(), result: None },
        );
        let mut inputs = IndexMap::new();
        inputs.insert(
            "COMBINED".to_string(),
            Input { name: "COMBINED".into(), locator: "z".into(), producers },
        );

        let descriptor = RunDescriptor::Execution(ExecuteRunInfo {
            run: RunIdentity { job_id: "J".into(), task_id: "T".into(), run_id: "0".into() },
            task,
            inputs,
            outputs: vec![],
            resources: IndexMap::new(),
        });

        let output_dir = PathBuf::from("/var/reports/J/T");
        let wrapper_path = PathBuf::from("/opt/wrappers/junit/wrapper.sh");
        let err = build_environment(&descriptor, &config, &output_dir, &wrapper_path, None).unwrap_err();
        assert!(matches!(err, TaskRunError::DuplicateSanitizedTaskId(_)));
    }

    #[test]
    fn build_invocation_sets_python_env_deltas() {
        let (argv, env) = build_invocation(
            "python",
            Path::new("/tmp/out"),
            Path::new("/opt/wrappers/junit/wrapper.py"),
            Path::new("/tmp/out/startup.py"),
        );
        assert_eq!(argv, vec!["python", "-u", "/tmp/out/startup.py"]);
        assert_eq!(env.get("PYTHONIOENCODING"), Some(&"UTF-8".to_string()));
        assert_eq!(env.get("PYTHONUTF8"), Some(&"1".to_string()));
    }

    #[test]
    fn build_invocation_make_uses_dash_c_and_dash_f() {
        let (argv, _) = build_invocation(
            "make",
            Path::new("/tmp/out"),
            Path::new("/opt/wrappers/junit/wrapper.mk"),
            Path::new("/tmp/out/startup.mk"),
        );
        assert_eq!(
            argv,
            vec!["make", "-C", "/tmp/out", "-f", "/tmp/out/startup.mk"]
        );
    }

    #[tokio::test]
    async fn missing_wrapper_reports_error_for_execution() {
        let config = Arc::new(sample_config());
        let mut task = Task::default();
        task.parameters.insert("sf.wrapper".into(), "never-resolves".into());
        let descriptor = RunDescriptor::Execution(ExecuteRunInfo {
            run: RunIdentity { job_id: "J".into(), task_id: "T".into(), run_id: "0".into() },
            task,
            inputs: IndexMap::new(),
            outputs: vec![],
            resources: IndexMap::new(),
        });
        let abort = AbortSignal::new();
        let (handle, _worker) = crate::queue::spawn(reqwest::Client::new(), config.clone());
        let result = run_one(&descriptor, &config, &handle, false, &abort).await;
        assert_eq!(result.code, Some(ResultCode::Error));
    }

    #[tokio::test]
    async fn missing_extractor_wrapper_is_ignored_not_errored() {
        let config = Arc::new(sample_config());
        let mut task = Task::default();
        task.parameters.insert("sf.wrapper".into(), "never-resolves".into());
        let descriptor = RunDescriptor::Extraction(ExtractRunInfo {
            shadow_id: "SID-1".into(),
            task,
            inputs: IndexMap::new(),
            outputs: vec![],
        });
        let abort = AbortSignal::new();
        let (handle, _worker) = crate::queue::spawn(reqwest::Client::new(), config.clone());
        let result = run_one(&descriptor, &config, &handle, false, &abort).await;
        assert!(result.is_ignored());
    }

    #[test]
    fn report_url_joins_base_job_path_and_task_id() {
        assert_eq!(
            report_url_for("http://cc.example/reports", "230101-1200-ABCD", "build"),
            "http://cc.example/reports/230101/1200-ABCD/build/"
        );
    }

    #[test]
    fn report_url_tolerates_trailing_slash_on_base() {
        assert_eq!(
            report_url_for("http://cc.example/reports/", "J", "T"),
            "http://cc.example/reports/J/T/"
        );
    }

    #[tokio::test]
    async fn advertise_report_url_is_a_no_op_without_configured_base_url() {
        let config = sample_config();
        assert!(config.output.report_base_url.is_none());
        let (queue, worker) = crate::queue::spawn(reqwest::Client::new(), Arc::new(config.clone()));
        let descriptor = RunDescriptor::Execution(sample_execution());
        advertise_report_url(&descriptor, &config, &queue);
        drop(queue);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn advertise_report_url_is_a_no_op_for_extraction_runs() {
        let mut config = sample_config();
        config.output.report_base_url = Some("http://cc.example/reports/".into());
        let (queue, worker) = crate::queue::spawn(reqwest::Client::new(), Arc::new(config.clone()));
        let mut task = Task::default();
        task.parameters.insert("sf.wrapper".into(), "coverage".into());
        let descriptor = RunDescriptor::Extraction(ExtractRunInfo {
            shadow_id: "SID-1".into(),
            task,
            inputs: IndexMap::new(),
            outputs: vec![],
        });
        advertise_report_url(&descriptor, &config, &queue);
        drop(queue);
        worker.await.unwrap();
    }
}
