//! Subprocess plumbing: export and op-by-op test runs are external
//! commands, each bounded by its own timeout, writing everything they print
//! into a per-module log.

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use wait_timeout::ChildExt;

use crate::{
    analyzer::{IrExporter, OpExecutor, TestOutcome},
    config::AnalyzerConfig,
    layout::{ModuleWorkdir, OutputLayout, IR_PREFIX},
    log_parser::{save_records, LogParser},
    module::ModuleRecord,
    report::{enrich_failed_ops, parse_report, FailedOperation},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskExit {
    Success,
    Failed(Option<i32>),
    TimedOut(Duration),
    SpawnError(String),
}

impl TaskExit {
    pub fn success(&self) -> bool {
        *self == TaskExit::Success
    }
}

impl std::fmt::Display for TaskExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskExit::Success => write!(f, "Return code: 0"),
            TaskExit::Failed(Some(code)) => write!(f, "Return code: {}", code),
            TaskExit::Failed(None) => write!(f, "Killed by signal"),
            TaskExit::TimedOut(after) => write!(f, "TIMEOUT after {} seconds", after.as_secs()),
            TaskExit::SpawnError(e) => write!(f, "ERROR: {}", e),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Task {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    cwd: Option<PathBuf>,
    timeout: Duration,
}

impl Task {
    pub fn new(program: impl ToString, timeout: Duration) -> Self {
        Task {
            program: program.to_string(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            timeout,
        }
    }

    pub fn args<S: ToString>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args.extend(args.into_iter().map(|a| a.to_string()));
        self
    }

    pub fn envs(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(&self.program).chain(&self.args).join(" ")
    }

    /// Runs to completion or timeout with stdout and stderr both going to
    /// `log`, framed by the command line and the exit.
    pub fn run(&self, title: &str, log: &Path) -> TaskExit {
        let exit = match self.spawn_and_wait(title, log) {
            Ok(exit) => exit,
            Err(e) => TaskExit::SpawnError(format!("{:#}", e)),
        };
        let trailer = OpenOptions::new()
            .append(true)
            .create(true)
            .open(log)
            .and_then(|mut f| writeln!(f, "\n{}", exit));
        if let Err(e) = trailer {
            log::warn!("Could not write {}: {}", log.display(), e);
        }
        exit
    }

    fn spawn_and_wait(&self, title: &str, log: &Path) -> Result<TaskExit> {
        if let Some(parent) = log.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut header = File::create(log)
            .with_context(|| format!("Failed to create log {}", log.display()))?;
        writeln!(header, "=== {} ===", title)?;
        writeln!(header, "Command: {}\n", self.command_line())?;
        writeln!(header, "=== OUTPUT ===")?;
        drop(header);

        let stdout = OpenOptions::new().append(true).open(log)?;
        let stderr = stdout.try_clone()?;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        log::debug!("Running {}", self.command_line());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to start {}", self.program))?;
        let status = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                log::debug!("{} timed out, killed, waiting...", self.program);
                reap(&mut child)?;
                return Ok(TaskExit::TimedOut(self.timeout));
            }
            Err(e) => {
                let _ = reap(&mut child);
                return Err(e).with_context(|| format!("Failed to wait for {}", self.program));
            }
        };
        if status.success() {
            Ok(TaskExit::Success)
        } else {
            Ok(TaskExit::Failed(status.code()))
        }
    }
}

/// Paths and loader references shared by every command of a run.
/// Kills `child` and waits for it so it does not outlive the task.
fn reap(child: &mut Child) -> std::io::Result<()> {
    let _ = child.kill();
    child.wait().map(|_| ())
}

fn run_vars(
    layout: &OutputLayout,
    project_root: &Path,
    model_path: &str,
    inputs_path: &str,
) -> BTreeMap<&'static str, String> {
    [
        ("project_root", project_root.display().to_string()),
        ("output_dir", layout.root().display().to_string()),
        ("modules_json", layout.modules_file().display().to_string()),
        ("model_path", model_path.to_string()),
        ("inputs_path", inputs_path.to_string()),
        ("ir_prefix", IR_PREFIX.to_string()),
    ]
    .into_iter()
    .collect()
}

fn module_vars(
    base: &BTreeMap<&'static str, String>,
    record: &ModuleRecord,
    workdir: &ModuleWorkdir,
) -> BTreeMap<&'static str, String> {
    let mut vars = base.clone();
    vars.insert("module_id", record.id.clone());
    vars.insert("module_dir", workdir.dir().display().to_string());
    vars.insert("report_path", workdir.report_file().display().to_string());
    vars
}

pub struct CommandExporter {
    config: AnalyzerConfig,
    project_root: PathBuf,
    vars: BTreeMap<&'static str, String>,
}

impl CommandExporter {
    pub fn new(
        config: &AnalyzerConfig,
        layout: &OutputLayout,
        project_root: &Path,
        model_path: &str,
        inputs_path: &str,
    ) -> Self {
        CommandExporter {
            config: config.clone(),
            project_root: project_root.to_path_buf(),
            vars: run_vars(layout, project_root, model_path, inputs_path),
        }
    }
}

impl IrExporter for CommandExporter {
    fn export(&mut self, record: &ModuleRecord, workdir: &ModuleWorkdir) -> TaskExit {
        log::info!("    Exporting IR for {}...", record.id);
        let task = self
            .config
            .export
            .task(&module_vars(&self.vars, record, workdir))
            .envs(self.config.env.clone())
            .current_dir(&self.project_root);
        let exit = task.run(&format!("Run Log for {}", record.id), &workdir.run_log());
        match &exit {
            TaskExit::Success => log::info!("    export OK"),
            other => log::info!("    export: {} (see {})", other, workdir.run_log().display()),
        }
        exit
    }
}

pub struct CommandExecutor {
    config: AnalyzerConfig,
    project_root: PathBuf,
    vars: BTreeMap<&'static str, String>,
    parser: LogParser,
}

impl CommandExecutor {
    pub fn new(
        config: &AnalyzerConfig,
        layout: &OutputLayout,
        project_root: &Path,
        model_path: &str,
        inputs_path: &str,
    ) -> Self {
        CommandExecutor {
            config: config.clone(),
            project_root: project_root.to_path_buf(),
            vars: run_vars(layout, project_root, model_path, inputs_path),
            parser: LogParser::new(),
        }
    }

    fn interpret(&self, exit: TaskExit, workdir: &ModuleWorkdir) -> TestOutcome {
        let records = match self.parser.parse_file(workdir.op_log()) {
            Ok(records) => {
                if let Err(e) = save_records(&records, workdir.parsed_log_file()) {
                    log::warn!("{:#}", e);
                }
                records
            }
            Err(e) => {
                log::warn!("{:#}", e);
                Vec::new()
            }
        };

        let report_file = workdir.report_file();
        let report = if report_file.exists() {
            match parse_report(&report_file) {
                Ok(report) => Some(report),
                Err(e) => {
                    log::warn!("{:#}", e);
                    None
                }
            }
        } else {
            None
        };
        let report_path = report.as_ref().map(|_| report_file);

        if exit.success() && report.as_ref().is_some_and(|r| r.total_ops == 0) {
            return TestOutcome::NoOperations;
        }

        let mut failed_ops = report.map(|r| r.failed).unwrap_or_default();
        enrich_failed_ops(&mut failed_ops, &records);

        if exit.success() && failed_ops.is_empty() {
            return TestOutcome::Passed { report_path };
        }
        if failed_ops.is_empty() {
            failed_ops.push(FailedOperation::new("TEST_FAILED", &exit));
        }
        TestOutcome::Failed {
            failed_ops,
            report_path,
        }
    }
}

impl OpExecutor for CommandExecutor {
    fn execute(&mut self, record: &ModuleRecord, workdir: &ModuleWorkdir) -> TestOutcome {
        if !workdir.has_ir() {
            return TestOutcome::NoOperations;
        }
        let task = self
            .config
            .test
            .task(&module_vars(&self.vars, record, workdir))
            .envs(self.config.test_env(&self.project_root))
            .current_dir(&self.project_root);
        log::info!("    Running: {}", task.command_line());
        let exit = task.run(&format!("Op-by-Op Log for {}", record.id), &workdir.op_log());
        match exit {
            TaskExit::TimedOut(after) => TestOutcome::TimedOut(after),
            TaskExit::SpawnError(e) => TestOutcome::Failed {
                failed_ops: vec![FailedOperation::new("ERROR", e)],
                report_path: None,
            },
            exit => self.interpret(exit, workdir),
        }
    }
}

/// The op-by-op harness needs a system descriptor. Generating it is the only
/// device query of the run, so a failure here stops everything.
pub fn ensure_system_desc(
    config: &AnalyzerConfig,
    project_root: &Path,
    layout: &OutputLayout,
) -> Result<PathBuf> {
    let desc = config.system_desc_path(project_root);
    if desc.exists() {
        return Ok(desc);
    }
    log::info!("Generating system descriptor at {}...", desc.display());
    let log = layout.root().join("system_desc_query.log");
    let task = config
        .system_desc_query
        .task(&BTreeMap::new())
        .envs(config.env.clone())
        .current_dir(project_root);
    let exit = task.run("System descriptor query", &log);
    if !exit.success() {
        bail!(
            "Failed to generate system descriptor at {}: {} (see {})",
            desc.display(),
            exit,
            log.display()
        );
    }
    if !desc.exists() {
        bail!(
            "{} succeeded but {} is still missing",
            task.command_line(),
            desc.display()
        );
    }
    log::info!("Generated system descriptor at {}", desc.display());
    Ok(desc)
}
