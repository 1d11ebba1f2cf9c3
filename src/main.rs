use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use opsieve::{
    analyzer::{Analyzer, Mode},
    config::AnalyzerConfig,
    extract::{normalize_paths, unique_modules, Capture},
    layout::OutputLayout,
    module::ModuleSet,
    report::{unique_failures, write_unique_failures},
    runner::{ensure_system_desc, CommandExecutor, CommandExporter},
    summary::{print_status_counts, write_summary},
    tree::build_tree,
};

/// Finds which modules of a model fail to run op by op on the device.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Group a captured forward pass into unique module configurations.
    Extract {
        /// JSON dump of every module occurrence.
        #[arg(short, long)]
        capture: PathBuf,
        #[arg(short, long, default_value = "unique_modules.json")]
        out: PathBuf,
    },
    /// Run the hierarchical analysis.
    Analyze {
        /// Unique modules document.
        #[arg(short, long)]
        modules: PathBuf,
        #[arg(long)]
        model_path: String,
        #[arg(long)]
        inputs_path: String,
        /// Output directory, defaults to the directory of the modules file.
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// Only test the root module.
        #[arg(long)]
        root_only: bool,
        /// TOML file overriding commands, timeouts and paths.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        project_root: Option<PathBuf>,
    },
    /// Regenerate the reports of an analysed modules document.
    Summary {
        #[arg(short, long)]
        modules: PathBuf,
    },
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn extract(capture: &Path, out: &Path) -> Result<()> {
    let mut capture = Capture::from_file(capture)?;
    normalize_paths(&mut capture);
    let set = unique_modules(&capture);
    set.write(out)?;
    log::info!(
        "{} modules, {} unique, written to {}",
        set.metadata.total_modules,
        set.metadata.unique_modules,
        out.display()
    );
    Ok(())
}

fn write_reports(set: &ModuleSet, layout: &OutputLayout) -> Result<()> {
    write_summary(set, layout.summary_file())?;
    let failures = unique_failures(set);
    write_unique_failures(&failures, layout.failed_ops_file())?;
    log::info!("Summary: {}", layout.summary_file().display());
    log::info!(
        "{} unique failed ops: {}",
        failures.len(),
        layout.failed_ops_file().display()
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn analyze(
    modules: &Path,
    model_path: &str,
    inputs_path: &str,
    dir: Option<PathBuf>,
    root_only: bool,
    config: Option<PathBuf>,
    project_root: Option<PathBuf>,
) -> Result<()> {
    let mut config = AnalyzerConfig::from_file_or_default(config)?;
    if project_root.is_some() {
        config.project_root = project_root;
    }
    let cwd = env::current_dir().context("Failed to get the current directory")?;
    let project_root = config.resolve_project_root(&cwd)?;
    log::info!("Project root: {}", project_root.display());

    let layout = OutputLayout::new(dir.unwrap_or_else(|| parent_dir(modules)));
    fs::create_dir_all(layout.module_irs())
        .with_context(|| format!("Failed to create {}", layout.module_irs().display()))?;

    let mut set = ModuleSet::from_file(modules)?;
    let mut root = build_tree(&set.modules)
        .with_context(|| format!("Bad module hierarchy in {}", modules.display()))?;
    log::debug!("Module tree:\n{}", root.pretty_print());
    // The exporter reads the document from the output directory.
    set.write(layout.modules_file())?;

    ensure_system_desc(&config, &project_root, &layout)?;

    let mode = if root_only { Mode::RootOnly } else { Mode::Full };
    log::info!(
        "Analyzing {} ({} unique modules, {:?} mode)",
        set.metadata.model_class,
        set.modules.len(),
        mode
    );
    let exporter = CommandExporter::new(&config, &layout, &project_root, model_path, inputs_path);
    let executor = CommandExecutor::new(&config, &layout, &project_root, model_path, inputs_path);
    let mut analyzer = Analyzer::new(layout.clone(), exporter, executor);
    analyzer.analyze(&mut root, mode);

    set.annotate(&root);
    set.write(layout.modules_file())?;
    log::info!("Annotated modules: {}", layout.modules_file().display());
    write_reports(&set, &layout)?;
    print_status_counts(&set);
    Ok(())
}

fn summary(modules: &Path) -> Result<()> {
    let set = ModuleSet::from_file(modules)?;
    let layout = OutputLayout::new(parent_dir(modules));
    write_reports(&set, &layout)?;
    print_status_counts(&set);
    Ok(())
}

fn main() -> Result<()> {
    let env = env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info");
    env_logger::Builder::from_env(env).init();

    match Args::parse().command {
        Command::Extract { capture, out } => extract(&capture, &out),
        Command::Analyze {
            modules,
            model_path,
            inputs_path,
            dir,
            root_only,
            config,
            project_root,
        } => analyze(
            &modules,
            &model_path,
            &inputs_path,
            dir,
            root_only,
            config,
            project_root,
        ),
        Command::Summary { modules } => summary(&modules),
    }
}
