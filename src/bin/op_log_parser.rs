use std::{
    path::{Path, PathBuf},
    process::exit,
};

use anyhow::{anyhow, Result};
use clap::Parser;
use opsieve::log_parser::{save_records, LogParser};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

/// Parses op-by-op execution logs into `<stem>_parsed.json` files.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The directory containing .log files.
    #[arg(short, long)]
    path: PathBuf,
}

fn parse_one(parser: &LogParser, path: &Path) -> Result<(PathBuf, usize, usize)> {
    let records = parser.parse_file(path)?;
    let stem = path
        .file_stem()
        .ok_or_else(|| anyhow!("No file name in {}", path.display()))?
        .to_string_lossy();
    let out = path.with_file_name(format!("{}_parsed.json", stem));
    save_records(&records, &out)?;
    let failed = records.iter().filter(|r| !r.success).count();
    Ok((out, records.len(), failed))
}

fn main() -> Result<()> {
    let env = env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info");
    env_logger::Builder::from_env(env).init();

    let args = Args::parse();
    if !args.path.is_dir() {
        eprintln!("Error: Path must be a directory.");
        exit(1);
    }

    let pattern = args.path.join("*.log");
    let pattern = pattern
        .to_str()
        .ok_or_else(|| anyhow!("Non UTF-8 path {}", args.path.display()))?;
    let paths = glob::glob(pattern)?.collect::<Result<Vec<_>, _>>()?;
    if paths.is_empty() {
        log::warn!("No .log files in {}", args.path.display());
        return Ok(());
    }

    let parser = LogParser::new();
    let results: Vec<(PathBuf, Result<(PathBuf, usize, usize)>)> = paths
        .par_iter()
        .map(|path| (path.clone(), parse_one(&parser, path)))
        .collect();

    let mut all_ok = true;
    for (path, result) in results {
        match result {
            Ok((out, total, failed)) => log::info!(
                "{}: {} executions, {} failed -> {}",
                path.display(),
                total,
                failed,
                out.display()
            ),
            Err(e) => {
                log::error!("{}: {:#}", path.display(), e);
                all_ok = false;
            }
        }
    }

    if !all_ok {
        exit(1);
    }
    Ok(())
}
