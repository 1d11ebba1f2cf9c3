//! Human readable reports for an analysed module document.

use std::{fmt::Write as _, fs, path::Path};

use anyhow::{Context, Result};
use colored::{ColoredString, Colorize};
use itertools::Itertools;

use crate::{
    log_parser::known_error,
    module::{is_root_path, ModuleRecord, ModuleSet, Status, TOP_LEVEL_PARENT},
    report::FailedOperation,
};

/// Rows of the status table. Inherited successes are counted as successes.
pub fn status_rows(set: &ModuleSet) -> Vec<(&'static str, usize)> {
    let counts = set.status_counts();
    let count = |s: Status| counts.get(&s).copied().unwrap_or(0);
    let mut rows = vec![(
        Status::Success.label(),
        count(Status::Success) + count(Status::InheritedSuccess),
    )];
    for status in Status::ALL {
        if matches!(status, Status::Success | Status::InheritedSuccess) {
            continue;
        }
        let n = count(status);
        if n > 0 {
            rows.push((status.label(), n));
        }
    }
    rows
}

pub fn passed(set: &ModuleSet) -> bool {
    !set.modules.iter().any(|m| m.status.is_failure())
}

fn cell(text: &str) -> String {
    text.replace('|', "\\|").lines().map(str::trim).join(" ")
}

fn shapes(shapes: &[String]) -> String {
    if shapes.is_empty() {
        "-".to_string()
    } else {
        shapes.iter().map(|s| format!("`{}`", s)).join(", ")
    }
}

fn write_header(out: &mut String, set: &ModuleSet) {
    let meta = &set.metadata;
    let _ = writeln!(out, "# Op-by-op analysis: {}\n", meta.model_class);
    let _ = writeln!(
        out,
        "- Device: {} (mesh {}) on {}",
        meta.device_arch, meta.device_mesh, meta.hostname
    );
    let _ = writeln!(
        out,
        "- Modules: {} unique of {} total",
        meta.unique_modules, meta.total_modules
    );
    let _ = writeln!(
        out,
        "- Date: {}\n",
        meta.timestamp.as_deref().unwrap_or("unknown")
    );
    let verdict = if passed(set) { "PASSED" } else { "FAILED" };
    let _ = writeln!(out, "**Overall: {}**\n", verdict);
}

fn write_status_table(out: &mut String, set: &ModuleSet) {
    out.push_str("## Status\n\n| Status | Modules |\n|---|---|\n");
    for (label, n) in status_rows(set) {
        let _ = writeln!(out, "| {} | {} |", label, n);
    }
    out.push('\n');
}

fn write_failed_module(out: &mut String, set: &ModuleSet, record: &ModuleRecord) {
    let _ = writeln!(
        out,
        "### {} `{}` ({}): {}\n",
        record.id,
        record.display_path(),
        record.class_name,
        record.status.label()
    );

    if record.is_container() {
        let path = if is_root_path(&record.module_path) {
            TOP_LEVEL_PARENT
        } else {
            record.module_path.as_str()
        };
        let failed: Vec<&ModuleRecord> = set
            .children_of(path)
            .filter(|c| c.status.is_failure())
            .collect();
        out.push_str("Failed children:\n\n");
        for child in failed {
            let _ = writeln!(
                out,
                "- {} `{}` ({}): {}",
                child.id,
                child.display_path(),
                child.class_name,
                child.status.label()
            );
        }
        out.push('\n');
        return;
    }

    let _ = writeln!(
        out,
        "Inputs: {}. Outputs: {}.\n",
        shapes(&record.input_shapes),
        shapes(&record.output_shapes)
    );
    if record.status == Status::IrExportFailed {
        let _ = writeln!(
            out,
            "IR export failed, see `module_irs/{}/run.log`.\n",
            record.id
        );
        return;
    }
    out.push_str("| Op | Error |\n|---|---|\n");
    for op in &record.failed_ops {
        let _ = writeln!(out, "| `{}` | {} |", cell(&op.op_name), cell(op.error()));
    }
    out.push('\n');
}

fn write_trace(out: &mut String, record: &ModuleRecord, op: &FailedOperation) {
    let _ = writeln!(out, "### {} / {}\n", record.id, op.op_name);
    if !op.parameters.is_empty() {
        let _ = writeln!(out, "Parameters: `{}`\n", cell(&op.parameters));
    }
    let text = std::iter::once(op.error())
        .chain(op.error_trace.iter().map(String::as_str))
        .join("\n");
    if let Some((name, matched)) = known_error(&text) {
        let _ = writeln!(out, "Known error: **{}**: {}\n", name, matched);
    }
    let _ = writeln!(out, "```\n{}\n```\n", text);
}

pub fn render_summary(set: &ModuleSet) -> String {
    let mut out = String::new();
    write_header(&mut out, set);
    write_status_table(&mut out, set);

    let failed: Vec<&ModuleRecord> = set
        .modules
        .iter()
        .filter(|m| m.status.is_failure())
        .collect();
    if failed.is_empty() {
        return out;
    }

    out.push_str("## Failed modules\n\n");
    for record in &failed {
        write_failed_module(&mut out, set, record);
    }

    let traced: Vec<(&ModuleRecord, &FailedOperation)> = failed
        .iter()
        .flat_map(|r| r.failed_ops.iter().map(move |op| (*r, op)))
        .collect();
    if !traced.is_empty() {
        out.push_str("## Error details\n\n");
        for (record, op) in traced {
            write_trace(&mut out, record, op);
        }
    }
    out
}

pub fn write_summary<P: AsRef<Path>>(set: &ModuleSet, path: P) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, render_summary(set))
        .with_context(|| format!("Failed to write summary {}", path.display()))
}

fn paint(label: &str, n: usize) -> ColoredString {
    let text = format!("{:>20}: {}", label, n);
    if label == Status::Success.label() {
        text.green()
    } else if label == Status::Failed.label() || label == Status::IrExportFailed.label() {
        text.red()
    } else {
        text.yellow()
    }
}

pub fn print_status_counts(set: &ModuleSet) {
    println!("{}", "Module status:".bold());
    for (label, n) in status_rows(set) {
        println!("{}", paint(label, n));
    }
    if passed(set) {
        println!("{}", "PASSED".green().bold());
    } else {
        println!("{}", "FAILED".red().bold());
    }
}
