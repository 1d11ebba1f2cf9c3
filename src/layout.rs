use std::path::{Path, PathBuf};

pub const MODULES_FILE: &str = "unique_modules.json";
pub const SUMMARY_FILE: &str = "summary.md";
pub const FAILED_OPS_FILE: &str = "failed_ops.csv";
pub const IR_PREFIX: &str = "irs/ttir_";
const IR_FILE_PREFIX: &str = "ttir_";

/// Where an analysis run keeps its files.
#[derive(Clone, Debug)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        OutputLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn modules_file(&self) -> PathBuf {
        self.root.join(MODULES_FILE)
    }

    pub fn summary_file(&self) -> PathBuf {
        self.root.join(SUMMARY_FILE)
    }

    pub fn failed_ops_file(&self) -> PathBuf {
        self.root.join(FAILED_OPS_FILE)
    }

    pub fn module_irs(&self) -> PathBuf {
        self.root.join("module_irs")
    }

    pub fn module(&self, module_id: &str) -> ModuleWorkdir {
        ModuleWorkdir {
            module_id: module_id.to_string(),
            dir: self.module_irs().join(module_id),
        }
    }
}

/// Per-module directory holding exported IR, logs and reports.
#[derive(Clone, Debug)]
pub struct ModuleWorkdir {
    module_id: String,
    dir: PathBuf,
}

impl ModuleWorkdir {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn irs_dir(&self) -> PathBuf {
        self.dir.join("irs")
    }

    pub fn run_log(&self) -> PathBuf {
        self.dir.join("run.log")
    }

    pub fn op_log(&self) -> PathBuf {
        self.dir.join("op_by_op.log")
    }

    pub fn report_file(&self) -> PathBuf {
        self.dir
            .join(format!("{}_op_by_op_report.json", self.module_id))
    }

    pub fn parsed_log_file(&self) -> PathBuf {
        self.dir
            .join(format!("{}_op_by_op_parsed.json", self.module_id))
    }

    /// TTIR files the exporter left behind, in name order.
    pub fn ir_files(&self) -> Vec<PathBuf> {
        let dir = glob::Pattern::escape(&self.irs_dir().to_string_lossy());
        let pattern = format!("{}/{}*.mlir", dir, IR_FILE_PREFIX);
        let mut files: Vec<PathBuf> = match glob::glob(&pattern) {
            Ok(paths) => paths.filter_map(Result::ok).collect(),
            Err(e) => {
                log::warn!("Bad IR glob {}: {}", pattern, e);
                Vec::new()
            }
        };
        files.sort();
        files
    }

    pub fn has_ir(&self) -> bool {
        !self.ir_files().is_empty()
    }
}
