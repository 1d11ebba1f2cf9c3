use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{report::FailedOperation, tree::ModuleNode};

pub const ROOT_PATH: &str = "(root)";
pub const TOP_LEVEL_PARENT: &str = "full_model";

const CONTAINER_CLASSES: [&str; 3] = ["Sequential", "ModuleList", "ModuleDict"];

lazy_static! {
    static ref INDEXED_SEGMENT: Regex = Regex::new(r"\[(\d+)\]").unwrap();
}

pub fn is_root_path(path: &str) -> bool {
    matches!(path, ROOT_PATH | TOP_LEVEL_PARENT | "")
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// Only composes its children, never tested directly.
    Container,
    Computational,
}

impl ModuleKind {
    pub fn classify(class_name: &str) -> Self {
        if CONTAINER_CLASSES.contains(&class_name) {
            ModuleKind::Container
        } else {
            ModuleKind::Computational
        }
    }

    pub fn is_container(&self) -> bool {
        *self == ModuleKind::Container
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Failed,
    IrExportFailed,
    Success,
    InheritedSuccess,
    Skipped,
    #[default]
    Unknown,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Failed,
        Status::IrExportFailed,
        Status::Success,
        Status::InheritedSuccess,
        Status::Skipped,
        Status::Unknown,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Status::Failed => "Failed",
            Status::IrExportFailed => "IR Export Failed",
            Status::Success => "Success",
            Status::InheritedSuccess => "Inherited Success",
            Status::Skipped => "Skipped",
            Status::Unknown => "Unknown",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Failed => "failed",
            Status::IrExportFailed => "ir_export_failed",
            Status::Success => "success",
            Status::InheritedSuccess => "inherited_success",
            Status::Skipped => "skipped",
            Status::Unknown => "unknown",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Status::Failed | Status::IrExportFailed)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success | Status::InheritedSuccess)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ModuleRecord {
    pub id: String,
    pub class_name: String,
    pub module_path: String,
    pub parent: Option<String>,
    #[serde(default)]
    pub kind: Option<ModuleKind>,
    #[serde(default)]
    pub input_shapes: Vec<String>,
    #[serde(default)]
    pub output_shapes: Vec<String>,
    #[serde(default)]
    pub input_dtypes: Vec<String>,
    #[serde(default)]
    pub output_dtypes: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub occurrences: Vec<String>,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_ops: Vec<FailedOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_by_op_report_path: Option<String>,
}

impl ModuleRecord {
    pub fn new(id: impl ToString, class_name: impl ToString, module_path: impl ToString) -> Self {
        let class_name = class_name.to_string();
        let module_path = module_path.to_string();
        ModuleRecord {
            id: id.to_string(),
            kind: Some(ModuleKind::classify(&class_name)),
            parent: parent_path(&module_path),
            occurrences: vec![module_path.clone()],
            class_name,
            module_path,
            input_shapes: Vec::new(),
            output_shapes: Vec::new(),
            input_dtypes: Vec::new(),
            output_dtypes: Vec::new(),
            parameters: BTreeMap::new(),
            status: Status::Unknown,
            failed_ops: Vec::new(),
            op_by_op_report_path: None,
        }
    }

    /// Documents written by older capture scripts carry no kind, fall back
    /// to the class name.
    pub fn kind(&self) -> ModuleKind {
        self.kind
            .unwrap_or_else(|| ModuleKind::classify(&self.class_name))
    }

    pub fn is_container(&self) -> bool {
        self.kind().is_container()
    }

    pub fn display_path(&self) -> &str {
        if is_root_path(&self.module_path) {
            "root"
        } else {
            &self.module_path
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    #[serde(default)]
    pub load_fn_name: Option<String>,
    pub model_class: String,
    pub total_modules: usize,
    pub unique_modules: usize,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default = "unknown")]
    pub hostname: String,
    #[serde(default = "unknown")]
    pub device_arch: String,
    #[serde(default = "unknown")]
    pub device_mesh: String,
}

fn unknown() -> String {
    "unknown".to_string()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ModuleSet {
    pub metadata: Metadata,
    pub modules: Vec<ModuleRecord>,
}

impl ModuleSet {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read modules file {}", path.display()))?;
        let mut set: ModuleSet = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse modules file {}", path.display()))?;
        for record in set.modules.iter_mut() {
            record.kind.get_or_insert_with(|| ModuleKind::classify(&record.class_name));
        }
        Ok(set)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_json()?)
            .with_context(|| format!("Failed to write modules file {}", path.display()))
    }

    pub fn get(&self, id: &str) -> Option<&ModuleRecord> {
        self.modules.iter().find(|m| m.id == id)
    }

    pub fn children_of<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a ModuleRecord> {
        self.modules
            .iter()
            .filter(move |m| m.parent.as_deref() == Some(path))
    }

    /// Copies the analysis outcome of every tree node onto the record with
    /// the same path.
    pub fn annotate(&mut self, root: &ModuleNode) {
        let mut outcomes = BTreeMap::new();
        root.walk(&mut |node| {
            outcomes.insert(node.record.module_path.clone(), node);
        });
        for record in self.modules.iter_mut() {
            if let Some(node) = outcomes.get(&record.module_path) {
                record.status = node.status;
                record.failed_ops = node.failed_ops.clone();
                record.op_by_op_report_path = node
                    .report_path
                    .as_ref()
                    .map(|p| p.display().to_string());
            }
        }
    }

    pub fn status_counts(&self) -> BTreeMap<Status, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.modules {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }
}

/// Parent of a dotted module path, ignoring dots inside brackets.
/// Top-level modules hang off [`TOP_LEVEL_PARENT`], the root has none.
pub fn parent_path(module_path: &str) -> Option<String> {
    if is_root_path(module_path) {
        return None;
    }
    let mut last_dot = None;
    let mut depth = 0i32;
    for (i, c) in module_path.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth -= 1,
            '.' if depth == 0 => last_dot = Some(i),
            _ => {}
        }
    }
    match last_dot {
        Some(i) => Some(module_path[..i].to_string()),
        None => Some(TOP_LEVEL_PARENT.to_string()),
    }
}

pub fn module_id(index: usize, module_path: &str) -> String {
    if is_root_path(module_path) {
        return format!("mod_{:03}", index);
    }
    let name = module_path.rsplit('.').next().unwrap_or("");
    let indexed = INDEXED_SEGMENT.replace_all(name, "_$1");
    let sanitized: String = indexed
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .take(60)
        .collect();
    if sanitized.is_empty() {
        format!("mod_{:03}", index)
    } else {
        format!("mod_{:03}_{}", index, sanitized)
    }
}
