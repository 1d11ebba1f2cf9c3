//! Groups the module occurrences of a captured forward pass into unique
//! configurations.
//!
//! The capture is produced on the Python side by hooking every module of
//! the model. Two occurrences are the same configuration when they share
//! class, shapes and parameters. Containers stay unique per path so the
//! hierarchy survives.

use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::module::{module_id, Metadata, ModuleKind, ModuleRecord, ModuleSet, ROOT_PATH};

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TensorInfo {
    pub shape: String,
    pub dtype: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CapturedModule {
    pub path: String,
    pub class_name: String,
    #[serde(default)]
    pub inputs: Vec<TensorInfo>,
    #[serde(default)]
    pub outputs: Vec<TensorInfo>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct DeviceInfo {
    pub hostname: Option<String>,
    pub arch: Option<String>,
    pub mesh_shape: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Capture {
    pub model_class: String,
    #[serde(default)]
    pub load_fn_name: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub device_info: DeviceInfo,
    pub modules: Vec<CapturedModule>,
}

impl Capture {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read capture {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse capture {}", path.display()))
    }
}

fn sorted_join(items: impl Iterator<Item = String>) -> String {
    let mut items: Vec<String> = items.collect();
    items.sort();
    items.join("|")
}

pub fn uniqueness_key(module: &CapturedModule) -> String {
    if ModuleKind::classify(&module.class_name).is_container() {
        return format!("{}||PATH:{}", module.class_name, module.path);
    }
    let params = serde_json::to_string(&module.parameters).unwrap_or_default();
    [
        module.class_name.clone(),
        sorted_join(module.inputs.iter().map(|t| t.shape.clone())),
        sorted_join(module.outputs.iter().map(|t| t.shape.clone())),
        params,
    ]
    .join("||")
}

fn record_for(index: usize, first: &CapturedModule, occurrences: Vec<String>) -> ModuleRecord {
    let mut record = ModuleRecord::new(
        module_id(index, &first.path),
        &first.class_name,
        &first.path,
    );
    record.input_shapes = first.inputs.iter().map(|t| t.shape.clone()).collect();
    record.output_shapes = first.outputs.iter().map(|t| t.shape.clone()).collect();
    record.input_dtypes = first.inputs.iter().map(|t| t.dtype.clone()).collect();
    record.output_dtypes = first.outputs.iter().map(|t| t.dtype.clone()).collect();
    record.parameters = first.parameters.clone();
    record.occurrences = occurrences;
    record
}

/// Unique module document for a capture. Groups keep first-seen order.
pub fn unique_modules(capture: &Capture) -> ModuleSet {
    let mut order: Vec<String> = Vec::new();
    let mut groups: BTreeMap<String, Vec<&CapturedModule>> = BTreeMap::new();
    for module in &capture.modules {
        let key = uniqueness_key(module);
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(module);
    }

    let modules: Vec<ModuleRecord> = order
        .iter()
        .enumerate()
        .map(|(i, key)| {
            let group = &groups[key];
            let occurrences = group.iter().map(|m| m.path.clone()).collect();
            record_for(i, group[0], occurrences)
        })
        .collect();

    let device = &capture.device_info;
    let unknown = || "unknown".to_string();
    ModuleSet {
        metadata: Metadata {
            load_fn_name: capture.load_fn_name.clone(),
            model_class: capture.model_class.clone(),
            total_modules: capture.modules.len(),
            unique_modules: modules.len(),
            timestamp: capture.timestamp.clone(),
            hostname: device.hostname.clone().unwrap_or_else(unknown),
            device_arch: device.arch.clone().unwrap_or_else(unknown),
            device_mesh: device.mesh_shape.clone().unwrap_or_else(unknown),
        },
        modules,
    }
}

/// Root module paths come in as an empty string from `named_modules`.
pub fn normalize_paths(capture: &mut Capture) {
    for module in capture.modules.iter_mut() {
        if module.path.is_empty() {
            module.path = ROOT_PATH.to_string();
        }
    }
}
