//! Failed operations as reported by an op-by-op test run.
//!
//! The test harness writes a pytest-json-report file. Each test carries
//! `user_properties`, one of which is keyed `OpTest model for: <op>` and
//! describes the op it ran.

use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{Context, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{log_parser::ExecutionRecord, module::ModuleSet};

const OP_TEST_KEY_PREFIX: &str = "OpTest model for:";

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedOperation {
    pub op_name: String,
    #[serde(default)]
    pub inputs: String,
    #[serde(default)]
    pub outputs: String,
    #[serde(default)]
    pub parameters: String,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_trace: Vec<String>,
}

impl FailedOperation {
    pub fn new(op_name: impl ToString, error_message: impl ToString) -> Self {
        FailedOperation {
            op_name: op_name.to_string(),
            error_message: Some(error_message.to_string()),
            ..Default::default()
        }
    }

    pub fn dedup_key(&self) -> (&str, &str, &str, &str) {
        (&self.op_name, &self.inputs, &self.outputs, &self.parameters)
    }

    pub fn error(&self) -> &str {
        self.error_message.as_deref().unwrap_or("Unknown error")
    }
}

#[derive(Debug, Deserialize)]
struct PytestReport {
    #[serde(default)]
    tests: Vec<PytestTest>,
}

#[derive(Debug, Deserialize)]
struct PytestTest {
    #[serde(default)]
    user_properties: Vec<Value>,
}

/// Everything the report says about one test run.
#[derive(Debug, Default, PartialEq)]
pub struct OpTestReport {
    pub total_ops: usize,
    pub failed: Vec<FailedOperation>,
}

fn as_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn is_failed(value: Option<&Value>) -> bool {
    match value {
        Some(Value::String(s)) => s == "False",
        Some(Value::Bool(b)) => !b,
        _ => false,
    }
}

pub fn parse_report_str(content: &str) -> Result<OpTestReport> {
    let report: PytestReport = serde_json::from_str(content)?;
    let mut parsed = OpTestReport::default();
    let op_entries = report
        .tests
        .iter()
        .flat_map(|t| t.user_properties.iter())
        .filter_map(Value::as_object)
        .flat_map(|prop| prop.iter())
        .filter(|(key, _)| key.starts_with(OP_TEST_KEY_PREFIX))
        .filter_map(|(_, value)| value.as_object());
    for entry in op_entries {
        parsed.total_ops += 1;
        if !is_failed(entry.get("success")) {
            continue;
        }
        parsed.failed.push(FailedOperation {
            op_name: as_text(entry.get("op_name")),
            inputs: as_text(entry.get("inputs")),
            outputs: as_text(entry.get("outputs")),
            parameters: as_text(entry.get("parameters")),
            error_message: entry
                .get("error_message")
                .and_then(Value::as_str)
                .map(str::to_string),
            error_trace: Vec::new(),
        });
    }
    Ok(parsed)
}

pub fn parse_report<P: AsRef<Path>>(path: P) -> Result<OpTestReport> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read report {}", path.display()))?;
    parse_report_str(&content).with_context(|| format!("Failed to parse report {}", path.display()))
}

/// Log blocks line up with report tests by index, so the n-th failed op
/// takes its error text from the n-th failed block.
pub fn enrich_failed_ops(failed_ops: &mut [FailedOperation], records: &[ExecutionRecord]) {
    let failed_records = records.iter().filter(|r| !r.success);
    for (op, record) in failed_ops.iter_mut().zip(failed_records) {
        if let Some(msg) = &record.error_message {
            op.error_message = Some(msg.clone());
        }
        if !record.error_trace.is_empty() {
            op.error_trace = record.error_trace.clone();
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UniqueFailure {
    pub op_name: String,
    pub inputs: String,
    pub outputs: String,
    pub parameters: String,
    pub error_message: String,
    pub modules: String,
}

/// Failed ops across the whole document, one entry per distinct
/// (op, inputs, outputs, parameters), with the modules that hit it.
pub fn unique_failures(set: &ModuleSet) -> Vec<UniqueFailure> {
    let mut seen: BTreeMap<(String, String, String, String), (FailedOperation, Vec<String>)> =
        BTreeMap::new();
    for record in &set.modules {
        for op in &record.failed_ops {
            let (name, inputs, outputs, params) = op.dedup_key();
            let key = (
                name.to_string(),
                inputs.to_string(),
                outputs.to_string(),
                params.to_string(),
            );
            let entry = seen.entry(key).or_insert_with(|| (op.clone(), Vec::new()));
            if !entry.1.contains(&record.id) {
                entry.1.push(record.id.clone());
            }
        }
    }
    seen.into_values()
        .map(|(op, modules)| UniqueFailure {
            error_message: op.error().to_string(),
            modules: modules.iter().join(";"),
            op_name: op.op_name,
            inputs: op.inputs,
            outputs: op.outputs,
            parameters: op.parameters,
        })
        .collect()
}

pub fn write_unique_failures<P: AsRef<Path>>(failures: &[UniqueFailure], path: P) -> Result<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for failure in failures {
        writer.serialize(failure)?;
    }
    writer.flush()?;
    Ok(())
}
