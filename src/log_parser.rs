//! Splits a raw op-by-op execution log into one record per op test.
//!
//! Every op test runs a top-level `main` program. Const-eval programs
//! (`main_const_eval_0` and friends) nest inside it and are ignored. A
//! test that never reaches `Finished execution of program: main` crashed.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

const PROGRAM_START: &str = "Starting execution of program: main";
const PROGRAM_END: &str = "Finished execution of program: main";
const SUB_PROGRAM_END: &str = "Finished execution of program: main_";
const EXECUTING_OP: &str = "Executing operation:";
const FATAL: &str = "TT_FATAL";

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub success: bool,
    /// Last op the runtime started before the test ended.
    pub last_op: Option<String>,
    pub error_message: Option<String>,
    pub error_trace: Vec<String>,
}

impl ExecutionRecord {
    pub fn passed(last_op: Option<String>) -> Self {
        ExecutionRecord {
            success: true,
            last_op,
            ..Default::default()
        }
    }
}

struct Block {
    record: ExecutionRecord,
    finished: bool,
}

impl Block {
    fn new() -> Self {
        Block {
            record: ExecutionRecord::passed(None),
            finished: false,
        }
    }

    fn close(mut self) -> ExecutionRecord {
        if !self.finished {
            self.record.success = false;
        }
        self.record
    }
}

pub struct LogParser {
    ansi: Regex,
    fatal: Regex,
    ttnn_op: Regex,
    timestamp: Regex,
}

impl Default for LogParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LogParser {
    pub fn new() -> Self {
        LogParser {
            ansi: Regex::new(r"\x1b\[[0-9;]*m").unwrap(),
            fatal: Regex::new(r"TT_FATAL:\s*(.+?)(?:\s*\(assert\.hpp:\d+\))?$").unwrap(),
            ttnn_op: Regex::new(r#""(ttnn\.\w+)""#).unwrap(),
            timestamp: Regex::new(r"^\d{4}-\d{2}-\d{2}").unwrap(),
        }
    }

    pub fn strip_ansi<'a>(&self, text: &'a str) -> std::borrow::Cow<'a, str> {
        self.ansi.replace_all(text, "")
    }

    pub fn parse(&self, content: &str) -> Vec<ExecutionRecord> {
        let mut records = Vec::new();
        let mut current: Option<Block> = None;
        let mut sub_depth = 0usize;
        let mut collecting_error = false;

        for raw in content.lines() {
            let line = self.strip_ansi(raw);
            let line = line.trim();

            if line.contains(PROGRAM_START) {
                if line.contains("main_") {
                    sub_depth += 1;
                    continue;
                }
                collecting_error = false;
                if let Some(block) = current.take() {
                    records.push(block.close());
                }
                current = Some(Block::new());
                sub_depth = 0;
                continue;
            }

            let Some(block) = current.as_mut() else {
                continue;
            };

            if line.contains(SUB_PROGRAM_END) {
                sub_depth = sub_depth.saturating_sub(1);
                continue;
            }
            if sub_depth > 0 {
                continue;
            }
            if line.contains(PROGRAM_END) {
                block.finished = true;
                collecting_error = false;
                continue;
            }
            if block.finished {
                continue;
            }

            if collecting_error {
                if self.is_trace_line(line) {
                    block.record.error_trace.push(line.to_string());
                } else {
                    collecting_error = false;
                }
                continue;
            }

            if line.contains(EXECUTING_OP) {
                block.record.last_op = Some(self.op_name(line));
                continue;
            }

            if line.contains(FATAL) {
                block.record.success = false;
                let message = self
                    .fatal
                    .captures(line)
                    .map(|c| c[1].trim().to_string())
                    .unwrap_or_else(|| line.to_string());
                block.record.error_message = Some(message);
                block.record.error_trace.push(line.to_string());
                collecting_error = true;
            }
        }

        if let Some(block) = current {
            records.push(block.close());
        }
        records
    }

    pub fn parse_file<P: AsRef<Path>>(&self, path: P) -> Result<Vec<ExecutionRecord>> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read log {}", path.display()))?;
        Ok(self.parse(&String::from_utf8_lossy(&bytes)))
    }

    /// Header, message and backtrace lines of a TT_FATAL report. Anything
    /// that looks like a regular log line ends the trace.
    fn is_trace_line(&self, line: &str) -> bool {
        line.is_empty()
            || line.starts_with("---")
            || line == "info:"
            || line == "backtrace:"
            || line.contains(FATAL)
            || (!self.timestamp.is_match(line) && !line.contains("Always |"))
    }

    fn op_name(&self, line: &str) -> String {
        if let Some(c) = self.ttnn_op.captures(line) {
            return c[1].to_string();
        }
        line.rsplit(EXECUTING_OP)
            .next()
            .unwrap_or("")
            .trim()
            .chars()
            .take(80)
            .collect()
    }
}

pub fn save_records<P: AsRef<Path>>(records: &[ExecutionRecord], path: P) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, serde_json::to_string_pretty(records)?)
        .with_context(|| format!("Failed to write {}", path.display()))
}

lazy_static! {
    /// Errors worth calling out by name in reports.
    static ref KNOWN_ERRORS: Vec<(&'static str, Regex)> = vec![(
        "L1 Circular Buffer Overflow",
        Regex::new(
            r"Statically allocated circular buffers on core range \[\(x=\d+,y=\d+\) - \(x=\d+,y=\d+\)\] grow to \d+ B which is beyond max L1 size of \d+ B",
        )
        .unwrap(),
    )];
}

/// Name and matched text of the first known error found in `text`.
pub fn known_error(text: &str) -> Option<(&'static str, String)> {
    KNOWN_ERRORS.iter().find_map(|(name, pattern)| {
        pattern
            .find(text)
            .map(|m| (*name, m.as_str().to_string()))
    })
}
