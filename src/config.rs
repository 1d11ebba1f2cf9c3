use std::{
    collections::{BTreeMap, HashMap},
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::runner::Task;

const OP_BY_OP_TEST: &str = "tests/op_by_op/op_by_op_test.py";

/// An external command with `{placeholder}` arguments.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str], timeout_secs: u64) -> Self {
        CommandSpec {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout_secs,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn task(&self, vars: &BTreeMap<&str, String>) -> Task {
        Task::new(expand(&self.program, vars), self.timeout())
            .args(self.args.iter().map(|a| expand(a, vars)))
    }
}

pub fn expand(template: &str, vars: &BTreeMap<&str, String>) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{}}}", key), value)
    })
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AnalyzerConfig {
    #[serde(default)]
    pub project_root: Option<PathBuf>,
    /// Defaults to `<project_root>/ttrt-artifacts/system_desc.ttsys`.
    #[serde(default)]
    pub system_desc: Option<PathBuf>,
    #[serde(default = "default_system_desc_query")]
    pub system_desc_query: CommandSpec,
    #[serde(default = "default_export")]
    pub export: CommandSpec,
    #[serde(default = "default_test")]
    pub test: CommandSpec,
    /// Prepended to PYTHONPATH for test runs, relative to the project root.
    #[serde(default = "default_python_path")]
    pub python_path: Vec<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_system_desc_query() -> CommandSpec {
    CommandSpec::new("ttrt", &["query", "--save-artifacts"], 600)
}

fn default_export() -> CommandSpec {
    CommandSpec::new(
        "python3",
        &[
            "{project_root}/tools/ir_export_single_module.py",
            "--module-id",
            "{module_id}",
            "--modules-json",
            "{modules_json}",
            "--model-path",
            "{model_path}",
            "--inputs-path",
            "{inputs_path}",
            "--output-dir",
            "{output_dir}",
        ],
        300,
    )
}

fn default_test() -> CommandSpec {
    CommandSpec::new(
        "pytest",
        &[
            "-svv",
            "tests/op_by_op/op_by_op_test.py::test_op_by_op",
            "--folder={module_dir}",
            "--ir-file-prefix={ir_prefix}",
            "--json-report",
            "--json-report-file={report_path}",
        ],
        1800,
    )
}

fn default_python_path() -> Vec<PathBuf> {
    vec![
        PathBuf::from("tests"),
        PathBuf::from("third_party/tt-mlir/src/tt-mlir/build/python_packages"),
    ]
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        AnalyzerConfig {
            project_root: None,
            system_desc: None,
            system_desc_query: default_system_desc_query(),
            export: default_export(),
            test: default_test(),
            python_path: default_python_path(),
            env: HashMap::new(),
        }
    }
}

impl AnalyzerConfig {
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn from_file_or_default(path: Option<impl AsRef<Path>>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn system_desc_path(&self, project_root: &Path) -> PathBuf {
        self.system_desc
            .clone()
            .unwrap_or_else(|| project_root.join("ttrt-artifacts").join("system_desc.ttsys"))
    }

    /// Environment for op-by-op runs.
    pub fn test_env(&self, project_root: &Path) -> Vec<(String, String)> {
        let mut python_path: Vec<String> = self
            .python_path
            .iter()
            .map(|p| project_root.join(p).display().to_string())
            .collect();
        if let Ok(existing) = env::var("PYTHONPATH") {
            python_path.push(existing);
        }
        let mut vars: Vec<(String, String)> = vec![
            ("PYTHONPATH".to_string(), python_path.join(":")),
            (
                "SYSTEM_DESC_PATH".to_string(),
                self.system_desc_path(project_root).display().to_string(),
            ),
        ];
        vars.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }

    /// Explicit setting first, then `TT_XLA_ROOT`, then the closest
    /// directory above `cwd` holding the op-by-op test.
    pub fn resolve_project_root(&self, cwd: &Path) -> Result<PathBuf> {
        if let Some(root) = &self.project_root {
            return Ok(root.clone());
        }
        if let Ok(root) = env::var("TT_XLA_ROOT") {
            let root = PathBuf::from(root);
            if root.join(OP_BY_OP_TEST).exists() {
                return Ok(root);
            }
            log::warn!("TT_XLA_ROOT={} has no {}", root.display(), OP_BY_OP_TEST);
        }
        if let Some(root) = cwd.ancestors().find(|dir| dir.join(OP_BY_OP_TEST).exists()) {
            return Ok(root.to_path_buf());
        }
        bail!(
            "Could not find the project root: run from inside it, set TT_XLA_ROOT, \
             or set project_root in the config"
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AnalyzerConfig::parse("").unwrap();
        assert_eq!(config, AnalyzerConfig::default());
        assert_eq!(config.export.timeout(), Duration::from_secs(300));
        assert_eq!(config.test.timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn test_partial_override() {
        let config = AnalyzerConfig::parse(
            r#"
            project_root = "/opt/xla"

            [test]
            program = "./run_ops.sh"
            args = ["{module_dir}"]
            timeout_secs = 60

            [env]
            TT_METAL_LOGGER_LEVEL = "DEBUG"
            "#,
        )
        .unwrap();
        assert_eq!(config.project_root, Some(PathBuf::from("/opt/xla")));
        assert_eq!(config.test.program, "./run_ops.sh");
        assert_eq!(config.export, default_export());

        let vars = config.test_env(Path::new("/opt/xla"));
        assert!(vars.contains(&(
            "SYSTEM_DESC_PATH".to_string(),
            "/opt/xla/ttrt-artifacts/system_desc.ttsys".to_string()
        )));
        assert!(vars
            .iter()
            .any(|(k, v)| k == "PYTHONPATH" && v.starts_with("/opt/xla/tests:")));
        assert!(vars.contains(&("TT_METAL_LOGGER_LEVEL".to_string(), "DEBUG".to_string())));
    }

    #[test]
    fn test_bad_config() {
        assert!(AnalyzerConfig::parse("[test]\nprogram = 3").is_err());
    }

    #[test]
    fn test_expand() {
        let vars: BTreeMap<&str, String> = [
            ("module_dir", "/out/module_irs/mod_001".to_string()),
            ("ir_prefix", "irs/ttir_".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            expand("--folder={module_dir}", &vars),
            "--folder=/out/module_irs/mod_001"
        );
        assert_eq!(expand("{ir_prefix}{missing}", &vars), "irs/ttir_{missing}");
    }

    #[test]
    fn test_project_root_search() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("xla");
        fs::create_dir_all(root.join("tests/op_by_op")).unwrap();
        fs::write(root.join(OP_BY_OP_TEST), "").unwrap();
        let nested = root.join("models/resnet");
        fs::create_dir_all(&nested).unwrap();

        let explicit = AnalyzerConfig {
            project_root: Some(PathBuf::from("/elsewhere")),
            ..Default::default()
        };
        assert_eq!(explicit.resolve_project_root(&nested).unwrap(), PathBuf::from("/elsewhere"));
        // TT_XLA_ROOT may be set on dev machines, it takes precedence over
        // the walk so only check the walk when it is absent.
        if env::var("TT_XLA_ROOT").is_err() {
            let config = AnalyzerConfig::default();
            assert_eq!(config.resolve_project_root(&nested).unwrap(), root);
        }
    }
}
