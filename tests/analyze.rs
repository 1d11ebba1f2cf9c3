use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    time::Duration,
};

use opsieve::{
    analyzer::{aggregate_containers, Analyzer, IrExporter, Mode, OpExecutor, TestOutcome},
    layout::{ModuleWorkdir, OutputLayout},
    module::{ModuleRecord, ModuleSet, Status},
    report::{unique_failures, FailedOperation},
    runner::TaskExit,
    tree::{build_tree, ModuleNode},
};
use tempfile::TempDir;

#[derive(Default)]
struct FakeExporter {
    no_ir: BTreeSet<String>,
    timeout: BTreeSet<String>,
    /// Leaves IR behind but exits non-zero.
    noisy: BTreeSet<String>,
    calls: Vec<String>,
}

impl IrExporter for FakeExporter {
    fn export(&mut self, record: &ModuleRecord, workdir: &ModuleWorkdir) -> TaskExit {
        self.calls.push(record.id.clone());
        if self.timeout.contains(&record.id) {
            return TaskExit::TimedOut(Duration::from_secs(300));
        }
        if self.no_ir.contains(&record.id) {
            return TaskExit::Failed(Some(1));
        }
        fs::create_dir_all(workdir.irs_dir()).unwrap();
        fs::write(
            workdir.irs_dir().join(format!("ttir_{}.mlir", record.id)),
            "module {}",
        )
        .unwrap();
        if self.noisy.contains(&record.id) {
            TaskExit::Failed(Some(134))
        } else {
            TaskExit::Success
        }
    }
}

#[derive(Default)]
struct FakeExecutor {
    outcomes: BTreeMap<String, TestOutcome>,
    calls: Vec<String>,
}

impl FakeExecutor {
    fn fail(mut self, id: &str, op: &str) -> Self {
        self.outcomes.insert(
            id.to_string(),
            TestOutcome::Failed {
                failed_ops: vec![FailedOperation::new(op, "boom")],
                report_path: None,
            },
        );
        self
    }

    fn with(mut self, id: &str, outcome: TestOutcome) -> Self {
        self.outcomes.insert(id.to_string(), outcome);
        self
    }
}

impl OpExecutor for FakeExecutor {
    fn execute(&mut self, record: &ModuleRecord, workdir: &ModuleWorkdir) -> TestOutcome {
        assert!(workdir.has_ir(), "{} executed without IR", record.id);
        self.calls.push(record.id.clone());
        self.outcomes
            .get(&record.id)
            .cloned()
            .unwrap_or(TestOutcome::Passed { report_path: None })
    }
}

/// (root) Net
///   blocks Sequential
///     blocks.0 Conv2d
///     blocks.1 Block
///       blocks.1.act ReLU
///   head Linear
fn records() -> Vec<ModuleRecord> {
    vec![
        ModuleRecord::new("mod_000", "Net", "(root)"),
        ModuleRecord::new("mod_001_blocks", "Sequential", "blocks"),
        ModuleRecord::new("mod_002_0", "Conv2d", "blocks.0"),
        ModuleRecord::new("mod_003_1", "Block", "blocks.1"),
        ModuleRecord::new("mod_004_act", "ReLU", "blocks.1.act"),
        ModuleRecord::new("mod_005_head", "Linear", "head"),
    ]
}

/// A(root, container) with leaves B and C.
fn abc() -> Vec<ModuleRecord> {
    vec![
        ModuleRecord::new("mod_000", "Sequential", "(root)"),
        ModuleRecord::new("mod_001_b", "Linear", "b"),
        ModuleRecord::new("mod_002_c", "Linear", "c"),
    ]
}

fn run(
    records: Vec<ModuleRecord>,
    exporter: FakeExporter,
    executor: FakeExecutor,
    mode: Mode,
) -> (ModuleNode, FakeExporter, FakeExecutor, TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let mut root = build_tree(&records).unwrap();
    let mut analyzer = Analyzer::new(OutputLayout::new(tmp.path()), exporter, executor);
    analyzer.analyze(&mut root, mode);
    let (exporter, executor) = analyzer.into_parts();
    (root, exporter, executor, tmp)
}

fn status(root: &ModuleNode, id: &str) -> Status {
    root.find(id).unwrap().status
}

fn statuses(root: &ModuleNode) -> Vec<Status> {
    let mut out = Vec::new();
    root.walk(&mut |n| out.push(n.status));
    out
}

#[test]
fn test_one_failing_leaf_fails_container() {
    let executor = FakeExecutor::default().fail("mod_002_c", "op_x");
    let (root, _, _, _tmp) = run(abc(), FakeExporter::default(), executor, Mode::Full);

    assert_eq!(status(&root, "mod_001_b"), Status::Success);
    let c = root.find("mod_002_c").unwrap();
    assert_eq!(c.status, Status::Failed);
    assert_eq!(c.failed_ops.len(), 1);
    assert_eq!(c.failed_ops[0].op_name, "op_x");
    assert_eq!(root.status, Status::Failed);
}

#[test]
fn test_all_leaves_pass_container_inherits() {
    let (root, exporter, _, _tmp) = run(
        abc(),
        FakeExporter::default(),
        FakeExecutor::default(),
        Mode::Full,
    );
    assert_eq!(root.status, Status::InheritedSuccess);
    assert_eq!(status(&root, "mod_001_b"), Status::Success);
    assert_eq!(status(&root, "mod_002_c"), Status::Success);
    // Containers are never exported.
    assert_eq!(exporter.calls, vec!["mod_001_b", "mod_002_c"]);
}

#[test]
fn test_root_only_with_container_root() {
    let executor = FakeExecutor::default().fail("mod_002_c", "op_x");
    let (root, exporter, _, _tmp) = run(abc(), FakeExporter::default(), executor, Mode::RootOnly);
    assert_eq!(status(&root, "mod_001_b"), Status::Skipped);
    assert_eq!(status(&root, "mod_002_c"), Status::Skipped);
    assert_eq!(root.status, Status::Skipped);
    assert!(exporter.calls.is_empty());
}

#[test]
fn test_root_only_reflects_root_result() {
    let executor = FakeExecutor::default().fail("mod_000", "ttir.conv2d");
    let (root, exporter, executor, _tmp) =
        run(records(), FakeExporter::default(), executor, Mode::RootOnly);
    assert_eq!(root.status, Status::Failed);
    assert_eq!(exporter.calls, vec!["mod_000"]);
    assert_eq!(executor.calls, vec!["mod_000"]);
    root.walk(&mut |n| {
        if n.id() != "mod_000" {
            assert_eq!(n.status, Status::Skipped, "{}", n.id());
        }
    });

    let (root, _, _, _tmp) = run(
        records(),
        FakeExporter::default(),
        FakeExecutor::default(),
        Mode::RootOnly,
    );
    assert_eq!(root.status, Status::Success);
    assert_eq!(status(&root, "mod_005_head"), Status::Skipped);
}

fn assert_only_root_ran(root: &ModuleNode) {
    root.walk(&mut |n| {
        if n.id() != "mod_000" {
            assert_eq!(n.status, Status::Skipped, "{}", n.id());
        }
    });
}

#[test]
fn test_root_only_export_failure() {
    let exporter = FakeExporter {
        no_ir: ["mod_000".to_string()].into(),
        ..Default::default()
    };
    let (root, exporter, executor, _tmp) =
        run(records(), exporter, FakeExecutor::default(), Mode::RootOnly);
    assert_eq!(root.status, Status::IrExportFailed);
    assert_eq!(exporter.calls, vec!["mod_000"]);
    assert!(executor.calls.is_empty());
    assert_only_root_ran(&root);
}

#[test]
fn test_root_only_no_ops() {
    let executor = FakeExecutor::default().with("mod_000", TestOutcome::NoOperations);
    let (root, exporter, executor, _tmp) =
        run(records(), FakeExporter::default(), executor, Mode::RootOnly);
    assert_eq!(root.status, Status::Skipped);
    assert_eq!(exporter.calls, vec!["mod_000"]);
    assert_eq!(executor.calls, vec!["mod_000"]);
    assert_only_root_ran(&root);
}

#[test]
fn test_passing_root_vouches_for_subtree() {
    let (root, exporter, executor, _tmp) = run(
        records(),
        FakeExporter::default(),
        FakeExecutor::default(),
        Mode::Full,
    );
    assert_eq!(root.status, Status::Success);
    assert_eq!(exporter.calls, vec!["mod_000"]);
    assert_eq!(executor.calls, vec!["mod_000"]);
    root.walk(&mut |n| {
        if n.id() != "mod_000" {
            assert_eq!(n.status, Status::InheritedSuccess, "{}", n.id());
        }
    });
}

#[test]
fn test_failure_narrows_down() {
    let executor = FakeExecutor::default()
        .fail("mod_000", "ttir.relu")
        .fail("mod_003_1", "ttir.relu")
        .fail("mod_004_act", "ttir.relu");
    let (root, _, executor, _tmp) = run(records(), FakeExporter::default(), executor, Mode::Full);

    assert_eq!(root.status, Status::Failed);
    assert_eq!(status(&root, "mod_001_blocks"), Status::Failed);
    assert_eq!(status(&root, "mod_002_0"), Status::Success);
    assert_eq!(status(&root, "mod_003_1"), Status::Failed);
    assert_eq!(status(&root, "mod_004_act"), Status::Failed);
    assert_eq!(status(&root, "mod_005_head"), Status::Success);
    assert_eq!(
        executor.calls,
        vec!["mod_000", "mod_002_0", "mod_003_1", "mod_004_act", "mod_005_head"]
    );
    assert!(!statuses(&root).contains(&Status::Unknown));
}

#[test]
fn test_failing_root_with_passing_children() {
    let executor = FakeExecutor::default().fail("mod_000", "ttir.add");
    let (root, _, _, _tmp) = run(records(), FakeExporter::default(), executor, Mode::Full);
    assert_eq!(root.status, Status::Failed);
    assert_eq!(status(&root, "mod_001_blocks"), Status::InheritedSuccess);
    assert_eq!(status(&root, "mod_003_1"), Status::Success);
    assert_eq!(status(&root, "mod_004_act"), Status::InheritedSuccess);
}

#[test]
fn test_export_exit_code_ignored_when_ir_present() {
    let exporter = FakeExporter {
        noisy: ["mod_000".to_string()].into(),
        ..Default::default()
    };
    let (root, _, executor, _tmp) = run(records(), exporter, FakeExecutor::default(), Mode::Full);
    assert_eq!(root.status, Status::Success);
    assert_eq!(executor.calls, vec!["mod_000"]);
}

#[test]
fn test_export_timeout_still_visits_children() {
    let exporter = FakeExporter {
        timeout: ["mod_003_1".to_string()].into(),
        ..Default::default()
    };
    let executor = FakeExecutor::default().fail("mod_000", "ttir.relu");
    let (root, exporter, executor, _tmp) = run(records(), exporter, executor, Mode::Full);

    assert_eq!(status(&root, "mod_003_1"), Status::IrExportFailed);
    assert_eq!(status(&root, "mod_004_act"), Status::Success);
    assert!(exporter.calls.contains(&"mod_004_act".to_string()));
    assert!(!executor.calls.contains(&"mod_003_1".to_string()));
    assert_eq!(status(&root, "mod_001_blocks"), Status::Failed);
}

#[test]
fn test_export_without_ir_is_export_failure() {
    let exporter = FakeExporter {
        no_ir: ["mod_000".to_string()].into(),
        ..Default::default()
    };
    let (root, _, executor, _tmp) = run(records(), exporter, FakeExecutor::default(), Mode::Full);
    assert_eq!(root.status, Status::IrExportFailed);
    assert!(!executor.calls.contains(&"mod_000".to_string()));
    assert_eq!(status(&root, "mod_002_0"), Status::Success);
    assert_eq!(status(&root, "mod_005_head"), Status::Success);
}

#[test]
fn test_timeout_and_no_ops() {
    let executor = FakeExecutor::default()
        .with("mod_000", TestOutcome::TimedOut(Duration::from_secs(1800)))
        .with("mod_004_act", TestOutcome::NoOperations)
        .fail("mod_003_1", "ttir.relu");
    let (root, _, _, _tmp) = run(records(), FakeExporter::default(), executor, Mode::Full);

    assert_eq!(root.status, Status::Failed);
    assert_eq!(root.failed_ops[0].op_name, "TIMEOUT");
    assert_eq!(status(&root, "mod_004_act"), Status::Skipped);
    assert!(!statuses(&root).contains(&Status::Unknown));
}

#[test]
fn test_reaggregation_flips_containers() {
    let executor = FakeExecutor::default().fail("mod_002_c", "op_x");
    let (mut root, _, _, _tmp) = run(abc(), FakeExporter::default(), executor, Mode::Full);
    assert_eq!(root.status, Status::Failed);

    let c = root.find_mut("mod_002_c").unwrap();
    c.status = Status::Success;
    c.failed_ops.clear();
    assert_eq!(aggregate_containers(&mut root), Status::InheritedSuccess);

    root.find_mut("mod_001_b").unwrap().status = Status::IrExportFailed;
    assert_eq!(aggregate_containers(&mut root), Status::Failed);
}

#[test]
fn test_annotated_document() {
    let executor = FakeExecutor::default()
        .fail("mod_000", "ttir.relu")
        .fail("mod_003_1", "ttir.relu")
        .fail("mod_004_act", "ttir.relu");
    let (root, _, _, tmp) = run(records(), FakeExporter::default(), executor, Mode::Full);

    let mut set = ModuleSet {
        modules: records(),
        ..Default::default()
    };
    set.annotate(&root);
    assert_eq!(set.get("mod_001_blocks").unwrap().status, Status::Failed);
    assert_eq!(set.get("mod_004_act").unwrap().failed_ops.len(), 1);

    let failures = unique_failures(&set);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].modules, "mod_000;mod_003_1;mod_004_act");

    let path = tmp.path().join("unique_modules.json");
    set.write(&path).unwrap();
    let back = ModuleSet::from_file(&path).unwrap();
    assert_eq!(back, set);
    assert!(tmp
        .path()
        .join("module_irs/mod_004_act/irs/ttir_mod_004_act.mlir")
        .exists());
}
