//! Hierarchical op-by-op analysis.
//!
//! The tree is walked depth first from the root. Each computational node is
//! exported to IR and its ops are run one by one on the device. A passing
//! node vouches for its whole subtree; a failing one is broken down into its
//! children to find the culprit. Containers have no ops of their own and
//! take their status from their children once the walk is over.

use std::{path::PathBuf, time::Duration};

use crate::{
    layout::{ModuleWorkdir, OutputLayout},
    module::{ModuleRecord, Status},
    report::FailedOperation,
    runner::TaskExit,
    tree::ModuleNode,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Full,
    /// Only test the root, everything below it is skipped.
    RootOnly,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TestOutcome {
    Passed {
        report_path: Option<PathBuf>,
    },
    Failed {
        failed_ops: Vec<FailedOperation>,
        report_path: Option<PathBuf>,
    },
    /// The IR holds nothing to run.
    NoOperations,
    TimedOut(Duration),
}

pub trait IrExporter {
    /// Export IR for `record` into `workdir`. Whether it worked is judged by
    /// the files left in `workdir`, not by the exit.
    fn export(&mut self, record: &ModuleRecord, workdir: &ModuleWorkdir) -> TaskExit;
}

pub trait OpExecutor {
    fn execute(&mut self, record: &ModuleRecord, workdir: &ModuleWorkdir) -> TestOutcome;
}

pub struct Analyzer<E, X> {
    layout: OutputLayout,
    exporter: E,
    executor: X,
}

impl<E: IrExporter, X: OpExecutor> Analyzer<E, X> {
    pub fn new(layout: OutputLayout, exporter: E, executor: X) -> Self {
        Analyzer {
            layout,
            exporter,
            executor,
        }
    }

    pub fn into_parts(self) -> (E, X) {
        (self.exporter, self.executor)
    }

    /// Gives every node of the tree a terminal status.
    pub fn analyze(&mut self, root: &mut ModuleNode, mode: Mode) {
        self.visit(root, mode, true);
        aggregate_containers(root);
    }

    fn visit(&mut self, node: &mut ModuleNode, mode: Mode, is_root_call: bool) {
        if mode == Mode::RootOnly && !is_root_call {
            log::info!("  {} ({}): skipped (root only)", node.id(), node.record.class_name);
            node.set_subtree(Status::Skipped);
            return;
        }

        if node.is_container() {
            log::info!("  {} ({}): skipped (container)", node.id(), node.record.class_name);
            node.status = Status::Skipped;
            self.visit_children(node, mode);
            return;
        }

        log::info!("  {} ({}):", node.id(), node.record.class_name);
        let workdir = self.layout.module(node.id());

        let exit = self.exporter.export(&node.record, &workdir);
        let exported = match &exit {
            TaskExit::TimedOut(after) => {
                log::warn!("    IR export timed out after {:?}", after);
                false
            }
            TaskExit::SpawnError(e) => {
                log::warn!("    IR export could not start: {}", e);
                false
            }
            TaskExit::Success | TaskExit::Failed(_) => {
                let has_ir = workdir.has_ir();
                if has_ir && !exit.success() {
                    log::info!("    IR exported (exit error ignored)");
                } else if !has_ir {
                    log::warn!("    IR export failed, see {}", workdir.run_log().display());
                }
                has_ir
            }
        };
        if !exported {
            node.status = Status::IrExportFailed;
            self.descend_or_skip(node, mode);
            return;
        }

        log::info!("    running op-by-op...");
        match self.executor.execute(&node.record, &workdir) {
            TestOutcome::NoOperations => {
                log::info!("    no ops to test");
                node.status = Status::Skipped;
                self.descend_or_skip(node, mode);
            }
            TestOutcome::Passed { report_path } => {
                node.status = Status::Success;
                node.report_path = report_path;
                match mode {
                    Mode::Full => {
                        log::info!("    SUCCESS - marking subtree");
                        node.set_descendants(Status::InheritedSuccess);
                    }
                    Mode::RootOnly => {
                        log::info!("    SUCCESS");
                        node.set_descendants(Status::Skipped);
                    }
                }
            }
            TestOutcome::Failed {
                failed_ops,
                report_path,
            } => {
                log::info!("    FAILED - {} ops", failed_ops.len());
                node.status = Status::Failed;
                node.failed_ops = failed_ops;
                node.report_path = report_path;
                self.descend_or_skip(node, mode);
            }
            TestOutcome::TimedOut(after) => {
                log::warn!("    op-by-op timed out after {:?}", after);
                node.status = Status::Failed;
                node.failed_ops = vec![FailedOperation::new(
                    "TIMEOUT",
                    format!("op-by-op run exceeded {}s", after.as_secs()),
                )];
                self.descend_or_skip(node, mode);
            }
        }
    }

    fn visit_children(&mut self, node: &mut ModuleNode, mode: Mode) {
        for child in node.children.iter_mut() {
            self.visit(child, mode, false);
        }
    }

    /// Full mode narrows a problem down into the children, root-only mode
    /// stops here.
    fn descend_or_skip(&mut self, node: &mut ModuleNode, mode: Mode) {
        match mode {
            Mode::Full => self.visit_children(node, mode),
            Mode::RootOnly => node.set_descendants(Status::Skipped),
        }
    }
}

/// Post-order pass deriving container statuses from their children.
/// Returns the status of `node`.
pub fn aggregate_containers(node: &mut ModuleNode) -> Status {
    for child in node.children.iter_mut() {
        aggregate_containers(child);
    }
    if !node.is_container() || node.children.is_empty() {
        return node.status;
    }
    node.status = container_status(node.children.iter().map(|c| c.status));
    node.status
}

pub fn container_status(children: impl Iterator<Item = Status> + Clone) -> Status {
    if children.clone().any(|s| s.is_failure()) {
        Status::Failed
    } else if children.clone().all(|s| s.is_success()) {
        Status::InheritedSuccess
    } else if children.clone().all(|s| matches!(s, Status::Skipped | Status::Unknown)) {
        Status::Skipped
    } else {
        // TODO: a distinct partial status would read better than inheriting
        Status::InheritedSuccess
    }
}
