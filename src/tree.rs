use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

use thiserror::Error;

use crate::{
    module::{is_root_path, parent_path, ModuleRecord, Status},
    report::FailedOperation,
};

#[derive(Debug, Error, PartialEq)]
pub enum TreeError {
    #[error("module list is empty")]
    Empty,
    #[error("no root module (a module without a parent)")]
    NoRoot,
    #[error("more than one root module: {0:?}")]
    MultipleRoots(Vec<String>),
    #[error("module path {0} appears more than once")]
    DuplicatePath(String),
    #[error("modules not reachable from the root: {0:?}")]
    Detached(Vec<String>),
}

#[derive(Clone, Debug)]
pub struct ModuleNode {
    pub record: ModuleRecord,
    pub children: Vec<ModuleNode>,
    pub status: Status,
    pub failed_ops: Vec<FailedOperation>,
    pub report_path: Option<PathBuf>,
}

impl ModuleNode {
    pub fn new(record: ModuleRecord) -> Self {
        ModuleNode {
            record,
            children: Vec::new(),
            status: Status::Unknown,
            failed_ops: Vec::new(),
            report_path: None,
        }
    }

    pub fn with_children(mut self, children: Vec<ModuleNode>) -> Self {
        self.children = children;
        self
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn is_container(&self) -> bool {
        self.record.is_container()
    }

    /// Pre-order visit of this node and all its descendants.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a ModuleNode)) {
        f(self);
        for child in &self.children {
            child.walk(f);
        }
    }

    pub fn walk_mut(&mut self, f: &mut impl FnMut(&mut ModuleNode)) {
        f(self);
        for child in self.children.iter_mut() {
            child.walk_mut(f);
        }
    }

    pub fn find(&self, id: &str) -> Option<&ModuleNode> {
        if self.record.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut ModuleNode> {
        if self.record.id == id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|c| c.find_mut(id))
    }

    pub fn subtree_size(&self) -> usize {
        1 + self.children.iter().map(ModuleNode::subtree_size).sum::<usize>()
    }

    pub fn set_subtree(&mut self, status: Status) {
        self.walk_mut(&mut |node| node.status = status);
    }

    pub fn set_descendants(&mut self, status: Status) {
        for child in self.children.iter_mut() {
            child.set_subtree(status);
        }
    }

    pub fn pretty_print(&self) -> String {
        let mut out = String::new();
        self.pretty_print_into(&mut out, 0);
        out
    }

    fn pretty_print_into(&self, out: &mut String, depth: usize) {
        out.push_str(&format!(
            "{}{} ({}) [{}]\n",
            "  ".repeat(depth),
            self.record.id,
            self.record.class_name,
            self.status
        ));
        for child in &self.children {
            child.pretty_print_into(out, depth + 1);
        }
    }
}

/// Nearest ancestor of `path` that is itself a module.
fn nearest_ancestor(path: &str, index: &BTreeMap<&str, usize>) -> Option<usize> {
    let mut ancestor = parent_path(path);
    while let Some(candidate) = ancestor {
        if is_root_path(&candidate) {
            return None;
        }
        if let Some(&i) = index.get(candidate.as_str()) {
            return Some(i);
        }
        ancestor = parent_path(&candidate);
    }
    None
}

pub fn build_tree(modules: &[ModuleRecord]) -> Result<ModuleNode, TreeError> {
    if modules.is_empty() {
        return Err(TreeError::Empty);
    }

    let mut index = BTreeMap::new();
    for (i, m) in modules.iter().enumerate() {
        if index.insert(m.module_path.as_str(), i).is_some() {
            return Err(TreeError::DuplicatePath(m.module_path.clone()));
        }
    }

    let roots: Vec<usize> = (0..modules.len())
        .filter(|&i| modules[i].parent.is_none())
        .collect();
    let root = match roots.as_slice() {
        [] => return Err(TreeError::NoRoot),
        [root] => *root,
        _ => {
            return Err(TreeError::MultipleRoots(
                roots.iter().map(|&i| modules[i].module_path.clone()).collect(),
            ))
        }
    };

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); modules.len()];
    for (i, m) in modules.iter().enumerate() {
        let Some(parent) = &m.parent else {
            continue;
        };
        let parent_idx = index
            .get(parent.as_str())
            .copied()
            .or_else(|| nearest_ancestor(&m.module_path, &index))
            .unwrap_or(root);
        children[parent_idx].push(i);
    }

    let mut visited = BTreeSet::new();
    let tree = assemble(root, modules, &children, &mut visited);
    if visited.len() != modules.len() {
        let detached = (0..modules.len())
            .filter(|i| !visited.contains(i))
            .map(|i| modules[i].module_path.clone())
            .collect();
        return Err(TreeError::Detached(detached));
    }
    Ok(tree)
}

fn assemble(
    idx: usize,
    modules: &[ModuleRecord],
    children: &[Vec<usize>],
    visited: &mut BTreeSet<usize>,
) -> ModuleNode {
    visited.insert(idx);
    let kids = children[idx]
        .iter()
        .filter(|&&c| !visited.contains(&c))
        .copied()
        .collect::<Vec<_>>();
    let kids = kids
        .into_iter()
        .map(|c| assemble(c, modules, children, visited))
        .collect();
    ModuleNode::new(modules[idx].clone()).with_children(kids)
}
