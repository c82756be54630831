use super::files::{FileList, InodeMap};
use super::process::ProcessRecord;
use super::vma::RegionList;
use crate::kernel::{KernelRoot, WalkStatus};

use std::collections::{BTreeMap, VecDeque};

use guestwalk::types::VirtualAddress;

use serde::Serialize;

/// Selects the per process walks of a discovery run.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DiscoveryOptions {
    pub regions: bool,
    pub files: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            regions: true,
            files: true,
        }
    }
}

impl DiscoveryOptions {
    /// Only walks the task list.
    pub fn processes_only() -> Self {
        Self {
            regions: false,
            files: false,
        }
    }
}

/// A process with the results of its sub walks.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessDetails {
    #[serde(flatten)]
    pub record: ProcessRecord,
    pub regions: Option<RegionList>,
    pub files: Option<FileList>,
}

/// A node of the parent / child tree. Links are indices into [`ProcessTree::nodes`].
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ProcessNode {
    pub pid: u32,
    pub name: String,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

/// The parent / child relation of the discovered processes.
///
/// Stored flat so that arbitrarily deep parent chains read from the guest neither build,
/// serialize nor drop through recursion.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
pub struct ProcessTree {
    pub nodes: Vec<ProcessNode>,
    pub roots: Vec<usize>,
}

impl ProcessTree {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> impl Iterator<Item = &ProcessNode> {
        self.roots.iter().map(move |&i| &self.nodes[i])
    }

    pub fn children<'a>(&'a self, node: &'a ProcessNode) -> impl Iterator<Item = &'a ProcessNode> {
        node.children.iter().map(move |&i| &self.nodes[i])
    }

    pub fn parent(&self, node: &ProcessNode) -> Option<&ProcessNode> {
        node.parent.map(|i| &self.nodes[i])
    }

    pub fn node(&self, pid: u32) -> Option<&ProcessNode> {
        self.nodes.iter().find(|n| n.pid == pid)
    }

    /// Number of ancestors of the node.
    pub fn depth(&self, node: &ProcessNode) -> usize {
        let mut depth = 0;
        let mut cur = node.parent;
        while let Some(idx) = cur {
            depth += 1;
            cur = self.nodes[idx].parent;
        }
        depth
    }
}

/// Merged walk status per kind of walk.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct Completeness {
    pub processes: WalkStatus,
    pub regions: WalkStatus,
    pub files: WalkStatus,
}

impl Completeness {
    pub fn is_complete(&self) -> bool {
        !(self.processes.is_partial() || self.regions.is_partial() || self.files.is_partial())
    }
}

/// Everything a discovery run found out about the guest.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryResult {
    pub kernel_root: KernelRoot,
    /// name of the offset table in use
    pub offsets: String,
    pub init_task: VirtualAddress,
    pub processes: Vec<ProcessDetails>,
    pub inodes: InodeMap,
    pub tree: ProcessTree,
    pub completeness: Completeness,
}

impl DiscoveryResult {
    pub fn process(&self, pid: u32) -> Option<&ProcessDetails> {
        self.processes.iter().find(|p| p.record.pid == pid)
    }

    pub fn is_complete(&self) -> bool {
        self.completeness.is_complete()
    }
}

/// Builds the process tree from the parent pids of the records.
///
/// Processes without a known parent, or whose parent is itself, become roots. Children are
/// kept in walk order, nodes are laid out breadth first.
pub fn process_tree(records: &[ProcessRecord]) -> ProcessTree {
    let index = records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.pid, i))
        .collect::<BTreeMap<_, _>>();

    let mut children: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    let mut roots = Vec::new();
    for (i, record) in records.iter().enumerate() {
        match record.parent_pid.and_then(|ppid| index.get(&ppid)) {
            Some(&parent) if parent != i => children.entry(parent).or_default().push(i),
            _ => roots.push(i),
        }
    }

    // a parent cycle never reaches a root, those processes are not part of the tree
    let mut tree = ProcessTree::default();
    let mut placed = vec![false; records.len()];
    let mut queue = VecDeque::new();
    for root in roots.into_iter() {
        placed[root] = true;
        tree.roots.push(tree.nodes.len());
        queue.push_back((root, None));
        tree.nodes.push(node_of(&records[root], None));
    }

    let mut next = 0;
    while let Some((rec, parent)) = queue.pop_front() {
        let node = next;
        next += 1;
        debug_assert_eq!(tree.nodes[node].parent, parent);
        if let Some(kids) = children.get(&rec) {
            for &kid in kids.iter() {
                if placed[kid] {
                    continue;
                }
                placed[kid] = true;
                let kid_node = tree.nodes.len();
                tree.nodes.push(node_of(&records[kid], Some(node)));
                tree.nodes[node].children.push(kid_node);
                queue.push_back((kid, Some(node)));
            }
        }
    }
    tree
}

fn node_of(record: &ProcessRecord, parent: Option<usize>) -> ProcessNode {
    ProcessNode {
        pid: record.pid,
        name: record.name.clone(),
        parent,
        children: Vec::new(),
    }
}

pub(crate) fn merge_status<I: Iterator<Item = WalkStatus>>(iter: I) -> WalkStatus {
    iter.fold(WalkStatus::Complete, WalkStatus::merge)
}
