/*!
Walker for the maple tree holding the memory areas of a process since Linux 6.1.

Entries are tagged pointers. Nodes are 256 byte aligned, the low byte of an encoded node
carries its type in bits 3 to 6. The root pointer in `mm_mt.ma_root` additionally has
bit 1 set to mark it as a node instead of a single stored value.
*/

use crate::kernel::budget::{BudgetTracker, WalkStatus};

use guestwalk::mem::{PhysicalMemory, VirtualView};
use guestwalk::types::VirtualAddress;

use hashbrown::HashSet;
use log::trace;

const MAPLE_NODE_MASK: u64 = 0xff;
const MAPLE_NODE_TYPE_SHIFT: u64 = 3;
const MAPLE_NODE_TYPE_MASK: u64 = 0xf;

/// Internal entries below this value are reserved markers, not nodes.
const MAPLE_RESERVED_LIMIT: u64 = 4096;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum MapleType {
    Dense,
    Leaf64,
    Range64,
    Arange64,
}

impl MapleType {
    fn from_enode(enode: u64) -> Option<Self> {
        match (enode >> MAPLE_NODE_TYPE_SHIFT) & MAPLE_NODE_TYPE_MASK {
            0 => Some(MapleType::Dense),
            1 => Some(MapleType::Leaf64),
            2 => Some(MapleType::Range64),
            3 => Some(MapleType::Arange64),
            _ => None,
        }
    }

    fn is_leaf(self) -> bool {
        matches!(self, MapleType::Dense | MapleType::Leaf64)
    }

    /// Offset and count of the slot array inside the node.
    fn slots(self) -> (u64, usize) {
        match self {
            MapleType::Dense => (8, 31),
            MapleType::Leaf64 | MapleType::Range64 => (128, 16),
            MapleType::Arange64 => (80, 10),
        }
    }

    #[cfg(test)]
    pub(crate) fn encode(self, node: VirtualAddress) -> u64 {
        let ty = match self {
            MapleType::Dense => 0,
            MapleType::Leaf64 => 1,
            MapleType::Range64 => 2,
            MapleType::Arange64 => 3,
        };
        node.as_u64() | (ty << MAPLE_NODE_TYPE_SHIFT) | 0b100
    }

    #[cfg(test)]
    pub(crate) fn encode_root(self, node: VirtualAddress) -> u64 {
        self.encode(node) | 0b10
    }
}

/// Returns true if a root entry refers to a node rather than a single value.
fn is_root_node(entry: u64) -> bool {
    entry & 0b11 == 0b10 && entry > MAPLE_RESERVED_LIMIT
}

/// Most slots of any node type.
const MAPLE_MAX_SLOTS: usize = 31;

pub(crate) struct MapleWalk<'a, 'b, T> {
    view: &'a mut VirtualView<T>,
    /// ticked per collected entry
    tracker: &'b mut BudgetTracker,
    /// ticked per visited node
    nodes: BudgetTracker,
    max_depth: usize,
    visited: HashSet<VirtualAddress>,
    status: WalkStatus,
}

impl<'a, 'b, T: PhysicalMemory> MapleWalk<'a, 'b, T> {
    pub fn new(
        view: &'a mut VirtualView<T>,
        tracker: &'b mut BudgetTracker,
        nodes: BudgetTracker,
        max_depth: usize,
    ) -> Self {
        Self {
            view,
            tracker,
            nodes,
            max_depth,
            visited: HashSet::new(),
            status: WalkStatus::Complete,
        }
    }

    /// Collects the stored entries of the tree with the given root, in index order.
    pub fn collect(mut self, root: u64) -> (Vec<VirtualAddress>, WalkStatus) {
        let mut out = Vec::new();
        if root == 0 {
            return (out, self.status);
        }

        if is_root_node(root) {
            self.walk_node(root & !0b10, 0, &mut out);
        } else {
            // a tree holding a single entry stores it directly in the root
            let entry = VirtualAddress::from(root);
            if !self.view.walker().arch().is_kernel_address(entry) {
                self.status = WalkStatus::Broken;
            } else if self.tracker.tick() {
                out.push(entry);
            } else {
                self.status = WalkStatus::Exhausted;
            }
        }
        (out, self.status)
    }

    fn walk_node(&mut self, enode: u64, depth: usize, out: &mut Vec<VirtualAddress>) {
        if depth > self.max_depth {
            trace!("maple tree deeper than {}", self.max_depth);
            self.status = self.status.merge(WalkStatus::Exhausted);
            return;
        }

        let node = VirtualAddress::from(enode & !MAPLE_NODE_MASK);
        let ty = match MapleType::from_enode(enode) {
            Some(ty) => ty,
            None => {
                trace!("maple node {} has an unknown type", node);
                self.status = self.status.merge(WalkStatus::Broken);
                return;
            }
        };
        if !self.view.walker().arch().is_kernel_address(node) {
            trace!("maple node {} is not a kernel address", node);
            self.status = self.status.merge(WalkStatus::Broken);
            return;
        }
        if !self.visited.insert(node) {
            self.status = self.status.merge(WalkStatus::Cycle);
            return;
        }
        if !self.nodes.tick() {
            self.status = self.status.merge(WalkStatus::Exhausted);
            return;
        }

        let (offset, count) = ty.slots();
        let mut buf = [0u64; MAPLE_MAX_SLOTS];
        let slots = &mut buf[..count];
        if let Err(err) = self.view.read_into(node + offset, slots) {
            trace!("unable to read maple node {}: {}", node, err);
            self.status = self.status.merge(WalkStatus::Broken);
            return;
        }

        let entries = slots
            .iter()
            .map(|&e| u64::from_le(e))
            .filter(|&e| e != 0)
            .collect::<Vec<_>>();

        for entry in entries.into_iter() {
            if self.status == WalkStatus::Exhausted {
                return;
            }
            if ty.is_leaf() {
                let entry = VirtualAddress::from(entry);
                // reserved and zero entries have low tag bits set
                if entry.as_u64() & 0b111 != 0
                    || !self.view.walker().arch().is_kernel_address(entry)
                {
                    continue;
                }
                if !self.tracker.tick() {
                    self.status = self.status.merge(WalkStatus::Exhausted);
                    return;
                }
                out.push(entry);
            } else {
                self.walk_node(entry, depth + 1, out);
            }
        }
    }
}
