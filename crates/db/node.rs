use std::fmt;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use smallvec::SmallVec;

use crate::nibbles::{Nibbles, NibblesView};
use crate::offset::{
    ChunkOffset, CompactVirtualOffset, INVALID_COMPACT_OFFSET, INVALID_OFFSET,
};

/// Node commitment bytes: either a 32-byte hash or a shorter inline encoding,
/// depending on the compute function.
pub type NodeData = SmallVec<[u8; 32]>;

/// A child slot of a [`Node`]. Slots are stored densely in branch order over
/// the set bits of the parent's mask.
///
/// `next` is populated at most once: either at construction time (in-memory
/// tries, or when the state machine asks to cache the subtrie) or the first
/// time the child is loaded from disk. A child's identity never changes after
/// its parent is built, so set-once is sufficient.
pub struct Child {
    /// Physical location of the child, [`INVALID_OFFSET`] until written.
    pub fnext: ChunkOffset,
    next: OnceLock<Arc<Node>>,
    /// The child's commitment, so parents hash without loading children.
    pub data: NodeData,
    pub min_offset_fast: CompactVirtualOffset,
    pub min_offset_slow: CompactVirtualOffset,
    pub subtrie_min_version: u64,
}

impl Child {
    pub fn new(
        fnext: ChunkOffset,
        data: NodeData,
        min_offset_fast: CompactVirtualOffset,
        min_offset_slow: CompactVirtualOffset,
        subtrie_min_version: u64,
    ) -> Self {
        Self {
            fnext,
            next: OnceLock::new(),
            data,
            min_offset_fast,
            min_offset_slow,
            subtrie_min_version,
        }
    }

    /// A slot holding an in-memory child that has not been written yet.
    pub fn from_node(node: Arc<Node>) -> Self {
        let child = Self {
            fnext: INVALID_OFFSET,
            next: OnceLock::new(),
            data: node.data.clone(),
            min_offset_fast: INVALID_COMPACT_OFFSET,
            min_offset_slow: INVALID_COMPACT_OFFSET,
            subtrie_min_version: node.subtrie_min_version(),
        };
        let _ = child.next.set(node);
        child
    }

    pub fn loaded(&self) -> Option<&Arc<Node>> {
        self.next.get()
    }

    /// Records the loaded child. A concurrent or repeated load of the same
    /// child is dropped; the first pointer wins.
    pub fn set_loaded(&self, node: Arc<Node>) -> &Arc<Node> {
        self.next.get_or_init(|| node)
    }

    /// Forget the in-memory copy (used when the state machine declines to
    /// cache a subtrie while its parent is still under construction).
    pub fn unload(&mut self) {
        self.next = OnceLock::new();
    }

    pub fn is_on_disk(&self) -> bool {
        !self.fnext.is_invalid()
    }
}

impl Clone for Child {
    fn clone(&self) -> Self {
        let next = OnceLock::new();
        if let Some(node) = self.next.get() {
            let _ = next.set(node.clone());
        }
        Self {
            fnext: self.fnext,
            next,
            data: self.data.clone(),
            min_offset_fast: self.min_offset_fast,
            min_offset_slow: self.min_offset_slow,
            subtrie_min_version: self.subtrie_min_version,
        }
    }
}

impl fmt::Debug for Child {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Child")
            .field("fnext", &self.fnext)
            .field("loaded", &self.next.get().is_some())
            .field("data", &hex_fmt(&self.data))
            .field("min_offset_fast", &self.min_offset_fast)
            .field("min_offset_slow", &self.min_offset_slow)
            .field("subtrie_min_version", &self.subtrie_min_version)
            .finish()
    }
}

/// The unified trie node: extension (non-empty `path`), branch (≥ 2 children)
/// and leaf (a value) are all the same entity.
///
/// Nodes are immutable once their upsert finishes; copy-on-write means a
/// changed subtrie is a fresh `Node`, never an edit of an old one.
pub struct Node {
    /// Bit *i* set ⇔ a child exists on nibble *i*.
    pub mask: u16,
    /// Compressed path fragment above the branch point. May be empty.
    pub path: Nibbles,
    pub value: Option<Bytes>,
    /// Version at which this node was created.
    pub version: u64,
    /// Commitment of this node, from the pluggable compute function.
    pub data: NodeData,
    children: Vec<Child>,
}

impl Node {
    pub fn new_leaf(path: Nibbles, value: Bytes, version: u64) -> Self {
        Self {
            mask: 0,
            path,
            value: Some(value),
            version,
            data: NodeData::new(),
            children: Vec::new(),
        }
    }

    pub fn new_branch(path: Nibbles, value: Option<Bytes>, version: u64) -> Self {
        Self {
            mask: 0,
            path,
            value,
            version,
            data: NodeData::new(),
            children: Vec::new(),
        }
    }

    pub fn number_of_children(&self) -> usize {
        self.mask.count_ones() as usize
    }

    pub fn has_child(&self, branch: u8) -> bool {
        self.mask & (1 << branch) != 0
    }

    /// Dense index of `branch` among the set bits of the mask.
    pub fn child_index(&self, branch: u8) -> usize {
        (self.mask & ((1u16 << branch) - 1)).count_ones() as usize
    }

    pub fn child(&self, branch: u8) -> Option<&Child> {
        self.has_child(branch)
            .then(|| &self.children[self.child_index(branch)])
    }

    pub fn child_mut(&mut self, branch: u8) -> Option<&mut Child> {
        if self.has_child(branch) {
            let idx = self.child_index(branch);
            Some(&mut self.children[idx])
        } else {
            None
        }
    }

    pub fn child_at(&self, index: usize) -> &Child {
        &self.children[index]
    }

    /// Iterate `(branch, child)` in ascending branch order.
    pub fn branches(&self) -> impl Iterator<Item = (u8, &Child)> {
        let mask = self.mask;
        (0u8..16)
            .filter(move |b| mask & (1 << b) != 0)
            .zip(self.children.iter())
            .map(|(b, c)| (b, c))
    }

    /// Insert or replace the child on `branch`.
    pub fn set_child(&mut self, branch: u8, child: Child) {
        let idx = self.child_index(branch);
        if self.has_child(branch) {
            self.children[idx] = child;
        } else {
            self.mask |= 1 << branch;
            self.children.insert(idx, child);
        }
    }

    pub fn remove_child(&mut self, branch: u8) -> Option<Child> {
        if !self.has_child(branch) {
            return None;
        }
        let idx = self.child_index(branch);
        self.mask &= !(1 << branch);
        Some(self.children.remove(idx))
    }

    /// The sole child of a single-child node, with its branch nibble.
    pub fn single_child(&mut self) -> Option<(u8, Child)> {
        if self.number_of_children() != 1 {
            return None;
        }
        let branch = self.mask.trailing_zeros() as u8;
        self.remove_child(branch).map(|child| (branch, child))
    }

    pub fn path_view(&self) -> NibblesView<'_> {
        self.path.view()
    }

    /// Minimum fast/slow offsets referenced by this node's subtries. The
    /// node's own location is accounted for by the parent slot pointing here.
    pub fn min_offsets(&self) -> (CompactVirtualOffset, CompactVirtualOffset) {
        let mut fast = INVALID_COMPACT_OFFSET;
        let mut slow = INVALID_COMPACT_OFFSET;
        for child in &self.children {
            fast = fast.min(child.min_offset_fast);
            slow = slow.min(child.min_offset_slow);
        }
        (fast, slow)
    }

    /// Minimum version across this node and everything below it.
    pub fn subtrie_min_version(&self) -> u64 {
        self.children
            .iter()
            .map(|c| c.subtrie_min_version)
            .fold(self.version, u64::min)
    }

    /// A node must branch, carry a value, or be the root; a single-child
    /// valueless node should have been collapsed into its child.
    pub fn is_well_formed(&self) -> bool {
        self.number_of_children() >= 2 || self.value.is_some()
    }
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Self {
            mask: self.mask,
            path: self.path.clone(),
            value: self.value.clone(),
            version: self.version,
            data: self.data.clone(),
            children: self.children.clone(),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("mask", &format_args!("{:#06x}", self.mask))
            .field("path", &self.path)
            .field("value", &self.value.as_ref().map(|v| hex_fmt(v)))
            .field("version", &self.version)
            .field("data", &hex_fmt(&self.data))
            .field("children", &self.children)
            .finish()
    }
}

fn hex_fmt(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Position within a node reached by a descent: `prefix_index` counts the
/// nibbles of `node.path` already consumed.
#[derive(Clone, Debug)]
pub struct NodeCursor {
    pub node: Arc<Node>,
    pub prefix_index: usize,
}

impl NodeCursor {
    pub fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            prefix_index: 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn leaf(version: u64) -> Arc<Node> {
        Arc::new(Node::new_leaf(
            Nibbles::from_nibbles(&[1, 2]),
            Bytes::from_static(b"v"),
            version,
        ))
    }

    #[test]
    fn dense_child_indexing() {
        let mut node = Node::new_branch(Nibbles::empty(), None, 0);
        node.set_child(0xa, Child::from_node(leaf(1)));
        node.set_child(0x2, Child::from_node(leaf(2)));
        node.set_child(0xf, Child::from_node(leaf(3)));

        assert_eq!(node.number_of_children(), 3);
        assert_eq!(node.child_index(0x2), 0);
        assert_eq!(node.child_index(0xa), 1);
        assert_eq!(node.child_index(0xf), 2);
        assert!(node.child(0x3).is_none());

        let order: Vec<u8> = node.branches().map(|(b, _)| b).collect();
        assert_eq!(order, vec![0x2, 0xa, 0xf]);
    }

    #[test]
    fn remove_and_single_child() {
        let mut node = Node::new_branch(Nibbles::empty(), None, 0);
        node.set_child(0x1, Child::from_node(leaf(5)));
        node.set_child(0x8, Child::from_node(leaf(9)));
        assert!(node.remove_child(0x1).is_some());
        let (branch, child) = node.single_child().expect("one child left");
        assert_eq!(branch, 0x8);
        assert_eq!(child.subtrie_min_version, 9);
        assert_eq!(node.number_of_children(), 0);
    }

    #[test]
    fn min_version_rollup() {
        let mut node = Node::new_branch(Nibbles::empty(), None, 7);
        node.set_child(0x0, Child::from_node(leaf(3)));
        node.set_child(0x1, Child::from_node(leaf(11)));
        assert_eq!(node.subtrie_min_version(), 3);
    }

    #[test]
    fn set_loaded_is_idempotent() {
        let child = Child::new(
            INVALID_OFFSET,
            NodeData::new(),
            INVALID_COMPACT_OFFSET,
            INVALID_COMPACT_OFFSET,
            0,
        );
        let first = leaf(1);
        let second = leaf(2);
        assert_eq!(child.set_loaded(first.clone()).version, 1);
        // second load of the same slot keeps the first pointer
        assert_eq!(child.set_loaded(second).version, 1);
        assert_eq!(child.loaded().map(|n| n.version), Some(1));
    }
}
