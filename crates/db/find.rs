//! Key lookup and trie traversal, shared by the writer-side drivers and the
//! blocking read-only path.

use std::sync::Arc;

use crate::error::{DbError, FindResult};
use crate::machine::{INVALID_BRANCH, TraverseMachine, TraverseStep};
use crate::node::{Node, NodeCursor};
use crate::offset::ChunkOffset;
use crate::update::UpdateAux;

/// Where missing nodes come from: the writer loads through its ring and
/// attaches into the resident trie, the read-only path through its own pool
/// and pinned cache.
pub trait NodeSource {
    fn load(&mut self, offset: ChunkOffset) -> Result<Arc<Node>, DbError>;
}

impl NodeSource for UpdateAux {
    fn load(&mut self, offset: ChunkOffset) -> Result<Arc<Node>, DbError> {
        self.read_node(offset)
    }
}

fn child_node(
    src: &mut dyn NodeSource,
    node: &Node,
    branch: u8,
) -> Result<Option<Arc<Node>>, DbError> {
    let Some(child) = node.child(branch) else {
        return Ok(None);
    };
    if let Some(resident) = child.loaded() {
        return Ok(Some(resident.clone()));
    }
    let loaded = src.load(child.fnext)?;
    Ok(Some(child.set_loaded(loaded).clone()))
}

/// Walk `key` down from `root`. On success the cursor rests on the node
/// whose accumulated path equals the key (it may or may not carry a value).
pub fn find(
    src: &mut dyn NodeSource,
    root: Arc<Node>,
    key: &crate::nibbles::Nibbles,
) -> Result<(NodeCursor, FindResult), DbError> {
    let key_view = key.view();
    let mut node = root;
    let mut consumed = 0usize;
    loop {
        let remaining = key_view.suffix(consumed);
        let path = node.path_view();
        let common = remaining.common_prefix_len(path);
        if common < path.len() {
            let result = if common == remaining.len() {
                FindResult::KeyEndsEarly
            } else {
                FindResult::PathMismatch
            };
            return Ok((
                NodeCursor {
                    node,
                    prefix_index: common,
                },
                result,
            ));
        }
        consumed += path.len();
        if consumed == key_view.len() {
            let prefix_index = node.path.len();
            return Ok((
                NodeCursor { node, prefix_index },
                FindResult::Success,
            ));
        }
        let branch = key_view.get(consumed);
        match child_node(src, &node, branch)? {
            Some(next) => {
                node = next;
                consumed += 1;
            }
            None => {
                let prefix_index = node.path.len();
                return Ok((
                    NodeCursor { node, prefix_index },
                    FindResult::KeyNotFound,
                ));
            }
        }
    }
}

/// Depth-first walk of the subtrie under `root`. `still_valid` is consulted
/// before every descent; the walk aborts with `Ok(false)` the moment the
/// version it serves disappears from the ring.
pub fn traverse(
    src: &mut dyn NodeSource,
    root: Arc<Node>,
    machine: &mut dyn TraverseMachine,
    still_valid: &mut dyn FnMut() -> bool,
) -> Result<bool, DbError> {
    traverse_node(src, root, INVALID_BRANCH, machine, still_valid)
}

fn traverse_node(
    src: &mut dyn NodeSource,
    node: Arc<Node>,
    branch: u8,
    machine: &mut dyn TraverseMachine,
    still_valid: &mut dyn FnMut() -> bool,
) -> Result<bool, DbError> {
    if !still_valid() {
        return Ok(false);
    }
    if machine.down(branch, &node) == TraverseStep::Continue {
        let branches: Vec<u8> = node.branches().map(|(b, _)| b).collect();
        for child_branch in branches {
            if !machine.should_visit(&node, child_branch) {
                continue;
            }
            let Some(child) = child_node(src, &node, child_branch)? else {
                continue;
            };
            if !traverse_node(src, child, child_branch, machine, still_valid)? {
                return Ok(false);
            }
        }
    }
    machine.up(branch, &node);
    Ok(true)
}
