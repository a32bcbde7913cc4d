//! The copy-on-write update engine.
//!
//! `upsert` applies a batch of updates against a prior root and produces a
//! fresh root whose unchanged subtries share structure (and disk bytes) with
//! the old one. Batches descend as buckets split per nibble; the existing
//! node's compressed path is walked in parallel and split on divergence.
//! Children are written through to the pool as soon as they are finished, so
//! a parent always knows its children's physical offsets, minimum virtual
//! offsets and minimum subtrie version before it is itself serialized.

use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::codec;
use crate::error::DbError;
use crate::history::RootHistory;
use crate::machine::StateMachine;
use crate::meta::{ChunkLists, MetaFields, WriteCursor};
use crate::nibbles::Nibbles;
use crate::node::{Child, Node};
use crate::offset::{
    ChunkOffset, CompactVirtualOffset, INVALID_COMPACT_OFFSET, INVALID_OFFSET, ListKind,
};
use crate::pool::Pool;
use crate::ring::{IoRing, NodeWriter, RingMode};

/// A single update: write or erase `key`, optionally replacing the whole
/// subtrie below it (`incarnation`), optionally followed by nested updates
/// whose keys are relative to `key`.
#[derive(Clone, Debug)]
pub struct Update {
    pub key: Nibbles,
    /// `None` with an empty `next` erases the key.
    pub value: Option<Bytes>,
    pub incarnation: bool,
    pub next: UpdateList,
    pub version: u64,
}

pub type UpdateList = Vec<Update>;

impl Update {
    pub fn put(key: Nibbles, value: Bytes, version: u64) -> Self {
        Self {
            key,
            value: Some(value),
            incarnation: false,
            next: Vec::new(),
            version,
        }
    }

    pub fn erase(key: Nibbles, version: u64) -> Self {
        Self {
            key,
            value: None,
            incarnation: false,
            next: Vec::new(),
            version,
        }
    }
}

/// Everything the writer thread owns: pool, chunk lists, version history,
/// write cursors and the caches. One instance per database handle.
pub struct UpdateAux {
    pub disk: Option<DiskState>,
    /// Version metadata, write cursors and compaction frontiers. Persisted
    /// in the header for on-disk pools, memory-only otherwise.
    pub fields: MetaFields,
    pub history: RootHistory,
    /// Roots of live versions that are held in memory.
    pub root_cache: FxHashMap<u64, Arc<Node>>,
    /// Per-live-version minimum offsets, for deciding when the oldest chunks
    /// have no remaining references from the version ring.
    version_mins: FxHashMap<u64, (CompactVirtualOffset, CompactVirtualOffset)>,
    pub compaction_enabled: bool,
    /// Keep this many trailing versions out of auto-expiration; `None`
    /// disables expiration.
    pub auto_expire_window: Option<u64>,
}

pub struct DiskState {
    pub pool: Pool,
    pub lists: ChunkLists,
    pub writer_fast: NodeWriter,
    pub writer_slow: NodeWriter,
    pub ring: IoRing,
}

impl DiskState {
    pub fn new(pool: Pool, lists: ChunkLists, fields: &MetaFields, queue_depth: usize) -> Self {
        let writer_fast = NodeWriter::from_cursor(ListKind::Fast, fields.cursor_fast);
        let writer_slow = NodeWriter::from_cursor(ListKind::Slow, fields.cursor_slow);
        Self {
            pool,
            lists,
            writer_fast,
            writer_slow,
            ring: IoRing::new(RingMode::ReadWrite, queue_depth),
        }
    }
}

impl UpdateAux {
    pub fn in_memory(history_len: usize) -> Self {
        Self {
            disk: None,
            fields: MetaFields::default(),
            history: RootHistory::new(history_len),
            root_cache: FxHashMap::default(),
            version_mins: FxHashMap::default(),
            compaction_enabled: false,
            auto_expire_window: None,
        }
    }

    pub fn on_disk(
        disk: DiskState,
        fields: MetaFields,
        history: RootHistory,
        compaction_enabled: bool,
        auto_expire_window: Option<u64>,
    ) -> Self {
        Self {
            disk: Some(disk),
            fields,
            history,
            root_cache: FxHashMap::default(),
            version_mins: FxHashMap::default(),
            compaction_enabled,
            auto_expire_window,
        }
    }

    pub fn is_on_disk(&self) -> bool {
        self.disk.is_some()
    }

    /// Load the node at `offset`, going through the ring's completion queue.
    pub fn read_node(&mut self, offset: ChunkOffset) -> Result<Arc<Node>, DbError> {
        let disk = self.disk.as_mut().ok_or(DbError::Unknown)?;
        let ticket = disk.ring.submit_read(&disk.pool, offset)?;
        loop {
            if let Some((done, buffer)) = disk.ring.poll() {
                if done == ticket {
                    return Ok(Arc::new(buffer.decode()?));
                }
                // a completion for an earlier speculative read; drop it
            } else {
                return Err(DbError::Unknown);
            }
        }
    }

    /// The resident child node, loading and attaching it on a miss.
    pub fn load_child(&mut self, parent: &Node, branch: u8) -> Result<Arc<Node>, DbError> {
        let child = parent.child(branch).ok_or(DbError::Unknown)?;
        if let Some(node) = child.loaded() {
            return Ok(node.clone());
        }
        let offset = child.fnext;
        let node = self.read_node(offset)?;
        let child = parent.child(branch).ok_or(DbError::Unknown)?;
        Ok(child.set_loaded(node).clone())
    }

    /// Compaction frontier for `kind` during the current upsert, if any.
    pub(crate) fn compact_frontier(&self, kind: ListKind) -> CompactVirtualOffset {
        match kind {
            ListKind::Fast => self.fields.compact_frontier_fast,
            ListKind::Slow => self.fields.compact_frontier_slow,
        }
    }

    /// Make `dst` share `src`'s root and bookkeeping (used by forward moves).
    pub fn alias_version(&mut self, src: u64, dst: u64) {
        if let Some(mins) = self.version_mins.get(&src).copied() {
            self.version_mins.insert(dst, mins);
        }
        if let Some(root) = self.root_cache.get(&src).cloned() {
            self.root_cache.insert(dst, root);
        }
    }

    /// Versions strictly below this are candidates for expiration.
    fn expire_frontier(&self, upsert_version: u64) -> Option<u64> {
        let window = self.auto_expire_window?;
        upsert_version.checked_sub(window)
    }

    pub fn record_version_mins(
        &mut self,
        version: u64,
        mins: (CompactVirtualOffset, CompactVirtualOffset),
    ) {
        self.version_mins.insert(version, mins);
        let history = &self.history;
        self.version_mins.retain(|&v, _| history.is_valid_version(v));
        self.root_cache.retain(|&v, _| history.is_valid_version(v));
    }

    /// Smallest live reference per list across every version in the ring.
    pub fn live_min_offsets(&self) -> (CompactVirtualOffset, CompactVirtualOffset) {
        let mut fast = INVALID_COMPACT_OFFSET;
        let mut slow = INVALID_COMPACT_OFFSET;
        for (&v, &(f, s)) in &self.version_mins {
            if self.history.is_valid_version(v) {
                fast = fast.min(f);
                slow = slow.min(s);
            }
        }
        (fast, slow)
    }
}

/// Fully-built subtrie handed back up the recursion: the node, where it
/// landed on disk, and the rollups its parent slot needs.
pub(crate) struct Finished {
    pub node: Arc<Node>,
    pub offset: ChunkOffset,
    pub min_offset_fast: CompactVirtualOffset,
    pub min_offset_slow: CompactVirtualOffset,
    pub subtrie_min_version: u64,
}

impl Finished {
    pub fn to_child(&self, cache: bool) -> Child {
        let child = Child::new(
            self.offset,
            self.node.data.clone(),
            self.min_offset_fast,
            self.min_offset_slow,
            self.subtrie_min_version,
        );
        if cache {
            child.set_loaded(self.node.clone());
        }
        child
    }

    pub fn root_mins(&self) -> (CompactVirtualOffset, CompactVirtualOffset) {
        (self.min_offset_fast, self.min_offset_slow)
    }
}

/// One update positioned within the descent: `at` nibbles of its key are
/// already consumed. Nested (`next`) updates re-enter with `at == 0`.
struct Req {
    update: Update,
    at: usize,
}

impl Req {
    fn remaining(&self) -> usize {
        self.update.key.len() - self.at
    }

    fn nibble(&self) -> u8 {
        self.update.key.at(self.at)
    }
}

struct Split {
    leaf: Option<Req>,
    buckets: [Vec<Req>; 16],
    bucket_mask: u16,
}

fn split_batch(batch: Vec<Req>) -> Split {
    let mut split = Split {
        leaf: None,
        buckets: Default::default(),
        bucket_mask: 0,
    };
    for req in batch {
        if req.remaining() == 0 {
            debug_assert!(
                split.leaf.is_none(),
                "duplicate keys within one batch are a caller error"
            );
            split.leaf = Some(req);
        } else {
            let nibble = req.nibble();
            split.bucket_mask |= 1 << nibble;
            split.buckets[nibble as usize].push(req);
        }
    }
    split
}

fn advance(bucket: Vec<Req>) -> Vec<Req> {
    bucket
        .into_iter()
        .map(|mut req| {
            req.at += 1;
            req
        })
        .collect()
}

/// Can-write-to-fast is plumbed through so replay/compaction-style upserts
/// can be steered to the slow list wholesale.
pub(crate) struct UpsertCtx {
    pub version: u64,
    pub to_fast: bool,
    pub compaction: bool,
    pub expire_before: Option<u64>,
}

/// Apply one batch against `old_root`, yielding the new root. `None` means
/// the trie became empty.
pub(crate) fn upsert(
    aux: &mut UpdateAux,
    sm: &mut dyn StateMachine,
    old_root: Option<Arc<Node>>,
    updates: UpdateList,
    version: u64,
    enable_compaction: bool,
    can_write_to_fast: bool,
) -> Result<Option<Finished>, DbError> {
    let ctx = UpsertCtx {
        version,
        to_fast: can_write_to_fast,
        compaction: enable_compaction && aux.compaction_enabled && aux.is_on_disk(),
        expire_before: aux.expire_frontier(version),
    };
    let batch: Vec<Req> = updates
        .into_iter()
        .map(|update| Req { update, at: 0 })
        .collect();
    let finished = match old_root {
        Some(old) => upsert_node(aux, sm, &ctx, old, batch)?,
        None => create_trie(aux, sm, &ctx, Nibbles::empty(), batch)?,
    };
    if let Some(f) = &finished {
        trace!(version, children = f.node.number_of_children(), "upsert produced new root");
    } else {
        debug!(version, "upsert erased the trie to empty");
    }
    Ok(finished)
}

/// Build a brand-new subtrie from a batch; there is no existing node here.
/// `prefix` carries path nibbles folded in by compression on the way down.
fn create_trie(
    aux: &mut UpdateAux,
    sm: &mut dyn StateMachine,
    ctx: &UpsertCtx,
    mut prefix: Nibbles,
    mut batch: Vec<Req>,
) -> Result<Option<Finished>, DbError> {
    // path compression: fold single-bucket levels into the node's path
    let mut folded = 0usize;
    let mut split = loop {
        let split = split_batch(batch);
        if split.leaf.is_none() && split.bucket_mask.count_ones() == 1 {
            let nibble = split.bucket_mask.trailing_zeros() as u8;
            prefix.push(nibble);
            sm.down(nibble);
            folded += 1;
            batch = advance(
                split
                    .buckets
                    .into_iter()
                    .find(|b| !b.is_empty())
                    .unwrap_or_default(),
            );
            continue;
        }
        break split;
    };

    let mut node = Node::new_branch(prefix, None, ctx.version);
    if let Some(leaf) = split.leaf.take() {
        node.version = node.version.max(leaf.update.version);
        node.value = leaf.update.value;
        // nested updates apply below this node
        fold_nested(&mut split, leaf.update.next);
    }
    for nibble in 0u8..16 {
        if split.bucket_mask & (1 << nibble) == 0 {
            continue;
        }
        let bucket = advance(std::mem::take(&mut split.buckets[nibble as usize]));
        sm.down(nibble);
        if let Some(finished) = create_trie(aux, sm, ctx, Nibbles::empty(), bucket)? {
            attach_child(sm, &mut node, nibble, finished);
        }
        sm.up(1);
    }
    let result = finish_node(aux, sm, ctx, node);
    sm.up(folded);
    result
}

/// Merge an update's nested list into the per-branch buckets of `split`.
fn fold_nested(split: &mut Split, nested: UpdateList) {
    if nested.is_empty() {
        return;
    }
    let nested_split = split_batch(
        nested
            .into_iter()
            .map(|update| Req { update, at: 0 })
            .collect(),
    );
    debug_assert!(
        nested_split.leaf.is_none(),
        "a nested update cannot end at its parent key"
    );
    let mut buckets = nested_split.buckets;
    for nibble in 0u8..16 {
        if nested_split.bucket_mask & (1 << nibble) == 0 {
            continue;
        }
        split.bucket_mask |= 1 << nibble;
        split.buckets[nibble as usize].append(&mut buckets[nibble as usize]);
    }
}

/// Apply a batch onto an existing node, walking its compressed path in
/// parallel with the batch's next nibbles.
fn upsert_node(
    aux: &mut UpdateAux,
    sm: &mut dyn StateMachine,
    ctx: &UpsertCtx,
    old: Arc<Node>,
    mut batch: Vec<Req>,
) -> Result<Option<Finished>, DbError> {
    let mut old_idx = 0usize;
    loop {
        let split = split_batch(batch);
        if old_idx < old.path.len() {
            let expected = old.path.at(old_idx);
            let only_matching_bucket =
                split.leaf.is_none() && split.bucket_mask == (1u16 << expected);
            if only_matching_bucket {
                sm.down(expected);
                batch = advance(
                    split
                        .buckets
                        .into_iter()
                        .find(|b| !b.is_empty())
                        .unwrap_or_default(),
                );
                old_idx += 1;
                continue;
            }
            let result = split_old_node(aux, sm, ctx, &old, old_idx, split);
            sm.up(old_idx);
            return result;
        }
        let result = dispatch_on_node(aux, sm, ctx, &old, split);
        sm.up(old_idx);
        return result;
    }
}

/// The batch diverges inside `old.path` at `old_idx`: split the node into a
/// shorter parent holding the matched fragment, with the old subtrie rehomed
/// under its diverging nibble.
fn split_old_node(
    aux: &mut UpdateAux,
    sm: &mut dyn StateMachine,
    ctx: &UpsertCtx,
    old: &Arc<Node>,
    old_idx: usize,
    mut split: Split,
) -> Result<Option<Finished>, DbError> {
    let old_branch = old.path.at(old_idx);
    let mut node = Node::new_branch(
        Nibbles::from_view(old.path_view().prefix(old_idx)),
        None,
        ctx.version,
    );
    if let Some(leaf) = split.leaf.take() {
        // the key ends above the old subtrie, so there is nothing for an
        // incarnation flag to wipe here
        node.version = node.version.max(leaf.update.version);
        node.value = leaf.update.value;
        fold_nested(&mut split, leaf.update.next);
    }

    for nibble in 0u8..16 {
        let bucket = (split.bucket_mask & (1 << nibble) != 0)
            .then(|| advance(std::mem::take(&mut split.buckets[nibble as usize])));
        if nibble == old_branch {
            // the old subtrie, rehomed under the tail of its former path
            let rehomed = rehome_node(old, old_idx + 1);
            sm.down(nibble);
            let finished = match bucket {
                Some(bucket) => upsert_node(aux, sm, ctx, Arc::new(rehomed), bucket)?,
                None => finish_node(aux, sm, ctx, rehomed)?,
            };
            if let Some(finished) = finished {
                attach_child(sm, &mut node, nibble, finished);
            }
            sm.up(1);
        } else if let Some(bucket) = bucket {
            sm.down(nibble);
            if let Some(finished) = create_trie(aux, sm, ctx, Nibbles::empty(), bucket)? {
                attach_child(sm, &mut node, nibble, finished);
            }
            sm.up(1);
        }
    }
    finish_node(aux, sm, ctx, node)
}

/// A structural copy of `old` whose path drops the first `from` nibbles.
/// Children keep their slots (offsets, rollups, resident pointers).
fn rehome_node(old: &Node, from: usize) -> Node {
    let mut node = Node::new_branch(
        Nibbles::from_view(old.path_view().suffix(from)),
        old.value.clone(),
        old.version,
    );
    for (branch, child) in old.branches() {
        node.set_child(branch, child.clone());
    }
    node
}

/// The batch reaches the end of `old.path`: apply the leaf update here and
/// dispatch the buckets into the node's children. Children the batch leaves
/// alone are carried over, subject to the compaction and expiration
/// frontiers.
fn dispatch_on_node(
    aux: &mut UpdateAux,
    sm: &mut dyn StateMachine,
    ctx: &UpsertCtx,
    old: &Arc<Node>,
    mut split: Split,
) -> Result<Option<Finished>, DbError> {
    let mut node = Node::new_branch(old.path.clone(), old.value.clone(), old.version);
    let mut incarnated = false;
    if let Some(leaf) = split.leaf.take() {
        node.version = node.version.max(leaf.update.version);
        node.value = leaf.update.value;
        // incarnation wipes the matched subtrie; rebuild purely from `next`
        incarnated = leaf.update.incarnation;
        fold_nested(&mut split, leaf.update.next);
    }

    for nibble in 0u8..16 {
        let old_child = (!incarnated)
            .then(|| old.child(nibble).cloned())
            .flatten();
        let has_updates = split.bucket_mask & (1 << nibble) != 0;
        if !has_updates {
            // untouched child: carry it over through the frontier policies
            if let Some(child) = old_child {
                sm.down(nibble);
                match maintain_child(aux, sm, ctx, child)? {
                    Maintain::Keep(child) => node.set_child(nibble, child),
                    Maintain::Replaced(finished) => {
                        attach_child(sm, &mut node, nibble, finished)
                    }
                    Maintain::Expired => {}
                }
                sm.up(1);
            }
            continue;
        }
        let bucket = advance(std::mem::take(&mut split.buckets[nibble as usize]));
        sm.down(nibble);
        let finished = match old_child {
            Some(child) => {
                let child_node = resolve_child(aux, &child)?;
                upsert_node(aux, sm, ctx, child_node, bucket)?
            }
            None => create_trie(aux, sm, ctx, Nibbles::empty(), bucket)?,
        };
        if let Some(finished) = finished {
            attach_child(sm, &mut node, nibble, finished);
        }
        sm.up(1);
    }

    finish_node(aux, sm, ctx, node)
}

/// Outcome of carrying an untouched child slot across an upsert.
pub(crate) enum Maintain {
    /// Slot passes through verbatim, residency included.
    Keep(Child),
    /// Subtrie was copy-forwarded or partially expired.
    Replaced(Finished),
    /// Subtrie was wholly below the expiration frontier.
    Expired,
}

/// Apply the frontier policies to one untouched child slot.
fn maintain_child(
    aux: &mut UpdateAux,
    sm: &mut dyn StateMachine,
    ctx: &UpsertCtx,
    child: Child,
) -> Result<Maintain, DbError> {
    if let Some(expire_before) = ctx.expire_before
        && sm.auto_expire()
        && child.subtrie_min_version < expire_before
    {
        return Ok(match crate::compact::expire_child(aux, sm, ctx, child, expire_before)? {
            Some(finished) => Maintain::Replaced(finished),
            None => Maintain::Expired,
        });
    }
    if ctx.compaction && sm.compact() && below_compaction_frontier(aux, &child) {
        let finished = crate::compact::compact_child(aux, sm, ctx, child)?;
        return Ok(Maintain::Replaced(finished));
    }
    Ok(Maintain::Keep(child))
}

/// Whether any reference in the slot's subtrie sits below a live frontier.
/// An unset frontier (the invalid sentinel) never matches anything.
pub(crate) fn below_compaction_frontier(aux: &UpdateAux, child: &Child) -> bool {
    let fast = aux.compact_frontier(ListKind::Fast);
    let slow = aux.compact_frontier(ListKind::Slow);
    (!fast.is_invalid() && child.min_offset_fast < fast)
        || (!slow.is_invalid() && child.min_offset_slow < slow)
}

pub(crate) fn resolve_child(aux: &mut UpdateAux, child: &Child) -> Result<Arc<Node>, DbError> {
    if let Some(node) = child.loaded() {
        return Ok(node.clone());
    }
    aux.read_node(child.fnext)
}

fn attach_child(sm: &mut dyn StateMachine, node: &mut Node, branch: u8, finished: Finished) {
    node.version = node.version.max(finished.node.version);
    node.set_child(branch, finished.to_child(sm.cache()));
}

/// The create-node rule: empty results vanish, single-child valueless nodes
/// collapse into their child, everything else gets its commitment computed
/// and is written through.
pub(crate) fn finish_node(
    aux: &mut UpdateAux,
    sm: &mut dyn StateMachine,
    ctx: &UpsertCtx,
    mut node: Node,
) -> Result<Option<Finished>, DbError> {
    if node.number_of_children() == 0 && node.value.is_none() {
        return Ok(None);
    }
    if node.number_of_children() == 1 && node.value.is_none() {
        let (branch, child) = node.single_child().expect("checked single child");
        let child_node = resolve_child(aux, &child)?;
        let mut collapsed = Node::new_branch(
            Nibbles::join(node.path_view(), branch, child_node.path_view()),
            child_node.value.clone(),
            child_node.version,
        );
        for (grandchild_branch, grandchild) in child_node.branches() {
            collapsed.set_child(grandchild_branch, grandchild.clone());
        }
        node = collapsed;
    }
    write_node(aux, sm, ctx, node)
}

/// Compute the node's commitment, serialize it, and append it to the fast or
/// slow list. In-memory tries skip the write and keep everything resident.
pub(crate) fn write_node(
    aux: &mut UpdateAux,
    sm: &mut dyn StateMachine,
    ctx: &UpsertCtx,
    mut node: Node,
) -> Result<Option<Finished>, DbError> {
    node.data = sm.compute().compute(&node);
    let (mut min_fast, mut min_slow) = node.min_offsets();
    let subtrie_min_version = node.subtrie_min_version();

    let Some(disk) = aux.disk.as_mut() else {
        return Ok(Some(Finished {
            node: Arc::new(node),
            offset: INVALID_OFFSET,
            min_offset_fast: min_fast,
            min_offset_slow: min_slow,
            subtrie_min_version,
        }));
    };

    let mut bytes = Vec::with_capacity(codec::encoded_len(&node));
    codec::encode_node(&node, &mut bytes);
    let writer = if ctx.to_fast {
        &mut disk.writer_fast
    } else {
        &mut disk.writer_slow
    };
    let offset = writer.write_node(&mut disk.pool, &mut disk.lists, &bytes)?;
    let own = disk.lists.virtual_offset(offset).to_compact();
    match writer.kind() {
        ListKind::Fast => min_fast = min_fast.min(own),
        ListKind::Slow => min_slow = min_slow.min(own),
    }
    Ok(Some(Finished {
        node: Arc::new(node),
        offset,
        min_offset_fast: min_fast,
        min_offset_slow: min_slow,
        subtrie_min_version,
    }))
}

/// Rewrite a subtrie node whose content (and commitment) is unchanged at a
/// fresh offset on `kind`'s list.
pub(crate) fn rewrite_node(
    aux: &mut UpdateAux,
    node: Arc<Node>,
    kind: ListKind,
) -> Result<Finished, DbError> {
    let (mut min_fast, mut min_slow) = node.min_offsets();
    let subtrie_min_version = node.subtrie_min_version();
    let disk = aux.disk.as_mut().ok_or(DbError::Unknown)?;
    let mut bytes = Vec::with_capacity(codec::encoded_len(&node));
    codec::encode_node(&node, &mut bytes);
    let writer = match kind {
        ListKind::Fast => &mut disk.writer_fast,
        ListKind::Slow => &mut disk.writer_slow,
    };
    let offset = writer.write_node(&mut disk.pool, &mut disk.lists, &bytes)?;
    let own = disk.lists.virtual_offset(offset).to_compact();
    match kind {
        ListKind::Fast => min_fast = min_fast.min(own),
        ListKind::Slow => min_slow = min_slow.min(own),
    }
    Ok(Finished {
        node,
        offset,
        min_offset_fast: min_fast,
        min_offset_slow: min_slow,
        subtrie_min_version,
    })
}

/// Flush both node writers and publish `root` for `version` in the ring,
/// with the post-flush cursors captured for rewind. The header is persisted
/// separately, after chunk retirement has run.
pub(crate) fn flush_and_set_root(
    aux: &mut UpdateAux,
    version: u64,
    root_offset: ChunkOffset,
) -> Result<(), DbError> {
    let (cursor_fast, cursor_slow) = match aux.disk.as_mut() {
        Some(disk) => {
            disk.writer_fast.flush(&disk.pool)?;
            disk.writer_slow.flush(&disk.pool)?;
            aux.fields.cursor_fast = disk.writer_fast.cursor();
            aux.fields.cursor_slow = disk.writer_slow.cursor();
            (aux.fields.cursor_fast, aux.fields.cursor_slow)
        }
        None => (WriteCursor::NONE, WriteCursor::NONE),
    };
    aux.history
        .set_root(version, root_offset, cursor_fast, cursor_slow)
}

/// Persist the header: lists, cursors, frontiers, and the version ring.
/// Must run only after the node writes it refers to have been flushed.
pub(crate) fn store_meta(aux: &mut UpdateAux) -> Result<(), DbError> {
    let UpdateAux {
        disk,
        fields,
        history,
        ..
    } = aux;
    if let Some(disk) = disk {
        crate::meta::store(&mut disk.pool, fields, &disk.lists, history)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::machine::MerkleMachine;
    use crate::test_utils::{key_nibbles, value};

    fn apply(
        aux: &mut UpdateAux,
        root: Option<Arc<Node>>,
        updates: UpdateList,
        version: u64,
    ) -> Option<Arc<Node>> {
        let mut sm = MerkleMachine::new(64, false);
        upsert(aux, &mut sm, root, updates, version, true, true)
            .expect("upsert")
            .map(|f| f.node)
    }

    #[test]
    fn leaf_then_split() {
        let mut aux = UpdateAux::in_memory(8);
        let root = apply(
            &mut aux,
            None,
            vec![Update::put(key_nibbles(&[0x12, 0x34]), value(b"a"), 0)],
            0,
        )
        .expect("root");
        assert_eq!(root.number_of_children(), 0);
        assert_eq!(root.path.len(), 4);

        // second key diverging at the third nibble forces a split
        let root = apply(
            &mut aux,
            Some(root),
            vec![Update::put(key_nibbles(&[0x12, 0x78]), value(b"b"), 0)],
            0,
        )
        .expect("root");
        assert_eq!(root.path.len(), 2);
        assert_eq!(root.number_of_children(), 2);
        assert!(root.value.is_none());
        let left = root.child(3).expect("child 3");
        let right = root.child(7).expect("child 7");
        assert_eq!(
            left.loaded().expect("resident").value,
            Some(value(b"a"))
        );
        assert_eq!(
            right.loaded().expect("resident").value,
            Some(value(b"b"))
        );
    }

    #[test]
    fn erase_collapses_single_child() {
        let mut aux = UpdateAux::in_memory(8);
        let root = apply(
            &mut aux,
            None,
            vec![
                Update::put(key_nibbles(&[0x12, 0x34]), value(b"a"), 0),
                Update::put(key_nibbles(&[0x12, 0x78]), value(b"b"), 0),
            ],
            0,
        )
        .expect("root");
        assert_eq!(root.number_of_children(), 2);

        let root = apply(
            &mut aux,
            Some(root),
            vec![Update::erase(key_nibbles(&[0x12, 0x34]), 1)],
            1,
        )
        .expect("root");
        // the surviving leaf absorbs the branch nibble back into its path
        assert_eq!(root.number_of_children(), 0);
        assert_eq!(root.path.len(), 4);
        assert_eq!(root.value, Some(value(b"b")));
    }

    #[test]
    fn erase_everything_yields_none() {
        let mut aux = UpdateAux::in_memory(8);
        let root = apply(
            &mut aux,
            None,
            vec![Update::put(key_nibbles(&[0xab]), value(b"x"), 0)],
            0,
        );
        let root = apply(
            &mut aux,
            root,
            vec![Update::erase(key_nibbles(&[0xab]), 1)],
            1,
        );
        assert!(root.is_none());
    }

    #[test]
    fn value_at_internal_node() {
        let mut aux = UpdateAux::in_memory(8);
        // one key is a strict prefix of the other
        let root = apply(
            &mut aux,
            None,
            vec![
                Update::put(key_nibbles(&[0x12]), value(b"short"), 0),
                Update::put(key_nibbles(&[0x12, 0x34]), value(b"long"), 0),
            ],
            0,
        )
        .expect("root");
        assert_eq!(root.value, Some(value(b"short")));
        assert_eq!(root.number_of_children(), 1);
        let below = root.child(3).expect("child 3");
        assert_eq!(
            below.loaded().expect("resident").value,
            Some(value(b"long"))
        );
    }

    #[test]
    fn incarnation_discards_subtrie() {
        let mut aux = UpdateAux::in_memory(8);
        let account = key_nibbles(&[0xaa]);
        let root = apply(
            &mut aux,
            None,
            vec![Update {
                key: account.clone(),
                value: Some(value(b"acct-v0")),
                incarnation: false,
                next: vec![Update::put(key_nibbles(&[0x11]), value(b"s1"), 0)],
                version: 0,
            }],
            0,
        )
        .expect("root");

        let root = apply(
            &mut aux,
            Some(root),
            vec![Update {
                key: account,
                value: Some(value(b"acct-v1")),
                incarnation: true,
                next: vec![Update::put(key_nibbles(&[0x22]), value(b"s2"), 1)],
                version: 1,
            }],
            1,
        )
        .expect("root");
        assert_eq!(root.value, Some(value(b"acct-v1")));
        // the old storage at nibble path 1,1 is gone; only 2,2 remains
        assert!(root.child(1).is_none());
        let storage = root.child(2).expect("new storage");
        assert_eq!(
            storage.loaded().expect("resident").value,
            Some(value(b"s2"))
        );
    }

    #[test]
    fn version_propagates_as_max() {
        let mut aux = UpdateAux::in_memory(8);
        let root = apply(
            &mut aux,
            None,
            vec![
                Update::put(key_nibbles(&[0x10]), value(b"a"), 0),
                Update::put(key_nibbles(&[0x20]), value(b"b"), 0),
            ],
            0,
        );
        let root = apply(
            &mut aux,
            root,
            vec![Update::put(key_nibbles(&[0x20]), value(b"b2"), 5)],
            5,
        )
        .expect("root");
        assert_eq!(root.version, 5);
        assert_eq!(root.subtrie_min_version(), 0);
        assert_eq!(
            root.child(1).expect("untouched").subtrie_min_version,
            0
        );
        assert_eq!(root.child(2).expect("rewritten").subtrie_min_version, 5);
    }
}
