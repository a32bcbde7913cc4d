//! The public database facade.
//!
//! [`Db`] is the read-write handle: it owns the writer thread (or, for pure
//! in-memory tries, runs the drivers inline on the caller thread) and routes
//! every operation through the typed request queue. [`RoDb`] opens the same
//! files read-only and serves blocking finds without touching any writer
//! state.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam::channel::Sender;
use ethereum_types::H256;
use futures::channel::oneshot;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::cache::NodeCache;
use crate::compact;
use crate::error::{DbError, FindResult, find_result_to_db_error};
use crate::find::{self, NodeSource};
use crate::history::{INVALID_VERSION, RootHistory};
use crate::machine::{StateMachine, TraverseMachine};
use crate::meta::{self, ChunkLists, MetaFields};
use crate::nibbles::Nibbles;
use crate::node::{Child, Node, NodeCursor, NodeData};
use crate::offset::{ChunkOffset, INVALID_OFFSET};
use crate::pool::{OpenMode, Pool, PoolConfig};
use crate::ring::read_node_blocking;
use crate::update::{
    self, DiskState, Finished, UpdateAux, UpdateList, UpsertCtx, resolve_child,
};
use crate::worker::{self, Reply, Request, SleepHandshake};

#[derive(Clone, Debug)]
pub struct DbConfig {
    /// Backing files; empty for an anonymous in-process pool.
    pub paths: Vec<PathBuf>,
    /// Truncate (create fresh) instead of opening existing files.
    pub truncate: bool,
    /// Size of each backing file in bytes.
    pub file_size: u64,
    pub chunk_size: u64,
    pub history_length: usize,
    pub enable_compaction: bool,
    /// Versions to keep clear of auto-expiration; `None` disables it.
    pub auto_expire_window: Option<u64>,
    /// Submission window of the read ring.
    pub queue_depth: usize,
    pub check_geometry: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            truncate: true,
            file_size: 1 << 28,
            chunk_size: 1 << 21,
            history_length: 1000,
            enable_compaction: true,
            auto_expire_window: None,
            queue_depth: 128,
            check_geometry: true,
        }
    }
}

impl DbConfig {
    fn pool_config(&self) -> PoolConfig {
        let files = self.paths.len().max(1) as u64;
        let estimated_chunks = (files * self.file_size) / self.chunk_size;
        PoolConfig {
            paths: self.paths.clone(),
            mode: if self.truncate {
                OpenMode::Truncate
            } else {
                OpenMode::OpenExisting
            },
            file_size: self.file_size,
            chunk_size: self.chunk_size,
            header_len: meta::header_len(estimated_chunks, self.history_length as u64),
            check_geometry: self.check_geometry,
        }
    }
}

/// Everything behind the writer lock: the aux handles, the state-machine
/// prototype, and the unpublished tip of the trie.
pub(crate) struct WriterState {
    pub aux: UpdateAux,
    pub machine: Box<dyn StateMachine>,
    /// Root produced by the most recent upsert on this handle. `None` with
    /// `tip_is_empty` set means that upsert erased the trie.
    tip: Option<Finished>,
    tip_is_empty: bool,
    tip_version: u64,
    /// The tip was produced with `write_root = false` (or by `copy_trie`)
    /// and is not yet visible in the version ring.
    unflushed: bool,
}

pub struct Db {
    state: Arc<RwLock<WriterState>>,
    queue: Option<Sender<Request>>,
    sleep: Arc<SleepHandshake>,
    worker: Option<JoinHandle<()>>,
    config: Option<DbConfig>,
}

impl Db {
    /// A purely in-memory trie: no pool, no worker thread; drivers run on
    /// the caller's thread.
    pub fn new_in_memory(machine: Box<dyn StateMachine>, history_length: usize) -> Self {
        let state = WriterState {
            aux: UpdateAux::in_memory(history_length),
            machine,
            tip: None,
            tip_is_empty: false,
            tip_version: INVALID_VERSION,
            unflushed: false,
        };
        Self {
            state: Arc::new(RwLock::new(state)),
            queue: None,
            sleep: Arc::new(SleepHandshake::new()),
            worker: None,
            config: None,
        }
    }

    pub fn open(machine: Box<dyn StateMachine>, config: DbConfig) -> Result<Self, DbError> {
        let pool = Pool::open(&config.pool_config())?;
        let (fields, lists, history) = if config.truncate {
            (
                MetaFields::default(),
                ChunkLists::new(pool.chunk_count()),
                RootHistory::new(config.history_length),
            )
        } else {
            let loaded = meta::load(&pool)?;
            if loaded.2.capacity() != config.history_length {
                return Err(DbError::PoolSizeMismatch(format!(
                    "history length on disk {}, configured {}",
                    loaded.2.capacity(),
                    config.history_length
                )));
            }
            loaded
        };
        let disk = DiskState::new(pool, lists, &fields, config.queue_depth);
        let mut aux = UpdateAux::on_disk(
            disk,
            fields,
            history,
            config.enable_compaction,
            config.auto_expire_window,
        );
        if config.truncate {
            update::store_meta(&mut aux)?;
        } else {
            rebuild_version_mins(&mut aux)?;
        }
        let tip_version = aux.history.latest_version().unwrap_or(INVALID_VERSION);
        info!(
            latest = tip_version,
            chunks = aux.disk.as_ref().map(|d| d.lists.chunk_count()),
            "database opened"
        );
        let state = Arc::new(RwLock::new(WriterState {
            aux,
            machine,
            tip: None,
            tip_is_empty: false,
            tip_version,
            unflushed: false,
        }));
        let sleep = Arc::new(SleepHandshake::new());
        let (tx, rx) = worker::channel();
        let handle = worker::spawn(state.clone(), rx, sleep.clone());
        Ok(Self {
            state,
            queue: Some(tx),
            sleep,
            worker: Some(handle),
            config: Some(config),
        })
    }

    /// A read-only handle over the same backing files.
    pub fn read_only(&self) -> Result<RoDb, DbError> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| DbError::PoolOpen("in-memory databases have no files".into()))?;
        RoDb::open(&config)
    }

    fn call<T: Send + 'static>(
        &self,
        build: impl FnOnce(Reply<T>) -> Request,
    ) -> Result<T, DbError> {
        let (tx, rx) = oneshot::channel();
        let request = build(tx);
        match &self.queue {
            Some(queue) => {
                queue.send(request).map_err(|_| DbError::Unknown)?;
                self.sleep.notify();
            }
            None => {
                let mut state = self.state.write();
                handle_request(&mut state, request);
            }
        }
        futures::executor::block_on(rx).map_err(|_| DbError::Unknown)?
    }

    pub fn upsert(&self, updates: UpdateList, version: u64) -> Result<(), DbError> {
        self.upsert_with(updates, version, true, true, true)
    }

    pub fn upsert_with(
        &self,
        updates: UpdateList,
        version: u64,
        enable_compaction: bool,
        can_write_to_fast: bool,
        write_root: bool,
    ) -> Result<(), DbError> {
        self.call(|reply| Request::Upsert {
            updates,
            version,
            enable_compaction,
            can_write_to_fast,
            write_root,
            reply,
        })
    }

    pub fn find(&self, key: Nibbles, version: u64) -> Result<NodeCursor, DbError> {
        let (cursor, result) = self.call(|reply| Request::Find {
            key,
            version,
            reply,
        })?;
        match (cursor, result) {
            (Some(cursor), FindResult::Success) => Ok(cursor),
            (_, result) => Err(find_result_to_db_error(result, version)),
        }
    }

    pub fn get(&self, key: Nibbles, version: u64) -> Result<Bytes, DbError> {
        let cursor = self.find(key, version)?;
        cursor.node.value.clone().ok_or(DbError::KeyNotFound)
    }

    /// The commitment bytes of the node at `key`, not its value. The empty
    /// key addresses the root.
    pub fn get_data(&self, key: Nibbles, version: u64) -> Result<NodeData, DbError> {
        if key.is_empty() {
            let root = self.load_root_for_version(version)?;
            return root.map(|node| node.data.clone()).ok_or(DbError::KeyNotFound);
        }
        let cursor = self.find(key, version)?;
        Ok(cursor.node.data.clone())
    }

    /// Root commitment of `version`, collapsed to the fixed 32-byte form.
    pub fn root_hash(&self, version: u64) -> Result<H256, DbError> {
        let root = self.load_root_for_version(version)?;
        let state = self.state.read();
        let compute = state.machine.compute();
        Ok(match root {
            Some(node) => compute.finalize(&node.data),
            None => compute.empty_root(),
        })
    }

    pub fn load_root_for_version(&self, version: u64) -> Result<Option<Arc<Node>>, DbError> {
        self.call(|reply| Request::LoadRootVersion { version, reply })
    }

    /// Drive `machine` over the trie at `version`. Returns `false` when the
    /// version was evicted mid-walk. `concurrency` bounds speculative child
    /// loads per level and is advisory.
    pub fn traverse(
        &self,
        machine: Box<dyn TraverseMachine>,
        version: u64,
        concurrency: usize,
    ) -> Result<(bool, Box<dyn TraverseMachine>), DbError> {
        self.call(|reply| Request::Traverse {
            version,
            machine,
            concurrency,
            reply,
        })
    }

    /// Duplicate the subtrie at `src_path`@`src_version` under
    /// `dst_path`@`dst_version` without rewriting its nodes. Unless
    /// `blocked_by_write` is false and both versions match, the destination
    /// becomes observable only after the next root-writing upsert on
    /// `dst_version`.
    pub fn copy_trie(
        &self,
        src_version: u64,
        src_path: Nibbles,
        dst_version: u64,
        dst_path: Nibbles,
        blocked_by_write: bool,
    ) -> Result<(), DbError> {
        self.call(|reply| Request::CopyTrie {
            src_version,
            src_path,
            dst_version,
            dst_path,
            blocked_by_write,
            reply,
        })
    }

    pub fn move_trie_version_forward(&self, src: u64, dst: u64) -> Result<(), DbError> {
        self.call(|reply| Request::MoveTrieVersion { src, dst, reply })
    }

    pub fn rewind_to_version(&self, version: u64) -> Result<(), DbError> {
        self.call(|reply| Request::RewindToVersion { version, reply })
    }

    /// Reopen-time recovery: fall back to the last finalized root.
    pub fn rewind_to_latest_finalized(&self) -> Result<(), DbError> {
        let finalized = self.latest_finalized_version();
        match finalized {
            Some(version) => self.rewind_to_version(version),
            None => Err(DbError::invalid_input("no finalized version recorded")),
        }
    }

    pub fn update_finalized_version(&self, version: u64) -> Result<(), DbError> {
        self.call(|reply| Request::SetFinalized { version, reply })
    }

    pub fn update_verified_version(&self, version: u64) -> Result<(), DbError> {
        self.call(|reply| Request::SetVerified { version, reply })
    }

    pub fn update_voted_metadata(&self, version: u64, block_id: H256) -> Result<(), DbError> {
        self.call(|reply| Request::SetVoted {
            version,
            block_id,
            reply,
        })
    }

    pub fn latest_version(&self) -> Option<u64> {
        self.state.read().aux.history.latest_version()
    }

    pub fn earliest_version(&self) -> Option<u64> {
        self.state.read().aux.history.earliest_version()
    }

    pub fn latest_finalized_version(&self) -> Option<u64> {
        let v = self.state.read().aux.fields.latest_finalized;
        (v != INVALID_VERSION).then_some(v)
    }

    pub fn latest_verified_version(&self) -> Option<u64> {
        let v = self.state.read().aux.fields.latest_verified;
        (v != INVALID_VERSION).then_some(v)
    }

    pub fn latest_voted(&self) -> Option<(u64, H256)> {
        let state = self.state.read();
        (state.aux.fields.latest_voted != INVALID_VERSION)
            .then(|| (state.aux.fields.latest_voted, state.aux.fields.latest_voted_block_id))
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        // disconnecting the queue is the shutdown signal
        self.queue = None;
        self.sleep.notify();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Writer-side drivers
// ---------------------------------------------------------------------------

pub(crate) fn handle_request(state: &mut WriterState, request: Request) {
    match request {
        Request::Upsert {
            updates,
            version,
            enable_compaction,
            can_write_to_fast,
            write_root,
            reply,
        } => {
            let result = do_upsert(
                state,
                updates,
                version,
                enable_compaction,
                can_write_to_fast,
                write_root,
            );
            let _ = reply.send(result);
        }
        Request::Find {
            key,
            version,
            reply,
        } => {
            let _ = reply.send(do_find(state, &key, version));
        }
        Request::Traverse {
            version,
            mut machine,
            concurrency: _,
            reply,
        } => {
            let result = do_traverse(state, version, machine.as_mut())
                .map(|completed| (completed, machine));
            let _ = reply.send(result);
        }
        Request::CopyTrie {
            src_version,
            src_path,
            dst_version,
            dst_path,
            blocked_by_write,
            reply,
        } => {
            let result = do_copy_trie(
                state,
                src_version,
                &src_path,
                dst_version,
                &dst_path,
                blocked_by_write,
            );
            let _ = reply.send(result);
        }
        Request::MoveTrieVersion { src, dst, reply } => {
            let _ = reply.send(do_move_version(state, src, dst));
        }
        Request::LoadRootVersion { version, reply } => {
            let _ = reply.send(do_load_root(state, version));
        }
        Request::RewindToVersion { version, reply } => {
            let _ = reply.send(do_rewind(state, version));
        }
        Request::SetFinalized { version, reply } => {
            state.aux.fields.latest_finalized = version;
            let _ = reply.send(update::store_meta(&mut state.aux));
        }
        Request::SetVerified { version, reply } => {
            state.aux.fields.latest_verified = version;
            let _ = reply.send(update::store_meta(&mut state.aux));
        }
        Request::SetVoted {
            version,
            block_id,
            reply,
        } => {
            state.aux.fields.latest_voted = version;
            state.aux.fields.latest_voted_block_id = block_id;
            let _ = reply.send(update::store_meta(&mut state.aux));
        }
    }
}

fn do_upsert(
    state: &mut WriterState,
    updates: UpdateList,
    version: u64,
    enable_compaction: bool,
    can_write_to_fast: bool,
    write_root: bool,
) -> Result<(), DbError> {
    if let (Some(_), Some(latest)) = (
        state.aux.history.earliest_version(),
        state.aux.history.latest_version(),
    ) && version < latest
        && !state.aux.history.is_valid_version(version)
    {
        return Err(DbError::invalid_input(format!(
            "version {version} regresses behind the live history"
        )));
    }

    if state.unflushed && state.tip_version != version {
        warn!(
            abandoned = state.tip_version,
            new = version,
            "discarding unflushed root: a different version started before it was written"
        );
        state.tip = None;
        state.tip_is_empty = false;
        state.tip_version = state
            .aux
            .history
            .latest_version()
            .unwrap_or(INVALID_VERSION);
        state.unflushed = false;
    }

    let prev = if let Some(finished) = &state.tip {
        Some(finished.node.clone())
    } else if state.tip_is_empty {
        None
    } else {
        match state.aux.history.latest_version() {
            Some(latest) => do_load_root(state, latest)?,
            None => None,
        }
    };

    compact::advance_frontiers(&mut state.aux);
    let mut sm = dyn_clone::clone_box(&*state.machine);
    let finished = update::upsert(
        &mut state.aux,
        sm.as_mut(),
        prev,
        updates,
        version,
        enable_compaction,
        can_write_to_fast,
    )?;

    let root_offset = finished.as_ref().map_or(INVALID_OFFSET, |f| f.offset);
    let mins = finished
        .as_ref()
        .map_or_else(Default::default, |f| f.root_mins());
    let root_node = finished.as_ref().map(|f| f.node.clone());
    state.tip_is_empty = finished.is_none();
    state.tip = finished;
    state.tip_version = version;

    if write_root {
        update::flush_and_set_root(&mut state.aux, version, root_offset)?;
        state.aux.record_version_mins(version, mins);
        match root_node {
            Some(node) => {
                state.aux.root_cache.insert(version, node);
            }
            None => {
                state.aux.root_cache.remove(&version);
            }
        }
        compact::release_retired_chunks(&mut state.aux);
        update::store_meta(&mut state.aux)?;
        state.unflushed = false;
        debug!(version, "root published");
    } else {
        state.unflushed = true;
        debug!(version, "upsert kept unflushed");
    }
    Ok(())
}

fn do_load_root(state: &mut WriterState, version: u64) -> Result<Option<Arc<Node>>, DbError> {
    if !state.aux.history.is_valid_version(version) {
        return Err(DbError::VersionNoLongerExist(version));
    }
    if let Some(root) = state.aux.root_cache.get(&version) {
        return Ok(Some(root.clone()));
    }
    let offset = state
        .aux
        .history
        .root_offset_at(version)
        .ok_or(DbError::VersionNoLongerExist(version))?;
    if offset.is_invalid() {
        // the version exists and its trie is empty
        return Ok(None);
    }
    let node = state.aux.read_node(offset)?;
    state.aux.root_cache.insert(version, node.clone());
    Ok(Some(node))
}

fn do_find(
    state: &mut WriterState,
    key: &Nibbles,
    version: u64,
) -> Result<(Option<NodeCursor>, FindResult), DbError> {
    let Some(root) = do_load_root(state, version)? else {
        return Ok((None, FindResult::KeyNotFound));
    };
    let (cursor, result) = find::find(&mut state.aux, root, key)?;
    Ok((Some(cursor), result))
}

fn do_traverse(
    state: &mut WriterState,
    version: u64,
    machine: &mut dyn TraverseMachine,
) -> Result<bool, DbError> {
    let Some(root) = do_load_root(state, version)? else {
        return Ok(true);
    };
    // versions cannot be evicted while the writer itself is walking
    find::traverse(&mut state.aux, root, machine, &mut || true)
}

fn do_move_version(state: &mut WriterState, src: u64, dst: u64) -> Result<(), DbError> {
    state.aux.history.move_version_forward(src, dst)?;
    state.aux.alias_version(src, dst);
    if state.tip_version == src && !state.unflushed {
        state.tip_version = dst;
    }
    update::store_meta(&mut state.aux)?;
    debug!(src, dst, "trie version moved forward");
    Ok(())
}

fn do_rewind(state: &mut WriterState, version: u64) -> Result<(), DbError> {
    let entry = state.aux.history.rewind_to_version(version)?;
    if let Some(disk) = state.aux.disk.as_mut() {
        disk.writer_fast.restore(entry.cursor_fast);
        disk.writer_slow.restore(entry.cursor_slow);
        state.aux.fields.cursor_fast = entry.cursor_fast;
        state.aux.fields.cursor_slow = entry.cursor_slow;
    }
    state.tip = None;
    state.tip_is_empty = false;
    state.tip_version = version;
    state.unflushed = false;
    update::store_meta(&mut state.aux)?;
    info!(version, "rewound");
    Ok(())
}

// ---------------------------------------------------------------------------
// copy_trie: locate the source slot, graft it into the destination spine
// ---------------------------------------------------------------------------

fn do_copy_trie(
    state: &mut WriterState,
    src_version: u64,
    src_path: &Nibbles,
    dst_version: u64,
    dst_path: &Nibbles,
    blocked_by_write: bool,
) -> Result<(), DbError> {
    let src_root = do_load_root(state, src_version)?.ok_or(DbError::KeyNotFound)?;
    let src_offset = state
        .aux
        .history
        .root_offset_at(src_version)
        .unwrap_or(INVALID_OFFSET);
    let mut sm = dyn_clone::clone_box(&*state.machine);
    let ctx = UpsertCtx {
        version: dst_version,
        to_fast: true,
        compaction: false,
        expire_before: None,
    };
    let src_slot = locate_slot(&mut state.aux, sm.as_mut(), &ctx, src_root, src_offset, src_path)?;

    let dst_root = if state.aux.history.is_valid_version(dst_version) {
        do_load_root(state, dst_version)?
    } else if state.tip_version == dst_version {
        state.tip.as_ref().map(|f| f.node.clone())
    } else {
        None
    };

    let finished = graft(
        &mut state.aux,
        sm.as_mut(),
        &ctx,
        dst_root,
        dst_path,
        0,
        src_slot,
    )?;

    let offset = finished.offset;
    let mins = finished.root_mins();
    let node = finished.node.clone();
    state.tip = Some(finished);
    state.tip_is_empty = false;
    state.tip_version = dst_version;

    if !blocked_by_write && src_version == dst_version {
        update::flush_and_set_root(&mut state.aux, dst_version, offset)?;
        state.aux.record_version_mins(dst_version, mins);
        state.aux.root_cache.insert(dst_version, node);
        update::store_meta(&mut state.aux)?;
        state.unflushed = false;
    } else {
        // observable once the next root-writing upsert on dst_version lands
        state.unflushed = true;
    }
    Ok(())
}

/// Synthesize the child-slot view of a version's root.
fn root_slot(aux: &UpdateAux, node: &Arc<Node>, offset: ChunkOffset) -> Child {
    let (mut min_fast, mut min_slow) = node.min_offsets();
    if !offset.is_invalid()
        && let Some(disk) = &aux.disk
        && let Some(kind) = disk.lists.list_kind(offset.chunk_id())
    {
        let own = disk.lists.virtual_offset(offset).to_compact();
        match kind {
            crate::offset::ListKind::Fast => min_fast = min_fast.min(own),
            crate::offset::ListKind::Slow => min_slow = min_slow.min(own),
        }
    }
    let slot = Child::new(
        offset,
        node.data.clone(),
        min_fast,
        min_slow,
        node.subtrie_min_version(),
    );
    slot.set_loaded(node.clone());
    slot
}

/// Resolve `path` to the child slot of the subtrie rooted there. A path
/// ending inside a compressed fragment materializes a copy of the node with
/// the fragment tail as its path.
fn locate_slot(
    aux: &mut UpdateAux,
    sm: &mut dyn StateMachine,
    ctx: &UpsertCtx,
    root: Arc<Node>,
    root_offset: ChunkOffset,
    path: &Nibbles,
) -> Result<Child, DbError> {
    let key = path.view();
    let mut slot = root_slot(aux, &root, root_offset);
    let mut node = root;
    let mut consumed = 0usize;
    loop {
        let remaining = key.suffix(consumed);
        let node_path = node.path_view();
        let common = remaining.common_prefix_len(node_path);
        if common == remaining.len() && common == node_path.len() {
            return Ok(slot);
        }
        if common == remaining.len() {
            // mid-fragment: the subtrie here is the node re-rooted on the
            // remaining tail of its path
            let mut copy = Node::new_branch(
                Nibbles::from_view(node_path.suffix(common)),
                node.value.clone(),
                node.version,
            );
            for (branch, child) in node.branches() {
                copy.set_child(branch, child.clone());
            }
            let finished = update::write_node(aux, sm, ctx, copy)?.ok_or(DbError::Unknown)?;
            return Ok(finished.to_child(true));
        }
        if common < node_path.len() {
            return Err(DbError::KeyNotFound);
        }
        consumed += node_path.len();
        let branch = key.get(consumed);
        let Some(child) = node.child(branch) else {
            return Err(DbError::KeyNotFound);
        };
        slot = child.clone();
        let next = resolve_child(aux, &slot)?;
        slot.set_loaded(next.clone());
        node = next;
        consumed += 1;
    }
}

/// Rebuild the destination spine along `dst_path`, hanging `src` at the end
/// without rewriting its nodes. Hashes along the new spine are recomputed.
fn graft(
    aux: &mut UpdateAux,
    sm: &mut dyn StateMachine,
    ctx: &UpsertCtx,
    old: Option<Arc<Node>>,
    dst_path: &Nibbles,
    at: usize,
    src: Child,
) -> Result<Finished, DbError> {
    let key = dst_path.view();
    if at == key.len() {
        // the grafted subtrie replaces this position wholesale
        let node = resolve_child(aux, &src)?;
        return Ok(Finished {
            node,
            offset: src.fnext,
            min_offset_fast: src.min_offset_fast,
            min_offset_slow: src.min_offset_slow,
            subtrie_min_version: src.subtrie_min_version,
        });
    }
    let remaining = key.suffix(at);

    let Some(old_node) = old else {
        // empty position: the source node absorbs the remaining path
        let src_node = resolve_child(aux, &src)?;
        let mut prefixed = Nibbles::from_view(remaining);
        prefixed.extend(src_node.path_view());
        let mut copy = Node::new_branch(prefixed, src_node.value.clone(), src_node.version);
        for (branch, child) in src_node.branches() {
            copy.set_child(branch, child.clone());
        }
        return update::write_node(aux, sm, ctx, copy)?.ok_or(DbError::Unknown);
    };

    let node_path = old_node.path_view();
    let common = remaining.common_prefix_len(node_path);
    if common == remaining.len() {
        // dst lands on or inside this node: everything below is replaced
        return graft(aux, sm, ctx, None, dst_path, at, src);
    }
    if common == node_path.len() {
        // descend one branch, keep the siblings
        let branch = remaining.get(common);
        let mut copy = Node::new_branch(
            Nibbles::from_view(node_path),
            old_node.value.clone(),
            old_node.version.max(ctx.version),
        );
        for (b, child) in old_node.branches() {
            if b != branch {
                copy.set_child(b, child.clone());
            }
        }
        let below = match old_node.child(branch) {
            Some(child) => Some(resolve_child(aux, child)?),
            None => None,
        };
        let finished = graft(aux, sm, ctx, below, dst_path, at + common + 1, src)?;
        copy.set_child(branch, finished.to_child(sm.cache()));
        return update::write_node(aux, sm, ctx, copy)?.ok_or(DbError::Unknown);
    }

    // divergence inside the fragment: split, keeping the old subtrie on its
    // nibble and grafting down the other
    let old_branch = node_path.get(common);
    let new_branch = remaining.get(common);
    let mut parent = Node::new_branch(
        Nibbles::from_view(node_path.prefix(common)),
        None,
        old_node.version.max(ctx.version),
    );
    let mut rehomed = Node::new_branch(
        Nibbles::from_view(node_path.suffix(common + 1)),
        old_node.value.clone(),
        old_node.version,
    );
    for (b, child) in old_node.branches() {
        rehomed.set_child(b, child.clone());
    }
    let rehomed = update::write_node(aux, sm, ctx, rehomed)?.ok_or(DbError::Unknown)?;
    parent.set_child(old_branch, rehomed.to_child(sm.cache()));
    let grafted = graft(aux, sm, ctx, None, dst_path, at + common + 1, src)?;
    parent.set_child(new_branch, grafted.to_child(sm.cache()));
    update::write_node(aux, sm, ctx, parent)?.ok_or(DbError::Unknown)
}

fn rebuild_version_mins(aux: &mut UpdateAux) -> Result<(), DbError> {
    let Some(earliest) = aux.history.earliest_version() else {
        return Ok(());
    };
    let latest = aux.history.latest_version().unwrap_or(earliest);
    for version in earliest..=latest {
        let Some(offset) = aux.history.root_offset_at(version) else {
            continue;
        };
        if offset.is_invalid() {
            aux.record_version_mins(version, Default::default());
            continue;
        }
        let node = aux.read_node(offset)?;
        let slot = root_slot(aux, &node, offset);
        aux.record_version_mins(version, (slot.min_offset_fast, slot.min_offset_slow));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Read-only handle
// ---------------------------------------------------------------------------

/// Blocking read-only database over the writer's files. Lookups go straight
/// to the pool on the calling thread; loaded nodes are pinned in a shared
/// LRU. A find whose version disappears mid-walk reports
/// `VersionNoLongerExist` rather than an error about the garbage it may
/// have read.
pub struct RoDb {
    pool: Pool,
    cache: NodeCache,
    watermark: parking_lot::Mutex<u64>,
}

/// Nodes kept resident per read-only handle.
const RO_CACHE_CAPACITY: usize = 16 * 1024;

impl RoDb {
    pub fn open(config: &DbConfig) -> Result<Self, DbError> {
        let mut pool_config = config.pool_config();
        pool_config.mode = OpenMode::OpenExisting;
        let pool = Pool::open_read_only(&pool_config)?;
        Ok(Self {
            pool,
            cache: NodeCache::new(RO_CACHE_CAPACITY),
            watermark: parking_lot::Mutex::new(0),
        })
    }

    pub fn latest_version(&self) -> Result<Option<u64>, DbError> {
        let (latest, _) = meta::read_versions(&self.pool)?;
        Ok((latest != INVALID_VERSION).then_some(latest))
    }

    pub fn earliest_version(&self) -> Result<Option<u64>, DbError> {
        let (latest, earliest) = meta::read_versions(&self.pool)?;
        Ok((latest != INVALID_VERSION).then_some(earliest))
    }

    pub fn latest_finalized_version(&self) -> Result<Option<u64>, DbError> {
        let (finalized, _, _, _) = meta::read_version_metadata(&self.pool)?;
        Ok((finalized != INVALID_VERSION).then_some(finalized))
    }

    /// Drop cached nodes whenever the live window has moved: chunks are only
    /// recycled after the versions referencing them leave the ring, so an
    /// unchanged `earliest` guarantees cached offsets are still current.
    fn refresh_watermark(&self) -> Result<(), DbError> {
        let (_, earliest) = meta::read_versions(&self.pool)?;
        let mut watermark = self.watermark.lock();
        if *watermark != earliest {
            self.cache.clear();
            *watermark = earliest;
        }
        Ok(())
    }

    /// Owning find: the returned cursor keeps its nodes alive independently
    /// of the cache and the writer.
    pub fn find(&self, key: &Nibbles, version: u64) -> Result<NodeCursor, DbError> {
        self.refresh_watermark()?;
        let offset = meta::read_root_entry(&self.pool, version)?
            .ok_or(DbError::VersionNoLongerExist(version))?;
        if offset.is_invalid() {
            return Err(DbError::KeyNotFound);
        }
        let mut source = RoSource {
            pool: &self.pool,
            cache: &self.cache,
        };
        let root = source.load(offset)?;
        let walked = find::find(&mut source, root, key);
        // the version may have been evicted mid-walk, in which case whatever
        // the walk returned (including a decode error) is meaningless
        let still_there = meta::read_root_entry(&self.pool, version)?;
        if still_there != Some(offset) {
            return Err(DbError::VersionNoLongerExist(version));
        }
        let (cursor, result) = walked?;
        if result.is_success() {
            Ok(cursor)
        } else {
            Err(find_result_to_db_error(result, version))
        }
    }

    pub fn get(&self, key: &Nibbles, version: u64) -> Result<Bytes, DbError> {
        let cursor = self.find(key, version)?;
        cursor.node.value.clone().ok_or(DbError::KeyNotFound)
    }

    pub fn get_data(&self, key: &Nibbles, version: u64) -> Result<NodeData, DbError> {
        if key.is_empty() {
            self.refresh_watermark()?;
            let offset = meta::read_root_entry(&self.pool, version)?
                .ok_or(DbError::VersionNoLongerExist(version))?;
            if offset.is_invalid() {
                return Err(DbError::KeyNotFound);
            }
            let mut source = RoSource {
                pool: &self.pool,
                cache: &self.cache,
            };
            return Ok(source.load(offset)?.data.clone());
        }
        let cursor = self.find(key, version)?;
        Ok(cursor.node.data.clone())
    }
}

struct RoSource<'a> {
    pool: &'a Pool,
    cache: &'a NodeCache,
}

impl NodeSource for RoSource<'_> {
    fn load(&mut self, offset: ChunkOffset) -> Result<Arc<Node>, DbError> {
        if let Some(node) = self.cache.get(offset) {
            return Ok(node);
        }
        let node = Arc::new(read_node_blocking(self.pool, offset)?);
        self.cache.insert(offset, node.clone());
        Ok(node)
    }
}
