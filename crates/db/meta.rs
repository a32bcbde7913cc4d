//! Persisted pool metadata: the chunk lists, version-metadata fields, write
//! cursors, and the serialized form of the root history ring.
//!
//! Chunks are linked by 20-bit index, never by pointer; list surgery is a
//! handful of index writes on the metadata array, owned exclusively by the
//! writer thread. The header bytes live at the front of file 0 and are
//! rewritten only after the node writes they depend on have been flushed.

use ethereum_types::H256;

use crate::error::DbError;
use crate::history::{INVALID_VERSION, RootEntry, RootHistory};
use crate::offset::{
    ChunkOffset, CompactVirtualOffset, INVALID_COMPACT_OFFSET, ListKind, PACKED_OFFSET_SIZE,
    VirtualOffset, round_up_page,
};
use crate::pool::Pool;

pub const NIL: u32 = u32::MAX;

const MAGIC: &[u8; 8] = b"TRIEDB\x00\x01";
const FIXED_HEADER_SIZE: usize = 192;
const CHUNK_META_SIZE: usize = 13;
const ROOT_ENTRY_SIZE: usize = 8 + PACKED_OFFSET_SIZE + 2 * CURSOR_SIZE;
const CURSOR_SIZE: usize = 12;

/// Next byte the node writer will claim in its current chunk; the
/// "start of work-in-progress" snapshot persisted per version.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct WriteCursor {
    pub chunk: u32,
    pub offset: u64,
}

impl WriteCursor {
    pub const NONE: WriteCursor = WriteCursor {
        chunk: NIL,
        offset: 0,
    };

    pub fn is_none(&self) -> bool {
        self.chunk == NIL
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ChunkState {
    Free = 0,
    Fast = 1,
    Slow = 2,
}

impl ChunkState {
    fn from_u8(v: u8) -> Result<Self, DbError> {
        match v {
            0 => Ok(Self::Free),
            1 => Ok(Self::Fast),
            2 => Ok(Self::Slow),
            _ => Err(DbError::invalid_input("corrupt chunk state")),
        }
    }

    fn list_index(self) -> usize {
        self as usize
    }
}

impl From<ListKind> for ChunkState {
    fn from(kind: ListKind) -> Self {
        match kind {
            ListKind::Fast => ChunkState::Fast,
            ListKind::Slow => ChunkState::Slow,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct ChunkMeta {
    prev: u32,
    next: u32,
    /// Insertion count into the owning list; the age key of virtual offsets.
    ordinal: u32,
    state: ChunkState,
}

/// The free/fast/slow partition of all chunks.
pub struct ChunkLists {
    chunks: Vec<ChunkMeta>,
    heads: [u32; 3],
    tails: [u32; 3],
    lens: [u32; 3],
    next_ordinal: [u32; 2],
}

impl ChunkLists {
    pub fn new(chunk_count: u32) -> Self {
        let mut lists = Self {
            chunks: vec![
                ChunkMeta {
                    prev: NIL,
                    next: NIL,
                    ordinal: 0,
                    state: ChunkState::Free,
                };
                chunk_count as usize
            ],
            heads: [NIL; 3],
            tails: [NIL; 3],
            lens: [0; 3],
            next_ordinal: [0; 2],
        };
        for id in 0..chunk_count {
            lists.push_back(ChunkState::Free, id);
        }
        lists
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn free_len(&self) -> u32 {
        self.lens[ChunkState::Free.list_index()]
    }

    pub fn len(&self, kind: ListKind) -> u32 {
        self.lens[ChunkState::from(kind).list_index()]
    }

    pub fn state(&self, id: u32) -> ChunkState {
        self.chunks[id as usize].state
    }

    pub fn ordinal(&self, id: u32) -> u32 {
        self.chunks[id as usize].ordinal
    }

    /// Oldest chunk of a list (its head), the compaction victim.
    pub fn oldest(&self, kind: ListKind) -> Option<u32> {
        let head = self.heads[ChunkState::from(kind).list_index()];
        (head != NIL).then_some(head)
    }

    /// The ordinal the next allocation into `kind` will receive.
    pub fn next_ordinal_hint(&self, kind: ListKind) -> u32 {
        match kind {
            ListKind::Fast => self.next_ordinal[0],
            ListKind::Slow => self.next_ordinal[1],
        }
    }

    pub fn free_head(&self) -> Option<u32> {
        let head = self.heads[ChunkState::Free.list_index()];
        (head != NIL).then_some(head)
    }

    fn push_back(&mut self, state: ChunkState, id: u32) {
        let list = state.list_index();
        let tail = self.tails[list];
        {
            let meta = &mut self.chunks[id as usize];
            meta.state = state;
            meta.prev = tail;
            meta.next = NIL;
        }
        if tail == NIL {
            self.heads[list] = id;
        } else {
            self.chunks[tail as usize].next = id;
        }
        self.tails[list] = id;
        self.lens[list] += 1;
    }

    fn unlink(&mut self, id: u32) {
        let ChunkMeta { prev, next, state, .. } = self.chunks[id as usize];
        let list = state.list_index();
        if prev == NIL {
            self.heads[list] = next;
        } else {
            self.chunks[prev as usize].next = next;
        }
        if next == NIL {
            self.tails[list] = prev;
        } else {
            self.chunks[next as usize].prev = prev;
        }
        self.lens[list] -= 1;
    }

    /// Move a free chunk to the back of `kind`, stamping its age ordinal.
    pub fn allocate(&mut self, kind: ListKind) -> Result<u32, DbError> {
        let id = self
            .free_head()
            .ok_or(DbError::WriteAmplificationFull)?;
        self.unlink(id);
        let ordinal_slot = match kind {
            ListKind::Fast => 0,
            ListKind::Slow => 1,
        };
        let ordinal = self.next_ordinal[ordinal_slot];
        self.next_ordinal[ordinal_slot] += 1;
        self.chunks[id as usize].ordinal = ordinal;
        self.push_back(kind.into(), id);
        Ok(id)
    }

    /// Return a fast/slow chunk to the free list.
    pub fn release(&mut self, id: u32) {
        debug_assert_ne!(self.state(id), ChunkState::Free);
        self.unlink(id);
        self.chunks[id as usize].ordinal = 0;
        self.push_back(ChunkState::Free, id);
    }

    pub fn virtual_offset(&self, offset: ChunkOffset) -> VirtualOffset {
        let id = offset.chunk_id();
        let kind = match self.state(id) {
            ChunkState::Fast => ListKind::Fast,
            ChunkState::Slow => ListKind::Slow,
            ChunkState::Free => unreachable!("live offset into a free chunk"),
        };
        VirtualOffset::new(kind, self.ordinal(id), offset.offset())
    }

    pub fn list_kind(&self, id: u32) -> Option<ListKind> {
        match self.state(id) {
            ChunkState::Fast => Some(ListKind::Fast),
            ChunkState::Slow => Some(ListKind::Slow),
            ChunkState::Free => None,
        }
    }

    pub fn iter_list(&self, kind: ListKind) -> ListIter<'_> {
        ListIter {
            lists: self,
            cursor: self.heads[ChunkState::from(kind).list_index()],
        }
    }
}

pub struct ListIter<'a> {
    lists: &'a ChunkLists,
    cursor: u32,
}

impl Iterator for ListIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.cursor == NIL {
            return None;
        }
        let id = self.cursor;
        self.cursor = self.lists.chunks[id as usize].next;
        Some(id)
    }
}

/// Scalar header fields outside the lists and the ring.
#[derive(Clone, Copy, Debug)]
pub struct MetaFields {
    pub latest_finalized: u64,
    pub latest_verified: u64,
    pub latest_voted: u64,
    pub latest_voted_block_id: H256,
    pub cursor_fast: WriteCursor,
    pub cursor_slow: WriteCursor,
    pub compact_frontier_fast: CompactVirtualOffset,
    pub compact_frontier_slow: CompactVirtualOffset,
}

impl Default for MetaFields {
    fn default() -> Self {
        Self {
            latest_finalized: INVALID_VERSION,
            latest_verified: INVALID_VERSION,
            latest_voted: INVALID_VERSION,
            latest_voted_block_id: H256::zero(),
            cursor_fast: WriteCursor::NONE,
            cursor_slow: WriteCursor::NONE,
            compact_frontier_fast: INVALID_COMPACT_OFFSET,
            compact_frontier_slow: INVALID_COMPACT_OFFSET,
        }
    }
}

/// Header bytes needed for `chunk_count` chunks and `history_len` roots,
/// rounded up to whole pages.
pub fn header_len(chunk_count: u64, history_len: u64) -> u64 {
    round_up_page(
        (FIXED_HEADER_SIZE as u64)
            + chunk_count * CHUNK_META_SIZE as u64
            + history_len * ROOT_ENTRY_SIZE as u64,
    )
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn u8(&mut self, v: u8) {
        self.put(&[v]);
    }

    fn u32(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.put(&v.to_le_bytes());
    }

    fn cursor(&mut self, c: WriteCursor) {
        self.u32(c.chunk);
        self.u64(c.offset);
    }

    fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }
}

struct ReaderAt<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl ReaderAt<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], DbError> {
        if self.pos + n > self.buf.len() {
            return Err(DbError::PoolSizeMismatch("header shorter than layout".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DbError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DbError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("len 4")))
    }

    fn u64(&mut self) -> Result<u64, DbError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("len 8")))
    }

    fn cursor(&mut self) -> Result<WriteCursor, DbError> {
        Ok(WriteCursor {
            chunk: self.u32()?,
            offset: self.u64()?,
        })
    }

    fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }
}

/// Serialize everything into the pool's header region. Call only after the
/// node writes this state refers to have reached stable storage.
pub fn store(
    pool: &mut Pool,
    fields: &MetaFields,
    lists: &ChunkLists,
    history: &RootHistory,
) -> Result<(), DbError> {
    let chunk_size = pool.chunk_size();
    let header = pool.header_mut();
    let mut w = Writer {
        buf: header,
        pos: 0,
    };
    w.put(MAGIC);
    w.u64(chunk_size);
    w.u32(lists.chunk_count());
    w.u32(history.capacity() as u32);
    w.u64(history.latest_version().unwrap_or(INVALID_VERSION));
    w.u64(history.earliest_version().unwrap_or(INVALID_VERSION));
    w.u64(fields.latest_finalized);
    w.u64(fields.latest_verified);
    w.u64(fields.latest_voted);
    w.put(fields.latest_voted_block_id.as_bytes());
    for list in 0..3 {
        w.u32(lists.heads[list]);
        w.u32(lists.tails[list]);
    }
    w.u32(lists.next_ordinal[0]);
    w.u32(lists.next_ordinal[1]);
    w.cursor(fields.cursor_fast);
    w.cursor(fields.cursor_slow);
    w.u32(fields.compact_frontier_fast.to_raw());
    w.u32(fields.compact_frontier_slow.to_raw());

    w.seek(FIXED_HEADER_SIZE);
    for meta in &lists.chunks {
        w.u32(meta.prev);
        w.u32(meta.next);
        w.u32(meta.ordinal);
        w.u8(meta.state as u8);
    }
    for entry in history.entries() {
        w.u64(entry.version);
        w.put(&entry.offset.to_bytes());
        w.cursor(entry.cursor_fast);
        w.cursor(entry.cursor_slow);
    }
    pool.flush_header()
}

/// Deserialize the header. Fails with `PoolSizeMismatch` when the persisted
/// geometry disagrees with the mapped pool.
pub fn load(pool: &Pool) -> Result<(MetaFields, ChunkLists, RootHistory), DbError> {
    let header = pool.header();
    let mut r = ReaderAt {
        buf: header,
        pos: 0,
    };
    if r.take(8)? != MAGIC {
        return Err(DbError::PoolOpen("bad metadata magic".into()));
    }
    let chunk_size = r.u64()?;
    let chunk_count = r.u32()?;
    let history_len = r.u32()? as usize;
    if chunk_size != pool.chunk_size() {
        return Err(DbError::PoolSizeMismatch(format!(
            "chunk size on disk {chunk_size}, configured {}",
            pool.chunk_size()
        )));
    }
    if chunk_count != pool.chunk_count() {
        return Err(DbError::PoolSizeMismatch(format!(
            "chunk count on disk {chunk_count}, mapped {}",
            pool.chunk_count()
        )));
    }
    let latest = r.u64()?;
    let earliest = r.u64()?;
    let mut fields = MetaFields {
        latest_finalized: r.u64()?,
        latest_verified: r.u64()?,
        latest_voted: r.u64()?,
        latest_voted_block_id: H256::from_slice(r.take(32)?),
        ..MetaFields::default()
    };
    let mut heads = [NIL; 3];
    let mut tails = [NIL; 3];
    for list in 0..3 {
        heads[list] = r.u32()?;
        tails[list] = r.u32()?;
    }
    let next_ordinal = [r.u32()?, r.u32()?];
    fields.cursor_fast = r.cursor()?;
    fields.cursor_slow = r.cursor()?;
    fields.compact_frontier_fast = CompactVirtualOffset::from_raw(r.u32()?);
    fields.compact_frontier_slow = CompactVirtualOffset::from_raw(r.u32()?);

    r.seek(FIXED_HEADER_SIZE);
    let mut chunks = Vec::with_capacity(chunk_count as usize);
    let mut lens = [0u32; 3];
    for _ in 0..chunk_count {
        let prev = r.u32()?;
        let next = r.u32()?;
        let ordinal = r.u32()?;
        let state = ChunkState::from_u8(r.u8()?)?;
        lens[state.list_index()] += 1;
        chunks.push(ChunkMeta {
            prev,
            next,
            ordinal,
            state,
        });
    }
    let lists = ChunkLists {
        chunks,
        heads,
        tails,
        lens,
        next_ordinal,
    };

    let mut entries = Vec::with_capacity(history_len);
    for _ in 0..history_len {
        let version = r.u64()?;
        let offset_bytes: [u8; PACKED_OFFSET_SIZE] =
            r.take(PACKED_OFFSET_SIZE)?.try_into().expect("len matches");
        entries.push(RootEntry {
            version,
            offset: ChunkOffset::from_bytes(offset_bytes),
            cursor_fast: r.cursor()?,
            cursor_slow: r.cursor()?,
        });
    }
    let history = RootHistory::from_entries(entries, latest, earliest);
    Ok((fields, lists, history))
}

/// Live version window as persisted: `(latest, earliest)`, both
/// `INVALID_VERSION` when the ring has never been written.
pub fn read_versions(pool: &Pool) -> Result<(u64, u64), DbError> {
    let mut r = ReaderAt {
        buf: pool.header(),
        pos: 0,
    };
    if r.take(8)? != MAGIC {
        return Err(DbError::PoolOpen("bad metadata magic".into()));
    }
    r.seek(24);
    Ok((r.u64()?, r.u64()?))
}

/// Finalized / verified / voted markers, without parsing the chunk lists.
pub fn read_version_metadata(pool: &Pool) -> Result<(u64, u64, u64, H256), DbError> {
    let mut r = ReaderAt {
        buf: pool.header(),
        pos: 40,
    };
    Ok((
        r.u64()?,
        r.u64()?,
        r.u64()?,
        H256::from_slice(r.take(32)?),
    ))
}

/// Root offset of `version` straight from the persisted ring, or `None`
/// when the version is outside the window or its slot was reused.
pub fn read_root_entry(pool: &Pool, version: u64) -> Result<Option<ChunkOffset>, DbError> {
    let (latest, earliest) = read_versions(pool)?;
    if latest == INVALID_VERSION || version < earliest || version > latest {
        return Ok(None);
    }
    let mut r = ReaderAt {
        buf: pool.header(),
        pos: 16,
    };
    let chunk_count = r.u32()? as usize;
    let history_len = r.u32()? as usize;
    let slot = (version % history_len as u64) as usize;
    let pos = FIXED_HEADER_SIZE + chunk_count * CHUNK_META_SIZE + slot * ROOT_ENTRY_SIZE;
    r.seek(pos);
    let stored = r.u64()?;
    if stored != version {
        return Ok(None);
    }
    let offset_bytes: [u8; PACKED_OFFSET_SIZE] =
        r.take(PACKED_OFFSET_SIZE)?.try_into().expect("len matches");
    Ok(Some(ChunkOffset::from_bytes(offset_bytes)))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pool::PoolConfig;

    #[test]
    fn lists_partition_all_chunks() {
        let mut lists = ChunkLists::new(8);
        assert_eq!(lists.free_len(), 8);
        let a = lists.allocate(ListKind::Fast).expect("alloc");
        let b = lists.allocate(ListKind::Fast).expect("alloc");
        let c = lists.allocate(ListKind::Slow).expect("alloc");
        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(lists.free_len(), 5);
        assert_eq!(lists.len(ListKind::Fast), 2);
        assert_eq!(lists.oldest(ListKind::Fast), Some(a));
        assert_eq!(lists.ordinal(b), 1);

        lists.release(a);
        assert_eq!(lists.oldest(ListKind::Fast), Some(b));
        assert_eq!(lists.free_len(), 6);
        // freed chunk reallocates with a fresh, larger ordinal
        let d = lists.allocate(ListKind::Fast).expect("alloc");
        assert_eq!(lists.ordinal(d), 2);
    }

    #[test]
    fn allocate_exhaustion() {
        let mut lists = ChunkLists::new(1);
        lists.allocate(ListKind::Slow).expect("alloc");
        assert!(matches!(
            lists.allocate(ListKind::Fast),
            Err(DbError::WriteAmplificationFull)
        ));
    }

    #[test]
    fn header_roundtrip() {
        let history_len = 8u64;
        let chunk_size = 1u64 << 16;
        let hdr = header_len(16, history_len);
        let mut pool = Pool::open(&PoolConfig::anonymous(1 << 20, chunk_size, hdr)).expect("pool");

        let mut lists = ChunkLists::new(pool.chunk_count());
        let fast = lists.allocate(ListKind::Fast).expect("alloc");
        lists.allocate(ListKind::Slow).expect("alloc");

        let mut history = RootHistory::new(history_len as usize);
        history
            .set_root(
                0,
                ChunkOffset::new(fast, 128).with_spare(1),
                WriteCursor {
                    chunk: fast,
                    offset: 4096,
                },
                WriteCursor::NONE,
            )
            .expect("root");

        let fields = MetaFields {
            latest_finalized: 0,
            latest_voted_block_id: H256::repeat_byte(0xab),
            cursor_fast: WriteCursor {
                chunk: fast,
                offset: 4096,
            },
            ..MetaFields::default()
        };
        store(&mut pool, &fields, &lists, &history).expect("store");

        let (rfields, rlists, rhistory) = load(&pool).expect("load");
        assert_eq!(rfields.latest_finalized, 0);
        assert_eq!(rfields.latest_voted_block_id, H256::repeat_byte(0xab));
        assert_eq!(rfields.cursor_fast.chunk, fast);
        assert_eq!(rlists.state(fast), ChunkState::Fast);
        assert_eq!(rlists.free_len(), lists.free_len());
        assert_eq!(rlists.next_ordinal, lists.next_ordinal);
        assert_eq!(rhistory.latest_version(), Some(0));
        let entry = rhistory.entry_at(0).expect("entry");
        assert_eq!(entry.offset.pages(), 1);
        assert_eq!(entry.cursor_fast.offset, 4096);
    }
}
