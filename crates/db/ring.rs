//! Page-aligned I/O against the pool: a submission/completion ring for node
//! reads and the buffered node writer.
//!
//! With a mapped pool, a submitted read is serviced at submission time; it
//! still travels through the completion queue so the find/upsert/traverse
//! drivers are written against asynchronous completion and respect the
//! configured queue depth. Rings come in read-only and read-write flavors;
//! only the writer thread ever holds a read-write ring.
//!
//! A read is sized from the offset's spare page count when one is present
//! (offsets out of the version ring or in-memory slots). Offsets decoded
//! from a parent's serialization carry a zeroed spare, and the span is
//! recovered from the node's own length prefix instead.

use std::collections::VecDeque;

use crate::codec;
use crate::error::DbError;
use crate::meta::{ChunkLists, NIL, WriteCursor};
use crate::node::Node;
use crate::offset::{
    ChunkOffset, DISK_PAGE_SIZE, ListKind, pages_spanned, round_down_page,
};
use crate::pool::Pool;

/// Flush granularity of the node writer.
const WRITE_UNIT: u64 = 256 * 1024;

pub type Ticket = u64;

/// A page-aligned read, already sliced down to the node it was issued for.
pub struct ReadBuffer {
    bytes: Box<[u8]>,
    node_start: usize,
}

impl ReadBuffer {
    pub fn node_bytes(&self) -> &[u8] {
        &self.bytes[self.node_start..]
    }

    pub fn decode(&self) -> Result<Node, DbError> {
        codec::decode_node(self.node_bytes())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RingMode {
    ReadOnly,
    ReadWrite,
}

/// Completion-queue reader. `submit_read` issues the aligned fetch sized by
/// the offset's spare page count, or by the node's length prefix when the
/// spare is zeroed; completions are consumed with [`poll`] or the blocking
/// [`drain`].
///
/// [`poll`]: IoRing::poll
/// [`drain`]: IoRing::drain
pub struct IoRing {
    mode: RingMode,
    queue_depth: usize,
    completions: VecDeque<(Ticket, ReadBuffer)>,
    next_ticket: Ticket,
    completed: u64,
}

impl IoRing {
    pub fn new(mode: RingMode, queue_depth: usize) -> Self {
        Self {
            mode,
            queue_depth: queue_depth.max(1),
            completions: VecDeque::new(),
            next_ticket: 0,
            completed: 0,
        }
    }

    pub fn mode(&self) -> RingMode {
        self.mode
    }

    /// Completions queued but not yet consumed.
    pub fn in_flight(&self) -> usize {
        self.completions.len()
    }

    /// Issue a read for the node at `offset`; the submission offset itself
    /// is page-aligned with the spare cleared.
    pub fn submit_read(&mut self, pool: &Pool, offset: ChunkOffset) -> Result<Ticket, DbError> {
        debug_assert!(!offset.is_invalid());
        if self.completions.len() >= self.queue_depth {
            // backpressure: the caller must drain before submitting more
            return Err(DbError::invalid_input("ring queue depth exceeded"));
        }
        let aligned = round_down_page(offset.offset());
        let len = read_span(pool, offset)?;
        let rd_offset = ChunkOffset::new(offset.chunk_id(), aligned);
        let window = pool.read_at(rd_offset, len);
        let mut bytes = vec![0u8; len as usize].into_boxed_slice();
        bytes[..window.len()].copy_from_slice(window);
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.completions.push_back((
            ticket,
            ReadBuffer {
                bytes,
                node_start: (offset.offset() - aligned) as usize,
            },
        ));
        Ok(ticket)
    }

    /// Non-blocking: the next completion, if any.
    pub fn poll(&mut self) -> Option<(Ticket, ReadBuffer)> {
        let done = self.completions.pop_front();
        if done.is_some() {
            self.completed += 1;
        }
        done
    }

    /// Blocking drain of every outstanding completion.
    pub fn drain(&mut self) -> Vec<(Ticket, ReadBuffer)> {
        let mut out = Vec::with_capacity(self.completions.len());
        while let Some(done) = self.poll() {
            out.push(done);
        }
        out
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }
}

/// Bytes of whole pages a read starting at `offset` must cover. Falls back
/// to the node's `total_len` prefix when the spare carries no page count.
fn read_span(pool: &Pool, offset: ChunkOffset) -> Result<u64, DbError> {
    let pages = if offset.pages() > 0 {
        offset.pages()
    } else {
        // nodes never span chunks, so the prefix is always in reach
        let total = codec::peek_len(pool.read_at(offset, 4))?;
        pages_spanned(offset.offset(), total as u64)
    };
    Ok((pages as u64) << DISK_PAGE_SIZE.trailing_zeros())
}

/// One-shot read used by blocking read-only paths, bypassing any ring.
pub fn read_node_blocking(pool: &Pool, offset: ChunkOffset) -> Result<Node, DbError> {
    let aligned = round_down_page(offset.offset());
    let len = read_span(pool, offset)?;
    let window = pool.read_at(ChunkOffset::new(offset.chunk_id(), aligned), len);
    codec::decode_node(&window[(offset.offset() - aligned) as usize..])
}

/// Append-only writer into one chunk of a list at a time.
///
/// Nodes are packed back to back; flushes happen per [`WRITE_UNIT`]. When a
/// node does not fit the remaining chunk the tail is zero-padded, the chunk
/// is flushed, and writing continues in a chunk freshly moved from the free
/// list to the back of this writer's list.
pub struct NodeWriter {
    kind: ListKind,
    chunk: u32,
    write_pos: u64,
    dirty_from: u64,
}

impl NodeWriter {
    pub fn new(kind: ListKind) -> Self {
        Self {
            kind,
            chunk: NIL,
            write_pos: 0,
            dirty_from: 0,
        }
    }

    pub fn from_cursor(kind: ListKind, cursor: WriteCursor) -> Self {
        if cursor.is_none() {
            Self::new(kind)
        } else {
            Self {
                kind,
                chunk: cursor.chunk,
                write_pos: cursor.offset,
                dirty_from: cursor.offset,
            }
        }
    }

    pub fn kind(&self) -> ListKind {
        self.kind
    }

    /// The start-of-work-in-progress snapshot stored with each version.
    pub fn cursor(&self) -> WriteCursor {
        if self.chunk == NIL {
            WriteCursor::NONE
        } else {
            WriteCursor {
                chunk: self.chunk,
                offset: self.write_pos,
            }
        }
    }

    /// Point the writer back at an earlier snapshot (rewind). Bytes written
    /// past the cursor stay in their chunks unreferenced until compaction
    /// reclaims them.
    pub fn restore(&mut self, cursor: WriteCursor) {
        if cursor.is_none() {
            *self = Self::new(self.kind);
        } else {
            self.chunk = cursor.chunk;
            self.write_pos = cursor.offset;
            self.dirty_from = cursor.offset;
        }
    }

    fn replace_chunk(
        &mut self,
        pool: &mut Pool,
        lists: &mut ChunkLists,
    ) -> Result<(), DbError> {
        if self.chunk != NIL {
            // zero-pad the abandoned tail so old bytes cannot alias a node
            let size = pool.chunk_capacity(self.chunk);
            pool.chunk_mut(self.chunk)[self.write_pos as usize..size as usize].fill(0);
            pool.flush_chunk_range(self.chunk, self.dirty_from, size - self.dirty_from)?;
        }
        self.chunk = lists.allocate(self.kind)?;
        self.write_pos = 0;
        self.dirty_from = 0;
        Ok(())
    }

    /// Append one serialized node, returning its physical offset with the
    /// page count in the spare bits.
    pub fn write_node(
        &mut self,
        pool: &mut Pool,
        lists: &mut ChunkLists,
        bytes: &[u8],
    ) -> Result<ChunkOffset, DbError> {
        let len = bytes.len() as u64;
        if len > pool.chunk_size() {
            return Err(DbError::invalid_input("node larger than a chunk"));
        }
        if self.chunk == NIL || self.write_pos + len > pool.chunk_capacity(self.chunk) {
            self.replace_chunk(pool, lists)?;
        }
        let offset = ChunkOffset::new(self.chunk, self.write_pos)
            .with_spare(pages_spanned(self.write_pos, len));
        let start = self.write_pos as usize;
        pool.chunk_mut(self.chunk)[start..start + bytes.len()].copy_from_slice(bytes);
        self.write_pos += len;
        if self.write_pos - self.dirty_from >= WRITE_UNIT {
            self.flush(pool)?;
        }
        Ok(offset)
    }

    /// Flush dirty bytes of the current chunk to stable storage.
    pub fn flush(&mut self, pool: &Pool) -> Result<(), DbError> {
        if self.chunk != NIL && self.write_pos > self.dirty_from {
            pool.flush_chunk_range(self.chunk, self.dirty_from, self.write_pos - self.dirty_from)?;
            self.dirty_from = self.write_pos;
        }
        Ok(())
    }
}
