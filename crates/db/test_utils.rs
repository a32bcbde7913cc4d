//! Shared fixtures for unit tests.

use bytes::Bytes;

use crate::meta::{ChunkLists, MetaFields, header_len};
use crate::nibbles::Nibbles;
use crate::offset::DISK_PAGE_SIZE;
use crate::pool::{Pool, PoolConfig};
use crate::update::{DiskState, UpdateAux};

pub fn key_nibbles(bytes: &[u8]) -> Nibbles {
    Nibbles::from_bytes(bytes)
}

pub fn value(bytes: &[u8]) -> Bytes {
    Bytes::copy_from_slice(bytes)
}

/// A writer-side aux over an anonymous pool, compaction on.
pub fn open_anon_aux(history_len: usize) -> UpdateAux {
    let chunk_size = 1u64 << 16;
    let hdr = header_len(64, history_len as u64).max(DISK_PAGE_SIZE);
    let pool = Pool::open(&PoolConfig::anonymous(1 << 22, chunk_size, hdr)).expect("pool");
    let lists = ChunkLists::new(pool.chunk_count());
    let fields = MetaFields::default();
    let disk = DiskState::new(pool, lists, &fields, 32);
    UpdateAux::on_disk(
        disk,
        fields,
        crate::history::RootHistory::new(history_len),
        true,
        None,
    )
}
