//! Chunked storage pool over memory-mapped backing files.
//!
//! The pool cuts one or more equally-configured files (or one anonymous
//! mapping) into fixed power-of-two chunks addressed by 20-bit chunk id.
//! File 0 additionally reserves a header region ahead of its chunks for the
//! persisted metadata (chunk lists, version ring, cursors).

use std::fs::OpenOptions;
use std::path::PathBuf;

use memmap2::{Mmap, MmapMut};
use tracing::debug;

use crate::error::DbError;
use crate::offset::{ChunkOffset, DISK_PAGE_SIZE, MAX_CHUNK_ID, round_up_page};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpenMode {
    /// All files must already exist with matching geometry.
    OpenExisting,
    /// Create or truncate every file to the configured size.
    Truncate,
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Backing files. Empty means one anonymous mapping of `file_size`.
    pub paths: Vec<PathBuf>,
    pub mode: OpenMode,
    /// Size of each backing file in bytes.
    pub file_size: u64,
    /// Chunk size in bytes; a power of two and a multiple of the page size.
    pub chunk_size: u64,
    /// Bytes reserved ahead of file 0's chunks for the metadata header.
    pub header_len: u64,
    /// Reject pools whose on-disk size disagrees with the configuration.
    pub check_geometry: bool,
}

impl PoolConfig {
    pub fn anonymous(file_size: u64, chunk_size: u64, header_len: u64) -> Self {
        Self {
            paths: Vec::new(),
            mode: OpenMode::Truncate,
            file_size,
            chunk_size,
            header_len,
            check_geometry: true,
        }
    }
}

enum Mapping {
    Rw(MmapMut),
    Ro(Mmap),
}

impl Mapping {
    fn bytes(&self) -> &[u8] {
        match self {
            Mapping::Rw(m) => m,
            Mapping::Ro(m) => m,
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Mapping::Rw(m) => m,
            Mapping::Ro(_) => unreachable!("write into a read-only pool"),
        }
    }
}

pub struct Pool {
    maps: Vec<Mapping>,
    chunk_size: u64,
    header_len: u64,
    /// First chunk id hosted by each file.
    first_chunk: Vec<u32>,
    chunk_count: u32,
    read_only: bool,
}

impl Pool {
    pub fn open(config: &PoolConfig) -> Result<Self, DbError> {
        Self::validate(config)?;
        if config.paths.is_empty() {
            let map = MmapMut::map_anon(config.file_size as usize)
                .map_err(|e| DbError::PoolOpen(format!("anonymous mapping: {e}")))?;
            return Self::assemble(vec![Mapping::Rw(map)], config, false);
        }

        let mut maps = Vec::with_capacity(config.paths.len());
        for path in &config.paths {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(config.mode == OpenMode::Truncate)
                .open(path)
                .map_err(|e| DbError::PoolOpen(format!("{}: {e}", path.display())))?;
            let existing = file
                .metadata()
                .map_err(|e| DbError::PoolOpen(format!("{}: {e}", path.display())))?
                .len();
            match config.mode {
                OpenMode::Truncate => {
                    file.set_len(config.file_size)
                        .map_err(|e| DbError::PoolOpen(format!("{}: {e}", path.display())))?;
                }
                OpenMode::OpenExisting => {
                    if config.check_geometry && existing != config.file_size {
                        return Err(DbError::PoolSizeMismatch(format!(
                            "{} is {existing} bytes, configured {}",
                            path.display(),
                            config.file_size
                        )));
                    }
                }
            }
            // Safety: the pool has exclusive write ownership of its files;
            // read-only clones map the same inode without mutating it.
            let map = unsafe { MmapMut::map_mut(&file) }
                .map_err(|e| DbError::PoolOpen(format!("{}: {e}", path.display())))?;
            maps.push(Mapping::Rw(map));
        }
        Self::assemble(maps, config, false)
    }

    /// Opens the same files read-only, without locking out the writer.
    pub fn open_read_only(config: &PoolConfig) -> Result<Self, DbError> {
        Self::validate(config)?;
        if config.paths.is_empty() {
            return Err(DbError::PoolOpen(
                "an anonymous pool cannot be reopened read-only".into(),
            ));
        }
        let mut maps = Vec::with_capacity(config.paths.len());
        for path in &config.paths {
            let file = OpenOptions::new()
                .read(true)
                .open(path)
                .map_err(|e| DbError::PoolOpen(format!("{}: {e}", path.display())))?;
            let len = file
                .metadata()
                .map_err(|e| DbError::PoolOpen(format!("{}: {e}", path.display())))?
                .len();
            if config.check_geometry && len != config.file_size {
                return Err(DbError::PoolSizeMismatch(format!(
                    "{} is {len} bytes, configured {}",
                    path.display(),
                    config.file_size
                )));
            }
            // Safety: shared mapping of a file this handle never writes.
            let map = unsafe { Mmap::map(&file) }
                .map_err(|e| DbError::PoolOpen(format!("{}: {e}", path.display())))?;
            maps.push(Mapping::Ro(map));
        }
        Self::assemble(maps, config, true)
    }

    fn validate(config: &PoolConfig) -> Result<(), DbError> {
        if !config.chunk_size.is_power_of_two() || config.chunk_size < DISK_PAGE_SIZE {
            return Err(DbError::PoolOpen(format!(
                "chunk size {} must be a power of two ≥ the page size",
                config.chunk_size
            )));
        }
        if config.header_len != round_up_page(config.header_len) {
            return Err(DbError::PoolOpen("header length must be page-aligned".into()));
        }
        if config.file_size < config.header_len + config.chunk_size {
            return Err(DbError::PoolOpen(
                "pool too small for a header and one chunk".into(),
            ));
        }
        Ok(())
    }

    fn assemble(
        maps: Vec<Mapping>,
        config: &PoolConfig,
        read_only: bool,
    ) -> Result<Self, DbError> {
        let mut first_chunk = Vec::with_capacity(maps.len());
        let mut total: u64 = 0;
        for (i, map) in maps.iter().enumerate() {
            first_chunk.push(total as u32);
            let reserved = if i == 0 { config.header_len } else { 0 };
            let usable = (map.bytes().len() as u64).saturating_sub(reserved);
            total += usable / config.chunk_size;
        }
        if total == 0 || total > MAX_CHUNK_ID as u64 + 1 {
            return Err(DbError::PoolSizeMismatch(format!(
                "pool would hold {total} chunks"
            )));
        }
        debug!(
            chunks = total,
            chunk_size = config.chunk_size,
            files = maps.len(),
            "storage pool mapped"
        );
        Ok(Self {
            maps,
            chunk_size: config.chunk_size,
            header_len: config.header_len,
            first_chunk,
            chunk_count: total as u32,
            read_only,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    pub fn chunk_capacity(&self, _chunk_id: u32) -> u64 {
        self.chunk_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn header_len(&self) -> u64 {
        self.header_len
    }

    fn locate(&self, chunk_id: u32) -> (usize, u64) {
        debug_assert!(chunk_id < self.chunk_count);
        let file = self
            .first_chunk
            .partition_point(|&first| first <= chunk_id)
            - 1;
        let local = (chunk_id - self.first_chunk[file]) as u64;
        let base = if file == 0 { self.header_len } else { 0 };
        (file, base + local * self.chunk_size)
    }

    pub fn header(&self) -> &[u8] {
        &self.maps[0].bytes()[..self.header_len as usize]
    }

    pub fn header_mut(&mut self) -> &mut [u8] {
        let len = self.header_len as usize;
        &mut self.maps[0].bytes_mut()[..len]
    }

    pub fn chunk(&self, chunk_id: u32) -> &[u8] {
        let (file, base) = self.locate(chunk_id);
        &self.maps[file].bytes()[base as usize..(base + self.chunk_size) as usize]
    }

    pub fn chunk_mut(&mut self, chunk_id: u32) -> &mut [u8] {
        let (file, base) = self.locate(chunk_id);
        &mut self.maps[file].bytes_mut()[base as usize..(base + self.chunk_size) as usize]
    }

    /// Raw window starting at `offset`, clamped to the containing chunk.
    pub fn read_at(&self, offset: ChunkOffset, len: u64) -> &[u8] {
        let chunk = self.chunk(offset.chunk_id());
        let start = offset.offset() as usize;
        let end = (offset.offset() + len).min(self.chunk_size) as usize;
        &chunk[start..end]
    }

    /// Push a byte range of a chunk to stable storage.
    pub fn flush_chunk_range(&self, chunk_id: u32, from: u64, len: u64) -> Result<(), DbError> {
        let (file, base) = self.locate(chunk_id);
        if let Mapping::Rw(map) = &self.maps[file] {
            map.flush_range((base + from) as usize, len as usize)?;
        }
        Ok(())
    }

    pub fn flush_header(&self) -> Result<(), DbError> {
        if let Mapping::Rw(map) = &self.maps[0] {
            map.flush_range(0, self.header_len as usize)?;
        }
        Ok(())
    }
}
