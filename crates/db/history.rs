//! Bounded ring of historical roots.
//!
//! Entry `version` lives at slot `version % capacity`. A slot whose stored
//! version does not match the requested one — because it was evicted,
//! overwritten after a rewind, or invalidated by a forward move — makes the
//! version unreadable, which is exactly the `VersionNoLongerExist` surface.

use crate::error::DbError;
use crate::meta::WriteCursor;
use crate::offset::{ChunkOffset, INVALID_OFFSET};

pub const INVALID_VERSION: u64 = u64::MAX;

#[derive(Clone, Copy, Debug)]
pub struct RootEntry {
    pub version: u64,
    pub offset: ChunkOffset,
    /// Write cursors captured when this version's upsert flushed; restored
    /// on rewind so abandoned bytes are overwritten.
    pub cursor_fast: WriteCursor,
    pub cursor_slow: WriteCursor,
}

impl RootEntry {
    pub const EMPTY: RootEntry = RootEntry {
        version: INVALID_VERSION,
        offset: INVALID_OFFSET,
        cursor_fast: WriteCursor::NONE,
        cursor_slow: WriteCursor::NONE,
    };

    pub fn is_empty(&self) -> bool {
        self.version == INVALID_VERSION
    }
}

pub struct RootHistory {
    entries: Vec<RootEntry>,
    latest: u64,
    earliest: u64,
}

impl RootHistory {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            entries: vec![RootEntry::EMPTY; capacity],
            latest: INVALID_VERSION,
            earliest: INVALID_VERSION,
        }
    }

    pub fn from_entries(entries: Vec<RootEntry>, latest: u64, earliest: u64) -> Self {
        assert!(!entries.is_empty());
        Self {
            entries,
            latest,
            earliest,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest == INVALID_VERSION
    }

    pub fn latest_version(&self) -> Option<u64> {
        (!self.is_empty()).then_some(self.latest)
    }

    pub fn earliest_version(&self) -> Option<u64> {
        (!self.is_empty()).then_some(self.earliest)
    }

    pub fn entries(&self) -> &[RootEntry] {
        &self.entries
    }

    fn slot(&self, version: u64) -> usize {
        (version % self.entries.len() as u64) as usize
    }

    pub fn entry_at(&self, version: u64) -> Option<&RootEntry> {
        if self.is_empty() || version < self.earliest || version > self.latest {
            return None;
        }
        let entry = &self.entries[self.slot(version)];
        (entry.version == version).then_some(entry)
    }

    pub fn is_valid_version(&self, version: u64) -> bool {
        self.entry_at(version).is_some()
    }

    pub fn root_offset_at(&self, version: u64) -> Option<ChunkOffset> {
        self.entry_at(version).map(|e| e.offset)
    }

    /// Publish `version`'s root. Appends past the latest version (possibly
    /// skipping — skipped versions read as gone) or rewrites an existing
    /// in-range entry.
    pub fn set_root(
        &mut self,
        version: u64,
        offset: ChunkOffset,
        cursor_fast: WriteCursor,
        cursor_slow: WriteCursor,
    ) -> Result<(), DbError> {
        let entry = RootEntry {
            version,
            offset,
            cursor_fast,
            cursor_slow,
        };
        if self.is_empty() {
            self.latest = version;
            self.earliest = version;
        } else if version > self.latest {
            self.latest = version;
        } else if self.entry_at(version).is_none() {
            return Err(DbError::invalid_input(format!(
                "version {version} is outside the live history"
            )));
        }
        let slot = self.slot(version);
        self.entries[slot] = entry;
        // ring is full once the window spans the capacity
        let window = self.entries.len() as u64;
        if self.latest - self.earliest >= window {
            self.earliest = self.latest + 1 - window;
        }
        Ok(())
    }

    /// Rewrite an existing, still-valid entry in place.
    pub fn update_root_offset(
        &mut self,
        version: u64,
        offset: ChunkOffset,
    ) -> Result<(), DbError> {
        if self.entry_at(version).is_none() {
            return Err(DbError::invalid_input(format!(
                "cannot rewrite root of dead version {version}"
            )));
        }
        let slot = self.slot(version);
        self.entries[slot].offset = offset;
        Ok(())
    }

    /// Drop every version above `version` and hand back its entry so the
    /// caller can restore the write cursors.
    pub fn rewind_to_version(&mut self, version: u64) -> Result<RootEntry, DbError> {
        let entry = *self.entry_at(version).ok_or_else(|| {
            DbError::invalid_input(format!("cannot rewind to dead version {version}"))
        })?;
        let mut v = version + 1;
        while v <= self.latest {
            let slot = self.slot(v);
            if self.entries[slot].version == v {
                self.entries[slot] = RootEntry::EMPTY;
            }
            v += 1;
        }
        self.latest = version;
        Ok(entry)
    }

    /// Re-label the root at `src` as `dst > src`, invalidating everything in
    /// between. Readers afterwards see `dst` and surviving versions ≤ `src`.
    pub fn move_version_forward(&mut self, src: u64, dst: u64) -> Result<(), DbError> {
        if dst <= src {
            return Err(DbError::invalid_input(format!(
                "move-forward requires dst > src, got {src} -> {dst}"
            )));
        }
        let entry = *self
            .entry_at(src)
            .ok_or(DbError::VersionNoLongerExist(src))?;
        let window = self.entries.len() as u64;
        let mut v = src + 1;
        while v < dst && v - src <= window {
            let slot = self.slot(v);
            if !self.entries[slot].is_empty() && self.entries[slot].version <= dst {
                self.entries[slot] = RootEntry::EMPTY;
            }
            v += 1;
        }
        let slot = self.slot(dst);
        self.entries[slot] = RootEntry { version: dst, ..entry };
        if dst > self.latest {
            self.latest = dst;
        }
        if self.latest - self.earliest >= window {
            self.earliest = self.latest + 1 - window;
        }
        Ok(())
    }
}
