//! Shared buffer arena
//!
//! Window buffers live in one memory mapping that the remote peer can also
//! reach. Handles carry an offset into the mapping; the peer only ever sees
//! addresses produced by [`SharedArena::translate`].

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;
use thiserror::Error;

const ALIGN: usize = 16;

#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("arena exhausted: {requested} bytes requested, largest free block {largest}")]
    Exhausted { requested: usize, largest: usize },
    #[error("zero-length allocation")]
    Empty,
    #[error("offset {offset:#x} does not fit the 32-bit peer address space at base {base:#x}")]
    Untranslatable { base: u32, offset: usize },
    #[error("failed to map arena: {0}")]
    Map(#[from] std::io::Error),
}

/// Owned block inside a [`SharedArena`]. Not `Clone`: giving it back to
/// [`SharedArena::release`] consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct ExportedBuffer {
    offset: usize,
    len: usize,
}

impl ExportedBuffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

pub struct SharedArena {
    map: MmapMut,
    remote_base: u32,
    /// offset -> length, non-adjacent
    free: BTreeMap<usize, usize>,
}

impl SharedArena {
    /// Maps (and sizes) a file that a peer on the same machine can map too.
    pub fn create(path: &Path, size: usize, remote_base: u32) -> Result<Self, ArenaError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(size as u64)?;
        // SAFETY: the mapping is only shared with the peer, which writes pixel
        // data into blocks it was handed; we never form references that assume
        // the contents are stable.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self::from_map(map, remote_base))
    }

    #[cfg(test)]
    pub fn anonymous(size: usize, remote_base: u32) -> Result<Self, ArenaError> {
        let map = MmapMut::map_anon(size)?;
        Ok(Self::from_map(map, remote_base))
    }

    fn from_map(map: MmapMut, remote_base: u32) -> Self {
        let mut free = BTreeMap::new();
        if !map.is_empty() {
            free.insert(0, map.len());
        }
        Self {
            map,
            remote_base,
            free,
        }
    }

    pub fn capacity(&self) -> usize {
        self.map.len()
    }

    pub fn free_bytes(&self) -> usize {
        self.free.values().sum()
    }

    /// First-fit allocation of a zeroed block.
    pub fn alloc(&mut self, len: usize) -> Result<ExportedBuffer, ArenaError> {
        if len == 0 {
            return Err(ArenaError::Empty);
        }
        let size = len.next_multiple_of(ALIGN);
        let (&offset, &block) = self
            .free
            .iter()
            .find(|(_, &block)| block >= size)
            .ok_or_else(|| ArenaError::Exhausted {
                requested: len,
                largest: self.free.values().copied().max().unwrap_or(0),
            })?;

        self.free.remove(&offset);
        if block > size {
            self.free.insert(offset + size, block - size);
        }
        self.map[offset..offset + size].fill(0);
        Ok(ExportedBuffer { offset, len: size })
    }

    pub fn release(&mut self, buf: ExportedBuffer) {
        let mut offset = buf.offset;
        let mut len = buf.len;

        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.free.remove(&prev);
                offset = prev;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(offset + len)) {
            len += next_len;
        }
        self.free.insert(offset, len);
    }

    /// Address of `buf` as seen by the peer.
    pub fn translate(&self, buf: &ExportedBuffer) -> Result<u32, ArenaError> {
        u32::try_from(buf.offset)
            .ok()
            .and_then(|off| self.remote_base.checked_add(off))
            .ok_or(ArenaError::Untranslatable {
                base: self.remote_base,
                offset: buf.offset,
            })
    }

    pub fn bytes(&self, buf: &ExportedBuffer) -> &[u8] {
        &self.map[buf.offset..buf.offset + buf.len]
    }

    pub fn bytes_mut(&mut self, buf: &ExportedBuffer) -> &mut [u8] {
        &mut self.map[buf.offset..buf.offset + buf.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut arena = SharedArena::anonymous(4096, 0x0020_0000).unwrap();
        let a = arena.alloc(10).unwrap();
        let b = arena.alloc(100).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(a.len(), 16);
        assert_eq!(b.offset(), 16);
        assert_eq!(arena.translate(&b).unwrap(), 0x0020_0010);
        assert_eq!(arena.free_bytes(), 4096 - 16 - 112);
    }

    #[test]
    fn release_coalesces_neighbours() {
        let mut arena = SharedArena::anonymous(256, 0).unwrap();
        let a = arena.alloc(64).unwrap();
        let b = arena.alloc(64).unwrap();
        let c = arena.alloc(128).unwrap();
        assert!(matches!(arena.alloc(1), Err(ArenaError::Exhausted { .. })));

        arena.release(a);
        arena.release(c);
        assert!(matches!(arena.alloc(129), Err(ArenaError::Exhausted { largest: 128, .. })));
        arena.release(b);
        assert_eq!(arena.free_bytes(), 256);
        assert_eq!(arena.alloc(256).unwrap().offset(), 0);
    }

    #[test]
    fn fresh_blocks_are_zeroed() {
        let mut arena = SharedArena::anonymous(64, 0).unwrap();
        let a = arena.alloc(32).unwrap();
        arena.bytes_mut(&a).fill(0xaa);
        arena.release(a);
        let b = arena.alloc(32).unwrap();
        assert!(arena.bytes(&b).iter().all(|&x| x == 0));
    }

    #[test]
    fn translation_must_fit_peer_address_space() {
        let mut arena = SharedArena::anonymous(64, u32::MAX - 8).unwrap();
        let a = arena.alloc(16).unwrap();
        let b = arena.alloc(16).unwrap();
        assert_eq!(arena.translate(&a).unwrap(), u32::MAX - 8);
        assert!(matches!(arena.translate(&b), Err(ArenaError::Untranslatable { .. })));
    }

    #[test]
    fn rejects_empty_allocation() {
        let mut arena = SharedArena::anonymous(64, 0).unwrap();
        assert!(matches!(arena.alloc(0), Err(ArenaError::Empty)));
    }
}
