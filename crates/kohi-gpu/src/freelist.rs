//! Byte-range allocator for sub-allocating inside one large GPU buffer.
//!
//! Free space is kept as a list of blocks sorted by offset. Adjacent free blocks
//! are always merged, so the list never contains two blocks that touch.
//! Allocation is first-fit.

use crate::error::{GpuError, Result};

/// A contiguous run of free bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FreeBlock {
    offset: u64,
    size: u64,
}

impl FreeBlock {
    #[inline]
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// First-fit freelist over `[0, total_size)`.
#[derive(Clone, Debug)]
pub struct Freelist {
    total_size: u64,
    blocks: Vec<FreeBlock>,
}

impl Freelist {
    /// Create a freelist where the whole range is free.
    pub fn new(total_size: u64) -> Self {
        let blocks = if total_size > 0 {
            vec![FreeBlock {
                offset: 0,
                size: total_size,
            }]
        } else {
            Vec::new()
        };

        Self { total_size, blocks }
    }

    /// Size of the managed range.
    #[inline]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Total number of free bytes (not necessarily contiguous).
    pub fn free_space(&self) -> u64 {
        self.blocks.iter().map(|b| b.size).sum()
    }

    /// Size of the largest contiguous free block.
    pub fn largest_free_block(&self) -> u64 {
        self.blocks.iter().map(|b| b.size).max().unwrap_or(0)
    }

    /// Number of free blocks; a fully coalesced, empty list has one.
    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Allocate `size` bytes and return the offset of the range.
    pub fn allocate(&mut self, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(GpuError::InvalidState(
                "cannot allocate a zero-sized range".to_string(),
            ));
        }

        let Some(index) = self.blocks.iter().position(|b| b.size >= size) else {
            let largest_free = self.largest_free_block();
            tracing::warn!(
                "Freelist out of space: requested {} bytes, {} free, largest block {}",
                size,
                self.free_space(),
                largest_free
            );
            return Err(GpuError::OutOfSpace {
                requested: size,
                largest_free,
            });
        };

        let block = &mut self.blocks[index];
        let offset = block.offset;
        if block.size == size {
            self.blocks.remove(index);
        } else {
            block.offset += size;
            block.size -= size;
        }

        Ok(offset)
    }

    /// Return a previously allocated range.
    ///
    /// Freeing a range that overlaps free space (a double free) or that lies
    /// outside the managed range is rejected without touching the list.
    pub fn free(&mut self, offset: u64, size: u64) -> Result<()> {
        let invalid = GpuError::InvalidFree { offset, size };
        let Some(end) = offset.checked_add(size) else {
            return Err(invalid);
        };
        if size == 0 || end > self.total_size {
            return Err(invalid);
        }

        let index = self.blocks.partition_point(|b| b.offset < offset);

        if index > 0 && self.blocks[index - 1].end() > offset {
            return Err(invalid);
        }
        if index < self.blocks.len() && self.blocks[index].offset < end {
            return Err(invalid);
        }

        self.blocks.insert(index, FreeBlock { offset, size });

        // Merge with the following block.
        if index + 1 < self.blocks.len() && self.blocks[index].end() == self.blocks[index + 1].offset
        {
            let next = self.blocks.remove(index + 1);
            self.blocks[index].size += next.size;
        }

        // Merge with the preceding block.
        if index > 0 && self.blocks[index - 1].end() == self.blocks[index].offset {
            let current = self.blocks.remove(index);
            self.blocks[index - 1].size += current.size;
        }

        Ok(())
    }

    /// Grow the managed range to `new_size`. Existing allocations keep their offsets.
    pub fn resize(&mut self, new_size: u64) -> Result<()> {
        if new_size < self.total_size {
            return Err(GpuError::InvalidState(format!(
                "freelist can only grow ({} -> {})",
                self.total_size, new_size
            )));
        }

        let added = new_size - self.total_size;
        if added > 0 {
            match self.blocks.last_mut() {
                Some(last) if last.end() == self.total_size => last.size += added,
                _ => self.blocks.push(FreeBlock {
                    offset: self.total_size,
                    size: added,
                }),
            }
        }

        self.total_size = new_size;
        Ok(())
    }

    /// Mark the whole range free again.
    pub fn clear(&mut self) {
        *self = Self::new(self.total_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_sequentially() {
        let mut list = Freelist::new(1024);
        assert_eq!(list.allocate(256).unwrap(), 0);
        assert_eq!(list.allocate(256).unwrap(), 256);
        assert_eq!(list.allocate(512).unwrap(), 512);
        assert_eq!(list.free_space(), 0);
        assert_eq!(list.block_count(), 0);
    }

    #[test]
    fn out_of_space_reports_largest_block() {
        let mut list = Freelist::new(512);
        let a = list.allocate(128).unwrap();
        list.allocate(128).unwrap();
        list.free(a, 128).unwrap();

        match list.allocate(300) {
            Err(GpuError::OutOfSpace {
                requested,
                largest_free,
            }) => {
                assert_eq!(requested, 300);
                assert_eq!(largest_free, 256);
            }
            other => panic!("expected OutOfSpace, got {other:?}"),
        }
    }

    #[test]
    fn free_coalesces_neighbours() {
        let mut list = Freelist::new(768);
        let a = list.allocate(256).unwrap();
        let b = list.allocate(256).unwrap();
        let c = list.allocate(256).unwrap();

        list.free(a, 256).unwrap();
        list.free(c, 256).unwrap();
        assert_eq!(list.block_count(), 2);

        list.free(b, 256).unwrap();
        assert_eq!(list.block_count(), 1);
        assert_eq!(list.largest_free_block(), 768);
    }

    #[test]
    fn freed_range_is_reused_first() {
        let mut list = Freelist::new(1024);
        list.allocate(256).unwrap();
        let b = list.allocate(256).unwrap();
        list.allocate(256).unwrap();
        list.free(b, 256).unwrap();

        assert_eq!(list.allocate(256).unwrap(), b);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut list = Freelist::new(512);
        let a = list.allocate(128).unwrap();
        list.free(a, 128).unwrap();

        let before = list.free_space();
        assert!(matches!(
            list.free(a, 128),
            Err(GpuError::InvalidFree { .. })
        ));
        assert_eq!(list.free_space(), before);
    }

    #[test]
    fn out_of_range_free_is_rejected() {
        let mut list = Freelist::new(256);
        list.allocate(256).unwrap();
        assert!(list.free(200, 100).is_err());
        assert!(list.free(0, 0).is_err());
        assert!(list.free(u64::MAX, 2).is_err());
    }

    #[test]
    fn resize_preserves_allocations() {
        let mut list = Freelist::new(512);
        let a = list.allocate(256).unwrap();
        let b = list.allocate(256).unwrap();

        list.resize(1024).unwrap();
        assert_eq!(list.total_size(), 1024);
        assert_eq!(list.free_space(), 512);
        assert_eq!(list.allocate(512).unwrap(), 512);

        list.free(a, 256).unwrap();
        list.free(b, 256).unwrap();
        assert_eq!(list.free_space(), 512);
        assert!(list.resize(256).is_err());
    }

    #[test]
    fn resize_extends_trailing_free_block() {
        let mut list = Freelist::new(512);
        list.allocate(128).unwrap();
        list.resize(1024).unwrap();
        assert_eq!(list.block_count(), 1);
        assert_eq!(list.largest_free_block(), 896);
    }

    #[test]
    fn random_sequence_never_overlaps() {
        const TOTAL: u64 = 64 * 1024;
        let mut list = Freelist::new(TOTAL);
        let mut live: Vec<(u64, u64)> = Vec::new();
        let mut seed = 0x2545_f491_4f6c_dd1du64;

        for _ in 0..4000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;

            if seed % 3 == 0 && !live.is_empty() {
                let (offset, size) = live.swap_remove((seed as usize / 3) % live.len());
                list.free(offset, size).unwrap();
            } else {
                let size = 16 + (seed % 2048);
                if let Ok(offset) = list.allocate(size) {
                    live.push((offset, size));
                }
            }

            let allocated: u64 = live.iter().map(|(_, s)| s).sum();
            assert!(allocated <= TOTAL);
            assert_eq!(allocated + list.free_space(), TOTAL);
        }

        live.sort_unstable();
        for pair in live.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }
    }
}
