//! Bounded memory pool backing task allocation.
//!
//! The pool owns one contiguous arena carved into superblocks of
//! `1 << log2_superblock` bytes. Requests are rounded up to a power-of-two
//! size class; each class carves whole superblocks into equal blocks on
//! demand and recycles freed blocks through a per-class free list. The pool
//! never grows: once every superblock is claimed and every free list is
//! empty, `allocate` reports exhaustion by returning `None`.
//!
//! Blocks are naturally aligned to their class size (minimum
//! [`MIN_BLOCK_SIZE`]), which keeps every block address well clear of the
//! sentinel words the task records store in their list heads.

use anyhow::{Result, ensure};
use parking_lot::Mutex;
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Smallest block class handed out. Also the minimum block alignment.
pub const MIN_BLOCK_SIZE: usize = 64;

/// Default superblock exponent; superblocks of 4 KiB.
pub const DEFAULT_LOG2_SUPERBLOCK: u32 = 12;

pub struct MemoryPool {
    arena: NonNull<u8>,
    arena_layout: Layout,
    superblock: usize,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    /// Offset of the next unclaimed superblock.
    next_superblock: usize,
    classes: Vec<SizeClass>,
}

struct SizeClass {
    block: usize,
    /// Recycled block offsets.
    free: Vec<usize>,
    /// Superblock currently being carved for this class: (next offset, blocks left).
    carve: Option<(usize, usize)>,
}

impl MemoryPool {
    /// Creates a pool of at least `capacity_bytes`, rounded up to whole
    /// superblocks of `1 << log2_superblock` bytes.
    pub fn try_new(capacity_bytes: usize, log2_superblock: u32) -> Result<Self> {
        ensure!(capacity_bytes > 0, "memory pool capacity must be non-zero");
        ensure!(
            (1usize << log2_superblock) >= MIN_BLOCK_SIZE,
            "superblock of {} bytes is smaller than the minimum block of {} bytes",
            1usize << log2_superblock,
            MIN_BLOCK_SIZE
        );

        let superblock = 1usize << log2_superblock;
        let capacity = capacity_bytes.div_ceil(superblock) * superblock;

        // Align the arena to the superblock so blocks carved at class-size
        // strides are naturally aligned to their class.
        let arena_layout = Layout::from_size_align(capacity, superblock)?;
        let arena = NonNull::new(unsafe { alloc::alloc(arena_layout) })
            .ok_or_else(|| anyhow::anyhow!("failed to reserve {capacity} bytes for the pool"))?;

        let num_classes = (log2_superblock - MIN_BLOCK_SIZE.trailing_zeros() + 1) as usize;
        let classes = (0..num_classes)
            .map(|i| SizeClass {
                block: MIN_BLOCK_SIZE << i,
                free: Vec::new(),
                carve: None,
            })
            .collect();

        Ok(MemoryPool {
            arena,
            arena_layout,
            superblock,
            inner: Mutex::new(PoolInner {
                next_superblock: 0,
                classes,
            }),
        })
    }

    /// Total bytes owned by the pool.
    pub fn capacity(&self) -> usize {
        self.arena_layout.size()
    }

    /// The block-aligned size a request of `size` bytes actually occupies, or
    /// `None` when `size` exceeds a superblock and can never be satisfied.
    pub fn allocate_block_size(&self, size: usize) -> Option<usize> {
        let block = size.next_power_of_two().max(MIN_BLOCK_SIZE);
        (block <= self.superblock).then_some(block)
    }

    /// Allocates one block of the class covering `size` bytes. Returns `None`
    /// on exhaustion or when `size` exceeds a superblock; the caller surfaces
    /// that as a recoverable failure.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let block = self.allocate_block_size(size)?;
        let class_index = self.class_index(block);

        let mut inner = self.inner.lock();

        let offset = loop {
            let class = &mut inner.classes[class_index];
            if let Some(offset) = class.free.pop() {
                break offset;
            }
            if let Some((offset, left)) = class.carve {
                class.carve = (left > 1).then(|| (offset + block, left - 1));
                break offset;
            }
            // Claim a fresh superblock for this class.
            if inner.next_superblock + self.superblock > self.capacity() {
                return None;
            }
            let base = inner.next_superblock;
            inner.next_superblock += self.superblock;
            inner.classes[class_index].carve = Some((base, self.superblock / block));
        };

        // Safety: `offset` lies within the arena and is not handed out twice
        // until it is deallocated.
        Some(unsafe { NonNull::new_unchecked(self.arena.as_ptr().add(offset)) })
    }

    /// Returns a block previously obtained from [`allocate`](Self::allocate)
    /// with the same `size`.
    pub fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        let block = self
            .allocate_block_size(size)
            .expect("deallocate size exceeds a superblock");
        let class_index = self.class_index(block);
        let offset = (ptr.as_ptr() as usize) - (self.arena.as_ptr() as usize);
        debug_assert!(offset < self.capacity());
        debug_assert_eq!(offset % block, 0, "pointer not aligned to its class");

        self.inner.lock().classes[class_index].free.push(offset);
    }

    fn class_index(&self, block: usize) -> usize {
        (block.trailing_zeros() - MIN_BLOCK_SIZE.trailing_zeros()) as usize
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        // Safety: the arena was allocated with this exact layout and no block
        // handed out may outlive the pool by contract.
        unsafe { alloc::dealloc(self.arena.as_ptr(), self.arena_layout) };
    }
}

// Safety: the free lists are guarded by the mutex and the arena itself is
// only touched through blocks whose ownership `allocate`/`deallocate` hand
// back and forth.
unsafe impl Send for MemoryPool {}
unsafe impl Sync for MemoryPool {}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn rounds_capacity_to_whole_superblocks() {
        let pool = MemoryPool::try_new(100, DEFAULT_LOG2_SUPERBLOCK).unwrap();
        assert_eq!(pool.capacity(), 4096);
    }

    #[rstest]
    #[case(1, 64)]
    #[case(64, 64)]
    #[case(65, 128)]
    #[case(200, 256)]
    #[case(4096, 4096)]
    fn block_size_rounds_to_power_of_two_class(#[case] size: usize, #[case] expected: usize) {
        let pool = MemoryPool::try_new(8192, DEFAULT_LOG2_SUPERBLOCK).unwrap();
        assert_eq!(pool.allocate_block_size(size), Some(expected));
    }

    #[test]
    fn oversized_request_is_rejected() {
        let pool = MemoryPool::try_new(8192, DEFAULT_LOG2_SUPERBLOCK).unwrap();
        assert_eq!(pool.allocate_block_size(4097), None);
        assert!(pool.allocate(4097).is_none());
    }

    #[test]
    fn exhausts_then_recycles() {
        // One superblock of 4 KiB carved into 64 blocks of 64 bytes.
        let pool = MemoryPool::try_new(4096, DEFAULT_LOG2_SUPERBLOCK).unwrap();
        let blocks: Vec<_> = (0..64).map(|_| pool.allocate(64).unwrap()).collect();
        assert!(pool.allocate(64).is_none());

        pool.deallocate(blocks[17], 64);
        let again = pool.allocate(64).unwrap();
        assert_eq!(again, blocks[17]);
    }

    #[test]
    fn classes_share_the_arena() {
        // 2 superblocks: one ends up carved for 64-byte blocks, the other for
        // 1024-byte blocks.
        let pool = MemoryPool::try_new(8192, DEFAULT_LOG2_SUPERBLOCK).unwrap();
        let small = pool.allocate(64).unwrap();
        let large = pool.allocate(1024).unwrap();
        assert_ne!(small, large);
        assert!(pool.allocate(2048).is_none());
    }

    #[test]
    fn blocks_are_class_aligned() {
        let pool = MemoryPool::try_new(8192, DEFAULT_LOG2_SUPERBLOCK).unwrap();
        let ptr = pool.allocate(256).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 256, 0);
    }

    #[test]
    fn zero_capacity_is_an_error() {
        assert!(MemoryPool::try_new(0, DEFAULT_LOG2_SUPERBLOCK).is_err());
    }
}
