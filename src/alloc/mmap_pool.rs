//! A bounded cache of whole mappings, for runtime structures that are too big
//! for the forever allocator but are created and thrown away often.

use std::ptr::{self, NonNull};

use log::debug;

use crate::{
    loom::sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
    os::mem::{map_anonymous, or_die, page_size, unmap},
    stack_node,
    sync::lock_free_stack::{Link, LockFreeStack},
};

/// A cached block. Blocks themselves can't be nodes: a thread may unmap a
/// block while another still reads its link inside `pop()`. So nodes live in
/// a permanent array and carry the block around.
struct MmapPoolNode {
    next: Link<MmapPoolNode>,
    block: AtomicPtr<u8>,
}

stack_node!(MmapPoolNode, next);

/// Caches up to `SIZE_LIMIT / BLOCK_SIZE` freed blocks of `BLOCK_SIZE` bytes.
/// Thread-safe and lock-free.
pub struct MmapPool<const BLOCK_SIZE: usize, const SIZE_LIMIT: usize> {
    with_blocks: LockFreeStack<MmapPoolNode>,
    without_blocks: LockFreeStack<MmapPoolNode>,
    cached: AtomicUsize,
    // Both stacks point into this, so it must outlive them. It is never
    // resized.
    _nodes: Box<[MmapPoolNode]>,
}

impl<const BLOCK_SIZE: usize, const SIZE_LIMIT: usize> MmapPool<BLOCK_SIZE, SIZE_LIMIT> {
    pub fn new() -> Self {
        assert!(
            BLOCK_SIZE > 0 && BLOCK_SIZE % page_size() == 0,
            "MmapPool: block size {BLOCK_SIZE} is not whole pages"
        );
        assert!(
            BLOCK_SIZE <= SIZE_LIMIT && SIZE_LIMIT % BLOCK_SIZE == 0,
            "MmapPool: size limit {SIZE_LIMIT} is not whole blocks"
        );

        let nodes: Box<[MmapPoolNode]> = (0..SIZE_LIMIT / BLOCK_SIZE)
            .map(|_| MmapPoolNode {
                next: Link::new(ptr::null_mut()),
                block: AtomicPtr::new(ptr::null_mut()),
            })
            .collect();
        let without_blocks = LockFreeStack::new();
        for node in nodes.iter() {
            // SAFETY: the nodes are boxed, so they stay put for as long as the
            // pool lives, and only ever move between the two stacks
            unsafe { without_blocks.push(NonNull::from(node)) };
        }
        Self {
            with_blocks: LockFreeStack::new(),
            without_blocks,
            cached: AtomicUsize::new(0),
            _nodes: nodes,
        }
    }

    /// A `BLOCK_SIZE` read/write mapping, cached or fresh. Fresh ones are
    /// zeroed; cached ones hold whatever was left in them.
    pub fn alloc(&self) -> NonNull<u8> {
        let Some(node) = self.with_blocks.pop() else {
            return or_die(map_anonymous(BLOCK_SIZE));
        };
        // SAFETY: popped nodes are ours until pushed again
        let node_ref = unsafe { node.as_ref() };
        // Take the block before letting the node go, it may be reused at once
        let block = node_ref.block.swap(ptr::null_mut(), Ordering::Relaxed);
        self.cached.fetch_sub(1, Ordering::Relaxed);
        // SAFETY: see `new()`
        unsafe { self.without_blocks.push(node) };
        NonNull::new(block).expect("cached MmapPool nodes always carry a block")
    }

    /// Give `block` back. It is cached if there is room, unmapped otherwise.
    ///
    /// # Safety
    ///
    /// `block` must come from `alloc()` on this pool, and must not be used
    /// afterwards.
    pub unsafe fn free(&self, block: NonNull<u8>) {
        let Some(node) = self.without_blocks.pop() else {
            debug!("MmapPool: full, unmapping {block:p}");
            return or_die(unmap(block, BLOCK_SIZE));
        };
        node.as_ref().block.store(block.as_ptr(), Ordering::Relaxed);
        self.cached.fetch_add(1, Ordering::Relaxed);
        self.with_blocks.push(node);
    }

    /// Bytes currently held in the cache, at most `SIZE_LIMIT`.
    pub fn cached_bytes(&self) -> usize {
        self.cached.load(Ordering::Relaxed) * BLOCK_SIZE
    }
}

impl<const BLOCK_SIZE: usize, const SIZE_LIMIT: usize> Default for MmapPool<BLOCK_SIZE, SIZE_LIMIT> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const BLOCK_SIZE: usize, const SIZE_LIMIT: usize> Drop for MmapPool<BLOCK_SIZE, SIZE_LIMIT> {
    fn drop(&mut self) {
        while let Some(node) = self.with_blocks.pop() {
            // SAFETY: `&mut self`, so nobody else is using the pool
            let block = unsafe { node.as_ref() }.block.load(Ordering::Relaxed);
            if let Some(block) = NonNull::new(block) {
                // SAFETY: cached blocks belong to the pool alone
                or_die(unsafe { unmap(block, BLOCK_SIZE) });
            }
        }
    }
}
