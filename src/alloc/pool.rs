//! Per-type object pools on top of [`ForeverAllocator`].
//!
//! Freed objects go onto a [`LockFreeStack`] and are handed out again by the
//! next `alloc()`. Only when the free list is empty does the pool bump-allocate
//! fresh storage, so a pool in steady state never calls into the OS.

use std::{
    any::type_name,
    fmt,
    mem::{align_of, size_of, ManuallyDrop, MaybeUninit},
    ops::{Deref, DerefMut},
    ptr::{self, NonNull},
    sync::Arc,
};

use log::trace;

use crate::sync::lock_free_stack::{Link, LockFreeStack, StackNode};

use super::forever::ForeverAllocator;

/// Storage for one pooled object. While on the free list it is a link, while
/// handed out it is a `T`; never both at once.
#[repr(C)]
union PoolNode<T> {
    next: ManuallyDrop<Link<PoolNode<T>>>,
    #[allow(dead_code)]
    value: ManuallyDrop<MaybeUninit<T>>,
}

// SAFETY: `next` is a `Link<Self>` (`ManuallyDrop` is transparent), and it is
// only used as a link while the node is on the free list.
unsafe impl<T> StackNode for PoolNode<T> {
    unsafe fn link(node: *mut Self) -> *const Link<Self> {
        ptr::addr_of!((*node).next) as *const Link<Self>
    }
}

pub struct ForeverPool<T> {
    allocator: Arc<ForeverAllocator>,
    free_list: LockFreeStack<PoolNode<T>>,
}

impl<T> ForeverPool<T> {
    pub fn new(allocator: Arc<ForeverAllocator>) -> Self {
        Self {
            allocator,
            free_list: LockFreeStack::new(),
        }
    }

    pub fn allocator(&self) -> &Arc<ForeverAllocator> {
        &self.allocator
    }

    /// Get uninitialised storage for one `T`, recycled if possible.
    ///
    /// # Panics
    ///
    /// - If a `T` (or a link, whichever is bigger) does not fit in a page
    /// - If a fresh page is needed and the OS refuses it
    pub fn alloc(&self) -> NonNull<T> {
        if let Some(node) = self.free_list.pop() {
            return node.cast();
        }
        trace!("ForeverPool<{}>: free list empty", type_name::<T>());
        self.allocator
            .allocate(size_of::<PoolNode<T>>(), align_of::<PoolNode<T>>())
            .cast()
    }

    /// Return `p` to the pool. The value in it is not dropped.
    ///
    /// # Safety
    ///
    /// - `p` must come from `alloc()` on this pool
    /// - The caller must not touch `p` again until a later `alloc()` returns
    ///   it
    pub unsafe fn free(&self, p: NonNull<T>) {
        // From here on the storage is a link, not a `T`. `push()` stores the
        // link atomically, a stale `pop()` may still be reading it.
        self.free_list.push(p.cast::<PoolNode<T>>());
    }

    /// Move `value` into pooled storage.
    pub fn insert(&self, value: T) -> PoolBox<'_, T> {
        let ptr = self.alloc();
        // SAFETY: fresh storage from `alloc()`, sized and aligned for `T`
        unsafe { ptr.as_ptr().write(value) };
        PoolBox { ptr, pool: self }
    }
}

impl<T> fmt::Debug for ForeverPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeverPool")
            .field("type", &type_name::<T>())
            .field("free_list", &self.free_list)
            .finish()
    }
}

/// An owned `T` living in a [`ForeverPool`]. Dropping it drops the value and
/// recycles the storage, so the storage is never read as a `T` after it has
/// been freed.
pub struct PoolBox<'p, T> {
    ptr: NonNull<T>,
    pool: &'p ForeverPool<T>,
}

// SAFETY: `PoolBox` owns its `T` just like a `Box` does
unsafe impl<T: Send> Send for PoolBox<'_, T> {}
unsafe impl<T: Sync> Sync for PoolBox<'_, T> {}

impl<T> PoolBox<'_, T> {
    pub fn as_ptr(this: &Self) -> *mut T {
        this.ptr.as_ptr()
    }

    /// Move the value back out, recycling the storage.
    pub fn into_inner(this: Self) -> T {
        let this = ManuallyDrop::new(this);
        // SAFETY: the value is initialised and we are giving up the box, so
        // it is read exactly once
        unsafe {
            let value = this.ptr.as_ptr().read();
            this.pool.free(this.ptr);
            value
        }
    }
}

impl<T> Deref for PoolBox<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: initialised by `insert()` and uniquely owned by us
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for PoolBox<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as for `deref()`, and `&mut self` is unique
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for PoolBox<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the value is initialised and dropped exactly once, after
        // which the storage goes back to the pool it came from
        unsafe {
            ptr::drop_in_place(self.ptr.as_ptr());
            self.pool.free(self.ptr);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PoolBox<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Container-style allocation from a [`ForeverPool`]. Single objects are
/// recycled through the pool, arrays come straight from the
/// [`ForeverAllocator`] and are leaked when deallocated.
pub struct ForeverPoolAllocator<'p, T> {
    pool: &'p ForeverPool<T>,
}

impl<'p, T> ForeverPoolAllocator<'p, T> {
    pub fn new(pool: &'p ForeverPool<T>) -> Self {
        Self { pool }
    }

    /// Uninitialised storage for `n` values of `T`.
    ///
    /// # Panics
    ///
    /// - If `n == 0`, or `n` values of `T` do not fit in a page
    pub fn allocate(&self, n: usize) -> NonNull<T> {
        assert!(n > 0, "ForeverPoolAllocator: empty allocation");
        if n == 1 {
            return self.pool.alloc();
        }
        let size = size_of::<T>()
            .checked_mul(n)
            .expect("ForeverPoolAllocator: allocation size overflows");
        self.pool
            .allocator()
            .allocate(size.max(1), align_of::<T>())
            .cast()
    }

    /// # Safety
    ///
    /// `p` must come from `allocate(n)` on an allocator over the same pool,
    /// and must not be used afterwards.
    pub unsafe fn deallocate(&self, p: NonNull<T>, n: usize) {
        if n == 1 {
            self.pool.free(p);
        } else {
            trace!(
                "ForeverPoolAllocator<{}>: wasting {} bytes at {p:p}",
                type_name::<T>(),
                size_of::<T>() * n
            );
        }
    }
}

impl<T> Clone for ForeverPoolAllocator<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ForeverPoolAllocator<'_, T> {}

impl<T> PartialEq for ForeverPoolAllocator<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.pool, other.pool)
    }
}

impl<T> Eq for ForeverPoolAllocator<'_, T> {}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[repr(align(32))]
    struct Record {
        guest_pc: u64,
        host_code: usize,
        _pad: [u8; 40],
    }

    #[test]
    fn free_then_alloc_recycles() {
        crate::util::test_logger();
        let pool = ForeverPool::<Record>::new(Arc::new(ForeverAllocator::new()));
        let p = pool.alloc();
        assert_eq!(p.as_ptr() as usize % 32, 0);
        unsafe { pool.free(p) };
        assert_eq!(pool.alloc(), p);
    }

    #[test]
    fn freed_storage_is_relinked_whatever_it_held() {
        let pool = ForeverPool::<[u8; 24]>::new(Arc::new(ForeverAllocator::new()));
        let a = pool.alloc();
        let b = pool.alloc();
        unsafe {
            a.as_ptr().write([0xff; 24]);
            b.as_ptr().write([0xff; 24]);
            pool.free(a);
            pool.free(b);
        }
        assert_eq!(pool.alloc(), b);
        assert_eq!(pool.alloc(), a);
        // the free list ended at `a`, so the next one is fresh storage
        let c = pool.alloc();
        assert_ne!(c, a);
        assert_ne!(c, b);
    }

    #[test]
    fn steady_state_maps_no_pages() {
        let allocator = Arc::new(ForeverAllocator::new());
        let pool = ForeverPool::<u64>::new(allocator.clone());
        let first: Vec<_> = (0..64).map(|_| pool.alloc()).collect();
        let pages = allocator.mapped_pages();
        for _ in 0..100 {
            for &p in &first {
                unsafe { pool.free(p) };
            }
            let again: Vec<_> = (0..64).map(|_| pool.alloc()).collect();
            let mut sorted_first = first.clone();
            let mut sorted_again = again;
            sorted_first.sort();
            sorted_again.sort();
            assert_eq!(sorted_first, sorted_again);
        }
        assert_eq!(allocator.mapped_pages(), pages);
    }

    #[test]
    fn pool_box_drops_and_recycles() {
        struct Tracked<'a>(&'a Cell<usize>);
        impl Drop for Tracked<'_> {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let drops = Cell::new(0);
        let pool = ForeverPool::new(Arc::new(ForeverAllocator::new()));
        let boxed = pool.insert(Tracked(&drops));
        let addr = PoolBox::as_ptr(&boxed);
        drop(boxed);
        assert_eq!(drops.get(), 1);
        assert_eq!(pool.alloc().as_ptr(), addr);
    }

    #[test]
    fn pool_box_derefs() {
        let pool = ForeverPool::new(Arc::new(ForeverAllocator::new()));
        let mut record = pool.insert(Record {
            guest_pc: 0x1000,
            host_code: 0,
            _pad: [0; 40],
        });
        record.host_code = 0xdead;
        assert_eq!(record.guest_pc, 0x1000);
        let record = PoolBox::into_inner(record);
        assert_eq!(record.host_code, 0xdead);
    }

    #[test]
    fn pool_allocator_recycles_singles_only() {
        let pool = ForeverPool::<u32>::new(Arc::new(ForeverAllocator::new()));
        let alloc = ForeverPoolAllocator::new(&pool);
        assert!(alloc == alloc.clone());

        let one = alloc.allocate(1);
        unsafe { alloc.deallocate(one, 1) };
        assert_eq!(alloc.allocate(1), one);

        let many = alloc.allocate(16);
        assert_eq!(many.as_ptr() as usize % align_of::<u32>(), 0);
        unsafe {
            many.as_ptr().add(15).write(7);
            alloc.deallocate(many, 16);
        }
        assert_ne!(alloc.allocate(1), many);
    }
}
