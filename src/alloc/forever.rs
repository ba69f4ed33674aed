//! A lock-free bump allocator for small things that live forever.
//!
//! Pages come straight from `mmap()` and are never given back. The only shared
//! state is the cursor: `0` when a fresh page is needed, otherwise the address
//! where the next allocation may start. Since the page is page aligned, the
//! cursor also tells us where the page ends.

use std::{
    fmt,
    mem::{align_of, size_of},
    ptr::NonNull,
};

use log::{debug, trace};

use crate::{
    loom::sync::atomic::{AtomicUsize, Ordering},
    os::mem::{map_anonymous, or_die, page_size, unmap, MmapError},
    util::num::{align_down, align_up, is_aligned},
};

pub struct ForeverAllocator {
    curr: AtomicUsize,
    pages: AtomicUsize,
}

impl ForeverAllocator {
    pub fn new() -> Self {
        Self {
            curr: AtomicUsize::new(0),
            pages: AtomicUsize::new(0),
        }
    }

    /// Allocate `size` bytes aligned to `align`. The range is inside a single
    /// page and never overlaps anything else this allocator handed out.
    ///
    /// # Panics
    ///
    /// - If `size` is `0` or not smaller than a page
    /// - If `align` is not a power of two, or is larger than a page
    /// - If the OS refuses to give us another page
    pub fn allocate(&self, size: usize, align: usize) -> NonNull<u8> {
        or_die(self.try_allocate(size, align))
    }

    /// Like [`allocate()`](Self::allocate), but running out of memory is
    /// reported instead of fatal. A failed call leaves the allocator as it
    /// was.
    pub fn try_allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, MmapError> {
        assert!(size > 0, "ForeverAllocator: zero sized allocation");
        assert!(
            size < page_size(),
            "ForeverAllocator: {size} bytes don't fit in a page"
        );
        assert!(
            align.is_power_of_two() && align <= page_size(),
            "ForeverAllocator: bad alignment {align}"
        );
        self.allocate_impl(size, align)
    }

    /// Allocate uninitialised storage for one `T`.
    pub fn allocate_type<T>(&self) -> NonNull<T> {
        self.allocate(size_of::<T>().max(1), align_of::<T>()).cast()
    }

    /// The number of pages this allocator has mapped so far.
    pub fn mapped_pages(&self) -> usize {
        self.pages.load(Ordering::Relaxed)
    }

    /// Map a page and try to make it the cursor. If another thread got there
    /// first, their cursor wins and our page goes back to the OS.
    fn allocate_page(&self) -> Result<usize, MmapError> {
        let ptr = map_anonymous(page_size())?;
        let page = ptr.as_ptr() as usize;
        debug_assert!(is_aligned(page, page_size()));

        match self
            .curr
            .compare_exchange(0, page, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let pages = self.pages.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("ForeverAllocator: mapped page {page:#x} ({pages} total)");
                Ok(page)
            }
            Err(curr) => {
                trace!("ForeverAllocator: lost page race, dropping {page:#x}");
                // SAFETY: the page is fresh and nobody else has seen it
                unsafe { unmap(ptr, page_size())? };
                Ok(curr)
            }
        }
    }

    fn allocate_impl(&self, size: usize, align: usize) -> Result<NonNull<u8>, MmapError> {
        let page_size = page_size();
        let mut curr = self.curr.load(Ordering::Acquire);
        loop {
            if curr == 0 {
                curr = self.allocate_page()?;
            }

            let res = align_up(curr, align);
            let next = res + size;
            let end = align_down(curr, page_size) + page_size;

            if end < next {
                // Doesn't fit: retire the page, unless somebody beat us to
                // moving the cursor.
                curr = match self.curr.compare_exchange_weak(
                    curr,
                    0,
                    Ordering::Acquire,
                    Ordering::Acquire,
                ) {
                    Ok(_) => 0,
                    Err(actual) => actual,
                };
                continue;
            }

            // Exactly used up the page, next allocation maps a new one.
            let next = if end == next { 0 } else { next };
            match self
                .curr
                .compare_exchange_weak(curr, next, Ordering::Acquire, Ordering::Acquire)
            {
                // SAFETY: `res >= curr > 0`
                Ok(_) => return Ok(unsafe { NonNull::new_unchecked(res as *mut u8) }),
                Err(actual) => curr = actual,
            }
        }
    }
}

impl Default for ForeverAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ForeverAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeverAllocator")
            .field("curr", &format_args!("{:#x}", self.curr.load(Ordering::Relaxed)))
            .field("pages", &self.mapped_pages())
            .finish()
    }
}
