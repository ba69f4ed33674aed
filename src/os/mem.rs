use std::{
    io,
    os::fd::{AsRawFd, BorrowedFd},
    ptr::{self, NonNull},
};

use libc::{
    c_int, mmap, mprotect, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_FIXED, MAP_NORESERVE,
    MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE,
};
use log::warn;
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::util::{hint::cold, num::is_aligned};

static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

/// The host page size, queried once.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Whether the page holding `addr` is mapped at all.
#[cfg(test)]
pub(crate) fn is_mapped(addr: *const u8) -> bool {
    let page = crate::util::num::align_down(addr as usize, page_size());
    let mut residency = 0u8;
    // SAFETY: `mincore()` only inspects the range, and one page needs one
    // byte of `residency`
    let ret = unsafe { libc::mincore(page as *mut libc::c_void, page_size(), &mut residency) };
    if ret == 0 {
        return true;
    }
    assert_eq!(io::Error::last_os_error().raw_os_error(), Some(libc::ENOMEM));
    false
}

#[derive(Debug, Error)]
pub enum MmapError {
    #[error("could not mmap() {size} bytes: {source}")]
    Map { size: usize, source: io::Error },
    #[error("could not mmap() {size} bytes of fd {fd} at {addr:#x}: {source}")]
    MapFixed {
        addr: usize,
        size: usize,
        fd: c_int,
        source: io::Error,
    },
    #[error("could not munmap() {size} bytes at {addr:#x}: {source}")]
    Unmap {
        addr: usize,
        size: usize,
        source: io::Error,
    },
    #[error("could not mprotect() {size} bytes at {addr:#x} to {prot:?}: {source}")]
    Protect {
        addr: usize,
        size: usize,
        prot: Protection,
        source: io::Error,
    },
    #[error("could not create memfd {name:?}: {source}")]
    Memfd { name: String, source: io::Error },
    #[error("could not write {size} bytes to fd {fd}: {source}")]
    Write {
        fd: c_int,
        size: usize,
        source: io::Error,
    },
}

/// Access rights of a mapping
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protection {
    None,
    Read,
    ReadWrite,
}

impl Protection {
    fn bits(self) -> c_int {
        match self {
            Protection::None => PROT_NONE,
            Protection::Read => PROT_READ,
            Protection::ReadWrite => PROT_READ | PROT_WRITE,
        }
    }
}

/// Unwrap the result of an OS memory operation, panicking with the error if
/// there is one. There is nothing a translator can do without memory.
pub fn or_die<T>(result: Result<T, MmapError>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => cold(move || -> T { panic!("{err}") }),
    }
}

fn map_impl(size: usize, flags: c_int) -> Result<NonNull<u8>, MmapError> {
    if size == 0 {
        panic!("Attmempted to mmap() 0 bytes")
    }
    // SAFETY: we are not asking for a fixed address, so this can't clobber an
    // existing mapping.
    let ptr = unsafe {
        mmap(
            ptr::null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            flags | MAP_ANONYMOUS | MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == MAP_FAILED {
        return cold(|| {
            Err(MmapError::Map {
                size,
                source: io::Error::last_os_error(),
            })
        });
    }
    Ok(NonNull::new(ptr as *mut u8).expect("mmap() never hands out the null page"))
}

/// `mmap()` `size` bytes of fresh, zero-filled, read/write memory somewhere.
pub fn map_anonymous(size: usize) -> Result<NonNull<u8>, MmapError> {
    map_impl(size, 0)
}

/// Like [`map_anonymous()`], but the kernel does not commit any RAM or swap to
/// the range up front. Used for address space that is about to be covered by
/// other mappings.
pub fn map_noreserve(size: usize) -> Result<NonNull<u8>, MmapError> {
    map_impl(size, MAP_NORESERVE)
}

/// Map `size` bytes of `fd` (from offset 0) at exactly `addr`, replacing
/// whatever was mapped there. The mapping is private, so writes through it
/// never reach the file.
///
/// # Safety
///
/// - `addr..addr + size` must not be in use by anybody else: whatever lived
///   there is silently discarded.
pub unsafe fn map_fixed_from_fd(
    addr: NonNull<u8>,
    size: usize,
    fd: BorrowedFd<'_>,
    prot: Protection,
) -> Result<NonNull<u8>, MmapError> {
    debug_assert!(is_aligned(addr.as_ptr() as usize, page_size()));
    // SAFETY: caller guarantees that `addr..addr + size` is ours to replace
    let ptr = unsafe {
        mmap(
            addr.as_ptr() as _,
            size,
            prot.bits(),
            MAP_PRIVATE | MAP_FIXED,
            fd.as_raw_fd(),
            0,
        )
    };
    if ptr == MAP_FAILED {
        return cold(|| {
            Err(MmapError::MapFixed {
                addr: addr.as_ptr() as usize,
                size,
                fd: fd.as_raw_fd(),
                source: io::Error::last_os_error(),
            })
        });
    }
    debug_assert_eq!(ptr as *mut u8, addr.as_ptr());
    Ok(addr)
}

/// # Safety
///
/// - `ptr..ptr + size` must be a range we mapped, with nothing still
///   referencing it.
pub unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), MmapError> {
    if munmap(ptr.as_ptr() as _, size) != 0 {
        return cold(|| {
            Err(MmapError::Unmap {
                addr: ptr.as_ptr() as usize,
                size,
                source: io::Error::last_os_error(),
            })
        });
    }
    Ok(())
}

/// # Safety
///
/// - `ptr..ptr + size` must be a range we mapped, and no live reference into
///   it may be used in a way the new protection forbids.
pub unsafe fn protect(ptr: NonNull<u8>, size: usize, prot: Protection) -> Result<(), MmapError> {
    if mprotect(ptr.as_ptr() as _, size, prot.bits()) != 0 {
        return cold(|| {
            Err(MmapError::Protect {
                addr: ptr.as_ptr() as usize,
                size,
                prot,
                source: io::Error::last_os_error(),
            })
        });
    }
    Ok(())
}

/// An owned, page-aligned mapping that is unmapped on `Drop`.
#[derive(Debug)]
pub struct MmapRegion {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: a region is plain memory, nothing about it is tied to a thread
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// `mmap()` a read/write, page-aligned region of `size` bytes.
    pub fn map(size: usize) -> Result<MmapRegion, MmapError> {
        let ptr = map_anonymous(size)?;
        Ok(MmapRegion { ptr, size })
    }

    /// `mmap()` a read/write region of `size` bytes without reserving any
    /// backing store for it.
    pub fn map_noreserve(size: usize) -> Result<MmapRegion, MmapError> {
        let ptr = map_noreserve(size)?;
        Ok(MmapRegion { ptr, size })
    }

    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub const fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    pub const fn len(&self) -> usize {
        self.size
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Change the protection of the whole region.
    ///
    /// # Safety
    ///
    /// Same as [`protect()`].
    pub unsafe fn protect(&self, prot: Protection) -> Result<(), MmapError> {
        protect(self.ptr, self.size, prot)
    }

    /// Give up ownership without unmapping. The caller becomes responsible
    /// for eventually calling [`unmap()`] with the returned size.
    pub fn into_raw(self) -> (NonNull<u8>, usize) {
        let raw = (self.ptr, self.size);
        std::mem::forget(self);
        raw
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY:
        // - The address must be a multiple of the page size (but length need
        //   not be). This is guaranteed because we only construct regions from
        //   fresh `mmap()`s
        // - We own the whole range, and any borrow of it borrows `self`
        if let Err(err) = unsafe { unmap(self.ptr, self.size) } {
            warn!("leaking region: {err}");
        }
    }
}
