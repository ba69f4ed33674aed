//! Anonymous memory files, used to get many virtual pages that read as the
//! same pre-filled content without touching each of them.

use std::{
    ffi::CStr,
    fs::File,
    io::{self, Write},
    mem::{size_of, ManuallyDrop},
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
    slice,
};

use libc::{memfd_create, MFD_CLOEXEC};
use log::debug;

use crate::util::{hint::cold, num::is_aligned};

use super::mem::{map_fixed_from_fd, page_size, MmapError, MmapRegion, Protection};

/// Create an unlinked, anonymous file. `MFD_CLOEXEC` keeps it from leaking
/// into children.
pub fn create_memfd(name: &CStr) -> Result<OwnedFd, MmapError> {
    // SAFETY: `name` is a valid C string for the duration of the call
    let fd = unsafe { memfd_create(name.as_ptr(), MFD_CLOEXEC) };
    if fd < 0 {
        return cold(|| {
            Err(MmapError::Memfd {
                name: name.to_string_lossy().into_owned(),
                source: io::Error::last_os_error(),
            })
        });
    }
    // SAFETY: `memfd_create()` just handed us this descriptor, nobody else
    // owns it
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Write all of `buf` to `fd`, retrying on short writes and `EINTR`.
pub fn write_all(fd: BorrowedFd<'_>, buf: &[u8]) -> Result<(), MmapError> {
    // SAFETY: the `File` is never dropped, so it only borrows `fd` and never
    // closes it
    let file = ManuallyDrop::new(unsafe { File::from_raw_fd(fd.as_raw_fd()) });
    (&*file).write_all(buf).map_err(|source| MmapError::Write {
        fd: fd.as_raw_fd(),
        size: buf.len(),
        source,
    })
}

/// Create a memfd of `size` bytes whose content is `value` repeated.
///
/// The content is built in a scratch mapping first so the fill loop stays
/// tight and the file is written with a single `write_all()`.
pub fn create_and_fill_memfd(name: &CStr, size: usize, value: usize) -> Result<OwnedFd, MmapError> {
    assert_eq!(size % size_of::<usize>(), 0, "memfd size must hold whole words");
    assert!(is_aligned(size, page_size()), "memfd size must be page aligned");

    let scratch = MmapRegion::map(size)?;
    // SAFETY: the region is ours, page aligned (so word aligned) and `size`
    // bytes long
    let words = unsafe {
        slice::from_raw_parts_mut(scratch.as_ptr() as *mut usize, size / size_of::<usize>())
    };
    words.fill(value);

    let memfd = create_memfd(name)?;
    // SAFETY: as above, viewed as bytes
    let bytes = unsafe { slice::from_raw_parts(scratch.as_ptr(), size) };
    write_all(memfd.as_fd(), bytes)?;
    debug!("created memfd {name:?} ({size} bytes of {value:#x})");
    Ok(memfd)
}

/// Reserve `map_size` bytes and cover them, `region_size` bytes at a time,
/// with private copy-on-write mappings of `memfd`. Every page of the result
/// starts out reading as the memfd's content.
///
/// `memfd` must be at least `region_size` bytes long.
pub fn create_memfd_backed_map(
    memfd: BorrowedFd<'_>,
    map_size: usize,
    region_size: usize,
) -> Result<MmapRegion, MmapError> {
    assert_eq!(map_size % region_size, 0, "map must be whole memfd regions");
    assert!(is_aligned(region_size, page_size()), "memfd region must be page aligned");

    // No RAM is committed to the reservation, it only holds the address range
    // until the memfd maps replace it.
    let region = MmapRegion::map_noreserve(map_size)?;
    for i in 0..map_size / region_size {
        // SAFETY:
        // - the reservation is ours and nothing references it yet
        // - `i * region_size < map_size` so the address stays in bounds
        unsafe {
            let addr = region.as_non_null().add(i * region_size);
            map_fixed_from_fd(addr, region_size, memfd, Protection::ReadWrite)?;
        }
    }
    Ok(region)
}
