//! Memory substrate for a binary translator runtime: a lock-free intrusive
//! stack, a never-freeing bump allocator, typed object pools built from the
//! two, and a sparse per-guest-address table that resolves unwritten regions
//! to one shared, pre-filled page.

#[cfg(not(target_os = "linux"))]
compile_error!("xlatmem needs Linux (memfd_create, MAP_NORESERVE)");

pub mod alloc;
mod loom;
pub mod os;
pub mod sync;
pub mod table;
pub mod util;

pub use alloc::{
    forever::ForeverAllocator,
    mmap_pool::MmapPool,
    pool::{ForeverPool, ForeverPoolAllocator, PoolBox},
};
pub use os::mem::MmapError;
pub use sync::{
    lock_free_stack::{Link, LockFreeStack, StackNode},
    pointer_and_counter::PointerAndCounter,
};
pub use table::{TableKey, TableOfTables, TableSlot, TableValue};
