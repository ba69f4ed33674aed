//! A two-level sparse table over a whole guest address space.
//!
//! Every main table entry starts out pointing at one shared, read-only child
//! table filled with the default value, so `get()` on a region nobody wrote to
//! is a plain indexed read with no "is it there" branch. The first write into a
//! region maps a real child table, already filled with the default value by
//! copy-on-write from the same memfd, and publishes it in the main table.
//!
//! ```text
//!   key = [ high | low ]
//!   main_table[high] ---> default child (read only, shared) or a real child
//!   child[low]       ---> value
//! ```

use std::{
    fmt,
    marker::PhantomData,
    mem::size_of,
    os::fd::{AsFd, OwnedFd},
    ptr::NonNull,
    sync::atomic::{fence, AtomicPtr, Ordering},
};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::os::{
    mem::{or_die, unmap, MmapError, MmapRegion, Protection},
    memfd::{create_and_fill_memfd, create_memfd_backed_map},
};

use super::{
    key::{SplitKey, TableKey},
    slot::{TableSlot, TableValue},
};

pub struct TableOfTables<K, T> {
    main_table: MmapRegion,
    default_table: MmapRegion,
    /// Guards the default child -> real child transition. Also holds the
    /// memfd real children are mapped from.
    default_memfd: Mutex<Option<OwnedFd>>,
    default_value: T,
    _key: PhantomData<fn(K)>,
}

// SAFETY: all shared state is either atomic, behind the mutex, or immutable
// after construction. `T` is only ever stored as a plain word.
unsafe impl<K, T: TableValue> Send for TableOfTables<K, T> {}
unsafe impl<K, T: TableValue> Sync for TableOfTables<K, T> {}

impl<K, T> TableOfTables<K, T>
where
    K: TableKey,
    T: TableValue,
{
    const TABLE_SIZE: usize = 1 << K::TABLE_BITS;
    const CHILD_TABLE_BYTES: usize = Self::TABLE_SIZE * size_of::<TableSlot<T>>();
    const MAIN_TABLE_BYTES: usize = Self::TABLE_SIZE * size_of::<AtomicPtr<TableSlot<T>>>();

    /// # Panics
    ///
    /// - If the OS refuses the mappings or memfds
    pub fn new(default_value: T) -> Self {
        or_die(Self::try_new(default_value))
    }

    pub fn try_new(default_value: T) -> Result<Self, MmapError> {
        const {
            assert!(
                size_of::<T>() == size_of::<usize>(),
                "TableOfTables values must be pointer sized"
            )
        };

        let default_memfd =
            create_and_fill_memfd(c"child", K::MEMFD_REGION_SIZE, default_value.into_word())?;
        let default_table = create_memfd_backed_map(
            default_memfd.as_fd(),
            Self::CHILD_TABLE_BYTES,
            K::MEMFD_REGION_SIZE,
        )?;

        let main_memfd = create_and_fill_memfd(
            c"main",
            K::MEMFD_REGION_SIZE,
            default_table.as_ptr() as usize,
        )?;
        let main_table = create_memfd_backed_map(
            main_memfd.as_fd(),
            Self::MAIN_TABLE_BYTES,
            K::MEMFD_REGION_SIZE,
        )?;
        drop(main_memfd);

        // Writing to the default child would corrupt every unpopulated region
        // at once, make sure that faults instead.
        // SAFETY: nothing has seen the default table yet
        unsafe { default_table.protect(Protection::Read)? };

        debug!(
            "TableOfTables: {} x {} slots, default child at {:p}",
            Self::TABLE_SIZE,
            Self::TABLE_SIZE,
            default_table.as_ptr()
        );
        Ok(Self {
            main_table,
            default_table,
            default_memfd: Mutex::new(Some(default_memfd)),
            default_value,
            _key: PhantomData,
        })
    }

    pub fn default_value(&self) -> T {
        self.default_value
    }

    /// The value at `key`, or the default value if nothing was put there.
    /// Never blocks.
    ///
    /// # Panics
    ///
    /// - If `key` has bits above the table split
    pub fn get(&self, key: K) -> T {
        let split = SplitKey::new(key);
        let child = self.main_entry(split.high).load(Ordering::Acquire);
        // SAFETY: every child, default or real, holds `TABLE_SIZE` slots and
        // lives as long as `self`
        unsafe { (*child.add(split.low)).load() }
    }

    /// Store `value` at `key`, mapping a child table for it if needed, and
    /// return the slot for later updates.
    pub fn put(&self, key: K, value: T) -> &TableSlot<T> {
        let slot = self.get_pointer(key);
        slot.store(value);
        slot
    }

    /// The slot for `key`, mapping a child table for it if needed. Slower than
    /// [`get()`](Self::get) since it may take the lock and map memory.
    pub fn get_pointer(&self, key: K) -> &TableSlot<T> {
        let split = SplitKey::new(key);
        let child = self.allocate_if_necessary(split.high);
        // SAFETY: as in `get()`, and `child` is a real, writable child
        unsafe { &*child.add(split.low) }
    }

    /// Whether `key`'s region has its own child table yet.
    pub fn is_populated(&self, key: K) -> bool {
        let split = SplitKey::new(key);
        self.main_entry(split.high).load(Ordering::Acquire) != self.default_child()
    }

    /// The main table, for generated code that looks keys up itself:
    /// `TABLE_SIZE` entries, each pointing at `TABLE_SIZE` slots.
    pub fn main_table(&self) -> *const AtomicPtr<TableSlot<T>> {
        self.main_table.as_ptr() as *const AtomicPtr<TableSlot<T>>
    }

    /// Close the memfd real children are mapped from. If another child is
    /// needed later it is created again.
    pub fn close_default_memfd(&self) {
        if self.default_memfd.lock().take().is_some() {
            debug!("TableOfTables: closed default memfd");
        }
    }

    fn main_entry(&self, high: usize) -> &AtomicPtr<TableSlot<T>> {
        debug_assert!(high < Self::TABLE_SIZE);
        // SAFETY: the main table holds `TABLE_SIZE` entries, and `high` is
        // below that because `SplitKey` checked it
        unsafe { &*self.main_table().add(high) }
    }

    fn default_child(&self) -> *mut TableSlot<T> {
        self.default_table.as_ptr() as *mut TableSlot<T>
    }

    fn allocate_if_necessary(&self, high: usize) -> *mut TableSlot<T> {
        let child = self.main_entry(high).load(Ordering::Acquire);
        // Fast path, no lock once the region is populated
        if child != self.default_child() {
            return child;
        }
        self.allocate_child(high)
    }

    #[cold]
    #[inline(never)]
    fn allocate_child(&self, high: usize) -> *mut TableSlot<T> {
        let entry = self.main_entry(high);
        let mut guard = self.default_memfd.lock();

        // Check again, another thread may have populated it while we waited
        let child = entry.load(Ordering::Acquire);
        if child != self.default_child() {
            return child;
        }

        let memfd: &OwnedFd = match &mut *guard {
            Some(memfd) => memfd,
            slot @ None => slot.insert(or_die(create_and_fill_memfd(
                c"child",
                K::MEMFD_REGION_SIZE,
                self.default_value.into_word(),
            ))),
        };
        let (child, _) = or_die(create_memfd_backed_map(
            memfd.as_fd(),
            Self::CHILD_TABLE_BYTES,
            K::MEMFD_REGION_SIZE,
        ))
        .into_raw();
        let child = child.as_ptr() as *mut TableSlot<T>;

        // The child must be fully initialised before anyone can see it
        fence(Ordering::Release);
        entry.store(child, Ordering::Relaxed);
        debug!("TableOfTables: populated region {high:#x} at {child:p}");
        child
    }
}

impl<K, T> Drop for TableOfTables<K, T> {
    fn drop(&mut self) {
        let table_size = self.main_table.len() / size_of::<AtomicPtr<()>>();
        let child_bytes = self.default_table.len();
        let main = self.main_table.as_ptr() as *const AtomicPtr<u8>;
        let default_child = self.default_table.as_ptr();

        let mut unmapped = 0usize;
        for high in 0..table_size {
            // SAFETY: `high < table_size`, and `&mut self` means no more
            // lookups are in flight
            let child = unsafe { &*main.add(high) }.load(Ordering::Relaxed);
            if child == default_child {
                continue;
            }
            let Some(child) = NonNull::new(child) else {
                continue;
            };
            // SAFETY: real children are only referenced from this table
            if let Err(err) = unsafe { unmap(child, child_bytes) } {
                warn!("TableOfTables: leaking child table: {err}");
            }
            unmapped += 1;
        }
        debug!("TableOfTables: dropped, unmapped {unmapped} child tables");
        // The main table, default child and memfd go with their own `Drop`s
    }
}

impl<K, T> fmt::Debug for TableOfTables<K, T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableOfTables")
            .field("default_value", &self.default_value)
            .field("main_table", &self.main_table.as_ptr())
            .field("default_table", &self.default_table.as_ptr())
            .finish()
    }
}
