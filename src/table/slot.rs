use std::{
    marker::PhantomData,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

/// A value that is stored in a [`TableOfTables`](super::TableOfTables) slot as
/// one machine word.
///
/// # Safety
///
/// - `Self` must be exactly pointer sized
/// - `from_word(into_word(x))` must give back `x`
pub unsafe trait TableValue: Copy {
    fn into_word(self) -> usize;

    fn from_word(word: usize) -> Self;
}

unsafe impl TableValue for usize {
    fn into_word(self) -> usize {
        self
    }

    fn from_word(word: usize) -> Self {
        word
    }
}

unsafe impl TableValue for isize {
    fn into_word(self) -> usize {
        self as usize
    }

    fn from_word(word: usize) -> Self {
        word as isize
    }
}

#[cfg(target_pointer_width = "64")]
unsafe impl TableValue for u64 {
    fn into_word(self) -> usize {
        self as usize
    }

    fn from_word(word: usize) -> Self {
        word as u64
    }
}

#[cfg(target_pointer_width = "32")]
unsafe impl TableValue for u32 {
    fn into_word(self) -> usize {
        self as usize
    }

    fn from_word(word: usize) -> Self {
        word as u32
    }
}

unsafe impl<T> TableValue for *const T {
    fn into_word(self) -> usize {
        self as usize
    }

    fn from_word(word: usize) -> Self {
        word as *const T
    }
}

unsafe impl<T> TableValue for *mut T {
    fn into_word(self) -> usize {
        self as usize
    }

    fn from_word(word: usize) -> Self {
        word as *mut T
    }
}

unsafe impl<T> TableValue for Option<NonNull<T>> {
    fn into_word(self) -> usize {
        self.map_or(0, |p| p.as_ptr() as usize)
    }

    fn from_word(word: usize) -> Self {
        NonNull::new(word as *mut T)
    }
}

/// One slot of a child table. Handed out by `put()` and `get_pointer()` so
/// callers can keep updating a slot without splitting the key again.
#[repr(transparent)]
pub struct TableSlot<T> {
    word: AtomicUsize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TableSlot<T>
where
    T: TableValue,
{
    pub fn load(&self) -> T {
        T::from_word(self.word.load(Ordering::Acquire))
    }

    pub fn store(&self, value: T) {
        self.word.store(value.into_word(), Ordering::Release)
    }

    pub fn swap(&self, value: T) -> T {
        T::from_word(self.word.swap(value.into_word(), Ordering::AcqRel))
    }

    pub fn compare_exchange(&self, current: T, new: T) -> Result<T, T> {
        self.word
            .compare_exchange(
                current.into_word(),
                new.into_word(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(T::from_word)
            .map_err(T::from_word)
    }

    /// The slot's address, for generated code that reads it directly.
    pub fn as_ptr(&self) -> *mut usize {
        self.word.as_ptr()
    }
}
