//! An intrusive, multi-producer multi-consumer lock-free stack.
//!
//! The head is a [`PointerAndCounter`] word. Every push bumps the counter, so a
//! thread that read the head before the top node was popped and pushed back
//! fails its compare-and-swap instead of installing a stale `next`.
//!
//! There is no memory reclamation. `pop()` may read the link of a node that
//! another thread has just popped, so memory that has been pushed must never be
//! reused for anything other than eventually being pushed onto the same stack
//! again. The counter narrows the ABA window, it does not close it for memory
//! that is handed to somebody else.

use std::{fmt, ptr::NonNull};

use crate::loom::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use super::pointer_and_counter::PointerAndCounter;

/// The `next` field a node has to carry to live on a [`LockFreeStack`].
pub type Link<T> = AtomicPtr<T>;

/// A type that can be linked into a [`LockFreeStack`].
///
/// Use [`stack_node!`](crate::stack_node) to implement it for a struct with a
/// [`Link<Self>`] field.
///
/// # Safety
///
/// `link()` must return a pointer to a [`Link<Self>`] stored inside `*node`,
/// that is valid for as long as `*node` is, and that is not used for
/// anything else while the node is on a stack.
pub unsafe trait StackNode: Sized {
    /// Locate the link field of `node`, without creating a reference to the
    /// node itself.
    ///
    /// # Safety
    ///
    /// `node` must point into memory that is still mapped.
    unsafe fn link(node: *mut Self) -> *const Link<Self>;
}

/// Implement [`StackNode`] for `$ty` using its `$field: Link<$ty>` field.
#[macro_export]
macro_rules! stack_node {
    ($ty:ty, $field:ident) => {
        unsafe impl $crate::sync::lock_free_stack::StackNode for $ty {
            unsafe fn link(node: *mut Self) -> *const $crate::sync::lock_free_stack::Link<Self> {
                unsafe { ::std::ptr::addr_of!((*node).$field) }
            }
        }
    };
}

pub struct LockFreeStack<T> {
    head: AtomicU64,
    _marker: std::marker::PhantomData<*mut T>,
}

// SAFETY: the stack only moves pointers around, and all of its state is one
// atomic word. Ownership of the pointed-to nodes is transferred through push
// and pop, like a channel would.
unsafe impl<T: Send> Send for LockFreeStack<T> {}
unsafe impl<T: Send> Sync for LockFreeStack<T> {}

impl<T> LockFreeStack<T>
where
    T: StackNode,
{
    pub fn new() -> Self {
        Self {
            head: AtomicU64::new(PointerAndCounter::<T>::NULL.into_raw()),
            _marker: std::marker::PhantomData,
        }
    }

    /// Best effort: another thread may change the answer as soon as this
    /// returns.
    pub fn is_empty(&self) -> bool {
        self.peek().is_none()
    }

    /// Push an already linked chain `first -> ... -> last` with a single
    /// compare-and-swap. The chain keeps its order and sits on top of whatever
    /// was on the stack, so `first` is the next node popped.
    ///
    /// # Safety
    ///
    /// - Every node of the chain must be exclusively owned by the caller, and
    ///   following the links from `first` must reach `last`
    /// - The nodes' memory must stay mapped for as long as this stack exists,
    ///   and must never be used for anything other than eventually being
    ///   pushed onto this stack again
    pub unsafe fn push_range(&self, first: NonNull<T>, last: NonNull<T>) {
        let last_link = T::link(last.as_ptr());
        let mut cmp = PointerAndCounter::<T>::from_raw(self.head.load(Ordering::Relaxed));
        loop {
            let xch = PointerAndCounter::new_truncating(first.as_ptr(), cmp.counter() + 1);
            (*last_link).store(cmp.ptr(), Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                cmp.into_raw(),
                xch.into_raw(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cmp = PointerAndCounter::from_raw(actual),
            }
        }
    }

    /// Push a single node.
    ///
    /// # Safety
    ///
    /// Same as [`push_range()`](Self::push_range) with `first == last`.
    pub unsafe fn push(&self, node: NonNull<T>) {
        self.push_range(node, node)
    }

    /// Take the top node off the stack, handing its ownership to the caller.
    pub fn pop(&self) -> Option<NonNull<T>> {
        let mut cmp = PointerAndCounter::<T>::from_raw(self.head.load(Ordering::Acquire));
        loop {
            let curr = NonNull::new(cmp.ptr())?;
            // SAFETY: pushed memory is never unmapped while the stack lives
            // (push contract), so this read is of mapped memory even if
            // another thread popped `curr` in the meantime. In that case the
            // counter or pointer has moved on and the exchange below fails.
            let next = unsafe { (*T::link(curr.as_ptr())).load(Ordering::Relaxed) };
            let xch = PointerAndCounter::new_truncating(next, cmp.counter());
            match self.head.compare_exchange_weak(
                cmp.into_raw(),
                xch.into_raw(),
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(curr),
                Err(actual) => cmp = PointerAndCounter::from_raw(actual),
            }
        }
    }

    /// The node that `pop()` would return right now, without removing it.
    pub fn peek(&self) -> Option<NonNull<T>> {
        NonNull::new(PointerAndCounter::<T>::from_raw(self.head.load(Ordering::Acquire)).ptr())
    }
}

impl<T> Default for LockFreeStack<T>
where
    T: StackNode,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for LockFreeStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = PointerAndCounter::<T>::from_raw(self.head.load(Ordering::Relaxed));
        f.debug_struct("LockFreeStack").field("head", &head).finish()
    }
}
