//! Everything the lock-free structures synchronise through. Under `--cfg loom`
//! these come from `loom` so the model checker sees every access.

#[cfg(not(loom))]
pub(crate) mod export {
    pub(crate) mod sync {
        pub(crate) mod atomic {
            pub(crate) use std::sync::atomic::AtomicPtr;
            pub(crate) use std::sync::atomic::AtomicU64;
            pub(crate) use std::sync::atomic::AtomicUsize;
            pub(crate) use std::sync::atomic::Ordering;
        }
    }
}

#[cfg(loom)]
pub(crate) mod export {
    pub(crate) mod sync {
        pub(crate) mod atomic {
            pub(crate) use loom::sync::atomic::AtomicPtr;
            pub(crate) use loom::sync::atomic::AtomicU64;
            pub(crate) use loom::sync::atomic::AtomicUsize;
            pub(crate) use loom::sync::atomic::Ordering;
        }
    }
}

#[doc(inline)]
pub(crate) use self::export::*;
