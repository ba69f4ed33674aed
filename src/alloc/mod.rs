pub mod forever;
pub mod mmap_pool;
pub mod pool;
