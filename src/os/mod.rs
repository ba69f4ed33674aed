pub mod mem;
pub mod memfd;
