pub mod lock_free_stack;
pub mod pointer_and_counter;
