//! Synchronization primitives built on the run loop

mod semaphore;

pub use semaphore::{semaphore_for_current_thread, BlockingSemaphore, LoopSemaphore, Semaphore};
