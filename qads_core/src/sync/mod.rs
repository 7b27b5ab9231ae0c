//! Cross-process synchronization primitives.

pub mod semaphore;

pub use semaphore::NamedSemaphore;
