//! Cross-instance coordination primitives.

pub mod execution_lock;

pub use execution_lock::{ExecutionLock, LockHandle};
