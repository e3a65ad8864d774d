//! Synchronization primitives for the file system layer.
//!
//! Two kinds of lock are used throughout this crate, mirroring the
//! short-section/long-section split of the file system they protect:
//! [`SpinLock`] for bookkeeping that never blocks, and [`SleepLock`] for
//! critical sections that span disk I/O.

mod mutex;
mod sleep_lock;
mod spin_lock;

pub use mutex::Mutex;
pub use sleep_lock::{SleepLock, SleepLockGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
