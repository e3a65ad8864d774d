//! A minimal mutex abstraction so the locks in this crate (and anything
//! layered on top, like a block cache) can be written generically over
//! "some type providing exclusive access", without committing callers to a
//! specific lock implementation.

use core::ops::DerefMut;

/// A type that hands out exclusive access to the data it wraps.
pub trait Mutex {
    /// The protected data.
    type Data;

    /// The guard returned by [`Mutex::lock`].
    type Guard<'a>: DerefMut<Target = Self::Data>
    where
        Self: 'a;

    fn new(data: Self::Data) -> Self;

    /// Blocks until exclusive access is available.
    fn lock(&self) -> Self::Guard<'_>;
}
