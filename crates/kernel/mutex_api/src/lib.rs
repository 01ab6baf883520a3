//! Lock abstraction shared by the cache and inode layers.
//!
//! The kernel supplies its own sleep locks; host builds (and tests) use
//! [`std::sync::Mutex`] through the `std` feature.
#![cfg_attr(any(not(feature = "std"), target_os = "none"), no_std)]

use core::ops::DerefMut;

/// A mutex.
pub trait Mutex {
    /// The type of the data that the mutex protects.
    type Data;

    /// The type of the guard that the `lock` method returns.
    type Guard<'a>: DerefMut<Target = Self::Data>
    where
        Self: 'a;

    /// Creates a new mutex.
    fn new(data: Self::Data) -> Self;

    /// Locks the mutex, blocking the current thread until it is available.
    fn lock(&self) -> Self::Guard<'_>;

    /// Attempts to lock the mutex without blocking.
    ///
    /// Returns `None` if the mutex is held by someone else.
    fn try_lock(&self) -> Option<Self::Guard<'_>>;
}

/// A family of mutexes, one for every protected type.
///
/// Lets a structure that owns several differently-typed locks be generic
/// over a single lock implementation.
pub trait MutexKind {
    /// The mutex protecting a value of type `T`.
    type Lock<T>: Mutex<Data = T>;
}

#[cfg(all(feature = "std", not(target_os = "none")))]
impl<T> Mutex for std::sync::Mutex<T> {
    type Data = T;
    type Guard<'a>
        = std::sync::MutexGuard<'a, T>
    where
        T: 'a;

    fn new(data: Self::Data) -> Self {
        Self::new(data)
    }

    fn lock(&self) -> Self::Guard<'_> {
        self.lock().unwrap()
    }

    fn try_lock(&self) -> Option<Self::Guard<'_>> {
        match self.try_lock() {
            Ok(guard) => Some(guard),
            Err(std::sync::TryLockError::WouldBlock) => None,
            Err(std::sync::TryLockError::Poisoned(e)) => panic!("mutex poisoned: {e}"),
        }
    }
}

/// [`MutexKind`] backed by [`std::sync::Mutex`].
#[cfg(all(feature = "std", not(target_os = "none")))]
#[derive(Debug, Clone, Copy, Default)]
pub struct StdMutexKind;

#[cfg(all(feature = "std", not(target_os = "none")))]
impl MutexKind for StdMutexKind {
    type Lock<T> = std::sync::Mutex<T>;
}
