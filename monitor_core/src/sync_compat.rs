// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Mutex used for the server lock table.
//!
//! `parking_lot::Mutex` in normal builds. Under the `loom` feature it is a
//! wrapper over `loom::sync::Mutex` whose `lock()` returns the guard directly,
//! so the lock manager compiles unchanged against either.

#[cfg(not(feature = "loom"))]
pub use parking_lot::Mutex;

#[cfg(feature = "loom")]
pub use self::loom_compat::Mutex;

#[cfg(feature = "loom")]
mod loom_compat {
    use std::fmt;

    pub struct Mutex<T>(loom::sync::Mutex<T>);

    impl<T> Mutex<T> {
        pub fn new(t: T) -> Self {
            Self(loom::sync::Mutex::new(t))
        }

        /// Poisoning only follows a panic inside the model, which already fails it.
        #[allow(clippy::unwrap_used)]
        pub fn lock(&self) -> loom::sync::MutexGuard<'_, T> {
            self.0.lock().unwrap()
        }
    }

    impl<T: Default> Default for Mutex<T> {
        fn default() -> Self {
            Self::new(T::default())
        }
    }

    impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self.0.try_lock() {
                Ok(guard) => f.debug_tuple("Mutex").field(&*guard).finish(),
                Err(_) => f.debug_tuple("Mutex").field(&"<locked>").finish(),
            }
        }
    }
}
