use std::{
    ops::{Deref, DerefMut},
    time::{Duration, Instant},
};

use tracing::warn;

/// A mutex that names the purpose of every acquisition and warns when it is held too long
#[derive(Debug)]
pub(crate) struct Mutex<T> {
    inner: std::sync::Mutex<T>,
}

impl<T> Mutex<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            inner: std::sync::Mutex::new(value),
        }
    }

    /// Acquires the lock for a certain purpose
    ///
    /// A poisoned lock is recovered.
    pub(crate) fn lock(&self, purpose: &'static str) -> MutexGuard<'_, T> {
        let guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        MutexGuard {
            guard,
            start_time: Instant::now(),
            purpose,
        }
    }
}

pub(crate) struct MutexGuard<'a, T> {
    guard: std::sync::MutexGuard<'a, T>,
    start_time: Instant,
    purpose: &'static str,
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        let duration = self.start_time.elapsed();
        if duration > MAX_HOLD_TIME {
            warn!("holding the lock for {} took {:?}", self.purpose, duration);
        }
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.guard.deref()
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.deref_mut()
    }
}

const MAX_HOLD_TIME: Duration = Duration::from_millis(1);
