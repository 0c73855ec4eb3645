//! Process-wide non-blocking write lock, per `spec.md` §4.7 and §5.
//!
//! All write-like operations acquire this for their duration; if another
//! write is already in flight the request fails immediately with `BUSY`
//! rather than queueing, so clients implement their own backoff.

use std::sync::{Mutex, TryLockError};

#[derive(Default)]
pub struct WriteLock(Mutex<()>);

pub struct WriteGuard<'a>(#[allow(dead_code)] std::sync::MutexGuard<'a, ()>);

impl WriteLock {
    pub fn new() -> Self {
        Self(Mutex::new(()))
    }

    /// Attempts to acquire the lock without blocking. `None` means another
    /// write is in flight; the caller should fail the request with `BUSY`.
    pub fn try_acquire(&self) -> Option<WriteGuard<'_>> {
        match self.0.try_lock() {
            Ok(guard) => Some(WriteGuard(guard)),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(p)) => Some(WriteGuard(p.into_inner())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_first_held() {
        let lock = WriteLock::new();
        let first = lock.try_acquire();
        assert!(first.is_some());
        assert!(lock.try_acquire().is_none());
        drop(first);
        assert!(lock.try_acquire().is_some());
    }
}
