//! Host mutex
//!
//! Thin wrapper over `std::sync::Mutex` that reports the host OS status
//! codes (PASS, FAIL, ERR_BUSY, ERR_DEADLK, ERR_PERM) and only hands out
//! scoped guards, so the lock is released on every exit path.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};

use crate::error::RuntimeError;

/// Status codes of the host mutex contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Pass,
    /// Poisoned by a panicking holder, or used after `destroy`.
    Fail,
    /// `try_lock` found the mutex held, or `destroy` found it locked.
    ErrBusy,
    /// The calling thread already holds the mutex.
    ErrDeadlk,
    /// Unlock by a non-owner. Guards are `!Send`, so they never report it.
    ErrPerm,
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LockStatus::Pass => "PASS",
            LockStatus::Fail => "FAIL",
            LockStatus::ErrBusy => "ERR_BUSY",
            LockStatus::ErrDeadlk => "ERR_DEADLK",
            LockStatus::ErrPerm => "ERR_PERM",
        };
        f.write_str(text)
    }
}

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|t| *t)
}

/// Mutex guarding shared registry and context state.
pub struct HostMutex<T> {
    name: &'static str,
    inner: Mutex<T>,
    // 0 when unlocked
    owner: AtomicU64,
    destroyed: AtomicBool,
}

impl<T> HostMutex<T> {
    pub fn init(name: &'static str, value: T) -> Self {
        log::trace!("HostMutex '{}' initialized", name);
        Self {
            name,
            inner: Mutex::new(value),
            owner: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Block until the mutex is acquired.
    pub fn lock(&self) -> Result<HostMutexGuard<'_, T>, LockStatus> {
        self.check_usable()?;
        let guard = self.inner.lock().map_err(|_| LockStatus::Fail)?;
        Ok(self.guard(guard))
    }

    /// Acquire without blocking.
    pub fn try_lock(&self) -> Result<HostMutexGuard<'_, T>, LockStatus> {
        self.check_usable()?;
        match self.inner.try_lock() {
            Ok(guard) => Ok(self.guard(guard)),
            Err(TryLockError::WouldBlock) => Err(LockStatus::ErrBusy),
            Err(TryLockError::Poisoned(_)) => Err(LockStatus::Fail),
        }
    }

    /// Mark the mutex unusable. Fails with `ErrBusy` while it is held.
    pub fn destroy(&self) -> LockStatus {
        if self.owner.load(Ordering::Acquire) != 0 {
            return LockStatus::ErrBusy;
        }
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return LockStatus::Fail;
        }
        log::trace!("HostMutex '{}' destroyed", self.name);
        LockStatus::Pass
    }

    /// `lock` with the status lifted into a [`RuntimeError`].
    pub fn acquire(&self) -> Result<HostMutexGuard<'_, T>, RuntimeError> {
        self.lock().map_err(|status| RuntimeError::Sync {
            name: self.name,
            status,
        })
    }

    fn check_usable(&self) -> Result<(), LockStatus> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(LockStatus::Fail);
        }
        if self.owner.load(Ordering::Acquire) == current_thread_token() {
            return Err(LockStatus::ErrDeadlk);
        }
        Ok(())
    }

    fn guard<'a>(&'a self, guard: MutexGuard<'a, T>) -> HostMutexGuard<'a, T> {
        self.owner.store(current_thread_token(), Ordering::Release);
        HostMutexGuard {
            guard,
            owner: &self.owner,
        }
    }
}

/// Scoped acquisition of a [`HostMutex`]; unlocks on drop.
pub struct HostMutexGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    owner: &'a AtomicU64,
}

impl<T> HostMutexGuard<'_, T> {
    /// Explicit unlock. Equivalent to dropping the guard.
    pub fn unlock(self) -> LockStatus {
        if self.owner.load(Ordering::Acquire) != current_thread_token() {
            return LockStatus::ErrPerm;
        }
        drop(self);
        LockStatus::Pass
    }
}

impl<T> Deref for HostMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for HostMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for HostMutexGuard<'_, T> {
    fn drop(&mut self) {
        // cleared before the inner guard releases the lock
        self.owner.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lock_and_mutate() {
        let m = HostMutex::init("counter", 0u32);
        {
            let mut g = m.lock().unwrap();
            *g += 5;
        }
        assert_eq!(*m.lock().unwrap(), 5);
    }

    #[test]
    fn test_relock_same_thread_is_deadlock() {
        let m = HostMutex::init("relock", ());
        let _g = m.lock().unwrap();
        assert_eq!(m.lock().err(), Some(LockStatus::ErrDeadlk));
        assert_eq!(m.try_lock().err(), Some(LockStatus::ErrDeadlk));
    }

    #[test]
    fn test_try_lock_busy_from_other_thread() {
        let m = Arc::new(HostMutex::init("busy", ()));
        let g = m.lock().unwrap();
        let other = Arc::clone(&m);
        let status = std::thread::spawn(move || other.try_lock().err())
            .join()
            .unwrap();
        assert_eq!(status, Some(LockStatus::ErrBusy));
        assert_eq!(g.unlock(), LockStatus::Pass);
        assert!(m.try_lock().is_ok());
    }

    #[test]
    fn test_destroy_rules() {
        let m = HostMutex::init("destroy", 1u8);
        {
            let _g = m.lock().unwrap();
            assert_eq!(m.destroy(), LockStatus::ErrBusy);
        }
        assert_eq!(m.destroy(), LockStatus::Pass);
        assert_eq!(m.destroy(), LockStatus::Fail);
        assert_eq!(m.lock().err(), Some(LockStatus::Fail));
    }

    #[test]
    fn test_poisoned_mutex_fails() {
        let m = Arc::new(HostMutex::init("poison", ()));
        let other = Arc::clone(&m);
        let _ = std::thread::spawn(move || {
            let _g = other.lock().unwrap();
            panic!("poison the lock");
        })
        .join();
        assert_eq!(m.lock().err(), Some(LockStatus::Fail));
        let err = m.acquire().err().unwrap();
        assert!(err.to_string().contains("FAIL"));
    }
}
