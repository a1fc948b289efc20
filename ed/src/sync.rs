//! Lock helpers
//!
//! A panic while holding one of our locks leaves plain data behind (queues,
//! counters, flags), so a poisoned lock is recovered rather than propagated.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

/// Block on `cond` until `ready` holds or `timeout` passes
///
/// Consumes the guard and returns whether `ready` held on exit.
pub(crate) fn wait_until<T>(
    cond: &Condvar,
    mut guard: MutexGuard<'_, T>,
    timeout: Duration,
    mut ready: impl FnMut(&T) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if ready(&guard) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        guard = match cond.wait_timeout(guard, deadline - now) {
            Ok((g, _)) => g,
            Err(poisoned) => poisoned.into_inner().0,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_until_times_out() {
        let m = Mutex::new(0);
        let c = Condvar::new();
        assert!(!wait_until(&c, lock(&m), Duration::from_millis(20), |v| *v > 0));
    }

    #[test]
    fn test_wait_until_wakes() {
        let pair = Arc::new((Mutex::new(0), Condvar::new()));
        let other = Arc::clone(&pair);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            *lock(&other.0) = 1;
            other.1.notify_all();
        });
        assert!(wait_until(&pair.1, lock(&pair.0), Duration::from_secs(5), |v| *v > 0));
        assert_eq!(*lock(&pair.0), 1);
        t.join().unwrap();
    }
}
