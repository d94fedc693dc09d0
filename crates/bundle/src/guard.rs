//! Per-job resource guard
//!
//! Each export job owns one guard. Totals are never shared between jobs, so
//! one large export cannot starve another.

use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Default ceiling of a single export: 2 GiB
pub const DEFAULT_CEILING_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// A write was rejected because it would exceed the job's ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("quota exceeded: {attempted} bytes requested, {used} of {ceiling} bytes used")]
pub struct QuotaExceeded {
    /// Configured ceiling
    pub ceiling: u64,
    /// Bytes accounted before the rejected write
    pub used: u64,
    /// Size of the rejected write
    pub attempted: u64,
}

/// Tracks bytes written by one export against a ceiling
#[derive(Debug)]
pub struct ResourceGuard {
    ceiling: u64,
    used: AtomicU64,
}

impl ResourceGuard {
    /// Create a guard with the given ceiling in bytes
    pub fn new(ceiling: u64) -> Self {
        Self {
            ceiling,
            used: AtomicU64::new(0),
        }
    }

    /// Account `bytes` if the running total stays within the ceiling
    ///
    /// A rejected write is not accounted.
    pub fn check_and_account(&self, bytes: u64) -> Result<(), QuotaExceeded> {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.ceiling {
                return Err(QuotaExceeded {
                    ceiling: self.ceiling,
                    used: current,
                    attempted: bytes,
                });
            }
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Bytes accounted so far
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Configured ceiling
    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Bytes still available
    pub fn remaining(&self) -> u64 {
        self.ceiling.saturating_sub(self.used())
    }
}

impl Default for ResourceGuard {
    fn default() -> Self {
        Self::new(DEFAULT_CEILING_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_accounts_until_ceiling() {
        let guard = ResourceGuard::new(100);
        guard.check_and_account(60).unwrap();
        guard.check_and_account(40).unwrap();
        assert_eq!(guard.used(), 100);
        assert_eq!(guard.remaining(), 0);

        let err = guard.check_and_account(1).unwrap_err();
        assert_eq!(err.ceiling, 100);
        assert_eq!(err.used, 100);
        assert_eq!(err.attempted, 1);
    }

    #[test]
    fn test_rejected_write_is_not_accounted() {
        let guard = ResourceGuard::new(100);
        guard.check_and_account(90).unwrap();
        assert!(guard.check_and_account(20).is_err());
        assert_eq!(guard.used(), 90);
        guard.check_and_account(10).unwrap();
    }

    #[test]
    fn test_guards_are_independent() {
        let a = ResourceGuard::new(10);
        let b = ResourceGuard::new(10);
        a.check_and_account(10).unwrap();
        b.check_and_account(10).unwrap();
        assert!(a.check_and_account(1).is_err());
    }

    #[test]
    fn test_concurrent_accounting_never_overshoots() {
        let guard = Arc::new(ResourceGuard::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = Arc::clone(&guard);
                thread::spawn(move || {
                    let mut accepted = 0u64;
                    for _ in 0..100 {
                        if guard.check_and_account(3).is_ok() {
                            accepted += 3;
                        }
                    }
                    accepted
                })
            })
            .collect();
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, guard.used());
        assert!(guard.used() <= 1000);
    }
}
