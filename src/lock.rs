//! Optimistic version lock guarding each node.
//!
//! A single `AtomicU64` packs the whole protocol: bit 0 marks the node
//! obsolete (retired by a rebuild), bit 1 is the write lock, and the
//! remaining 62 bits are a version counter. Readers take a snapshot of the
//! word, read the node, and re-check the word; any change in between forces
//! the whole top-level operation to restart from the root.

use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicU64, Ordering};

const OBSOLETE_BIT: u64 = 0b01;
const LOCK_BIT: u64 = 0b10;

/// One version step. Adding this to a locked word clears the lock bit and
/// carries into the version field.
const LOCK_UNIT: u64 = 0b10;

/// Signal that a descent observed contention or an obsolete node and the
/// top-level operation must restart from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Restart;

pub(crate) type Lresult<T> = Result<T, Restart>;

pub(crate) struct VersionLock(AtomicU64);

impl VersionLock {
    /// Fresh lock word: version 1, unlocked, not obsolete.
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(0b100))
    }

    /// Reset a recycled node's lock word to the fresh state.
    pub(crate) fn reset(&self) {
        self.0.store(0b100, Ordering::Release);
    }

    #[inline]
    fn is_locked(word: u64) -> bool {
        word & LOCK_BIT != 0
    }

    #[inline]
    fn is_obsolete(word: u64) -> bool {
        word & OBSOLETE_BIT != 0
    }

    /// Spin until the node is not write-locked, then return a version
    /// snapshot. Observing the obsolete bit aborts the descent.
    #[inline]
    pub(crate) fn read_lock(&self) -> Lresult<u64> {
        let backoff = Backoff::new();
        let mut word = self.0.load(Ordering::Acquire);
        while Self::is_locked(word) {
            backoff.spin();
            word = self.0.load(Ordering::Acquire);
        }
        if Self::is_obsolete(word) {
            return Err(Restart);
        }
        Ok(word)
    }

    /// Validate that the word is still exactly the snapshot taken by
    /// `read_lock`. Equality implies unlocked and not obsolete.
    #[inline]
    pub(crate) fn check(&self, version: u64) -> Lresult<()> {
        if self.0.load(Ordering::Acquire) == version {
            Ok(())
        } else {
            Err(Restart)
        }
    }

    /// Release a read snapshot; identical to `check`.
    #[inline]
    pub(crate) fn read_unlock(&self, version: u64) -> Lresult<()> {
        self.check(version)
    }

    /// Atomically swap an unlocked snapshot for the write-locked word.
    #[inline]
    pub(crate) fn upgrade_to_write(&self, version: u64) -> Lresult<()> {
        self.0
            .compare_exchange(version, version | LOCK_BIT, Ordering::Acquire, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| Restart)
    }

    /// Bump the version and clear the write lock in one step.
    #[inline]
    pub(crate) fn write_unlock(&self) {
        self.0.fetch_add(LOCK_UNIT, Ordering::Release);
    }

    /// Retire a write-locked node: set the obsolete bit, bump the version,
    /// and release the lock. Every later reader restarts.
    #[inline]
    pub(crate) fn mark_obsolete_and_unlock(&self) {
        self.0.fetch_add(LOCK_UNIT | OBSOLETE_BIT, Ordering::Release);
    }

    /// Claim an unlocked node for retirement: spin past any writer, then
    /// set the obsolete bit. Returns `false` if another retirer got there
    /// first, in which case the caller re-reads the edge that led here (the
    /// competing rebuild has already spliced in a replacement).
    pub(crate) fn freeze(&self) -> bool {
        let backoff = Backoff::new();
        loop {
            let word = self.0.load(Ordering::Acquire);
            if Self::is_obsolete(word) {
                return false;
            }
            if Self::is_locked(word) {
                backoff.spin();
                continue;
            }
            if self
                .0
                .compare_exchange(word, word | OBSOLETE_BIT, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }
}

/// Backoff between whole-operation restarts. Early restarts spin, later ones
/// yield the CPU so a stalled writer can finish.
#[inline]
pub(crate) fn restart_backoff(restart_count: u32) {
    if restart_count <= 3 {
        for _ in 0..(1 << restart_count) {
            std::hint::spin_loop();
        }
    } else {
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod lock_tests {
    use super::*;

    #[test]
    fn snapshot_roundtrip() {
        let lock = VersionLock::new();
        let v = lock.read_lock().unwrap();
        assert!(lock.check(v).is_ok());
        assert!(lock.read_unlock(v).is_ok());
    }

    #[test]
    fn write_unlock_bumps_version() {
        let lock = VersionLock::new();
        let v = lock.read_lock().unwrap();
        lock.upgrade_to_write(v).unwrap();
        lock.write_unlock();
        let v2 = lock.read_lock().unwrap();
        assert!(v2 > v);
        // Stale snapshots no longer validate.
        assert_eq!(lock.check(v), Err(Restart));
    }

    #[test]
    fn upgrade_fails_on_stale_snapshot() {
        let lock = VersionLock::new();
        let v = lock.read_lock().unwrap();
        lock.upgrade_to_write(v).unwrap();
        lock.write_unlock();
        assert_eq!(lock.upgrade_to_write(v), Err(Restart));
    }

    #[test]
    fn obsolete_restarts_readers() {
        let lock = VersionLock::new();
        let v = lock.read_lock().unwrap();
        lock.upgrade_to_write(v).unwrap();
        lock.mark_obsolete_and_unlock();
        assert_eq!(lock.read_lock(), Err(Restart));
    }

    #[test]
    fn freeze_claims_exactly_once() {
        let lock = VersionLock::new();
        assert!(lock.freeze());
        assert!(!lock.freeze());
        assert_eq!(lock.read_lock(), Err(Restart));
    }

    #[test]
    fn frozen_word_rejects_stale_upgrade() {
        let lock = VersionLock::new();
        let v = lock.read_lock().unwrap();
        assert!(lock.freeze());
        // A writer that validated before the freeze can no longer commit.
        assert_eq!(lock.upgrade_to_write(v), Err(Restart));
    }
}
