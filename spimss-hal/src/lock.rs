//! Single-slot ownership lock
//!
//! Every channel carries one [`Lock`]. Whoever manages to store its token in
//! the lock owns the channel until it releases it again; everybody else is
//! turned away immediately, there is no waiting and no queue.
//!
//! The owner is a plain [`AtomicU32`] so the lock can be taken from thread
//! mode and released from an interrupt handler without a critical section. On
//! cores without a native compare-and-swap `portable-atomic` falls back to a
//! critical section internally.

use core::num::NonZeroU32;

use portable_atomic::{AtomicU32, Ordering};

const FREE: u32 = 0;

/// Exclusive, non-blocking ownership token holder.
#[derive(Debug)]
pub struct Lock {
    owner: AtomicU32,
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock {
    /// Create a free lock.
    pub const fn new() -> Self {
        Self {
            owner: AtomicU32::new(FREE),
        }
    }

    /// Try to take the lock for `token`.
    ///
    /// Returns `false` if the lock is already owned, by anyone including `token` itself.
    pub fn try_acquire(&self, token: NonZeroU32) -> bool {
        self.owner
            .compare_exchange(FREE, token.get(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the lock, but only if it is currently owned by `token`.
    ///
    /// Returns whether the lock was released.
    pub fn release_if(&self, token: NonZeroU32) -> bool {
        self.owner
            .compare_exchange(token.get(), FREE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the lock regardless of who owns it.
    pub fn release(&self) {
        self.owner.store(FREE, Ordering::Release);
    }

    /// Current owner, if any.
    pub fn owner(&self) -> Option<NonZeroU32> {
        NonZeroU32::new(self.owner.load(Ordering::Acquire))
    }

    /// Check if the lock is owned.
    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(raw: u32) -> NonZeroU32 {
        NonZeroU32::new(raw).unwrap()
    }

    #[test]
    fn second_owner_is_turned_away() {
        let lock = Lock::new();
        assert!(lock.try_acquire(token(1)));
        assert!(!lock.try_acquire(token(2)));
        assert!(!lock.try_acquire(token(1)));
        assert_eq!(lock.owner(), Some(token(1)));
    }

    #[test]
    fn release_if_checks_owner() {
        let lock = Lock::new();
        assert!(lock.try_acquire(token(7)));
        assert!(!lock.release_if(token(8)));
        assert!(lock.is_locked());
        assert!(lock.release_if(token(7)));
        assert!(!lock.is_locked());
        // releasing twice is harmless
        assert!(!lock.release_if(token(7)));
    }

    #[test]
    fn forced_release_frees_any_owner() {
        let lock = Lock::new();
        assert!(lock.try_acquire(token(3)));
        lock.release();
        assert_eq!(lock.owner(), None);
        assert!(lock.try_acquire(token(4)));
    }
}
