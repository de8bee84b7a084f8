//! One-word spin lock with a futex fallback.
//!
//! The raw entry points operate on any `AtomicU32`, including one embedded in
//! executable memory (compiled fragment tails carry such a word so the fault
//! handler can serialize in-place patching). States: 0 unlocked, 1 locked,
//! 2 locked with waiters.

use std::hint;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::futex;
use crate::SPIN_WINDOW;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// Acquire the lock word, spinning briefly before sleeping.
pub fn raw_spin_lock(word: &AtomicU32) -> RawSpinGuard<'_> {
    if raw_spin_try_lock_inner(word) {
        return RawSpinGuard { word };
    }

    for _ in 0..SPIN_WINDOW {
        hint::spin_loop();
        if word.load(Ordering::Relaxed) == UNLOCKED && raw_spin_try_lock_inner(word) {
            return RawSpinGuard { word };
        }
    }

    // Mark contended so unlock knows to wake us, then sleep.
    while word.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
        futex::wait_bitset(word, CONTENDED, futex::WAIT_WRITERS);
    }
    RawSpinGuard { word }
}

/// One-shot acquisition attempt.
pub fn raw_spin_try_lock(word: &AtomicU32) -> Option<RawSpinGuard<'_>> {
    // Lazy construction; a guard made on the failure path would unlock the
    // current holder's word when it drops.
    raw_spin_try_lock_inner(word).then(|| RawSpinGuard { word })
}

fn raw_spin_try_lock_inner(word: &AtomicU32) -> bool {
    word.compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
}

/// Release a lock word without a guard.
///
/// Only for the fork path, where the guard taken before `fork()` cannot be
/// carried across the syscall.
pub fn raw_spin_unlock(word: &AtomicU32) {
    if word.swap(UNLOCKED, Ordering::Release) == CONTENDED {
        futex::wake_one(word, futex::WAIT_WRITERS);
    }
}

/// RAII guard for a raw lock word.
pub struct RawSpinGuard<'a> {
    word: &'a AtomicU32,
}

impl Drop for RawSpinGuard<'_> {
    fn drop(&mut self) {
        raw_spin_unlock(self.word);
    }
}

/// An owned spin-futex word.
#[derive(Default)]
pub struct SpinFutex {
    word: AtomicU32,
}

impl SpinFutex {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(UNLOCKED),
        }
    }

    pub fn lock(&self) -> RawSpinGuard<'_> {
        raw_spin_lock(&self.word)
    }

    pub fn try_lock(&self) -> Option<RawSpinGuard<'_>> {
        raw_spin_try_lock(&self.word)
    }

    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != UNLOCKED
    }

    /// Reset to unlocked regardless of the current holder.
    ///
    /// Fork-only: the child process inherits lock words from threads that do
    /// not exist on its side of the fork.
    pub fn steal_and_reset(&self) {
        self.word.store(UNLOCKED, Ordering::Release);
        futex::wake_all(&self.word, futex::WAIT_WRITERS);
    }
}
