//! Write-priority reader/writer lock.
//!
//! The whole lock state lives in one 32-bit futex word:
//!
//! ```text
//!    Bits[31]: write-owned bit
//! Bits[30:16]: write-waiter count
//!    Bits[15]: read-waiter bit
//!  Bits[14:0]: read-owner count
//! ```
//!
//! New readers cannot pass while any writer is waiting, and a releaser hands
//! off directly to the next waiting writer (or wakes all waiting readers if
//! none), bounding writer starvation. Invalidation takes the write side; the
//! compile and link paths take the read side.
//!
//! There is no wake-up ordering guarantee beyond prioritizing writers, and no
//! recursive locking.

use std::cell::UnsafeCell;
use std::hint;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::futex::{self, WAIT_READERS, WAIT_WRITERS};
use crate::SPIN_WINDOW;

const WRITE_OWNED_BIT: u32 = 1 << 31;
const READ_WAITER_BIT: u32 = 1 << 15;
const WRITE_WAITER_SHIFT: u32 = 16;
const WRITE_WAITER_INC: u32 = 1 << WRITE_WAITER_SHIFT;
const WRITE_WAITER_MASK: u32 = 0x7FFF << WRITE_WAITER_SHIFT;
const READ_OWNER_INC: u32 = 1;
const READ_OWNER_MASK: u32 = 0x7FFF;

pub struct WritePriorityRwLock<T: ?Sized> {
    word: AtomicU32,
    data: UnsafeCell<T>,
}

// Readers hand out `&T` concurrently, so `T: Send + Sync` is required for
// sharing the lock itself.
unsafe impl<T: ?Sized + Send> Send for WritePriorityRwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for WritePriorityRwLock<T> {}

impl<T> WritePriorityRwLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            word: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> WritePriorityRwLock<T> {
    pub fn write(&self) -> RwWriteGuard<'_, T> {
        if self.try_write_word() {
            return RwWriteGuard { lock: self };
        }

        // Short spin before joining the waiter count; a free word is common
        // under light contention.
        for _ in 0..SPIN_WINDOW {
            hint::spin_loop();
            if self.word.load(Ordering::Relaxed) == 0 && self.try_write_word() {
                return RwWriteGuard { lock: self };
            }
        }

        let mut expected = self.word.fetch_add(WRITE_WAITER_INC, Ordering::AcqRel) + WRITE_WAITER_INC;
        debug_assert!(expected & WRITE_WAITER_MASK != 0, "write-waiter overflow");

        loop {
            let mut sleep;
            loop {
                let desired = if expected & WRITE_OWNED_BIT == 0 && expected & READ_OWNER_MASK == 0 {
                    // Free for a writer: take ownership and leave the wait list.
                    sleep = false;
                    (expected | WRITE_OWNED_BIT) - WRITE_WAITER_INC
                } else {
                    sleep = true;
                    break;
                };
                match self.word.compare_exchange(
                    expected,
                    desired,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => expected = actual,
                }
            }

            if !sleep {
                return RwWriteGuard { lock: self };
            }
            futex::wait_bitset(&self.word, expected, WAIT_WRITERS);
            expected = self.word.load(Ordering::Relaxed);
        }
    }

    pub fn read(&self) -> RwReadGuard<'_, T> {
        if self.try_read_word() {
            return RwReadGuard { lock: self };
        }

        let mut expected = self.word.load(Ordering::Relaxed);
        loop {
            let mut sleep;
            let mut desired;
            loop {
                if expected & (WRITE_OWNED_BIT | WRITE_WAITER_MASK) == 0 {
                    desired = expected + READ_OWNER_INC;
                    debug_assert!(desired & READ_OWNER_MASK != 0, "read-owner overflow");
                    sleep = false;
                } else {
                    // Writers present; advertise ourselves and sleep.
                    desired = expected | READ_WAITER_BIT;
                    sleep = true;
                }
                match self.word.compare_exchange(
                    expected,
                    desired,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => expected = actual,
                }
            }

            if !sleep {
                return RwReadGuard { lock: self };
            }
            futex::wait_bitset(&self.word, desired, WAIT_READERS);
            expected = self.word.load(Ordering::Relaxed);
        }
    }

    pub fn try_write(&self) -> Option<RwWriteGuard<'_, T>> {
        // `then`, not `then_some`: a guard built on the failure path would
        // release a lock this thread never acquired when it drops.
        self.try_write_word().then(|| RwWriteGuard { lock: self })
    }

    pub fn try_read(&self) -> Option<RwReadGuard<'_, T>> {
        self.try_read_word().then(|| RwReadGuard { lock: self })
    }

    /// `true` while any thread holds the write side.
    pub fn is_write_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) & WRITE_OWNED_BIT != 0
    }

    /// Take the write side and keep it across `fork()`.
    ///
    /// The matching release is [`unlock_after_fork`] in the parent or
    /// [`steal_and_drop_active_locks`] in the child; a normal guard cannot be
    /// carried over the syscall.
    ///
    /// [`unlock_after_fork`]: Self::unlock_after_fork
    /// [`steal_and_drop_active_locks`]: Self::steal_and_drop_active_locks
    pub fn lock_before_fork(&self) {
        std::mem::forget(self.write());
    }

    /// Parent-side release after `fork()` returns.
    pub fn unlock_after_fork(&self) {
        self.unlock_write_word();
    }

    /// Reset the lock word to unlocked regardless of the current holder, and
    /// wake everything.
    ///
    /// Fork-only: in the child, the surviving thread is the sole owner of
    /// every lock it held, and waiter counts refer to threads that no longer
    /// exist. Never call this on a lock that live threads contend.
    pub fn steal_and_drop_active_locks(&self) {
        self.word.store(0, Ordering::Release);
        futex::wake_all(&self.word, WAIT_WRITERS | WAIT_READERS);
    }

    fn try_write_word(&self) -> bool {
        self.word
            .compare_exchange(0, WRITE_OWNED_BIT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn try_read_word(&self) -> bool {
        let expected = self.word.load(Ordering::Relaxed);
        if expected & (WRITE_OWNED_BIT | WRITE_WAITER_MASK) != 0 {
            return false;
        }
        let desired = expected + READ_OWNER_INC;
        self.word
            .compare_exchange(expected, desired, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn unlock_write_word(&self) {
        let mut expected = self.word.load(Ordering::Relaxed);
        loop {
            debug_assert!(expected & WRITE_OWNED_BIT != 0, "write-unlock of unowned lock");
            let mut desired = expected & !WRITE_OWNED_BIT;
            // Last writer out clears the read-waiter advertisement.
            if desired & WRITE_WAITER_MASK == 0 {
                desired &= !READ_WAITER_BIT;
            }
            match self.word.compare_exchange(
                expected,
                desired,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => expected = actual,
            }
        }

        if expected & WRITE_WAITER_MASK != 0 {
            // Write -> write handoff.
            futex::wake_one(&self.word, WAIT_WRITERS);
        } else if expected & READ_WAITER_BIT != 0 {
            // Write -> readers handoff.
            futex::wake_all(&self.word, WAIT_READERS);
        }
    }

    fn unlock_read_word(&self) {
        let desired = self.word.fetch_sub(READ_OWNER_INC, Ordering::AcqRel) - READ_OWNER_INC;
        // Read -> write handoff once the last reader leaves.
        if desired & WRITE_WAITER_MASK != 0 && desired & READ_OWNER_MASK == 0 {
            futex::wake_one(&self.word, WAIT_WRITERS);
        }
    }
}

pub struct RwReadGuard<'a, T: ?Sized> {
    lock: &'a WritePriorityRwLock<T>,
}

impl<T: ?Sized> Deref for RwReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_read_word();
    }
}

pub struct RwWriteGuard<'a, T: ?Sized> {
    lock: &'a WritePriorityRwLock<T>,
}

impl<T: ?Sized> Deref for RwWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_write_word();
    }
}
