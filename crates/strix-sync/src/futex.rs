//! Directed futex wait/wake over a single `AtomicU32`.
//!
//! The bitset variants let readers and writers of the same lock word sleep on
//! independent channels, enabling direct releaser-to-waiter handoff.

use std::sync::atomic::AtomicU32;

/// Wake channel for threads waiting to take the lock shared.
pub const WAIT_READERS: u32 = 1 << 0;
/// Wake channel for threads waiting to take the lock exclusively.
pub const WAIT_WRITERS: u32 = 1 << 1;

#[cfg(target_os = "linux")]
mod imp {
    use super::*;

    pub fn wait_bitset(word: &AtomicU32, expected: u32, mask: u32) {
        // A spurious return is fine; callers re-check the lock word in a loop.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT_BITSET | libc::FUTEX_PRIVATE_FLAG,
                expected,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                mask,
            );
        }
    }

    pub fn wake_bitset(word: &AtomicU32, count: i32, mask: u32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAKE_BITSET | libc::FUTEX_PRIVATE_FLAG,
                count,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                mask,
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;
    use std::sync::atomic::Ordering;

    pub fn wait_bitset(word: &AtomicU32, expected: u32, _mask: u32) {
        // Yielding spin for hosts without a futex. Debug-quality only.
        while word.load(Ordering::Acquire) == expected {
            std::thread::yield_now();
        }
    }

    pub fn wake_bitset(_word: &AtomicU32, _count: i32, _mask: u32) {}
}

pub fn wait_bitset(word: &AtomicU32, expected: u32, mask: u32) {
    imp::wait_bitset(word, expected, mask);
}

pub fn wake_one(word: &AtomicU32, mask: u32) {
    imp::wake_bitset(word, 1, mask);
}

pub fn wake_all(word: &AtomicU32, mask: u32) {
    imp::wake_bitset(word, i32::MAX, mask);
}
