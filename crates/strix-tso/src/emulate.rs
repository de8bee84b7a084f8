//! Software emulation of faulting atomic accesses.
//!
//! All entry points operate over the smallest naturally aligned 64-bit
//! containers covering the access and splice the accessed field in and out
//! with masks, so concurrent writes to neighboring bytes are preserved. A
//! field that crosses a container boundary is updated with two dependent
//! compare-and-swaps; the window between them is a tear, which is detected,
//! rolled back, counted, and retried rather than ever being reported as
//! success.

use std::sync::atomic::{AtomicU64, Ordering};

use strix_sync::SpinFutex;

use crate::TsoCounters;

/// Retries beyond this are a programming error, not contention.
pub(crate) const CAS_RETRY_LIMIT: u32 = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct CasOutcome {
    /// Value observed in the accessed field.
    pub loaded: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct CasPairOutcome {
    pub loaded: [u64; 2],
    pub success: bool,
}

pub(crate) fn field_mask(size_log2: u32) -> u64 {
    if size_log2 >= 3 {
        u64::MAX
    } else {
        (1u64 << (8 << size_log2)) - 1
    }
}

/// `true` if the access spans a 64-byte cacheline boundary, the guest's
/// split-lock case.
pub fn crosses_cacheline(addr: usize, bytes: usize) -> bool {
    (addr & 63) + bytes > 64
}

/// Emulates an up-to-64-bit compare-and-swap at any alignment.
///
/// # Safety
/// `[addr, addr + (1 << size_log2))` must be valid, writable process memory.
pub unsafe fn emulate_cas(
    addr: usize,
    size_log2: u32,
    expected: u64,
    desired: u64,
    counters: &TsoCounters,
) -> CasOutcome {
    debug_assert!(size_log2 <= 3);
    let bytes = 1usize << size_log2;
    let mask = field_mask(size_log2);
    let expected = expected & mask;
    let desired = desired & mask;

    if (addr & 7) + bytes <= 8 {
        cas_single_container(addr, size_log2, expected, desired)
    } else {
        cas_crossing(addr, size_log2, expected, desired, counters)
    }
}

unsafe fn cas_single_container(
    addr: usize,
    size_log2: u32,
    expected: u64,
    desired: u64,
) -> CasOutcome {
    let shift = ((addr & 7) * 8) as u32;
    let mask = field_mask(size_log2) << shift;
    let expected_bits = expected << shift;
    let desired_bits = desired << shift;
    let atom = &*((addr & !7) as *const AtomicU64);

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        assert!(
            attempts <= CAS_RETRY_LIMIT,
            "cas emulation failed to converge at {addr:#x}"
        );
        let cur = atom.load(Ordering::Acquire);
        if cur & mask != expected_bits {
            return CasOutcome {
                loaded: (cur & mask) >> shift,
                success: false,
            };
        }
        let new = (cur & !mask) | desired_bits;
        match atom.compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                return CasOutcome {
                    loaded: expected,
                    success: true,
                }
            }
            Err(actual) => {
                if actual & mask != expected_bits {
                    return CasOutcome {
                        loaded: (actual & mask) >> shift,
                        success: false,
                    };
                }
                // A neighbor byte changed under us; our field is untouched.
            }
        }
    }
}

unsafe fn cas_crossing(
    addr: usize,
    size_log2: u32,
    expected: u64,
    desired: u64,
    counters: &TsoCounters,
) -> CasOutcome {
    let low = &*((addr & !7) as *const AtomicU64);
    let high = &*(((addr & !7) + 8) as *const AtomicU64);
    let shift = ((addr & 7) * 8) as u32;
    let mask128 = (field_mask(size_log2) as u128) << shift;
    let expected128 = (expected as u128) << shift;
    let desired128 = (desired as u128) << shift;

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        assert!(
            attempts <= CAS_RETRY_LIMIT,
            "crossing cas emulation failed to converge at {addr:#x}"
        );
        let l = low.load(Ordering::Acquire);
        let h = high.load(Ordering::Acquire);
        let combined = (l as u128) | ((h as u128) << 64);
        if combined & mask128 != expected128 {
            // The two loads are not atomic; only report a mismatch that is
            // stable across a second read.
            if low.load(Ordering::Acquire) != l || high.load(Ordering::Acquire) != h {
                counters.torn_cas.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            return CasOutcome {
                loaded: ((combined & mask128) >> shift) as u64,
                success: false,
            };
        }

        let new128 = (combined & !mask128) | desired128;
        let new_l = new128 as u64;
        let new_h = (new128 >> 64) as u64;

        if low
            .compare_exchange(l, new_l, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            continue;
        }
        if new_h == h
            || high
                .compare_exchange(h, new_h, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return CasOutcome {
                loaded: expected,
                success: true,
            };
        }

        // The high half moved after the low half landed: a tear. Undo the
        // low half and retry from a fresh read.
        counters.torn_cas.fetch_add(1, Ordering::Relaxed);
        let _ = low.compare_exchange(new_l, l, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// Emulates the pair compare-and-swap (the guest 128-bit CAS).
///
/// An 8-aligned pair uses two dependent 64-bit swaps with tear rollback. A
/// misaligned pair cannot be composed from host atomics at all and is
/// serialized through `fallback`, counting as a split lock at the call site.
///
/// # Safety
/// `[addr, addr + 16)` must be valid, writable process memory.
pub unsafe fn emulate_cas_pair(
    addr: usize,
    expected: [u64; 2],
    desired: [u64; 2],
    counters: &TsoCounters,
    fallback: &SpinFutex,
) -> CasPairOutcome {
    if addr & 7 != 0 {
        let _guard = fallback.lock();
        let lo = read_unaligned(addr, 3);
        let hi = read_unaligned(addr + 8, 3);
        if lo != expected[0] || hi != expected[1] {
            return CasPairOutcome {
                loaded: [lo, hi],
                success: false,
            };
        }
        write_unaligned(addr, 3, desired[0]);
        write_unaligned(addr + 8, 3, desired[1]);
        return CasPairOutcome {
            loaded: expected,
            success: true,
        };
    }

    let low = &*(addr as *const AtomicU64);
    let high = &*((addr + 8) as *const AtomicU64);

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        assert!(
            attempts <= CAS_RETRY_LIMIT,
            "pair cas emulation failed to converge at {addr:#x}"
        );
        let l = low.load(Ordering::Acquire);
        let h = high.load(Ordering::Acquire);
        if l != expected[0] || h != expected[1] {
            if low.load(Ordering::Acquire) != l || high.load(Ordering::Acquire) != h {
                counters.torn_cas.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            return CasPairOutcome {
                loaded: [l, h],
                success: false,
            };
        }

        if low
            .compare_exchange(l, desired[0], Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            continue;
        }
        if desired[1] == h
            || high
                .compare_exchange(h, desired[1], Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return CasPairOutcome {
                loaded: expected,
                success: true,
            };
        }

        counters.torn_cas.fetch_add(1, Ordering::Relaxed);
        let _ = low.compare_exchange(desired[0], l, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// Emulates one read-modify-write from the atomic memory-op family,
/// returning the value observed before the update.
///
/// # Safety
/// Same contract as [`emulate_cas`].
pub unsafe fn emulate_atomic_mem(
    addr: usize,
    size_log2: u32,
    op: crate::decode::MemOp,
    operand: u64,
    counters: &TsoCounters,
) -> u64 {
    use crate::decode::MemOp;
    let mask = field_mask(size_log2);
    let operand = operand & mask;
    let mut attempts = 0u32;
    let mut cur = read_unaligned(addr, size_log2);
    loop {
        attempts += 1;
        assert!(
            attempts <= CAS_RETRY_LIMIT,
            "atomic memory-op emulation failed to converge at {addr:#x}"
        );
        let new = match op {
            MemOp::Add => cur.wrapping_add(operand),
            MemOp::Clr => cur & !operand,
            MemOp::Eor => cur ^ operand,
            MemOp::Set => cur | operand,
            MemOp::Swap => operand,
        } & mask;
        let outcome = emulate_cas(addr, size_log2, cur, new, counters);
        if outcome.success {
            return cur;
        }
        cur = outcome.loaded;
    }
}

/// # Safety
/// `[addr, addr + (1 << size_log2))` must be valid process memory.
pub unsafe fn read_unaligned(addr: usize, size_log2: u32) -> u64 {
    let mut buf = [0u8; 8];
    std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), 1 << size_log2);
    u64::from_le_bytes(buf)
}

/// # Safety
/// `[addr, addr + (1 << size_log2))` must be valid, writable process memory.
pub unsafe fn write_unaligned(addr: usize, size_log2: u32, value: u64) {
    let bytes = value.to_le_bytes();
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, 1 << size_log2);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_container_cas_preserves_neighbors() {
        let counters = TsoCounters::default();
        let mut buf = [0xAAAA_AAAA_AAAA_AAAAu64; 2];
        let addr = buf.as_mut_ptr() as usize + 2;

        let out = unsafe { emulate_cas(addr, 1, 0xAAAA, 0x1234, &counters) };
        assert!(out.success);
        assert_eq!(out.loaded, 0xAAAA);
        assert_eq!(buf[0], 0xAAAA_AAAA_1234_AAAA);
        assert_eq!(buf[1], 0xAAAA_AAAA_AAAA_AAAA);
    }

    #[test]
    fn crossing_cas_updates_both_containers() {
        let counters = TsoCounters::default();
        // 8-aligned backing so base + 6 crosses the first u64.
        let mut buf = [0u64; 4];
        let addr = buf.as_mut_ptr() as usize + 6;

        unsafe { write_unaligned(addr, 2, 0xDDCC_BBAA) };
        let out = unsafe { emulate_cas(addr, 2, 0xDDCC_BBAA, 0x0403_0201, &counters) };
        assert!(out.success);
        assert_eq!(unsafe { read_unaligned(addr, 2) }, 0x0403_0201);
    }

    #[test]
    fn failed_cas_reports_observed_value() {
        let counters = TsoCounters::default();
        let value: u64 = 0x55;
        let addr = &value as *const u64 as usize;
        let out = unsafe { emulate_cas(addr, 3, 0x77, 0x99, &counters) };
        assert!(!out.success);
        assert_eq!(out.loaded, 0x55);
        assert_eq!(value, 0x55);
    }

    #[test]
    fn atomic_mem_ops_apply_and_return_old() {
        let counters = TsoCounters::default();
        let mut cell: u64 = 0b1100;
        let addr = &mut cell as *mut u64 as usize;
        use crate::decode::MemOp;
        assert_eq!(
            unsafe { emulate_atomic_mem(addr, 2, MemOp::Set, 0b0011, &counters) },
            0b1100
        );
        assert_eq!(cell, 0b1111);
        assert_eq!(
            unsafe { emulate_atomic_mem(addr, 2, MemOp::Clr, 0b0101, &counters) },
            0b1111
        );
        assert_eq!(cell, 0b1010);
        assert_eq!(
            unsafe { emulate_atomic_mem(addr, 2, MemOp::Swap, 7, &counters) },
            0b1010
        );
        assert_eq!(cell, 7);
    }

    #[test]
    fn misaligned_pair_cas_uses_the_fallback_path() {
        let counters = TsoCounters::default();
        let fallback = SpinFutex::new();
        let mut buf = [0u64; 4];
        let addr = buf.as_mut_ptr() as usize + 3;

        unsafe {
            write_unaligned(addr, 3, 0x1111_2222_3333_4444);
            write_unaligned(addr + 8, 3, 0x5555_6666_7777_8888);
        }
        let out = unsafe {
            emulate_cas_pair(
                addr,
                [0x1111_2222_3333_4444, 0x5555_6666_7777_8888],
                [1, 2],
                &counters,
                &fallback,
            )
        };
        assert!(out.success);
        assert_eq!(unsafe { read_unaligned(addr, 3) }, 1);
        assert_eq!(unsafe { read_unaligned(addr + 8, 3) }, 2);
    }
}
