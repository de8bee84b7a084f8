use std::sync::atomic::Ordering;
use std::thread;

use strix_backend::words::{ATOMIC_MEM_INST, CASAL_INST, CASPAL_INST, NOP, STLR_INST};
use strix_backend::FragmentTail;
use strix_sync::SpinFutex;
use strix_tso::{
    crosses_cacheline, emulate_atomic_mem, emulate_cas_pair, read_unaligned, write_unaligned,
    FaultHandler, FaultOutcome, FaultRegs, MemOp, TsoCounters, TsoMode,
};

fn regs() -> FaultRegs {
    FaultRegs { gpr: [0; 32] }
}

#[test]
fn hostile_alignment_increments_are_not_lost() {
    // Each case straddles a 64-bit container boundary, the two-swap path
    // with tear rollback.
    for (size_log2, offset) in [(1u32, 7usize), (2, 5), (3, 3)] {
        let counters = TsoCounters::default();
        let mut backing = vec![0u64; 8];
        let addr = backing.as_mut_ptr() as usize + offset;
        assert!((addr & 7) + (1 << size_log2) > 8, "case is not crossing");

        let threads = 4;
        let iters = 10_000u64;
        thread::scope(|s| {
            for _ in 0..threads {
                s.spawn(|| {
                    for _ in 0..iters {
                        unsafe {
                            emulate_atomic_mem(addr, size_log2, MemOp::Add, 1, &counters);
                        }
                    }
                });
            }
        });

        let total = threads as u64 * iters;
        assert_eq!(
            unsafe { read_unaligned(addr, size_log2) },
            total & ((1u128 << (8 << size_log2)) - 1) as u64,
            "lost updates at size_log2={size_log2} offset={offset}"
        );
        // Neighboring bytes were never touched.
        assert_eq!(unsafe { read_unaligned(addr - 1, 0) }, 0);
        assert_eq!(unsafe { read_unaligned(addr + (1 << size_log2), 0) }, 0);
    }
}

#[test]
fn split_pair_cas_increments_are_not_lost() {
    // The pair halves carry a checkable relation so a torn commit can never
    // masquerade as a successful one.
    fn tag(n: u64) -> u64 {
        n.wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }

    let counters = TsoCounters::default();
    let fallback = SpinFutex::new();
    let mut backing = vec![0u64; 24];
    let base = backing.as_mut_ptr() as usize;
    // 56 past a line start: 8-aligned but spanning the 64-byte boundary, the
    // dual-swap path with tear rollback.
    let aligned = (base + 63) & !63;
    let addr = aligned + 56;
    assert!(crosses_cacheline(addr, 16));
    assert_eq!(addr & 7, 0);

    let threads = 4;
    let iters = 5_000u64;
    thread::scope(|s| {
        for _ in 0..threads {
            s.spawn(|| {
                let mut cur = unsafe { [read_unaligned(addr, 3), read_unaligned(addr + 8, 3)] };
                let mut done = 0u64;
                while done < iters {
                    if cur[1] != tag(cur[0]) {
                        // Mid-commit window of another thread; wait for it to
                        // finish rather than swapping from a torn snapshot.
                        std::hint::spin_loop();
                        cur = unsafe { [read_unaligned(addr, 3), read_unaligned(addr + 8, 3)] };
                        continue;
                    }
                    let next = cur[0] + 1;
                    let out = unsafe {
                        emulate_cas_pair(addr, cur, [next, tag(next)], &counters, &fallback)
                    };
                    if out.success {
                        done += 1;
                        cur = [next, tag(next)];
                    } else {
                        cur = out.loaded;
                    }
                }
            });
        }
    });

    let total = threads as u64 * iters;
    assert_eq!(unsafe { read_unaligned(addr, 3) }, total, "lost pair updates");
    assert_eq!(unsafe { read_unaligned(addr + 8, 3) }, tag(total), "torn final pair");
    // Neighboring bytes were never touched.
    assert_eq!(unsafe { read_unaligned(addr - 1, 0) }, 0);
    assert_eq!(unsafe { read_unaligned(addr + 16, 0) }, 0);
}

#[test]
fn cas_through_the_handler_updates_registers_and_memory() {
    let handler = FaultHandler::new(TsoMode::Patching, false);
    let mut data = [0u64; 2];
    let addr = data.as_mut_ptr() as usize + 1;
    unsafe { write_unaligned(addr, 2, 0xDDEE_FF00) };

    // CASAL w5, w7, [x1], word size.
    let code = [CASAL_INST | (2 << 30) | (5 << 16) | (1 << 5) | 7];
    let pc = code.as_ptr() as usize;

    let mut r = regs();
    r.gpr[1] = addr as u64;
    r.gpr[5] = 0xDDEE_FF00;
    r.gpr[7] = 0x1234_5678;
    let out = unsafe { handler.handle_fault(pc, &mut r, None) };
    assert_eq!(out, FaultOutcome::Handled { pc_adjust: 4 });
    assert_eq!(unsafe { read_unaligned(addr, 2) }, 0x1234_5678);
    assert_eq!(r.gpr[5], 0xDDEE_FF00);
    assert_eq!(handler.counters().emulated.load(Ordering::Relaxed), 1);

    // A failing compare loads the observed value and leaves memory alone.
    r.gpr[5] = 0;
    let out = unsafe { handler.handle_fault(pc, &mut r, None) };
    assert_eq!(out, FaultOutcome::Handled { pc_adjust: 4 });
    assert_eq!(unsafe { read_unaligned(addr, 2) }, 0x1234_5678);
    assert_eq!(r.gpr[5], 0x1234_5678);
}

#[test]
fn atomic_memory_ops_through_the_handler() {
    let handler = FaultHandler::new(TsoMode::Patching, false);
    let mut data = [0u64; 2];
    let addr = data.as_mut_ptr() as usize + 3;
    unsafe { write_unaligned(addr, 2, 0b1100) };

    // LDADD w5, w7, [x1]: rs=5 operand, rt=7 receives the old value.
    let ldadd = ATOMIC_MEM_INST | (2 << 30) | (5 << 16) | (1 << 5) | 7;
    let swp = ATOMIC_MEM_INST | (2 << 30) | (5 << 16) | (0b1000 << 12) | (1 << 5) | 7;
    let code = [ldadd, swp];
    let base = code.as_ptr() as usize;

    let mut r = regs();
    r.gpr[1] = addr as u64;
    r.gpr[5] = 3;
    let out = unsafe { handler.handle_fault(base, &mut r, None) };
    assert_eq!(out, FaultOutcome::Handled { pc_adjust: 4 });
    assert_eq!(r.gpr[7], 0b1100);
    assert_eq!(unsafe { read_unaligned(addr, 2) }, 0b1111);

    r.gpr[5] = 42;
    let out = unsafe { handler.handle_fault(base + 4, &mut r, None) };
    assert_eq!(out, FaultOutcome::Handled { pc_adjust: 4 });
    assert_eq!(r.gpr[7], 0b1111);
    assert_eq!(unsafe { read_unaligned(addr, 2) }, 42);
}

#[test]
fn split_lock_pair_cas_is_counted_and_correct() {
    let handler = FaultHandler::new(TsoMode::Patching, true);
    let mut backing = vec![0u8; 192];
    // 61 past a line start: spans the 64-byte boundary and is not 8-aligned,
    // the worst case.
    let base = backing.as_mut_ptr() as usize;
    let aligned = (base + 63) & !63;
    let addr = aligned + 61;
    unsafe {
        write_unaligned(addr, 3, 0x1111_2222_3333_4444);
        write_unaligned(addr + 8, 3, 0x5555_6666_7777_8888);
    }

    // CASPAL x2, x4, [x1].
    let code = [CASPAL_INST | (1 << 30) | (2 << 16) | (1 << 5) | 4];
    let mut r = regs();
    r.gpr[1] = addr as u64;
    r.gpr[2] = 0x1111_2222_3333_4444;
    r.gpr[3] = 0x5555_6666_7777_8888;
    r.gpr[4] = 1;
    r.gpr[5] = 2;

    let out = unsafe { handler.handle_fault(code.as_ptr() as usize, &mut r, None) };
    assert_eq!(out, FaultOutcome::Handled { pc_adjust: 4 });
    assert_eq!(unsafe { read_unaligned(addr, 3) }, 1);
    assert_eq!(unsafe { read_unaligned(addr + 8, 3) }, 2);
    assert_eq!(r.gpr[2], 0x1111_2222_3333_4444);
    assert_eq!(r.gpr[3], 0x5555_6666_7777_8888);
    assert_eq!(handler.counters().split_locks.load(Ordering::Relaxed), 1);
    assert_eq!(handler.counters().split_locks_16b.load(Ordering::Relaxed), 1);
}

#[test]
fn word_pair_cas_packs_into_one_container() {
    let handler = FaultHandler::new(TsoMode::Patching, false);
    let mut data = [0u64; 2];
    let addr = data.as_mut_ptr() as usize + 2;
    unsafe { write_unaligned(addr, 3, 0xBBBB_BBBB_AAAA_AAAA) };

    // CASP w2, w4, [x1], word-sized pair.
    let code = [CASPAL_INST | (2 << 16) | (1 << 5) | 4];
    let mut r = regs();
    r.gpr[1] = addr as u64;
    r.gpr[2] = 0xAAAA_AAAA;
    r.gpr[3] = 0xBBBB_BBBB;
    r.gpr[4] = 0x1111_1111;
    r.gpr[5] = 0x2222_2222;

    let out = unsafe { handler.handle_fault(code.as_ptr() as usize, &mut r, None) };
    assert_eq!(out, FaultOutcome::Handled { pc_adjust: 4 });
    assert_eq!(unsafe { read_unaligned(addr, 3) }, 0x2222_2222_1111_1111);
}

#[test]
fn paranoid_mode_emulates_without_touching_code() {
    let handler = FaultHandler::new(TsoMode::Paranoid, false);
    let mut data = [0u8; 16];
    let addr = data.as_mut_ptr() as usize + 3;

    // STLR w7, [x1] between its barrier slots.
    let stlr = STLR_INST | (2 << 30) | (1 << 5) | 7;
    let code = [NOP, stlr, NOP];
    let pc = code.as_ptr() as usize + 4;
    let tail = FragmentTail::new(0x1000, 4, pc as u64 - 4, 12);

    let mut r = regs();
    r.gpr[1] = addr as u64;
    r.gpr[7] = 0xCAFE_F00D;
    let out = unsafe { handler.handle_fault(pc, &mut r, Some(&tail)) };
    assert_eq!(out, FaultOutcome::Handled { pc_adjust: 4 });
    assert_eq!(unsafe { read_unaligned(addr, 2) }, 0xCAFE_F00D);
    assert_eq!(code, [NOP, stlr, NOP]);
    assert_eq!(handler.counters().patched.load(Ordering::Relaxed), 0);
    assert_eq!(handler.counters().emulated.load(Ordering::Relaxed), 1);
}

proptest::proptest! {
    #[test]
    fn cas_matches_a_sequential_reference(
        offset in 0usize..9,
        size_log2 in 0u32..4,
        initial in proptest::prelude::any::<u64>(),
        expected in proptest::prelude::any::<u64>(),
        desired in proptest::prelude::any::<u64>(),
    ) {
        use proptest::prelude::{prop_assert, prop_assert_eq};

        let counters = TsoCounters::default();
        let mut backing = [0u64; 3];
        let addr = backing.as_mut_ptr() as usize + offset;
        unsafe { write_unaligned(addr, size_log2, initial) };

        let mask = if size_log2 >= 3 {
            u64::MAX
        } else {
            (1u64 << (8 << size_log2)) - 1
        };
        let out =
            unsafe { strix_tso::emulate_cas(addr, size_log2, expected, desired, &counters) };
        if initial & mask == expected & mask {
            prop_assert!(out.success);
            prop_assert_eq!(out.loaded, expected & mask);
            prop_assert_eq!(unsafe { read_unaligned(addr, size_log2) }, desired & mask);
        } else {
            prop_assert!(!out.success);
            prop_assert_eq!(out.loaded, initial & mask);
            prop_assert_eq!(unsafe { read_unaligned(addr, size_log2) }, initial & mask);
        }
    }
}

#[test]
fn unrecognized_faults_are_disowned() {
    let handler = FaultHandler::new(TsoMode::Patching, false);
    let code = [NOP];
    let mut r = regs();
    let out = unsafe { handler.handle_fault(code.as_ptr() as usize, &mut r, None) };
    assert_eq!(out, FaultOutcome::Unhandled);
}
