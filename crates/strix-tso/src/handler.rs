//! Alignment-fault dispatch.
//!
//! Generated code issues real atomic and ordered instructions; the hardware
//! raises a bus error when the guest hands one an address the host cannot
//! serve. This module decides, per faulting word, whether to emulate the
//! access in software or to demote the site in place, and reports how far to
//! move the program counter before resuming.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use strix_backend::FragmentTail;
use strix_sync::SpinFutex;
use tracing::{debug, error};

use crate::decode::{classify, FaultingOp};
use crate::emulate;
use crate::patch;

/// How ordered loads and stores are handled once one faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsoMode {
    /// Demote the faulting site to a plain access plus an explicit barrier.
    Patching,
    /// Never rewrite code; emulate every faulting access in software.
    Paranoid,
    /// Demote without barriers. Only sound for guests that never rely on
    /// cross-thread ordering of the patched sites.
    NonAtomic,
}

/// What the signal frame should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Resume at `pc + pc_adjust`. Emulated accesses adjust by one word,
    /// patched sites re-execute at the rewritten sequence.
    Handled { pc_adjust: i64 },
    /// Not ours; the fault should fall through to the default disposition.
    Unhandled,
}

/// General-purpose registers of the faulting frame. Index 31 reads as zero
/// and swallows writes.
#[derive(Debug, Clone)]
pub struct FaultRegs {
    pub gpr: [u64; 32],
}

impl FaultRegs {
    pub fn x(&self, r: u32) -> u64 {
        if r == 31 {
            0
        } else {
            self.gpr[r as usize]
        }
    }

    pub fn set_x(&mut self, r: u32, value: u64) {
        if r != 31 {
            self.gpr[r as usize] = value;
        }
    }
}

/// Event counters, readable at any time from any thread.
#[derive(Debug, Default)]
pub struct TsoCounters {
    /// Accesses completed in software.
    pub emulated: AtomicU64,
    /// Sites demoted in place.
    pub patched: AtomicU64,
    /// Torn two-container updates that were rolled back and retried.
    pub torn_cas: AtomicU64,
    /// Atomics that spanned a cacheline boundary.
    pub split_locks: AtomicU64,
    /// Pair compare-and-swaps among those splits.
    pub split_locks_16b: AtomicU64,
}

pub struct FaultHandler {
    mode: TsoMode,
    /// Serialize every split-lock atomic through one global lock, matching
    /// the bus-lock behavior the guest may depend on.
    strict_split_lock: bool,
    counters: TsoCounters,
    strict_lock: SpinFutex,
}

impl FaultHandler {
    pub fn new(mode: TsoMode, strict_split_lock: bool) -> Self {
        Self {
            mode,
            strict_split_lock,
            counters: TsoCounters::default(),
            strict_lock: SpinFutex::new(),
        }
    }

    pub fn mode(&self) -> TsoMode {
        self.mode
    }

    pub fn counters(&self) -> &TsoCounters {
        &self.counters
    }

    /// Handles one alignment fault at `pc`.
    ///
    /// `tail` is the record of the fragment containing `pc`, when known; it
    /// carries the patch lock. Without it, sites that would be patched are
    /// emulated instead.
    ///
    /// # Safety
    /// `pc` points at the faulting instruction word, the register file
    /// reflects the faulting frame, and any address in the involved base
    /// register maps valid guest memory.
    pub unsafe fn handle_fault(
        &self,
        pc: usize,
        regs: &mut FaultRegs,
        tail: Option<&FragmentTail>,
    ) -> FaultOutcome {
        let instr = (*(pc as *const AtomicU32)).load(Ordering::Acquire);
        match classify(instr) {
            FaultingOp::Cas { size, rs, rt, rn } => {
                let addr = regs.x(rn) as usize;
                let _split = self.split_lock_guard(addr, 1 << size);
                let out =
                    emulate::emulate_cas(addr, size, regs.x(rs), regs.x(rt), &self.counters);
                regs.set_x(rs, out.loaded);
                self.emulated()
            }
            FaultingOp::CasPair { size64, rs, rt, rn } => {
                let addr = regs.x(rn) as usize;
                if size64 {
                    // The misaligned path inside the pair emulation takes
                    // the strict lock itself, so only hold it here for the
                    // 8-aligned crossing case.
                    if emulate::crosses_cacheline(addr, 16) {
                        self.counters.split_locks.fetch_add(1, Ordering::Relaxed);
                        self.counters.split_locks_16b.fetch_add(1, Ordering::Relaxed);
                    }
                    let _split = (self.strict_split_lock
                        && addr & 7 == 0
                        && emulate::crosses_cacheline(addr, 16))
                    .then(|| self.strict_lock.lock());
                    let out = emulate::emulate_cas_pair(
                        addr,
                        [regs.x(rs), regs.x(rs + 1)],
                        [regs.x(rt), regs.x(rt + 1)],
                        &self.counters,
                        &self.strict_lock,
                    );
                    regs.set_x(rs, out.loaded[0]);
                    regs.set_x(rs + 1, out.loaded[1]);
                } else {
                    // A word-sized pair fits one 64-bit field.
                    let _split = self.split_lock_guard(addr, 8);
                    let expected = (regs.x(rs) & 0xFFFF_FFFF) | (regs.x(rs + 1) << 32);
                    let desired = (regs.x(rt) & 0xFFFF_FFFF) | (regs.x(rt + 1) << 32);
                    let out =
                        emulate::emulate_cas(addr, 3, expected, desired, &self.counters);
                    regs.set_x(rs, out.loaded & 0xFFFF_FFFF);
                    regs.set_x(rs + 1, out.loaded >> 32);
                }
                self.emulated()
            }
            FaultingOp::AtomicMem { size, op, rs, rt, rn } => {
                let addr = regs.x(rn) as usize;
                let _split = self.split_lock_guard(addr, 1 << size);
                let old =
                    emulate::emulate_atomic_mem(addr, size, op, regs.x(rs), &self.counters);
                regs.set_x(rt, old);
                self.emulated()
            }
            op @ (FaultingOp::OrderedLoad { .. } | FaultingOp::RcpcLoad { .. }) => {
                self.handle_ordered(pc, instr, op, regs, tail, true)
            }
            op @ (FaultingOp::OrderedStore { .. } | FaultingOp::RcpcStore { .. }) => {
                self.handle_ordered(pc, instr, op, regs, tail, false)
            }
            FaultingOp::Exclusive => {
                error!(pc = format_args!("{pc:#x}"), instr, "fault on exclusive form");
                FaultOutcome::Unhandled
            }
            FaultingOp::Unknown => {
                error!(pc = format_args!("{pc:#x}"), instr, "fault on unrecognized word");
                FaultOutcome::Unhandled
            }
        }
    }

    unsafe fn handle_ordered(
        &self,
        pc: usize,
        instr: u32,
        op: FaultingOp,
        regs: &mut FaultRegs,
        tail: Option<&FragmentTail>,
        is_load: bool,
    ) -> FaultOutcome {
        let tail = match tail {
            Some(t) if self.mode != TsoMode::Paranoid => t,
            _ => return self.emulate_ordered(op, regs, is_load),
        };

        let _guard = tail.lock_patch();
        let current = (*(pc as *const AtomicU32)).load(Ordering::Acquire);
        if current != instr {
            // Another thread got here first; only the resume offset is left
            // to compute.
            return FaultOutcome::Handled {
                pc_adjust: if is_load {
                    0
                } else {
                    patch::already_patched_adjust(pc)
                },
            };
        }

        let with_barriers = self.mode != TsoMode::NonAtomic;
        match patch::demote(op, instr, with_barriers) {
            Some(demotion) => {
                let pc_adjust = patch::apply(pc, demotion);
                self.counters.patched.fetch_add(1, Ordering::Relaxed);
                debug!(pc = format_args!("{pc:#x}"), pc_adjust, "demoted ordered access");
                FaultOutcome::Handled { pc_adjust }
            }
            None => FaultOutcome::Unhandled,
        }
    }

    unsafe fn emulate_ordered(
        &self,
        op: FaultingOp,
        regs: &mut FaultRegs,
        is_load: bool,
    ) -> FaultOutcome {
        let (size, rt, addr) = match op {
            FaultingOp::OrderedLoad { size, rt, rn }
            | FaultingOp::OrderedStore { size, rt, rn } => (size, rt, regs.x(rn) as usize),
            FaultingOp::RcpcLoad { size, rt, rn, imm9 }
            | FaultingOp::RcpcStore { size, rt, rn, imm9 } => {
                (size, rt, regs.x(rn).wrapping_add_signed(imm9) as usize)
            }
            _ => return FaultOutcome::Unhandled,
        };
        if is_load {
            let value = emulate::read_unaligned(addr, size);
            std::sync::atomic::fence(Ordering::Acquire);
            regs.set_x(rt, value);
        } else {
            std::sync::atomic::fence(Ordering::Release);
            emulate::write_unaligned(addr, size, regs.x(rt));
        }
        self.emulated()
    }

    fn emulated(&self) -> FaultOutcome {
        self.counters.emulated.fetch_add(1, Ordering::Relaxed);
        FaultOutcome::Handled { pc_adjust: 4 }
    }

    fn split_lock_guard(
        &self,
        addr: usize,
        bytes: usize,
    ) -> Option<strix_sync::RawSpinGuard<'_>> {
        if !emulate::crosses_cacheline(addr, bytes) {
            return None;
        }
        self.counters.split_locks.fetch_add(1, Ordering::Relaxed);
        self.strict_split_lock.then(|| self.strict_lock.lock())
    }
}
