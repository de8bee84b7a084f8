//! In-place demotion of ordered accesses to plain ones.
//!
//! An ordered load or store that faults on alignment is rewritten into its
//! plain form plus an explicit barrier in the adjacent word, which the code
//! generator reserves as a `NOP` slot next to every ordered access. Loads
//! keep the barrier after the access, stores before it, so resuming at the
//! returned offset replays the full ordered sequence.
//!
//! Patching is one-way. A demoted site stays demoted for the lifetime of the
//! fragment; a second fault on the same word observes the rewrite and only
//! recomputes the resume offset.

use std::sync::atomic::{AtomicU32, Ordering};

use strix_backend::words::{
    self, DMB_ISH, DMB_ISHLD, LDR_INST, LDUR_INST, RCPC2_IMM9_MASK, STR_INST, STUR_INST,
};
use strix_backend::clear_icache;

use crate::decode::FaultingOp;

/// Replacement words for one faulting site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Demotion {
    Load {
        at_pc: u32,
        /// Barrier for the slot at `pc + 4`, absent in non-atomic mode.
        barrier_after: Option<u32>,
    },
    Store {
        at_pc: u32,
        /// Barrier for the slot at `pc - 4`, absent in non-atomic mode.
        barrier_before: Option<u32>,
    },
}

/// Computes the demoted form of an ordered access, `None` for anything that
/// has to be emulated instead.
pub(crate) fn demote(op: FaultingOp, instr: u32, with_barriers: bool) -> Option<Demotion> {
    match op {
        FaultingOp::OrderedLoad { size, rt, rn } => Some(Demotion::Load {
            at_pc: words::replace_with(LDR_INST, size, rn, rt),
            barrier_after: with_barriers.then_some(DMB_ISHLD),
        }),
        FaultingOp::OrderedStore { size, rt, rn } => Some(Demotion::Store {
            at_pc: words::replace_with(STR_INST, size, rn, rt),
            barrier_before: with_barriers.then_some(DMB_ISH),
        }),
        FaultingOp::RcpcLoad { size, rt, rn, .. } => Some(Demotion::Load {
            at_pc: words::replace_with(LDUR_INST, size, rn, rt) | (instr & RCPC2_IMM9_MASK),
            barrier_after: with_barriers.then_some(DMB_ISHLD),
        }),
        FaultingOp::RcpcStore { size, rt, rn, .. } => Some(Demotion::Store {
            at_pc: words::replace_with(STUR_INST, size, rn, rt) | (instr & RCPC2_IMM9_MASK),
            barrier_before: with_barriers.then_some(DMB_ISH),
        }),
        _ => None,
    }
}

/// Writes the demotion into the code and returns the resume offset relative
/// to the faulting word.
///
/// The barrier lands before the access word becomes visible, so a racing
/// thread never executes the plain access without its barrier in place.
///
/// # Safety
/// The caller holds the fragment's patch lock and `pc` points at the
/// faulting word inside that fragment, with the barrier slot adjacent.
pub(crate) unsafe fn apply(pc: usize, demotion: Demotion) -> i64 {
    let word_at = |addr: usize| &*(addr as *const AtomicU32);
    match demotion {
        Demotion::Load { at_pc, barrier_after } => {
            if let Some(barrier) = barrier_after {
                word_at(pc + 4).store(barrier, Ordering::Relaxed);
            }
            word_at(pc).store(at_pc, Ordering::Release);
            clear_icache(pc, 8);
            0
        }
        Demotion::Store { at_pc, barrier_before } => {
            let with_barrier = barrier_before.is_some();
            if let Some(barrier) = barrier_before {
                word_at(pc - 4).store(barrier, Ordering::Relaxed);
            }
            word_at(pc).store(at_pc, Ordering::Release);
            clear_icache(pc - 4, 8);
            if with_barrier {
                -4
            } else {
                0
            }
        }
    }
}

/// Resume offset for a site some other thread already rewrote.
///
/// # Safety
/// `pc` points into live fragment code with a valid preceding word.
pub(crate) unsafe fn already_patched_adjust(pc: usize) -> i64 {
    let before = (*(pc.wrapping_sub(4) as *const AtomicU32)).load(Ordering::Acquire);
    if before == DMB_ISH {
        -4
    } else {
        0
    }
}
