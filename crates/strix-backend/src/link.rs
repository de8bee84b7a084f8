//! Exit-site linking and delinking.
//!
//! Every block exit ends in a 16-byte trampoline:
//!
//! ```text
//!   ldr  x16, #8        ; load the literal below
//!   blr  x16            ; enter the runtime linker
//!   .quad <linker>      ; out-of-line 64-bit target slot
//! ```
//!
//! Linking patches the site in place. A near target replaces the first word
//! with a direct `B`; a far target is stored into the literal slot, after
//! which the unchanged `ldr`/`blr` pair transfers straight to the block
//! (blocks never return, so the clobbered link register is dead). Both forms
//! are single word-sized or doubleword-sized atomic stores, so threads
//! executing through the site concurrently observe either the old or the new
//! target, never a torn word.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use tracing::trace;

use crate::icache::clear_icache;
use crate::words;

/// Byte size of one exit trampoline.
pub const THUNK_SIZE: usize = 16;

/// Offset of the out-of-line target slot within the trampoline.
pub const THUNK_SLOT_OFFSET: usize = 8;

static RUNTIME_LINKER: AtomicUsize = AtomicUsize::new(0);

/// Registers the runtime linker entry point fresh trampolines call into.
pub fn set_runtime_linker(addr: usize) {
    RUNTIME_LINKER.store(addr, Ordering::Release);
}

pub(crate) fn runtime_linker() -> usize {
    RUNTIME_LINKER.load(Ordering::Acquire)
}

/// The first trampoline word in its unlinked state: `ldr x16, #8`.
pub(crate) fn unlinked_first_word() -> u32 {
    words::ldr_literal_x(16, THUNK_SLOT_OFFSET as i64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// The first word became a direct `B`.
    Direct,
    /// The target was stored into the out-of-line slot.
    Indirect,
}

/// `true` if `target` is reachable from `thunk` with a direct branch.
pub fn would_link_direct(thunk: usize, target: usize) -> bool {
    words::is_int26(target as i64 - thunk as i64)
}

/// Patches the trampoline at `thunk` to transfer to `target`.
///
/// # Safety
/// `thunk` must be a live, 16-aligned trampoline emitted by this backend, and
/// the caller must hold the shared map's invalidation lock so no concurrent
/// delink races the patch.
pub unsafe fn link_exit(thunk: usize, target: usize) -> LinkKind {
    debug_assert_eq!(thunk % THUNK_SIZE, 0);
    let offset = target as i64 - thunk as i64;
    let kind = match words::b(offset) {
        Some(branch) => {
            (*(thunk as *const AtomicU32)).store(branch, Ordering::SeqCst);
            clear_icache(thunk, 4);
            LinkKind::Direct
        }
        None => {
            (*((thunk + THUNK_SLOT_OFFSET) as *const AtomicU64))
                .store(target as u64, Ordering::SeqCst);
            clear_icache(thunk + THUNK_SLOT_OFFSET, 8);
            LinkKind::Indirect
        }
    };
    trace!(thunk = format_args!("{thunk:#x}"), target = format_args!("{target:#x}"), ?kind, "linked exit");
    kind
}

/// Restores the trampoline at `thunk` to its unlinked state.
///
/// Matches the shared map's delink callback signature, so the address doubles
/// as the link-slot key. The literal is restored first; the release store of
/// the first word is the publication point, after which a thread running
/// through the site re-enters the linker.
///
/// # Safety
/// Same contract as [`link_exit`]; additionally runs with the shared map
/// write lock held.
pub unsafe fn delink_exit(thunk: usize) {
    debug_assert_eq!(thunk % THUNK_SIZE, 0);
    (*((thunk + THUNK_SLOT_OFFSET) as *const AtomicU64))
        .store(runtime_linker() as u64, Ordering::Relaxed);
    (*(thunk as *const AtomicU32)).store(unlinked_first_word(), Ordering::Release);
    clear_icache(thunk, THUNK_SIZE);
    trace!(thunk = format_args!("{thunk:#x}"), "delinked exit");
}
