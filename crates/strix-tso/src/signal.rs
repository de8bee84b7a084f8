//! `SIGBUS` plumbing on Linux hosts.
//!
//! The kernel delivers alignment faults from generated code as `SIGBUS`.
//! The installed action pulls the register file out of the signal frame,
//! hands it to the process-wide [`FaultHandler`], writes the (possibly
//! updated) registers back, and moves the program counter by the reported
//! adjustment. Faults the handler disowns are re-raised with the default
//! disposition so crashes keep their ordinary core dumps.

use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use strix_backend::FragmentTail;

use crate::handler::{FaultHandler, FaultOutcome, FaultRegs};

/// Maps a faulting host address to the record of its containing fragment,
/// or `None` when the fault is outside generated code.
pub type TailResolver = fn(pc: usize) -> Option<&'static FragmentTail>;

static HANDLER: AtomicUsize = AtomicUsize::new(0);
static RESOLVER: AtomicUsize = AtomicUsize::new(0);

/// Installs the process-wide `SIGBUS` action.
///
/// # Safety
/// The caller owns signal disposition for this process, and `handler` stays
/// valid for the life of the process.
pub unsafe fn install(
    handler: &'static FaultHandler,
    resolve_tail: TailResolver,
) -> io::Result<()> {
    HANDLER.store(handler as *const FaultHandler as usize, Ordering::Release);
    RESOLVER.store(resolve_tail as usize, Ordering::Release);

    let mut act: libc::sigaction = mem::zeroed();
    act.sa_sigaction = on_sigbus as usize;
    act.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER | libc::SA_ONSTACK;
    libc::sigemptyset(&mut act.sa_mask);
    if libc::sigaction(libc::SIGBUS, &act, ptr::null_mut()) != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

unsafe fn reraise_default() {
    let mut act: libc::sigaction = mem::zeroed();
    act.sa_sigaction = libc::SIG_DFL;
    libc::sigemptyset(&mut act.sa_mask);
    libc::sigaction(libc::SIGBUS, &act, ptr::null_mut());
    // Returning re-executes the faulting instruction under SIG_DFL.
}

extern "C" fn on_sigbus(_sig: i32, _info: *mut libc::siginfo_t, uc: *mut libc::c_void) {
    unsafe {
        let handler = HANDLER.load(Ordering::Acquire) as *const FaultHandler;
        if handler.is_null() {
            reraise_default();
            return;
        }

        let uc = &mut *(uc as *mut libc::ucontext_t);
        let mc = &mut uc.uc_mcontext;
        let pc = mc.pc as usize;

        let mut regs = FaultRegs { gpr: [0; 32] };
        regs.gpr[..31].copy_from_slice(&mc.regs);

        let resolver_addr = RESOLVER.load(Ordering::Acquire);
        let tail = if resolver_addr == 0 {
            None
        } else {
            let resolver: TailResolver = mem::transmute(resolver_addr);
            resolver(pc)
        };

        match (*handler).handle_fault(pc, &mut regs, tail) {
            FaultOutcome::Handled { pc_adjust } => {
                mc.regs.copy_from_slice(&regs.gpr[..31]);
                mc.pc = (pc as i64 + pc_adjust) as u64;
            }
            FaultOutcome::Unhandled => reraise_default(),
        }
    }
}
