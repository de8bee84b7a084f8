//! Execution dispatch and the runtime linker.

use strix_backend::{delink_exit, link_exit};
use tracing::trace;

use crate::ir::TrapKind;
use crate::orchestrator::{CompileError, Translator};
use crate::thread::ThreadContext;

/// How one pass through compiled code ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// Left through an unresolved exit trampoline with a static destination.
    Branch { thunk: usize, guest_dest: u64 },
    /// Left with a destination only known at run time.
    Dispatch { guest_dest: u64 },
    /// An SMC check inside the block at `stale` found changed bytes;
    /// execution resumes at `resume` after the block is invalidated.
    SmcMismatch { stale: u64, resume: u64 },
    Trap { guest: u64, kind: TrapKind },
    Suspended,
    Halt,
}

/// Owns the native call into compiled code. Implemented by the host-specific
/// entry shim; tests substitute a scripted double.
pub trait BlockRunner {
    fn run(&mut self, host_entry: usize, ctx: &ThreadContext) -> RunExit;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStop {
    Trap { guest: u64, kind: TrapKind },
    Suspended,
    Halt,
}

pub struct Dispatcher<'a> {
    translator: &'a Translator,
}

impl<'a> Dispatcher<'a> {
    pub fn new(translator: &'a Translator) -> Self {
        Self { translator }
    }

    /// Main execution loop: resolve or compile the block at `guest`, run it,
    /// and follow its exit.
    pub fn run(
        &self,
        ctx: &ThreadContext,
        runner: &mut dyn BlockRunner,
        mut guest: u64,
    ) -> Result<DispatchStop, CompileError> {
        loop {
            let host = self.translator.compile_block(ctx, guest)?.host;
            match runner.run(host, ctx) {
                RunExit::Branch { thunk, guest_dest } => {
                    self.link_exit_site(ctx, thunk, guest_dest)?;
                    guest = guest_dest;
                }
                RunExit::Dispatch { guest_dest } => guest = guest_dest,
                RunExit::SmcMismatch { stale, resume } => {
                    // The block observed its own staleness; everything after
                    // this point must be re-derived from current guest bytes.
                    self.translator.invalidate_block(stale);
                    guest = resume;
                }
                RunExit::Trap { guest, kind } => return Ok(DispatchStop::Trap { guest, kind }),
                RunExit::Suspended => return Ok(DispatchStop::Suspended),
                RunExit::Halt => return Ok(DispatchStop::Halt),
            }
        }
    }

    /// Runtime-linker entry: compile or find `dest`, then patch the exit
    /// trampoline at `thunk` to reach it directly.
    ///
    /// Linking is refused while the thread's trap flag is set; a single-step
    /// thread must come back through the dispatcher after every block.
    pub fn link_exit_site(
        &self,
        ctx: &ThreadContext,
        thunk: usize,
        dest: u64,
    ) -> Result<usize, CompileError> {
        let host = self.translator.compile_block(ctx, dest)?.host;
        if ctx.single_step() {
            trace!(dest = format_args!("{dest:#x}"), "trap flag set, leaving exit unlinked");
            return Ok(host);
        }

        // Invalidation cannot remove the target while we hold the read side;
        // the patch itself serializes under the map's write lock.
        let _inv = self.translator.invalidation().read();
        let gen = self.translator.current_generation();
        let mut inner = gen.map.write();
        if let Some(target) = inner.find_block(dest) {
            unsafe { link_exit(thunk, target) };
            inner.add_block_link(dest, thunk, delink_exit);
            return Ok(target);
        }
        // Invalidated between compile and patch; the next execution of the
        // trampoline re-enters the linker.
        Ok(host)
    }
}
