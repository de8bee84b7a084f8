//! Block-level IR handed from the orchestrator to the passes and the
//! lowering seam.
//!
//! The per-operation IR inside `Insn` is opaque to this crate; the
//! orchestrator only materializes the block structure and the edge
//! operations it owns (SMC validation, traps, exits).

use bitflags::bitflags;

use crate::frontend::DecodedInstruction;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u32 {
        /// Compiled in 64-bit guest mode.
        const MODE_64 = 1 << 0;
        /// Each instruction is preceded by a live-byte equality check.
        const SMC_CHECKED = 1 << 1;
        /// One-instruction trap-flag block; never cached.
        const SINGLE_STEP = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    UndefinedInstruction,
    SingleStep,
}

#[derive(Debug, Clone)]
pub enum IrOp {
    /// Compare the guest bytes at `guest` against `expected`; on mismatch the
    /// block exits through the SMC trampoline, which erases this block's
    /// cache entry before re-dispatching.
    ValidateCode { guest: u64, expected: Vec<u8> },
    /// One translated guest instruction.
    Insn(DecodedInstruction),
    /// Raise a guest trap at `guest`.
    Trap { guest: u64, kind: TrapKind },
    /// Leave the block. `Some` targets are eligible for block linking.
    ExitTo { guest_dest: Option<u64> },
}

#[derive(Debug, Clone)]
pub struct IrBlock {
    pub entry: u64,
    pub guest_len: u64,
    pub flags: BlockFlags,
    pub ops: Vec<IrOp>,
}

/// One optimization or legalization pass. Bodies are external; the
/// orchestrator only sequences them.
pub trait Pass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, block: &mut IrBlock);
}

#[derive(Default)]
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
}

impl PassManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    pub fn run(&self, block: &mut IrBlock) {
        for pass in &self.passes {
            let _span = tracing::trace_span!("pass", name = pass.name()).entered();
            pass.run(block);
        }
    }
}
