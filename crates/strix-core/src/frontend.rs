//! Decoder-facing interface.
//!
//! The per-opcode decode tables live outside this crate; the orchestrator
//! only consumes decoded-block descriptors.

/// Classification the orchestrator needs to place block boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnClass {
    /// Straight-line instruction with a dispatcher entry.
    Plain,
    /// No dispatcher entry exists for this opcode.
    Undefined,
    /// Ends the block with a statically known guest target.
    BranchTo(u64),
    /// Ends the block; the target is only known at run time.
    Exit,
}

#[derive(Debug, Clone)]
pub struct DecodedInstruction {
    pub guest: u64,
    /// Guest bytes live at decode time, kept for SMC validation checks.
    pub bytes: Vec<u8>,
    pub class: InsnClass,
}

impl DecodedInstruction {
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// One decoded guest region starting at `start`.
#[derive(Debug, Clone)]
pub struct DecodedBlock {
    pub start: u64,
    pub is_64bit: bool,
    pub insns: Vec<DecodedInstruction>,
}

impl DecodedBlock {
    /// Guest bytes covered by the decoded instructions.
    pub fn byte_len(&self) -> u64 {
        self.insns.iter().map(DecodedInstruction::len).sum()
    }
}

/// Instruction decoder seam.
///
/// Returns `None` when nothing at `guest` decodes at all; the orchestrator
/// turns that into a decode failure for the caller to raise as the guest's
/// invalid-opcode fault.
pub trait Frontend: Send + Sync {
    fn decode(&self, guest: u64, max_insns: usize) -> Option<DecodedBlock>;
}
