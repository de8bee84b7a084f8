//! Classification of faulting host instruction words.

use strix_backend::words::{
    self, ATOMIC_MEM_INST, ATOMIC_MEM_MASK, CASAL_INST, CASAL_MASK, CASPAL_INST, CASPAL_MASK,
    LDAPR_INST, LDAPUR_INST, LDAR_INST, LDAXP_INST, LDAXP_MASK, LDAXR_INST, LDAXR_MASK,
    RCPC2_MASK, STLR_INST, STLUR_INST, STLXP_INST, STLXP_MASK, STLXR_INST, STLXR_MASK,
};

/// Read-modify-write operation selected by an atomic memory-op encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOp {
    Add,
    /// Bit clear (`and !operand`).
    Clr,
    Eor,
    /// Bit set (`or operand`).
    Set,
    Swap,
}

/// What faulted, with the register fields the emulator needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultingOp {
    /// Single-register compare-and-swap (`CASAL`). `rs` holds expected and
    /// receives the loaded value; `rt` holds the replacement.
    Cas { size: u32, rs: u32, rt: u32, rn: u32 },
    /// Pair compare-and-swap (`CASPAL`), the guest 128-bit CAS.
    CasPair { size64: bool, rs: u32, rt: u32, rn: u32 },
    /// One of the `LDADD`/`LDCLR`/`LDEOR`/`LDSET`/`SWP` family.
    AtomicMem { size: u32, op: MemOp, rs: u32, rt: u32, rn: u32 },
    /// `LDAR`/`LDAPR` style acquire load.
    OrderedLoad { size: u32, rt: u32, rn: u32 },
    /// `STLR` style release store.
    OrderedStore { size: u32, rt: u32, rn: u32 },
    /// RCpc2 unscaled acquire load (`LDAPUR`).
    RcpcLoad { size: u32, rt: u32, rn: u32, imm9: i64 },
    /// RCpc2 unscaled release store (`STLUR`).
    RcpcStore { size: u32, rt: u32, rn: u32, imm9: i64 },
    /// Exclusive-monitor forms; only ever emitted inside expanded CAS loops
    /// whose CAS form is what actually faults, so these are not emulated.
    Exclusive,
    Unknown,
}

fn imm9(instr: u32) -> i64 {
    let raw = ((instr >> 12) & 0x1FF) as i64;
    (raw << 55) >> 55
}

pub fn classify(instr: u32) -> FaultingOp {
    let size = words::size_field(instr);
    let rn = words::addr_reg(instr);
    let rt = words::data_reg(instr);
    let rs = (instr >> 16) & 0x1F;

    if instr & CASPAL_MASK == CASPAL_INST {
        return FaultingOp::CasPair {
            size64: (instr >> 30) & 1 == 1,
            rs,
            rt,
            rn,
        };
    }
    if instr & CASAL_MASK == CASAL_INST {
        return FaultingOp::Cas { size, rs, rt, rn };
    }
    if instr & ATOMIC_MEM_MASK == ATOMIC_MEM_INST {
        let op = match (instr >> 12) & 0xF {
            0b0000 => MemOp::Add,
            0b0001 => MemOp::Clr,
            0b0010 => MemOp::Eor,
            0b0011 => MemOp::Set,
            0b1000 => MemOp::Swap,
            _ => return FaultingOp::Unknown,
        };
        return FaultingOp::AtomicMem {
            size,
            op,
            rs,
            rt,
            rn,
        };
    }
    if instr & RCPC2_MASK == LDAPUR_INST {
        return FaultingOp::RcpcLoad {
            size,
            rt,
            rn,
            imm9: imm9(instr),
        };
    }
    if instr & RCPC2_MASK == STLUR_INST {
        return FaultingOp::RcpcStore {
            size,
            rt,
            rn,
            imm9: imm9(instr),
        };
    }
    if instr & LDAXP_MASK == LDAXP_INST || instr & STLXP_MASK == STLXP_INST {
        return FaultingOp::Exclusive;
    }
    if instr & LDAXR_MASK == LDAXR_INST || instr & LDAXR_MASK == LDAPR_INST {
        return FaultingOp::Exclusive;
    }
    if instr & LDAXR_MASK == LDAR_INST {
        return FaultingOp::OrderedLoad { size, rt, rn };
    }
    if instr & LDAXR_MASK == STLR_INST {
        return FaultingOp::OrderedStore { size, rt, rn };
    }
    if instr & STLXR_MASK == STLXR_INST {
        return FaultingOp::Exclusive;
    }
    FaultingOp::Unknown
}
