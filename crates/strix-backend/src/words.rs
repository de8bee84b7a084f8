//! Host instruction word encodings.
//!
//! Everything that patches, decodes, or rewrites generated code goes through
//! this module so the bit patterns live in exactly one place. Mask/value
//! pairs follow the usual convention: `word & MASK == INST` classifies the
//! word.

/// Unconditional branch, `B #imm26`.
pub const B_INST: u32 = 0x1400_0000;
pub const B_MASK: u32 = 0xFC00_0000;

/// `BLR x16`.
pub const BLR_X16: u32 = 0xD63F_0200;

/// `NOP`.
pub const NOP: u32 = 0xD503_201F;

/// Full-barrier `DMB ISH`.
pub const DMB_ISH: u32 = 0xD503_3BBF;
/// Load-barrier `DMB ISHLD`.
pub const DMB_ISHLD: u32 = 0xD503_3DBF;

/// Compare-and-swap pair, acquire-release (`CASPAL`).
pub const CASPAL_MASK: u32 = 0xBFE0_FC00;
pub const CASPAL_INST: u32 = 0x0860_FC00;

/// Compare-and-swap, acquire-release (`CASAL`).
pub const CASAL_MASK: u32 = 0x3FE0_FC00;
pub const CASAL_INST: u32 = 0x08E0_FC00;

/// The atomic memory-op family (`LDADD`, `LDCLR`, `SWP`, ...).
pub const ATOMIC_MEM_MASK: u32 = 0x3B20_0C00;
pub const ATOMIC_MEM_INST: u32 = 0x3820_0000;

/// RCpc2 unscaled acquire/release loads and stores.
pub const RCPC2_MASK: u32 = 0x3FE0_0C00;
pub const LDAPUR_INST: u32 = 0x1940_0000;
pub const STLUR_INST: u32 = 0x1900_0000;
/// RCpc2 immediates survive the rewrite untouched.
pub const RCPC2_IMM9_MASK: u32 = 0x1FF << 12;

/// Exclusive pair loads/stores.
pub const LDAXP_MASK: u32 = 0xBFFF_8000;
pub const LDAXP_INST: u32 = 0x887F_8000;
pub const STLXP_MASK: u32 = 0xBFE0_8000;
pub const STLXP_INST: u32 = 0x8820_8000;

/// Exclusive and ordered single-register loads.
pub const LDAXR_MASK: u32 = 0x3FFF_FC00;
pub const LDAXR_INST: u32 = 0x085F_FC00;
pub const LDAR_INST: u32 = 0x08DF_FC00;
pub const LDAPR_INST: u32 = 0x38BF_C000;
pub const STLR_INST: u32 = 0x089F_FC00;

pub const STLXR_MASK: u32 = 0x3FE0_FC00;
pub const STLXR_INST: u32 = 0x0800_FC00;

/// Plain register-offset loads/stores (the demotion targets).
pub const LDSTREGISTER_MASK: u32 = 0x3B20_0C00;
pub const LDR_INST: u32 = 0x387F_6800;
pub const STR_INST: u32 = 0x383F_6800;

/// Plain unscaled-immediate loads/stores.
pub const LDSTUNSCALED_MASK: u32 = 0x3B20_0C00;
pub const LDUR_INST: u32 = 0x3840_0000;
pub const STUR_INST: u32 = 0x3800_0000;

/// `CBNZ`.
pub const CBNZ_INST: u32 = 0x3500_0000;

/// Extracts the size field (bits 31:30): 0 = byte, 1 = half, 2 = word,
/// 3 = doubleword.
pub fn size_field(word: u32) -> u32 {
    word >> 30
}

/// Address base register, bits 9:5.
pub fn addr_reg(word: u32) -> u32 {
    (word >> 5) & 0x1F
}

/// Data register, bits 4:0.
pub fn data_reg(word: u32) -> u32 {
    word & 0x1F
}

/// Builds a demoted replacement word from a base encoding and the fields of
/// the faulting instruction.
pub fn replace_with(base: u32, size: u32, addr: u32, data: u32) -> u32 {
    base | (size << 30) | (addr << 5) | data
}

/// `true` if `offset_bytes` fits the signed 26-bit word displacement of `B`.
pub fn is_int26(offset_bytes: i64) -> bool {
    offset_bytes % 4 == 0 && (-(1 << 27)..(1 << 27)).contains(&offset_bytes)
}

/// Encodes `B` with a byte displacement. Returns `None` when out of range.
pub fn b(offset_bytes: i64) -> Option<u32> {
    if !is_int26(offset_bytes) {
        return None;
    }
    let imm26 = ((offset_bytes / 4) as u32) & 0x03FF_FFFF;
    Some(B_INST | imm26)
}

/// Encodes `LDR Xt, #imm19` (PC-relative literal, byte offset).
pub fn ldr_literal_x(rt: u32, offset_bytes: i64) -> u32 {
    debug_assert!(offset_bytes % 4 == 0);
    debug_assert!((-(1 << 20)..(1 << 20)).contains(&offset_bytes));
    let imm19 = ((offset_bytes / 4) as u32) & 0x7_FFFF;
    0x5800_0000 | (imm19 << 5) | rt
}

/// Encodes `STR Xt, [Xn, #imm]` with an 8-byte-scaled unsigned immediate.
pub fn str_x_imm(rt: u32, rn: u32, byte_offset: u32) -> u32 {
    debug_assert!(byte_offset % 8 == 0 && byte_offset / 8 < (1 << 12));
    0xF900_0000 | ((byte_offset / 8) << 10) | (rn << 5) | rt
}

/// Encodes `LDR Wt, [Xn, #imm]` with a 4-byte-scaled unsigned immediate.
pub fn ldr_w_imm(rt: u32, rn: u32, byte_offset: u32) -> u32 {
    debug_assert!(byte_offset % 4 == 0 && byte_offset / 4 < (1 << 12));
    0xB940_0000 | ((byte_offset / 4) << 10) | (rn << 5) | rt
}

/// Encodes `CBNZ Wt, #offset` with a byte displacement.
pub fn cbnz_w(rt: u32, offset_bytes: i64) -> u32 {
    debug_assert!(offset_bytes % 4 == 0);
    let imm19 = ((offset_bytes / 4) as u32) & 0x7_FFFF;
    CBNZ_INST | (imm19 << 5) | rt
}

/// Decodes the byte displacement of an encoded `B`.
pub fn b_offset(word: u32) -> i64 {
    debug_assert_eq!(word & B_MASK, B_INST);
    // Sign-extend the 26-bit word offset.
    let imm26 = (word & 0x03FF_FFFF) as i64;
    let ext = (imm26 << 38) >> 38;
    ext * 4
}
