//! Instruction-cache maintenance after code patching.

/// Makes patched code bytes in `[start, start + len)` visible to the
/// instruction stream.
#[cfg(target_arch = "aarch64")]
pub fn clear_icache(start: usize, len: usize) {
    // Conservative 64-byte line size; over-flushing is harmless.
    const LINE: usize = 64;
    let end = start + len;
    unsafe {
        let mut addr = start & !(LINE - 1);
        while addr < end {
            core::arch::asm!("dc cvau, {0}", in(reg) addr, options(nostack, preserves_flags));
            addr += LINE;
        }
        core::arch::asm!("dsb ish", options(nostack, preserves_flags));
        let mut addr = start & !(LINE - 1);
        while addr < end {
            core::arch::asm!("ic ivau, {0}", in(reg) addr, options(nostack, preserves_flags));
            addr += LINE;
        }
        core::arch::asm!("dsb ish", "isb", options(nostack, preserves_flags));
    }
}

#[cfg(not(target_arch = "aarch64"))]
pub fn clear_icache(_start: usize, _len: usize) {
    // Patches are plain memory on hosts without a split icache model in this
    // build; a compiler fence keeps the stores ordered for observers.
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}
