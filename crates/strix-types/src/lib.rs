#![forbid(unsafe_code)]

//! Shared constants for the strix dynamic-translation core.
//!
//! This crate exists so the lookup cache, the code generator, and the fault
//! handler agree on page geometry and cache sizing that must match exactly at
//! runtime.

/// 4KiB guest page shift used by the lookup cache and SMC tracking.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

/// Number of entries in each thread's L1 direct-mapped lookup tier.
///
/// 8k entries gives 128KiB of L1 per thread at 16 bytes per entry.
pub const L1_ENTRIES: usize = 8 * 1024;
pub const L1_INDEX_MASK: u64 = (L1_ENTRIES as u64) - 1;

const _: () = {
    assert!(L1_ENTRIES.is_power_of_two());
    assert!(L1_INDEX_MASK == (L1_ENTRIES as u64) - 1);
    assert!(PAGE_SIZE.is_power_of_two());
};

/// Default capacity of one executable code-buffer generation.
pub const DEFAULT_CODE_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Fragment starts are aligned so that exit-thunk patch sites land on a
/// 16-byte boundary, which the delink path relies on.
pub const FRAGMENT_ALIGN: usize = 16;

/// First and last guest page covered by `[start, start + len)`.
///
/// `len == 0` is treated as a one-byte range so that single-address
/// invalidation still touches the page containing `start`.
pub fn page_span(start: u64, len: u64) -> (u64, u64) {
    let last = start + len.max(1) - 1;
    (start >> PAGE_SHIFT, last >> PAGE_SHIFT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_span_covers_partial_pages() {
        assert_eq!(page_span(0x1000, 1), (1, 1));
        assert_eq!(page_span(0x1fff, 2), (1, 2));
        assert_eq!(page_span(0x1000, 0x2000), (1, 2));
        assert_eq!(page_span(0x1234, 0), (1, 1));
    }
}
