//! The process-shared L3 map and its satellite records.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use strix_sync::{RwReadGuard, RwWriteGuard, WritePriorityRwLock};
use strix_types::page_span;

/// Reverts one patched exit site back to its unlinked trampoline form.
///
/// The argument is the host address of the out-of-line link slot the record
/// was registered with. Plain `fn` so the map never captures backend state;
/// the callback must not take any lock (it runs with the shared write lock
/// held).
pub type DelinkFn = unsafe fn(slot: usize);

/// Process-shared guest-to-host mapping for one code-buffer generation.
pub struct SharedMap {
    inner: WritePriorityRwLock<SharedMapInner>,
}

#[derive(Default)]
pub struct SharedMapInner {
    /// Guest entry address -> host code address.
    blocks: HashMap<u64, usize>,
    /// (guest destination, link-slot host address) -> delinker.
    ///
    /// Keyed so that all records targeting one guest address are contiguous;
    /// severing the links of an invalidated block is a range scan.
    links: BTreeMap<(u64, usize), DelinkFn>,
    /// Guest page -> guest entry addresses of blocks touching that page.
    code_pages: BTreeMap<u64, Vec<u64>>,
}

impl SharedMap {
    pub fn new() -> Self {
        Self {
            inner: WritePriorityRwLock::new(SharedMapInner::default()),
        }
    }

    pub fn read(&self) -> RwReadGuard<'_, SharedMapInner> {
        self.inner.read()
    }

    pub fn write(&self) -> RwWriteGuard<'_, SharedMapInner> {
        self.inner.write()
    }

    /// `true` while some thread holds the write side; used by assertions in
    /// callers that require the exclusive discipline.
    pub fn is_write_locked(&self) -> bool {
        self.inner.is_write_locked()
    }

    pub fn lock_before_fork(&self) {
        self.inner.lock_before_fork();
    }

    pub fn unlock_after_fork(&self) {
        self.inner.unlock_after_fork();
    }

    pub fn steal_and_drop_active_locks(&self) {
        self.inner.steal_and_drop_active_locks();
    }
}

impl Default for SharedMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedMapInner {
    /// Adds a guest -> host code mapping.
    ///
    /// Generally no previous entry exists. The one exception is the
    /// buffer-adoption race: if a thread adopts a newer code buffer whose map
    /// already contains this address, the earlier host block is simply left
    /// unreachable.
    pub fn add_block_mapping(&mut self, guest: u64, host: usize) {
        self.blocks.insert(guest, host);
    }

    pub fn find_block(&self, guest: u64) -> Option<usize> {
        self.blocks.get(&guest).copied()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Removes `guest` from the map, severing every link record that targets
    /// it. Returns `true` if anything was removed.
    pub fn erase(&mut self, guest: u64) -> bool {
        let range = (guest, 0usize)..=(guest, usize::MAX);
        let slots: Vec<(u64, usize)> = self.links.range(range).map(|(k, _)| *k).collect();
        for key in slots {
            if let Some(delinker) = self.links.remove(&key) {
                // Restore the trampoline before the mapping disappears.
                unsafe { delinker(key.1) };
            }
        }

        self.blocks.remove(&guest).is_some()
    }

    pub fn add_block_link(&mut self, guest_dest: u64, slot: usize, delinker: DelinkFn) {
        self.links.insert((guest_dest, slot), delinker);
    }

    /// `true` if any record still targets `guest`.
    pub fn has_links_to(&self, guest: u64) -> bool {
        self.links
            .range((guest, 0usize)..=(guest, usize::MAX))
            .next()
            .is_some()
    }

    /// Appends `entries` to every page covered by `[start, start + len)`.
    ///
    /// Returns `true` if at least one of those pages previously contained no
    /// code; that is the caller's cue to notify the memory subsystem so the
    /// page can be write-protected for SMC tracking.
    pub fn add_block_executable_range(
        &mut self,
        entries: &BTreeSet<u64>,
        start: u64,
        len: u64,
    ) -> bool {
        let mut new_page = false;
        let (first_page, last_page) = page_span(start, len);
        for page in first_page..=last_page {
            let page_entries = self.code_pages.entry(page).or_default();
            new_page |= page_entries.is_empty();
            page_entries.extend(entries.iter().copied());
        }
        new_page
    }

    /// Drains the block entry addresses recorded for pages covered by
    /// `[start, start + len)`.
    pub fn take_entries_in_page_range(&mut self, start: u64, len: u64) -> Vec<u64> {
        let mut out = Vec::new();
        if len == 0 {
            return out;
        }
        let (first, last) = page_span(start, len);
        for (_, entries) in self.code_pages.range_mut(first..=last) {
            out.append(entries);
        }
        out
    }

    pub fn clear(&mut self) {
        // Dropping the link map without running delinkers is deliberate: the
        // whole generation's code becomes unreachable at once, so there are
        // no trampolines left worth restoring.
        self.blocks.clear();
        self.links.clear();
        self.code_pages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn nop_delinker(_slot: usize) {}

    #[test]
    fn erase_severs_only_links_to_target() {
        let map = SharedMap::new();
        let mut inner = map.write();
        inner.add_block_mapping(0x1000, 0xA000);
        inner.add_block_mapping(0x2000, 0xB000);
        inner.add_block_link(0x1000, 0x10, nop_delinker);
        inner.add_block_link(0x1000, 0x20, nop_delinker);
        inner.add_block_link(0x2000, 0x30, nop_delinker);

        assert!(inner.erase(0x1000));
        assert!(!inner.has_links_to(0x1000));
        assert!(inner.has_links_to(0x2000));
        assert_eq!(inner.find_block(0x1000), None);
        assert_eq!(inner.find_block(0x2000), Some(0xB000));
    }

    #[test]
    fn executable_range_reports_first_code_in_page() {
        let map = SharedMap::new();
        let mut inner = map.write();
        let entries: BTreeSet<u64> = [0x1000u64].into_iter().collect();
        assert!(inner.add_block_executable_range(&entries, 0x1000, 0x10));
        // Same page again: no new notification.
        let entries2: BTreeSet<u64> = [0x1800u64].into_iter().collect();
        assert!(!inner.add_block_executable_range(&entries2, 0x1800, 0x10));
        // Spilling into a fresh page notifies again.
        let entries3: BTreeSet<u64> = [0x1ff0u64].into_iter().collect();
        assert!(inner.add_block_executable_range(&entries3, 0x1ff0, 0x20));
    }
}
