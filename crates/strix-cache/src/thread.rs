//! Per-thread L1/L2 lookup tiers.
//!
//! The entries are atomic pairs so that generated code can probe L1 without
//! taking any lock while a cross-thread invalidation concurrently erases the
//! same slot under the shared write lock. An erase nulls the guest tag but
//! leaves the host word intact, so a torn probe observes either the old valid
//! mapping or a miss, never a null host pointer.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use strix_types::{L1_INDEX_MASK, PAGE_OFFSET_MASK, PAGE_SHIFT};

use crate::shared::{DelinkFn, SharedMap, SharedMapInner};

/// Entries backing one guest page in L2: one slot per byte offset.
const ENTRIES_PER_PAGE: usize = 1 << PAGE_SHIFT;

#[derive(Debug, Clone, Copy)]
pub struct LookupCacheConfig {
    /// Width of the guest virtual address space covered by L2. Addresses are
    /// masked down to this size before indexing, exactly like the inline
    /// probe in generated code.
    pub virtual_mem_bits: u32,
    /// Number of guest pages' worth of L2 backing before the tier is cleared
    /// and refilled on demand.
    pub l2_backing_pages: usize,
}

impl Default for LookupCacheConfig {
    fn default() -> Self {
        Self {
            virtual_mem_bits: 32,
            l2_backing_pages: 64,
        }
    }
}

#[derive(Default)]
struct Entry {
    guest: AtomicU64,
    host: AtomicU64,
}

/// One thread's L1/L2 tiers in front of a [`SharedMap`] L3.
pub struct LookupCache {
    l1: Box<[Entry]>,
    /// Guest page index -> arena slot + 1; 0 means no backing yet.
    l2_pages: Box<[AtomicUsize]>,
    l2_arena: Box<[Entry]>,
    l2_next: AtomicUsize,
    virtual_mem_mask: u64,
}

impl LookupCache {
    pub fn new(config: LookupCacheConfig) -> Self {
        let page_count = 1usize << (config.virtual_mem_bits - PAGE_SHIFT);
        let backing_pages = config.l2_backing_pages.max(1);
        Self {
            l1: make_entries(strix_types::L1_ENTRIES),
            l2_pages: (0..page_count).map(|_| AtomicUsize::new(0)).collect(),
            l2_arena: make_entries(backing_pages * ENTRIES_PER_PAGE),
            l2_next: AtomicUsize::new(0),
            virtual_mem_mask: (1u64 << config.virtual_mem_bits) - 1,
        }
    }

    /// Lock-free L1 probe.
    pub fn find_l1(&self, guest: u64) -> Option<usize> {
        let entry = &self.l1[(guest & L1_INDEX_MASK) as usize];
        if entry.guest.load(Ordering::Acquire) == guest && guest != 0 {
            Some(entry.host.load(Ordering::Acquire) as usize)
        } else {
            None
        }
    }

    /// Full probe: L1 lock-free, then L2 and L3 under the shared read lock.
    /// Hits found in the slower tiers are promoted forward.
    pub fn find(&self, shared: &SharedMap, guest: u64) -> Option<usize> {
        if let Some(host) = self.find_l1(guest) {
            return Some(host);
        }

        let inner = shared.read();

        if let Some(host) = self.find_l2(guest) {
            self.store_l1(guest, host);
            return Some(host);
        }

        let host = inner.find_block(guest)?;
        self.promote(guest, host);
        Some(host)
    }

    /// Publishes a freshly compiled mapping: L3 under the write lock, plus an
    /// eager L1 fill. L2 is populated lazily on first lookup.
    pub fn insert(&self, shared: &SharedMap, guest: u64, host: usize) {
        let mut inner = shared.write();
        inner.add_block_mapping(guest, host);
        self.store_l1(guest, host);
    }

    /// Like [`insert`](Self::insert), but if a concurrent compile already
    /// published a mapping for `guest`, that mapping wins and is returned;
    /// the caller's redundant fragment is simply never installed.
    pub fn insert_or_adopt(&self, shared: &SharedMap, guest: u64, host: usize) -> usize {
        let mut inner = shared.write();
        let canonical = match inner.find_block(guest) {
            Some(existing) => existing,
            None => {
                inner.add_block_mapping(guest, host);
                host
            }
        };
        self.store_l1(guest, canonical);
        canonical
    }

    /// Registers an exit-site link record targeting `guest_dest`.
    pub fn add_block_link(
        &self,
        shared: &SharedMap,
        guest_dest: u64,
        slot: usize,
        delinker: DelinkFn,
    ) {
        shared.write().add_block_link(guest_dest, slot, delinker);
    }

    /// Appends block entry points to the page index, returning `true` when a
    /// page gains code for the first time.
    pub fn add_block_executable_range(
        &self,
        shared: &SharedMap,
        entries: &BTreeSet<u64>,
        start: u64,
        len: u64,
    ) -> bool {
        shared.write().add_block_executable_range(entries, start, len)
    }

    /// Removes one guest address from all tiers. The caller holds the shared
    /// write guard; this is the only path that mutates another thread's
    /// L1/L2.
    pub fn erase(&self, inner: &mut SharedMapInner, guest: u64) -> bool {
        let mut erased = inner.erase(guest);

        let l1 = &self.l1[(guest & L1_INDEX_MASK) as usize];
        if l1.guest.load(Ordering::Relaxed) == guest {
            // Null the tag only; a concurrent lock-free probe must never see
            // a matching tag with a null host word.
            l1.guest.store(0, Ordering::Release);
            erased = true;
        }

        if let Some(entry) = self.l2_entry(guest) {
            if entry.guest.load(Ordering::Relaxed) == guest {
                entry.guest.store(0, Ordering::Release);
                entry.host.store(0, Ordering::Relaxed);
                erased = true;
            }
        }
        erased
    }

    /// Drops every thread-local mapping; used on generation change and cache
    /// clear. L3 is reset separately by the owner of the shared map.
    pub fn clear_thread_local(&self) {
        for entry in self.l1.iter() {
            entry.guest.store(0, Ordering::Relaxed);
            entry.host.store(0, Ordering::Relaxed);
        }
        for slot in self.l2_pages.iter() {
            slot.store(0, Ordering::Relaxed);
        }
        self.l2_next.store(0, Ordering::Relaxed);
    }

    fn find_l2(&self, guest: u64) -> Option<usize> {
        let entry = self.l2_entry(guest)?;
        if entry.guest.load(Ordering::Acquire) == guest && guest != 0 {
            Some(entry.host.load(Ordering::Acquire) as usize)
        } else {
            None
        }
    }

    fn l2_entry(&self, guest: u64) -> Option<&Entry> {
        let masked = guest & self.virtual_mem_mask;
        let page = (masked >> PAGE_SHIFT) as usize;
        let offset = (masked & PAGE_OFFSET_MASK) as usize;
        let slot = self.l2_pages[page].load(Ordering::Acquire);
        if slot == 0 {
            return None;
        }
        Some(&self.l2_arena[(slot - 1) * ENTRIES_PER_PAGE + offset])
    }

    fn store_l1(&self, guest: u64, host: usize) {
        let entry = &self.l1[(guest & L1_INDEX_MASK) as usize];
        entry.host.store(host as u64, Ordering::Release);
        entry.guest.store(guest, Ordering::Release);
    }

    /// Fills L1 and L2 for a hit found in L3. Runs under the shared read
    /// lock; only the owning thread writes its own L2 through this path.
    fn promote(&self, guest: u64, host: usize) {
        self.store_l1(guest, host);

        let masked = guest & self.virtual_mem_mask;
        let page = (masked >> PAGE_SHIFT) as usize;
        let offset = (masked & PAGE_OFFSET_MASK) as usize;

        let mut slot = self.l2_pages[page].load(Ordering::Acquire);
        if slot == 0 {
            slot = loop {
                if let Some(slot) = self.allocate_page_backing() {
                    break slot;
                }
                // Backing exhausted: drop the whole tier and retry with a
                // fresh arena.
                self.clear_l2();
            };
            self.l2_pages[page].store(slot, Ordering::Release);
        }

        let entry = &self.l2_arena[(slot - 1) * ENTRIES_PER_PAGE + offset];
        entry.host.store(host as u64, Ordering::Release);
        entry.guest.store(guest, Ordering::Release);
    }

    fn allocate_page_backing(&self) -> Option<usize> {
        let next = self.l2_next.load(Ordering::Relaxed);
        if (next + 1) * ENTRIES_PER_PAGE > self.l2_arena.len() {
            return None;
        }
        self.l2_next.store(next + 1, Ordering::Relaxed);
        // Reused arena regions may hold stale tags from before a clear.
        let base = next * ENTRIES_PER_PAGE;
        for entry in &self.l2_arena[base..base + ENTRIES_PER_PAGE] {
            entry.guest.store(0, Ordering::Relaxed);
            entry.host.store(0, Ordering::Relaxed);
        }
        Some(next + 1)
    }

    fn clear_l2(&self) {
        for slot in self.l2_pages.iter() {
            slot.store(0, Ordering::Relaxed);
        }
        self.l2_next.store(0, Ordering::Relaxed);
    }
}

fn make_entries(count: usize) -> Box<[Entry]> {
    (0..count).map(|_| Entry::default()).collect()
}
