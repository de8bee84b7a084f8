//! Per-thread execution context.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use strix_cache::{LookupCache, LookupCacheConfig};

use crate::generation::Generation;

/// State a guest thread carries through compilation and dispatch. The
/// atomic fields mirror the slots generated code reads through its pinned
/// state register.
pub struct ThreadContext {
    pub cache: LookupCache,
    /// Nonzero requests a cooperative suspend at the next fragment entry.
    pub suspend: AtomicU32,
    /// Fragment-tail address stored by the entry prologue of the fragment
    /// currently executing; the fault handler reads this.
    pub current_fragment: AtomicUsize,
    /// Guest trap flag. Forces one-instruction uncached blocks and refuses
    /// block linking while set.
    single_step: AtomicBool,
    /// Generation the thread-local tiers were last filled from.
    gen_seq: AtomicU64,
}

impl ThreadContext {
    pub fn new(config: LookupCacheConfig) -> Self {
        Self {
            cache: LookupCache::new(config),
            suspend: AtomicU32::new(0),
            current_fragment: AtomicUsize::new(0),
            single_step: AtomicBool::new(false),
            gen_seq: AtomicU64::new(0),
        }
    }

    pub fn single_step(&self) -> bool {
        self.single_step.load(Ordering::Relaxed)
    }

    pub fn set_single_step(&self, on: bool) {
        self.single_step.store(on, Ordering::Relaxed);
    }

    pub fn request_suspend(&self) {
        self.suspend.store(1, Ordering::Release);
    }

    pub fn clear_suspend(&self) {
        self.suspend.store(0, Ordering::Release);
    }

    /// Drops thread-local tiers that belong to a retired generation.
    pub(crate) fn sync_generation(&self, gen: &Generation) {
        if self.gen_seq.swap(gen.seq, Ordering::AcqRel) != gen.seq {
            self.cache.clear_thread_local();
        }
    }
}
