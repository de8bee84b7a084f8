//! Guest-address to host-code lookup caching.
//!
//! Three conceptual tiers:
//!
//! - L1: a small per-thread direct-mapped array probed lock-free (also probed
//!   inline by generated code for self-recursive calls).
//! - L2: a per-thread page-granularity table, probed under the shared read
//!   lock.
//! - L3: the process-shared [`SharedMap`], the source of truth, guarded by a
//!   write-priority reader/writer lock.
//!
//! Every address present in L1/L2 is also present in L3 for the same
//! generation; the reverse does not hold (L3 entries are promoted into the
//! inline tiers on first lookup). The shared map additionally owns block-link
//! records (for delinking on invalidation) and the guest-page index used by
//! range invalidation and SMC tracking.

mod shared;
mod thread;

pub use shared::{DelinkFn, SharedMap, SharedMapInner};
pub use thread::{LookupCache, LookupCacheConfig};
