//! Low-level locks for the translation core.
//!
//! Every shared structure in the translation core (lookup caches, code
//! buffers, link records) is guarded by one of two primitives:
//!
//! - [`SpinFutex`]: a one-word spin lock with a bounded spin window and a
//!   futex fallback. The same word format is embedded in compiled fragment
//!   tails so the fault handler can serialize patching without allocating.
//! - [`WritePriorityRwLock`]: a reader/writer lock over a single 32-bit
//!   futex word that hands off directly to waiting writers to bound writer
//!   starvation during invalidation.
//!
//! Spin-loops on battery-powered devices burn power, so waiting prefers a
//! short spin window followed by a directed futex sleep rather than spinning
//! indefinitely. On non-Linux hosts the futex sleep degrades to a yielding
//! spin, which is acceptable for debugging only.

mod futex;
mod rwlock;
mod spin;

pub use rwlock::{RwReadGuard, RwWriteGuard, WritePriorityRwLock};
pub use spin::{raw_spin_lock, raw_spin_try_lock, raw_spin_unlock, RawSpinGuard, SpinFutex};

/// Number of relaxed spin iterations attempted before sleeping.
///
/// Roughly a 0.01ms window on a modern core without reading a cycle counter.
pub(crate) const SPIN_WINDOW: u32 = 4096;
