//! Total-store-order atomics over weaker host memory.
//!
//! Guest code assumes every aligned access is atomic and strongly ordered,
//! so the code generator emits real host atomics and ordered accesses and
//! lets the hardware fault when the guest uses an address the host cannot
//! serve atomically. This crate owns everything after that fault:
//!
//! - [`decode`]: classify the faulting instruction word.
//! - [`emulate`]: complete unaligned atomics in software, with tear
//!   detection for accesses spanning 64-bit containers.
//! - [`handler`]: decide between emulation and in-place demotion, and track
//!   event counters.
//! - [`signal`] (Linux): the `SIGBUS` frame glue.
//!
//! Ordered loads and stores that fault once are assumed to fault forever,
//! so in the default mode the site is rewritten into a plain access plus an
//! explicit barrier instead of paying a signal per execution.

pub mod decode;
pub mod emulate;
mod handler;
mod patch;
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
pub mod signal;

pub use decode::{classify, FaultingOp, MemOp};
pub use emulate::{
    crosses_cacheline, emulate_atomic_mem, emulate_cas, emulate_cas_pair, read_unaligned,
    write_unaligned, CasOutcome, CasPairOutcome,
};
pub use handler::{FaultHandler, FaultOutcome, FaultRegs, TsoCounters, TsoMode};
