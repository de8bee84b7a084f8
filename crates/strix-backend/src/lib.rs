//! Host code emission, block linking, and code-buffer management.
//!
//! The backend targets fixed-width 32-bit host instruction words. Exit sites
//! are emitted as 16-byte trampolines that call into the runtime linker; the
//! linker patches them in place into either a direct branch or an out-of-line
//! indirect target, and invalidation reverts them through [`link::delink_exit`].

mod buffer;
mod emit;
mod icache;
mod link;
pub mod words;

pub use buffer::{CodeBuffer, Fragment, FragmentTail};
pub use emit::{Emitter, ThreadStateLayout, SUSPEND_EXIT};
pub use icache::clear_icache;
pub use link::{
    delink_exit, link_exit, set_runtime_linker, would_link_direct, LinkKind, THUNK_SIZE,
    THUNK_SLOT_OFFSET,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    /// The current code-buffer generation has no room for the fragment. The
    /// caller rotates to a fresh buffer and retries.
    #[error("code buffer exhausted: requested {requested} bytes, {remaining} remaining")]
    CodeBufferExhausted { requested: usize, remaining: usize },

    #[error("code buffer reservation failed: {0}")]
    Reservation(String),
}
