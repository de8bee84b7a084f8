//! Compile orchestration, execution dispatch, and cache lifecycle for the
//! dynamic-translation core.
//!
//! The [`Translator`] owns the code-buffer generations, the shared lookup
//! map, and the invalidation lock. Per-thread state lives in
//! [`ThreadContext`]; the decode tables, IR passes, and per-opcode lowering
//! are external collaborators plugged in through the [`Frontend`],
//! [`ir::Pass`], and [`Lowering`] seams.

mod dispatch;
pub mod frontend;
mod generation;
pub mod ir;
mod orchestrator;
mod thread;

pub use dispatch::{BlockRunner, DispatchStop, Dispatcher, RunExit};
pub use frontend::{DecodedBlock, DecodedInstruction, Frontend, InsnClass};
pub use generation::{Generation, GenerationManager};
pub use ir::{BlockFlags, IrBlock, IrOp, Pass, PassManager, TrapKind};
pub use orchestrator::{
    CompileError, CompileKind, CompileOutcome, ExitKind, ExitSite, FragmentStore, Lowering,
    MemoryTracker, StoredFragment, Translator, TranslatorConfig,
};
pub use thread::ThreadContext;
