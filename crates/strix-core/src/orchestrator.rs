//! Compile orchestration.
//!
//! `compile_block` owns the miss path end to end: cache recheck under the
//! invalidation read lock, frontend decode, IR construction with the block
//! boundary policies, passes, emission, and publication. Concurrent compiles
//! of the same address are legal; the cache recheck makes the duplicate work
//! harmless and only one result is ever installed per generation.

use std::collections::BTreeSet;
use std::sync::Arc;

use strix_backend::{BackendError, Emitter, Fragment, ThreadStateLayout};
use strix_cache::LookupCacheConfig;
use strix_sync::WritePriorityRwLock;
use strix_types::DEFAULT_CODE_BUFFER_SIZE;
use thiserror::Error;
use tracing::{debug, warn};

use crate::frontend::{DecodedBlock, DecodedInstruction, Frontend, InsnClass};
use crate::generation::{Generation, GenerationManager};
use crate::ir::{BlockFlags, IrBlock, IrOp, PassManager, TrapKind};
use crate::thread::ThreadContext;

#[derive(Debug, Error)]
pub enum CompileError {
    /// Nothing at the address decodes. The caller raises the guest's
    /// invalid-opcode fault.
    #[error("no instruction could be decoded at {guest:#x}")]
    DecodeFailure { guest: u64 },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileKind {
    /// Normal multi-instruction block, published through the lookup cache.
    Cached,
    /// Trap-flag block: exactly one instruction, never cached.
    SingleStep,
}

/// Why a fragment exit trampoline exists. Parallel to
/// `Fragment::exit_thunks`, index for index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Entry-prologue cooperative suspend check.
    Suspend,
    /// An SMC validation check found changed guest bytes; the runner erases
    /// this block's cache entry and re-dispatches.
    SmcMismatch,
    Trap { guest: u64, kind: TrapKind },
    /// Statically known destination, eligible for block linking.
    Branch { guest_dest: u64 },
    /// Run-time destination; always returns through the dispatcher.
    Dispatch,
}

#[derive(Debug, Clone, Copy)]
pub struct ExitSite {
    /// Host address of the 16-byte trampoline.
    pub thunk: usize,
    pub kind: ExitKind,
}

#[derive(Debug, Clone)]
pub struct CompileOutcome {
    pub host: usize,
    /// `true` when another thread's result was adopted instead of emitting.
    pub reused: bool,
    pub exits: Vec<ExitSite>,
}

/// Memory-subsystem seam: called when a guest page gains translated code for
/// the first time, so the page can be write-protected for SMC tracking.
pub trait MemoryTracker: Send + Sync {
    fn code_pages_added(&self, guest_start: u64, guest_len: u64);
}

/// Instruction lowering seam. The register allocator and per-opcode
/// translation live behind this trait.
pub trait Lowering: Send + Sync {
    /// Emit host words for one guest instruction.
    fn lower_insn(&self, block: &IrBlock, insn: &DecodedInstruction, e: &mut Emitter<'_>);

    /// Emit the live-byte equality check guarding one instruction. On
    /// mismatch control leaves through exit `mismatch_exit`.
    fn lower_validate(&self, guest: u64, expected: &[u8], mismatch_exit: usize, e: &mut Emitter<'_>);
}

/// A fragment fetched from an external object-code cache.
pub struct StoredFragment {
    pub words: Vec<u32>,
    pub guest_len: u64,
    /// Pre-validated fragments skip SMC page registration.
    pub pre_validated: bool,
}

/// Optional precompiled-fragment source consulted before full recompilation.
pub trait FragmentStore: Send + Sync {
    fn fetch(&self, guest: u64) -> Option<StoredFragment>;
}

#[derive(Debug, Clone, Copy)]
pub struct TranslatorConfig {
    pub buffer_capacity: usize,
    pub max_block_insns: usize,
    /// Guard every instruction with a compile-time byte check.
    pub smc_checks: bool,
    pub thread_cache: LookupCacheConfig,
    pub state_layout: ThreadStateLayout,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_CODE_BUFFER_SIZE,
            max_block_insns: 512,
            smc_checks: true,
            thread_cache: LookupCacheConfig::default(),
            state_layout: ThreadStateLayout::default(),
        }
    }
}

pub struct Translator {
    config: TranslatorConfig,
    generations: GenerationManager,
    /// Compiles hold the read side; invalidation, cache clears, and fork take
    /// the write side.
    invalidation: WritePriorityRwLock<()>,
    threads: WritePriorityRwLock<Vec<Arc<ThreadContext>>>,
    frontend: Box<dyn Frontend>,
    lowering: Box<dyn Lowering>,
    passes: PassManager,
    tracker: Option<Box<dyn MemoryTracker>>,
    store: Option<Box<dyn FragmentStore>>,
}

impl Translator {
    pub fn new(
        config: TranslatorConfig,
        frontend: Box<dyn Frontend>,
        lowering: Box<dyn Lowering>,
    ) -> Result<Self, CompileError> {
        Ok(Self {
            generations: GenerationManager::new(config.buffer_capacity)?,
            invalidation: WritePriorityRwLock::new(()),
            threads: WritePriorityRwLock::new(Vec::new()),
            frontend,
            lowering,
            passes: PassManager::new(),
            tracker: None,
            store: None,
            config,
        })
    }

    pub fn with_passes(mut self, passes: PassManager) -> Self {
        self.passes = passes;
        self
    }

    pub fn with_tracker(mut self, tracker: Box<dyn MemoryTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_store(mut self, store: Box<dyn FragmentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn current_generation(&self) -> Generation {
        self.generations.current()
    }

    pub(crate) fn invalidation(&self) -> &WritePriorityRwLock<()> {
        &self.invalidation
    }

    // Thread lifecycle.

    pub fn create_thread_cache(&self) -> Arc<ThreadContext> {
        let ctx = Arc::new(ThreadContext::new(self.config.thread_cache));
        self.threads.write().push(Arc::clone(&ctx));
        ctx
    }

    pub fn destroy_thread_cache(&self, ctx: &Arc<ThreadContext>) {
        self.threads.write().retain(|c| !Arc::ptr_eq(c, ctx));
    }

    /// Compiles (or re-finds) the block at `guest` and returns its host entry.
    pub fn compile_block(
        &self,
        ctx: &ThreadContext,
        guest: u64,
    ) -> Result<CompileOutcome, CompileError> {
        let _inv = self.invalidation.read();
        loop {
            let gen = self.generations.current();
            ctx.sync_generation(&gen);

            let kind = if ctx.single_step() {
                CompileKind::SingleStep
            } else {
                CompileKind::Cached
            };

            // A single-step request never adopts a cached fragment; the cached
            // block at this address covers more than one instruction.
            if kind == CompileKind::Cached {
                if let Some(host) = ctx.cache.find(&gen.map, guest) {
                    // Another thread won the race; adopt its result.
                    return Ok(CompileOutcome {
                        host,
                        reused: true,
                        exits: Vec::new(),
                    });
                }
            }

            let result = self.compile_miss(&gen, ctx, guest, kind);
            match result {
                Err(CompileError::Backend(BackendError::CodeBufferExhausted {
                    requested, ..
                })) => {
                    warn!(requested, seq = gen.seq, "code buffer exhausted, rotating");
                    self.generations.rotate_if_current(gen.seq)?;
                }
                other => return other,
            }
        }
    }

    fn compile_miss(
        &self,
        gen: &Generation,
        ctx: &ThreadContext,
        guest: u64,
        kind: CompileKind,
    ) -> Result<CompileOutcome, CompileError> {
        if kind == CompileKind::Cached {
            if let Some(stored) = self.store.as_ref().and_then(|s| s.fetch(guest)) {
                return self.emit_stored(gen, ctx, guest, &stored);
            }
        }

        let max_insns = match kind {
            CompileKind::Cached => self.config.max_block_insns,
            CompileKind::SingleStep => 1,
        };
        let decoded = self
            .frontend
            .decode(guest, max_insns)
            .filter(|b| !b.insns.is_empty())
            .ok_or(CompileError::DecodeFailure { guest })?;

        let mut ir = self.generate_ir(decoded, kind);
        self.passes.run(&mut ir);

        let (fragment, kinds) = self.emit(gen, &ir)?;
        let mut host = fragment.entry;
        if kind == CompileKind::Cached {
            host = self.register(gen, ctx, &ir, host);
            if host != fragment.entry {
                // Lost the compile race; the winner's fragment is canonical
                // and ours stays unreachable in the buffer.
                debug!(guest = format_args!("{guest:#x}"), "discarded redundant compile");
                return Ok(CompileOutcome {
                    host,
                    reused: true,
                    exits: Vec::new(),
                });
            }
        }
        debug!(
            guest = format_args!("{guest:#x}"),
            host = format_args!("{host:#x}"),
            ops = ir.ops.len(),
            ?kind,
            "compiled block"
        );
        let exits = kinds
            .into_iter()
            .zip(fragment.exit_thunks.iter())
            .map(|(kind, &thunk)| ExitSite { thunk, kind })
            .collect();
        Ok(CompileOutcome {
            host,
            reused: false,
            exits,
        })
    }

    /// Block-boundary policy. Three cases matter:
    /// - an instruction with no dispatcher entry ends the block before
    ///   itself, unless it is the first instruction, in which case the whole
    ///   block becomes an undefined-instruction trap;
    /// - with SMC checking on, every instruction is guarded by a live-byte
    ///   equality check;
    /// - a single-step block takes exactly one instruction and traps after.
    fn generate_ir(&self, decoded: DecodedBlock, kind: CompileKind) -> IrBlock {
        let mut flags = BlockFlags::empty();
        if decoded.is_64bit {
            flags |= BlockFlags::MODE_64;
        }

        let entry = decoded.start;
        let mut ops = Vec::new();
        let mut guest_len = 0u64;

        if kind == CompileKind::SingleStep {
            flags |= BlockFlags::SINGLE_STEP;
            let insn = decoded.insns.into_iter().next();
            match insn {
                Some(insn) if insn.class != InsnClass::Undefined => {
                    guest_len = insn.len();
                    let next = insn.guest + insn.len();
                    let class = insn.class;
                    ops.push(IrOp::Insn(insn));
                    match class {
                        InsnClass::BranchTo(_) | InsnClass::Exit => {
                            // The instruction already leaves the block; the
                            // trap is raised at its destination.
                            ops.push(IrOp::ExitTo { guest_dest: None });
                        }
                        _ => ops.push(IrOp::Trap {
                            guest: next,
                            kind: TrapKind::SingleStep,
                        }),
                    }
                }
                Some(insn) => {
                    guest_len = insn.len();
                    ops.push(IrOp::Trap {
                        guest: insn.guest,
                        kind: TrapKind::UndefinedInstruction,
                    });
                }
                None => {}
            }
            return IrBlock {
                entry,
                guest_len,
                flags,
                ops,
            };
        }

        if self.config.smc_checks {
            flags |= BlockFlags::SMC_CHECKED;
        }

        let mut terminated = false;
        let mut next_guest = entry;
        for (i, insn) in decoded.insns.into_iter().enumerate() {
            if insn.class == InsnClass::Undefined {
                if i == 0 {
                    guest_len = insn.len();
                    ops.push(IrOp::Trap {
                        guest: insn.guest,
                        kind: TrapKind::UndefinedInstruction,
                    });
                } else {
                    // End cleanly before the corrupt instruction; code up to
                    // here stays executable.
                    ops.push(IrOp::ExitTo {
                        guest_dest: Some(insn.guest),
                    });
                }
                terminated = true;
                break;
            }

            if self.config.smc_checks {
                ops.push(IrOp::ValidateCode {
                    guest: insn.guest,
                    expected: insn.bytes.clone(),
                });
            }
            guest_len += insn.len();
            next_guest = insn.guest + insn.len();
            let class = insn.class;
            ops.push(IrOp::Insn(insn));

            match class {
                InsnClass::BranchTo(dest) => {
                    ops.push(IrOp::ExitTo {
                        guest_dest: Some(dest),
                    });
                    terminated = true;
                    break;
                }
                InsnClass::Exit => {
                    ops.push(IrOp::ExitTo { guest_dest: None });
                    terminated = true;
                    break;
                }
                InsnClass::Plain | InsnClass::Undefined => {}
            }
        }

        if !terminated {
            // Instruction cap reached; continue at the next address.
            ops.push(IrOp::ExitTo {
                guest_dest: Some(next_guest),
            });
        }

        IrBlock {
            entry,
            guest_len,
            flags,
            ops,
        }
    }

    fn emit(
        &self,
        gen: &Generation,
        ir: &IrBlock,
    ) -> Result<(Fragment, Vec<ExitKind>), CompileError> {
        let mut e = Emitter::new(
            &gen.buffer,
            self.config.state_layout,
            ir.entry,
            ir.guest_len,
        );
        // Exit 0 is always the prologue suspend check.
        let mut kinds = vec![ExitKind::Suspend];
        let mut smc_exit: Option<usize> = None;

        for op in &ir.ops {
            match op {
                IrOp::ValidateCode { guest, expected } => {
                    let exit = match smc_exit {
                        Some(exit) => exit,
                        None => {
                            let exit = e.add_exit();
                            kinds.push(ExitKind::SmcMismatch);
                            smc_exit = Some(exit);
                            exit
                        }
                    };
                    self.lowering.lower_validate(*guest, expected, exit, &mut e);
                }
                IrOp::Insn(insn) => self.lowering.lower_insn(ir, insn, &mut e),
                IrOp::Trap { guest, kind } => {
                    let exit = e.add_exit();
                    kinds.push(ExitKind::Trap {
                        guest: *guest,
                        kind: *kind,
                    });
                    e.branch_to_exit(exit);
                }
                IrOp::ExitTo { guest_dest } => {
                    let exit = e.add_exit();
                    kinds.push(match guest_dest {
                        Some(dest) => ExitKind::Branch { guest_dest: *dest },
                        None => ExitKind::Dispatch,
                    });
                    e.branch_to_exit(exit);
                }
            }
        }

        let fragment = e.finalize()?;
        debug_assert_eq!(kinds.len(), fragment.exit_thunks.len());
        Ok((fragment, kinds))
    }

    fn emit_stored(
        &self,
        gen: &Generation,
        ctx: &ThreadContext,
        guest: u64,
        stored: &StoredFragment,
    ) -> Result<CompileOutcome, CompileError> {
        let mut e = Emitter::new(&gen.buffer, self.config.state_layout, guest, stored.guest_len);
        e.push_words(&stored.words);
        let exit = e.add_exit();
        e.branch_to_exit(exit);
        let fragment = e.finalize()?;

        let canonical = ctx.cache.insert_or_adopt(&gen.map, guest, fragment.entry);
        if canonical != fragment.entry {
            return Ok(CompileOutcome {
                host: canonical,
                reused: true,
                exits: Vec::new(),
            });
        }
        if !stored.pre_validated {
            self.register_pages(gen, guest, stored.guest_len);
        }
        debug!(guest = format_args!("{guest:#x}"), "installed precompiled fragment");
        Ok(CompileOutcome {
            host: fragment.entry,
            reused: false,
            exits: vec![
                ExitSite {
                    thunk: fragment.exit_thunks[0],
                    kind: ExitKind::Suspend,
                },
                ExitSite {
                    thunk: fragment.exit_thunks[1],
                    kind: ExitKind::Dispatch,
                },
            ],
        })
    }

    fn register(&self, gen: &Generation, ctx: &ThreadContext, ir: &IrBlock, host: usize) -> usize {
        let canonical = ctx.cache.insert_or_adopt(&gen.map, ir.entry, host);
        if canonical == host {
            self.register_pages(gen, ir.entry, ir.guest_len);
        }
        canonical
    }

    fn register_pages(&self, gen: &Generation, guest_start: u64, guest_len: u64) {
        let entries: BTreeSet<u64> = [guest_start].into_iter().collect();
        let len = guest_len.max(1);
        let first_code = gen
            .map
            .write()
            .add_block_executable_range(&entries, guest_start, len);
        if first_code {
            if let Some(tracker) = &self.tracker {
                tracker.code_pages_added(guest_start, len);
            }
        }
    }

    // Invalidation.

    /// Removes every cached block whose pages intersect `[start, start+len)`,
    /// severing link records so patched call sites fall back to trampolines.
    pub fn invalidate_range(&self, start: u64, len: u64) {
        let _inv = self.invalidation.write();
        let gen = self.generations.current();
        let threads = self.threads.read();
        let mut inner = gen.map.write();
        let targets = inner.take_entries_in_page_range(start, len);
        debug!(
            start = format_args!("{start:#x}"),
            len,
            blocks = targets.len(),
            "invalidating guest range"
        );
        for guest in targets {
            inner.erase(guest);
            for ctx in threads.iter() {
                ctx.cache.erase(&mut inner, guest);
            }
        }
    }

    /// Removes a single block, used by the SMC-mismatch exit to invalidate
    /// the block that detected its own staleness.
    pub fn invalidate_block(&self, guest: u64) {
        let _inv = self.invalidation.write();
        let gen = self.generations.current();
        let threads = self.threads.read();
        let mut inner = gen.map.write();
        inner.erase(guest);
        for ctx in threads.iter() {
            ctx.cache.erase(&mut inner, guest);
        }
    }

    /// Drops every cached translation. With `new_buffer` the generation is
    /// rotated wholesale; otherwise the current buffer is rewound in place.
    pub fn clear_cache(&self, new_buffer: bool) -> Result<(), CompileError> {
        let _inv = self.invalidation.write();
        if new_buffer {
            self.generations.rotate()?;
        } else {
            let gen = self.generations.current();
            gen.map.write().clear();
            gen.buffer.reset();
            for ctx in self.threads.read().iter() {
                ctx.cache.clear_thread_local();
            }
        }
        Ok(())
    }

    // Fork protocol. The child of fork() owns exactly the locks its one
    // surviving thread held; everything else is force-reset with the steal
    // operation, never with a normal unlock.

    pub fn lock_before_fork(&self) {
        self.invalidation.lock_before_fork();
        self.threads.lock_before_fork();
        let gen = self.generations.current();
        gen.map.lock_before_fork();
        self.generations.lock_before_fork();
    }

    pub fn unlock_after_fork(&self) {
        self.generations.unlock_after_fork();
        self.generations.current().map.unlock_after_fork();
        self.threads.unlock_after_fork();
        self.invalidation.unlock_after_fork();
    }

    pub fn steal_and_drop_active_locks(&self) {
        self.generations.steal_and_drop_active_locks();
        self.generations.current().map.steal_and_drop_active_locks();
        self.threads.steal_and_drop_active_locks();
        self.invalidation.steal_and_drop_active_locks();
    }
}
