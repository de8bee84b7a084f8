use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use strix_backend::{words, Emitter};
use strix_core::{
    CompileError, DecodedBlock, DecodedInstruction, ExitKind, FragmentStore, Frontend, InsnClass,
    IrBlock, Lowering, MemoryTracker, StoredFragment, Translator, TranslatorConfig, TrapKind,
};

// Fake guest ISA: every instruction is 4 bytes, classified by its first byte.
const OP_PLAIN: u8 = 0x90;
const OP_UNDEF: u8 = 0x0F;
const OP_BRANCH: u8 = 0xEB;
const OP_EXIT: u8 = 0xC3;

#[derive(Clone, Default)]
struct GuestImage {
    mem: Arc<Mutex<HashMap<u64, [u8; 4]>>>,
}

impl GuestImage {
    fn put(&self, addr: u64, bytes: [u8; 4]) {
        self.mem.lock().unwrap().insert(addr, bytes);
    }

    fn plain(&self, addr: u64) {
        self.put(addr, [OP_PLAIN, 0, 0, 0]);
    }

    fn undefined(&self, addr: u64) {
        self.put(addr, [OP_UNDEF, 0, 0, 0]);
    }

    fn exit(&self, addr: u64) {
        self.put(addr, [OP_EXIT, 0, 0, 0]);
    }
}

struct TableFrontend {
    image: GuestImage,
}

impl Frontend for TableFrontend {
    fn decode(&self, guest: u64, max_insns: usize) -> Option<DecodedBlock> {
        let mem = self.image.mem.lock().unwrap();
        let mut insns = Vec::new();
        let mut addr = guest;
        while insns.len() < max_insns {
            let Some(&bytes) = mem.get(&addr) else { break };
            let class = match bytes[0] {
                OP_UNDEF => InsnClass::Undefined,
                OP_BRANCH => InsnClass::BranchTo(
                    u64::from(bytes[1]) | (u64::from(bytes[2]) << 8) | (u64::from(bytes[3]) << 16),
                ),
                OP_EXIT => InsnClass::Exit,
                _ => InsnClass::Plain,
            };
            insns.push(DecodedInstruction {
                guest: addr,
                bytes: bytes.to_vec(),
                class,
            });
            let terminal = !matches!(class, InsnClass::Plain);
            addr += 4;
            if terminal {
                break;
            }
        }
        if insns.is_empty() {
            None
        } else {
            Some(DecodedBlock {
                start: guest,
                is_64bit: true,
                insns,
            })
        }
    }
}

/// Lowers each guest instruction to its raw bytes as one host word, so the
/// emitted body is a readable transcript of what was compiled.
struct ByteLowering;

impl Lowering for ByteLowering {
    fn lower_insn(&self, _block: &IrBlock, insn: &DecodedInstruction, e: &mut Emitter<'_>) {
        let mut word = [0u8; 4];
        word.copy_from_slice(&insn.bytes[..4]);
        e.push_word(u32::from_le_bytes(word));
    }

    fn lower_validate(&self, _guest: u64, _expected: &[u8], _mismatch_exit: usize, e: &mut Emitter<'_>) {
        e.push_word(words::NOP);
    }
}

#[derive(Clone, Default)]
struct RecordingTracker {
    pages: Arc<Mutex<Vec<(u64, u64)>>>,
}

impl MemoryTracker for RecordingTracker {
    fn code_pages_added(&self, guest_start: u64, guest_len: u64) {
        self.pages.lock().unwrap().push((guest_start, guest_len));
    }
}

fn small_config() -> TranslatorConfig {
    TranslatorConfig {
        buffer_capacity: 64 * 1024,
        thread_cache: strix_cache::LookupCacheConfig {
            virtual_mem_bits: 24,
            l2_backing_pages: 4,
        },
        ..TranslatorConfig::default()
    }
}

fn translator(image: &GuestImage) -> Translator {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    strix_backend::set_runtime_linker(0x7000_0000);
    Translator::new(
        small_config(),
        Box::new(TableFrontend {
            image: image.clone(),
        }),
        Box::new(ByteLowering),
    )
    .unwrap()
}

fn exit_kinds(outcome: &strix_core::CompileOutcome) -> Vec<ExitKind> {
    outcome.exits.iter().map(|s| s.kind).collect()
}

#[test]
fn concrete_three_instruction_block() {
    let image = GuestImage::default();
    image.plain(0x1000);
    image.plain(0x1004);
    image.exit(0x1008);
    let t = translator(&image);
    let ctx = t.create_thread_cache();

    let first = t.compile_block(&ctx, 0x1000).unwrap();
    assert!(!first.reused);
    assert!(exit_kinds(&first).contains(&ExitKind::Dispatch));

    // Compiling again before any invalidation returns the same host address.
    let second = t.compile_block(&ctx, 0x1000).unwrap();
    assert!(second.reused);
    assert_eq!(second.host, first.host);

    // Overwrite a byte inside the block, invalidate, recompile: the new
    // fragment must live at a different host address.
    image.put(0x1004, [OP_PLAIN, 0xAA, 0, 0]);
    t.invalidate_range(0x1004, 1);
    let third = t.compile_block(&ctx, 0x1000).unwrap();
    assert!(!third.reused);
    assert_ne!(third.host, first.host);
}

#[test]
fn decode_failure_is_surfaced() {
    let image = GuestImage::default();
    let t = translator(&image);
    let ctx = t.create_thread_cache();

    match t.compile_block(&ctx, 0x4000) {
        Err(CompileError::DecodeFailure { guest }) => assert_eq!(guest, 0x4000),
        other => panic!("expected decode failure, got {other:?}"),
    }
}

#[test]
fn undefined_first_instruction_becomes_a_trap_block() {
    let image = GuestImage::default();
    image.undefined(0x2000);
    let t = translator(&image);
    let ctx = t.create_thread_cache();

    let outcome = t.compile_block(&ctx, 0x2000).unwrap();
    assert!(exit_kinds(&outcome).contains(&ExitKind::Trap {
        guest: 0x2000,
        kind: TrapKind::UndefinedInstruction,
    }));

    // The trap block is cached like any other.
    assert!(t.compile_block(&ctx, 0x2000).unwrap().reused);
}

#[test]
fn undefined_mid_block_ends_the_block_before_it() {
    let image = GuestImage::default();
    image.plain(0x3000);
    image.plain(0x3004);
    image.undefined(0x3008);
    let t = translator(&image);
    let ctx = t.create_thread_cache();

    let outcome = t.compile_block(&ctx, 0x3000).unwrap();
    let kinds = exit_kinds(&outcome);
    // Valid code up to the corruption point still runs; the block hands off
    // at the undefined instruction's address instead of trapping here.
    assert!(kinds.contains(&ExitKind::Branch { guest_dest: 0x3008 }));
    assert!(!kinds
        .iter()
        .any(|k| matches!(k, ExitKind::Trap { .. })));
}

#[test]
fn single_step_blocks_are_never_cached() {
    let image = GuestImage::default();
    image.plain(0x1000);
    image.plain(0x1004);
    image.exit(0x1008);
    let t = translator(&image);
    let ctx = t.create_thread_cache();
    ctx.set_single_step(true);

    let outcome = t.compile_block(&ctx, 0x1000).unwrap();
    assert!(exit_kinds(&outcome).contains(&ExitKind::Trap {
        guest: 0x1004,
        kind: TrapKind::SingleStep,
    }));

    // Nothing was published; the address stays a miss.
    let gen = t.current_generation();
    assert_eq!(gen.map.read().find_block(0x1000), None);
    assert!(!t.compile_block(&ctx, 0x1000).unwrap().reused);
}

#[test]
fn single_step_ignores_a_previously_cached_block() {
    let image = GuestImage::default();
    image.plain(0x1000);
    image.plain(0x1004);
    image.exit(0x1008);
    let t = translator(&image);
    let ctx = t.create_thread_cache();

    let full = t.compile_block(&ctx, 0x1000).unwrap();
    assert!(!full.reused);

    // With the trap flag set, the cached three-instruction fragment must not
    // be adopted; a fresh one-instruction fragment is compiled instead.
    ctx.set_single_step(true);
    let stepped = t.compile_block(&ctx, 0x1000).unwrap();
    assert!(!stepped.reused, "adopted the cached multi-instruction block");
    assert_ne!(stepped.host, full.host);
    assert!(exit_kinds(&stepped).contains(&ExitKind::Trap {
        guest: 0x1004,
        kind: TrapKind::SingleStep,
    }));

    // The full block stays cached for normal execution afterwards.
    ctx.set_single_step(false);
    let resumed = t.compile_block(&ctx, 0x1000).unwrap();
    assert!(resumed.reused);
    assert_eq!(resumed.host, full.host);
}

#[test]
fn concurrent_compiles_install_exactly_one_fragment() {
    let image = GuestImage::default();
    image.plain(0x1000);
    image.plain(0x1004);
    image.exit(0x1008);
    let t = Arc::new(translator(&image));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let t = Arc::clone(&t);
        handles.push(thread::spawn(move || {
            let ctx = t.create_thread_cache();
            let mut hosts = Vec::new();
            for _ in 0..50 {
                hosts.push(t.compile_block(&ctx, 0x1000).unwrap().host);
            }
            t.destroy_thread_cache(&ctx);
            hosts
        }));
    }
    let mut all_hosts = Vec::new();
    for h in handles {
        all_hosts.extend(h.join().unwrap());
    }

    let gen = t.current_generation();
    let canonical = gen.map.read().find_block(0x1000).unwrap();
    assert_eq!(gen.map.read().block_count(), 1);
    for host in all_hosts {
        assert_eq!(host, canonical, "a caller saw a non-canonical fragment");
    }
}

#[test]
fn buffer_exhaustion_rotates_generations() {
    let image = GuestImage::default();
    for i in 0..64u64 {
        image.exit(0x1000 + i * 4);
    }
    let t = Translator::new(
        TranslatorConfig {
            buffer_capacity: 4096,
            ..small_config()
        },
        Box::new(TableFrontend {
            image: image.clone(),
        }),
        Box::new(ByteLowering),
    )
    .unwrap();
    let ctx = t.create_thread_cache();

    // Keep the initial generation alive so its buffer mapping cannot be
    // recycled at the same host address by a later rotation.
    let initial_gen = t.current_generation();
    let first_host = t.compile_block(&ctx, 0x1000).unwrap().host;
    for i in 1..64u64 {
        t.compile_block(&ctx, 0x1000 + i * 4).unwrap();
    }
    let gen = t.current_generation();
    assert!(gen.seq > initial_gen.seq, "64 fragments never exhausted a 4KiB buffer");

    // The early block's generation was retired with its mappings; compiling
    // it again lands in the fresh buffer.
    let recompiled = t.compile_block(&ctx, 0x1000).unwrap();
    assert!(!recompiled.reused);
    assert_ne!(recompiled.host, first_host);
    let current = t.current_generation();
    assert!(current.buffer.contains(recompiled.host));
    assert!(!current.buffer.contains(first_host));
}

#[test]
fn first_code_in_page_notifies_the_tracker_once() {
    let image = GuestImage::default();
    image.exit(0x5000);
    image.exit(0x5004);
    image.exit(0x6000);
    let tracker = RecordingTracker::default();
    let t = Translator::new(
        small_config(),
        Box::new(TableFrontend {
            image: image.clone(),
        }),
        Box::new(ByteLowering),
    )
    .unwrap()
    .with_tracker(Box::new(tracker.clone()));
    let ctx = t.create_thread_cache();

    t.compile_block(&ctx, 0x5000).unwrap();
    t.compile_block(&ctx, 0x5004).unwrap();
    t.compile_block(&ctx, 0x6000).unwrap();

    let pages = tracker.pages.lock().unwrap();
    assert_eq!(pages.len(), 2, "same-page block re-notified: {pages:?}");
    assert_eq!(pages[0].0, 0x5000);
    assert_eq!(pages[1].0, 0x6000);
}

struct OneBlockStore {
    guest: u64,
}

impl FragmentStore for OneBlockStore {
    fn fetch(&self, guest: u64) -> Option<StoredFragment> {
        (guest == self.guest).then(|| StoredFragment {
            words: vec![words::NOP, words::NOP],
            guest_len: 8,
            pre_validated: true,
        })
    }
}

#[test]
fn precompiled_fragments_skip_smc_registration() {
    let image = GuestImage::default();
    image.exit(0x5000);
    let tracker = RecordingTracker::default();
    let t = Translator::new(
        small_config(),
        Box::new(TableFrontend {
            image: image.clone(),
        }),
        Box::new(ByteLowering),
    )
    .unwrap()
    .with_tracker(Box::new(tracker.clone()))
    .with_store(Box::new(OneBlockStore { guest: 0x9000 }));
    let ctx = t.create_thread_cache();

    let stored = t.compile_block(&ctx, 0x9000).unwrap();
    assert!(!stored.reused);
    // Pre-validated fragments must not trigger SMC page tracking.
    assert!(tracker.pages.lock().unwrap().is_empty());
    // But they are cached normally.
    assert!(t.compile_block(&ctx, 0x9000).unwrap().reused);

    // A regular compile still notifies.
    t.compile_block(&ctx, 0x5000).unwrap();
    assert_eq!(tracker.pages.lock().unwrap().len(), 1);
}
