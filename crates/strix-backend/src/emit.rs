//! Fragment emission.

use strix_types::FRAGMENT_ALIGN;

use crate::buffer::{CodeBuffer, Fragment, FragmentTail};
use crate::link::{runtime_linker, unlinked_first_word, THUNK_SIZE, THUNK_SLOT_OFFSET};
use crate::words;
use crate::BackendError;

/// Byte offsets into the per-thread state block referenced by generated code,
/// plus the register holding its base.
#[derive(Debug, Clone, Copy)]
pub struct ThreadStateLayout {
    /// Slot holding the current fragment-tail address.
    pub current_fragment: u32,
    /// 32-bit flag checked on fragment entry; nonzero requests a suspend
    /// exit before any guest work.
    pub suspend_flag: u32,
    /// Register number pinned to the state base.
    pub state_reg: u32,
}

impl Default for ThreadStateLayout {
    fn default() -> Self {
        Self {
            current_fragment: 0,
            suspend_flag: 8,
            state_reg: 28,
        }
    }
}

/// Number of prologue words emitted ahead of every fragment body.
const PROLOGUE_WORDS: usize = 4;

/// Builds one fragment: entry prologue, lowered body, exit trampolines, and
/// the tail record, laid out contiguously in the code buffer.
///
/// Exit trampoline addresses are not known until [`Emitter::finalize`], so
/// body branches into them go through [`Emitter::branch_to_exit`], which
/// leaves a placeholder that finalize patches.
pub struct Emitter<'a> {
    buf: &'a CodeBuffer,
    layout: ThreadStateLayout,
    guest_start: u64,
    guest_len: u64,
    body: Vec<u32>,
    /// (body word index, exit index) pairs awaiting displacement fixup.
    pending_branches: Vec<(usize, usize)>,
    exit_count: usize,
}

/// Exit index reserved for the entry suspend check.
pub const SUSPEND_EXIT: usize = 0;

impl<'a> Emitter<'a> {
    pub fn new(buf: &'a CodeBuffer, layout: ThreadStateLayout, guest_start: u64, guest_len: u64) -> Self {
        Self {
            buf,
            layout,
            guest_start,
            guest_len,
            body: Vec::new(),
            pending_branches: Vec::new(),
            // Exit 0 is the suspend path targeted by the prologue.
            exit_count: 1,
        }
    }

    pub fn push_word(&mut self, word: u32) {
        self.body.push(word);
    }

    pub fn push_words(&mut self, words: &[u32]) {
        self.body.extend_from_slice(words);
    }

    /// Reserves a fresh exit trampoline and returns its index.
    pub fn add_exit(&mut self) -> usize {
        let idx = self.exit_count;
        self.exit_count += 1;
        idx
    }

    /// Emits a direct branch from the body into exit `exit`.
    pub fn branch_to_exit(&mut self, exit: usize) {
        debug_assert!(exit < self.exit_count);
        self.pending_branches.push((self.body.len(), exit));
        self.body.push(words::NOP);
    }

    /// Lays the fragment out in the buffer. On exhaustion the caller rotates
    /// generations and re-emits into a fresh buffer.
    pub fn finalize(mut self) -> Result<Fragment, BackendError> {
        let prologue_len = PROLOGUE_WORDS * 4;
        let body_len = align_up(self.body.len() * 4, FRAGMENT_ALIGN);
        let thunks_len = self.exit_count * THUNK_SIZE;
        // Tail literal plus the tail record itself.
        let tail_lit_len = 8;
        let total = prologue_len + body_len + thunks_len + tail_lit_len
            + std::mem::size_of::<FragmentTail>();

        let base = self.buf.allocate(total)?;
        let body_start = base + prologue_len;
        let thunks_start = base + prologue_len + body_len;
        let tail_lit = thunks_start + thunks_len;
        let tail = tail_lit + tail_lit_len;

        // Patch pending exit branches now that trampoline addresses exist.
        for (word_idx, exit) in std::mem::take(&mut self.pending_branches) {
            let site = body_start + word_idx * 4;
            let target = thunks_start + exit * THUNK_SIZE;
            let branch = words::b(target as i64 - site as i64).ok_or_else(|| {
                BackendError::Reservation("fragment exceeds direct branch range".into())
            })?;
            self.body[word_idx] = branch;
        }

        let layout = self.layout;
        let prologue = [
            words::ldr_literal_x(16, (tail_lit - base) as i64),
            words::str_x_imm(16, layout.state_reg, layout.current_fragment),
            words::ldr_w_imm(17, layout.state_reg, layout.suspend_flag),
            // Word 3 sits at base + 12.
            words::cbnz_w(
                17,
                (thunks_start + SUSPEND_EXIT * THUNK_SIZE) as i64 - (base + 12) as i64,
            ),
        ];
        self.buf.write_words(base, &prologue);
        self.buf.write_words(body_start, &self.body);

        let mut exit_thunks = Vec::with_capacity(self.exit_count);
        let linker = runtime_linker() as u64;
        for i in 0..self.exit_count {
            let thunk = thunks_start + i * THUNK_SIZE;
            self.buf
                .write_words(thunk, &[unlinked_first_word(), words::BLR_X16]);
            self.buf.write_u64(thunk + THUNK_SLOT_OFFSET, linker);
            exit_thunks.push(thunk);
        }

        self.buf.write_u64(tail_lit, tail as u64);
        let record = FragmentTail::new(
            self.guest_start,
            self.guest_len,
            base as u64,
            (prologue_len + body_len + thunks_len) as u64,
        );
        // The tail lives in buffer memory so generated code and the fault
        // handler can reach it by address.
        unsafe { (tail as *mut FragmentTail).write(record) };

        crate::icache::clear_icache(base, total);
        Ok(Fragment {
            entry: base,
            tail,
            exit_thunks,
            len: total,
        })
    }
}

fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}
