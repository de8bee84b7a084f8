//! Executable code-buffer generations.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use strix_types::FRAGMENT_ALIGN;

use crate::BackendError;

/// Per-fragment metadata appended directly after the fragment's code.
///
/// Generated code stores the address of this record into the thread state on
/// fragment entry, which is how the fault handler finds the fragment it is
/// patching. The layout is fixed because the entry prologue references it by
/// offset.
#[repr(C)]
pub struct FragmentTail {
    /// Spin-futex word serializing code patching within this fragment.
    pub patch_lock: AtomicU32,
    pub _pad: u32,
    /// Guest range this fragment was translated from.
    pub guest_start: u64,
    pub guest_len: u64,
    /// Host range of the fragment body, for icache maintenance after a patch.
    pub code_start: u64,
    pub code_len: u64,
}

impl FragmentTail {
    pub fn new(guest_start: u64, guest_len: u64, code_start: u64, code_len: u64) -> Self {
        Self {
            patch_lock: AtomicU32::new(0),
            _pad: 0,
            guest_start,
            guest_len,
            code_start,
            code_len,
        }
    }

    /// Takes the fragment's patch lock. Patching threads spin briefly and
    /// then sleep; the fault handler takes this before rewriting any word of
    /// the fragment.
    pub fn lock_patch(&self) -> strix_sync::RawSpinGuard<'_> {
        strix_sync::raw_spin_lock(&self.patch_lock)
    }
}

/// A finalized fragment inside a [`CodeBuffer`].
pub struct Fragment {
    /// Host address of the entry point.
    pub entry: usize,
    /// Host address of the [`FragmentTail`].
    pub tail: usize,
    /// Host addresses of each 16-byte exit trampoline, in emission order.
    pub exit_thunks: Vec<usize>,
    /// Total bytes consumed, tail included.
    pub len: usize,
}

impl Fragment {
    /// The tail record.
    ///
    /// # Safety
    /// The owning code buffer must still be alive and the fragment must not
    /// have been overwritten by a buffer reset.
    pub unsafe fn tail_ref(&self) -> &FragmentTail {
        &*(self.tail as *const FragmentTail)
    }
}

/// One generation of executable memory.
///
/// Allocation is a bump cursor; fragments are written by the compiling thread
/// before their entry address is published through the lookup cache, so the
/// only cross-thread accesses to fragment bytes after publication are the
/// word-sized atomic patches performed by the linker and the fault handler.
pub struct CodeBuffer {
    base: NonNull<u8>,
    capacity: usize,
    cursor: AtomicUsize,
}

unsafe impl Send for CodeBuffer {}
unsafe impl Sync for CodeBuffer {}

impl CodeBuffer {
    pub fn new(capacity: usize) -> Result<Self, BackendError> {
        let base = reserve(capacity)?;
        Ok(Self {
            base,
            capacity,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.used()
    }

    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base_addr();
        addr >= base && addr < base + self.capacity
    }

    /// Reserves `len` bytes, returning the host address of the reservation.
    pub fn allocate(&self, len: usize) -> Result<usize, BackendError> {
        let mut claimed = 0;
        let result = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                let start = align_up(cur, FRAGMENT_ALIGN);
                let end = start.checked_add(len)?;
                if end > self.capacity {
                    return None;
                }
                claimed = start;
                Some(end)
            });
        match result {
            Ok(_) => Ok(self.base_addr() + claimed),
            Err(_) => Err(BackendError::CodeBufferExhausted {
                requested: len,
                remaining: self.remaining(),
            }),
        }
    }

    /// Rewinds the bump cursor to empty.
    ///
    /// Only valid during a whole-cache clear, after every lookup that could
    /// reach code in this buffer has been removed.
    pub fn reset(&self) {
        self.cursor.store(0, Ordering::Release);
    }

    pub(crate) fn write_words(&self, addr: usize, words: &[u32]) {
        debug_assert!(self.contains(addr) && self.contains(addr + words.len() * 4 - 1));
        let ptr = addr as *mut u32;
        for (i, &w) in words.iter().enumerate() {
            // Plain stores: the fragment is unpublished while this runs.
            unsafe { ptr.add(i).write(w) };
        }
    }

    pub(crate) fn write_u64(&self, addr: usize, value: u64) {
        debug_assert!(addr % 8 == 0 && self.contains(addr) && self.contains(addr + 7));
        unsafe { (addr as *mut u64).write(value) };
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        release(self.base, self.capacity);
    }
}

fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

#[cfg(unix)]
fn reserve(capacity: usize) -> Result<NonNull<u8>, BackendError> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            capacity,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        let err = std::io::Error::last_os_error();
        return Err(BackendError::Reservation(err.to_string()));
    }
    NonNull::new(ptr.cast::<u8>())
        .ok_or_else(|| BackendError::Reservation("mmap returned null".into()))
}

#[cfg(unix)]
fn release(base: NonNull<u8>, capacity: usize) {
    unsafe { libc::munmap(base.as_ptr().cast(), capacity) };
}

#[cfg(not(unix))]
fn reserve(capacity: usize) -> Result<NonNull<u8>, BackendError> {
    let layout = std::alloc::Layout::from_size_align(capacity, FRAGMENT_ALIGN)
        .map_err(|e| BackendError::Reservation(e.to_string()))?;
    NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
        .ok_or_else(|| BackendError::Reservation("allocation failed".into()))
}

#[cfg(not(unix))]
fn release(base: NonNull<u8>, capacity: usize) {
    let layout = std::alloc::Layout::from_size_align(capacity, FRAGMENT_ALIGN)
        .unwrap_or_else(|_| std::alloc::Layout::new::<u8>());
    unsafe { std::alloc::dealloc(base.as_ptr(), layout) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_bounded() {
        let buf = CodeBuffer::new(256).unwrap();
        let a = buf.allocate(20).unwrap();
        let b = buf.allocate(4).unwrap();
        assert_eq!(a % FRAGMENT_ALIGN, 0);
        assert_eq!(b % FRAGMENT_ALIGN, 0);
        assert!(b >= a + 20);

        match buf.allocate(1024) {
            Err(BackendError::CodeBufferExhausted { requested, .. }) => {
                assert_eq!(requested, 1024);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        // Smaller requests still fit after a failed large one.
        buf.allocate(16).unwrap();
    }
}
