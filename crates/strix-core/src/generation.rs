//! Code-buffer generations.
//!
//! A generation is one (code buffer, shared map) pair. The two are only ever
//! replaced together; fragments from a retired generation stay executable for
//! threads still inside them, but no new lookup can reach them. The `Arc`s
//! release the backing memory once the last such thread moves on.

use std::sync::Arc;

use strix_backend::{BackendError, CodeBuffer};
use strix_cache::SharedMap;
use strix_sync::WritePriorityRwLock;
use tracing::info;

#[derive(Clone)]
pub struct Generation {
    pub buffer: Arc<CodeBuffer>,
    pub map: Arc<SharedMap>,
    /// Monotonic rotation counter; thread-local tiers are stamped with this
    /// so stale tiers are dropped on first use after a rotation.
    pub seq: u64,
}

pub struct GenerationManager {
    current: WritePriorityRwLock<Generation>,
    capacity: usize,
}

impl GenerationManager {
    pub fn new(capacity: usize) -> Result<Self, BackendError> {
        let gen = Generation {
            buffer: Arc::new(CodeBuffer::new(capacity)?),
            map: Arc::new(SharedMap::new()),
            seq: 0,
        };
        Ok(Self {
            current: WritePriorityRwLock::new(gen),
            capacity,
        })
    }

    pub fn current(&self) -> Generation {
        self.current.read().clone()
    }

    /// Rotates only if the caller's observed generation is still current.
    /// Two threads hitting buffer exhaustion at once otherwise rotate twice,
    /// throwing away a nearly empty buffer.
    pub fn rotate_if_current(&self, observed_seq: u64) -> Result<Generation, BackendError> {
        self.rotate_inner(Some(observed_seq))
    }

    /// Replaces the current generation with a fresh empty one and returns it.
    pub fn rotate(&self) -> Result<Generation, BackendError> {
        self.rotate_inner(None)
    }

    fn rotate_inner(&self, only_if_seq: Option<u64>) -> Result<Generation, BackendError> {
        // Reserve the fresh buffer outside the lock; the wasted reservation
        // on a lost race is dropped immediately.
        let fresh_buffer = Arc::new(CodeBuffer::new(self.capacity)?);
        let mut cur = self.current.write();
        if let Some(seq) = only_if_seq {
            if cur.seq != seq {
                return Ok(cur.clone());
            }
        }
        let next = Generation {
            buffer: fresh_buffer,
            map: Arc::new(SharedMap::new()),
            seq: cur.seq + 1,
        };
        info!(
            retired_seq = cur.seq,
            retired_bytes = cur.buffer.used(),
            "rotating code buffer generation"
        );
        *cur = next.clone();
        Ok(next)
    }

    // Fork protocol for the manager's own lock; the generation's shared map
    // is handled separately by the owner.

    pub fn lock_before_fork(&self) {
        self.current.lock_before_fork();
    }

    pub fn unlock_after_fork(&self) {
        self.current.unlock_after_fork();
    }

    pub fn steal_and_drop_active_locks(&self) {
        self.current.steal_and_drop_active_locks();
    }
}
