use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::{Arc, Mutex};

/// A completion token for a submitted collective operation.
///
/// A handle is pending until the operation's state machine finishes,
/// at which point the poll driver signals it. Handles are consumed by
/// a successful `try_sync`/`wait_sync` and recycled to the consuming
/// thread's free list; a consumed handle compares equal to
/// [`CollHandle::INVALID`].
///
/// The address space is a (chunk, slot) pair so a handle stays
/// resolvable no matter which thread allocated or recycles it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CollHandle(u16);

impl CollHandle {
    /// The sentinel handle, distinguishable from every live handle.
    pub const INVALID: CollHandle = CollHandle(0xFFFF);

    /// Returns true unless this is the invalid sentinel.
    #[inline]
    pub fn is_valid(&self) -> bool {
        *self != CollHandle::INVALID
    }

    #[inline]
    fn new(chunk: usize, slot: usize) -> CollHandle {
        CollHandle(((chunk as u16) << 8) | slot as u16)
    }

    #[inline]
    fn chunk(&self) -> usize {
        (self.0 >> 8) as usize
    }

    #[inline]
    fn slot(&self) -> usize {
        (self.0 & 0xFF) as usize
    }
}

pub(crate) const HANDLE_CHUNK: usize = 256;

// Stride between consecutively handed-out slots, in words. 16 u32
// words per 64-byte line keeps neighbouring allocations off each
// other's cache lines.
const SCATTER_STRIDE: usize = 16;

struct HandleChunk {
    words: [AtomicU32; HANDLE_CHUNK],
}

impl HandleChunk {
    fn new() -> HandleChunk {
        HandleChunk {
            words: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }
}

/// Engine-wide handle storage. Chunks of 256 done-words are carved in
/// bulk and never freed until the engine is dropped; the free lists
/// threading through them are per-thread and live in `CollCtx`.
pub(crate) struct HandleStore {
    chunks: Mutex<Vec<Arc<HandleChunk>>>,
}

impl HandleStore {
    pub fn new() -> HandleStore {
        HandleStore {
            chunks: Mutex::new(Vec::new()),
        }
    }

    /// Allocates a fresh chunk and returns its handles, cache-line
    /// strided, ready to be pushed onto a thread's free stack.
    pub fn carve(&self) -> Vec<CollHandle> {
        let mut chunks = self.chunks.lock().unwrap();
        let chunk = chunks.len();
        assert!(chunk < 0xFF, "collective handle space exhausted");
        chunks.push(Arc::new(HandleChunk::new()));

        let mut out = Vec::with_capacity(HANDLE_CHUNK);
        for lap in 0..SCATTER_STRIDE {
            let mut slot = lap;
            while slot < HANDLE_CHUNK {
                out.push(CollHandle::new(chunk, slot));
                slot += SCATTER_STRIDE;
            }
        }
        // The free stack pops from the back; reverse so allocation
        // order follows the stride order.
        out.reverse();
        out
    }

    fn resolve(&self, handle: CollHandle) -> Arc<HandleChunk> {
        debug_assert!(handle.is_valid());
        let chunks = self.chunks.lock().unwrap();
        chunks[handle.chunk()].clone()
    }

    /// Resets a recycled handle to the pending state.
    pub fn reset(&self, handle: CollHandle) {
        self.resolve(handle).words[handle.slot()].store(0, Relaxed);
    }

    /// Marks the operation behind `handle` as done. The release store
    /// publishes every write the operation performed.
    pub fn signal(&self, handle: CollHandle) {
        assert!(handle.is_valid());
        self.resolve(handle).words[handle.slot()].store(1, Release);
    }

    /// Returns true once the handle has been signalled. The acquire
    /// load is the read fence the caller needs before touching
    /// transferred data.
    pub fn is_done(&self, handle: CollHandle) -> bool {
        assert!(handle.is_valid());
        self.resolve(handle).words[handle.slot()].load(Acquire) != 0
    }
}
