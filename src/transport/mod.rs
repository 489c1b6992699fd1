//! The transport interfaces the collective engine consumes.
//!
//! The engine never talks to a network directly: bulk payloads go
//! through [`Rma`], small ones through [`Am`], team synchronization
//! through [`Barrier`], and init-time discovery through
//! [`Bootstrap`]. A remote RMA address is a `(rank, offset)` pair,
//! the offset taken within the target rank's registered segment.
//!
//! [`loopback`] provides the in-process reference fabric.

use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Acquire, Release};
use std::sync::Arc;

use crate::team::Rank;

pub mod loopback;

/// Index of a registered active-message handler.
pub type HandlerId = u8;

/// An incoming-request handler. For long requests the payload slice
/// has already been deposited at its destination; for medium requests
/// it is the transport's bounce buffer.
pub type AmHandler = Box<dyn Fn(&[u32], &[u8]) + Send + Sync>;

/// Request anonymous barrier matching: the barrier completes without
/// comparing the named values.
pub const BARRIERFLAG_ANONYMOUS: u32 = 0x1;

/// Result of a split-phase barrier try.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BarrierWait {
    Ready,
    NotReady,
    /// The named values of this barrier generation disagreed.
    Mismatch,
}

/// Completion tracking for one explicit non-blocking RMA operation or
/// one implicit access region.
#[derive(Clone)]
pub struct RmaHandle {
    done: Arc<AtomicBool>,
}

impl RmaHandle {
    /// A handle the transport will complete later.
    pub fn pending() -> RmaHandle {
        RmaHandle {
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle born complete (synchronous transports).
    pub fn completed() -> RmaHandle {
        RmaHandle {
            done: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Marks the operation done, publishing its remote writes.
    pub fn complete(&self) {
        self.done.store(true, Release);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Acquire)
    }
}

/// One-sided remote memory access. Bulk (memory-to-memory) semantics:
/// source bytes are not interpreted and may overlap nothing.
pub trait Rma: Send + Sync {
    /// Registers the local segment peers may address.
    fn attach(&self, base: *mut u8, len: usize);

    /// Non-blocking put with an explicit completion handle.
    fn put_nb(&self, node: Rank, dst: usize, src: *const u8, nbytes: usize)
        -> io::Result<RmaHandle>;

    /// Non-blocking get with an explicit completion handle.
    fn get_nb(&self, dst: *mut u8, node: Rank, src: usize, nbytes: usize)
        -> io::Result<RmaHandle>;

    /// Implicit-handle put inside the open access region.
    fn put_nbi(&self, node: Rank, dst: usize, src: *const u8, nbytes: usize) -> io::Result<()>;

    /// Implicit-handle get inside the open access region.
    fn get_nbi(&self, dst: *mut u8, node: Rank, src: usize, nbytes: usize) -> io::Result<()>;

    /// Opens an implicit access region on the calling thread.
    fn begin_nbi_region(&self);

    /// Closes the region, folding every implicit operation since
    /// `begin_nbi_region` into one handle.
    fn end_nbi_region(&self) -> RmaHandle;

    /// Indexed put: scatters the concatenation of the source list
    /// over the destination list on `node`. Both sides must describe
    /// the same number of bytes; the lists are consumed before the
    /// call returns.
    fn puti(
        &self,
        node: Rank,
        dstlist: &[usize],
        dstlen: usize,
        srclist: &[*const u8],
        srclen: usize,
    ) -> io::Result<RmaHandle>;

    /// Indexed get: gathers the concatenation of the source list on
    /// `node` into the destination list.
    fn geti(
        &self,
        dstlist: &[*mut u8],
        dstlen: usize,
        node: Rank,
        srclist: &[usize],
        srclen: usize,
    ) -> io::Result<RmaHandle>;

    /// `puti` folded into the open access region instead of an
    /// explicit handle.
    fn puti_nbi(
        &self,
        node: Rank,
        dstlist: &[usize],
        dstlen: usize,
        srclist: &[*const u8],
        srclen: usize,
    ) -> io::Result<()>;

    /// `geti` folded into the open access region.
    fn geti_nbi(
        &self,
        dstlist: &[*mut u8],
        dstlen: usize,
        node: Rank,
        srclist: &[usize],
        srclen: usize,
    ) -> io::Result<()>;

    /// Tests an explicit or region handle for completion.
    fn try_sync(&self, handle: &RmaHandle) -> bool {
        handle.is_done()
    }
}

/// Active messages: short bounded payloads delivered to registered
/// handlers on the target rank when it polls.
pub trait Am: Send + Sync {
    /// Largest medium-request payload.
    fn max_medium(&self) -> usize;

    /// Largest long-request payload.
    fn max_long(&self) -> usize;

    /// Registers the handler peers may request under `id`.
    fn register(&self, id: HandlerId, handler: AmHandler);

    /// Sends a buffered payload; the receiver's handler gets the
    /// bytes in a transport buffer.
    fn request_medium(
        &self,
        node: Rank,
        id: HandlerId,
        args: &[u32],
        payload: &[u8],
    ) -> io::Result<()>;

    /// Deposits the payload at `dst` (a segment offset on `node`)
    /// before the handler runs. Returns when the local source is
    /// reusable.
    fn request_long(
        &self,
        node: Rank,
        id: HandlerId,
        args: &[u32],
        payload: &[u8],
        dst: usize,
    ) -> io::Result<()>;

    /// As `request_long`, but may return before the local source is
    /// reusable.
    fn request_long_async(
        &self,
        node: Rank,
        id: HandlerId,
        args: &[u32],
        payload: &[u8],
        dst: usize,
    ) -> io::Result<()>;

    /// Drains this rank's inbox, running handlers inline.
    fn poll(&self);
}

/// The team-wide split-phase named barrier the consensus layer
/// sequences through.
pub trait Barrier: Send + Sync {
    /// Enters the barrier with a named value (compared across ranks
    /// unless `BARRIERFLAG_ANONYMOUS` is given).
    fn notify(&self, value: u32, flags: u32) -> io::Result<()>;

    /// Polls the barrier this rank last notified.
    fn try_wait(&self, value: u32, flags: u32) -> BarrierWait;

    /// Blocks until the barrier this rank last notified completes.
    fn wait(&self, value: u32, flags: u32) -> io::Result<()>;
}

/// Init-time discovery and small collectives, in the MPI-bootstrap
/// mold. Used only before the engine is live.
pub trait Bootstrap: Send + Sync {
    fn ranks(&self) -> usize;

    fn my_rank(&self) -> Rank;

    /// Every rank contributes one buffer; all ranks receive all
    /// buffers, indexed by rank.
    fn allgather(&self, mine: &[u8]) -> Vec<Vec<u8>>;

    /// Root's buffer, delivered everywhere.
    fn broadcast(&self, root: Rank, mine: &[u8]) -> Vec<u8> {
        self.allgather(mine).swap_remove(root)
    }

    /// Blocks until every rank arrives.
    fn barrier(&self);

    /// Tears the job down with a message.
    fn abort(&self, msg: &str) -> ! {
        panic!("bootstrap abort: {}", msg);
    }
}
