use std::ops;
use std::sync::Mutex;
use std::thread::ThreadId;

use crate::consensus::ConsensusId;
use crate::engine::{CollCtx, Engine};
use crate::flags::Flags;
use crate::handle::CollHandle;
use crate::p2p::P2pSlotRef;
use crate::team::Rank;
use crate::transport::RmaHandle;

// Raw-buffer newtypes. A submitted operation captures the caller's
// buffers as raw pointers; the caller must keep them valid and
// unaliased until the operation's handle completes. The newtypes
// exist so operation records can cross threads: publication of the
// bytes themselves is ordered by the handle/state atomics.

#[derive(Clone, Copy)]
#[repr(transparent)]
pub(crate) struct MutPtr(pub *mut u8);

unsafe impl Send for MutPtr {}
unsafe impl Sync for MutPtr {}

#[derive(Clone, Copy)]
#[repr(transparent)]
pub(crate) struct ConstPtr(pub *const u8);

unsafe impl Send for ConstPtr {}
unsafe impl Sync for ConstPtr {}

/// A caller-owned array of per-image destination pointers.
#[derive(Clone, Copy)]
pub(crate) struct MutList(pub *const *mut u8);

unsafe impl Send for MutList {}
unsafe impl Sync for MutList {}

impl MutList {
    /// Caller guarantees `i` is within the list the client passed.
    pub unsafe fn at(&self, i: usize) -> *mut u8 {
        *self.0.add(i)
    }
}

/// A caller-owned array of per-image source pointers.
#[derive(Clone, Copy)]
pub(crate) struct ConstList(pub *const *const u8);

unsafe impl Send for ConstList {}
unsafe impl Sync for ConstList {}

impl ConstList {
    pub unsafe fn at(&self, i: usize) -> *const u8 {
        *self.0.add(i)
    }
}

/*
 *
 * ===== Captured arguments =====
 *
 */

#[derive(Clone, Copy)]
pub(crate) struct BroadcastArgs {
    pub dst: MutPtr,
    pub src_node: Rank,
    pub src: ConstPtr,
    pub nbytes: usize,
}

#[derive(Clone, Copy)]
pub(crate) struct BroadcastMArgs {
    pub dstlist: MutList,
    pub src_node: Rank,
    pub src: ConstPtr,
    pub nbytes: usize,
}

#[derive(Clone, Copy)]
pub(crate) struct ScatterArgs {
    pub dst: MutPtr,
    pub src_node: Rank,
    pub src: ConstPtr,
    pub nbytes: usize,
}

#[derive(Clone, Copy)]
pub(crate) struct ScatterMArgs {
    pub dstlist: MutList,
    pub src_node: Rank,
    pub src: ConstPtr,
    pub nbytes: usize,
}

#[derive(Clone, Copy)]
pub(crate) struct GatherArgs {
    pub dst_node: Rank,
    pub dst: MutPtr,
    pub src: ConstPtr,
    pub nbytes: usize,
}

#[derive(Clone, Copy)]
pub(crate) struct GatherMArgs {
    pub dst_node: Rank,
    pub dst: MutPtr,
    pub srclist: ConstList,
    pub nbytes: usize,
}

#[derive(Clone, Copy)]
pub(crate) struct GatherAllArgs {
    pub dst: MutPtr,
    pub src: ConstPtr,
    pub nbytes: usize,
}

#[derive(Clone, Copy)]
pub(crate) struct GatherAllMArgs {
    pub dstlist: MutList,
    pub srclist: ConstList,
    pub nbytes: usize,
}

#[derive(Clone, Copy)]
pub(crate) struct ExchangeArgs {
    pub dst: MutPtr,
    pub src: ConstPtr,
    pub nbytes: usize,
}

#[derive(Clone, Copy)]
pub(crate) struct ExchangeMArgs {
    pub dstlist: MutList,
    pub srclist: ConstList,
    pub nbytes: usize,
}

/// The arguments captured at submission, tagged by collective.
#[derive(Clone, Copy)]
pub(crate) enum CollArgs {
    Broadcast(BroadcastArgs),
    BroadcastM(BroadcastMArgs),
    Scatter(ScatterArgs),
    ScatterM(ScatterMArgs),
    Gather(GatherArgs),
    GatherM(GatherMArgs),
    GatherAll(GatherAllArgs),
    GatherAllM(GatherAllMArgs),
    Exchange(ExchangeArgs),
    ExchangeM(ExchangeMArgs),
}

macro_rules! args_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self) -> $ty {
            match self {
                CollArgs::$variant(a) => *a,
                _ => unreachable!("poll function bound to a different collective"),
            }
        }
    };
}

impl CollArgs {
    args_accessor!(broadcast, Broadcast, BroadcastArgs);
    args_accessor!(broadcast_m, BroadcastM, BroadcastMArgs);
    args_accessor!(scatter, Scatter, ScatterArgs);
    args_accessor!(scatter_m, ScatterM, ScatterMArgs);
    args_accessor!(gather, Gather, GatherArgs);
    args_accessor!(gather_m, GatherM, GatherMArgs);
    args_accessor!(gather_all, GatherAll, GatherAllArgs);
    args_accessor!(gather_all_m, GatherAllM, GatherAllMArgs);
    args_accessor!(exchange, Exchange, ExchangeArgs);
    args_accessor!(exchange_m, ExchangeM, ExchangeMArgs);
}

/*
 *
 * ===== Generic per-op options =====
 *
 */

/// Options enabled on an operation's generic data, derived from the
/// client flags by each algorithm variant's constructor.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct Options(u8);

const OPT_INSYNC: u8 = 0b001;
const OPT_OUTSYNC: u8 = 0b010;
const OPT_P2P: u8 = 0b100;

impl Options {
    pub fn empty() -> Options {
        Options(0)
    }

    pub fn insync_if(cond: bool) -> Options {
        Options(if cond { OPT_INSYNC } else { 0 })
    }

    pub fn outsync_if(cond: bool) -> Options {
        Options(if cond { OPT_OUTSYNC } else { 0 })
    }

    pub fn p2p_if(cond: bool) -> Options {
        Options(if cond { OPT_P2P } else { 0 })
    }

    pub fn insync(&self) -> bool {
        self.0 & OPT_INSYNC != 0
    }

    pub fn outsync(&self) -> bool {
        self.0 & OPT_OUTSYNC != 0
    }

    pub fn p2p(&self) -> bool {
        self.0 & OPT_P2P != 0
    }
}

impl ops::BitOr for Options {
    type Output = Options;

    fn bitor(self, other: Options) -> Options {
        Options(self.0 | other.0)
    }
}

/// Algorithm-private scratch carried across polls.
pub(crate) enum Private {
    None,
    /// Sub-operation handles (gather-all / exchange compositions).
    Handles(Vec<CollHandle>),
    /// Sub-operation handles plus the reindexed source-pointer
    /// matrix (exchangeM). Sub-operations hold raw views into the
    /// matrix, so it must stay untouched until the op is freed.
    Exchange {
        handles: Vec<CollHandle>,
        srcs: Vec<ConstPtr>,
    },
}

/// The mutable half of an operation record.
pub(crate) struct GenericData {
    /// Current state of the per-algorithm state machine.
    pub state: u32,
    pub options: Options,
    /// Thread that submitted the op; only the owner may initiate or
    /// sync RMA on this transport.
    pub owner: ThreadId,
    pub in_barrier: Option<ConsensusId>,
    pub out_barrier: Option<ConsensusId>,
    pub p2p: Option<P2pSlotRef>,
    pub handle: Option<RmaHandle>,
    pub private: Private,
    pub args: CollArgs,
}

impl GenericData {
    pub fn new(args: CollArgs, options: Options) -> GenericData {
        GenericData {
            state: 0,
            options,
            owner: std::thread::current().id(),
            in_barrier: None,
            out_barrier: None,
            p2p: None,
            handle: None,
            private: Private::None,
            args,
        }
    }

    pub fn is_owner(&self, ctx: &CollCtx) -> bool {
        self.owner == ctx.thread_id()
    }
}

/*
 *
 * ===== Operation records =====
 *
 */

pub(crate) type PollFn = fn(&Engine, &CollCtx, &CollOp, &mut GenericData) -> PollOutcome;

/// An in-flight collective operation. The immutable identity is fixed
/// at submission; the state machine lives behind the data mutex,
/// which the poll driver holds only for the duration of one poll
/// call.
pub(crate) struct CollOp {
    pub team_id: u32,
    pub sequence: u32,
    pub flags: Flags,
    /// Client-visible handle; invalid when the op is aggregated.
    pub handle: CollHandle,
    /// Aggregation group this op retires into, if any.
    pub agg: Option<usize>,
    pub poll_fn: PollFn,
    pub data: Mutex<GenericData>,
}

/// Result bits of one poll call. `COMPLETE` signals the handle (or
/// retires the aggregate member); `INACTIVE` unlinks and destroys the
/// op. Algorithms report both together in their terminal state.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct PollOutcome(u8);

const OP_COMPLETE: u8 = 0b01;
const OP_INACTIVE: u8 = 0b10;

impl PollOutcome {
    pub fn pending() -> PollOutcome {
        PollOutcome(0)
    }

    pub fn finished() -> PollOutcome {
        PollOutcome(OP_COMPLETE | OP_INACTIVE)
    }

    pub fn is_pending(&self) -> bool {
        self.0 == 0
    }

    pub fn complete(&self) -> bool {
        self.0 & OP_COMPLETE != 0
    }

    pub fn inactive(&self) -> bool {
        self.0 & OP_INACTIVE != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_combine() {
        let o = Options::insync_if(true) | Options::outsync_if(false) | Options::p2p_if(true);
        assert!(o.insync());
        assert!(!o.outsync());
        assert!(o.p2p());
        assert_eq!(Options::empty(), Options::insync_if(false));
    }

    #[test]
    fn outcome_bits() {
        assert!(PollOutcome::pending().is_pending());
        let done = PollOutcome::finished();
        assert!(done.complete());
        assert!(done.inactive());
        assert!(!done.is_pending());
    }
}
