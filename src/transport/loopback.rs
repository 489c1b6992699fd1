//! The in-process reference fabric: every rank lives in one process,
//! segments are plain allocations, RMA is a direct copy, and active
//! messages ride per-rank MPMC queues drained by `poll`.
//!
//! The fabric exists so the engine can run (and be tested) without a
//! network; a conduit over real hardware implements the same four
//! traits.

use std::cell::Cell;
use std::io;
use std::sync::{Arc, Condvar, Mutex};

use concurrent_queue::ConcurrentQueue;
use indexmap::IndexMap;

use crate::team::Rank;
use crate::transport::{
    Am, AmHandler, Barrier, BarrierWait, Bootstrap, HandlerId, Rma, RmaHandle,
    BARRIERFLAG_ANONYMOUS,
};

const DEFAULT_MAX_MEDIUM: usize = 1024;
const DEFAULT_MAX_LONG: usize = 64 * 1024;

/// An in-process fabric connecting `ranks` loopback ports.
pub struct LoopbackFabric {
    inner: Arc<FabricInner>,
}

struct FabricInner {
    ranks: usize,
    max_medium: usize,
    max_long: usize,
    segments: Mutex<Vec<Option<(usize, usize)>>>,
    inboxes: Vec<ConcurrentQueue<Envelope>>,
    handlers: Vec<Mutex<IndexMap<HandlerId, Arc<dyn Fn(&[u32], &[u8]) + Send + Sync>>>>,
    barrier: Mutex<BarrierState>,
    barrier_cv: Condvar,
    gather: Mutex<GatherState>,
    gather_cv: Condvar,
}

struct Envelope {
    handler: HandlerId,
    args: Vec<u32>,
    payload: Vec<u8>,
    /// Segment offset to deposit the payload at before the handler
    /// runs (long requests).
    long_dst: Option<usize>,
}

struct BarrierState {
    notified: Vec<bool>,
    count: usize,
    generation: u64,
    /// Generation each rank's outstanding notify belongs to;
    /// `u64::MAX` when the rank is between barriers.
    rank_gen: Vec<u64>,
    value: Option<u32>,
    mismatch_cur: bool,
    mismatch_prev: bool,
}

struct GatherState {
    slots: Vec<Option<Vec<u8>>>,
    arrived: usize,
    departed: usize,
    result: Option<Arc<Vec<Vec<u8>>>>,
}

const NO_NOTIFY: u64 = u64::MAX;

impl LoopbackFabric {
    pub fn new(ranks: usize) -> LoopbackFabric {
        LoopbackFabric::with_limits(ranks, DEFAULT_MAX_MEDIUM, DEFAULT_MAX_LONG)
    }

    /// A fabric with explicit payload maxima, so fragmentation paths
    /// can be exercised with small messages.
    pub fn with_limits(ranks: usize, max_medium: usize, max_long: usize) -> LoopbackFabric {
        assert!(ranks > 0);
        LoopbackFabric {
            inner: Arc::new(FabricInner {
                ranks,
                max_medium,
                max_long,
                segments: Mutex::new(vec![None; ranks]),
                inboxes: (0..ranks).map(|_| ConcurrentQueue::unbounded()).collect(),
                handlers: (0..ranks).map(|_| Mutex::new(IndexMap::new())).collect(),
                barrier: Mutex::new(BarrierState {
                    notified: vec![false; ranks],
                    count: 0,
                    generation: 0,
                    rank_gen: vec![NO_NOTIFY; ranks],
                    value: None,
                    mismatch_cur: false,
                    mismatch_prev: false,
                }),
                barrier_cv: Condvar::new(),
                gather: Mutex::new(GatherState {
                    slots: vec![None; ranks],
                    arrived: 0,
                    departed: 0,
                    result: None,
                }),
                gather_cv: Condvar::new(),
            }),
        }
    }

    /// The transport endpoint for one rank. Hand each rank's engine
    /// its own port.
    pub fn port(&self, rank: Rank) -> LoopbackPort {
        assert!(rank < self.inner.ranks);
        LoopbackPort {
            rank,
            fabric: self.inner.clone(),
        }
    }
}

/// One rank's endpoint on a [`LoopbackFabric`].
pub struct LoopbackPort {
    rank: Rank,
    fabric: Arc<FabricInner>,
}

thread_local! {
    static NBI_DEPTH: Cell<usize> = const { Cell::new(0) };
}

impl FabricInner {
    /// Resolves `(rank, offset, len)` to a raw pointer into that
    /// rank's attached segment; out-of-segment access is fatal.
    fn seg_ptr(&self, rank: Rank, offset: usize, len: usize) -> *mut u8 {
        let segments = self.segments.lock().unwrap();
        let (base, seglen) = segments[rank].expect("target rank has no attached segment");
        assert!(
            offset.checked_add(len).map_or(false, |end| end <= seglen),
            "remote access [{}, +{}) outside rank {}'s segment of {} bytes",
            offset,
            len,
            rank,
            seglen
        );
        (base + offset) as *mut u8
    }

    fn deliver(&self, rank: Rank, env: Envelope) -> io::Result<()> {
        self.inboxes[rank]
            .push(env)
            .map_err(|_| io::Error::other("loopback inbox closed"))
    }
}

impl Rma for LoopbackPort {
    fn attach(&self, base: *mut u8, len: usize) {
        let mut segments = self.fabric.segments.lock().unwrap();
        assert!(segments[self.rank].is_none(), "segment already attached");
        segments[self.rank] = Some((base as usize, len));
    }

    fn put_nb(
        &self,
        node: Rank,
        dst: usize,
        src: *const u8,
        nbytes: usize,
    ) -> io::Result<RmaHandle> {
        let dst = self.fabric.seg_ptr(node, dst, nbytes);
        unsafe {
            std::ptr::copy_nonoverlapping(src, dst, nbytes);
        }
        Ok(RmaHandle::completed())
    }

    fn get_nb(
        &self,
        dst: *mut u8,
        node: Rank,
        src: usize,
        nbytes: usize,
    ) -> io::Result<RmaHandle> {
        let src = self.fabric.seg_ptr(node, src, nbytes);
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, dst, nbytes);
        }
        Ok(RmaHandle::completed())
    }

    fn put_nbi(&self, node: Rank, dst: usize, src: *const u8, nbytes: usize) -> io::Result<()> {
        debug_assert!(NBI_DEPTH.with(|d| d.get()) > 0, "put_nbi outside an access region");
        self.put_nb(node, dst, src, nbytes).map(|_| ())
    }

    fn get_nbi(&self, dst: *mut u8, node: Rank, src: usize, nbytes: usize) -> io::Result<()> {
        debug_assert!(NBI_DEPTH.with(|d| d.get()) > 0, "get_nbi outside an access region");
        self.get_nb(dst, node, src, nbytes).map(|_| ())
    }

    fn begin_nbi_region(&self) {
        NBI_DEPTH.with(|d| d.set(d.get() + 1));
    }

    fn end_nbi_region(&self) -> RmaHandle {
        NBI_DEPTH.with(|d| {
            assert!(d.get() > 0, "unbalanced access region");
            d.set(d.get() - 1);
        });
        RmaHandle::completed()
    }

    fn puti(
        &self,
        node: Rank,
        dstlist: &[usize],
        dstlen: usize,
        srclist: &[*const u8],
        srclen: usize,
    ) -> io::Result<RmaHandle> {
        assert_eq!(dstlist.len() * dstlen, srclist.len() * srclen);

        let mut src_iter = srclist.iter();
        let mut src_cur: *const u8 = std::ptr::null();
        let mut src_left = 0;

        for &dst_off in dstlist {
            let dst = self.fabric.seg_ptr(node, dst_off, dstlen);
            let mut written = 0;
            while written < dstlen {
                if src_left == 0 {
                    src_cur = *src_iter.next().expect("source list exhausted");
                    src_left = srclen;
                }
                let chunk = (dstlen - written).min(src_left);
                unsafe {
                    std::ptr::copy_nonoverlapping(src_cur, dst.add(written), chunk);
                    src_cur = src_cur.add(chunk);
                }
                src_left -= chunk;
                written += chunk;
            }
        }
        Ok(RmaHandle::completed())
    }

    fn puti_nbi(
        &self,
        node: Rank,
        dstlist: &[usize],
        dstlen: usize,
        srclist: &[*const u8],
        srclen: usize,
    ) -> io::Result<()> {
        debug_assert!(NBI_DEPTH.with(|d| d.get()) > 0, "puti_nbi outside an access region");
        self.puti(node, dstlist, dstlen, srclist, srclen).map(|_| ())
    }

    fn geti_nbi(
        &self,
        dstlist: &[*mut u8],
        dstlen: usize,
        node: Rank,
        srclist: &[usize],
        srclen: usize,
    ) -> io::Result<()> {
        debug_assert!(NBI_DEPTH.with(|d| d.get()) > 0, "geti_nbi outside an access region");
        self.geti(dstlist, dstlen, node, srclist, srclen).map(|_| ())
    }

    fn geti(
        &self,
        dstlist: &[*mut u8],
        dstlen: usize,
        node: Rank,
        srclist: &[usize],
        srclen: usize,
    ) -> io::Result<RmaHandle> {
        assert_eq!(dstlist.len() * dstlen, srclist.len() * srclen);

        let mut src_iter = srclist.iter();
        let mut src_cur: *const u8 = std::ptr::null();
        let mut src_left = 0;

        for &dst in dstlist {
            let mut written = 0;
            while written < dstlen {
                if src_left == 0 {
                    let off = *src_iter.next().expect("source list exhausted");
                    src_cur = self.fabric.seg_ptr(node, off, srclen);
                    src_left = srclen;
                }
                let chunk = (dstlen - written).min(src_left);
                unsafe {
                    std::ptr::copy_nonoverlapping(src_cur, dst.add(written), chunk);
                    src_cur = src_cur.add(chunk);
                }
                src_left -= chunk;
                written += chunk;
            }
        }
        Ok(RmaHandle::completed())
    }
}

impl Am for LoopbackPort {
    fn max_medium(&self) -> usize {
        self.fabric.max_medium
    }

    fn max_long(&self) -> usize {
        self.fabric.max_long
    }

    fn register(&self, id: HandlerId, handler: AmHandler) {
        let mut handlers = self.fabric.handlers[self.rank].lock().unwrap();
        let prev = handlers.insert(id, Arc::from(handler));
        assert!(prev.is_none(), "handler {} registered twice", id);
    }

    fn request_medium(
        &self,
        node: Rank,
        id: HandlerId,
        args: &[u32],
        payload: &[u8],
    ) -> io::Result<()> {
        assert!(payload.len() <= self.fabric.max_medium);
        self.fabric.deliver(
            node,
            Envelope {
                handler: id,
                args: args.to_vec(),
                payload: payload.to_vec(),
                long_dst: None,
            },
        )
    }

    fn request_long(
        &self,
        node: Rank,
        id: HandlerId,
        args: &[u32],
        payload: &[u8],
        dst: usize,
    ) -> io::Result<()> {
        assert!(payload.len() <= self.fabric.max_long);
        self.fabric.deliver(
            node,
            Envelope {
                handler: id,
                args: args.to_vec(),
                payload: payload.to_vec(),
                long_dst: Some(dst),
            },
        )
    }

    fn request_long_async(
        &self,
        node: Rank,
        id: HandlerId,
        args: &[u32],
        payload: &[u8],
        dst: usize,
    ) -> io::Result<()> {
        // The loopback copies out at send time, so the async variant
        // coincides with the synchronous one.
        self.request_long(node, id, args, payload, dst)
    }

    fn poll(&self) {
        while let Ok(env) = self.fabric.inboxes[self.rank].pop() {
            if let Some(dst) = env.long_dst {
                let dst = self.fabric.seg_ptr(self.rank, dst, env.payload.len());
                unsafe {
                    std::ptr::copy_nonoverlapping(env.payload.as_ptr(), dst, env.payload.len());
                }
            }

            let handler = {
                let handlers = self.fabric.handlers[self.rank].lock().unwrap();
                handlers
                    .get(&env.handler)
                    .unwrap_or_else(|| panic!("no handler registered for id {}", env.handler))
                    .clone()
            };
            handler(&env.args, &env.payload);
        }
    }
}

impl Barrier for LoopbackPort {
    fn notify(&self, value: u32, flags: u32) -> io::Result<()> {
        let mut state = self.fabric.barrier.lock().unwrap();

        assert!(
            !state.notified[self.rank] && state.rank_gen[self.rank] == NO_NOTIFY,
            "barrier notify without an intervening wait"
        );
        state.notified[self.rank] = true;
        state.rank_gen[self.rank] = state.generation;
        state.count += 1;

        if flags & BARRIERFLAG_ANONYMOUS == 0 {
            match state.value {
                None => state.value = Some(value),
                Some(v) if v != value => state.mismatch_cur = true,
                Some(_) => {}
            }
        }

        if state.count == self.fabric.ranks {
            state.generation += 1;
            state.count = 0;
            state.notified.iter_mut().for_each(|n| *n = false);
            state.mismatch_prev = state.mismatch_cur;
            state.mismatch_cur = false;
            state.value = None;
            self.fabric.barrier_cv.notify_all();
        }

        Ok(())
    }

    fn try_wait(&self, _value: u32, flags: u32) -> BarrierWait {
        let mut state = self.fabric.barrier.lock().unwrap();

        let notified_gen = state.rank_gen[self.rank];
        assert!(notified_gen != NO_NOTIFY, "barrier wait without notify");

        if state.generation > notified_gen {
            state.rank_gen[self.rank] = NO_NOTIFY;
            if state.mismatch_prev && flags & BARRIERFLAG_ANONYMOUS == 0 {
                BarrierWait::Mismatch
            } else {
                BarrierWait::Ready
            }
        } else {
            BarrierWait::NotReady
        }
    }

    fn wait(&self, value: u32, flags: u32) -> io::Result<()> {
        {
            let mut state = self.fabric.barrier.lock().unwrap();
            let notified_gen = state.rank_gen[self.rank];
            assert!(notified_gen != NO_NOTIFY, "barrier wait without notify");
            while state.generation <= notified_gen {
                state = self.fabric.barrier_cv.wait(state).unwrap();
            }
        }
        match self.try_wait_completed(value, flags) {
            BarrierWait::Mismatch => Err(io::Error::other("barrier mismatch")),
            _ => Ok(()),
        }
    }
}

impl LoopbackPort {
    /// Post-completion half of `wait`: consume the notify and report
    /// mismatch.
    fn try_wait_completed(&self, value: u32, flags: u32) -> BarrierWait {
        self.try_wait(value, flags)
    }
}

impl Bootstrap for LoopbackPort {
    fn ranks(&self) -> usize {
        self.fabric.ranks
    }

    fn my_rank(&self) -> Rank {
        self.rank
    }

    fn allgather(&self, mine: &[u8]) -> Vec<Vec<u8>> {
        let mut state = self.fabric.gather.lock().unwrap();

        // Wait out the drain phase of any previous round.
        while state.result.is_some() {
            state = self.fabric.gather_cv.wait(state).unwrap();
        }

        state.slots[self.rank] = Some(mine.to_vec());
        state.arrived += 1;

        if state.arrived == self.fabric.ranks {
            let all: Vec<Vec<u8>> = state.slots.iter_mut().map(|s| s.take().unwrap()).collect();
            state.result = Some(Arc::new(all));
            self.fabric.gather_cv.notify_all();
        } else {
            while state.result.is_none() {
                state = self.fabric.gather_cv.wait(state).unwrap();
            }
        }

        let result = state.result.as_ref().unwrap().as_ref().clone();

        state.departed += 1;
        if state.departed == self.fabric.ranks {
            state.arrived = 0;
            state.departed = 0;
            state.result = None;
            self.fabric.gather_cv.notify_all();
        }

        result
    }

    fn barrier(&self) {
        self.allgather(&[]);
    }
}
