use std::cell::{Cell, RefCell};
use std::io;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;

use log::{debug, trace};

use crate::active::ActiveList;
use crate::agg::AggTable;
use crate::coll;
use crate::consensus::Consensus;
use crate::error::SyncError;
use crate::flags::Flags;
use crate::handle::{CollHandle, HandleStore};
use crate::op::{CollOp, GenericData, PollFn, Private};
use crate::p2p::{self, P2pTable, H_EAGER, H_PUT_SIGNAL};
use crate::segment::{SegTable, Segment};
use crate::team::{Image, ImageMap, Rank, Team};
use crate::transport::{Am, Barrier, Bootstrap, Rma};

/// Arbitrary non-zero starting value for the op sequence space; also
/// the named value of the init barrier.
const SEQUENCE_START: u32 = 12345;

/// Fatal wrapper around transport calls: the engine cannot recover a
/// collective once a peer-visible side effect may have been issued.
pub(crate) fn safe<T>(result: io::Result<T>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("transport failure: {}", e),
    }
}

/// Counters exposed with the `stats` feature.
#[cfg(feature = "stats")]
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub ops_submitted: usize,
    pub barriers_issued: usize,
    pub eager_messages: usize,
}

/// The per-rank collective engine: every piece of mutable state the
/// collectives need, bundled behind one object so nothing leaks into
/// globals.
pub(crate) struct Engine {
    rma: Arc<dyn Rma>,
    am: Arc<dyn Am>,
    barrier: Arc<dyn Barrier>,
    team: ImageMap,
    segs: SegTable,
    sequence: AtomicU32,
    pub(crate) active: Mutex<ActiveList>,
    poll_lock: Mutex<()>,
    pub(crate) agg: AggTable,
    pub(crate) p2p: P2pTable,
    pub(crate) consensus: Consensus,
    pub(crate) handles: HandleStore,
    latch: Mutex<usize>,
    latch_cv: Condvar,
    #[cfg(feature = "stats")]
    stats_ops: std::sync::atomic::AtomicUsize,
    #[cfg(feature = "stats")]
    stats_eager: std::sync::atomic::AtomicUsize,
}

impl Engine {
    pub fn rma(&self) -> &dyn Rma {
        &*self.rma
    }

    pub fn am(&self) -> &dyn Am {
        &*self.am
    }

    pub fn barrier(&self) -> &dyn Barrier {
        &*self.barrier
    }

    pub fn team(&self) -> &ImageMap {
        &self.team
    }

    pub fn segs(&self) -> &SegTable {
        &self.segs
    }

    pub fn my_rank(&self) -> Rank {
        self.team.my_rank()
    }

    pub fn ranks(&self) -> usize {
        self.team.ranks()
    }

    #[cfg(feature = "stats")]
    pub fn count_eager_message(&self) {
        self.stats_eager.fetch_add(1, Relaxed);
    }

    #[cfg(not(feature = "stats"))]
    pub fn count_eager_message(&self) {}

    /// Common validation for every collective entry point.
    pub(crate) fn validate(&self, team: Team, flags: Flags) {
        assert_eq!(team, Team::ALL, "only the all team is supported");
        flags.validate();
    }

    /*
     *
     * ===== Submission =====
     *
     */

    /// Creates an op around caller-provided generic data and a poll
    /// function, allocates its synchronization resources, and enters
    /// it via the aggregation filter. Returns the client handle.
    pub(crate) fn op_generic_init(
        &self,
        ctx: &CollCtx,
        team: Team,
        flags: Flags,
        mut data: GenericData,
        poll_fn: PollFn,
    ) -> CollHandle {
        let sequence = self.sequence.fetch_add(1, Relaxed);

        if data.options.insync() {
            data.in_barrier = Some(self.consensus.create());
        }
        if data.options.outsync() {
            data.out_barrier = Some(self.consensus.create());
        }
        if data.options.p2p() {
            data.p2p = Some(self.p2p.get(team.id(), sequence));
        }

        let handle = if flags.is_aggregate() {
            CollHandle::INVALID
        } else {
            ctx.handle_create()
        };

        let decision = self.agg.filter(flags.is_aggregate(), handle);
        // An absorbed op never owns a handle itself; the group does.
        let op_handle = if decision.group.is_some() {
            CollHandle::INVALID
        } else {
            decision.handle
        };

        let op = Arc::new(CollOp {
            team_id: team.id(),
            sequence,
            flags,
            handle: op_handle,
            agg: decision.group,
            poll_fn,
            data: Mutex::new(data),
        });

        trace!("submitting op seq={} flags={:?}", sequence, flags);
        #[cfg(feature = "stats")]
        self.stats_ops.fetch_add(1, Relaxed);

        self.active.lock().unwrap().insert(op);

        if decision.handle.is_valid() {
            ctx.note_outstanding();
        }
        decision.handle
    }

    /*
     *
     * ===== The poll driver =====
     *
     */

    /// Walks the active list once, advancing every op's state
    /// machine. Only one thread runs the driver at a time; a thread
    /// with no work of its own only try-locks so it cannot starve a
    /// thread that must make progress on its own RMA.
    pub(crate) fn poll(&self, ctx: &CollCtx) {
        let _poll_guard = if ctx.outstanding.get() > 0 {
            self.poll_lock.lock().unwrap()
        } else {
            match self.poll_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => return,
            }
        };

        let mut cursor = self.active.lock().unwrap().head();

        while let Some(idx) = cursor {
            let op = self.active.lock().unwrap().op(idx).clone();

            // The list lock is never held across a poll function.
            let outcome = {
                let mut data = op.data.lock().unwrap();
                (op.poll_fn)(self, ctx, &op, &mut data)
            };

            let mut list = self.active.lock().unwrap();
            cursor = list.next(idx);
            if !outcome.is_pending() {
                trace!("op seq={} outcome={:?}", op.sequence, outcome);
                if outcome.complete() {
                    if op.handle.is_valid() {
                        self.handles.signal(op.handle);
                    } else if let Some(gid) = op.agg {
                        self.agg.member_done(gid, &self.handles);
                    }
                }
                if outcome.inactive() {
                    list.remove(idx);
                }
            }
        }
    }

    /*
     *
     * ===== Shared state-machine predicates =====
     *
     */

    /// IN-synchronization predicate for state 0.
    pub(crate) fn insync(&self, data: &GenericData) -> bool {
        match data.in_barrier {
            Some(id) if data.options.insync() => self.consensus.try_reach(id, self.barrier()),
            _ => true,
        }
    }

    /// OUT-synchronization predicate for the terminal state.
    pub(crate) fn outsync(&self, data: &GenericData) -> bool {
        match data.out_barrier {
            Some(id) if data.options.outsync() => self.consensus.try_reach(id, self.barrier()),
            _ => true,
        }
    }

    /// Local completion of the op's issued RMA. Only the owner thread
    /// may drive the transport handle.
    pub(crate) fn syncnb(&self, ctx: &CollCtx, data: &mut GenericData) -> bool {
        match &data.handle {
            None => true,
            Some(h) => {
                if data.is_owner(ctx) && self.rma.try_sync(h) {
                    data.handle = None;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Tests a vector of sub-operation handles, invalidating each as
    /// it completes. True once all are invalid.
    pub(crate) fn coll_sync(&self, ctx: &CollCtx, handles: &mut [CollHandle]) -> bool {
        let mut done = true;
        for h in handles.iter_mut() {
            if h.is_valid() {
                if ctx.handle_done(*h) {
                    *h = CollHandle::INVALID;
                } else {
                    done = false;
                }
            }
        }
        done
    }

    /// Releases an op's generic resources in its terminal state.
    pub(crate) fn generic_free(&self, op: &CollOp, data: &mut GenericData) {
        if data.options.p2p() && data.p2p.take().is_some() {
            self.p2p.free(op.team_id, op.sequence);
        }
        data.private = Private::None;
        data.handle = None;
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert!(
                self.active.lock().unwrap().is_empty(),
                "engine teardown with a non-empty active list"
            );
            self.p2p.assert_empty();
        }
    }
}

/// A clonable handle on one rank's collective engine.
#[derive(Clone)]
pub struct Collectives {
    inner: Arc<Engine>,
}

impl Collectives {
    /// Brings up the engine on this rank.
    ///
    /// `images` gives the image count of every rank; `my_image` is
    /// the calling thread's image. `fn_count` (user-registered
    /// collective functions) must be zero. One thread per rank calls
    /// `init`; every image thread, this one included, then calls
    /// [`Collectives::attach_thread`].
    pub fn init<T>(
        transport: Arc<T>,
        segment: Segment,
        images: &[usize],
        my_image: Image,
        fn_count: usize,
        init_flags: u32,
    ) -> Collectives
    where
        T: Rma + Am + Barrier + Bootstrap + 'static,
    {
        assert!(
            fn_count == 0,
            "collective function registration is not supported"
        );
        assert!(init_flags == 0, "init does not accept flags");

        let boot: Arc<dyn Bootstrap> = transport.clone();
        let my_rank = boot.my_rank();
        assert_eq!(images.len(), boot.ranks());

        let team = ImageMap::build(images, my_rank);
        assert!(my_image < team.total_images());
        debug_assert_eq!(team.rank_of_image(my_image), my_rank);

        let rma: Arc<dyn Rma> = transport.clone();
        rma.attach(segment.base(), segment.len());

        // Exchange segment ranges so any rank can resolve any
        // image's in-segment address to an offset.
        let mut mine = Vec::with_capacity(16);
        mine.extend_from_slice(&(segment.base() as u64).to_le_bytes());
        mine.extend_from_slice(&(segment.len() as u64).to_le_bytes());
        let ranges = boot
            .allgather(&mine)
            .iter()
            .map(|raw| {
                let base = u64::from_le_bytes(raw[0..8].try_into().unwrap());
                let len = u64::from_le_bytes(raw[8..16].try_into().unwrap());
                (base as usize, len as usize)
            })
            .collect();

        let total_images = team.total_images();
        let my_images = team.my_images();
        let ranks = team.ranks();

        let engine = Arc::new(Engine {
            rma,
            am: transport.clone(),
            barrier: transport.clone(),
            team,
            segs: SegTable::new(ranges, my_rank),
            sequence: AtomicU32::new(SEQUENCE_START),
            active: Mutex::new(ActiveList::new()),
            poll_lock: Mutex::new(()),
            agg: AggTable::new(),
            p2p: P2pTable::new(total_images),
            consensus: Consensus::new(),
            handles: HandleStore::new(),
            latch: Mutex::new(my_images),
            latch_cv: Condvar::new(),
            #[cfg(feature = "stats")]
            stats_ops: std::sync::atomic::AtomicUsize::new(0),
            #[cfg(feature = "stats")]
            stats_eager: std::sync::atomic::AtomicUsize::new(0),
        });

        let weak = Arc::downgrade(&engine);
        engine.am().register(
            H_PUT_SIGNAL,
            Box::new(move |args, payload| {
                if let Some(engine) = weak.upgrade() {
                    p2p::put_signal_request(&engine.p2p, args, payload);
                }
            }),
        );
        let weak = Arc::downgrade(&engine);
        engine.am().register(
            H_EAGER,
            Box::new(move |args, payload| {
                if let Some(engine) = weak.upgrade() {
                    p2p::eager_request(&engine.p2p, args, payload);
                }
            }),
        );

        // Everyone must be attached and listening before any
        // collective traffic flows.
        safe(engine.barrier().notify(SEQUENCE_START, 0));
        safe(engine.barrier().wait(SEQUENCE_START, 0));

        debug!(
            "collectives up: rank {}/{}, {} images total (max {} per rank)",
            my_rank,
            ranks,
            total_images,
            engine.team.max_images()
        );

        Collectives { inner: engine }
    }

    /// Per-thread entry: returns this thread's context once every
    /// local image thread has arrived.
    pub fn attach_thread(&self) -> CollCtx {
        {
            let mut remain = self.inner.latch.lock().unwrap();
            assert!(*remain > 0, "more attach_thread calls than local images");
            *remain -= 1;
            if *remain == 0 {
                self.inner.latch_cv.notify_all();
            } else {
                while *remain > 0 {
                    remain = self.inner.latch_cv.wait(remain).unwrap();
                }
            }
        }

        CollCtx {
            engine: self.inner.clone(),
            thread: std::thread::current().id(),
            handle_free: RefCell::new(Vec::new()),
            outstanding: Cell::new(0),
        }
    }

    /// Snapshot of the engine's counters.
    #[cfg(feature = "stats")]
    pub fn stats(&self) -> Stats {
        Stats {
            ops_submitted: self.inner.stats_ops.load(Relaxed),
            barriers_issued: self.inner.consensus.issued() as usize,
            eager_messages: self.inner.stats_eager.load(Relaxed),
        }
    }

    #[cfg(test)]
    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.inner
    }
}

/// A per-thread view of the engine. Every public call threads
/// through the context: it owns this thread's handle free list and
/// identifies the submitting thread for RMA ownership.
pub struct CollCtx {
    engine: Arc<Engine>,
    thread: ThreadId,
    handle_free: RefCell<Vec<CollHandle>>,
    outstanding: Cell<usize>,
}

impl CollCtx {
    pub(crate) fn thread_id(&self) -> ThreadId {
        self.thread
    }

    pub(crate) fn note_outstanding(&self) {
        self.outstanding.set(self.outstanding.get() + 1);
    }

    /// A fresh pending handle owned by this thread.
    pub(crate) fn handle_create(&self) -> CollHandle {
        let mut free = self.handle_free.borrow_mut();
        let handle = match free.pop() {
            Some(h) => h,
            None => {
                free.extend(self.engine.handles.carve());
                free.pop().unwrap()
            }
        };
        self.engine.handles.reset(handle);
        handle
    }

    /// Consumes the handle if signalled, recycling it to this
    /// thread's free list. The acquire in `is_done` is the read
    /// fence for any transferred data.
    pub(crate) fn handle_done(&self, handle: CollHandle) -> bool {
        if self.engine.handles.is_done(handle) {
            self.handle_free.borrow_mut().push(handle);
            self.outstanding.set(self.outstanding.get().saturating_sub(1));
            true
        } else {
            false
        }
    }

    /// Drives transport and collective progress once.
    pub fn poll(&self) {
        self.engine.am().poll();
        self.engine.poll(self);
    }

    /*
     *
     * ===== Synchronization =====
     *
     */

    /// Polls progress and tests one handle, consuming it on success.
    pub fn try_sync(&self, handle: &mut CollHandle) -> Result<(), SyncError> {
        if !handle.is_valid() {
            return Err(SyncError::InvalidHandle);
        }

        self.poll();

        if self.handle_done(*handle) {
            *handle = CollHandle::INVALID;
            Ok(())
        } else {
            Err(SyncError::NotReady)
        }
    }

    /// Succeeds if any valid handle in the list completed (or the
    /// list holds none), invalidating the completed entries.
    pub fn try_sync_some(&self, handles: &mut [CollHandle]) -> Result<(), SyncError> {
        self.poll();

        let mut empty = true;
        let mut result = Err(SyncError::NotReady);
        for h in handles.iter_mut() {
            if h.is_valid() {
                empty = false;
                if self.handle_done(*h) {
                    *h = CollHandle::INVALID;
                    result = Ok(());
                }
            }
        }

        if empty {
            Ok(())
        } else {
            result
        }
    }

    /// Succeeds once every handle in the list is invalid,
    /// invalidating those that completed on this pass.
    pub fn try_sync_all(&self, handles: &mut [CollHandle]) -> Result<(), SyncError> {
        self.poll();

        let mut result = Ok(());
        for h in handles.iter_mut() {
            if h.is_valid() {
                if self.handle_done(*h) {
                    *h = CollHandle::INVALID;
                } else {
                    result = Err(SyncError::NotReady);
                }
            }
        }
        result
    }

    /// Blocks (poll-spinning) until the handle completes.
    pub fn wait_sync(&self, handle: &mut CollHandle) {
        loop {
            match self.try_sync(handle) {
                Ok(()) => return,
                Err(SyncError::InvalidHandle) => return,
                Err(SyncError::NotReady) => std::thread::yield_now(),
            }
        }
    }

    /// Blocks until every handle completes.
    pub fn wait_sync_all(&self, handles: &mut [CollHandle]) {
        while self.try_sync_all(handles).is_err() {
            std::thread::yield_now();
        }
    }

    /// Blocks until at least one handle completes.
    pub fn wait_sync_some(&self, handles: &mut [CollHandle]) {
        while self.try_sync_some(handles).is_err() {
            std::thread::yield_now();
        }
    }

    /*
     *
     * ===== Aggregation regions =====
     *
     */

    /// Opens an aggregation access region on this rank.
    pub fn begin_nbi_accessregion(&self) {
        self.engine.agg.begin_region();
    }

    /// Closes the region, returning the single handle covering every
    /// operation submitted inside it.
    pub fn end_nbi_accessregion(&self) -> CollHandle {
        let handle = self
            .engine
            .agg
            .end_region(&self.engine.handles, || self.handle_create());
        self.note_outstanding();
        handle
    }

    /*
     *
     * ===== Collective submissions =====
     *
     * The caller keeps every buffer (and address list) valid and
     * unaliased until the returned handle completes; that contract is
     * what makes these unsafe.
     */

    /// Broadcast `nbytes` from image `src_image`'s `src` into every
    /// image's `dst`.
    pub unsafe fn broadcast_nb(
        &self,
        team: Team,
        dst: *mut u8,
        src_image: Image,
        src: *const u8,
        nbytes: usize,
        flags: Flags,
    ) -> CollHandle {
        coll::broadcast::broadcast_nb(&self.engine, self, team, dst, src_image, src, nbytes, flags)
    }

    /// Broadcast into a per-image destination list.
    pub unsafe fn broadcast_m_nb(
        &self,
        team: Team,
        dstlist: *const *mut u8,
        src_image: Image,
        src: *const u8,
        nbytes: usize,
        flags: Flags,
    ) -> CollHandle {
        coll::broadcast::broadcast_m_nb(
            &self.engine,
            self,
            team,
            dstlist,
            src_image,
            src,
            nbytes,
            flags,
        )
    }

    /// Scatter consecutive `nbytes` slices of the root's `src` to
    /// every image's `dst`.
    pub unsafe fn scatter_nb(
        &self,
        team: Team,
        dst: *mut u8,
        src_image: Image,
        src: *const u8,
        nbytes: usize,
        flags: Flags,
    ) -> CollHandle {
        coll::scatter::scatter_nb(&self.engine, self, team, dst, src_image, src, nbytes, flags)
    }

    /// Scatter to a per-image destination list.
    pub unsafe fn scatter_m_nb(
        &self,
        team: Team,
        dstlist: *const *mut u8,
        src_image: Image,
        src: *const u8,
        nbytes: usize,
        flags: Flags,
    ) -> CollHandle {
        coll::scatter::scatter_m_nb(
            &self.engine,
            self,
            team,
            dstlist,
            src_image,
            src,
            nbytes,
            flags,
        )
    }

    /// Gather every image's `src` into consecutive slices of the
    /// root's `dst`.
    pub unsafe fn gather_nb(
        &self,
        team: Team,
        dst_image: Image,
        dst: *mut u8,
        src: *const u8,
        nbytes: usize,
        flags: Flags,
    ) -> CollHandle {
        coll::gather::gather_nb(&self.engine, self, team, dst_image, dst, src, nbytes, flags)
    }

    /// Gather from a per-image source list.
    pub unsafe fn gather_m_nb(
        &self,
        team: Team,
        dst_image: Image,
        dst: *mut u8,
        srclist: *const *const u8,
        nbytes: usize,
        flags: Flags,
    ) -> CollHandle {
        coll::gather::gather_m_nb(
            &self.engine,
            self,
            team,
            dst_image,
            dst,
            srclist,
            nbytes,
            flags,
        )
    }

    /// Gather everyone's `src` to every image's `dst`.
    pub unsafe fn gather_all_nb(
        &self,
        team: Team,
        dst: *mut u8,
        src: *const u8,
        nbytes: usize,
        flags: Flags,
    ) -> CollHandle {
        coll::gather_all::gather_all_nb(&self.engine, self, team, dst, src, nbytes, flags)
    }

    /// Gather-all over per-image address lists.
    pub unsafe fn gather_all_m_nb(
        &self,
        team: Team,
        dstlist: *const *mut u8,
        srclist: *const *const u8,
        nbytes: usize,
        flags: Flags,
    ) -> CollHandle {
        coll::gather_all::gather_all_m_nb(&self.engine, self, team, dstlist, srclist, nbytes, flags)
    }

    /// Total exchange: image `i` receives the `i`-th slice of every
    /// image's `src`, in image order.
    pub unsafe fn exchange_nb(
        &self,
        team: Team,
        dst: *mut u8,
        src: *const u8,
        nbytes: usize,
        flags: Flags,
    ) -> CollHandle {
        coll::exchange::exchange_nb(&self.engine, self, team, dst, src, nbytes, flags)
    }

    /// Total exchange over per-image address lists.
    pub unsafe fn exchange_m_nb(
        &self,
        team: Team,
        dstlist: *const *mut u8,
        srclist: *const *const u8,
        nbytes: usize,
        flags: Flags,
    ) -> CollHandle {
        coll::exchange::exchange_m_nb(&self.engine, self, team, dstlist, srclist, nbytes, flags)
    }
}
