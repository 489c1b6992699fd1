use std::cell::UnsafeCell;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::{Arc, Mutex};

use crate::engine::{safe, Engine};
use crate::op::CollOp;
use crate::team::{Rank, Team};
use crate::transport::HandlerId;

/// Largest payload the eager algorithms accept, and the floor on a
/// slot's payload area.
pub const EAGER_MIN: usize = 64;

/// Per-image payload space in a slot. Must not be smaller than
/// [`EAGER_MIN`]: the eager gather family deposits one
/// `EAGER_MIN`-sized slab per image.
pub const EAGER_SCALE: usize = 64;

const P2P_TABLE_SIZE: usize = 16;

/// Active-message handler indices consumed by peers.
pub(crate) const H_PUT_SIGNAL: HandlerId = 126;
pub(crate) const H_EAGER: HandlerId = 127;

pub(crate) type P2pSlotRef = Arc<P2pSlot>;

/// Rendezvous state for one `(team, sequence)` pair: a state word per
/// image and a bounded payload area.
///
/// Producers (the AM handlers) write payload bytes first and then
/// release-store the state word; consumers acquire-load the state
/// word before touching the bytes. That pairing is the entire
/// publication contract for `data`.
pub(crate) struct P2pSlot {
    state: Box<[AtomicU32]>,
    data: UnsafeCell<Box<[u8]>>,
}

unsafe impl Send for P2pSlot {}
unsafe impl Sync for P2pSlot {}

impl P2pSlot {
    fn new(total_images: usize) -> P2pSlot {
        let data_len = EAGER_MIN.max(total_images * EAGER_SCALE);
        P2pSlot {
            state: (0..total_images).map(|_| AtomicU32::new(0)).collect(),
            data: UnsafeCell::new(vec![0u8; data_len].into_boxed_slice()),
        }
    }

    /// Acquire-loads a state word; a non-zero value publishes the
    /// payload bytes stored before it.
    pub fn state(&self, i: usize) -> u32 {
        self.state[i].load(Acquire)
    }

    /// Release-stores a state word, publishing preceding payload
    /// writes.
    pub fn set_state(&self, i: usize, value: u32) {
        self.state[i].store(value, Release);
    }

    #[cfg(test)]
    pub fn images(&self) -> usize {
        self.state.len()
    }

    pub fn data_len(&self) -> usize {
        unsafe { (&*self.data.get()).len() }
    }

    /// Raw payload pointer. Writes must precede a `set_state`; reads
    /// must follow a non-zero `state`.
    pub fn data_ptr(&self) -> *mut u8 {
        unsafe { (*self.data.get()).as_mut_ptr() }
    }

    /// The segment offset advertised through this slot by a
    /// rendezvous. Valid only after `state(0)` is non-zero.
    pub fn advertised_offset(&self) -> usize {
        let mut raw = [0u8; std::mem::size_of::<usize>()];
        unsafe {
            std::ptr::copy_nonoverlapping(self.data_ptr(), raw.as_mut_ptr(), raw.len());
        }
        usize::from_ne_bytes(raw)
    }

    /// Returns a recycled slot to the all-zero published state.
    /// Caller holds the table lock, so no consumer is live.
    fn reset(&self) {
        for s in self.state.iter() {
            s.store(0, Relaxed);
        }
        unsafe {
            (*self.data.get()).fill(0);
        }
    }
}

/// The point-to-point eager table: a fixed-size hash of live slots,
/// keyed by `(team_id, sequence)`, chained within each bucket, with a
/// shared freelist of recycled slots.
pub(crate) struct P2pTable {
    inner: Mutex<TableInner>,
}

struct TableInner {
    buckets: Vec<Vec<TableEntry>>,
    freelist: Vec<Arc<P2pSlot>>,
    total_images: usize,
}

struct TableEntry {
    team_id: u32,
    sequence: u32,
    slot: Arc<P2pSlot>,
}

impl P2pTable {
    pub fn new(total_images: usize) -> P2pTable {
        P2pTable {
            inner: Mutex::new(TableInner {
                buckets: (0..P2P_TABLE_SIZE).map(|_| Vec::new()).collect(),
                freelist: Vec::new(),
                total_images,
            }),
        }
    }

    /// Finds the slot for `(team_id, sequence)`, creating it zeroed
    /// on first touch. Whichever of the consumer op or an incoming
    /// message arrives first materializes the slot.
    pub fn get(&self, team_id: u32, sequence: u32) -> P2pSlotRef {
        Team::lookup(team_id);

        let mut inner = self.inner.lock().unwrap();
        let bucket = (sequence as usize) % P2P_TABLE_SIZE;

        if let Some(entry) = inner.buckets[bucket]
            .iter()
            .find(|e| e.team_id == team_id && e.sequence == sequence)
        {
            return entry.slot.clone();
        }

        let slot = match inner.freelist.pop() {
            Some(slot) => {
                slot.reset();
                slot
            }
            None => Arc::new(P2pSlot::new(inner.total_images)),
        };

        inner.buckets[bucket].push(TableEntry {
            team_id,
            sequence,
            slot: slot.clone(),
        });
        slot
    }

    /// Unlinks the consumer's slot and recycles it.
    pub fn free(&self, team_id: u32, sequence: u32) {
        let mut inner = self.inner.lock().unwrap();
        let bucket = (sequence as usize) % P2P_TABLE_SIZE;

        let pos = inner.buckets[bucket]
            .iter()
            .position(|e| e.team_id == team_id && e.sequence == sequence)
            .expect("freeing a point-to-point slot that is not live");
        let entry = inner.buckets[bucket].swap_remove(pos);
        inner.freelist.push(entry.slot);
    }

    /// Teardown invariant: every slot was consumed and freed.
    pub fn assert_empty(&self) {
        let inner = self.inner.lock().unwrap();
        for bucket in inner.buckets.iter() {
            assert!(
                bucket.is_empty(),
                "point-to-point table still holds live slots at teardown"
            );
        }
    }

    #[cfg(test)]
    pub fn live_slots(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.buckets.iter().map(|b| b.len()).sum()
    }
}

/*
 *
 * ===== Incoming request handlers =====
 *
 */

/// Put-signal request: the transport has already deposited the
/// payload at the supplied address; store the state word.
/// Header: (team_id, sequence, offset, state).
pub(crate) fn put_signal_request(table: &P2pTable, args: &[u32], _payload: &[u8]) {
    let slot = table.get(args[0], args[1]);
    slot.set_state(args[2] as usize, args[3]);
}

/// Eager payload request: deposit bytes into the slot's payload area,
/// then publish a run of state words.
/// Header: (team_id, sequence, count, size, offset, state).
pub(crate) fn eager_request(table: &P2pTable, args: &[u32], payload: &[u8]) {
    let slot = table.get(args[0], args[1]);
    let count = args[2] as usize;
    let size = args[3] as usize;
    let offset = args[4] as usize;
    let state = args[5];

    if size > 0 {
        assert!(offset * size + payload.len() <= slot.data_len());
        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                slot.data_ptr().add(offset * size),
                payload.len(),
            );
        }
    }

    for i in 0..count {
        slot.set_state(offset + i, state);
    }
}

/*
 *
 * ===== Sender-side facades =====
 *
 */

impl Engine {
    /// Puts up to the transport's long-request maximum directly into
    /// a peer's segment, then signals `state[offset]` on the peer's
    /// slot for this op. Returns when the local source is reusable.
    pub(crate) fn p2p_signalling_put(
        &self,
        op: &CollOp,
        node: Rank,
        dst_offset: usize,
        src: *const u8,
        nbytes: usize,
        offset: u32,
        state: u32,
    ) {
        assert!(nbytes <= self.am().max_long());
        let args = [op.team_id, op.sequence, offset, state];
        let payload = unsafe { std::slice::from_raw_parts(src, nbytes) };
        safe(self.am().request_long(node, H_PUT_SIGNAL, &args, payload, dst_offset));
        self.count_eager_message();
    }

    /// As `p2p_signalling_put`, but may return before the local
    /// source is reusable.
    pub(crate) fn p2p_signalling_put_async(
        &self,
        op: &CollOp,
        node: Rank,
        dst_offset: usize,
        src: *const u8,
        nbytes: usize,
        offset: u32,
        state: u32,
    ) {
        assert!(nbytes <= self.am().max_long());
        let args = [op.team_id, op.sequence, offset, state];
        let payload = unsafe { std::slice::from_raw_parts(src, nbytes) };
        safe(self.am().request_long_async(node, H_PUT_SIGNAL, &args, payload, dst_offset));
        self.count_eager_message();
    }

    /// Sends `count` elements of `size` bytes to be buffered in the
    /// peer's slot at element index `offset`, fragmenting into
    /// medium requests of floor(maxMedium / size) elements.
    pub(crate) fn p2p_eager_putm(
        &self,
        op: &CollOp,
        node: Rank,
        src: *const u8,
        count: usize,
        size: usize,
        offset: usize,
        state: u32,
    ) {
        let limit = self.am().max_medium() / size;
        assert!(limit > 0, "element larger than the medium payload limit");

        let mut src = src;
        let mut count = count;
        let mut offset = offset;

        while count > limit {
            let nbytes = limit * size;
            let args = [
                op.team_id,
                op.sequence,
                limit as u32,
                size as u32,
                offset as u32,
                state,
            ];
            let payload = unsafe { std::slice::from_raw_parts(src, nbytes) };
            safe(self.am().request_medium(node, H_EAGER, &args, payload));
            self.count_eager_message();

            offset += limit;
            src = unsafe { src.add(nbytes) };
            count -= limit;
        }

        let args = [
            op.team_id,
            op.sequence,
            count as u32,
            size as u32,
            offset as u32,
            state,
        ];
        let payload = unsafe { std::slice::from_raw_parts(src, count * size) };
        safe(self.am().request_medium(node, H_EAGER, &args, payload));
        self.count_eager_message();
    }

    /// One buffered element for the peer's slot.
    pub(crate) fn p2p_eager_put(
        &self,
        op: &CollOp,
        node: Rank,
        src: *const u8,
        nbytes: usize,
        offset: usize,
        state: u32,
    ) {
        self.p2p_eager_putm(op, node, src, 1, nbytes, offset, state);
    }

    /// Fans one element out to every other rank, peers to the right
    /// of this rank first, then peers to the left. With `scatter`
    /// set, peer `i` receives the `i`-th slice of `src`.
    pub(crate) fn p2p_eager_put_all(
        &self,
        op: &CollOp,
        src: *const u8,
        nbytes: usize,
        scatter: bool,
        offset: usize,
        state: u32,
    ) {
        let me = self.my_rank();
        let slice = |i: usize| {
            if scatter {
                unsafe { src.add(i * nbytes) }
            } else {
                src
            }
        };

        for i in me + 1..self.ranks() {
            self.p2p_eager_put(op, i, slice(i), nbytes, offset, state);
        }
        for i in 0..me {
            self.p2p_eager_put(op, i, slice(i), nbytes, offset, state);
        }
    }

    /// Advertises a segment offset through the peer's slot.
    pub(crate) fn p2p_eager_addr(
        &self,
        op: &CollOp,
        node: Rank,
        addr_offset: usize,
        offset: usize,
        state: u32,
    ) {
        let raw = addr_offset.to_ne_bytes();
        self.p2p_eager_putm(op, node, raw.as_ptr(), 1, raw.len(), offset, state);
    }

    /// Advertises a segment offset to every other rank, right-of-self
    /// first.
    pub(crate) fn p2p_eager_addr_all(&self, op: &CollOp, addr_offset: usize, offset: usize, state: u32) {
        let me = self.my_rank();
        for i in me + 1..self.ranks() {
            self.p2p_eager_addr(op, i, addr_offset, offset, state);
        }
        for i in 0..me {
            self.p2p_eager_addr(op, i, addr_offset, offset, state);
        }
    }
}
