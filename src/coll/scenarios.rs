//! End-to-end runs over the loopback fabric, asserting the internal
//! observables (consensus issuance, slot recycling) alongside the
//! payload outcomes.

use std::sync::Arc;
use std::thread;

use crate::engine::{CollCtx, Collectives};
use crate::flags::Flags;
use crate::p2p::EAGER_MIN;
use crate::segment::Segment;
use crate::team::Team;
use crate::transport::loopback::LoopbackFabric;

/// Runs `body` once per rank, each rank on its own thread with its
/// own segment, all connected through one loopback fabric.
fn run_ranks<F>(ranks: usize, seg_len: usize, body: F)
where
    F: Fn(usize, &Collectives, &CollCtx, *mut u8) + Send + Sync + 'static,
{
    let fabric = Arc::new(LoopbackFabric::new(ranks));
    let body = Arc::new(body);
    let images = vec![1usize; ranks];

    let mut joins = Vec::new();
    for rank in 0..ranks {
        let fabric = fabric.clone();
        let body = body.clone();
        let images = images.clone();
        joins.push(thread::spawn(move || {
            let mut seg = vec![0u8; seg_len].into_boxed_slice();
            let segment = Segment::new(seg.as_mut_ptr(), seg.len());
            let coll =
                Collectives::init(Arc::new(fabric.port(rank)), segment, &images, rank, 0, 0);
            let ctx = coll.attach_thread();
            body(rank, &coll, &ctx, seg.as_mut_ptr());
        }));
    }
    for j in joins {
        j.join().unwrap();
    }
}

#[test]
fn broadcast_eager_is_barrier_free() {
    run_ranks(4, 256, |rank, coll, ctx, _seg| {
        let src: [u8; 2] = if rank == 0 { [0xAA, 0xBB] } else { [0, 0] };
        let mut dst = [0u8; 2];

        let flags = Flags::in_mysync() | Flags::out_mysync() | Flags::single();
        let mut h = unsafe { ctx.broadcast_nb(Team::ALL, dst.as_mut_ptr(), 0, src.as_ptr(), 2, flags) };
        ctx.wait_sync(&mut h);

        assert_eq!(dst, [0xAA, 0xBB]);
        // Eager with MYSYNC: no consensus barrier was minted.
        assert_eq!(coll.engine().consensus.issued(), 0);
        // The slot was consumed and recycled.
        assert_eq!(coll.engine().p2p.live_slots(), 0);
    });
}

#[test]
fn broadcast_put_runs_both_barriers() {
    const N: usize = 1 << 20;

    run_ranks(4, N, |rank, coll, ctx, seg| {
        let src = if rank == 2 { vec![0x42u8; N] } else { Vec::new() };
        let src_ptr = if rank == 2 { src.as_ptr() } else { std::ptr::null() };

        let flags = Flags::in_allsync()
            | Flags::out_allsync()
            | Flags::single()
            | Flags::dst_in_segment();
        let mut h = unsafe { ctx.broadcast_nb(Team::ALL, seg, 2, src_ptr, N, flags) };
        ctx.wait_sync(&mut h);

        let dst = unsafe { std::slice::from_raw_parts(seg, N) };
        assert!(dst.iter().all(|&b| b == 0x42));
        // One IN and one OUT consensus barrier.
        assert_eq!(coll.engine().consensus.issued(), 2);
    });
}

#[test]
fn scatter_rendezvous_get_skips_the_in_barrier() {
    const SLICE: usize = 4096;

    run_ranks(4, 64 * 1024, |rank, coll, ctx, seg| {
        // Root's source array lives at the start of its segment; the
        // destinations sit at rank-dependent offsets, as local
        // addressing allows.
        let src = seg;
        if rank == 0 {
            for i in 0..4 * SLICE {
                unsafe {
                    *src.add(i) = (i / SLICE) as u8 ^ 0x5A;
                }
            }
        }
        let dst = unsafe { seg.add(32 * 1024 + rank * 16) };

        let flags = Flags::in_mysync()
            | Flags::out_mysync()
            | Flags::local()
            | Flags::src_in_segment()
            | Flags::dst_in_segment();
        let mut h = unsafe {
            ctx.scatter_nb(Team::ALL, dst, 0, src as *const u8, SLICE, flags)
        };
        ctx.wait_sync(&mut h);

        let got = unsafe { std::slice::from_raw_parts(dst, SLICE) };
        assert!(got.iter().all(|&b| b == rank as u8 ^ 0x5A));
        // MYSYNC in, MYSYNC out over the rendezvous path: the
        // handshake replaces the IN barrier, one OUT barrier runs.
        assert_eq!(coll.engine().consensus.issued(), 1);
    });
}

#[test]
fn gather_eager_tokens_fill_the_root() {
    run_ranks(4, 256, |rank, coll, ctx, _seg| {
        let src = [rank as u8 + 1; 16];
        let mut dst = [0u8; 64];

        let flags = Flags::in_allsync() | Flags::out_allsync() | Flags::single();
        let mut h = crate::coll::gather::gath_eager(
            coll.engine(),
            ctx,
            Team::ALL,
            0,
            dst.as_mut_ptr(),
            src.as_ptr(),
            16,
            flags,
        );
        ctx.wait_sync(&mut h);

        if rank == 0 {
            for peer in 0..4 {
                assert!(dst[peer * 16..(peer + 1) * 16]
                    .iter()
                    .all(|&b| b == peer as u8 + 1));
            }
        }
        assert_eq!(coll.engine().consensus.issued(), 2);
        assert_eq!(coll.engine().p2p.live_slots(), 0);
    });
}

#[test]
fn aggregate_region_returns_one_handle() {
    run_ranks(4, 256, |rank, _coll, ctx, seg| {
        let flags = Flags::in_mysync() | Flags::out_mysync() | Flags::single();

        let b1_src: [u8; 8] = if rank == 0 { [1; 8] } else { [0; 8] };
        let b2_src: [u8; 8] = if rank == 0 { [2; 8] } else { [0; 8] };
        // The scatter's ends live in the segment (its selector
        // demands residency); same offsets on every rank.
        let scat_src = seg;
        if rank == 0 {
            for i in 0..32 {
                unsafe {
                    *scat_src.add(i) = 0x10 + (i / 8) as u8;
                }
            }
        }
        let scat_dst = unsafe { seg.add(128) };
        let mut b1_dst = [0u8; 8];
        let mut b2_dst = [0u8; 8];

        ctx.begin_nbi_accessregion();

        let h1 = unsafe {
            ctx.broadcast_nb(
                Team::ALL,
                b1_dst.as_mut_ptr(),
                0,
                b1_src.as_ptr(),
                8,
                flags | Flags::aggregate(),
            )
        };
        assert!(!h1.is_valid());
        let h2 = unsafe {
            ctx.broadcast_nb(
                Team::ALL,
                b2_dst.as_mut_ptr(),
                0,
                b2_src.as_ptr(),
                8,
                flags | Flags::aggregate(),
            )
        };
        assert!(!h2.is_valid());

        // The non-aggregate scatter seals the region; its handle IS
        // the region handle.
        let sealing = unsafe {
            ctx.scatter_nb(
                Team::ALL,
                scat_dst,
                0,
                scat_src as *const u8,
                8,
                flags | Flags::src_in_segment() | Flags::dst_in_segment(),
            )
        };

        let mut region = ctx.end_nbi_accessregion();
        assert_eq!(region, sealing);

        ctx.wait_sync(&mut region);

        assert_eq!(b1_dst, [1; 8]);
        assert_eq!(b2_dst, [2; 8]);
        let got = unsafe { std::slice::from_raw_parts(scat_dst, 8) };
        assert!(got.iter().all(|&b| b == 0x10 + rank as u8));
    });
}

#[test]
fn exchange_two_ranks() {
    run_ranks(2, 4096, |rank, _coll, ctx, seg| {
        // rank 0 holds [a, b]; rank 1 holds [c, d].
        let (a, b, c, d) = (11u8, 22, 33, 44);
        unsafe {
            *seg = if rank == 0 { a } else { c };
            *seg.add(1) = if rank == 0 { b } else { d };
        }
        let dst = unsafe { seg.add(1024) };

        let flags = Flags::in_allsync()
            | Flags::out_allsync()
            | Flags::single()
            | Flags::src_in_segment()
            | Flags::dst_in_segment();
        let mut h = unsafe { ctx.exchange_nb(Team::ALL, dst, seg as *const u8, 1, flags) };
        ctx.wait_sync(&mut h);

        let got = unsafe { [*dst, *dst.add(1)] };
        if rank == 0 {
            assert_eq!(got, [a, c]);
        } else {
            assert_eq!(got, [b, d]);
        }
    });
}

#[test]
fn eager_boundary_switches_algorithms() {
    // At exactly EAGER_MIN the MYSYNC broadcast is eager (no
    // barriers); one byte past it, the rendezvous-put fallback runs
    // its barriers.
    run_ranks(2, 4096, |rank, coll, ctx, seg| {
        let flags = Flags::in_mysync() | Flags::out_mysync() | Flags::single();

        let exact = vec![7u8; EAGER_MIN];
        let mut dst = vec![0u8; EAGER_MIN];
        let src = if rank == 0 { exact.as_ptr() } else { std::ptr::null() };
        let mut h =
            unsafe { ctx.broadcast_nb(Team::ALL, dst.as_mut_ptr(), 0, src, EAGER_MIN, flags) };
        ctx.wait_sync(&mut h);
        assert!(dst.iter().all(|&b| b == 7));
        assert_eq!(coll.engine().consensus.issued(), 0);

        // One byte over: destination in-segment routes to the put
        // fallback, which minted IN and OUT barriers.
        let over = vec![9u8; EAGER_MIN + 1];
        let src = if rank == 0 { over.as_ptr() } else { std::ptr::null() };
        let mut h = unsafe {
            ctx.broadcast_nb(
                Team::ALL,
                seg,
                0,
                src,
                EAGER_MIN + 1,
                flags | Flags::dst_in_segment(),
            )
        };
        ctx.wait_sync(&mut h);
        let got = unsafe { std::slice::from_raw_parts(seg, EAGER_MIN + 1) };
        assert!(got.iter().all(|&b| b == 9));
        assert_eq!(coll.engine().consensus.issued(), 2);
    });
}

#[test]
fn single_rank_collectives_complete_without_communication() {
    run_ranks(1, 4096, |_rank, coll, ctx, seg| {
        let src = [5u8; 16];
        let mut dst = [0u8; 16];

        let flags = Flags::in_mysync() | Flags::out_mysync() | Flags::single();
        let mut h =
            unsafe { ctx.broadcast_nb(Team::ALL, dst.as_mut_ptr(), 0, src.as_ptr(), 16, flags) };
        ctx.wait_sync(&mut h);
        assert_eq!(dst, src);

        // A one-image team still runs its barriers, trivially.
        let seg_src = unsafe { seg.add(1024) };
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), seg_src, 16);
        }
        let allsync = Flags::in_allsync()
            | Flags::out_allsync()
            | Flags::single()
            | Flags::dst_in_segment()
            | Flags::src_in_segment();
        let mut h =
            unsafe { ctx.gather_nb(Team::ALL, 0, seg, seg_src as *const u8, 16, allsync) };
        ctx.wait_sync(&mut h);
        assert_eq!(unsafe { std::slice::from_raw_parts(seg, 16) }, &src);
        assert_eq!(coll.engine().p2p.live_slots(), 0);
    });
}

#[test]
fn signalling_puts_deposit_payload_before_state() {
    use std::sync::Mutex;

    use crate::flags::Flags as F;
    use crate::handle::CollHandle;
    use crate::op::{
        BroadcastArgs, CollArgs, CollOp, ConstPtr, GenericData, MutPtr, Options, PollOutcome,
    };

    fn raw_op(sequence: u32) -> CollOp {
        let args = CollArgs::Broadcast(BroadcastArgs {
            dst: MutPtr(std::ptr::null_mut()),
            src_node: 0,
            src: ConstPtr(std::ptr::null()),
            nbytes: 0,
        });
        CollOp {
            team_id: 0,
            sequence,
            flags: F::empty(),
            handle: CollHandle::INVALID,
            agg: None,
            poll_fn: |_, _, _, _| PollOutcome::pending(),
            data: Mutex::new(GenericData::new(args, Options::empty())),
        }
    }

    run_ranks(2, 4096, |rank, coll, ctx, seg| {
        if rank == 0 {
            let payload = [0xC3u8; 16];
            let op = raw_op(777);
            coll.engine()
                .p2p_signalling_put(&op, 1, 64, payload.as_ptr(), 16, 0, 5);

            let async_payload = [0x7Eu8; 8];
            let op = raw_op(778);
            coll.engine()
                .p2p_signalling_put_async(&op, 1, 128, async_payload.as_ptr(), 8, 1, 9);
        } else {
            // The state store must publish the deposited bytes.
            loop {
                ctx.poll();
                let slot = coll.engine().p2p.get(0, 777);
                if slot.state(0) == 5 {
                    break;
                }
                std::thread::yield_now();
            }
            let got = unsafe { std::slice::from_raw_parts(seg.add(64), 16) };
            assert!(got.iter().all(|&b| b == 0xC3));

            loop {
                ctx.poll();
                let slot = coll.engine().p2p.get(0, 778);
                if slot.state(1) == 9 {
                    break;
                }
                std::thread::yield_now();
            }
            let got = unsafe { std::slice::from_raw_parts(seg.add(128), 8) };
            assert!(got.iter().all(|&b| b == 0x7E));

            coll.engine().p2p.free(0, 777);
            coll.engine().p2p.free(0, 778);
        }
    });
}

#[test]
fn zero_byte_collectives_move_nothing() {
    run_ranks(2, 4096, |_rank, coll, ctx, seg| {
        let mut dst = [0xEEu8; 4];
        let flags = Flags::in_mysync() | Flags::out_mysync() | Flags::single();
        let mut h = unsafe {
            ctx.broadcast_nb(Team::ALL, dst.as_mut_ptr(), 0, std::ptr::null(), 0, flags)
        };
        ctx.wait_sync(&mut h);
        assert_eq!(dst, [0xEE; 4]);

        let flags = Flags::in_allsync()
            | Flags::out_allsync()
            | Flags::single()
            | Flags::src_in_segment()
            | Flags::dst_in_segment();
        let mut h = unsafe { ctx.scatter_nb(Team::ALL, seg, 0, seg as *const u8, 0, flags) };
        ctx.wait_sync(&mut h);

        assert_eq!(coll.engine().p2p.live_slots(), 0);
    });
}
