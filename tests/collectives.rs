//! End-to-end collective behavior over the in-process loopback
//! fabric, exercised through the public API only.

use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use pgas_io::transport::loopback::LoopbackFabric;
use pgas_io::{CollCtx, Collectives, Flags, Segment, SyncError, Team, EAGER_MIN};

/// Runs `body` once per rank, each rank on its own thread with its
/// own segment of `seg_len` bytes.
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

fn fill(ptr: *mut u8, len: usize, tag: u8) {
    for i in 0..len {
        unsafe {
            *ptr.add(i) = tag.wrapping_add(i as u8);
        }
    }
}

fn check(ptr: *const u8, len: usize, tag: u8) {
    for i in 0..len {
        let got = unsafe { *ptr.add(i) };
        assert_eq!(got, tag.wrapping_add(i as u8), "byte {} differs", i);
    }
}

#[test]
fn broadcast_variants_agree() {
    run_ranks(4, 8192, |rank, _coll, ctx, seg| {
        let root = 1usize;

        // Eager: small payload, MYSYNC, plain heap buffers.
        {
            let n = 48;
            let src = if rank == root {
                let mut v = vec![0u8; n];
                fill(v.as_mut_ptr(), n, 0x11);
                v
            } else {
                Vec::new()
            };
            let src_ptr = if rank == root { src.as_ptr() } else { std::ptr::null() };
            let mut dst = vec![0u8; n];
            let flags = Flags::in_mysync() | Flags::out_mysync() | Flags::single();
            let mut h =
                unsafe { ctx.broadcast_nb(Team::ALL, dst.as_mut_ptr(), root, src_ptr, n, flags) };
            ctx.wait_sync(&mut h);
            check(dst.as_ptr(), n, 0x11);
        }

        // Put: ALLSYNC with the destination in-segment.
        {
            let n = 128;
            let src = if rank == root {
                let mut v = vec![0u8; n];
                fill(v.as_mut_ptr(), n, 0x22);
                v
            } else {
                Vec::new()
            };
            let src_ptr = if rank == root { src.as_ptr() } else { std::ptr::null() };
            let dst = seg;
            let flags = Flags::in_allsync()
                | Flags::out_allsync()
                | Flags::single()
                | Flags::dst_in_segment();
            let mut h = unsafe { ctx.broadcast_nb(Team::ALL, dst, root, src_ptr, n, flags) };
            ctx.wait_sync(&mut h);
            check(dst, n, 0x22);
        }

        // Get: ALLSYNC with only the source in-segment.
        {
            let n = 128;
            let src = unsafe { seg.add(1024) };
            if rank == root {
                fill(src, n, 0x33);
            }
            let mut dst = vec![0u8; n];
            let flags = Flags::in_allsync()
                | Flags::out_allsync()
                | Flags::single()
                | Flags::src_in_segment();
            let mut h = unsafe {
                ctx.broadcast_nb(Team::ALL, dst.as_mut_ptr(), root, src as *const u8, n, flags)
            };
            ctx.wait_sync(&mut h);
            check(dst.as_ptr(), n, 0x33);
        }

        // RVGet: MYSYNC with only the source in-segment, above the
        // eager cutoff.
        {
            let n = EAGER_MIN + 64;
            let src = unsafe { seg.add(2048) };
            if rank == root {
                fill(src, n, 0x44);
            }
            let mut dst = vec![0u8; n];
            let flags = Flags::in_mysync()
                | Flags::out_mysync()
                | Flags::single()
                | Flags::src_in_segment();
            let mut h = unsafe {
                ctx.broadcast_nb(Team::ALL, dst.as_mut_ptr(), root, src as *const u8, n, flags)
            };
            ctx.wait_sync(&mut h);
            check(dst.as_ptr(), n, 0x44);
        }

        // RVPut falls back to Put under single addressing.
        {
            let n = EAGER_MIN + 64;
            let src = if rank == root {
                let mut v = vec![0u8; n];
                fill(v.as_mut_ptr(), n, 0x55);
                v
            } else {
                Vec::new()
            };
            let src_ptr = if rank == root { src.as_ptr() } else { std::ptr::null() };
            let dst = unsafe { seg.add(4096) };
            let flags = Flags::in_mysync()
                | Flags::out_mysync()
                | Flags::single()
                | Flags::dst_in_segment();
            let mut h = unsafe { ctx.broadcast_nb(Team::ALL, dst, root, src_ptr, n, flags) };
            ctx.wait_sync(&mut h);
            check(dst, n, 0x55);
        }
    });
}

#[test]
fn gather_undoes_scatter() {
    const N: usize = 96;

    run_ranks(4, 8192, |rank, _coll, ctx, seg| {
        let flags = Flags::in_allsync()
            | Flags::out_allsync()
            | Flags::single()
            | Flags::src_in_segment()
            | Flags::dst_in_segment();

        // Root deals out a 4-slice array...
        let array = seg;
        if rank == 0 {
            fill(array, 4 * N, 0x60);
        }
        let slice = unsafe { seg.add(1024) };
        let mut h = unsafe { ctx.scatter_nb(Team::ALL, slice, 0, array as *const u8, N, flags) };
        ctx.wait_sync(&mut h);
        check(slice, N, 0x60u8.wrapping_add((rank * N) as u8));

        // ...and gathers it back into a fresh buffer.
        let back = unsafe { seg.add(4096) };
        let mut h = unsafe { ctx.gather_nb(Team::ALL, 0, back, slice as *const u8, N, flags) };
        ctx.wait_sync(&mut h);

        if rank == 0 {
            check(back, 4 * N, 0x60);
        }
    });
}

#[test]
fn exchange_is_self_inverse() {
    const N: usize = 8;

    run_ranks(4, 4096, |rank, _coll, ctx, seg| {
        let flags = Flags::in_allsync()
            | Flags::out_allsync()
            | Flags::single()
            | Flags::src_in_segment()
            | Flags::dst_in_segment();

        let a = seg;
        let b = unsafe { seg.add(256) };
        let c = unsafe { seg.add(512) };
        fill(a, 4 * N, (rank * 41) as u8);

        let mut h = unsafe { ctx.exchange_nb(Team::ALL, b, a as *const u8, N, flags) };
        ctx.wait_sync(&mut h);
        let mut h = unsafe { ctx.exchange_nb(Team::ALL, c, b as *const u8, N, flags) };
        ctx.wait_sync(&mut h);

        // Exchange is a transpose across images; applying it twice
        // restores every rank's original buffer.
        let orig = unsafe { std::slice::from_raw_parts(a, 4 * N) };
        let twice = unsafe { std::slice::from_raw_parts(c, 4 * N) };
        assert_eq!(orig, twice);
    });
}

#[test]
fn gather_all_delivers_the_concatenation() {
    const N: usize = 16;

    run_ranks(4, 4096, |rank, _coll, ctx, seg| {
        let flags = Flags::in_allsync()
            | Flags::out_allsync()
            | Flags::single()
            | Flags::src_in_segment()
            | Flags::dst_in_segment();

        let src = seg;
        fill(src, N, (0x80 + rank * 7) as u8);
        let dst = unsafe { seg.add(1024) };

        let mut h = unsafe { ctx.gather_all_nb(Team::ALL, dst, src as *const u8, N, flags) };
        ctx.wait_sync(&mut h);

        for peer in 0..4 {
            check(unsafe { dst.add(peer * N) }, N, (0x80 + peer * 7) as u8);
        }
    });
}

#[test]
fn sync_calls_report_state_faithfully() {
    let gate = Arc::new(Barrier::new(2));

    run_ranks(2, 4096, move |rank, _coll, ctx, seg| {
        let flags = Flags::in_allsync()
            | Flags::out_allsync()
            | Flags::single()
            | Flags::dst_in_segment();
        let src = [9u8; 4];

        if rank == 0 {
            let mut h = unsafe {
                ctx.broadcast_nb(Team::ALL, seg, 0, src.as_ptr(), 4, flags)
            };
            // Rank 1 has not entered the collective: the IN barrier
            // cannot complete yet.
            assert_eq!(ctx.try_sync(&mut h), Err(SyncError::NotReady));
            assert!(h.is_valid());

            gate.wait();
            ctx.wait_sync(&mut h);
            assert!(!h.is_valid());

            // A consumed handle is an error thereafter.
            assert_eq!(ctx.try_sync(&mut h), Err(SyncError::InvalidHandle));
        } else {
            gate.wait();
            let mut h = unsafe {
                ctx.broadcast_nb(Team::ALL, seg, 0, std::ptr::null(), 4, flags)
            };
            ctx.wait_sync(&mut h);
        }

        // List forms: an empty list is trivially synced.
        assert_eq!(ctx.try_sync_some(&mut []), Ok(()));
        assert_eq!(ctx.try_sync_all(&mut []), Ok(()));

        // A list of already-invalid handles counts as drained.
        let mut done = [pgas_io::CollHandle::INVALID; 3];
        assert_eq!(ctx.try_sync_some(&mut done), Ok(()));
        assert_eq!(ctx.try_sync_all(&mut done), Ok(()));
    });
}

#[test]
fn multi_image_local_collectives() {
    const RANKS: usize = 2;
    const PER: usize = 2;

    let fabric = Arc::new(LoopbackFabric::new(RANKS));
    let mut joins = Vec::new();

    for rank in 0..RANKS {
        let fabric = fabric.clone();
        joins.push(thread::spawn(move || {
            let mut seg = vec![0u8; 16 * 1024].into_boxed_slice();
            let segment = Segment::new(seg.as_mut_ptr(), seg.len());
            let coll = Collectives::init(
                Arc::new(fabric.port(rank)),
                segment,
                &[PER; RANKS],
                rank * PER,
                0,
                0,
            );

            // The second image's thread attaches and parks.
            let coll2 = coll.clone();
            let second = thread::spawn(move || {
                let _ctx = coll2.attach_thread();
            });
            let ctx = coll.attach_thread();
            second.join().unwrap();

            let base = seg.as_mut_ptr();
            let local = Flags::local() | Flags::src_in_segment() | Flags::dst_in_segment();

            // broadcastM, eager: image 0's buffer lands in all four
            // image destinations.
            {
                let n = 32;
                let src = base;
                if rank == 0 {
                    fill(src, n, 0x21);
                }
                let d0 = unsafe { base.add(1024) };
                let d1 = unsafe { base.add(1024 + 256) };
                let dstlist = [d0, d1];
                let mut h = unsafe {
                    ctx.broadcast_m_nb(
                        Team::ALL,
                        dstlist.as_ptr(),
                        0,
                        src as *const u8,
                        n,
                        Flags::in_mysync() | Flags::out_mysync() | local,
                    )
                };
                ctx.wait_sync(&mut h);
                check(d0, n, 0x21);
                check(d1, n, 0x21);
            }

            // gatherM, eager: every image's slab lands in image
            // order at the root.
            {
                let n = 16;
                let s0 = unsafe { base.add(2048) };
                let s1 = unsafe { base.add(2048 + 64) };
                fill(s0, n, (rank * PER) as u8);
                fill(s1, n, (rank * PER + 1) as u8);
                let srclist = [s0 as *const u8, s1 as *const u8];
                let dst = unsafe { base.add(3072) };
                let mut h = unsafe {
                    ctx.gather_m_nb(
                        Team::ALL,
                        0,
                        dst,
                        srclist.as_ptr(),
                        n,
                        Flags::in_mysync() | Flags::out_mysync() | local,
                    )
                };
                ctx.wait_sync(&mut h);
                if rank == 0 {
                    for image in 0..RANKS * PER {
                        check(unsafe { dst.add(image * n) }, n, image as u8);
                    }
                }
            }

            // scatterM over the rendezvous path: above the eager
            // cutoff, each image pulls its slice.
            {
                let n = EAGER_MIN * 2;
                let src = unsafe { base.add(4096) };
                if rank == 0 {
                    fill(src, RANKS * PER * n, 0x91);
                }
                let d0 = unsafe { base.add(8192) };
                let d1 = unsafe { base.add(8192 + 1024) };
                let dstlist = [d0, d1];
                let mut h = unsafe {
                    ctx.scatter_m_nb(
                        Team::ALL,
                        dstlist.as_ptr(),
                        0,
                        src as *const u8,
                        n,
                        Flags::in_mysync() | Flags::out_mysync() | local,
                    )
                };
                ctx.wait_sync(&mut h);
                for (i, d) in dstlist.iter().enumerate() {
                    let image = rank * PER + i;
                    check(*d, n, 0x91u8.wrapping_add((image * n) as u8));
                }
            }
        }));
    }
    for j in joins {
        j.join().unwrap();
    }
}

#[test]
fn exchange_m_transposes_image_slices() {
    const RANKS: usize = 2;
    const N: usize = 4;

    // Single-valued lists need every image's addresses; the rank
    // threads publish them before the collective starts.
    let srcs = Arc::new(Mutex::new(vec![0usize; RANKS]));
    let dsts = Arc::new(Mutex::new(vec![0usize; RANKS]));
    let published = Arc::new(Barrier::new(RANKS));

    run_ranks(RANKS, 4096, move |rank, _coll, ctx, seg| {
        let src = seg;
        let dst = unsafe { seg.add(1024) };
        for i in 0..RANKS {
            // Image `rank`'s slice i carries (rank, i).
            fill(unsafe { src.add(i * N) }, N, (rank * 16 + i) as u8);
        }

        srcs.lock().unwrap()[rank] = src as usize;
        dsts.lock().unwrap()[rank] = dst as usize;
        published.wait();

        let srclist: Vec<*const u8> =
            srcs.lock().unwrap().iter().map(|&p| p as *const u8).collect();
        let dstlist: Vec<*mut u8> = dsts.lock().unwrap().iter().map(|&p| p as *mut u8).collect();

        let flags = Flags::in_allsync()
            | Flags::out_allsync()
            | Flags::single()
            | Flags::src_in_segment()
            | Flags::dst_in_segment();
        let mut h = unsafe {
            ctx.exchange_m_nb(Team::ALL, dstlist.as_ptr(), srclist.as_ptr(), N, flags)
        };
        ctx.wait_sync(&mut h);

        // Image r's destination holds every image's r-th slice, in
        // image order.
        for j in 0..RANKS {
            check(unsafe { dst.add(j * N) }, N, (j * 16 + rank) as u8);
        }
    });
}

#[test]
fn eager_runs_fragment_under_a_small_medium_limit() {
    const RANKS: usize = 2;
    const PER: usize = 2;
    const N: usize = 8;

    // A medium limit of one element per message forces the eager
    // fan-out to fragment.
    let fabric = Arc::new(LoopbackFabric::with_limits(RANKS, N, 1024));
    let mut joins = Vec::new();

    for rank in 0..RANKS {
        let fabric = fabric.clone();
        joins.push(thread::spawn(move || {
            let mut seg = vec![0u8; 4096].into_boxed_slice();
            let segment = Segment::new(seg.as_mut_ptr(), seg.len());
            let coll = Collectives::init(
                Arc::new(fabric.port(rank)),
                segment,
                &[PER; RANKS],
                rank * PER,
                0,
                0,
            );
            let coll2 = coll.clone();
            let second = thread::spawn(move || {
                let _ctx = coll2.attach_thread();
            });
            let ctx = coll.attach_thread();
            second.join().unwrap();

            let base = seg.as_mut_ptr();
            let src = base;
            if rank == 0 {
                fill(src, RANKS * PER * N, 0x40);
            }
            let d0 = unsafe { base.add(1024) };
            let d1 = unsafe { base.add(1024 + 64) };
            let dstlist = [d0, d1];

            let flags = Flags::in_mysync()
                | Flags::out_mysync()
                | Flags::local()
                | Flags::src_in_segment()
                | Flags::dst_in_segment();
            let mut h = unsafe {
                ctx.scatter_m_nb(Team::ALL, dstlist.as_ptr(), 0, src as *const u8, N, flags)
            };
            ctx.wait_sync(&mut h);

            for (i, d) in dstlist.iter().enumerate() {
                let image = rank * PER + i;
                check(*d, N, 0x40u8.wrapping_add((image * N) as u8));
            }
        }));
    }
    for j in joins {
        j.join().unwrap();
    }
}

#[test]
fn random_payload_gather_all() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const N: usize = 64;

    run_ranks(4, 4096, |rank, _coll, ctx, seg| {
        let flags = Flags::in_allsync()
            | Flags::out_allsync()
            | Flags::single()
            | Flags::src_in_segment()
            | Flags::dst_in_segment();

        let mut mine = [0u8; N];
        StdRng::seed_from_u64(rank as u64).fill(&mut mine[..]);
        unsafe {
            std::ptr::copy_nonoverlapping(mine.as_ptr(), seg, N);
        }

        let dst = unsafe { seg.add(1024) };
        let mut h = unsafe { ctx.gather_all_nb(Team::ALL, dst, seg as *const u8, N, flags) };
        ctx.wait_sync(&mut h);

        // Every rank can reproduce every peer's contribution.
        for peer in 0..4 {
            let mut expect = [0u8; N];
            StdRng::seed_from_u64(peer as u64).fill(&mut expect[..]);
            let got = unsafe { std::slice::from_raw_parts(dst.add(peer * N), N) };
            assert_eq!(got, &expect);
        }
    });
}
