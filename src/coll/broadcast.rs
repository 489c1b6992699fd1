use crate::engine::{safe, CollCtx, Engine};
use crate::flags::Flags;
use crate::handle::CollHandle;
use crate::op::{
    BroadcastArgs, BroadcastMArgs, CollArgs, CollOp, ConstPtr, GenericData, MutList, MutPtr,
    Options, PollFn, PollOutcome,
};
use crate::p2p::EAGER_MIN;
use crate::team::{Image, Team};

use super::{choose_broadcast, choose_broadcast_m, copy_bytes, local_broadcast, Variant};

/*
 *
 * ===== broadcast =====
 *
 */

fn generic_broadcast_nb(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dst: *mut u8,
    src_image: Image,
    src: *const u8,
    nbytes: usize,
    flags: Flags,
    poll_fn: PollFn,
    options: Options,
) -> CollHandle {
    let args = CollArgs::Broadcast(BroadcastArgs {
        dst: MutPtr(dst),
        src_node: eng.team().rank_of_image(src_image),
        src: ConstPtr(src),
        nbytes,
    });
    eng.op_generic_init(ctx, team, flags, GenericData::new(args, options), poll_fn)
}

/// bcast Get: all peers perform uncoordinated gets from the root.
fn pf_bcast_get(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let args = data.args.broadcast();

    loop {
        match data.state {
            // Optional IN barrier
            0 => {
                if !eng.insync(data) {
                    return PollOutcome::pending();
                }
                data.state = 1;
            }

            // Initiate data movement
            1 => {
                if eng.my_rank() == args.src_node {
                    unsafe {
                        copy_bytes(args.dst.0, args.src.0, args.nbytes);
                    }
                } else if args.nbytes == 0 {
                    // Nothing to move
                } else if data.is_owner(ctx) {
                    let src_off = eng.segs().local_offset(args.src.0, args.nbytes);
                    data.handle = Some(safe(eng.rma().get_nb(
                        args.dst.0,
                        args.src_node,
                        src_off,
                        args.nbytes,
                    )));
                } else {
                    // Stalled until the owner thread initiates RDMA
                    return PollOutcome::pending();
                }
                data.state = 2;
            }

            // Sync data movement
            2 => {
                if !eng.syncnb(ctx, data) {
                    return PollOutcome::pending();
                }
                data.state = 3;
            }

            // Optional OUT barrier
            _ => {
                if !eng.outsync(data) {
                    return PollOutcome::pending();
                }
                eng.generic_free(op, data);
                return PollOutcome::finished();
            }
        }
    }
}

pub(crate) fn bcast_get(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dst: *mut u8,
    src_image: Image,
    src: *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    let options = Options::insync_if(!flags.is_in_nosync())
        | Options::outsync_if(!flags.is_out_nosync());

    assert!(flags.is_single());
    assert!(flags.is_src_in_segment());

    generic_broadcast_nb(
        eng, ctx, team, dst, src_image, src, nbytes, flags, pf_bcast_get, options,
    )
}

/// bcast Put: the root pushes to every peer inside one implicit
/// access region, peers to the right first, local copy last so it
/// overlaps the outgoing RDMA.
fn pf_bcast_put(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let args = data.args.broadcast();

    loop {
        match data.state {
            0 => {
                if !eng.insync(data) {
                    return PollOutcome::pending();
                }
                data.state = 1;
            }

            1 => {
                if eng.my_rank() != args.src_node || args.nbytes == 0 {
                    // Nothing to do
                } else if data.is_owner(ctx) {
                    let dst_off = eng.segs().local_offset(args.dst.0 as *const u8, args.nbytes);
                    let me = eng.my_rank();

                    eng.rma().begin_nbi_region();
                    for i in me + 1..eng.ranks() {
                        safe(eng.rma().put_nbi(i, dst_off, args.src.0, args.nbytes));
                    }
                    for i in 0..me {
                        safe(eng.rma().put_nbi(i, dst_off, args.src.0, args.nbytes));
                    }
                    data.handle = Some(eng.rma().end_nbi_region());

                    // Local copy last, overlapping the communication
                    unsafe {
                        copy_bytes(args.dst.0, args.src.0, args.nbytes);
                    }
                } else {
                    return PollOutcome::pending();
                }
                data.state = 2;
            }

            2 => {
                if !eng.syncnb(ctx, data) {
                    return PollOutcome::pending();
                }
                data.state = 3;
            }

            _ => {
                if !eng.outsync(data) {
                    return PollOutcome::pending();
                }
                eng.generic_free(op, data);
                return PollOutcome::finished();
            }
        }
    }
}

pub(crate) fn bcast_put(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dst: *mut u8,
    src_image: Image,
    src: *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    let options = Options::insync_if(!flags.is_in_nosync())
        | Options::outsync_if(!flags.is_out_nosync());

    assert!(flags.is_single());
    assert!(flags.is_dst_in_segment());

    generic_broadcast_nb(
        eng, ctx, team, dst, src_image, src, nbytes, flags, pf_bcast_put, options,
    )
}

/// bcast Eager: root fans the payload out through peers' eager slots.
/// No segment residency required on either end.
fn pf_bcast_eager(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let _ = ctx;
    let args = data.args.broadcast();

    loop {
        match data.state {
            0 => {
                if !eng.insync(data) {
                    return PollOutcome::pending();
                }
                data.state = 1;
            }

            // Data movement
            1 => {
                if eng.my_rank() == args.src_node {
                    if args.nbytes > 0 {
                        eng.p2p_eager_put_all(op, args.src.0, args.nbytes, false, 0, 1);
                    }
                    unsafe {
                        copy_bytes(args.dst.0, args.src.0, args.nbytes);
                    }
                } else if args.nbytes == 0 {
                    // No payload travels
                } else {
                    let slot = data.p2p.as_ref().unwrap();
                    if slot.state(0) == 0 {
                        // Stalled until the payload arrives
                        return PollOutcome::pending();
                    }
                    unsafe {
                        copy_bytes(args.dst.0, slot.data_ptr(), args.nbytes);
                    }
                }
                data.state = 2;
            }

            // Optional OUT barrier
            _ => {
                if !eng.outsync(data) {
                    return PollOutcome::pending();
                }
                eng.generic_free(op, data);
                return PollOutcome::finished();
            }
        }
    }
}

pub(crate) fn bcast_eager(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dst: *mut u8,
    src_image: Image,
    src: *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    let options = Options::insync_if(flags.is_in_allsync())
        | Options::outsync_if(flags.is_out_allsync())
        | Options::p2p_if(!eng.team().image_is_local(src_image));

    assert!(nbytes <= EAGER_MIN);

    generic_broadcast_nb(
        eng, ctx, team, dst, src_image, src, nbytes, flags, pf_bcast_eager, options,
    )
}

/// bcast RVGet: the root advertises its source offset; peers get from
/// it. The rendezvous replaces the IN barrier for MYSYNC and carries
/// the address for LOCAL.
fn pf_bcast_rvget(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let args = data.args.broadcast();

    loop {
        match data.state {
            0 => {
                if !eng.insync(data) {
                    return PollOutcome::pending();
                }
                data.state = 1;
            }

            1 => {
                if eng.my_rank() == args.src_node {
                    if args.nbytes > 0 {
                        let off = eng.segs().local_offset(args.src.0, args.nbytes);
                        eng.p2p_eager_addr_all(op, off, 0, 1);
                    }
                    unsafe {
                        copy_bytes(args.dst.0, args.src.0, args.nbytes);
                    }
                } else if args.nbytes == 0 {
                    // No rendezvous needed
                } else if data.is_owner(ctx) && data.p2p.as_ref().unwrap().state(0) != 0 {
                    let adv = data.p2p.as_ref().unwrap().advertised_offset();
                    data.handle = Some(safe(eng.rma().get_nb(
                        args.dst.0,
                        args.src_node,
                        adv,
                        args.nbytes,
                    )));
                } else {
                    // Stalled until the owner thread holds the address
                    return PollOutcome::pending();
                }
                data.state = 2;
            }

            2 => {
                if !eng.syncnb(ctx, data) {
                    return PollOutcome::pending();
                }
                data.state = 3;
            }

            _ => {
                if !eng.outsync(data) {
                    return PollOutcome::pending();
                }
                eng.generic_free(op, data);
                return PollOutcome::finished();
            }
        }
    }
}

pub(crate) fn bcast_rvget(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dst: *mut u8,
    src_image: Image,
    src: *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    let options = Options::insync_if(flags.is_in_allsync())
        | Options::outsync_if(!flags.is_out_nosync())
        | Options::p2p_if(!eng.team().image_is_local(src_image));

    assert!(flags.is_src_in_segment());

    generic_broadcast_nb(
        eng, ctx, team, dst, src_image, src, nbytes, flags, pf_bcast_rvget, options,
    )
}

/// bcast RVPut is only needed for LOCAL addressing; under SINGLE the
/// plain put algorithm already knows every destination.
pub(crate) fn bcast_rvput(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dst: *mut u8,
    src_image: Image,
    src: *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    if !flags.is_local() {
        bcast_put(eng, ctx, team, dst, src_image, src, nbytes, flags)
    } else {
        panic!("broadcast rendezvous-put is not implemented");
    }
}

pub(crate) fn broadcast_nb(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dst: *mut u8,
    src_image: Image,
    src: *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    eng.validate(team, flags);

    // Discover residency for single-valued addresses; local
    // addressing relies on the caller's hints so every rank picks the
    // same algorithm.
    let flags = if flags.is_single() {
        eng.segs().discover(flags, dst as *const u8, nbytes, src, nbytes)
    } else {
        flags
    };
    if flags.is_dst_in_segment() {
        eng.segs().boundscheck(dst as *const u8, nbytes);
    }
    if flags.is_src_in_segment() && eng.team().image_is_local(src_image) {
        eng.segs().boundscheck(src, nbytes);
    }

    match choose_broadcast(flags, nbytes) {
        Variant::Eager => bcast_eager(eng, ctx, team, dst, src_image, src, nbytes, flags),
        Variant::RvPut => bcast_rvput(eng, ctx, team, dst, src_image, src, nbytes, flags),
        Variant::Put => bcast_put(eng, ctx, team, dst, src_image, src, nbytes, flags),
        Variant::RvGet => bcast_rvget(eng, ctx, team, dst, src_image, src, nbytes, flags),
        Variant::Get => bcast_get(eng, ctx, team, dst, src_image, src, nbytes, flags),
        _ => panic!("broadcast with no end in-segment is not implemented"),
    }
}

/*
 *
 * ===== broadcastM =====
 *
 */

fn generic_broadcast_m_nb(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dstlist: *const *mut u8,
    src_image: Image,
    src: *const u8,
    nbytes: usize,
    flags: Flags,
    poll_fn: PollFn,
    options: Options,
) -> CollHandle {
    let args = CollArgs::BroadcastM(BroadcastMArgs {
        dstlist: MutList(dstlist),
        src_node: eng.team().rank_of_image(src_image),
        src: ConstPtr(src),
        nbytes,
    });
    eng.op_generic_init(ctx, team, flags, GenericData::new(args, options), poll_fn)
}

/// bcastM Get: one get for the first local image, then local fan-out.
fn pf_bcast_m_get(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let args = data.args.broadcast_m();

    debug_assert!(op.flags.is_single());

    loop {
        match data.state {
            0 => {
                if !eng.insync(data) {
                    return PollOutcome::pending();
                }
                data.state = 1;
            }

            1 => {
                let first = eng.team().my_first_index(false);
                if eng.my_rank() == args.src_node {
                    unsafe {
                        local_broadcast(
                            eng.team().my_images(),
                            args.dstlist,
                            first,
                            args.src.0,
                            args.nbytes,
                        );
                    }
                } else if args.nbytes == 0 {
                    // Nothing to move
                } else if data.is_owner(ctx) {
                    // Get only the first local image; fan out after
                    // the sync.
                    let src_off = eng.segs().local_offset(args.src.0, args.nbytes);
                    let dst = unsafe { args.dstlist.at(first) };
                    data.handle = Some(safe(eng.rma().get_nb(
                        dst,
                        args.src_node,
                        src_off,
                        args.nbytes,
                    )));
                } else {
                    return PollOutcome::pending();
                }
                data.state = 2;
            }

            // Sync data movement and perform the local copies
            2 => {
                if !eng.syncnb(ctx, data) {
                    return PollOutcome::pending();
                }
                if eng.my_rank() != args.src_node && args.nbytes > 0 {
                    let first = eng.team().my_first_index(false);
                    unsafe {
                        let seed = args.dstlist.at(first);
                        local_broadcast(
                            eng.team().my_images() - 1,
                            args.dstlist,
                            first + 1,
                            seed,
                            args.nbytes,
                        );
                    }
                }
                data.state = 3;
            }

            _ => {
                if !eng.outsync(data) {
                    return PollOutcome::pending();
                }
                eng.generic_free(op, data);
                return PollOutcome::finished();
            }
        }
    }
}

pub(crate) fn bcast_m_get(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dstlist: *const *mut u8,
    src_image: Image,
    src: *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    let options = Options::insync_if(!flags.is_in_nosync())
        | Options::outsync_if(!flags.is_out_nosync());

    generic_broadcast_m_nb(
        eng, ctx, team, dstlist, src_image, src, nbytes, flags, pf_bcast_m_get, options,
    )
}

/// bcastM Put: the root puts once per remote image (the same bytes
/// each time), then fans out locally.
fn pf_bcast_m_put(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let args = data.args.broadcast_m();

    debug_assert!(op.flags.is_single());

    loop {
        match data.state {
            0 => {
                if !eng.insync(data) {
                    return PollOutcome::pending();
                }
                data.state = 1;
            }

            1 => {
                if eng.my_rank() != args.src_node || args.nbytes == 0 {
                    // Nothing to do
                } else if data.is_owner(ctx) {
                    let me = eng.my_rank();
                    let team = eng.team();

                    eng.rma().begin_nbi_region();
                    let put_to = |rank: usize| {
                        let base = team.offset_of(rank);
                        for j in 0..team.images_of(rank) {
                            let dst = unsafe { args.dstlist.at(base + j) };
                            let off =
                                eng.segs().remote_offset(rank, dst as *const u8, args.nbytes);
                            safe(eng.rma().put_nbi(rank, off, args.src.0, args.nbytes));
                        }
                    };
                    for i in me + 1..eng.ranks() {
                        put_to(i);
                    }
                    for i in 0..me {
                        put_to(i);
                    }
                    data.handle = Some(eng.rma().end_nbi_region());

                    unsafe {
                        local_broadcast(
                            team.my_images(),
                            args.dstlist,
                            team.my_first_index(false),
                            args.src.0,
                            args.nbytes,
                        );
                    }
                } else {
                    return PollOutcome::pending();
                }
                data.state = 2;
            }

            2 => {
                if !eng.syncnb(ctx, data) {
                    return PollOutcome::pending();
                }
                data.state = 3;
            }

            _ => {
                if !eng.outsync(data) {
                    return PollOutcome::pending();
                }
                eng.generic_free(op, data);
                return PollOutcome::finished();
            }
        }
    }
}

pub(crate) fn bcast_m_put(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dstlist: *const *mut u8,
    src_image: Image,
    src: *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    let options = Options::insync_if(!flags.is_in_nosync())
        | Options::outsync_if(!flags.is_out_nosync());

    generic_broadcast_m_nb(
        eng, ctx, team, dstlist, src_image, src, nbytes, flags, pf_bcast_m_put, options,
    )
}

/// bcastM Eager: one eager payload per rank, local fan-out on both
/// ends.
fn pf_bcast_m_eager(
    eng: &Engine,
    ctx: &CollCtx,
    op: &CollOp,
    data: &mut GenericData,
) -> PollOutcome {
    let _ = ctx;
    let args = data.args.broadcast_m();

    loop {
        match data.state {
            0 => {
                if !eng.insync(data) {
                    return PollOutcome::pending();
                }
                data.state = 1;
            }

            1 => {
                let first = eng.team().my_first_index(op.flags.is_local());
                if eng.my_rank() == args.src_node {
                    if args.nbytes > 0 {
                        eng.p2p_eager_put_all(op, args.src.0, args.nbytes, false, 0, 1);
                    }
                    unsafe {
                        local_broadcast(
                            eng.team().my_images(),
                            args.dstlist,
                            first,
                            args.src.0,
                            args.nbytes,
                        );
                    }
                } else if args.nbytes == 0 {
                    // No payload travels
                } else {
                    let slot = data.p2p.as_ref().unwrap().clone();
                    if slot.state(0) == 0 {
                        return PollOutcome::pending();
                    }
                    unsafe {
                        local_broadcast(
                            eng.team().my_images(),
                            args.dstlist,
                            first,
                            slot.data_ptr(),
                            args.nbytes,
                        );
                    }
                }
                data.state = 2;
            }

            _ => {
                if !eng.outsync(data) {
                    return PollOutcome::pending();
                }
                eng.generic_free(op, data);
                return PollOutcome::finished();
            }
        }
    }
}

pub(crate) fn bcast_m_eager(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dstlist: *const *mut u8,
    src_image: Image,
    src: *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    let options = Options::insync_if(flags.is_in_allsync())
        | Options::outsync_if(flags.is_out_allsync())
        | Options::p2p_if(!eng.team().image_is_local(src_image));

    assert!(nbytes <= EAGER_MIN);

    generic_broadcast_m_nb(
        eng, ctx, team, dstlist, src_image, src, nbytes, flags, pf_bcast_m_eager, options,
    )
}

/// bcastM RVGet: get the first local image from the advertised
/// offset, then fan out locally after the sync.
fn pf_bcast_m_rvget(
    eng: &Engine,
    ctx: &CollCtx,
    op: &CollOp,
    data: &mut GenericData,
) -> PollOutcome {
    let args = data.args.broadcast_m();

    loop {
        match data.state {
            0 => {
                if !eng.insync(data) {
                    return PollOutcome::pending();
                }
                data.state = 1;
            }

            1 => {
                let first = eng.team().my_first_index(op.flags.is_local());
                if eng.my_rank() == args.src_node {
                    if args.nbytes > 0 {
                        let off = eng.segs().local_offset(args.src.0, args.nbytes);
                        eng.p2p_eager_addr_all(op, off, 0, 1);
                    }
                    unsafe {
                        local_broadcast(
                            eng.team().my_images(),
                            args.dstlist,
                            first,
                            args.src.0,
                            args.nbytes,
                        );
                    }
                } else if args.nbytes == 0 {
                    // No rendezvous needed
                } else if data.is_owner(ctx) && data.p2p.as_ref().unwrap().state(0) != 0 {
                    let adv = data.p2p.as_ref().unwrap().advertised_offset();
                    let dst = unsafe { args.dstlist.at(first) };
                    data.handle = Some(safe(eng.rma().get_nb(
                        dst,
                        args.src_node,
                        adv,
                        args.nbytes,
                    )));
                } else {
                    return PollOutcome::pending();
                }
                data.state = 2;
            }

            2 => {
                if !eng.syncnb(ctx, data) {
                    return PollOutcome::pending();
                }
                if eng.my_rank() != args.src_node && args.nbytes > 0 {
                    let first = eng.team().my_first_index(op.flags.is_local());
                    unsafe {
                        let seed = args.dstlist.at(first);
                        local_broadcast(
                            eng.team().my_images() - 1,
                            args.dstlist,
                            first + 1,
                            seed,
                            args.nbytes,
                        );
                    }
                }
                data.state = 3;
            }

            _ => {
                if !eng.outsync(data) {
                    return PollOutcome::pending();
                }
                eng.generic_free(op, data);
                return PollOutcome::finished();
            }
        }
    }
}

pub(crate) fn bcast_m_rvget(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dstlist: *const *mut u8,
    src_image: Image,
    src: *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    let options = Options::insync_if(flags.is_in_allsync())
        | Options::outsync_if(!flags.is_out_nosync())
        | Options::p2p_if(!eng.team().image_is_local(src_image));

    generic_broadcast_m_nb(
        eng, ctx, team, dstlist, src_image, src, nbytes, flags, pf_bcast_m_rvget, options,
    )
}

pub(crate) fn broadcast_m_nb(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dstlist: *const *mut u8,
    src_image: Image,
    src: *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    eng.validate(team, flags);

    let flags = if flags.is_single() {
        let first = unsafe { *dstlist.add(eng.team().my_first_index(false)) };
        eng.segs()
            .discover(flags, first as *const u8, nbytes, src, nbytes)
    } else {
        flags
    };

    match choose_broadcast_m(flags, nbytes) {
        Variant::Eager => bcast_m_eager(eng, ctx, team, dstlist, src_image, src, nbytes, flags),
        Variant::RvGet => bcast_m_rvget(eng, ctx, team, dstlist, src_image, src, nbytes, flags),
        Variant::Get => bcast_m_get(eng, ctx, team, dstlist, src_image, src, nbytes, flags),
        Variant::Put => bcast_m_put(eng, ctx, team, dstlist, src_image, src, nbytes, flags),
        _ => super::unsupported_residency(),
    }
}
