use crate::engine::{safe, CollCtx, Engine};
use crate::flags::Flags;
use crate::handle::CollHandle;
use crate::op::{
    CollArgs, CollOp, ConstPtr, GenericData, MutList, MutPtr, Options, PollFn, PollOutcome,
    ScatterArgs, ScatterMArgs,
};
use crate::p2p::EAGER_MIN;
use crate::team::{Image, Team};

use super::{choose_scatter, choose_scatter_m, copy_bytes, local_scatter, Variant};

/*
 *
 * ===== scatter =====
 *
 */

fn generic_scatter_nb(
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
    let args = CollArgs::Scatter(ScatterArgs {
        dst: MutPtr(dst),
        src_node: eng.team().rank_of_image(src_image),
        src: ConstPtr(src),
        nbytes,
    });
    eng.op_generic_init(ctx, team, flags, GenericData::new(args, options), poll_fn)
}

/// scat Get: every peer pulls its own slice from the root's array.
fn pf_scat_get(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let args = data.args.scatter();

    loop {
        match data.state {
            0 => {
                if !eng.insync(data) {
                    return PollOutcome::pending();
                }
                data.state = 1;
            }

            1 => {
                let me = eng.my_rank();
                if me == args.src_node {
                    unsafe {
                        copy_bytes(args.dst.0, args.src.0.add(me * args.nbytes), args.nbytes);
                    }
                } else if args.nbytes == 0 {
                    // Nothing to move
                } else if data.is_owner(ctx) {
                    let base = eng
                        .segs()
                        .local_offset(args.src.0, args.nbytes * eng.ranks());
                    data.handle = Some(safe(eng.rma().get_nb(
                        args.dst.0,
                        args.src_node,
                        base + me * args.nbytes,
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

pub(crate) fn scat_get(
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

    generic_scatter_nb(
        eng, ctx, team, dst, src_image, src, nbytes, flags, pf_scat_get, options,
    )
}

/// scat Put: the root deals one slice to each peer, right of itself
/// first, local slice last.
fn pf_scat_put(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let args = data.args.scatter();

    loop {
        match data.state {
            0 => {
                if !eng.insync(data) {
                    return PollOutcome::pending();
                }
                data.state = 1;
            }

            1 => {
                let me = eng.my_rank();
                if me != args.src_node || args.nbytes == 0 {
                    // Nothing to do
                } else if data.is_owner(ctx) {
                    let dst_off = eng.segs().local_offset(args.dst.0 as *const u8, args.nbytes);

                    eng.rma().begin_nbi_region();
                    for i in me + 1..eng.ranks() {
                        unsafe {
                            safe(eng.rma().put_nbi(
                                i,
                                dst_off,
                                args.src.0.add(i * args.nbytes),
                                args.nbytes,
                            ));
                        }
                    }
                    for i in 0..me {
                        unsafe {
                            safe(eng.rma().put_nbi(
                                i,
                                dst_off,
                                args.src.0.add(i * args.nbytes),
                                args.nbytes,
                            ));
                        }
                    }
                    data.handle = Some(eng.rma().end_nbi_region());

                    unsafe {
                        copy_bytes(args.dst.0, args.src.0.add(me * args.nbytes), args.nbytes);
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

pub(crate) fn scat_put(
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

    generic_scatter_nb(
        eng, ctx, team, dst, src_image, src, nbytes, flags, pf_scat_put, options,
    )
}

/// scat Eager: the root deals slices through peers' eager slots.
fn pf_scat_eager(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let _ = ctx;
    let args = data.args.scatter();

    loop {
        match data.state {
            0 => {
                if !eng.insync(data) {
                    return PollOutcome::pending();
                }
                data.state = 1;
            }

            1 => {
                let me = eng.my_rank();
                if me == args.src_node {
                    if args.nbytes > 0 {
                        eng.p2p_eager_put_all(op, args.src.0, args.nbytes, true, 0, 1);
                    }
                    unsafe {
                        copy_bytes(args.dst.0, args.src.0.add(me * args.nbytes), args.nbytes);
                    }
                } else if args.nbytes == 0 {
                    // No payload travels
                } else {
                    let slot = data.p2p.as_ref().unwrap();
                    if slot.state(0) == 0 {
                        return PollOutcome::pending();
                    }
                    unsafe {
                        copy_bytes(args.dst.0, slot.data_ptr(), args.nbytes);
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

pub(crate) fn scat_eager(
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

    generic_scatter_nb(
        eng, ctx, team, dst, src_image, src, nbytes, flags, pf_scat_eager, options,
    )
}

/// scat RVGet: the root advertises its array offset; peers get their
/// slice from it.
fn pf_scat_rvget(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let args = data.args.scatter();

    loop {
        match data.state {
            0 => {
                if !eng.insync(data) {
                    return PollOutcome::pending();
                }
                data.state = 1;
            }

            1 => {
                let me = eng.my_rank();
                if me == args.src_node {
                    if args.nbytes > 0 {
                        let off = eng
                            .segs()
                            .local_offset(args.src.0, args.nbytes * eng.ranks());
                        eng.p2p_eager_addr_all(op, off, 0, 1);
                    }
                    unsafe {
                        copy_bytes(args.dst.0, args.src.0.add(me * args.nbytes), args.nbytes);
                    }
                } else if args.nbytes == 0 {
                    // No rendezvous needed
                } else if data.is_owner(ctx) && data.p2p.as_ref().unwrap().state(0) != 0 {
                    let adv = data.p2p.as_ref().unwrap().advertised_offset();
                    data.handle = Some(safe(eng.rma().get_nb(
                        args.dst.0,
                        args.src_node,
                        adv + me * args.nbytes,
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

pub(crate) fn scat_rvget(
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

    generic_scatter_nb(
        eng, ctx, team, dst, src_image, src, nbytes, flags, pf_scat_rvget, options,
    )
}

pub(crate) fn scatter_nb(
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

    let flags = if flags.is_single() {
        eng.segs()
            .discover(flags, dst as *const u8, nbytes, src, nbytes * eng.ranks())
    } else {
        flags
    };
    if flags.is_dst_in_segment() {
        eng.segs().boundscheck(dst as *const u8, nbytes);
    }
    if flags.is_src_in_segment() && eng.team().image_is_local(src_image) {
        eng.segs().boundscheck(src, nbytes * eng.ranks());
    }

    match choose_scatter(flags, nbytes) {
        Variant::Eager => scat_eager(eng, ctx, team, dst, src_image, src, nbytes, flags),
        Variant::RvGet => scat_rvget(eng, ctx, team, dst, src_image, src, nbytes, flags),
        Variant::Put => scat_put(eng, ctx, team, dst, src_image, src, nbytes, flags),
        Variant::Get => scat_get(eng, ctx, team, dst, src_image, src, nbytes, flags),
        _ => super::unsupported_residency(),
    }
}

/*
 *
 * ===== scatterM =====
 *
 */

fn generic_scatter_m_nb(
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
    let args = CollArgs::ScatterM(ScatterMArgs {
        dstlist: MutList(dstlist),
        src_node: eng.team().rank_of_image(src_image),
        src: ConstPtr(src),
        nbytes,
    });
    eng.op_generic_init(ctx, team, flags, GenericData::new(args, options), poll_fn)
}

/// scatM Get: each rank pulls its images' slices with one indexed
/// get.
fn pf_scat_m_get(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let args = data.args.scatter_m();

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
                let team = eng.team();
                if eng.my_rank() == args.src_node {
                    unsafe {
                        local_scatter(
                            team.my_images(),
                            args.dstlist,
                            team.my_first_index(false),
                            args.src.0.add(team.my_offset() * args.nbytes),
                            args.nbytes,
                        );
                    }
                } else if args.nbytes == 0 {
                    // Nothing to move
                } else if data.is_owner(ctx) {
                    let first = team.my_first_index(false);
                    let dsts: Vec<*mut u8> = (0..team.my_images())
                        .map(|i| unsafe { args.dstlist.at(first + i) })
                        .collect();
                    let len = team.my_images() * args.nbytes;
                    let src_off = eng
                        .segs()
                        .local_offset(unsafe { args.src.0.add(team.my_offset() * args.nbytes) }, len);
                    data.handle = Some(safe(eng.rma().geti(
                        &dsts,
                        args.nbytes,
                        args.src_node,
                        &[src_off],
                        len,
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

pub(crate) fn scat_m_get(
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

    generic_scatter_m_nb(
        eng, ctx, team, dstlist, src_image, src, nbytes, flags, pf_scat_m_get, options,
    )
}

/// scatM Put: the root deals per-rank runs of slices with indexed
/// puts inside one access region.
fn pf_scat_m_put(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let args = data.args.scatter_m();

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
                        let count = team.images_of(rank);
                        let base = team.offset_of(rank);
                        let dst_offs: Vec<usize> = (0..count)
                            .map(|j| {
                                let dst = unsafe { args.dstlist.at(base + j) };
                                eng.segs().remote_offset(rank, dst as *const u8, args.nbytes)
                            })
                            .collect();
                        let src = unsafe { args.src.0.add(base * args.nbytes) };
                        safe(eng.rma().puti_nbi(
                            rank,
                            &dst_offs,
                            args.nbytes,
                            &[src],
                            count * args.nbytes,
                        ));
                    };
                    for i in me + 1..eng.ranks() {
                        put_to(i);
                    }
                    for i in 0..me {
                        put_to(i);
                    }
                    data.handle = Some(eng.rma().end_nbi_region());

                    unsafe {
                        local_scatter(
                            team.my_images(),
                            args.dstlist,
                            team.my_first_index(false),
                            args.src.0.add(team.my_offset() * args.nbytes),
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

pub(crate) fn scat_m_put(
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

    generic_scatter_m_nb(
        eng, ctx, team, dstlist, src_image, src, nbytes, flags, pf_scat_m_put, options,
    )
}

/// scatM Eager: one fragmented eager run per peer rank; receivers
/// copy each image's slab out of their slot as it lands.
fn pf_scat_m_eager(
    eng: &Engine,
    ctx: &CollCtx,
    op: &CollOp,
    data: &mut GenericData,
) -> PollOutcome {
    let _ = ctx;
    let args = data.args.scatter_m();

    loop {
        match data.state {
            0 => {
                if !eng.insync(data) {
                    return PollOutcome::pending();
                }
                data.state = 1;
            }

            1 => {
                let team = eng.team();
                if eng.my_rank() == args.src_node {
                    if args.nbytes > 0 {
                        let me = eng.my_rank();
                        let send_to = |rank: usize| {
                            let count = team.images_of(rank);
                            let src =
                                unsafe { args.src.0.add(team.offset_of(rank) * args.nbytes) };
                            eng.p2p_eager_putm(op, rank, src, count, args.nbytes, 0, 1);
                        };
                        for i in me + 1..eng.ranks() {
                            send_to(i);
                        }
                        for i in 0..me {
                            send_to(i);
                        }
                    }
                    unsafe {
                        local_scatter(
                            team.my_images(),
                            args.dstlist,
                            team.my_first_index(op.flags.is_local()),
                            args.src.0.add(team.my_offset() * args.nbytes),
                            args.nbytes,
                        );
                    }
                } else if args.nbytes == 0 {
                    // No payload travels
                } else {
                    let slot = data.p2p.as_ref().unwrap().clone();
                    let first = team.my_first_index(op.flags.is_local());
                    let mut done = true;
                    for i in 0..team.my_images() {
                        if slot.state(i) == 0 {
                            done = false;
                        } else {
                            unsafe {
                                copy_bytes(
                                    args.dstlist.at(first + i),
                                    slot.data_ptr().add(i * args.nbytes),
                                    args.nbytes,
                                );
                            }
                            slot.set_state(i, 2);
                        }
                    }
                    if !done {
                        return PollOutcome::pending();
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

pub(crate) fn scat_m_eager(
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

    generic_scatter_m_nb(
        eng, ctx, team, dstlist, src_image, src, nbytes, flags, pf_scat_m_eager, options,
    )
}

/// scatM RVGet: the advertised offset plus this rank's image offset
/// names the run to pull with one indexed get.
fn pf_scat_m_rvget(
    eng: &Engine,
    ctx: &CollCtx,
    op: &CollOp,
    data: &mut GenericData,
) -> PollOutcome {
    let args = data.args.scatter_m();

    loop {
        match data.state {
            0 => {
                if !eng.insync(data) {
                    return PollOutcome::pending();
                }
                data.state = 1;
            }

            1 => {
                let team = eng.team();
                if eng.my_rank() == args.src_node {
                    if args.nbytes > 0 {
                        let off = eng
                            .segs()
                            .local_offset(args.src.0, args.nbytes * team.total_images());
                        eng.p2p_eager_addr_all(op, off, 0, 1);
                    }
                    unsafe {
                        local_scatter(
                            team.my_images(),
                            args.dstlist,
                            team.my_first_index(op.flags.is_local()),
                            args.src.0.add(team.my_offset() * args.nbytes),
                            args.nbytes,
                        );
                    }
                } else if args.nbytes == 0 {
                    // No rendezvous needed
                } else if data.is_owner(ctx) && data.p2p.as_ref().unwrap().state(0) != 0 {
                    let adv = data.p2p.as_ref().unwrap().advertised_offset();
                    let first = team.my_first_index(op.flags.is_local());
                    let dsts: Vec<*mut u8> = (0..team.my_images())
                        .map(|i| unsafe { args.dstlist.at(first + i) })
                        .collect();
                    let len = team.my_images() * args.nbytes;
                    data.handle = Some(safe(eng.rma().geti(
                        &dsts,
                        args.nbytes,
                        args.src_node,
                        &[adv + team.my_offset() * args.nbytes],
                        len,
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

pub(crate) fn scat_m_rvget(
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

    generic_scatter_m_nb(
        eng, ctx, team, dstlist, src_image, src, nbytes, flags, pf_scat_m_rvget, options,
    )
}

pub(crate) fn scatter_m_nb(
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
        eng.segs().discover(
            flags,
            first as *const u8,
            nbytes,
            src,
            nbytes * eng.team().total_images(),
        )
    } else {
        flags
    };

    match choose_scatter_m(flags, nbytes) {
        Variant::Eager => scat_m_eager(eng, ctx, team, dstlist, src_image, src, nbytes, flags),
        Variant::RvGet => scat_m_rvget(eng, ctx, team, dstlist, src_image, src, nbytes, flags),
        Variant::Get => scat_m_get(eng, ctx, team, dstlist, src_image, src, nbytes, flags),
        Variant::Put => scat_m_put(eng, ctx, team, dstlist, src_image, src, nbytes, flags),
        _ => super::unsupported_residency(),
    }
}
