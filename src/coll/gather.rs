use crate::engine::{safe, CollCtx, Engine};
use crate::flags::Flags;
use crate::handle::CollHandle;
use crate::op::{
    CollArgs, CollOp, ConstList, ConstPtr, GatherArgs, GatherMArgs, GenericData, MutPtr, Options,
    PollFn, PollOutcome,
};
use crate::team::{Image, Team};

use super::{choose_gather, choose_gather_m, copy_bytes, local_gather, Variant};

/*
 *
 * ===== gather =====
 *
 */

fn generic_gather_nb(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dst_image: Image,
    dst: *mut u8,
    src: *const u8,
    nbytes: usize,
    flags: Flags,
    poll_fn: PollFn,
    options: Options,
) -> CollHandle {
    let args = CollArgs::Gather(GatherArgs {
        dst_node: eng.team().rank_of_image(dst_image),
        dst: MutPtr(dst),
        src: ConstPtr(src),
        nbytes,
    });
    eng.op_generic_init(ctx, team, flags, GenericData::new(args, options), poll_fn)
}

/// gath Get: the root pulls every peer's contribution inside one
/// access region.
fn pf_gath_get(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let args = data.args.gather();

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
                if me != args.dst_node || args.nbytes == 0 {
                    if me == args.dst_node {
                        unsafe {
                            copy_bytes(
                                args.dst.0.add(me * args.nbytes),
                                args.src.0,
                                args.nbytes,
                            );
                        }
                    }
                    // Non-root: nothing to do
                } else if data.is_owner(ctx) {
                    let src_off = eng.segs().local_offset(args.src.0, args.nbytes);

                    eng.rma().begin_nbi_region();
                    for i in me + 1..eng.ranks() {
                        unsafe {
                            safe(eng.rma().get_nbi(
                                args.dst.0.add(i * args.nbytes),
                                i,
                                src_off,
                                args.nbytes,
                            ));
                        }
                    }
                    for i in 0..me {
                        unsafe {
                            safe(eng.rma().get_nbi(
                                args.dst.0.add(i * args.nbytes),
                                i,
                                src_off,
                                args.nbytes,
                            ));
                        }
                    }
                    data.handle = Some(eng.rma().end_nbi_region());

                    unsafe {
                        copy_bytes(args.dst.0.add(me * args.nbytes), args.src.0, args.nbytes);
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

pub(crate) fn gath_get(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dst_image: Image,
    dst: *mut u8,
    src: *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    let options = Options::insync_if(!flags.is_in_nosync())
        | Options::outsync_if(!flags.is_out_nosync());

    assert!(flags.is_single());
    assert!(flags.is_src_in_segment());

    generic_gather_nb(
        eng, ctx, team, dst_image, dst, src, nbytes, flags, pf_gath_get, options,
    )
}

/// gath Put: every peer pushes its slice into the root's array.
fn pf_gath_put(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let args = data.args.gather();

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
                if me == args.dst_node {
                    unsafe {
                        copy_bytes(args.dst.0.add(me * args.nbytes), args.src.0, args.nbytes);
                    }
                } else if args.nbytes == 0 {
                    // Nothing to move
                } else if data.is_owner(ctx) {
                    let base = eng
                        .segs()
                        .local_offset(args.dst.0 as *const u8, args.nbytes * eng.ranks());
                    data.handle = Some(safe(eng.rma().put_nb(
                        args.dst_node,
                        base + me * args.nbytes,
                        args.src.0,
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

pub(crate) fn gath_put(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dst_image: Image,
    dst: *mut u8,
    src: *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    let options = Options::insync_if(!flags.is_in_nosync())
        | Options::outsync_if(!flags.is_out_nosync());

    assert!(flags.is_single());
    assert!(flags.is_dst_in_segment());

    generic_gather_nb(
        eng, ctx, team, dst_image, dst, src, nbytes, flags, pf_gath_put, options,
    )
}

/// gath Eager: peers deposit their slabs in the root's slot; the root
/// sweeps the state words through written(1) to copied(2). The
/// initiation runs on the 0→1 transition so the root gets a one-pass
/// fast path when everything already arrived.
fn pf_gath_eager(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let _ = ctx;
    let args = data.args.gather();

    loop {
        match data.state {
            0 => {
                if !eng.insync(data) {
                    return PollOutcome::pending();
                }
                data.state = 1;

                // Initiate data movement (once, falling through into
                // the completion poll below)
                let me = eng.my_rank();
                if args.nbytes == 0 {
                    // No payload travels
                } else if me != args.dst_node {
                    eng.p2p_eager_put(op, args.dst_node, args.src.0, args.nbytes, me, 1);
                } else {
                    unsafe {
                        copy_bytes(args.dst.0.add(me * args.nbytes), args.src.0, args.nbytes);
                    }
                    data.p2p.as_ref().unwrap().set_state(me, 2);
                }
            }

            // Complete data movement
            1 => {
                if eng.my_rank() == args.dst_node && args.nbytes > 0 {
                    let slot = data.p2p.as_ref().unwrap().clone();
                    let mut done = true;
                    for i in 0..eng.ranks() {
                        match slot.state(i) {
                            0 => done = false,
                            1 => {
                                // Received but not yet copied into
                                // place
                                unsafe {
                                    copy_bytes(
                                        args.dst.0.add(i * args.nbytes),
                                        slot.data_ptr().add(i * args.nbytes),
                                        args.nbytes,
                                    );
                                }
                                slot.set_state(i, 2);
                            }
                            _ => {}
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

pub(crate) fn gath_eager(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dst_image: Image,
    dst: *mut u8,
    src: *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    let options = Options::insync_if(flags.is_in_allsync())
        | Options::outsync_if(flags.is_out_allsync())
        | Options::p2p_if(eng.team().image_is_local(dst_image));

    generic_gather_nb(
        eng, ctx, team, dst_image, dst, src, nbytes, flags, pf_gath_eager, options,
    )
}

/// gath RVPut: the root advertises its array offset; peers put their
/// slice to it.
fn pf_gath_rvput(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let args = data.args.gather();

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
                if me == args.dst_node {
                    if args.nbytes > 0 {
                        let off = eng
                            .segs()
                            .local_offset(args.dst.0 as *const u8, args.nbytes * eng.ranks());
                        eng.p2p_eager_addr_all(op, off, 0, 1);
                    }
                    unsafe {
                        copy_bytes(args.dst.0.add(me * args.nbytes), args.src.0, args.nbytes);
                    }
                } else if args.nbytes == 0 {
                    // No rendezvous needed
                } else if data.is_owner(ctx) && data.p2p.as_ref().unwrap().state(0) != 0 {
                    let adv = data.p2p.as_ref().unwrap().advertised_offset();
                    data.handle = Some(safe(eng.rma().put_nb(
                        args.dst_node,
                        adv + me * args.nbytes,
                        args.src.0,
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

pub(crate) fn gath_rvput(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dst_image: Image,
    dst: *mut u8,
    src: *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    let options = Options::insync_if(flags.is_in_allsync())
        | Options::outsync_if(!flags.is_out_nosync())
        | Options::p2p_if(!eng.team().image_is_local(dst_image));

    assert!(flags.is_dst_in_segment());

    generic_gather_nb(
        eng, ctx, team, dst_image, dst, src, nbytes, flags, pf_gath_rvput, options,
    )
}

pub(crate) fn gather_nb(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dst_image: Image,
    dst: *mut u8,
    src: *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    eng.validate(team, flags);

    let flags = if flags.is_single() {
        eng.segs()
            .discover(flags, dst as *const u8, nbytes * eng.ranks(), src, nbytes)
    } else {
        flags
    };
    if flags.is_src_in_segment() {
        eng.segs().boundscheck(src, nbytes);
    }
    if flags.is_dst_in_segment() && eng.team().image_is_local(dst_image) {
        eng.segs()
            .boundscheck(dst as *const u8, nbytes * eng.ranks());
    }

    match choose_gather(flags, nbytes) {
        Variant::Eager => gath_eager(eng, ctx, team, dst_image, dst, src, nbytes, flags),
        Variant::RvPut => gath_rvput(eng, ctx, team, dst_image, dst, src, nbytes, flags),
        Variant::Put => gath_put(eng, ctx, team, dst_image, dst, src, nbytes, flags),
        Variant::Get => gath_get(eng, ctx, team, dst_image, dst, src, nbytes, flags),
        _ => super::unsupported_residency(),
    }
}

/*
 *
 * ===== gatherM =====
 *
 */

fn generic_gather_m_nb(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dst_image: Image,
    dst: *mut u8,
    srclist: *const *const u8,
    nbytes: usize,
    flags: Flags,
    poll_fn: PollFn,
    options: Options,
) -> CollHandle {
    let args = CollArgs::GatherM(GatherMArgs {
        dst_node: eng.team().rank_of_image(dst_image),
        dst: MutPtr(dst),
        srclist: ConstList(srclist),
        nbytes,
    });
    eng.op_generic_init(ctx, team, flags, GenericData::new(args, options), poll_fn)
}

/// gathM Get: the root pulls each rank's run of images with indexed
/// gets inside one access region.
fn pf_gath_m_get(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let args = data.args.gather_m();

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
                if eng.my_rank() != args.dst_node || args.nbytes == 0 {
                    if eng.my_rank() == args.dst_node {
                        unsafe {
                            local_gather(
                                team.my_images(),
                                args.dst.0.add(team.my_offset() * args.nbytes),
                                args.srclist,
                                team.my_first_index(false),
                                args.nbytes,
                            );
                        }
                    }
                    // Non-root: nothing to do
                } else if data.is_owner(ctx) {
                    let me = eng.my_rank();

                    eng.rma().begin_nbi_region();
                    let get_from = |rank: usize| {
                        let count = team.images_of(rank);
                        let base = team.offset_of(rank);
                        let src_offs: Vec<usize> = (0..count)
                            .map(|j| {
                                let src = unsafe { args.srclist.at(base + j) };
                                eng.segs().remote_offset(rank, src, args.nbytes)
                            })
                            .collect();
                        let dst = unsafe { args.dst.0.add(base * args.nbytes) };
                        safe(eng.rma().geti_nbi(
                            &[dst],
                            count * args.nbytes,
                            rank,
                            &src_offs,
                            args.nbytes,
                        ));
                    };
                    for i in me + 1..eng.ranks() {
                        get_from(i);
                    }
                    for i in 0..me {
                        get_from(i);
                    }
                    data.handle = Some(eng.rma().end_nbi_region());

                    unsafe {
                        local_gather(
                            team.my_images(),
                            args.dst.0.add(team.my_offset() * args.nbytes),
                            args.srclist,
                            team.my_first_index(false),
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

pub(crate) fn gath_m_get(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dst_image: Image,
    dst: *mut u8,
    srclist: *const *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    let options = Options::insync_if(!flags.is_in_nosync())
        | Options::outsync_if(!flags.is_out_nosync());

    generic_gather_m_nb(
        eng, ctx, team, dst_image, dst, srclist, nbytes, flags, pf_gath_m_get, options,
    )
}

/// gathM Put: each rank pushes its run of images with one indexed
/// put.
fn pf_gath_m_put(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let args = data.args.gather_m();

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
                if eng.my_rank() == args.dst_node {
                    unsafe {
                        local_gather(
                            team.my_images(),
                            args.dst.0.add(team.my_offset() * args.nbytes),
                            args.srclist,
                            team.my_first_index(false),
                            args.nbytes,
                        );
                    }
                } else if args.nbytes == 0 {
                    // Nothing to move
                } else if data.is_owner(ctx) {
                    let first = team.my_first_index(false);
                    let srcs: Vec<*const u8> = (0..team.my_images())
                        .map(|i| unsafe { args.srclist.at(first + i) })
                        .collect();
                    let len = team.my_images() * args.nbytes;
                    let dst_off = eng.segs().remote_offset(
                        args.dst_node,
                        unsafe { args.dst.0.add(team.my_offset() * args.nbytes) } as *const u8,
                        len,
                    );
                    data.handle = Some(safe(eng.rma().puti(
                        args.dst_node,
                        &[dst_off],
                        len,
                        &srcs,
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

pub(crate) fn gath_m_put(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dst_image: Image,
    dst: *mut u8,
    srclist: *const *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    let options = Options::insync_if(!flags.is_in_nosync())
        | Options::outsync_if(!flags.is_out_nosync());

    generic_gather_m_nb(
        eng, ctx, team, dst_image, dst, srclist, nbytes, flags, pf_gath_m_put, options,
    )
}

/// gathM Eager: each rank packs its images into one fragmented eager
/// run at its image offset; the root sweeps all images' tokens.
fn pf_gath_m_eager(
    eng: &Engine,
    ctx: &CollCtx,
    op: &CollOp,
    data: &mut GenericData,
) -> PollOutcome {
    let _ = ctx;
    let args = data.args.gather_m();

    loop {
        match data.state {
            0 => {
                if !eng.insync(data) {
                    return PollOutcome::pending();
                }
                data.state = 1;

                // Initiate data movement
                let team = eng.team();
                if args.nbytes == 0 {
                    // No payload travels
                } else if eng.my_rank() != args.dst_node {
                    let mut tmp = vec![0u8; team.my_images() * args.nbytes];
                    unsafe {
                        local_gather(
                            team.my_images(),
                            tmp.as_mut_ptr(),
                            args.srclist,
                            team.my_first_index(op.flags.is_local()),
                            args.nbytes,
                        );
                    }
                    eng.p2p_eager_putm(
                        op,
                        args.dst_node,
                        tmp.as_ptr(),
                        team.my_images(),
                        args.nbytes,
                        team.my_offset(),
                        1,
                    );
                } else {
                    unsafe {
                        local_gather(
                            team.my_images(),
                            args.dst.0.add(team.my_offset() * args.nbytes),
                            args.srclist,
                            team.my_first_index(op.flags.is_local()),
                            args.nbytes,
                        );
                    }
                    let slot = data.p2p.as_ref().unwrap();
                    for i in 0..team.my_images() {
                        slot.set_state(team.my_offset() + i, 2);
                    }
                }
            }

            1 => {
                if eng.my_rank() == args.dst_node && args.nbytes > 0 {
                    let slot = data.p2p.as_ref().unwrap().clone();
                    let mut done = true;
                    for i in 0..eng.team().total_images() {
                        match slot.state(i) {
                            0 => done = false,
                            1 => {
                                unsafe {
                                    copy_bytes(
                                        args.dst.0.add(i * args.nbytes),
                                        slot.data_ptr().add(i * args.nbytes),
                                        args.nbytes,
                                    );
                                }
                                slot.set_state(i, 2);
                            }
                            _ => {}
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

pub(crate) fn gath_m_eager(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dst_image: Image,
    dst: *mut u8,
    srclist: *const *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    let options = Options::insync_if(flags.is_in_allsync())
        | Options::outsync_if(flags.is_out_allsync())
        | Options::p2p_if(eng.team().image_is_local(dst_image));

    generic_gather_m_nb(
        eng, ctx, team, dst_image, dst, srclist, nbytes, flags, pf_gath_m_eager, options,
    )
}

/// gathM RVPut: peers push their runs to the advertised offset plus
/// their image offset.
fn pf_gath_m_rvput(
    eng: &Engine,
    ctx: &CollCtx,
    op: &CollOp,
    data: &mut GenericData,
) -> PollOutcome {
    let args = data.args.gather_m();

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
                if eng.my_rank() == args.dst_node {
                    if args.nbytes > 0 {
                        let off = eng.segs().local_offset(
                            args.dst.0 as *const u8,
                            args.nbytes * team.total_images(),
                        );
                        eng.p2p_eager_addr_all(op, off, 0, 1);
                    }
                    unsafe {
                        local_gather(
                            team.my_images(),
                            args.dst.0.add(team.my_offset() * args.nbytes),
                            args.srclist,
                            team.my_first_index(op.flags.is_local()),
                            args.nbytes,
                        );
                    }
                } else if args.nbytes == 0 {
                    // No rendezvous needed
                } else if data.is_owner(ctx) && data.p2p.as_ref().unwrap().state(0) != 0 {
                    let adv = data.p2p.as_ref().unwrap().advertised_offset();
                    let first = team.my_first_index(op.flags.is_local());
                    let srcs: Vec<*const u8> = (0..team.my_images())
                        .map(|i| unsafe { args.srclist.at(first + i) })
                        .collect();
                    let len = team.my_images() * args.nbytes;
                    data.handle = Some(safe(eng.rma().puti(
                        args.dst_node,
                        &[adv + team.my_offset() * args.nbytes],
                        len,
                        &srcs,
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

pub(crate) fn gath_m_rvput(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dst_image: Image,
    dst: *mut u8,
    srclist: *const *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    let options = Options::insync_if(flags.is_in_allsync())
        | Options::outsync_if(!flags.is_out_nosync())
        | Options::p2p_if(!eng.team().image_is_local(dst_image));

    generic_gather_m_nb(
        eng, ctx, team, dst_image, dst, srclist, nbytes, flags, pf_gath_m_rvput, options,
    )
}

pub(crate) fn gather_m_nb(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dst_image: Image,
    dst: *mut u8,
    srclist: *const *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    eng.validate(team, flags);

    let flags = if flags.is_single() {
        let first = unsafe { *srclist.add(eng.team().my_first_index(false)) };
        eng.segs().discover(
            flags,
            dst as *const u8,
            nbytes * eng.team().total_images(),
            first,
            nbytes,
        )
    } else {
        flags
    };

    match choose_gather_m(flags, nbytes) {
        Variant::Eager => gath_m_eager(eng, ctx, team, dst_image, dst, srclist, nbytes, flags),
        Variant::RvPut => gath_m_rvput(eng, ctx, team, dst_image, dst, srclist, nbytes, flags),
        Variant::Put => gath_m_put(eng, ctx, team, dst_image, dst, srclist, nbytes, flags),
        Variant::Get => gath_m_get(eng, ctx, team, dst_image, dst, srclist, nbytes, flags),
        _ => super::unsupported_residency(),
    }
}
