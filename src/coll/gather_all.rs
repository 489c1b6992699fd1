use crate::engine::{CollCtx, Engine};
use crate::flags::Flags;
use crate::handle::CollHandle;
use crate::op::{
    CollArgs, CollOp, ConstList, ConstPtr, GatherAllArgs, GatherAllMArgs, GenericData, MutList,
    MutPtr, Options, PollFn, PollOutcome, Private,
};
use crate::team::Team;

use super::gather;

/*
 *
 * ===== gather_all =====
 *
 * Implemented as total_images simultaneous gathers, one rooted at
 * each image, all submitted NOSYNC and drained together. The
 * orchestrating op owns the IN/OUT synchronization.
 */

fn generic_gather_all_nb(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    args: CollArgs,
    flags: Flags,
    poll_fn: PollFn,
) -> CollHandle {
    let options = Options::insync_if(!flags.is_in_nosync())
        | Options::outsync_if(!flags.is_out_nosync());

    if !(flags.is_dst_in_segment() && flags.is_src_in_segment()) {
        super::unsupported_residency();
    }

    eng.op_generic_init(ctx, team, flags, GenericData::new(args, options), poll_fn)
}

fn pf_gall_gath(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let args = data.args.gather_all();

    loop {
        match data.state {
            0 => {
                if !eng.insync(data) {
                    return PollOutcome::pending();
                }
                data.state = 1;
            }

            // Initiate the component gathers
            1 => {
                if args.nbytes == 0 {
                    data.private = Private::Handles(Vec::new());
                } else if data.is_owner(ctx) {
                    let team = Team::lookup(op.team_id);
                    let subflags =
                        op.flags.inherited() | Flags::in_nosync() | Flags::out_nosync();
                    let total = eng.team().total_images();

                    let mut handles = Vec::with_capacity(total);
                    for i in 0..total {
                        handles.push(gather::gather_nb(
                            eng,
                            ctx,
                            team,
                            i,
                            args.dst.0,
                            args.src.0,
                            args.nbytes,
                            subflags,
                        ));
                    }
                    data.private = Private::Handles(handles);
                } else {
                    // Stalled until the owner thread submits the
                    // gathers
                    return PollOutcome::pending();
                }
                data.state = 2;
            }

            // Drain the component gathers
            2 => {
                let done = match &mut data.private {
                    Private::Handles(handles) => eng.coll_sync(ctx, handles),
                    _ => true,
                };
                if !done {
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

pub(crate) fn gather_all_nb(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
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

    let args = CollArgs::GatherAll(GatherAllArgs {
        dst: MutPtr(dst),
        src: ConstPtr(src),
        nbytes,
    });
    generic_gather_all_nb(eng, ctx, team, args, flags, pf_gall_gath)
}

/*
 *
 * ===== gather_allM =====
 *
 */

fn pf_gall_m_gath(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let args = data.args.gather_all_m();

    loop {
        match data.state {
            0 => {
                if !eng.insync(data) {
                    return PollOutcome::pending();
                }
                data.state = 1;
            }

            1 => {
                if args.nbytes == 0 {
                    data.private = Private::Handles(Vec::new());
                } else if data.is_owner(ctx) {
                    let team = Team::lookup(op.team_id);
                    let map = eng.team();
                    let subflags =
                        op.flags.inherited() | Flags::in_nosync() | Flags::out_nosync();
                    let total = map.total_images();
                    let local = op.flags.is_local();

                    let mut handles = Vec::with_capacity(total);
                    for i in 0..total {
                        // Under local addressing the destination list
                        // only names this rank's images; the root
                        // buffer argument matters only where image i
                        // lives.
                        let dst = if !local {
                            unsafe { args.dstlist.at(i) }
                        } else if map.image_is_local(i) {
                            unsafe { args.dstlist.at(i - map.my_offset()) }
                        } else {
                            std::ptr::null_mut()
                        };
                        handles.push(gather::gather_m_nb(
                            eng,
                            ctx,
                            team,
                            i,
                            dst,
                            args.srclist.0,
                            args.nbytes,
                            subflags,
                        ));
                    }
                    data.private = Private::Handles(handles);
                } else {
                    return PollOutcome::pending();
                }
                data.state = 2;
            }

            2 => {
                let done = match &mut data.private {
                    Private::Handles(handles) => eng.coll_sync(ctx, handles),
                    _ => true,
                };
                if !done {
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

pub(crate) fn gather_all_m_nb(
    eng: &Engine,
    ctx: &CollCtx,
    team: Team,
    dstlist: *const *mut u8,
    srclist: *const *const u8,
    nbytes: usize,
    flags: Flags,
) -> CollHandle {
    eng.validate(team, flags);

    let flags = if flags.is_single() {
        let first_dst = unsafe { *dstlist.add(eng.team().my_first_index(false)) };
        let first_src = unsafe { *srclist.add(eng.team().my_first_index(false)) };
        eng.segs().discover(
            flags,
            first_dst as *const u8,
            nbytes * eng.team().total_images(),
            first_src,
            nbytes,
        )
    } else {
        flags
    };

    let args = CollArgs::GatherAllM(GatherAllMArgs {
        dstlist: MutList(dstlist),
        srclist: ConstList(srclist),
        nbytes,
    });
    generic_gather_all_nb(eng, ctx, team, args, flags, pf_gall_m_gath)
}
