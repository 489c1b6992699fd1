use crate::engine::{CollCtx, Engine};
use crate::flags::Flags;
use crate::handle::CollHandle;
use crate::op::{
    CollArgs, CollOp, ConstList, ConstPtr, ExchangeArgs, ExchangeMArgs, GenericData, MutList,
    MutPtr, Options, PollFn, PollOutcome, Private,
};
use crate::team::Team;

use super::gather;

/*
 *
 * ===== exchange =====
 *
 * Composed from simultaneous gathers like gather_all, with the source
 * reindexed so image i receives the i-th slice from every peer.
 */

fn generic_exchange_nb(
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

fn pf_exchg_gath(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let args = data.args.exchange();

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
                    let subflags =
                        op.flags.inherited() | Flags::in_nosync() | Flags::out_nosync();
                    let total = eng.team().total_images();

                    let mut handles = Vec::with_capacity(total);
                    for i in 0..total {
                        // The gather rooted at image i collects
                        // everyone's i-th slice.
                        let src = unsafe { args.src.0.add(i * args.nbytes) };
                        handles.push(gather::gather_nb(
                            eng,
                            ctx,
                            team,
                            i,
                            args.dst.0,
                            src,
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

pub(crate) fn exchange_nb(
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
        eng.segs().discover(
            flags,
            dst as *const u8,
            nbytes * eng.ranks(),
            src,
            nbytes * eng.ranks(),
        )
    } else {
        flags
    };

    let args = CollArgs::Exchange(ExchangeArgs {
        dst: MutPtr(dst),
        src: ConstPtr(src),
        nbytes,
    });
    generic_exchange_nb(eng, ctx, team, args, flags, pf_exchg_gath)
}

/*
 *
 * ===== exchangeM =====
 *
 */

fn pf_exchg_m_gath(eng: &Engine, ctx: &CollCtx, op: &CollOp, data: &mut GenericData) -> PollOutcome {
    let args = data.args.exchange_m();

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

                    // Reindex the source lists: row i holds, for each
                    // locally named image, a pointer to its i-th
                    // slice. The rows stay alive in the op's private
                    // data for as long as the sub-gathers read them.
                    let width = if local { map.my_images() } else { total };
                    let mut srcs: Vec<ConstPtr> = Vec::with_capacity(total * width);
                    for i in 0..total {
                        for j in 0..width {
                            let p = unsafe { args.srclist.at(j).add(i * args.nbytes) };
                            srcs.push(ConstPtr(p));
                        }
                    }

                    let mut handles = Vec::with_capacity(total);
                    for i in 0..total {
                        let dst = if !local {
                            unsafe { args.dstlist.at(i) }
                        } else if map.image_is_local(i) {
                            unsafe { args.dstlist.at(i - map.my_offset()) }
                        } else {
                            std::ptr::null_mut()
                        };
                        let row = unsafe { srcs.as_ptr().add(i * width) } as *const *const u8;
                        handles.push(gather::gather_m_nb(
                            eng,
                            ctx,
                            team,
                            i,
                            dst,
                            row,
                            args.nbytes,
                            subflags,
                        ));
                    }
                    data.private = Private::Exchange { handles, srcs };
                } else {
                    return PollOutcome::pending();
                }
                data.state = 2;
            }

            2 => {
                let done = match &mut data.private {
                    Private::Handles(handles) => eng.coll_sync(ctx, handles),
                    Private::Exchange { handles, .. } => eng.coll_sync(ctx, handles),
                    Private::None => true,
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

pub(crate) fn exchange_m_nb(
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
        let first = eng.team().my_first_index(false);
        let first_dst = unsafe { *dstlist.add(first) };
        let first_src = unsafe { *srclist.add(first) };
        let len = nbytes * eng.team().total_images();
        eng.segs()
            .discover(flags, first_dst as *const u8, len, first_src, len)
    } else {
        flags
    };

    let args = CollArgs::ExchangeM(ExchangeMArgs {
        dstlist: MutList(dstlist),
        srclist: ConstList(srclist),
        nbytes,
    });
    generic_exchange_nb(eng, ctx, team, args, flags, pf_exchg_m_gath)
}
