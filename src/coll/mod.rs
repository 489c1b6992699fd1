//! The collective algorithms.
//!
//! Every collective is one or more small state machines sharing the
//! same scaffolding: an optional IN consensus barrier, an
//! algorithm-specific data-movement state, a drain of any issued RMA,
//! and an optional OUT consensus barrier. The per-collective entry
//! points choose among algorithm variants based on payload size,
//! segment residency, and synchronization mode.

use crate::flags::Flags;
use crate::op::{ConstList, MutList};
use crate::p2p::EAGER_MIN;

pub(crate) mod broadcast;
pub(crate) mod exchange;
pub(crate) mod gather;
pub(crate) mod gather_all;
pub(crate) mod scatter;

#[cfg(test)]
mod scenarios;

/// An algorithm variant the selector can pick.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Variant {
    /// All peers pull from the root with one-sided gets.
    Get,
    /// The root pushes to all peers with one-sided puts.
    Put,
    /// Bounded-size payloads ride active messages end to end.
    Eager,
    /// The root advertises an address; peers get from it.
    RvGet,
    /// The root advertises an address; peers put to it.
    RvPut,
    /// Neither end is in-segment: an AM-only path this engine does
    /// not provide.
    Am,
    /// No algorithm covers this flag combination.
    Unsupported,
}

/// True when the flags ask for a barrier-free path: MYSYNC avoids
/// the consensus barrier, LOCAL avoids the address exchange.
fn wants_rendezvous(flags: Flags) -> bool {
    flags.is_in_mysync() || flags.is_out_mysync() || flags.is_local()
}

/// The broadcast selector. Eager is AM-based and therefore safe
/// regardless of residency; the rendezvous variants need only the
/// root's end in-segment.
pub(crate) fn choose_broadcast(flags: Flags, nbytes: usize) -> Variant {
    if nbytes <= EAGER_MIN && wants_rendezvous(flags) {
        Variant::Eager
    } else if flags.is_dst_in_segment() {
        if wants_rendezvous(flags) {
            Variant::RvPut
        } else {
            Variant::Put
        }
    } else if flags.is_src_in_segment() {
        if wants_rendezvous(flags) {
            Variant::RvGet
        } else {
            Variant::Get
        }
    } else {
        Variant::Am
    }
}

/// Shared shape of the scatter/gather selectors: both ends must be
/// in-segment; `rv` names the rendezvous direction of the family.
fn choose_two_sided(flags: Flags, nbytes: usize, rv: Variant, bulk: Variant) -> Variant {
    if !(flags.is_dst_in_segment() && flags.is_src_in_segment()) {
        return Variant::Unsupported;
    }

    if flags.is_in_mysync() || flags.is_local() {
        if nbytes <= EAGER_MIN {
            Variant::Eager
        } else {
            rv
        }
    } else if flags.is_out_mysync() && nbytes <= EAGER_MIN {
        Variant::Eager
    } else {
        bulk
    }
}

pub(crate) fn choose_scatter(flags: Flags, nbytes: usize) -> Variant {
    choose_two_sided(flags, nbytes, Variant::RvGet, Variant::Put)
}

pub(crate) fn choose_gather(flags: Flags, nbytes: usize) -> Variant {
    choose_two_sided(flags, nbytes, Variant::RvPut, Variant::Put)
}

pub(crate) fn choose_broadcast_m(flags: Flags, nbytes: usize) -> Variant {
    choose_two_sided(flags, nbytes, Variant::RvGet, Variant::Get)
}

pub(crate) fn choose_scatter_m(flags: Flags, nbytes: usize) -> Variant {
    choose_two_sided(flags, nbytes, Variant::RvGet, Variant::Get)
}

pub(crate) fn choose_gather_m(flags: Flags, nbytes: usize) -> Variant {
    choose_two_sided(flags, nbytes, Variant::RvPut, Variant::Put)
}

pub(crate) fn unsupported_residency() -> ! {
    panic!("currently only in-segment data is supported for this operation");
}

/*
 *
 * ===== Local data movement =====
 *
 */

pub(crate) unsafe fn copy_bytes(dst: *mut u8, src: *const u8, nbytes: usize) {
    if nbytes > 0 {
        std::ptr::copy_nonoverlapping(src, dst, nbytes);
    }
}

/// Copies `src` to `count` destination-list entries starting at
/// `first`.
pub(crate) unsafe fn local_broadcast(
    count: usize,
    dstlist: MutList,
    first: usize,
    src: *const u8,
    nbytes: usize,
) {
    for i in 0..count {
        copy_bytes(dstlist.at(first + i), src, nbytes);
    }
}

/// Deals consecutive `nbytes` slices of `src` to the destination
/// list.
pub(crate) unsafe fn local_scatter(
    count: usize,
    dstlist: MutList,
    first: usize,
    src: *const u8,
    nbytes: usize,
) {
    for i in 0..count {
        copy_bytes(dstlist.at(first + i), src.add(i * nbytes), nbytes);
    }
}

/// Packs `count` source-list entries into consecutive slices of
/// `dst`.
pub(crate) unsafe fn local_gather(
    count: usize,
    dst: *mut u8,
    srclist: ConstList,
    first: usize,
    nbytes: usize,
) {
    for i in 0..count {
        copy_bytes(dst.add(i * nbytes), srclist.at(first + i), nbytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::Flags;

    fn base(extra: Flags) -> Flags {
        Flags::single() | extra
    }

    #[test]
    fn eager_boundary_is_inclusive() {
        let flags = base(Flags::in_mysync() | Flags::out_mysync());
        assert_eq!(choose_broadcast(flags, EAGER_MIN), Variant::Eager);
        let seg = flags | Flags::src_in_segment() | Flags::dst_in_segment();
        assert_eq!(choose_broadcast(seg, EAGER_MIN + 1), Variant::RvPut);
        assert_eq!(choose_scatter(seg, EAGER_MIN), Variant::Eager);
        assert_eq!(choose_scatter(seg, EAGER_MIN + 1), Variant::RvGet);
        assert_eq!(choose_gather(seg, EAGER_MIN + 1), Variant::RvPut);
    }

    #[test]
    fn allsync_bulk_paths() {
        let flags = base(Flags::in_allsync() | Flags::out_allsync())
            | Flags::src_in_segment()
            | Flags::dst_in_segment();
        assert_eq!(choose_broadcast(flags, 1 << 20), Variant::Put);
        assert_eq!(choose_scatter(flags, 4096), Variant::Put);
        assert_eq!(choose_gather(flags, 4096), Variant::Put);
        assert_eq!(choose_broadcast_m(flags, 4096), Variant::Get);
        assert_eq!(choose_scatter_m(flags, 4096), Variant::Get);
        assert_eq!(choose_gather_m(flags, 4096), Variant::Put);
    }

    #[test]
    fn broadcast_residency_routing() {
        let sync = Flags::in_allsync() | Flags::out_allsync();
        // Source-only residency takes the get paths.
        let src_only = base(sync) | Flags::src_in_segment();
        assert_eq!(choose_broadcast(src_only, 1 << 20), Variant::Get);
        let src_my = base(Flags::in_mysync() | Flags::out_nosync()) | Flags::src_in_segment();
        assert_eq!(choose_broadcast(src_my, 1 << 20), Variant::RvGet);
        // Nothing resident and too big for eager: the unimplemented
        // AM path.
        assert_eq!(choose_broadcast(base(sync), 1 << 20), Variant::Am);
        // Small payloads without MYSYNC/LOCAL still use the barrier
        // paths.
        assert_eq!(choose_broadcast(base(sync), 8), Variant::Am);
    }

    #[test]
    fn two_sided_selectors_demand_residency() {
        let flags = base(Flags::in_mysync() | Flags::out_nosync()) | Flags::src_in_segment();
        assert_eq!(choose_scatter(flags, 16), Variant::Unsupported);
        assert_eq!(choose_gather_m(flags, 16), Variant::Unsupported);
    }

    #[test]
    fn local_movement_helpers() {
        let src = [1u8, 2, 3, 4];
        let mut a = [0u8; 2];
        let mut b = [0u8; 2];
        let ptrs = [a.as_mut_ptr(), b.as_mut_ptr()];
        let list = MutList(ptrs.as_ptr());

        unsafe {
            local_scatter(2, list, 0, src.as_ptr(), 2);
        }
        assert_eq!(a, [1, 2]);
        assert_eq!(b, [3, 4]);

        unsafe {
            local_broadcast(2, list, 0, src.as_ptr(), 2);
        }
        assert_eq!(a, [1, 2]);
        assert_eq!(b, [1, 2]);

        let srcs = [a.as_ptr(), src.as_ptr()];
        let slist = ConstList(srcs.as_ptr());
        let mut packed = [0u8; 4];
        unsafe {
            local_gather(2, packed.as_mut_ptr(), slist, 0, 2);
        }
        assert_eq!(packed, [1, 2, 1, 2]);
    }
}
