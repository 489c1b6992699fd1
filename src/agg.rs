use std::sync::Mutex;

use slab::Slab;

use crate::handle::{CollHandle, HandleStore};

/// The aggregation façade: groups of submitted operations that share
/// one completion handle.
///
/// Members join the open group while it is under construction; the
/// next non-aggregate submission seals it and donates its handle as
/// the group handle. Members retire in any order. A sealed group
/// signals its handle exactly once, when the last member retires; an
/// unsealed group never signals, however briefly it is empty.
pub(crate) struct AggTable {
    inner: Mutex<AggInner>,
}

struct AggInner {
    groups: Slab<AggGroup>,
    /// Group currently accepting members, if any.
    building: Option<usize>,
    /// Handle of the most recently sealed region, handed back by
    /// `end_region`.
    region_handle: Option<CollHandle>,
}

/// The container record: the second op kind of the shared allocator,
/// distinguished by carrying a handle and no algorithm.
struct AggGroup {
    handle: CollHandle,
    members: usize,
    sealed: bool,
}

/// Outcome of filtering one submission through the aggregation layer.
pub(crate) struct AggDecision {
    /// Group id to stamp on the op, if it was absorbed.
    pub group: Option<usize>,
    /// Handle to return to the client (the group's when sealing).
    pub handle: CollHandle,
}

impl AggTable {
    pub fn new() -> AggTable {
        AggTable {
            inner: Mutex::new(AggInner {
                groups: Slab::new(),
                building: None,
                region_handle: None,
            }),
        }
    }

    /// Routes one submission. `aggregate` is the client's AGGREGATE
    /// flag; `handle` is the handle allocated for the op (invalid for
    /// aggregate members).
    pub fn filter(&self, aggregate: bool, handle: CollHandle) -> AggDecision {
        let mut inner = self.inner.lock().unwrap();

        if aggregate {
            assert!(
                !handle.is_valid(),
                "aggregate submissions must not carry a handle"
            );

            let gid = match inner.building {
                Some(gid) => gid,
                None => {
                    // Lazily build the container for this region.
                    let gid = inner.groups.insert(AggGroup {
                        handle: CollHandle::INVALID,
                        members: 0,
                        sealed: false,
                    });
                    inner.building = Some(gid);
                    gid
                }
            };
            inner.groups[gid].members += 1;

            AggDecision {
                group: Some(gid),
                handle: CollHandle::INVALID,
            }
        } else if let Some(gid) = inner.building.take() {
            // End of the aggregate: this op joins it, the group
            // adopts the op's handle, and the client gets the group
            // handle in place of the op's.
            let group = &mut inner.groups[gid];
            group.members += 1;
            group.sealed = true;
            group.handle = handle;
            inner.region_handle = Some(handle);

            AggDecision {
                group: Some(gid),
                handle,
            }
        } else {
            // An isolated op, the normal case.
            AggDecision {
                group: None,
                handle,
            }
        }
    }

    /// Retires one member. When a sealed group empties, its handle is
    /// signalled and the container destroyed.
    pub fn member_done(&self, gid: usize, handles: &HandleStore) {
        let mut inner = self.inner.lock().unwrap();

        let group = &mut inner.groups[gid];
        assert!(group.members > 0);
        group.members -= 1;

        if group.sealed && group.members == 0 {
            let handle = group.handle;
            inner.groups.remove(gid);
            handles.signal(handle);
        }
    }

    /// Opens an aggregation access region.
    pub fn begin_region(&self) {
        let inner = self.inner.lock().unwrap();
        assert!(
            inner.building.is_none(),
            "aggregation region already open"
        );
    }

    /// Closes the region and returns its single handle. If no
    /// non-aggregate submission sealed the group, `fresh` is adopted
    /// as the container handle; a region that emptied (or never had
    /// members) is signalled on the spot.
    pub fn end_region(
        &self,
        handles: &HandleStore,
        fresh: impl FnOnce() -> CollHandle,
    ) -> CollHandle {
        let mut inner = self.inner.lock().unwrap();

        if let Some(gid) = inner.building.take() {
            let handle = fresh();
            let group = &mut inner.groups[gid];
            group.sealed = true;
            group.handle = handle;
            if group.members == 0 {
                inner.groups.remove(gid);
                handles.signal(handle);
            }
            return handle;
        }

        match inner.region_handle.take() {
            Some(handle) => handle,
            None => {
                // Empty region: hand back an already-complete handle.
                let handle = fresh();
                handles.signal(handle);
                handle
            }
        }
    }

    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.groups.is_empty() && inner.building.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleStore;

    fn pool() -> (HandleStore, Vec<CollHandle>) {
        let store = HandleStore::new();
        let free = store.carve();
        (store, free)
    }

    #[test]
    fn isolated_op_passes_through() {
        let agg = AggTable::new();
        let (_store, mut free) = pool();
        let h = free.pop().unwrap();

        let d = agg.filter(false, h);
        assert_eq!(d.group, None);
        assert_eq!(d.handle, h);
        assert!(agg.is_idle());
    }

    #[test]
    fn members_share_the_sealing_handle() {
        let agg = AggTable::new();
        let (store, mut free) = pool();

        let a = agg.filter(true, CollHandle::INVALID);
        let b = agg.filter(true, CollHandle::INVALID);
        assert_eq!(a.group, b.group);

        let h = free.pop().unwrap();
        store.reset(h);
        let sealer = agg.filter(true, CollHandle::INVALID);
        let sealed = agg.filter(false, h);
        assert_eq!(sealed.group, a.group);
        assert_eq!(sealed.handle, h);

        // Any retirement order is valid; the handle fires only on the
        // last member.
        let gid = a.group.unwrap();
        agg.member_done(gid, &store);
        agg.member_done(gid, &store);
        assert_eq!(sealer.group, Some(gid));
        assert!(!store.is_done(h));
        agg.member_done(gid, &store);
        assert!(!store.is_done(h));
        agg.member_done(gid, &store);
        assert!(store.is_done(h));
        assert!(agg.is_idle());
    }

    #[test]
    fn unsealed_emptiness_does_not_signal() {
        let agg = AggTable::new();
        let (store, mut free) = pool();

        let a = agg.filter(true, CollHandle::INVALID);
        let gid = a.group.unwrap();
        // The sole member retires while the region is still under
        // construction: nothing must fire.
        agg.member_done(gid, &store);

        let b = agg.filter(true, CollHandle::INVALID);
        assert_eq!(b.group, Some(gid));

        let h = free.pop().unwrap();
        store.reset(h);
        let sealed = agg.filter(false, h);
        assert_eq!(sealed.handle, h);
        assert!(!store.is_done(h));

        agg.member_done(gid, &store);
        agg.member_done(gid, &store);
        assert!(store.is_done(h));
    }

    #[test]
    fn end_region_without_sealer_adopts_fresh_handle() {
        let agg = AggTable::new();
        let (store, mut free) = pool();

        agg.begin_region();
        let a = agg.filter(true, CollHandle::INVALID);
        let gid = a.group.unwrap();

        let h = free.pop().unwrap();
        store.reset(h);
        let region = agg.end_region(&store, || h);
        assert_eq!(region, h);
        assert!(!store.is_done(h));

        agg.member_done(gid, &store);
        assert!(store.is_done(h));
    }
}
