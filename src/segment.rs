use crate::flags::Flags;
use crate::team::Rank;

/// The caller's registered RMA segment: the span of its address space
/// peers may target with one-sided operations.
#[derive(Copy, Clone, Debug)]
pub struct Segment {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for Segment {}

impl Segment {
    pub fn new(base: *mut u8, len: usize) -> Segment {
        Segment { base, len }
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Every rank's segment range, exchanged at init. The RMA plane
/// addresses remote memory by offset into the target rank's segment,
/// so single-valued addressing means "the same offset on every
/// rank".
pub(crate) struct SegTable {
    ranges: Vec<(usize, usize)>,
    my_rank: Rank,
}

impl SegTable {
    pub fn new(ranges: Vec<(usize, usize)>, my_rank: Rank) -> SegTable {
        assert!(my_rank < ranges.len());
        SegTable { ranges, my_rank }
    }

    fn range(&self, rank: Rank) -> (usize, usize) {
        self.ranges[rank]
    }

    /// Offset of `[addr, addr+len)` within `rank`'s segment, or None
    /// if any part falls outside it.
    pub fn offset_in(&self, rank: Rank, addr: *const u8, len: usize) -> Option<usize> {
        let (base, seglen) = self.range(rank);
        let addr = addr as usize;
        if addr < base {
            return None;
        }
        let off = addr - base;
        if off.checked_add(len)? > seglen {
            return None;
        }
        Some(off)
    }

    /// Offset of a local buffer within this rank's own segment; fatal
    /// if the buffer is not entirely in-segment. Used for addresses
    /// the caller has claimed (or the selector inferred) to be
    /// in-segment.
    pub fn local_offset(&self, addr: *const u8, len: usize) -> usize {
        match self.offset_in(self.my_rank, addr, len) {
            Some(off) => off,
            None => panic!(
                "buffer {:p}..+{} is outside the registered segment",
                addr, len
            ),
        }
    }

    /// Offset of an image-list entry within its owning rank's
    /// segment; fatal when out of bounds.
    pub fn remote_offset(&self, rank: Rank, addr: *const u8, len: usize) -> usize {
        match self.offset_in(rank, addr, len) {
            Some(off) => off,
            None => panic!(
                "buffer {:p}..+{} is outside rank {}'s registered segment",
                addr, len, rank
            ),
        }
    }

    pub fn in_local_segment(&self, addr: *const u8, len: usize) -> bool {
        self.offset_in(self.my_rank, addr, len).is_some()
    }

    /// Bounds check a buffer the caller claims is in-segment.
    pub fn boundscheck(&self, addr: *const u8, len: usize) {
        if !self.in_local_segment(addr, len) {
            panic!(
                "claimed in-segment buffer {:p}..+{} fails the segment bounds check",
                addr, len
            );
        }
    }

    /// "Discovers" segment-residency flags the caller left unset by
    /// checking the locally visible portions of the buffers.
    pub fn discover(
        &self,
        flags: Flags,
        dst: *const u8,
        dstlen: usize,
        src: *const u8,
        srclen: usize,
    ) -> Flags {
        let mut flags = flags;
        if !flags.is_dst_in_segment() && self.in_local_segment(dst, dstlen) {
            flags = flags | Flags::dst_in_segment();
        }
        if !flags.is_src_in_segment() && self.in_local_segment(src, srclen) {
            flags = flags | Flags::src_in_segment();
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::Flags;

    fn table() -> SegTable {
        SegTable::new(vec![(0x1000, 0x100), (0x8000, 0x100)], 0)
    }

    #[test]
    fn offsets_and_bounds() {
        let t = table();
        assert_eq!(t.offset_in(0, 0x1010 as *const u8, 8), Some(0x10));
        assert_eq!(t.offset_in(1, 0x8000 as *const u8, 0x100), Some(0));
        assert_eq!(t.offset_in(0, 0x10f9 as *const u8, 8), None);
        assert_eq!(t.offset_in(0, 0xfff as *const u8, 1), None);
    }

    #[test]
    fn discover_sets_only_resident_ends() {
        let t = table();
        let flags = t.discover(
            Flags::in_nosync() | Flags::out_nosync() | Flags::single(),
            0x1000 as *const u8,
            16,
            0x4000 as *const u8,
            16,
        );
        assert!(flags.is_dst_in_segment());
        assert!(!flags.is_src_in_segment());
    }

    #[test]
    #[should_panic(expected = "bounds check")]
    fn false_claim_is_fatal() {
        table().boundscheck(0x4000 as *const u8, 4);
    }
}
