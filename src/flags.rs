use std::{fmt, ops};

/// A set of collective submission flags.
///
/// Every collective call carries exactly one IN synchronization mode,
/// exactly one OUT synchronization mode, and exactly one addressing
/// mode (`single` or `local`). Segment-residency hints and
/// aggregation are optional. `Flags` values combine with `|`.
///
/// # Examples
///
/// ```
/// use pgas_io::Flags;
///
/// let flags = Flags::in_allsync() | Flags::out_allsync() | Flags::single();
///
/// assert!(flags.is_in_allsync());
/// assert!(flags.is_single());
/// assert!(!flags.is_local());
/// ```
#[derive(Copy, PartialEq, Eq, Clone)]
pub struct Flags(usize);

const IN_NOSYNC: usize = 0b0000_0000_0001;
const IN_MYSYNC: usize = 0b0000_0000_0010;
const IN_ALLSYNC: usize = 0b0000_0000_0100;
const OUT_NOSYNC: usize = 0b0000_0000_1000;
const OUT_MYSYNC: usize = 0b0000_0001_0000;
const OUT_ALLSYNC: usize = 0b0000_0010_0000;
const SINGLE: usize = 0b0000_0100_0000;
const LOCAL: usize = 0b0000_1000_0000;
const AGGREGATE: usize = 0b0001_0000_0000;
const SRC_IN_SEGMENT: usize = 0b0010_0000_0000;
const DST_IN_SEGMENT: usize = 0b0100_0000_0000;

const IN_MODE: usize = IN_NOSYNC | IN_MYSYNC | IN_ALLSYNC;
const OUT_MODE: usize = OUT_NOSYNC | OUT_MYSYNC | OUT_ALLSYNC;

impl Flags {
    /// Returns the empty flag set.
    pub fn empty() -> Flags {
        Flags(0)
    }

    /// No synchronization with other images on entry.
    #[inline]
    pub fn in_nosync() -> Flags {
        Flags(IN_NOSYNC)
    }

    /// Entry is synchronized with the images this call moves data
    /// with, and no others.
    #[inline]
    pub fn in_mysync() -> Flags {
        Flags(IN_MYSYNC)
    }

    /// Entry is synchronized with every image in the team.
    #[inline]
    pub fn in_allsync() -> Flags {
        Flags(IN_ALLSYNC)
    }

    /// No synchronization with other images before completion.
    #[inline]
    pub fn out_nosync() -> Flags {
        Flags(OUT_NOSYNC)
    }

    /// Completion is synchronized with the images this call moved
    /// data with, and no others.
    #[inline]
    pub fn out_mysync() -> Flags {
        Flags(OUT_MYSYNC)
    }

    /// Completion is synchronized with every image in the team.
    #[inline]
    pub fn out_allsync() -> Flags {
        Flags(OUT_ALLSYNC)
    }

    /// Single-valued addressing: every image passes addresses at the
    /// same segment offsets.
    #[inline]
    pub fn single() -> Flags {
        Flags(SINGLE)
    }

    /// Local addressing: each image passes only its own addresses.
    #[inline]
    pub fn local() -> Flags {
        Flags(LOCAL)
    }

    /// Bind this operation into the open aggregation region instead
    /// of returning its own handle.
    #[inline]
    pub fn aggregate() -> Flags {
        Flags(AGGREGATE)
    }

    /// The caller asserts the source buffer lies in the registered
    /// segment.
    #[inline]
    pub fn src_in_segment() -> Flags {
        Flags(SRC_IN_SEGMENT)
    }

    /// The caller asserts the destination buffer lies in the
    /// registered segment.
    #[inline]
    pub fn dst_in_segment() -> Flags {
        Flags(DST_IN_SEGMENT)
    }

    #[inline]
    pub fn is_in_nosync(&self) -> bool {
        self.contains(Flags(IN_NOSYNC))
    }

    #[inline]
    pub fn is_in_mysync(&self) -> bool {
        self.contains(Flags(IN_MYSYNC))
    }

    #[inline]
    pub fn is_in_allsync(&self) -> bool {
        self.contains(Flags(IN_ALLSYNC))
    }

    #[inline]
    pub fn is_out_nosync(&self) -> bool {
        self.contains(Flags(OUT_NOSYNC))
    }

    #[inline]
    pub fn is_out_mysync(&self) -> bool {
        self.contains(Flags(OUT_MYSYNC))
    }

    #[inline]
    pub fn is_out_allsync(&self) -> bool {
        self.contains(Flags(OUT_ALLSYNC))
    }

    #[inline]
    pub fn is_single(&self) -> bool {
        self.contains(Flags(SINGLE))
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        self.contains(Flags(LOCAL))
    }

    #[inline]
    pub fn is_aggregate(&self) -> bool {
        self.contains(Flags(AGGREGATE))
    }

    #[inline]
    pub fn is_src_in_segment(&self) -> bool {
        self.contains(Flags(SRC_IN_SEGMENT))
    }

    #[inline]
    pub fn is_dst_in_segment(&self) -> bool {
        self.contains(Flags(DST_IN_SEGMENT))
    }

    /// Returns true if `self` is a superset of `other`.
    #[inline]
    pub fn contains(&self, other: Flags) -> bool {
        (*self & other) == other
    }

    /// Returns true if any flag of `other` is present in `self`.
    #[inline]
    pub fn intersects(&self, other: Flags) -> bool {
        (*self & other) != Flags::empty()
    }

    /// The flag subset a composed sub-operation inherits: addressing
    /// mode and segment-residency hints.
    pub(crate) fn inherited(&self) -> Flags {
        Flags(self.0 & (SINGLE | LOCAL | SRC_IN_SEGMENT | DST_IN_SEGMENT))
    }

    /// Validates the exactly-one rules for the IN, OUT and
    /// addressing groups. Malformed flag sets are fatal.
    pub(crate) fn validate(&self) {
        match self.0 & IN_MODE {
            0 => panic!("no IN sync flag given"),
            IN_NOSYNC | IN_MYSYNC | IN_ALLSYNC => {}
            _ => panic!("multiple IN sync flags given"),
        }

        match self.0 & OUT_MODE {
            0 => panic!("no OUT sync flag given"),
            OUT_NOSYNC | OUT_MYSYNC | OUT_ALLSYNC => {}
            _ => panic!("multiple OUT sync flags given"),
        }

        assert!(
            self.is_single() ^ self.is_local(),
            "exactly one of single/local addressing must be given"
        );
    }
}

impl ops::BitOr for Flags {
    type Output = Flags;

    #[inline]
    fn bitor(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }
}

impl ops::BitAnd for Flags {
    type Output = Flags;

    #[inline]
    fn bitand(self, other: Flags) -> Flags {
        Flags(self.0 & other.0)
    }
}

impl ops::Sub for Flags {
    type Output = Flags;

    #[inline]
    fn sub(self, other: Flags) -> Flags {
        Flags(self.0 & !other.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Flags(IN_NOSYNC), "InNoSync"),
            (Flags(IN_MYSYNC), "InMySync"),
            (Flags(IN_ALLSYNC), "InAllSync"),
            (Flags(OUT_NOSYNC), "OutNoSync"),
            (Flags(OUT_MYSYNC), "OutMySync"),
            (Flags(OUT_ALLSYNC), "OutAllSync"),
            (Flags(SINGLE), "Single"),
            (Flags(LOCAL), "Local"),
            (Flags(AGGREGATE), "Aggregate"),
            (Flags(SRC_IN_SEGMENT), "SrcInSegment"),
            (Flags(DST_IN_SEGMENT), "DstInSegment"),
        ];

        write!(fmt, "Flags {{")?;

        for &(flag, msg) in &flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;

                one = true
            }
        }

        write!(fmt, "}}")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Flags;

    #[test]
    fn groups() {
        let f = Flags::in_mysync() | Flags::out_nosync() | Flags::local();
        assert!(f.is_in_mysync());
        assert!(!f.is_in_nosync());
        assert!(f.is_out_nosync());
        assert!(f.is_local());
        assert!(!f.is_single());
        f.validate();
    }

    #[test]
    fn inherited_strips_sync_and_aggregate() {
        let f = Flags::in_allsync()
            | Flags::out_allsync()
            | Flags::single()
            | Flags::aggregate()
            | Flags::dst_in_segment();
        let sub = f.inherited();
        assert!(sub.is_single());
        assert!(sub.is_dst_in_segment());
        assert!(!sub.is_aggregate());
        assert!(!sub.is_in_allsync());
        assert!(!sub.is_out_allsync());
    }

    #[test]
    #[should_panic(expected = "no IN sync flag")]
    fn missing_in_mode() {
        (Flags::out_nosync() | Flags::single()).validate();
    }

    #[test]
    #[should_panic(expected = "multiple IN sync flags")]
    fn conflicting_in_mode() {
        (Flags::in_nosync() | Flags::in_allsync() | Flags::out_nosync() | Flags::single())
            .validate();
    }

    #[test]
    #[should_panic(expected = "single/local")]
    fn both_addressing_modes() {
        (Flags::in_nosync() | Flags::out_nosync() | Flags::single() | Flags::local()).validate();
    }
}
