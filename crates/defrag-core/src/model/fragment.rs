/// A single contiguous extent of one stream.
///
/// `lcn` is the logical cluster number where the fragment starts on disk;
/// `next_vcn` is the virtual cluster number immediately after the fragment
/// within the owning stream's address space. A stream's fragments form a
/// finite singly-linked sequence — the tail is the natural insertion point
/// during decode, so a `Vec<Fragment>` with push-to-end access is enough;
/// random access is never required.
use compact_str::CompactString;

/// Sentinel LCN denoting a virtual fragment (a run with no on-disk backing —
/// a sparse hole or a compressed placeholder).
pub const VIRTUAL_FRAGMENT: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    /// Logical cluster number on the volume, or [`VIRTUAL_FRAGMENT`].
    pub lcn: u64,
    /// VCN immediately after this fragment, within the owning stream.
    pub next_vcn: u64,
}

impl Fragment {
    #[inline]
    pub fn is_virtual(&self) -> bool {
        self.lcn == VIRTUAL_FRAGMENT
    }
}

/// The fragment list of one stream, plus the VCN the list starts at.
#[derive(Debug, Clone, Default)]
pub struct FragmentList {
    pub fragments: Vec<Fragment>,
}

impl FragmentList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment, starting at `vcn`. The caller guarantees
    /// `vcn` equals the ending VCN of the last fragment already present —
    /// extension records (NTFS `$ATTRIBUTE_LIST` continuations) append,
    /// they never reset the list.
    ///
    /// Returns `false` (and appends nothing) if `vcn` does not match the
    /// tail, signalling stream-continuity corruption to the caller.
    pub fn append_checked(&mut self, vcn: u64, lcn: u64, next_vcn: u64) -> bool {
        if let Some(last) = self.fragments.last() {
            if last.next_vcn != vcn {
                return false;
            }
        }
        self.fragments.push(Fragment { lcn, next_vcn });
        true
    }

    /// Total cluster count, including virtual (non-resident-sparse) runs —
    /// the sum of `(next_vcn - previous_next_vcn)` over all fragments.
    pub fn total_clusters(&self) -> u64 {
        self.fragments.iter().zip(self.running_vcn_starts()).fold(
            0u64,
            |acc, (f, start)| acc + (f.next_vcn - start),
        )
    }

    /// Real (on-disk) cluster count — excludes virtual fragments. This is
    /// the invariant an item's `clusters_count` must equal.
    pub fn real_clusters(&self) -> u64 {
        self.fragments
            .iter()
            .zip(self.running_vcn_starts())
            .filter(|(f, _)| !f.is_virtual())
            .fold(0u64, |acc, (f, start)| acc + (f.next_vcn - start))
    }

    /// The LCN of the first real fragment, used as the item index key. `0`
    /// if the stream has no real (on-disk) fragments at all.
    pub fn first_real_lcn(&self) -> u64 {
        self.fragments
            .iter()
            .find(|f| !f.is_virtual())
            .map(|f| f.lcn)
            .unwrap_or(0)
    }

    /// `true` if the stream occupies a single contiguous run of real
    /// clusters (possibly none). Directories/empty streams count as
    /// unfragmented.
    pub fn is_unfragmented(&self) -> bool {
        let mut real = self
            .fragments
            .iter()
            .zip(self.running_vcn_starts())
            .filter(|(f, _)| !f.is_virtual());
        let (first, first_start) = match real.next() {
            Some(pair) => pair,
            None => return true,
        };
        let mut expected_lcn = first.lcn + (first.next_vcn - first_start);
        for (f, start) in real {
            if f.lcn != expected_lcn {
                return false;
            }
            expected_lcn = f.lcn + (f.next_vcn - start);
        }
        true
    }

    fn running_vcn_starts(&self) -> impl Iterator<Item = u64> + '_ {
        let mut prev = 0u64;
        self.fragments.iter().map(move |f| {
            let start = prev;
            prev = f.next_vcn;
            start
        })
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

/// A name that may alias its long form. Modeled as a sum type instead of the
/// aliased-pointer trick the original C++ uses (sometimes `short_name ==
/// long_name` to save an allocation): `short` is only `Some` when the short
/// (8.3) form differs from the long form.
#[derive(Debug, Clone)]
pub struct AliasedName {
    pub long: CompactString,
    short: Option<CompactString>,
}

impl AliasedName {
    pub fn new(long: CompactString) -> Self {
        Self { long, short: None }
    }

    pub fn with_short(long: CompactString, short: CompactString) -> Self {
        if short == long {
            Self { long, short: None }
        } else {
            Self {
                long,
                short: Some(short),
            }
        }
    }

    /// The short (8.3) form, or the long form if they are aliased.
    pub fn short(&self) -> &str {
        self.short.as_deref().unwrap_or(self.long.as_str())
    }
}
