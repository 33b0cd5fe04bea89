/// Gap finder: scan the volume bitmap for a run of free clusters matching
/// the caller's size/location constraints (§4.4).
///
/// Grounded on `find_gap` (defrag_lib.cpp): the bitmap is always re-queried
/// rather than cached ("faster to cache in memory, but that would cause
/// more fails because of stale information"), scanned in windows sized to
/// the caller-supplied buffer, tracking a `cluster_start`/`prev_in_use`
/// state machine across window boundaries.
use crate::model::UnmovableRegions;
use crate::platform::{IoError, RawVolumeHandle, VolumeIo};

/// Size of the scratch buffer used to pull bitmap windows from the volume,
/// matching the 64KiB fixed buffer the original uses ("most efficient if
/// binary multiple").
pub const BITMAP_WINDOW_BYTES: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub begin_lcn: u64,
    pub end_lcn: u64,
}

impl Gap {
    pub fn len(&self) -> u64 {
        self.end_lcn.saturating_sub(self.begin_lcn)
    }

    pub fn is_empty(&self) -> bool {
        self.begin_lcn >= self.end_lcn
    }
}

/// Which gap to return when more than one would satisfy `minimum_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapSelection {
    /// The first (lowest-LCN) gap at or above `minimum_lcn`.
    Lowest,
    /// The highest-LCN gap at or below `maximum_lcn`.
    Highest,
}

/// Search the volume bitmap for a gap satisfying the given constraints.
///
/// - `minimum_lcn`/`maximum_lcn`: scan range. `maximum_lcn == 0` means "to
///   the end of the volume" (resolved from the first bitmap window).
/// - `minimum_size`: the gap must have at least this many free clusters.
///   `0` matches any gap.
/// - `must_fit`: if `false` and no gap reaches `minimum_size`, fall back to
///   the single largest gap found in the scanned range.
/// - `selection`: lowest- or highest-LCN gap among those meeting
///   `minimum_size`.
/// - `ignore_mft_excludes`: if `true`, MFT-reserved regions are treated as
///   free space rather than forced in-use.
#[allow(clippy::too_many_arguments)]
pub fn find_gap(
    io: &dyn VolumeIo,
    handle: RawVolumeHandle,
    total_clusters: u64,
    mft_excludes: &UnmovableRegions,
    minimum_lcn: u64,
    mut maximum_lcn: u64,
    minimum_size: u64,
    must_fit: bool,
    selection: GapSelection,
    ignore_mft_excludes: bool,
) -> Result<Option<Gap>, IoError> {
    if minimum_lcn >= total_clusters {
        return Ok(None);
    }

    let mut buffer = vec![0u8; BITMAP_WINDOW_BYTES];
    let mut lcn = minimum_lcn;
    let mut cluster_start = 0u64;
    let mut prev_in_use = true;

    let mut highest: Option<Gap> = None;
    let mut largest: Option<Gap> = None;

    loop {
        let window = io.read_bitmap_window(handle, lcn, &mut buffer)?;

        if lcn >= window.starting_lcn + window.bitmap_length {
            return Ok(None);
        }
        if maximum_lcn == 0 {
            maximum_lcn = window.starting_lcn + window.bitmap_length;
        }

        lcn = window.starting_lcn;
        let window_end = (window.starting_lcn + window.bitmap_length).min(maximum_lcn);

        while lcn < window_end {
            if lcn >= minimum_lcn {
                let bit_index = (lcn - window.starting_lcn) as usize;
                let byte = window.bits.get(bit_index / 8).copied().unwrap_or(0);
                let mut in_use = byte & (1 << (bit_index % 8)) != 0;

                if !ignore_mft_excludes && mft_excludes.contains(lcn) {
                    in_use = true;
                }

                if !prev_in_use && in_use {
                    let gap = Gap {
                        begin_lcn: cluster_start,
                        end_lcn: lcn,
                    };
                    consider_gap(gap, minimum_lcn, minimum_size, &mut highest, &mut largest);
                    if selection == GapSelection::Lowest
                        && cluster_start >= minimum_lcn
                        && gap.len() >= minimum_size
                    {
                        return Ok(Some(gap));
                    }
                }

                if prev_in_use && !in_use {
                    cluster_start = lcn;
                }
                prev_in_use = in_use;
            }
            lcn += 1;
        }

        if lcn >= window.starting_lcn + window.bitmap_length || lcn >= maximum_lcn {
            break;
        }
    }

    if !prev_in_use {
        let gap = Gap {
            begin_lcn: cluster_start,
            end_lcn: lcn,
        };
        consider_gap(gap, minimum_lcn, minimum_size, &mut highest, &mut largest);
        if selection == GapSelection::Lowest
            && cluster_start >= minimum_lcn
            && gap.len() >= minimum_size
        {
            return Ok(Some(gap));
        }
    }

    if selection == GapSelection::Highest {
        if let Some(gap) = highest {
            return Ok(Some(gap));
        }
    }

    if !must_fit {
        if let Some(gap) = largest {
            return Ok(Some(gap));
        }
    }

    Ok(None)
}

fn consider_gap(
    gap: Gap,
    minimum_lcn: u64,
    minimum_size: u64,
    highest: &mut Option<Gap>,
    largest: &mut Option<Gap>,
) {
    if gap.begin_lcn >= minimum_lcn && gap.len() >= minimum_size {
        *highest = Some(gap);
    }
    let bigger = match largest {
        None => true,
        Some(cur) => gap.len() > cur.len(),
    };
    if bigger {
        *largest = Some(gap);
    }
}
