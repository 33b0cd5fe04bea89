/// Volume scanning: boot-sector probe, filesystem dispatch, and the shared
/// runlist decoder both filesystem scanners build on (§4.1, §4.2).
pub mod fat;
pub mod ntfs;
pub mod runlist;

use crate::error::DefragError;
use crate::index::ItemIndex;
use crate::model::{FilesystemKind, UnmovableRegions};
use crate::platform::VolumeIo;

/// Probe a volume's first sector and report which filesystem scanner
/// applies. NTFS is checked first since its OEM-ID signature is more
/// specific than the generic FAT `0xAA55` tail.
pub fn probe_filesystem(first_sector: &[u8]) -> Option<FilesystemKind> {
    if ntfs::parse_boot_record(first_sector).is_ok() {
        return Some(FilesystemKind::Ntfs);
    }
    fat::parse_boot_record(first_sector).map(|boot| boot.filesystem)
}

/// Read the MFT bitmap (data run decoded via [`runlist::decode_runs`]) and
/// page `$MFT` one record at a time through `io`, handing each fixed-up
/// record and in-use inode to [`ntfs::scan_volume`]. Also hands it a raw
/// cluster reader (`lcn`, `count` -> bytes) over the same handle, for the
/// rare non-resident `$ATTRIBUTE_LIST`.
///
/// The bitmap and MFT data runs are supplied pre-decoded by the caller
/// (typically the open-volume bootstrap in the embedding application) —
/// this function's job is purely to drive the per-record read loop, so it
/// stays testable against [`crate::platform::mock::MockVolumeIo`] without
/// requiring a live `$MFT` layout.
pub fn scan_ntfs_volume(
    io: &dyn VolumeIo,
    mft_handle: crate::platform::RawVolumeHandle,
    bytes_per_mft_record: u32,
    bytes_per_sector: u32,
    bytes_per_cluster: u32,
    mft_byte_offset_for: impl Fn(u64) -> u64,
    bits_in_use: impl Iterator<Item = u64>,
) -> Result<(ItemIndex, UnmovableRegions, std::collections::HashMap<u64, crate::model::ItemHandle>), DefragError> {
    let inodes: Vec<u64> = bits_in_use.collect();
    let read_record = move |inode: u64| -> Option<Vec<u8>> {
        let mut buffer = vec![0u8; bytes_per_mft_record as usize];
        io.read_sectors(mft_handle, mft_byte_offset_for(inode), &mut buffer)
            .ok()?;
        Some(buffer)
    };
    let read_clusters = move |lcn: u64, count: u64| -> Option<Vec<u8>> {
        let mut buffer = vec![0u8; (count * bytes_per_cluster as u64) as usize];
        io.read_sectors(mft_handle, lcn * bytes_per_cluster as u64, &mut buffer)
            .ok()?;
        Some(buffer)
    };

    ntfs::scan_volume(inodes.into_iter(), read_record, read_clusters, bytes_per_sector)
}

/// Resolve the three unmovable regions (§2) from NTFS volume metadata: the
/// MFT's own extent, its reserved growth zone, and its mirror's first
/// record, each expressed as a half-open `[start, end)` LCN range.
pub fn mft_unmovable_regions(data: &crate::platform::NtfsVolumeData) -> UnmovableRegions {
    let mft_record_clusters = if data.clusters_per_mft_record >= 0 {
        data.clusters_per_mft_record.max(1) as u64
    } else {
        1
    };
    let mut regions = UnmovableRegions::empty();
    regions.regions[0] = crate::model::UnmovableRegion {
        start: data.mft_start_lcn,
        end: data.mft_start_lcn + mft_record_clusters,
    };
    regions.regions[1] = crate::model::UnmovableRegion {
        start: data.mft_zone_start,
        end: data.mft_zone_end,
    };
    regions.regions[2] = crate::model::UnmovableRegion {
        start: data.mft_mirror_start_lcn,
        end: data.mft_mirror_start_lcn + 1,
    };
    regions
}
