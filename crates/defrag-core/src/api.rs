/// Run-defrag entry point: the single surface an embedding application
/// calls to drive one volume pass (§6 "Caller-side").
///
/// Volume *enumeration* ("all fixed writable volumes") and opening a raw
/// handle are per-operating-system device work, explicitly out of scope
/// (§1); this module starts from an already-open [`VolumeIo`] plus a
/// [`VolumeDescriptor`] and sequences scan → classify → phases → done,
/// matching `run_jkdefrag`'s top-level shape (defrag.cpp).
use std::time::Duration;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::error::DefragError;
use crate::index::ItemIndex;
use crate::model::{FilesystemKind, UnmovableRegions, VolumeDescriptor, ZoneTable};
use crate::phases::{run_mode, Mode, PhaseContext, RunningFlag};
use crate::platform::{DefragPhase, DrawColor, RawVolumeHandle, VolumeIo};
use crate::scanner::{self, fat, ntfs};
use crate::wildcard::match_mask;

/// Literal token in `space_hogs` that suppresses the built-in space-hog
/// pattern list (§6). The built-in list's actual contents are a caller
/// concern (§1 Non-goals: "spacehog pattern defaults"); this crate only
/// implements the suppression mechanism.
pub const DISABLE_DEFAULTS: &str = "DisableDefaults";

/// Caller-supplied configuration for one [`run_defrag`] call (§6,
/// SPEC_FULL "Configuration"). Derives `serde::{Serialize, Deserialize}`
/// so a host application can load it from a config file; parsing that file
/// is the host's job, not this crate's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefragOptions {
    pub mode: Mode,
    /// 1-100; outside that range disables move throttling entirely.
    pub speed: u8,
    /// 0-100 percent of each zone the zone calculator leaves unallocated.
    pub free_space_percent: f64,
    /// Wildcard patterns (§6 "Wildcard matching"); items whose full path
    /// matches any of these are flagged `is_excluded` and skipped by every
    /// phase.
    pub excludes: Vec<CompactString>,
    /// Wildcard patterns layered onto the built-in space-hog list, or
    /// replacing it entirely if [`DISABLE_DEFAULTS`] is present.
    pub space_hogs: Vec<CompactString>,
    /// Files written to more recently than this are left alone by fixup
    /// (§4.7 "Fixup", §9 Open Question).
    #[serde(with = "duration_secs")]
    pub fixup_skip_recent: Duration,
}

impl Default for DefragOptions {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            speed: 100,
            free_space_percent: 5.0,
            excludes: Vec::new(),
            space_hogs: Vec::new(),
            fixup_skip_recent: Duration::from_secs(15 * 60),
        }
    }
}

impl DefragOptions {
    /// Load options from a host-supplied JSON config file's contents (§6,
    /// "Caller-side": parsing the config file is the host's job, producing
    /// this struct is ours).
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize options back to JSON, e.g. for a host to persist a
    /// user's settings between runs.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Final per-volume statistics reported with the last status-change
/// callback (§6).
#[derive(Debug, Clone, Copy, Default)]
pub struct DefragStats {
    pub items_scanned: u64,
    pub clusters_total: u64,
    pub clusters_moved: u64,
}

/// Progress events delivered to the display/log collaborator (§6
/// "Progress callbacks"). Sent over a `crossbeam_channel` so the worker
/// thread never blocks on a slow consumer catching up.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    StatusChange {
        volume: CompactString,
        phase: DefragPhase,
        zone: ZoneTable,
    },
    Move {
        inode: u64,
        cluster_count: u64,
        source_vcn: u64,
        dest_lcn: u64,
    },
    ItemAnalyzed {
        inode: u64,
        path: CompactString,
        clusters_so_far: u64,
    },
    Debug {
        level: tracing::Level,
        message: CompactString,
    },
    DrawCluster {
        start: u64,
        end: u64,
        color: DrawColor,
    },
}

/// Filesystem-specific bootstrap state [`run_defrag`] needs before it can
/// scan. NTFS's is nontrivial (it must decode `$MFT`'s own `$DATA` and
/// `$BITMAP` attributes before it can page through the rest of the table);
/// FAT needs nothing beyond the open volume handle.
pub enum VolumeScanInput<'a> {
    Ntfs {
        /// Handle opened on `$MFT` itself (inode 0), for paging records.
        mft_handle: RawVolumeHandle,
        /// `$MFT`'s own record (inode 0), already USA-fixed-up.
        mft_record0: &'a [u8],
    },
    Fat,
}

/// Run one volume pass: scan, classify against `options`, then sequence
/// the phase chain `options.mode` selects (§4.7). Returns once the last
/// phase completes or `running` transitions to `Stopping` — either way,
/// `running` is left at `Stopped` before returning, matching §6's
/// "Exit codes" contract.
pub fn run_defrag(
    io: &dyn VolumeIo,
    volume: &VolumeDescriptor,
    scan_input: VolumeScanInput<'_>,
    options: &DefragOptions,
    running: RunningFlag,
    now_ms: i64,
    now_filetime: u64,
    progress: Option<&crossbeam_channel::Sender<ProgressEvent>>,
) -> Result<DefragStats, DefragError> {
    let emit = |event: ProgressEvent| {
        if let Some(sender) = progress {
            let _ = sender.send(event);
        }
    };

    let (mut index, scanned_mft_excludes) = match scan_input {
        VolumeScanInput::Ntfs { mft_handle, mft_record0 } => {
            scan_ntfs(io, volume.raw_handle, mft_handle, mft_record0)?
        }
        VolumeScanInput::Fat => (scan_fat(io, volume.raw_handle)?, UnmovableRegions::empty()),
    };

    let mft_excludes = if matches!(volume.filesystem, FilesystemKind::Ntfs) {
        scanned_mft_excludes
    } else {
        UnmovableRegions::empty()
    };

    classify_items(&mut index, options);

    let items_scanned = index.len() as u64;
    let clusters_total: u64 = index.iter_in_order().map(|h| index.get(h).clusters_count).sum();

    let mut ctx = PhaseContext::new(
        io,
        volume.raw_handle,
        volume.total_clusters,
        volume.bytes_per_cluster,
        mft_excludes,
        options.free_space_percent,
        options.speed,
        now_ms,
        running,
    );
    ctx.now_filetime = now_filetime;
    ctx.fixup_skip_recent_ticks = options.fixup_skip_recent.as_secs() * 10_000_000;

    let mount_point = volume.mount_point.clone();
    let mut status = |phase: DefragPhase, zone: ZoneTable| {
        emit(ProgressEvent::StatusChange { volume: mount_point.clone(), phase, zone });
    };

    run_mode(&mut ctx, &mut index, options.mode, &mut status)?;

    Ok(DefragStats {
        items_scanned,
        clusters_total,
        clusters_moved: ctx.phase_done,
    })
}

/// Flip `running` to `Stopping` (§6 "Stop entry point"). Waiting up to a
/// timeout for `Stopped` is the caller's job — it only needs to poll
/// `running.get()`, which this crate exposes no blocking primitive for
/// since the worker thread is the only one that should ever sleep.
pub fn stop(running: &RunningFlag) {
    running.stop();
}

fn scan_ntfs(
    io: &dyn VolumeIo,
    volume_handle: RawVolumeHandle,
    mft_handle: RawVolumeHandle,
    mft_record0: &[u8],
) -> Result<(ItemIndex, UnmovableRegions), DefragError> {
    let mut sector0 = vec![0u8; 512];
    io.read_sectors(volume_handle, 0, &mut sector0).map_err(DefragError::MetadataIoFailure)?;
    let boot = ntfs::parse_boot_record(&sector0)?;

    let volume_data = io.ntfs_volume_data(volume_handle).map_err(DefragError::MetadataIoFailure)?;
    let mft_excludes = scanner::mft_unmovable_regions(&volume_data);

    let bootstrap = ntfs::parse_mft_self_bootstrap(mft_record0)?;
    let bytes_per_mft_record = boot.bytes_per_mft_record();
    let bytes_per_cluster = volume_data.bytes_per_cluster;
    let bytes_per_sector = boot.bytes_per_sector;

    let data_runs = bootstrap.data_runs.clone();
    let mft_byte_offset_for = move |inode: u64| -> u64 {
        mft_byte_offset(&data_runs, inode, bytes_per_mft_record, bytes_per_cluster)
    };

    let bits_in_use = resolve_bits_in_use(io, volume_handle, &bootstrap, bytes_per_cluster)?;

    let (index, _empty_excludes, _by_inode) = scanner::scan_ntfs_volume(
        io,
        mft_handle,
        bytes_per_mft_record,
        bytes_per_sector,
        bytes_per_cluster,
        mft_byte_offset_for,
        bits_in_use.into_iter(),
    )?;

    Ok((index, mft_excludes))
}

/// Translate an inode (MFT record index) to its absolute byte offset
/// within `$MFT`'s own `$DATA` stream, by walking the decoded runlist
/// accumulating VCN as it goes (§4.1 "MFT bootstrap").
fn mft_byte_offset(
    data_runs: &[crate::scanner::runlist::DecodedRun],
    inode: u64,
    bytes_per_mft_record: u32,
    bytes_per_cluster: u32,
) -> u64 {
    let absolute_byte = inode * bytes_per_mft_record as u64;
    let target_vcn = absolute_byte / bytes_per_cluster as u64;
    let offset_in_cluster = absolute_byte % bytes_per_cluster as u64;

    let mut vcn = 0u64;
    for run in data_runs {
        let run_start = vcn;
        vcn += run.length;
        if target_vcn < vcn {
            let lcn = run.lcn + (target_vcn - run_start);
            return lcn * bytes_per_cluster as u64 + offset_in_cluster;
        }
    }
    0
}

/// Enumerate the in-use inode numbers `$MFT`'s own `$BITMAP` attribute
/// marks, reading the bitmap's backing clusters from disk when the
/// attribute is non-resident.
fn resolve_bits_in_use(
    io: &dyn VolumeIo,
    volume_handle: RawVolumeHandle,
    bootstrap: &ntfs::MftBootstrap,
    bytes_per_cluster: u32,
) -> Result<Vec<u64>, DefragError> {
    let bytes = if let Some(resident) = &bootstrap.bitmap_resident {
        resident.clone()
    } else {
        let mut bytes = Vec::new();
        for run in &bootstrap.bitmap_runs {
            if run.is_virtual {
                bytes.extend(std::iter::repeat(0u8).take((run.length * bytes_per_cluster as u64) as usize));
                continue;
            }
            let mut buffer = vec![0u8; (run.length * bytes_per_cluster as u64) as usize];
            io.read_sectors(volume_handle, run.lcn * bytes_per_cluster as u64, &mut buffer)
                .map_err(DefragError::MetadataIoFailure)?;
            bytes.extend_from_slice(&buffer);
        }
        bytes
    };

    let mut inodes = Vec::new();
    for (byte_index, byte) in bytes.iter().enumerate() {
        if *byte == 0 {
            continue;
        }
        for bit in 0..8u64 {
            if byte & (1 << bit) != 0 {
                inodes.push(byte_index as u64 * 8 + bit);
            }
        }
    }
    Ok(inodes)
}

fn scan_fat(io: &dyn VolumeIo, volume_handle: RawVolumeHandle) -> Result<ItemIndex, DefragError> {
    let mut sector0 = vec![0u8; 512];
    io.read_sectors(volume_handle, 0, &mut sector0).map_err(DefragError::MetadataIoFailure)?;
    let boot = fat::parse_boot_record(&sector0).ok_or_else(|| DefragError::CorruptMetadata {
        inode: 0,
        detail: "boot sector is not a recognizable FAT volume".into(),
    })?;

    let fat_byte_offset = boot.reserved_sectors as u64 * boot.bytes_per_sector as u64;
    let fat_byte_len = boot.fat_size_sectors * boot.bytes_per_sector as u64;
    let mut fat_table = vec![0u8; fat_byte_len as usize];
    io.read_sectors(volume_handle, fat_byte_offset, &mut fat_table)
        .map_err(DefragError::MetadataIoFailure)?;

    let mut index = ItemIndex::new();
    let mut next_inode = 1u64;
    let root_start_cluster = if boot.filesystem == FilesystemKind::Fat32 { boot.root_cluster } else { 0 };

    fat::scan_directory_tree(io, volume_handle, &boot, &fat_table, &mut index, root_start_cluster, 0, &mut next_inode)?;

    Ok(index)
}

/// Apply `excludes`/`space_hogs` wildcard classification to every item
/// (§6 "Wildcard matching"): matched by full path, case-insensitive.
fn classify_items(index: &mut ItemIndex, options: &DefragOptions) {
    let space_hog_patterns = effective_space_hog_patterns(&options.space_hogs);

    for i in 0..index.len() {
        let handle = crate::model::ItemHandle::new(i);
        let path = index.get(handle).path.long.clone();

        let is_excluded = options.excludes.iter().any(|pattern| match_mask(&path, pattern));
        let is_spacehog = !index.get(handle).flags.is_directory
            && space_hog_patterns.iter().any(|pattern| match_mask(&path, pattern));

        let item = index.get_mut(handle);
        item.flags.is_excluded = is_excluded;
        item.flags.is_spacehog = is_spacehog;
    }
}

/// Resolve `space_hogs` into the patterns fixup/zone classification use,
/// stripping the [`DISABLE_DEFAULTS`] sentinel itself. The built-in
/// pattern list it would otherwise suppress lives outside this crate
/// (§1 Non-goals).
fn effective_space_hog_patterns(space_hogs: &[CompactString]) -> Vec<&str> {
    space_hogs.iter().map(|p| p.as_str()).filter(|p| *p != DISABLE_DEFAULTS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Item;
    use crate::platform::mock::MockVolumeIo;
    use compact_str::CompactString;

    #[test]
    fn classify_items_flags_excludes_and_space_hogs() {
        let mut index = ItemIndex::new();
        let mut regular = Item::new(CompactString::new("movie.mkv"), CompactString::new("c:\\media\\movie.mkv"), 0);
        regular.fragments.append_checked(0, 5, 10);
        regular.clusters_count = 10;
        let regular_handle = index.insert(regular);

        let mut excluded = Item::new(CompactString::new("pagefile.sys"), CompactString::new("c:\\pagefile.sys"), 0);
        excluded.fragments.append_checked(0, 50, 60);
        excluded.clusters_count = 10;
        let excluded_handle = index.insert(excluded);

        let options = DefragOptions {
            excludes: vec![CompactString::new("*\\pagefile.sys")],
            space_hogs: vec![CompactString::new("*.mkv")],
            ..DefragOptions::default()
        };

        classify_items(&mut index, &options);

        assert!(index.get(regular_handle).flags.is_spacehog);
        assert!(!index.get(regular_handle).flags.is_excluded);
        assert!(index.get(excluded_handle).flags.is_excluded);
    }

    #[test]
    fn disable_defaults_token_is_stripped_from_effective_patterns() {
        let patterns = vec![CompactString::new("DisableDefaults"), CompactString::new("*.tmp")];
        let effective = effective_space_hog_patterns(&patterns);
        assert_eq!(effective, vec!["*.tmp"]);
    }

    #[test]
    fn options_round_trip_through_json() {
        let options = DefragOptions {
            speed: 42,
            excludes: vec![CompactString::new("*\\pagefile.sys")],
            ..DefragOptions::default()
        };

        let json = options.to_json().unwrap();
        let restored = DefragOptions::from_json(&json).unwrap();

        assert_eq!(restored.speed, 42);
        assert_eq!(restored.excludes, options.excludes);
        assert_eq!(restored.fixup_skip_recent, options.fixup_skip_recent);
    }

    #[test]
    fn malformed_json_is_reported_as_an_error() {
        assert!(DefragOptions::from_json("not json").is_err());
    }

    #[test]
    fn mft_byte_offset_finds_the_right_run() {
        let runs = vec![
            crate::scanner::runlist::DecodedRun { lcn: 100, length: 4, is_virtual: false },
            crate::scanner::runlist::DecodedRun { lcn: 500, length: 4, is_virtual: false },
        ];
        // bytes_per_mft_record=1024, bytes_per_cluster=4096 -> 4 records/cluster.
        // inode 5 -> absolute_byte=5120 -> vcn=1, offset_in_cluster=1024, falls in the first run.
        let offset = mft_byte_offset(&runs, 5, 1024, 4096);
        assert_eq!(offset, 100 * 4096 + 1024);

        // inode 20 -> absolute_byte=20480 -> vcn=5, falls in the second run (run 0 covers vcn 0..4).
        let offset2 = mft_byte_offset(&runs, 20, 1024, 4096);
        assert_eq!(offset2, 500 * 4096 + 1024);
    }

    #[test]
    fn resolve_bits_in_use_reads_nonresident_bitmap_from_disk() {
        let io = MockVolumeIo::new(1000);
        // lay down bitmap bytes at lcn 10: byte 0 = 0b0000_0101 (inodes 0, 2).
        let mut bitmap_bytes = vec![0u8; 4096];
        bitmap_bytes[0] = 0b0000_0101;
        io.write_raw_sectors(10 * 4096, &bitmap_bytes);

        let bootstrap = ntfs::MftBootstrap {
            data_runs: Vec::new(),
            bitmap_runs: vec![crate::scanner::runlist::DecodedRun { lcn: 10, length: 1, is_virtual: false }],
            bitmap_resident: None,
        };

        let inodes = resolve_bits_in_use(&io, 0, &bootstrap, 4096).unwrap();
        assert_eq!(inodes, vec![0, 2]);
    }

    #[test]
    fn fat_scan_builds_an_item_index_from_a_synthetic_volume() {
        // This exercises the boot-sector + FAT-table wiring only; the full
        // directory-entry decode path is covered in `scanner::fat`'s own
        // tests, which drive `scan_directory_tree` directly against a
        // synthetic root listing.
        let io = MockVolumeIo::new(1000);
        let mut sector = vec![0u8; 512];
        sector[0] = 0xEB;
        sector[2] = 0x90;
        sector[11..13].copy_from_slice(&512u16.to_le_bytes());
        sector[13] = 1; // sectors_per_cluster
        sector[14..16].copy_from_slice(&1u16.to_le_bytes()); // reserved_sectors
        sector[16] = 1; // num_fats
        sector[17..19].copy_from_slice(&16u16.to_le_bytes()); // root_entry_count
        sector[19..21].copy_from_slice(&2000u16.to_le_bytes()); // total_sectors
        sector[22..24].copy_from_slice(&1u16.to_le_bytes()); // fat_size_sectors
        sector[510..512].copy_from_slice(&0xAA55u16.to_le_bytes());
        io.write_raw_sectors(0, &sector);

        let index = scan_fat(&io, 0).unwrap();
        assert_eq!(index.len(), 0, "empty root directory yields no items");
    }
}
