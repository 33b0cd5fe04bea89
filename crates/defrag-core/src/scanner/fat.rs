/// FAT12/16/32 volume scanner: boot-sector probe, FAT-table cluster-chain
/// walk, and directory enumeration with long-filename reassembly (§4.2).
///
/// Grounded on `ScanFAT` (scan_fat.cpp): `analyze_fat_volume` for the boot
/// sector and FAT12/16/32 classification thresholds, `make_fragment_list`
/// for the cluster-chain-to-fragment-list walk, and
/// `analyze_fat_directory` for the long-name accumulation state machine and
/// the 8.3 short-name checksum.
use crate::model::{AliasedName, FilesystemKind, FragmentList, Item, ItemHandle};
use chrono::{Local, NaiveDate, TimeZone};
use compact_str::CompactString;

/// 100ns ticks between the FILETIME epoch (1601-01-01) and the Unix epoch
/// (1970-01-01), for converting a DOS timestamp's UTC instant into the same
/// FILETIME convention NTFS timestamps already use on [`Item`].
const FILETIME_EPOCH_OFFSET_100NS: i64 = 116_444_736_000_000_000;

/// Decode a DOS date/time pair (and optional tenths-of-a-second field) into
/// a FILETIME tick count, applying the host OS's local-to-UTC conversion
/// (§4.2) — DOS directory timestamps carry no timezone of their own.
/// Returns 0 for an unrepresentable (all-zero or otherwise invalid) pair,
/// same as an absent NTFS timestamp.
fn dos_date_time_to_filetime(date: u16, time: u16, tenth_seconds: u8) -> u64 {
    let year = 1980 + ((date >> 9) & 0x7F) as i32;
    let month = ((date >> 5) & 0x0F) as u32;
    let day = (date & 0x1F) as u32;
    let hour = ((time >> 11) & 0x1F) as u32;
    let minute = ((time >> 5) & 0x3F) as u32;
    let second = (time & 0x1F) as u32 * 2 + (tenth_seconds as u32 / 100);
    let nanos = (tenth_seconds as u32 % 100) * 10_000_000;

    let Some(naive) = NaiveDate::from_ymd_opt(year, month, day).and_then(|d| d.and_hms_nano_opt(hour, minute, second, nanos))
    else {
        return 0;
    };
    let Some(local) = Local.from_local_datetime(&naive).single() else {
        return 0;
    };
    let utc = local.with_timezone(&chrono::Utc);

    let unix_100ns = utc.timestamp() * 10_000_000 + utc.timestamp_subsec_nanos() as i64 / 100;
    (unix_100ns + FILETIME_EPOCH_OFFSET_100NS).max(0) as u64
}

const ATTR_READ_ONLY: u8 = 0x01;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_LONG_NAME_MASK: u8 = 0x3F;
const ATTR_LONG_NAME: u8 = 0x0F;

#[derive(Debug, Clone, Copy)]
pub struct FatBootRecord {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub num_fats: u32,
    pub root_entry_count: u32,
    pub fat_size_sectors: u64,
    pub total_sectors: u64,
    pub root_cluster: u64,
    pub count_of_clusters: u64,
    pub filesystem: FilesystemKind,
}

impl FatBootRecord {
    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    pub fn root_dir_sectors(&self) -> u32 {
        (self.root_entry_count * 32 + self.bytes_per_sector - 1) / self.bytes_per_sector
    }

    pub fn first_data_sector(&self) -> u64 {
        self.reserved_sectors as u64
            + self.num_fats as u64 * self.fat_size_sectors
            + self.root_dir_sectors() as u64
    }
}

/// Parse a 512-byte FAT boot sector. Rejects anything that does not carry
/// the `0xAA55` tail signature or a recognizable jump-boot opcode.
pub fn parse_boot_record(sector: &[u8]) -> Option<FatBootRecord> {
    if sector.len() < 512 {
        return None;
    }
    let signature = u16::from_le_bytes([sector[510], sector[511]]);
    let jmp_ok = (sector[0] == 0xEB && sector[2] == 0x90) || sector[0] == 0xE9;
    if signature != 0xAA55 || !jmp_ok {
        return None;
    }

    let bytes_per_sector = u16::from_le_bytes([sector[11], sector[12]]) as u32;
    let sectors_per_cluster = sector[13] as u32;
    if bytes_per_sector == 0 || sectors_per_cluster == 0 {
        return None;
    }

    let reserved_sectors = u16::from_le_bytes([sector[14], sector[15]]) as u32;
    let num_fats = sector[16] as u32;
    let root_entry_count = u16::from_le_bytes([sector[17], sector[18]]) as u32;

    let total_sectors_16 = u16::from_le_bytes([sector[19], sector[20]]) as u64;
    let total_sectors_32 = u32::from_le_bytes(sector[32..36].try_into().unwrap()) as u64;
    let total_sectors = if total_sectors_16 != 0 {
        total_sectors_16
    } else {
        total_sectors_32
    };

    let fat_size_16 = u16::from_le_bytes([sector[22], sector[23]]) as u64;
    let fat_size_32 = u32::from_le_bytes(sector[36..40].try_into().unwrap()) as u64;
    let fat_size_sectors = if fat_size_16 != 0 { fat_size_16 } else { fat_size_32 };

    let root_cluster = if fat_size_16 == 0 {
        u32::from_le_bytes(sector[44..48].try_into().unwrap()) as u64
    } else {
        0
    };

    let root_dir_sectors = (root_entry_count * 32 + bytes_per_sector - 1) / bytes_per_sector;
    let first_data_sector =
        reserved_sectors as u64 + num_fats as u64 * fat_size_sectors + root_dir_sectors as u64;
    let data_sectors = total_sectors.saturating_sub(first_data_sector);
    let count_of_clusters = data_sectors / sectors_per_cluster as u64;

    // §4.2: classify strictly by cluster count, the same thresholds DOS and
    // every later FAT implementation settled on.
    let filesystem = if count_of_clusters < 4085 {
        FilesystemKind::Fat12
    } else if count_of_clusters < 65525 {
        FilesystemKind::Fat16
    } else {
        FilesystemKind::Fat32
    };

    Some(FatBootRecord {
        bytes_per_sector,
        sectors_per_cluster,
        reserved_sectors,
        num_fats,
        root_entry_count,
        fat_size_sectors,
        total_sectors,
        root_cluster,
        count_of_clusters,
        filesystem,
    })
}

/// End-of-clusterchain thresholds per FAT width (§4.2).
fn is_eoc(filesystem: FilesystemKind, cluster: u64) -> bool {
    match filesystem {
        FilesystemKind::Fat12 => cluster >= 0xFF8,
        FilesystemKind::Fat16 => cluster >= 0xFFF8,
        FilesystemKind::Fat32 => cluster >= 0xFFF_FFF8,
        FilesystemKind::Ntfs => unreachable!("NTFS has no FAT cluster chain"),
    }
}

/// Read the next cluster number in a chain from a raw FAT table.
fn next_cluster(filesystem: FilesystemKind, fat: &[u8], cluster: u64) -> u64 {
    match filesystem {
        FilesystemKind::Fat12 => {
            let byte_index = (cluster + cluster / 2) as usize;
            if byte_index + 1 >= fat.len() {
                return 0xFFF;
            }
            let word = u16::from_le_bytes([fat[byte_index], fat[byte_index + 1]]);
            if cluster & 1 == 1 {
                (word >> 4) as u64
            } else {
                (word & 0xFFF) as u64
            }
        }
        FilesystemKind::Fat16 => {
            let i = cluster as usize * 2;
            if i + 1 >= fat.len() {
                return 0xFFFF;
            }
            u16::from_le_bytes([fat[i], fat[i + 1]]) as u64
        }
        FilesystemKind::Fat32 => {
            let i = cluster as usize * 4;
            if i + 3 >= fat.len() {
                return 0x0FFF_FFFF;
            }
            u32::from_le_bytes([fat[i], fat[i + 1], fat[i + 2], fat[i + 3]]) as u64 & 0x0FFF_FFFF
        }
        FilesystemKind::Ntfs => unreachable!("NTFS has no FAT cluster chain"),
    }
}

/// Walk a FAT cluster chain starting at `first_cluster`, building a
/// [`FragmentList`] that coalesces consecutive clusters into single runs
/// (mirrors `make_fragment_list`'s "new fragment only when the chain
/// skips" logic). The walk is capped at `count_of_clusters + 1` iterations,
/// matching the original's infinite-loop guard against a corrupt FAT.
pub fn make_fragment_list(
    filesystem: FilesystemKind,
    fat: &[u8],
    count_of_clusters: u64,
    mut cluster: u64,
) -> FragmentList {
    let mut stream = FragmentList::new();
    if cluster == 0 {
        return stream;
    }

    let mut first_cluster = cluster;
    let mut last_cluster = 0u64;
    let mut run_start_vcn = 0u64;
    let max_iterate = count_of_clusters + 1;

    for _ in 0..max_iterate {
        if is_eoc(filesystem, cluster) {
            break;
        }
        if cluster < 2 || cluster > count_of_clusters + 1 {
            break;
        }

        if cluster != last_cluster + 1 && last_cluster != 0 {
            let lcn = first_cluster - 2;
            let next_vcn = run_start_vcn + (last_cluster - first_cluster + 1);
            stream.append_checked(run_start_vcn, lcn, next_vcn);
            run_start_vcn = next_vcn;
            first_cluster = cluster;
        }

        last_cluster = cluster;
        cluster = next_cluster(filesystem, fat, cluster);
    }

    if last_cluster != 0 {
        let lcn = first_cluster - 2;
        let next_vcn = run_start_vcn + (last_cluster - first_cluster + 1);
        stream.append_checked(run_start_vcn, lcn, next_vcn);
    }

    stream
}

/// One parsed short (8.3) directory entry, prior to long-name attachment.
struct ShortEntry {
    short_name: CompactString,
    attr: u8,
    first_cluster: u64,
    file_size: u32,
    is_directory: bool,
    creation_time: u64,
    last_access_time: u64,
    last_write_time: u64,
}

/// `ROR8`-style rotating checksum of the raw 11-byte 8.3 name, used to
/// validate that a run of LFN components belongs to the short entry that
/// follows them.
pub fn short_name_checksum(raw_name: &[u8; 11]) -> u8 {
    let mut sum: u8 = 0;
    for &byte in raw_name {
        sum = (if sum & 1 != 0 { 0x80 } else { 0 })
            .wrapping_add(sum >> 1)
            .wrapping_add(byte);
    }
    sum
}

fn parse_short_entry(entry: &[u8]) -> ShortEntry {
    let raw_name: [u8; 11] = entry[0..11].try_into().unwrap();
    let attr = entry[11];
    let first_cluster_hi = u16::from_le_bytes([entry[20], entry[21]]) as u64;
    let first_cluster_lo = u16::from_le_bytes([entry[26], entry[27]]) as u64;
    let first_cluster = (first_cluster_hi << 16) | first_cluster_lo;
    let file_size = u32::from_le_bytes(entry[28..32].try_into().unwrap());

    let creation_tenth = entry[13];
    let creation_time_raw = u16::from_le_bytes([entry[14], entry[15]]);
    let creation_date_raw = u16::from_le_bytes([entry[16], entry[17]]);
    let last_access_date_raw = u16::from_le_bytes([entry[18], entry[19]]);
    let write_time_raw = u16::from_le_bytes([entry[22], entry[23]]);
    let write_date_raw = u16::from_le_bytes([entry[24], entry[25]]);

    let creation_time = dos_date_time_to_filetime(creation_date_raw, creation_time_raw, creation_tenth);
    let last_access_time = dos_date_time_to_filetime(last_access_date_raw, 0, 0);
    let last_write_time = dos_date_time_to_filetime(write_date_raw, write_time_raw, 0);

    let mut base_end = 8;
    while base_end > 0 && raw_name[base_end - 1] == b' ' {
        base_end -= 1;
    }
    let mut ext_end = 3;
    while ext_end > 0 && raw_name[8 + ext_end - 1] == b' ' {
        ext_end -= 1;
    }

    let mut name_bytes = raw_name;
    if name_bytes[0] == 0x05 {
        name_bytes[0] = 0xE5;
    }

    let mut short_name = String::new();
    short_name.push_str(&String::from_utf8_lossy(&name_bytes[0..base_end]));
    if ext_end > 0 {
        short_name.push('.');
        short_name.push_str(&String::from_utf8_lossy(&name_bytes[8..8 + ext_end]));
    }

    ShortEntry {
        short_name: CompactString::from(short_name),
        attr,
        first_cluster,
        file_size,
        is_directory: attr & ATTR_DIRECTORY != 0,
        creation_time,
        last_access_time,
        last_write_time,
    }
}

/// One decoded long-filename (LFN) directory entry.
struct LongNamePart {
    ordinal: u8,
    is_last: bool,
    checksum: u8,
    units: [u16; 13],
}

fn parse_long_name_entry(entry: &[u8]) -> LongNamePart {
    let ordinal_byte = entry[0];
    let mut units = [0u16; 13];
    let mut idx = 0;
    for chunk in entry[1..11].chunks_exact(2) {
        units[idx] = u16::from_le_bytes([chunk[0], chunk[1]]);
        idx += 1;
    }
    for chunk in entry[14..26].chunks_exact(2) {
        units[idx] = u16::from_le_bytes([chunk[0], chunk[1]]);
        idx += 1;
    }
    for chunk in entry[28..32].chunks_exact(2) {
        units[idx] = u16::from_le_bytes([chunk[0], chunk[1]]);
        idx += 1;
    }

    LongNamePart {
        ordinal: ordinal_byte & ATTR_LONG_NAME_MASK,
        is_last: ordinal_byte & 0x40 != 0,
        checksum: entry[13],
        units,
    }
}

/// One fully decoded directory entry ready to become an [`Item`].
pub struct ScannedEntry {
    pub long_name: CompactString,
    pub short_name: CompactString,
    pub attr: u8,
    pub first_cluster: u64,
    pub file_size: u32,
    pub is_directory: bool,
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_write_time: u64,
}

/// Parse one FAT directory's raw 32-byte-entry buffer into a sequence of
/// items, accumulating LFN parts and validating them against the 8.3
/// checksum of the short entry that terminates each run (§4.2).
///
/// Mirrors `analyze_fat_directory`'s state machine: a run of LFN entries
/// (ordinal descending from a `0x40`-flagged "last" part down to 1) is
/// discarded — not attached — if the ordinal sequence breaks, the checksum
/// changes mid-run, or the short entry's checksum does not match.
pub fn parse_directory_entries(buffer: &[u8]) -> Vec<ScannedEntry> {
    let mut out = Vec::new();
    let mut pending: Vec<LongNamePart> = Vec::new();
    let mut expected_ordinal = 0u8;
    let mut expected_checksum = 0u8;

    let mut offset = 0usize;
    while offset + 32 <= buffer.len() {
        let entry = &buffer[offset..offset + 32];
        offset += 32;

        if entry[0] == 0xE5 {
            pending.clear();
            expected_ordinal = 0;
            continue;
        }
        if entry[0] == 0x00 {
            break;
        }

        let attr = entry[11];
        if attr & ATTR_LONG_NAME_MASK == ATTR_LONG_NAME {
            let part = parse_long_name_entry(entry);
            if part.ordinal == 0 {
                pending.clear();
                expected_ordinal = 0;
                continue;
            }
            if part.is_last {
                pending.clear();
                expected_ordinal = part.ordinal;
                expected_checksum = part.checksum;
                pending.push(part);
            } else if part.ordinal + 1 == expected_ordinal && part.checksum == expected_checksum {
                expected_ordinal = part.ordinal;
                pending.push(part);
            } else {
                pending.clear();
                expected_ordinal = 0;
            }
            continue;
        }

        let short = parse_short_entry(entry);

        let mut long_name = None;
        if expected_ordinal == 1 {
            let raw_name: [u8; 11] = entry[0..11].try_into().unwrap();
            if short_name_checksum(&raw_name) == expected_checksum {
                let mut units: Vec<u16> = Vec::new();
                // LFN parts were pushed highest-ordinal-first; reverse to
                // read the name front-to-back.
                for part in pending.iter().rev() {
                    for &u in &part.units {
                        if u == 0 || u == 0xFFFF {
                            break;
                        }
                        units.push(u);
                    }
                }
                long_name = Some(CompactString::from(String::from_utf16_lossy(&units)));
            }
        }
        pending.clear();
        expected_ordinal = 0;

        if short.attr & (ATTR_DIRECTORY | ATTR_VOLUME_ID) == ATTR_VOLUME_ID {
            continue; // volume label, not a file
        }
        if short.attr & ATTR_VOLUME_ID != 0 && short.attr & ATTR_DIRECTORY != 0 {
            continue; // malformed entry
        }
        if short.short_name == "." || short.short_name == ".." {
            continue;
        }

        out.push(ScannedEntry {
            long_name: long_name.unwrap_or_else(|| short.short_name.clone()),
            short_name: short.short_name,
            attr: short.attr,
            first_cluster: short.first_cluster,
            file_size: short.file_size,
            is_directory: short.is_directory,
            creation_time: short.creation_time,
            last_access_time: short.last_access_time,
            last_write_time: short.last_write_time,
        });
    }

    out
}

/// Build an [`Item`] from one decoded directory entry plus its walked
/// fragment list. FAT has no native inode numbering, so `synthetic_inode`
/// (a scanner-assigned counter) stands in for one, keeping the item
/// addressable the same way an NTFS MFT reference number would.
pub fn build_item(
    entry: &ScannedEntry,
    fragments: FragmentList,
    parent_inode: u64,
    synthetic_inode: u64,
) -> Item {
    let mut item = Item::new(entry.long_name.clone(), entry.long_name.clone(), parent_inode);
    item.inode = synthetic_inode;
    item.name = AliasedName::with_short(entry.long_name.clone(), entry.short_name.clone());
    item.size_bytes = entry.file_size as u64;
    item.creation_time = entry.creation_time;
    item.last_access_time = entry.last_access_time;
    item.last_write_time = entry.last_write_time;
    item.flags.is_directory = entry.is_directory;
    item.flags.is_unmovable = entry.attr & ATTR_READ_ONLY != 0 && entry.is_directory;
    item.clusters_count = fragments.real_clusters();
    item.fragments = fragments;
    item
}

pub struct FatItem {
    pub handle: ItemHandle,
    pub first_cluster: u64,
    pub is_directory: bool,
}

/// Read one directory's full raw byte content, whether it's a cluster
/// chain (any subdirectory, or the FAT32 root) or the fixed-size root
/// region that FAT12/16 reserve right after the FAT tables.
pub fn read_directory_bytes(
    io: &dyn crate::platform::VolumeIo,
    handle: crate::platform::RawVolumeHandle,
    boot: &FatBootRecord,
    fat: &[u8],
    start_cluster: u64,
) -> Result<Vec<u8>, crate::error::DefragError> {
    let bytes_per_cluster = boot.bytes_per_cluster() as u64;

    if start_cluster == 0 && boot.filesystem != FilesystemKind::Fat32 {
        // FAT12/16 fixed root directory region, just after the FAT tables.
        let root_start_sector =
            boot.reserved_sectors as u64 + boot.num_fats as u64 * boot.fat_size_sectors;
        let byte_offset = root_start_sector * boot.bytes_per_sector as u64;
        let length = boot.root_dir_sectors() as u64 * boot.bytes_per_sector as u64;
        let mut buffer = vec![0u8; length as usize];
        io.read_sectors(handle, byte_offset, &mut buffer)
            .map_err(crate::error::DefragError::MetadataIoFailure)?;
        return Ok(buffer);
    }

    let mut out = Vec::new();
    let mut cluster = start_cluster;
    let max_iterate = boot.count_of_clusters + 1;
    for _ in 0..max_iterate {
        if is_eoc(boot.filesystem, cluster) || cluster < 2 || cluster > boot.count_of_clusters + 1 {
            break;
        }
        let first_data_sector = boot.first_data_sector();
        let cluster_sector = first_data_sector + (cluster - 2) * boot.sectors_per_cluster as u64;
        let byte_offset = cluster_sector * boot.bytes_per_sector as u64;
        let mut buffer = vec![0u8; bytes_per_cluster as usize];
        io.read_sectors(handle, byte_offset, &mut buffer)
            .map_err(crate::error::DefragError::MetadataIoFailure)?;
        out.extend_from_slice(&buffer);
        cluster = next_cluster(boot.filesystem, fat, cluster);
    }
    Ok(out)
}

/// Recursion depth cap for subdirectory descent, guarding against a
/// corrupted disk whose directory clusters form a cycle back to an
/// ancestor (the same defensive posture as the NTFS attribute-list cap).
const MAX_DIRECTORY_DEPTH: u32 = 1000;

/// Recursively scan a directory and its subdirectories into `index`,
/// assigning each item a synthetic inode from `next_inode` (mirrors
/// `analyze_fat_directory`'s recursive call on every subdirectory it
/// finds).
pub fn scan_directory_tree(
    io: &dyn crate::platform::VolumeIo,
    handle: crate::platform::RawVolumeHandle,
    boot: &FatBootRecord,
    fat: &[u8],
    index: &mut crate::index::ItemIndex,
    start_cluster: u64,
    parent_inode: u64,
    next_inode: &mut u64,
) -> Result<(), crate::error::DefragError> {
    scan_directory_tree_at_depth(io, handle, boot, fat, index, start_cluster, parent_inode, next_inode, 0)
}

#[allow(clippy::too_many_arguments)]
fn scan_directory_tree_at_depth(
    io: &dyn crate::platform::VolumeIo,
    handle: crate::platform::RawVolumeHandle,
    boot: &FatBootRecord,
    fat: &[u8],
    index: &mut crate::index::ItemIndex,
    start_cluster: u64,
    parent_inode: u64,
    next_inode: &mut u64,
    depth: u32,
) -> Result<(), crate::error::DefragError> {
    if depth > MAX_DIRECTORY_DEPTH {
        return Err(crate::error::DefragError::CorruptMetadata {
            inode: parent_inode,
            detail: "directory nesting exceeded maximum depth".into(),
        });
    }

    let buffer = read_directory_bytes(io, handle, boot, fat, start_cluster)?;
    let entries = parse_directory_entries(&buffer);

    for entry in entries {
        let this_inode = *next_inode;
        *next_inode += 1;

        let fragments = make_fragment_list(boot.filesystem, fat, boot.count_of_clusters, entry.first_cluster);
        let item = build_item(&entry, fragments, parent_inode, this_inode);
        let is_directory = item.flags.is_directory;
        index.insert(item);

        if is_directory && entry.first_cluster != 0 {
            scan_directory_tree_at_depth(
                io,
                handle,
                boot,
                fat,
                index,
                entry.first_cluster,
                this_inode,
                next_inode,
                depth + 1,
            )?;
        }
    }

    Ok(())
}
