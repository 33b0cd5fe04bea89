/// In-memory stand-in for a real volume, used by every pure-logic test in
/// this crate. Modeled the same way the teacher's `tests/e2e_scanner.rs`
/// drives `ScanHandle` against a real (but temp) directory tree: build a
/// small synthetic world, then exercise the algorithm against it instead of
/// a live filesystem.
use super::{BitmapWindow, IoError, NtfsVolumeData, RawExtent, RawVolumeHandle, VolumeIo};
use crate::model::VIRTUAL_FRAGMENT;
use std::cell::RefCell;
use std::collections::HashMap;

/// One synthetic file: its extents and whether a move should be rejected
/// (used to exercise move-engine fallback/failure-classification paths).
#[derive(Debug, Clone, Default)]
pub struct MockFile {
    pub extents: Vec<RawExtent>,
    pub reject_moves: bool,
}

/// A synthetic volume: a cluster bitmap plus a table of open files keyed by
/// the handle returned from [`MockVolumeIo::open_item`].
pub struct MockVolumeIo {
    inner: RefCell<MockState>,
}

struct MockState {
    /// One bit per cluster, `true` = allocated.
    bitmap: Vec<bool>,
    files: HashMap<u64, MockFile>,
    next_handle: u64,
    moves: Vec<(u64, u64, u64, u64)>,
    /// Sparse raw-byte backing for `read_sectors`/`write_raw_sectors` —
    /// bytes outside any written range read back as zero, the same as an
    /// unformatted disk.
    raw: Vec<u8>,
}

impl MockVolumeIo {
    pub fn new(total_clusters: u64) -> Self {
        Self {
            inner: RefCell::new(MockState {
                bitmap: vec![false; total_clusters as usize],
                files: HashMap::new(),
                next_handle: 1,
                moves: Vec::new(),
                raw: Vec::new(),
            }),
        }
    }

    /// Seed raw sector/attribute bytes at `byte_offset`, growing the
    /// backing store as needed. Used by tests that exercise boot-sector
    /// parsing or bitmap-attribute decode against [`VolumeIo::read_sectors`]
    /// without a real volume.
    pub fn write_raw_sectors(&self, byte_offset: u64, data: &[u8]) {
        let mut state = self.inner.borrow_mut();
        let end = byte_offset as usize + data.len();
        if state.raw.len() < end {
            state.raw.resize(end, 0);
        }
        state.raw[byte_offset as usize..end].copy_from_slice(data);
    }

    /// Mark `[start, end)` as allocated, matching an item's real fragments.
    pub fn allocate(&self, start: u64, end: u64) {
        let mut state = self.inner.borrow_mut();
        for lcn in start..end {
            state.bitmap[lcn as usize] = true;
        }
    }

    pub fn free(&self, start: u64, end: u64) {
        let mut state = self.inner.borrow_mut();
        for lcn in start..end {
            state.bitmap[lcn as usize] = false;
        }
    }

    /// Register a file at a fixed handle so tests can address it directly
    /// without going through `open_item`'s inode indirection.
    pub fn register_file(&self, handle: RawVolumeHandle, file: MockFile) {
        for extent in &file.extents {
            // Caller is responsible for allocating the matching bitmap
            // range; mock doesn't infer it from next_vcn deltas since it
            // doesn't track starting_vcn here.
            let _ = extent;
        }
        self.inner.borrow_mut().files.insert(handle, file);
    }

    pub fn moves_log(&self) -> Vec<(u64, u64, u64, u64)> {
        self.inner.borrow().moves.clone()
    }

    pub fn total_clusters(&self) -> u64 {
        self.inner.borrow().bitmap.len() as u64
    }
}

impl VolumeIo for MockVolumeIo {
    fn read_bitmap_window<'buf>(
        &self,
        _handle: RawVolumeHandle,
        starting_lcn: u64,
        buffer: &'buf mut [u8],
    ) -> Result<BitmapWindow<'buf>, IoError> {
        let state = self.inner.borrow();
        buffer.fill(0);
        let max_bits = (buffer.len() as u64) * 8;
        let mut written = 0u64;
        for (i, lcn) in (starting_lcn..state.bitmap.len() as u64).enumerate() {
            if i as u64 >= max_bits {
                break;
            }
            if state.bitmap[lcn as usize] {
                buffer[i / 8] |= 1 << (i % 8);
            }
            written += 1;
        }
        Ok(BitmapWindow {
            starting_lcn,
            bitmap_length: written,
            bits: buffer,
        })
    }

    fn read_extents(
        &self,
        file_handle: RawVolumeHandle,
        starting_vcn: u64,
    ) -> Result<Vec<RawExtent>, IoError> {
        let state = self.inner.borrow();
        let file = state
            .files
            .get(&file_handle)
            .ok_or(IoError::Device("unknown mock file handle".into()))?;

        let mut vcn = 0u64;
        let mut out = Vec::new();
        for extent in &file.extents {
            if extent.next_vcn > starting_vcn {
                out.push(*extent);
            }
            vcn = extent.next_vcn;
        }
        let _ = vcn;
        if out.is_empty() {
            return Err(IoError::NoMoreData);
        }
        Ok(out)
    }

    fn move_file(
        &self,
        file_handle: RawVolumeHandle,
        source_vcn: u64,
        dest_lcn: u64,
        cluster_count: u64,
    ) -> Result<(), IoError> {
        let mut state = self.inner.borrow_mut();
        let reject = state
            .files
            .get(&file_handle)
            .map(|f| f.reject_moves)
            .unwrap_or(false);
        if reject {
            return Err(IoError::Device("mock move rejected".into()));
        }

        for lcn in dest_lcn..dest_lcn + cluster_count {
            if (lcn as usize) < state.bitmap.len() && state.bitmap[lcn as usize] {
                return Err(IoError::Device("destination already allocated".into()));
            }
        }

        state.moves.push((file_handle, source_vcn, dest_lcn, cluster_count));

        if let Some(file) = state.files.get_mut(&file_handle) {
            let vacated = source_lcn_ranges(&file.extents, source_vcn, cluster_count);
            apply_move(&mut file.extents, source_vcn, dest_lcn, cluster_count);
            for (start, len) in vacated {
                for lcn in start..start + len {
                    if (lcn as usize) < state.bitmap.len() {
                        state.bitmap[lcn as usize] = false;
                    }
                }
            }
        }
        for lcn in dest_lcn..dest_lcn + cluster_count {
            if (lcn as usize) < state.bitmap.len() {
                state.bitmap[lcn as usize] = true;
            }
        }
        Ok(())
    }

    fn ntfs_volume_data(&self, _handle: RawVolumeHandle) -> Result<NtfsVolumeData, IoError> {
        Ok(NtfsVolumeData {
            bytes_per_cluster: 4096,
            mft_start_lcn: 0,
            mft_zone_start: 0,
            mft_zone_end: 0,
            mft_mirror_start_lcn: 0,
            mft_valid_data_length: 0,
            clusters_per_mft_record: 1,
        })
    }

    fn read_sectors(
        &self,
        _handle: RawVolumeHandle,
        byte_offset: u64,
        buffer: &mut [u8],
    ) -> Result<(), IoError> {
        buffer.fill(0);
        let state = self.inner.borrow();
        let start = byte_offset as usize;
        if start < state.raw.len() {
            let end = (start + buffer.len()).min(state.raw.len());
            buffer[..end - start].copy_from_slice(&state.raw[start..end]);
        }
        Ok(())
    }

    fn open_item(&self, _volume: RawVolumeHandle, inode: u64) -> Result<RawVolumeHandle, IoError> {
        let mut state = self.inner.borrow_mut();
        if state.files.contains_key(&inode) {
            return Ok(inode);
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        Ok(handle)
    }

    fn close_item(&self, _file_handle: RawVolumeHandle) {}
}

/// Replace the `[source_vcn, source_vcn+count)` slice of a file's extent
/// list with one contiguous run at `dest_lcn`, splitting any overlapping
/// run into its kept prefix/suffix (with the suffix's LCN re-based past
/// the relocated portion). Models what a real volume-move primitive does
/// to a file's extent map — including the "OS joins discontinuous source
/// fragments into the target run" behavior a `Whole` move relies on.
fn apply_move(extents: &mut Vec<RawExtent>, source_vcn: u64, dest_lcn: u64, count: u64) {
    let src_end = source_vcn + count;
    let mut vcn = 0u64;
    let mut new_runs: Vec<(u64, u64, u64)> = Vec::new();

    for extent in extents.iter() {
        let (start, end, lcn) = (vcn, extent.next_vcn, extent.lcn);
        vcn = end;

        if end <= source_vcn || start >= src_end {
            new_runs.push((start, end, lcn));
            continue;
        }
        if start < source_vcn {
            new_runs.push((start, source_vcn, lcn));
        }
        if end > src_end {
            let suffix_lcn = if lcn == VIRTUAL_FRAGMENT { VIRTUAL_FRAGMENT } else { lcn + (src_end - start) };
            new_runs.push((src_end, end, suffix_lcn));
        }
    }
    new_runs.push((source_vcn, src_end, dest_lcn));
    new_runs.sort_by_key(|r| r.0);

    extents.clear();
    extents.extend(new_runs.into_iter().map(|(_, end, lcn)| RawExtent { next_vcn: end, lcn }));
}

/// Real (non-virtual) LCN ranges the `[source_vcn, source_vcn+count)` span
/// occupied *before* a move, so the caller can free them on the bitmap —
/// mirrors the real device: the clusters a file vacates become free space,
/// not just the ones it fills at the destination.
fn source_lcn_ranges(extents: &[RawExtent], source_vcn: u64, count: u64) -> Vec<(u64, u64)> {
    let src_end = source_vcn + count;
    let mut vcn = 0u64;
    let mut out = Vec::new();

    for extent in extents {
        let (start, end, lcn) = (vcn, extent.next_vcn, extent.lcn);
        vcn = end;
        if extent.is_virtual() || end <= source_vcn || start >= src_end {
            continue;
        }
        let overlap_start = start.max(source_vcn);
        let overlap_end = end.min(src_end);
        out.push((lcn + (overlap_start - start), overlap_end - overlap_start));
    }
    out
}

/// Convenience constructor for a single-fragment extent list.
pub fn single_extent(lcn: u64, clusters: u64) -> Vec<RawExtent> {
    vec![RawExtent {
        next_vcn: clusters,
        lcn,
    }]
}

/// Convenience constructor marking a stream as entirely virtual (sparse).
pub fn virtual_extent(clusters: u64) -> Vec<RawExtent> {
    vec![RawExtent {
        next_vcn: clusters,
        lcn: VIRTUAL_FRAGMENT,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_sectors_returns_seeded_raw_bytes_and_zero_outside_them() {
        let vol = MockVolumeIo::new(64);
        vol.write_raw_sectors(512, &[1, 2, 3, 4]);

        let mut buf = vec![0xFFu8; 4];
        vol.read_sectors(0, 512, &mut buf).unwrap();
        assert_eq!(buf, vec![1, 2, 3, 4]);

        let mut unseeded = vec![0xFFu8; 4];
        vol.read_sectors(0, 0, &mut unseeded).unwrap();
        assert_eq!(unseeded, vec![0, 0, 0, 0]);
    }

    #[test]
    fn bitmap_window_reflects_allocations() {
        let vol = MockVolumeIo::new(128);
        vol.allocate(10, 20);
        let mut buf = vec![0u8; 16];
        let window = vol.read_bitmap_window(0, 0, &mut buf).unwrap();
        for lcn in 10u64..20 {
            let byte = window.bits[(lcn / 8) as usize];
            assert_ne!(byte & (1 << (lcn % 8)), 0, "lcn {lcn} should be allocated");
        }
        assert_eq!(window.bits[0], 0, "lcn 0..8 should be free");
    }

    #[test]
    fn move_file_rejects_occupied_destination() {
        let vol = MockVolumeIo::new(64);
        vol.allocate(0, 10);
        vol.register_file(
            1,
            MockFile {
                extents: single_extent(0, 10),
                reject_moves: false,
            },
        );
        let err = vol.move_file(1, 0, 5, 10).unwrap_err();
        assert!(matches!(err, IoError::Device(_)));
    }

    #[test]
    fn move_file_relocates_and_logs() {
        let vol = MockVolumeIo::new(64);
        vol.allocate(0, 10);
        vol.register_file(
            1,
            MockFile {
                extents: single_extent(0, 10),
                reject_moves: false,
            },
        );
        vol.move_file(1, 0, 40, 10).unwrap();
        assert_eq!(vol.moves_log(), vec![(1, 0, 40, 10)]);
        let mut buf = vec![0u8; 8];
        let window = vol.read_bitmap_window(0, 40, &mut buf).unwrap();
        assert_ne!(window.bits[0] & 1, 0);
    }

    #[test]
    fn move_file_frees_the_vacated_source_range() {
        let vol = MockVolumeIo::new(64);
        vol.allocate(0, 10);
        vol.register_file(1, MockFile { extents: single_extent(0, 10), reject_moves: false });
        vol.move_file(1, 0, 40, 10).unwrap();

        let mut buf = vec![0u8; 8];
        let window = vol.read_bitmap_window(0, 0, &mut buf).unwrap();
        for lcn in 0u64..10 {
            let byte = window.bits[(lcn / 8) as usize];
            assert_eq!(byte & (1 << (lcn % 8)), 0, "lcn {lcn} should have been freed by the move");
        }
    }

    #[test]
    fn apply_move_joins_a_two_fragment_file_into_one_contiguous_run() {
        let mut extents = vec![
            RawExtent { next_vcn: 5, lcn: 10 },
            RawExtent { next_vcn: 10, lcn: 80 },
        ];
        apply_move(&mut extents, 0, 20, 10);
        assert_eq!(extents, vec![RawExtent { next_vcn: 10, lcn: 20 }]);
    }

    #[test]
    fn apply_move_splits_a_run_it_only_partially_covers() {
        let mut extents = vec![RawExtent { next_vcn: 20, lcn: 100 }];
        // Relocate just the middle third [5..15) of a single 20-cluster run.
        apply_move(&mut extents, 5, 500, 10);
        assert_eq!(
            extents,
            vec![
                RawExtent { next_vcn: 5, lcn: 100 },
                RawExtent { next_vcn: 15, lcn: 500 },
                RawExtent { next_vcn: 20, lcn: 115 },
            ]
        );
    }

    #[test]
    fn read_extents_stops_at_no_more_data() {
        let vol = MockVolumeIo::new(64);
        vol.register_file(
            1,
            MockFile {
                extents: single_extent(0, 5),
                reject_moves: false,
            },
        );
        let extents = vol.read_extents(1, 0).unwrap();
        assert_eq!(extents.len(), 1);
        let err = vol.read_extents(1, 5).unwrap_err();
        assert!(matches!(err, IoError::NoMoreData));
    }
}
