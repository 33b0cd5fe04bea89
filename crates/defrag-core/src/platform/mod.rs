/// Platform collaborator contracts — the external, OS-owned primitives this
/// crate consumes (§6 "Filesystem-side (consumed)").
///
/// Per-OS device I/O wrappers are explicitly out of scope for this crate;
/// only the *contract* ([`VolumeIo`]) and a real Windows implementation of
/// it live here. Tests exercise the engine against [`mock::MockVolumeIo`]
/// instead of a real volume.
pub mod mock;
pub mod windows_io;

use crate::model::VIRTUAL_FRAGMENT;

/// Opaque handle to an open volume. On Windows this wraps a `HANDLE`;
/// elsewhere (tests) it indexes into a mock volume table.
pub type RawVolumeHandle = u64;

/// One `(next_vcn, lcn)` pair as returned by extent retrieval (§6). `lcn ==
/// VIRTUAL_FRAGMENT` marks a virtual (sparse/compressed-hole) extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawExtent {
    pub next_vcn: u64,
    pub lcn: u64,
}

impl RawExtent {
    #[inline]
    pub fn is_virtual(&self) -> bool {
        self.lcn == VIRTUAL_FRAGMENT
    }
}

/// One window of the volume bitmap, as returned by a bitmap query (§6).
pub struct BitmapWindow<'a> {
    pub starting_lcn: u64,
    /// Total bits the window logically covers (may exceed `bits.len() * 8`
    /// only at the tail of the volume).
    pub bitmap_length: u64,
    /// `1` = in-use, `0` = free, packed little-endian-bit-first like the
    /// Windows `FSCTL_GET_VOLUME_BITMAP` output.
    pub bits: &'a [u8],
}

/// NTFS volume metadata (§6 "NTFS volume data").
#[derive(Debug, Clone, Copy, Default)]
pub struct NtfsVolumeData {
    pub bytes_per_cluster: u32,
    pub mft_start_lcn: u64,
    pub mft_zone_start: u64,
    pub mft_zone_end: u64,
    pub mft_mirror_start_lcn: u64,
    pub mft_valid_data_length: u64,
    pub clusters_per_mft_record: i8,
}

/// Errors a [`VolumeIo`] implementation can report. These map onto §7's
/// "I/O failure on metadata read" and "Move failure" categories; the
/// caller decides whether a given failure is fatal-for-the-volume or
/// recoverable-per-item.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("device I/O failed: {0}")]
    Device(String),
    #[error("requested range is outside the volume")]
    OutOfRange,
    #[error("no more data")]
    NoMoreData,
}

/// The OS collaborator contract described in spec §6. A single
/// `VolumeDescriptor`'s `raw_handle` is passed to every call; it is the
/// caller's job to keep it alive for the volume pass.
pub trait VolumeIo {
    /// Query one window of the volume bitmap starting at (or at/after)
    /// `starting_lcn`. Never cached by the caller — re-queried on every
    /// gap search (§4.4).
    fn read_bitmap_window<'buf>(
        &self,
        handle: RawVolumeHandle,
        starting_lcn: u64,
        buffer: &'buf mut [u8],
    ) -> Result<BitmapWindow<'buf>, IoError>;

    /// Retrieve the extents of an open file/stream starting at `starting_vcn`.
    /// Called in a loop until it reports `IoError::NoMoreData`.
    fn read_extents(
        &self,
        file_handle: RawVolumeHandle,
        starting_vcn: u64,
    ) -> Result<Vec<RawExtent>, IoError>;

    /// Issue one volume-move call. Partial success is reported as success —
    /// the move engine detects residual fragmentation by re-reading extents.
    fn move_file(
        &self,
        file_handle: RawVolumeHandle,
        source_vcn: u64,
        dest_lcn: u64,
        cluster_count: u64,
    ) -> Result<(), IoError>;

    fn ntfs_volume_data(&self, handle: RawVolumeHandle) -> Result<NtfsVolumeData, IoError>;

    /// Read raw sectors at `byte_offset`, a multiple of sector size, into
    /// `buffer` (whose length must also be a multiple of sector size).
    fn read_sectors(
        &self,
        handle: RawVolumeHandle,
        byte_offset: u64,
        buffer: &mut [u8],
    ) -> Result<(), IoError>;

    /// Open a file by inode/mft-reference for extent retrieval and moving.
    /// Returns a per-item handle scoped to one move cycle.
    fn open_item(&self, volume: RawVolumeHandle, inode: u64) -> Result<RawVolumeHandle, IoError>;

    fn close_item(&self, file_handle: RawVolumeHandle);
}

/// Draw-cluster color enumeration for the progress callback (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawColor {
    Empty,
    Allocated,
    Unfragmented,
    Unmovable,
    Fragmented,
    Busy,
    Mft,
    SpaceHog,
}

/// Which phase is currently executing, surfaced in status-change progress
/// callbacks (§6, §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefragPhase {
    Analyze,
    Defragment,
    ForcedFill,
    ZoneSort,
    ZoneFastOpt,
    MoveUp,
    Fixup,
    Done,
}
