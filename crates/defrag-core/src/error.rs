/// Error taxonomy for the defragmentation engine (§7).
///
/// Mirrors the teacher's `thiserror`-per-crate pattern: one flat enum,
/// `#[error(...)]` messages written for a human reading a log line, no
/// nested `anyhow` wrapping since every variant here is already a leaf the
/// caller is expected to match on.
use crate::platform::IoError;

#[derive(Debug, thiserror::Error)]
pub enum DefragError {
    /// Corrupt metadata local to one item: bad USA fixup, runlist overrun,
    /// FAT loop, or a stream-continuity break. The scan continues; only
    /// the offending item is skipped.
    #[error("corrupt metadata at inode {inode}: {detail}")]
    CorruptMetadata { inode: u64, detail: String },

    /// I/O failure on top-level volume metadata ($MFT, boot sector, MFT
    /// bitmap). Fatal for the current volume pass.
    #[error("metadata I/O failed: {0}")]
    MetadataIoFailure(#[source] IoError),

    /// A move attempt failed and the item has been flagged unmovable.
    #[error("move failed for inode {inode}: {detail}")]
    MoveFailed { inode: u64, detail: String },

    /// No gap satisfying the caller's constraints exists on the volume.
    #[error("no gap of at least {minimum_size} clusters found in range")]
    NoGap { minimum_size: u64 },

    /// An item's handle could not be opened (permissions, concurrent lock).
    #[error("inode {inode} is inaccessible: {detail}")]
    InaccessibleItem { inode: u64, detail: String },

    /// Generic device I/O failure surfaced as-is from the platform layer.
    #[error(transparent)]
    Io(#[from] IoError),
}

impl DefragError {
    /// Whether this error should abort the entire volume pass (§7
    /// "propagation policy") rather than being recovered locally.
    pub fn is_fatal_for_volume(&self) -> bool {
        matches!(self, DefragError::MetadataIoFailure(_))
    }
}
