/// One file or, for NTFS, one named stream.
///
/// Items live in an arena ([`crate::index::ItemIndex`]) and are referred to
/// by [`ItemHandle`] rather than by pointer — this sidesteps the
/// parent/smaller/bigger cycle that a pointer-based tree would need
/// `Rc`/`RefCell` gymnastics for (see DESIGN.md).
use super::fragment::{AliasedName, FragmentList};
use compact_str::CompactString;

/// Index into the item arena. `u32` keeps arena slots small; a volume with
/// more than 4 billion items does not exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemHandle(pub u32);

impl ItemHandle {
    #[inline]
    pub fn new(index: usize) -> Self {
        debug_assert!(index <= u32::MAX as usize, "ItemHandle overflow");
        Self(index as u32)
    }

    #[inline]
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// File/stream classification flags (§3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemFlags {
    pub is_directory: bool,
    pub is_unmovable: bool,
    pub is_excluded: bool,
    pub is_spacehog: bool,
}

/// One file, directory, or named stream, and its position in the item index.
#[derive(Debug, Clone)]
pub struct Item {
    pub name: AliasedName,
    pub path: AliasedName,

    pub size_bytes: u64,
    pub clusters_count: u64,

    /// 100-nanosecond ticks since 1601-01-01 (Windows `FILETIME` epoch).
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_write_time: u64,

    /// Filesystem-native identifier: MFT reference number on NTFS, or a
    /// scanner-assigned synthetic id on FAT (which has none natively).
    pub inode: u64,

    /// Weak back-reference to the parent directory item; no ownership.
    pub parent_dir: Option<ItemHandle>,
    pub parent_inode: u64,

    pub flags: ItemFlags,
    pub fragments: FragmentList,

    // Item-index tree links (§4.3). `None` means "no such link", not "root".
    pub(crate) tree_parent: Option<ItemHandle>,
    pub(crate) smaller: Option<ItemHandle>,
    pub(crate) bigger: Option<ItemHandle>,
}

impl Item {
    pub fn new(name: CompactString, path: CompactString, parent_inode: u64) -> Self {
        Self {
            name: AliasedName::new(name),
            path: AliasedName::new(path),
            size_bytes: 0,
            clusters_count: 0,
            creation_time: 0,
            last_access_time: 0,
            last_write_time: 0,
            inode: 0,
            parent_dir: None,
            parent_inode,
            flags: ItemFlags::default(),
            fragments: FragmentList::new(),
            tree_parent: None,
            smaller: None,
            bigger: None,
        }
    }

    /// Key used by the item index: the LCN of the first real fragment, or
    /// `0` if the item has none (pure-virtual stream, empty file, or
    /// directory with no allocation).
    #[inline]
    pub fn lcn_key(&self) -> u64 {
        self.fragments.first_real_lcn()
    }

    /// Invariant check from §3: if a fragment list is present, the item's
    /// cluster count equals the sum of real-fragment lengths.
    pub fn clusters_count_matches_fragments(&self) -> bool {
        self.clusters_count == self.fragments.real_clusters()
    }
}
