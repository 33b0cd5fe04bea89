/// Data model for the volume scanner and defragmentation engine.
pub mod fragment;
pub mod item;
pub mod volume;

pub use fragment::{AliasedName, Fragment, FragmentList, VIRTUAL_FRAGMENT};
pub use item::{Item, ItemFlags, ItemHandle};
pub use volume::{
    FilesystemKind, UnmovableRegion, UnmovableRegions, VolumeDescriptor, ZoneClass, ZoneTable,
};
