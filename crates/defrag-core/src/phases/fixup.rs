/// Fixup phase: relocate files that sit where they shouldn't — internally
/// fragmented, parked inside an MFT-reserved extent, a regular file in the
/// directory zone, or a space-hog outside its own zone (§4.7 "Fixup").
///
/// Grounded on `defrag_mode_2`/`fixup` (defrag_lib.cpp): walk the index once,
/// caching the destination gap across consecutive files so a run of files
/// headed to the same zone doesn't re-scan the bitmap for each one.
use crate::error::DefragError;
use crate::gap::{Gap, GapSelection};
use crate::index::ItemIndex;
use crate::model::ItemHandle;
use crate::move_engine::{MoveDirection, MoveOutcome};
use crate::zone::classify_item;

use super::PhaseContext;

pub fn run(ctx: &mut PhaseContext<'_>, index: &mut ItemIndex) -> Result<(), DefragError> {
    let snapshot: Vec<ItemHandle> = index.iter_in_order().collect();
    ctx.phase_todo = snapshot.iter().map(|&h| index.get(h).clusters_count).sum();

    let mut cached_gap: Option<Gap> = None;
    let mut cached_zone: Option<usize> = None;

    for handle in snapshot {
        if ctx.running.should_stop() {
            break;
        }

        let item = index.get(handle);
        if item.flags.is_unmovable || item.flags.is_excluded || item.clusters_count == 0 {
            continue;
        }
        if recently_modified(ctx, item.last_write_time) {
            continue;
        }

        let zone_class = classify_item(item.flags.is_directory, item.flags.is_spacehog);
        let zone_index = zone_class.zone_index();
        let current_zone = ctx.zone_table.classify_lcn(item.lcn_key());

        let needs_fixup = !item.fragments.is_unfragmented()
            || sits_in_mft_reserve(ctx, item)
            || (zone_index == 0 && current_zone != 0)
            || (zone_index == 1 && current_zone == 0)
            || (zone_index == 2 && current_zone <= 1);

        if !needs_fixup {
            continue;
        }

        let clusters_needed = item.clusters_count;
        let (zone_start, zone_end) = ctx.zone_table.zone_bounds(zone_index);

        if cached_zone != Some(zone_index)
            || cached_gap.map(|g| g.len() < clusters_needed).unwrap_or(true)
        {
            cached_gap = ctx
                .find_gap(zone_start, zone_end, clusters_needed, true, GapSelection::Lowest, false)
                .map_err(DefragError::Io)?;
            cached_zone = Some(zone_index);
        }

        let Some(gap) = cached_gap else {
            // No room left anywhere in this file's zone; leave it and move on.
            continue;
        };

        let outcome = ctx.engine.move_with_fallback(
            ctx.io,
            ctx.volume_handle,
            index,
            handle,
            gap.begin_lcn,
            ctx.total_clusters,
            &ctx.mft_excludes,
            MoveDirection::Up,
            &mut ctx.phase_done,
        )?;

        match outcome {
            MoveOutcome::Succeeded => {
                let consumed = gap.begin_lcn + clusters_needed;
                cached_gap = Some(Gap { begin_lcn: consumed, end_lcn: gap.end_lcn });
            }
            MoveOutcome::Failed => {
                cached_gap = None;
                ctx.recompute_zones(index);
            }
        }
    }

    Ok(())
}

fn recently_modified(ctx: &PhaseContext<'_>, last_write_time: u64) -> bool {
    if last_write_time == 0 || ctx.now_filetime == 0 {
        return false;
    }
    ctx.now_filetime.saturating_sub(last_write_time) < ctx.fixup_skip_recent_ticks
}

fn sits_in_mft_reserve(ctx: &PhaseContext<'_>, item: &crate::model::Item) -> bool {
    let mut vcn = 0u64;
    for fragment in &item.fragments.fragments {
        if !fragment.is_virtual() && ctx.mft_excludes.contains(fragment.lcn) {
            return true;
        }
        vcn = fragment.next_vcn;
    }
    let _ = vcn;
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Item, UnmovableRegion, UnmovableRegions};
    use crate::phases::RunningFlag;
    use crate::platform::mock::{single_extent, MockFile, MockVolumeIo};
    use compact_str::CompactString;

    fn file_item(inode: u64, lcn: u64, clusters: u64) -> Item {
        let mut item = Item::new(CompactString::new("f"), CompactString::new("\\f"), 0);
        item.inode = inode;
        item.fragments.append_checked(0, lcn, clusters);
        item.clusters_count = clusters;
        item
    }

    fn ctx(io: &MockVolumeIo) -> PhaseContext<'_> {
        PhaseContext::new(
            io,
            0,
            io.total_clusters(),
            4096,
            UnmovableRegions::empty(),
            0.0,
            0,
            0,
            RunningFlag::new(),
        )
    }

    #[test]
    fn directory_sitting_past_zone_0_is_relocated_into_it() {
        // Volume of 1000 clusters; directory D lives at [400..410), far past
        // a tiny zone 0, so fixup must relocate it into [0, 300).
        let io = MockVolumeIo::new(1000);
        io.allocate(400, 410);
        let mut index = ItemIndex::new();
        let mut dir = file_item(1, 400, 10);
        dir.flags.is_directory = true;
        let handle = index.insert(dir);
        io.register_file(1, MockFile { extents: single_extent(400, 10), reject_moves: false });

        let mut c = ctx(&io);
        // Force a narrow zone 0 so the directory is clearly outside it.
        c.zone_table = crate::model::ZoneTable { z: [0, 300, 700, 1000] };
        run(&mut c, &mut index).unwrap();

        assert!(index.get(handle).lcn_key() < 300);
    }

    #[test]
    fn recently_modified_file_is_left_in_place() {
        // A regular file sitting in the directory zone would ordinarily be
        // relocated, but having been written to seconds ago it must be
        // left alone.
        let io = MockVolumeIo::new(1000);
        io.allocate(50, 60);
        let mut index = ItemIndex::new();
        let mut item = file_item(1, 50, 10);
        item.last_write_time = 1_000_000;
        let handle = index.insert(item);
        io.register_file(1, MockFile { extents: single_extent(50, 10), reject_moves: false });

        let mut c = ctx(&io);
        c.now_filetime = 1_000_500; // well within the skip window
        c.zone_table = crate::model::ZoneTable { z: [0, 300, 700, 1000] };
        run(&mut c, &mut index).unwrap();

        assert_eq!(index.get(handle).lcn_key(), 50);
    }

    #[test]
    fn file_inside_mft_reserve_is_moved_out() {
        let io = MockVolumeIo::new(1000);
        io.allocate(50, 60);
        let mut index = ItemIndex::new();
        let handle = index.insert(file_item(1, 50, 10));
        io.register_file(1, MockFile { extents: single_extent(50, 10), reject_moves: false });

        let mut c = ctx(&io);
        let mut excludes = UnmovableRegions::empty();
        excludes.regions[0] = UnmovableRegion { start: 40, end: 70 };
        c.mft_excludes = excludes;
        c.zone_table = crate::model::ZoneTable { z: [0, 100, 700, 1000] };
        run(&mut c, &mut index).unwrap();

        assert!(!c.mft_excludes.contains(index.get(handle).lcn_key()));
    }
}
