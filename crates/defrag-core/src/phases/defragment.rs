/// Defragment phase: give every internally-fragmented, movable file a
/// single contiguous run, preferring a gap inside its home zone (§4.7
/// "Defragment").
///
/// Grounded on `defrag_mode_1` (defrag_lib.cpp): walk the index in LCN
/// order, skip anything not worth touching, then either move the whole
/// file in one gap or split it across the biggest gaps available.
use crate::error::DefragError;
use crate::gap::GapSelection;
use crate::index::ItemIndex;
use crate::model::ItemHandle;
use crate::move_engine::MoveDirection;
use crate::zone::classify_item;

use super::PhaseContext;

pub fn run(ctx: &mut PhaseContext<'_>, index: &mut ItemIndex) -> Result<(), DefragError> {
    let snapshot: Vec<ItemHandle> = index.iter_in_order().collect();
    ctx.phase_todo = snapshot
        .iter()
        .map(|&h| index.get(h).clusters_count)
        .sum();

    for handle in snapshot {
        if ctx.running.should_stop() {
            break;
        }

        let (clusters_needed, zone_class) = {
            let item = index.get(handle);
            if item.flags.is_unmovable
                || item.flags.is_excluded
                || item.clusters_count == 0
                || item.fragments.is_unfragmented()
            {
                continue;
            }
            (
                item.clusters_count,
                classify_item(item.flags.is_directory, item.flags.is_spacehog),
            )
        };

        let (zone_start, zone_end) = ctx.zone_table.zone_bounds(zone_class.zone_index());

        let home_gap = ctx
            .find_gap(zone_start, zone_end, clusters_needed, true, GapSelection::Lowest, false)
            .map_err(DefragError::Io)?;

        let gap = match home_gap {
            Some(g) => g,
            None => {
                let largest = ctx
                    .find_gap(0, ctx.total_clusters, 0, false, GapSelection::Lowest, false)
                    .map_err(DefragError::Io)?;
                match largest {
                    Some(g) if !g.is_empty() => g,
                    // No gap anywhere on the volume: nothing further this
                    // phase can do.
                    _ => break,
                }
            }
        };

        if gap.len() >= clusters_needed {
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
            if outcome == crate::move_engine::MoveOutcome::Failed {
                ctx.recompute_zones(index);
            }
        } else {
            fill_across_gaps(ctx, index, handle, clusters_needed)?;
        }
    }

    Ok(())
}

/// Place a file across successive gaps when no single gap fits the whole
/// file, smallest-fragment-safe: a partial move is never issued smaller
/// than the item's next not-yet-relocated source fragment, since that
/// would only add a fragment instead of removing one.
fn fill_across_gaps(
    ctx: &mut PhaseContext<'_>,
    index: &mut ItemIndex,
    handle: ItemHandle,
    clusters_needed: u64,
) -> Result<(), DefragError> {
    let inode = index.get(handle).inode;
    let file_handle = ctx
        .io
        .open_item(ctx.volume_handle, inode)
        .map_err(|e| DefragError::InaccessibleItem { inode, detail: e.to_string() })?;

    let next_fragment_len = {
        let item = index.get(handle);
        item.fragments.fragments.first().map(|f| f.next_vcn).unwrap_or(0)
    };

    let mut source_vcn = 0u64;
    let mut remaining = clusters_needed;

    while remaining > 0 {
        if ctx.running.should_stop() {
            break;
        }
        let min_chunk = remaining.min(next_fragment_len.max(1));
        let gap = ctx
            .find_gap(0, ctx.total_clusters, min_chunk, false, GapSelection::Lowest, false)
            .map_err(DefragError::Io)?;
        let Some(gap) = gap else { break };
        let chunk = remaining.min(gap.len());
        if chunk < min_chunk {
            // Placing fewer clusters than the next source fragment would
            // increase fragmentation instead of reducing it; stop here.
            break;
        }

        if ctx
            .engine
            .move_one_span(ctx.io, file_handle, source_vcn, gap.begin_lcn, chunk, ctx.bytes_per_cluster, &mut ctx.phase_done)
            .is_err()
        {
            break;
        }
        source_vcn += chunk;
        remaining -= chunk;
    }

    ctx.engine.refresh_item_fragments(ctx.io, file_handle, index, handle)?;
    ctx.io.close_item(file_handle);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Item, UnmovableRegions};
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
    fn unfragmented_file_already_in_its_gap_is_left_alone() {
        let io = MockVolumeIo::new(1000);
        io.allocate(10, 15);
        let mut index = ItemIndex::new();
        let handle = index.insert(file_item(1, 10, 5));
        io.register_file(1, MockFile { extents: single_extent(10, 5), reject_moves: false });

        let mut c = ctx(&io);
        c.recompute_zones(&index);
        run(&mut c, &mut index).unwrap();

        assert_eq!(index.get(handle).lcn_key(), 10);
    }

    #[test]
    fn two_fragment_file_with_a_fitting_gap_becomes_contiguous() {
        // Mirrors the "two-fragment file, one gap" end-to-end scenario:
        // file occupies [10..15) and [80..85); every cluster except
        // [20..30) is in use, so that is the volume's only gap.
        let io = MockVolumeIo::new(100);
        io.allocate(0, 20);
        io.allocate(30, 100);
        let mut index = ItemIndex::new();
        let mut item = Item::new(CompactString::new("a"), CompactString::new("\\a"), 0);
        item.inode = 1;
        item.fragments.append_checked(0, 10, 5);
        item.fragments.append_checked(5, 80, 10);
        item.clusters_count = 10;
        let handle = index.insert(item);
        io.register_file(
            1,
            MockFile { extents: vec![
                crate::platform::RawExtent { next_vcn: 5, lcn: 10 },
                crate::platform::RawExtent { next_vcn: 10, lcn: 80 },
            ], reject_moves: false },
        );

        let mut c = ctx(&io);
        c.recompute_zones(&index);
        run(&mut c, &mut index).unwrap();

        assert!(index.get(handle).fragments.is_unfragmented());
        assert_eq!(index.get(handle).lcn_key(), 20);
    }
}
