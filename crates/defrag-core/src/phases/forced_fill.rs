/// Move-up / forced-fill: pack gaps from one end of the volume with files
/// taken from the opposite end (§4.7 "Move-up / Forced-fill").
///
/// Grounded on `defrag_mode_5`/`defrag_mode_6` (defrag_lib.cpp) — the same
/// best-combination-then-largest-fit packing `optimize.rs` uses for
/// per-zone gaps, here run once across the whole volume and bounded toward
/// one side of it.
use std::time::{Duration, Instant};

use crate::error::DefragError;
use crate::gap::GapSelection;
use crate::index::ItemIndex;
use crate::model::ItemHandle;
use crate::move_engine::{MoveDirection, MoveOutcome};

use super::optimize::{find_best_combination, find_highest_item};
use super::PhaseContext;

const COMBINATION_SEARCH_BUDGET: Duration = Duration::from_millis(500);

/// Iterate from the lowest gap upward, packing it with files from the top
/// of the volume.
pub fn run_forced_fill(ctx: &mut PhaseContext<'_>, index: &mut ItemIndex) -> Result<(), DefragError> {
    run_packing(ctx, index, GapSelection::Lowest, MoveDirection::Up)
}

/// Iterate from the highest gap downward, packing it with files from the
/// bottom of the volume.
pub fn run_move_up(ctx: &mut PhaseContext<'_>, index: &mut ItemIndex) -> Result<(), DefragError> {
    run_packing(ctx, index, GapSelection::Highest, MoveDirection::Down)
}

fn run_packing(
    ctx: &mut PhaseContext<'_>,
    index: &mut ItemIndex,
    selection: GapSelection,
    direction: MoveDirection,
) -> Result<(), DefragError> {
    let snapshot: Vec<ItemHandle> = index.iter_in_order().collect();
    ctx.phase_todo = snapshot.iter().map(|&h| index.get(h).clusters_count).sum();

    let budget = index.len() as u64 + 4;
    for _ in 0..budget {
        if ctx.running.should_stop() {
            break;
        }

        let gap = ctx
            .find_gap(0, ctx.total_clusters, 1, true, selection, false)
            .map_err(DefragError::Io)?;
        let Some(gap) = gap else { break };
        if gap.is_empty() {
            break;
        }

        let candidates: Vec<(ItemHandle, u64)> = index
            .iter_in_order()
            .filter(|&h| {
                let item = index.get(h);
                let opposite_side = match selection {
                    GapSelection::Lowest => item.lcn_key() >= gap.end_lcn,
                    GapSelection::Highest => item.lcn_key() < gap.begin_lcn,
                };
                opposite_side
                    && !item.flags.is_unmovable
                    && !item.flags.is_excluded
                    && item.clusters_count > 0
                    && item.clusters_count <= gap.len()
            })
            .map(|h| (h, index.get(h).clusters_count))
            .collect();

        if candidates.is_empty() {
            break;
        }

        let chosen = find_best_combination(&candidates, gap.len(), Instant::now() + COMBINATION_SEARCH_BUDGET)
            .unwrap_or_else(|| find_highest_item(&candidates));
        if chosen.is_empty() {
            break;
        }

        // `Lowest` (forced-fill) packs a gap bottom-up, starting at its
        // begin; `Highest` (move-up) packs top-down, so each file's
        // destination is computed backward from the gap's end.
        let mut dest = match selection {
            GapSelection::Lowest => gap.begin_lcn,
            GapSelection::Highest => gap.end_lcn,
        };
        for handle in chosen {
            let clusters = index.get(handle).clusters_count;
            let target = match selection {
                GapSelection::Lowest => dest,
                GapSelection::Highest => dest - clusters,
            };
            let outcome = ctx.engine.move_with_fallback(
                ctx.io,
                ctx.volume_handle,
                index,
                handle,
                target,
                ctx.total_clusters,
                &ctx.mft_excludes,
                direction,
                &mut ctx.phase_done,
            )?;
            match outcome {
                MoveOutcome::Succeeded => {
                    dest = match selection {
                        GapSelection::Lowest => dest + clusters,
                        GapSelection::Highest => target,
                    };
                }
                MoveOutcome::Failed => ctx.recompute_zones(index),
            }
        }
    }

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
    fn forced_fill_packs_the_lowest_gap_with_a_file_from_the_top() {
        let io = MockVolumeIo::new(200);
        io.allocate(190, 200);
        let mut index = ItemIndex::new();
        let handle = index.insert(file_item(1, 190, 10));
        io.register_file(1, MockFile { extents: single_extent(190, 10), reject_moves: false });

        let mut c = ctx(&io);
        run_forced_fill(&mut c, &mut index).unwrap();

        assert_eq!(index.get(handle).lcn_key(), 0);
    }

    #[test]
    fn move_up_packs_the_highest_gap_with_a_file_from_the_bottom() {
        let io = MockVolumeIo::new(200);
        io.allocate(0, 10);
        let mut index = ItemIndex::new();
        let handle = index.insert(file_item(1, 0, 10));
        io.register_file(1, MockFile { extents: single_extent(0, 10), reject_moves: false });

        let mut c = ctx(&io);
        run_move_up(&mut c, &mut index).unwrap();

        assert_eq!(index.get(handle).lcn_key(), 190);
    }
}
