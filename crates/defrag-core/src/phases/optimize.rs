/// Optimize-volume and optimize-sort: the two gap-packing passes that place
/// already-defragmented files as tightly as possible within their zones
/// (§4.7 "Optimize-volume", "Optimize-sort").
///
/// Grounded on `defrag_mode_3`/`defrag_mode_4..8` (defrag_lib.cpp):
/// optimize-volume fills each gap with the best-fitting combination of files
/// from the top of the volume; optimize-sort instead walks files in a
/// caller-chosen order and vacates/places them one at a time.
use std::time::{Duration, Instant};

use crate::error::DefragError;
use crate::gap::GapSelection;
use crate::index::ItemIndex;
use crate::model::{Item, ItemHandle};
use crate::move_engine::{MoveDirection, MoveOutcome};
use crate::zone::classify_item;

use super::{vacate, PhaseContext, SortKey};

/// Time budget for the exact-combination search in `find_best_combination`,
/// matching the original's "give up after half a second and take the
/// largest single fit" heuristic.
const COMBINATION_SEARCH_BUDGET: Duration = Duration::from_millis(500);

/// Partial placements during optimize-sort move in multiples of this many
/// clusters; a residual smaller than it is left for the next gap.
const SORT_MOVE_ALIGNMENT: u64 = 8;

pub fn run_optimize_volume(ctx: &mut PhaseContext<'_>, index: &mut ItemIndex) -> Result<(), DefragError> {
    let snapshot: Vec<ItemHandle> = index.iter_in_order().collect();
    ctx.phase_todo = snapshot.iter().map(|&h| index.get(h).clusters_count).sum();

    for zone in 0..3usize {
        let (zone_start, zone_end) = ctx.zone_table.zone_bounds(zone);
        let budget = index.len() as u64 + 4;

        for _ in 0..budget {
            if ctx.running.should_stop() {
                break;
            }

            let gap = ctx
                .find_gap(zone_start, zone_end, 1, true, GapSelection::Lowest, false)
                .map_err(DefragError::Io)?;
            let Some(gap) = gap else { break };
            if gap.is_empty() {
                break;
            }

            let candidates: Vec<(ItemHandle, u64)> = index
                .iter_in_order()
                .filter(|&h| {
                    let item = index.get(h);
                    item.lcn_key() >= gap.end_lcn
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

            let mut dest = gap.begin_lcn;
            for handle in chosen {
                let clusters = index.get(handle).clusters_count;
                let outcome = ctx.engine.move_with_fallback(
                    ctx.io,
                    ctx.volume_handle,
                    index,
                    handle,
                    dest,
                    ctx.total_clusters,
                    &ctx.mft_excludes,
                    MoveDirection::Up,
                    &mut ctx.phase_done,
                )?;
                match outcome {
                    MoveOutcome::Succeeded => dest += clusters,
                    MoveOutcome::Failed => ctx.recompute_zones(index),
                }
            }
        }
    }

    Ok(())
}

/// Bounded exact-subset-sum search: try to find a set of candidates whose
/// cluster counts sum exactly to `target`, sorted largest-first so a fit is
/// likely to surface before the time budget runs out.
pub(crate) fn find_best_combination(
    candidates: &[(ItemHandle, u64)],
    target: u64,
    deadline: Instant,
) -> Option<Vec<ItemHandle>> {
    if target == 0 {
        return Some(Vec::new());
    }
    let mut sorted = candidates.to_vec();
    sorted.sort_by(|a, b| b.1.cmp(&a.1));

    let mut chosen = Vec::new();
    if search_combination(&sorted, 0, target, deadline, &mut chosen) {
        Some(chosen)
    } else {
        None
    }
}

fn search_combination(
    items: &[(ItemHandle, u64)],
    index_from: usize,
    remaining: u64,
    deadline: Instant,
    chosen: &mut Vec<ItemHandle>,
) -> bool {
    if remaining == 0 {
        return true;
    }
    if index_from >= items.len() || Instant::now() >= deadline {
        return false;
    }

    let (handle, size) = items[index_from];
    if size <= remaining {
        chosen.push(handle);
        if search_combination(items, index_from + 1, remaining - size, deadline, chosen) {
            return true;
        }
        chosen.pop();
    }
    search_combination(items, index_from + 1, remaining, deadline, chosen)
}

/// Fallback when no exact combination is found: the single largest
/// candidate (every candidate here already fits by construction).
pub(crate) fn find_highest_item(candidates: &[(ItemHandle, u64)]) -> Vec<ItemHandle> {
    candidates
        .iter()
        .max_by_key(|(_, size)| *size)
        .map(|(h, _)| vec![*h])
        .unwrap_or_default()
}

pub fn run_optimize_sort(
    ctx: &mut PhaseContext<'_>,
    index: &mut ItemIndex,
    key: SortKey,
) -> Result<(), DefragError> {
    let snapshot: Vec<ItemHandle> = index.iter_in_order().collect();
    ctx.phase_todo = snapshot.iter().map(|&h| index.get(h).clusters_count).sum();

    for zone in 0..3usize {
        let budget = index.len() as u64 + 4;
        for _ in 0..budget {
            if ctx.running.should_stop() {
                break;
            }

            let (zone_start, zone_end) = ctx.zone_table.zone_bounds(zone);
            let target = first_misplaced_in_sorted_order(index, zone, zone_start, key);
            let Some((handle, target_lcn)) = target else { break };

            let clusters_needed = index.get(handle).clusters_count;
            vacate::run(ctx, index, target_lcn, clusters_needed, zone_end)?;

            place_sorted(ctx, index, handle, target_lcn, clusters_needed)?;
        }
    }

    Ok(())
}

/// Compute the sorted-order target LCN for every movable item whose class
/// belongs to `zone`, starting at `zone_start`, and return the first whose
/// current LCN doesn't already match.
fn first_misplaced_in_sorted_order(
    index: &ItemIndex,
    zone: usize,
    zone_start: u64,
    key: SortKey,
) -> Option<(ItemHandle, u64)> {
    let mut members: Vec<ItemHandle> = index
        .iter_in_order()
        .filter(|&h| {
            let item = index.get(h);
            !item.flags.is_unmovable
                && !item.flags.is_excluded
                && item.clusters_count > 0
                && classify_item(item.flags.is_directory, item.flags.is_spacehog).zone_index() == zone
        })
        .collect();

    members.sort_by(|&a, &b| sort_value(index.get(a), key).cmp(&sort_value(index.get(b), key)));

    let mut lcn = zone_start;
    for handle in members {
        let item = index.get(handle);
        if item.lcn_key() != lcn {
            return Some((handle, lcn));
        }
        lcn += item.clusters_count;
    }
    None
}

fn sort_value(item: &Item, key: SortKey) -> SortValue<'_> {
    match key {
        SortKey::Name => SortValue::Text(item.name.long.as_str()),
        SortKey::Size => SortValue::Number(item.size_bytes),
        SortKey::LastAccess => SortValue::Number(item.last_access_time),
        SortKey::Changed => SortValue::Number(item.last_write_time),
        SortKey::Created => SortValue::Number(item.creation_time),
    }
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum SortValue<'a> {
    Number(u64),
    Text(&'a str),
}

/// Place `handle` at `target_lcn`: a single move if the gap there is large
/// enough for the whole file, otherwise a sequence of 8-cluster-aligned
/// partial moves, leaving any sub-alignment residual for a later pass.
fn place_sorted(
    ctx: &mut PhaseContext<'_>,
    index: &mut ItemIndex,
    handle: ItemHandle,
    target_lcn: u64,
    clusters_needed: u64,
) -> Result<(), DefragError> {
    let gap = ctx
        .find_gap(target_lcn, ctx.total_clusters, 1, false, GapSelection::Lowest, false)
        .map_err(DefragError::Io)?;
    let available = gap.map(|g| if g.begin_lcn == target_lcn { g.len() } else { 0 }).unwrap_or(0);

    if available >= clusters_needed {
        ctx.engine.move_with_fallback(
            ctx.io,
            ctx.volume_handle,
            index,
            handle,
            target_lcn,
            ctx.total_clusters,
            &ctx.mft_excludes,
            MoveDirection::Up,
            &mut ctx.phase_done,
        )?;
        return Ok(());
    }

    let inode = index.get(handle).inode;
    let file_handle = ctx
        .io
        .open_item(ctx.volume_handle, inode)
        .map_err(|e| DefragError::InaccessibleItem { inode, detail: e.to_string() })?;

    let aligned = available - (available % SORT_MOVE_ALIGNMENT);
    if aligned > 0 {
        if ctx
            .engine
            .move_one_span(ctx.io, file_handle, 0, target_lcn, aligned, ctx.bytes_per_cluster, &mut ctx.phase_done)
            .is_err()
        {
            ctx.io.close_item(file_handle);
            return Ok(());
        }
    }

    ctx.engine.refresh_item_fragments(ctx.io, file_handle, index, handle)?;
    ctx.io.close_item(file_handle);
    Ok(())
}
