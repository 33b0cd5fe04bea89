/// Vacate: clear `[lcn, lcn + clusters)` into a single free gap by evicting
/// whatever currently occupies or crosses it (§4.7 "Vacate").
///
/// Grounded on `make_room` (defrag_lib.cpp): evicted files land above a
/// high-water mark that starts at the target zone's end and only ever moves
/// forward, which is what prevents a freshly evicted file from landing back
/// inside the range still being cleared.
use crate::error::DefragError;
use crate::gap::GapSelection;
use crate::index::ItemIndex;
use crate::model::{Item, ItemHandle};
use crate::move_engine::{MoveDirection, MoveOutcome};

use super::PhaseContext;

/// Clear `[target_start, target_start + target_len)`, evicting offenders
/// above `zone_end` (the initial high-water mark) until the range holds no
/// movable file. Bounded by the item count so a pathological volume can't
/// spin forever.
pub fn run(
    ctx: &mut PhaseContext<'_>,
    index: &mut ItemIndex,
    target_start: u64,
    target_len: u64,
    zone_end: u64,
) -> Result<(), DefragError> {
    let target_end = target_start + target_len;
    let mut high_water = zone_end.max(target_end);
    let budget = index.len() as u64 + 4;

    for _ in 0..budget {
        if ctx.running.should_stop() {
            break;
        }

        let offender = index.iter_in_order().find(|&h| {
            let item = index.get(h);
            !item.flags.is_unmovable
                && !item.flags.is_excluded
                && item.clusters_count > 0
                && overlaps(item, target_start, target_end)
        });

        let Some(handle) = offender else {
            return Ok(());
        };

        let clusters_needed = index.get(handle).clusters_count;

        let dest = ctx
            .find_gap(high_water, ctx.total_clusters, clusters_needed, false, GapSelection::Lowest, false)
            .map_err(DefragError::Io)?;

        let dest = match dest {
            Some(g) if g.len() >= clusters_needed => g,
            _ => {
                let current = index.get(handle).lcn_key();
                match ctx
                    .find_gap(current, ctx.total_clusters, clusters_needed, false, GapSelection::Highest, false)
                    .map_err(DefragError::Io)?
                {
                    Some(g) => g,
                    None => return Err(DefragError::NoGap { minimum_size: clusters_needed }),
                }
            }
        };

        let outcome = ctx.engine.move_with_fallback(
            ctx.io,
            ctx.volume_handle,
            index,
            handle,
            dest.begin_lcn,
            ctx.total_clusters,
            &ctx.mft_excludes,
            MoveDirection::Up,
            &mut ctx.phase_done,
        )?;

        match outcome {
            MoveOutcome::Succeeded => {
                high_water = high_water.max(dest.begin_lcn + clusters_needed);
            }
            MoveOutcome::Failed => {
                ctx.recompute_zones(index);
            }
        }
    }

    Ok(())
}

fn overlaps(item: &Item, start: u64, end: u64) -> bool {
    let mut vcn = 0u64;
    for fragment in &item.fragments.fragments {
        let frag_start = vcn;
        let frag_end = fragment.next_vcn;
        vcn = fragment.next_vcn;
        if fragment.is_virtual() {
            continue;
        }
        let lcn_start = fragment.lcn;
        let lcn_end = fragment.lcn + (frag_end - frag_start);
        if lcn_start < end && lcn_end > start {
            return true;
        }
    }
    false
}
