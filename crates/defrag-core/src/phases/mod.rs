/// Phase sequencers: the mode-selected chain of scan/defragment/fixup/
/// optimize/forced-fill/move-up/vacate passes that do the actual work of a
/// volume pass (§4.7).
///
/// Grounded on `defrag.cpp`'s `run_jkdefrag` dispatch and the
/// `OptimizeMode` enum (`constants.h`): each [`Mode`] names one of the
/// eleven phase chains `run_jkdefrag` can select, kept under the same
/// names here so the mapping in `DESIGN.md` is traceable line-for-line.
pub mod defragment;
pub mod fixup;
pub mod forced_fill;
pub mod optimize;
pub mod vacate;

use crate::gap::{find_gap, GapSelection};
use crate::index::ItemIndex;
use crate::model::{UnmovableRegions, ZoneTable};
use crate::move_engine::MoveEngine;
use crate::platform::{DefragPhase, RawVolumeHandle, VolumeIo};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The eleven phase-chain selectors the run-defrag entry point accepts
/// (§6 "Caller-side", §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Mode {
    /// scan -> report.
    AnalyzeOnly,
    /// scan -> fixup.
    AnalyzeFixup,
    /// scan -> defragment -> fixup -> optimize-volume -> fixup. Default.
    AnalyzeFixupFastopt,
    /// Historical synonym for `AnalyzeFixupFastopt` kept for callers still
    /// naming the original's now-retired "full" optimize constant; the
    /// original never gave it a distinct algorithm from the fast-opt chain,
    /// so neither does this one (see DESIGN.md Open Questions).
    DeprecatedAnalyzeFixupFull,
    /// scan -> forced-fill.
    AnalyzeGroup,
    /// scan -> move-up.
    AnalyzeMoveToEnd,
    AnalyzeSortByName,
    AnalyzeSortBySize,
    AnalyzeSortByAccess,
    AnalyzeSortByChanged,
    AnalyzeSortByCreated,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::AnalyzeFixupFastopt
    }
}

/// Sort key used by the five `AnalyzeSortByX` modes (§4.7 "Optimize-sort").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Name,
    Size,
    LastAccess,
    Changed,
    Created,
}

impl Mode {
    /// The sort key an `AnalyzeSortByX` mode implies, or `None` for every
    /// other mode.
    pub fn sort_key(self) -> Option<SortKey> {
        match self {
            Mode::AnalyzeSortByName => Some(SortKey::Name),
            Mode::AnalyzeSortBySize => Some(SortKey::Size),
            Mode::AnalyzeSortByAccess => Some(SortKey::LastAccess),
            Mode::AnalyzeSortByChanged => Some(SortKey::Changed),
            Mode::AnalyzeSortByCreated => Some(SortKey::Created),
            _ => None,
        }
    }
}

/// Cooperative cancellation flag shared between the worker and the
/// display/progress thread (§5). `Running`/`Stopping`/`Stopped` map onto a
/// plain `u8` behind an `Arc<AtomicU8>` — the worker only ever reads it,
/// the display thread only ever writes `Stopping`, and the worker writes
/// `Stopped` exactly once on exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Running = 0,
    Stopping = 1,
    Stopped = 2,
}

impl RunState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => RunState::Stopping,
            2 => RunState::Stopped,
            _ => RunState::Running,
        }
    }
}

#[derive(Clone)]
pub struct RunningFlag(Arc<AtomicU8>);

impl RunningFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(RunState::Running as u8)))
    }

    pub fn get(&self) -> RunState {
        RunState::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub fn stop(&self) {
        self.0.store(RunState::Stopping as u8, Ordering::Relaxed);
    }

    fn mark_stopped(&self) {
        self.0.store(RunState::Stopped as u8, Ordering::Relaxed);
    }

    /// `true` once `Stopping` (or `Stopped`) has been observed — every
    /// inner loop in the phases checks this at the top (§5, §9 "Cooperative
    /// cancellation").
    pub fn should_stop(&self) -> bool {
        !matches!(self.get(), RunState::Running)
    }
}

impl Default for RunningFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-volume-pass state threaded through every phase: the shared
/// collaborators (I/O, index, zones, move engine) plus the two progress
/// counters the spec calls `phase_todo`/`phase_done` (§4.7).
pub struct PhaseContext<'a> {
    pub io: &'a dyn VolumeIo,
    pub volume_handle: RawVolumeHandle,
    pub total_clusters: u64,
    pub bytes_per_cluster: u32,
    pub mft_excludes: UnmovableRegions,
    pub free_space_percent: f64,
    pub zone_table: ZoneTable,
    pub engine: MoveEngine,
    pub running: RunningFlag,
    pub phase_todo: u64,
    pub phase_done: u64,
    /// Current time as Windows `FILETIME` ticks (100ns since 1601-01-01),
    /// used by fixup's recently-modified skip (§4.7 "Fixup", §9 Open
    /// Question). A separate clock from the throttle's `now_ms`, which is
    /// an arbitrary monotonic millisecond source.
    pub now_filetime: u64,
    /// Files whose `last_write_time` is within this many ticks of
    /// `now_filetime` are left alone by fixup. Defaults to 15 minutes'
    /// worth of ticks; see `DefragOptions::fixup_skip_recent`.
    pub fixup_skip_recent_ticks: u64,
}

impl<'a> PhaseContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        io: &'a dyn VolumeIo,
        volume_handle: RawVolumeHandle,
        total_clusters: u64,
        bytes_per_cluster: u32,
        mft_excludes: UnmovableRegions,
        free_space_percent: f64,
        speed_percent: u8,
        now_ms: i64,
        running: RunningFlag,
    ) -> Self {
        Self {
            io,
            volume_handle,
            total_clusters,
            bytes_per_cluster,
            mft_excludes,
            free_space_percent,
            zone_table: ZoneTable::new(total_clusters),
            engine: MoveEngine::new(speed_percent, now_ms),
            running,
            phase_todo: 0,
            phase_done: 0,
            now_filetime: 0,
            fixup_skip_recent_ticks: 15 * 60 * 10_000_000,
        }
    }

    /// Recompute `zone_table` against the current item index, using the
    /// move engine's running directory-failure count (§4.5).
    pub fn recompute_zones(&mut self, index: &ItemIndex) {
        self.zone_table = crate::zone::calculate_zones(
            index,
            self.total_clusters,
            self.free_space_percent,
            &self.mft_excludes,
            self.engine.directory_move_failures,
        );
    }

    /// Sleep (the caller's thread, not a test thread) for the throttle's
    /// computed delay before the next move call.
    pub fn throttle_pause(&mut self, now_ms: i64) -> Duration {
        self.engine.throttle_pause(now_ms)
    }

    /// Find a gap via this context's volume/excludes, a thin pass-through
    /// kept here so phase modules don't each need the full `find_gap`
    /// argument list in scope.
    #[allow(clippy::too_many_arguments)]
    pub fn find_gap(
        &self,
        minimum_lcn: u64,
        maximum_lcn: u64,
        minimum_size: u64,
        must_fit: bool,
        selection: GapSelection,
        ignore_mft_excludes: bool,
    ) -> Result<Option<crate::gap::Gap>, crate::platform::IoError> {
        find_gap(
            self.io,
            self.volume_handle,
            self.total_clusters,
            &self.mft_excludes,
            minimum_lcn,
            maximum_lcn,
            minimum_size,
            must_fit,
            selection,
            ignore_mft_excludes,
        )
    }
}

/// Run the phase chain `mode` selects against an already-scanned `index`
/// (§4.7). Scanning itself is driven by the caller (it differs between
/// NTFS and FAT); this function only sequences the post-scan phases.
pub fn run_mode(
    ctx: &mut PhaseContext<'_>,
    index: &mut ItemIndex,
    mode: Mode,
    status: &mut dyn FnMut(DefragPhase, ZoneTable),
) -> Result<(), crate::error::DefragError> {
    ctx.recompute_zones(index);

    match mode {
        Mode::AnalyzeOnly => {
            status(DefragPhase::Analyze, ctx.zone_table);
        }
        Mode::AnalyzeFixup => {
            status(DefragPhase::Fixup, ctx.zone_table);
            fixup::run(ctx, index)?;
        }
        Mode::AnalyzeFixupFastopt | Mode::DeprecatedAnalyzeFixupFull => {
            status(DefragPhase::Defragment, ctx.zone_table);
            defragment::run(ctx, index)?;
            status(DefragPhase::Fixup, ctx.zone_table);
            fixup::run(ctx, index)?;
            status(DefragPhase::ZoneSort, ctx.zone_table);
            optimize::run_optimize_volume(ctx, index)?;
            status(DefragPhase::Fixup, ctx.zone_table);
            fixup::run(ctx, index)?;
        }
        Mode::AnalyzeGroup => {
            status(DefragPhase::ForcedFill, ctx.zone_table);
            forced_fill::run_forced_fill(ctx, index)?;
        }
        Mode::AnalyzeMoveToEnd => {
            status(DefragPhase::MoveUp, ctx.zone_table);
            forced_fill::run_move_up(ctx, index)?;
        }
        Mode::AnalyzeSortByName
        | Mode::AnalyzeSortBySize
        | Mode::AnalyzeSortByAccess
        | Mode::AnalyzeSortByChanged
        | Mode::AnalyzeSortByCreated => {
            status(DefragPhase::ZoneFastOpt, ctx.zone_table);
            let key = mode.sort_key().expect("sort mode always has a sort key");
            optimize::run_optimize_sort(ctx, index, key)?;
        }
    }

    status(DefragPhase::Done, ctx.zone_table);
    Ok(())
}
