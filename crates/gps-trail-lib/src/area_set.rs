//! SelectedAreaSet - Background computation of time ranges and paths for selected areas
//!
//! With a single area selected the result is every stretch of time spent inside it. With two
//! or more areas the result is every trip that goes through all of them in order.
//!
//! Inputs and the published result live behind their own [`ReadWriteThreadManager`]. The
//! worker computes while registered as the writer of that gate and polls it at every step:
//! a waiting writer means the inputs are about to change, so the computation is dropped and
//! restarted; waiting readers are let through with a pause. Distances are filled in after
//! the result has been published.

use crate::area_panel::{ApId, ApRect};
use crate::rw_gate::{ReadWriteThreadManager, WriteGuard};
use crate::time_range::{AreaPanelInfo, AreaTimeRange, Path, TimePosition, TimeRangeSet};
use crate::time_tree::{Direction, TtId, accept_fuzzy};
use crate::trail::TrailIndex;
use crate::{DataError, Result, utils};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Panels per side of an area at the depth used to cover it
const QUERY_PANELS_PER_SIDE: i64 = 8;

/// Longest sleep between checks while waiting for a result
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What the engine found for the current selection
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AreaSetResult {
    /// Nothing selected
    #[default]
    Empty,
    /// One area selected
    TimeRanges(Vec<AreaTimeRange>),
    /// Several areas selected
    Paths(Vec<Path>),
}

impl AreaSetResult {
    pub fn len(&self) -> usize {
        match self {
            AreaSetResult::Empty => 0,
            AreaSetResult::TimeRanges(ranges) => ranges.len(),
            AreaSetResult::Paths(paths) => paths.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Time span and distance of the entry at `index`
    fn entry(&self, index: usize) -> Option<(i64, i64, Option<f64>)> {
        match self {
            AreaSetResult::Empty => None,
            AreaSetResult::TimeRanges(ranges) => ranges
                .get(index)
                .map(|r| (r.start_time, r.end_time, r.dist_m)),
            AreaSetResult::Paths(paths) => paths
                .get(index)
                .map(|p| (p.start_time, p.end_time, p.dist_m)),
        }
    }

    fn set_distance(&mut self, index: usize, distance_m: f64) {
        match self {
            AreaSetResult::Empty => {}
            AreaSetResult::TimeRanges(ranges) => {
                if let Some(range) = ranges.get_mut(index) {
                    range.dist_m = Some(distance_m);
                }
            }
            AreaSetResult::Paths(paths) => {
                if let Some(path) = paths.get_mut(index) {
                    path.dist_m = Some(distance_m);
                }
            }
        }
    }
}

/// A result together with the input generation it answers
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Published {
    pub generation: u64,
    pub result: AreaSetResult,
    /// Whether every distance has been filled in
    pub distances_complete: bool,
    /// Why the computation for `generation` failed; the result is then incomplete
    pub error: Option<String>,
}

impl Published {
    fn failed(generation: u64, result: AreaSetResult, error: &DataError) -> Self {
        Self {
            generation,
            result,
            distances_complete: true,
            error: Some(error.to_string()),
        }
    }
}

/// What [`SelectedAreaSet::run_once`] did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The published result was already current
    Idle,
    Published,
    /// Newer input arrived; the partial work was dropped
    Interrupted,
}

#[derive(Debug)]
struct AreaSetState {
    areas: Vec<ApRect>,
    window: Option<(i64, i64)>,
    /// Bumped on every input change
    generation: u64,
    published: Published,
}

/// Polls the state gate on behalf of a running computation
struct Interrupter<'g, 'a> {
    guard: &'g mut WriteGuard<'a, AreaSetState>,
    shutdown: &'g AtomicBool,
}

impl Interrupter<'_, '_> {
    fn check(&mut self) -> Result<()> {
        if self.shutdown.load(Ordering::Relaxed) || self.guard.is_writing_holding_up_writing_threads() {
            return Err(DataError::Interrupted);
        }
        if self.guard.is_writing_holding_up_reading_threads() {
            self.guard.pause_for_reading_threads();
        }
        Ok(())
    }
}

/// The current area selection and its incrementally computed result
pub struct SelectedAreaSet {
    index: Arc<ReadWriteThreadManager<TrailIndex>>,
    state: ReadWriteThreadManager<AreaSetState>,
    pending: Mutex<bool>,
    pending_cond: Condvar,
    published_lock: Mutex<()>,
    published_cond: Condvar,
    shutdown: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl SelectedAreaSet {
    pub fn new(index: Arc<ReadWriteThreadManager<TrailIndex>>) -> Self {
        Self {
            index,
            state: ReadWriteThreadManager::new(AreaSetState {
                areas: Vec::new(),
                window: None,
                generation: 0,
                published: Published {
                    generation: 0,
                    result: AreaSetResult::Empty,
                    distances_complete: true,
                    error: None,
                },
            }),
            pending: Mutex::new(false),
            pending_cond: Condvar::new(),
            published_lock: Mutex::new(()),
            published_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Apply `change` to the inputs; it returns whether anything actually changed
    fn update(&self, change: impl FnOnce(&mut AreaSetState) -> bool) {
        let mut state = self.state.write();
        if change(&mut state) {
            state.generation += 1;
            tracing::debug!("Area selection changed, generation {}", state.generation);
        }
        drop(state);
        *lock(&self.pending) = true;
        self.pending_cond.notify_all();
    }

    pub fn add_area(&self, area: ApRect) {
        self.update(|state| {
            state.areas.push(area);
            true
        });
    }

    /// Remove the area at `index`, returning false if there is none
    pub fn remove_area(&self, index: usize) -> bool {
        let mut removed = false;
        self.update(|state| {
            removed = index < state.areas.len();
            if removed {
                state.areas.remove(index);
            }
            removed
        });
        removed
    }

    pub fn set_areas(&self, areas: Vec<ApRect>) {
        self.update(|state| {
            if state.areas == areas {
                return false;
            }
            state.areas = areas;
            true
        });
    }

    /// Restrict results to `[start, end)`, or lift the restriction with `None`
    pub fn set_requested_time(&self, window: Option<(i64, i64)>) {
        self.update(|state| {
            if state.window == window {
                return false;
            }
            state.window = window;
            true
        });
    }

    /// Recompute with unchanged inputs, e.g. after new fixes were ingested
    pub fn refresh(&self) {
        self.update(|_| true);
    }

    pub fn areas(&self) -> Vec<ApRect> {
        self.state.read().areas.clone()
    }

    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Latest published result, which may answer an older generation
    pub fn published(&self) -> Published {
        self.state.read().published.clone()
    }

    /// Wait until the result for the current inputs is complete, distances included
    ///
    /// A failed computation also ends the wait, with [`Published::error`] set.
    pub fn wait_for_result(&self, timeout: Duration) -> Option<Published> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let state = self.state.read();
                if state.published.generation == state.generation && state.published.distances_complete {
                    return Some(state.published.clone());
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let guard = lock(&self.published_lock);
            let _ = self
                .published_cond
                .wait_timeout(guard, (deadline - now).min(WAIT_POLL_INTERVAL))
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn notify_published(&self) {
        let _guard = lock(&self.published_lock);
        self.published_cond.notify_all();
    }

    /// Bring the published result up to date with the inputs, in the calling thread
    pub fn run_once(&self) -> Result<RunOutcome> {
        #[cfg(feature = "profiling")]
        profiling::scope!("area_set::run_once");

        // Index before state: the index writer never waits on the state gate
        let index = self.index.read();
        let mut state = self.state.write();
        let generation = state.generation;
        if state.published.generation == generation && state.published.distances_complete {
            return Ok(RunOutcome::Idle);
        }

        let mut interrupter = Interrupter {
            guard: &mut state,
            shutdown: &self.shutdown,
        };

        if interrupter.guard.published.generation != generation {
            let areas = interrupter.guard.areas.clone();
            let window = interrupter.guard.window;
            let computed = {
                let mut poll = || interrupter.check();
                compute(&index, &areas, window, &mut poll)
            };
            match computed {
                Ok(result) => {
                    tracing::debug!(
                        "Published {} results for {} areas, generation {generation}",
                        result.len(),
                        areas.len()
                    );
                    interrupter.guard.published = Published {
                        generation,
                        result,
                        distances_complete: false,
                        error: None,
                    };
                }
                Err(DataError::Interrupted) => {
                    tracing::debug!("Computation for generation {generation} interrupted");
                    return Ok(RunOutcome::Interrupted);
                }
                Err(e) => {
                    interrupter.guard.published = Published::failed(generation, AreaSetResult::Empty, &e);
                    drop(state);
                    self.notify_published();
                    return Err(e);
                }
            }
            self.notify_published();
        }

        match fill_distances(&index, &mut interrupter) {
            Ok(()) => interrupter.guard.published.distances_complete = true,
            Err(DataError::Interrupted) => {
                tracing::debug!("Distances for generation {generation} interrupted");
                return Ok(RunOutcome::Interrupted);
            }
            Err(e) => {
                let result = std::mem::take(&mut interrupter.guard.published.result);
                interrupter.guard.published = Published::failed(generation, result, &e);
                drop(state);
                self.notify_published();
                return Err(e);
            }
        }
        drop(state);
        drop(index);
        self.notify_published();
        Ok(RunOutcome::Published)
    }

    /// Start the background worker, which recomputes whenever the inputs change
    pub fn spawn(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("selected-area-set".to_string())
            .spawn(move || this.run_worker())?;
        Ok(handle)
    }

    /// Ask the worker to stop; any running computation is abandoned
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _pending = lock(&self.pending);
        self.pending_cond.notify_all();
    }

    fn run_worker(&self) {
        tracing::debug!("Area set worker started");
        loop {
            {
                let mut pending = lock(&self.pending);
                while !*pending && !self.shutdown.load(Ordering::Relaxed) {
                    pending = self
                        .pending_cond
                        .wait(pending)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                if self.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                *pending = false;
            }

            loop {
                match self.run_once() {
                    Ok(RunOutcome::Interrupted) => {
                        if self.shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        // Give the waiting writer a chance to take the gate
                        thread::yield_now();
                    }
                    Ok(_) => break,
                    Err(e) => {
                        tracing::warn!("Area set computation failed, published as an error: {e}");
                        break;
                    }
                }
            }
        }
        tracing::debug!("Area set worker stopped");
    }
}

type Poll<'p> = &'p mut dyn FnMut() -> Result<()>;

fn compute(
    index: &TrailIndex,
    areas: &[ApRect],
    window: Option<(i64, i64)>,
    poll: Poll<'_>,
) -> Result<AreaSetResult> {
    let (start, end) = window.unwrap_or((i64::MIN, i64::MAX));
    match areas {
        [] => Ok(AreaSetResult::Empty),
        [area] => Ok(AreaSetResult::TimeRanges(
            index.time_ranges_for_area(area, start, end, poll)?.into_vec(),
        )),
        _ => Ok(AreaSetResult::Paths(index.find_api_paths(areas, start, end, poll)?)),
    }
}

/// Fill in the distance of every published entry that still lacks one
fn fill_distances(index: &TrailIndex, interrupter: &mut Interrupter<'_, '_>) -> Result<()> {
    #[cfg(feature = "profiling")]
    profiling::scope!("area_set::fill_distances");

    let mut i = 0;
    while let Some((start, end, dist_m)) = interrupter.guard.published.result.entry(i) {
        if dist_m.is_none() {
            let depth = distance_depth(index, &interrupter.guard.published.result, i)?;
            let distance_m = index.distance_for_range(start, end, depth, || interrupter.check())?;
            interrupter.guard.published.result.set_distance(i, distance_m);
        }
        i += 1;
    }
    Ok(())
}

/// Depth of the panels an entry was found at; distances are walked at the same depth
fn distance_depth(index: &TrailIndex, result: &AreaSetResult, i: usize) -> Result<u8> {
    let ap = match result {
        AreaSetResult::Empty => return Ok(0),
        AreaSetResult::TimeRanges(ranges) => ranges.get(i).map(|r| r.start_pos.ap),
        AreaSetResult::Paths(paths) => paths
            .get(i)
            .and_then(|p| p.areas.first())
            .map(|info| info.end_pos.ap),
    };
    match ap {
        Some(ap) => Ok(index.area_panels.get_row(ap)?.depth()),
        None => Ok(0),
    }
}

#[inline]
fn area_contains(area: &ApRect, rect: &ApRect) -> bool {
    area.min().x <= rect.min().x
        && area.min().y <= rect.min().y
        && rect.max().x <= area.max().x
        && rect.max().y <= area.max().y
}

#[inline]
fn area_center(area: &ApRect) -> (f64, f64) {
    (
        (area.min().x + area.max().x) as f64 / 2.0,
        (area.min().y + area.max().y) as f64 / 2.0,
    )
}

#[inline]
fn squared_distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)
}

/// Index of the first range starting strictly after `time`
fn first_starting_after(ranges: &[AreaTimeRange], time: i64) -> Option<usize> {
    let i = ranges.partition_point(|r| r.start_time <= time);
    (i < ranges.len()).then_some(i)
}

/// Index of the last range starting strictly before `time`
fn last_starting_before(ranges: &[AreaTimeRange], time: i64) -> Option<usize> {
    ranges.partition_point(|r| r.start_time < time).checked_sub(1)
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl TrailIndex {
    /// Depth whose panels cover `area` with a handful of panels per side
    fn query_depth(&self, area: &ApRect) -> u8 {
        let side = area.width().min(area.height());
        let mut depth = 0;
        while depth < self.widths.max_depth()
            && self
                .widths
                .units_at(depth + 1)
                .is_ok_and(|units| units * QUERY_PANELS_PER_SIDE <= side)
        {
            depth += 1;
        }
        depth
    }

    /// Panels covering `area` with data in `[start, end)`
    ///
    /// A panel fully inside the area is taken as a whole; otherwise the descent stops at
    /// `depth`, so boundary panels may stick out of the area by less than one panel.
    fn collect_area_panels(
        &self,
        area: &ApRect,
        start: i64,
        end: i64,
        depth: u8,
        poll: Poll<'_>,
    ) -> Result<Vec<ApId>> {
        let mut panels = Vec::new();
        let root = self.root_panel();
        let root_panel = self.area_panels.get_row(root)?;
        let Some(tree) = root_panel.time_tree() else {
            return Ok(panels);
        };
        if !root_panel.overlaps_area(&self.widths, area)?
            || !self.time_trees.intersects_time(tree, start, end)?.intersects()
        {
            return Ok(panels);
        }

        let mut stack = vec![root];
        while let Some(ap) = stack.pop() {
            poll()?;
            let panel = self.area_panels.get_row(ap)?;
            if panel.depth() <= depth || area_contains(area, &panel.rect(&self.widths)?) {
                panels.push(ap);
                continue;
            }
            let mut from_index = 0;
            while let Some((slot, child)) = self.get_first_overlapping_sub_panel(ap, area, start, end, from_index)? {
                stack.push(child);
                from_index = slot + 1;
            }
        }
        Ok(panels)
    }

    /// Every stretch of `[start, end)` spent inside `area`
    pub fn time_ranges_for_area(
        &self,
        area: &ApRect,
        start: i64,
        end: i64,
        poll: Poll<'_>,
    ) -> Result<TimeRangeSet> {
        let mut ranges = TimeRangeSet::new();
        if start >= end {
            return Ok(ranges);
        }
        let depth = self.query_depth(area);
        for ap in self.collect_area_panels(area, start, end, depth, poll)? {
            let Some(tree) = self.area_panels.get_row(ap)?.time_tree() else {
                continue;
            };
            self.collect_time_ranges(ap, tree, start, end, &mut ranges, poll)?;
        }
        Ok(ranges)
    }

    fn collect_time_ranges(
        &self,
        ap: ApId,
        node: TtId,
        start: i64,
        end: i64,
        ranges: &mut TimeRangeSet,
        poll: Poll<'_>,
    ) -> Result<()> {
        poll()?;
        let tree = self.time_trees.get_row(node)?;
        let (lo, hi) = (start.max(tree.min_time()), end.min(tree.max_time()));
        if lo >= hi || !self.time_trees.intersects_time(node, lo, hi)?.intersects() {
            return Ok(());
        }

        let tolerance = self.config().range_fuzziness;
        if !tree.is_leaf() && !accept_fuzzy(tree.time_jump(), hi - lo, tolerance) {
            for child in tree.sub_nodes() {
                self.collect_time_ranges(ap, child, start, end, ranges, poll)?;
            }
            return Ok(());
        }

        let Some((first, last)) = self.time_trees.find_overlapping_range(node, lo, hi, tolerance)? else {
            return Ok(());
        };
        let first = self.time_trees.leftmost_leaf(first)?;
        let last = self.time_trees.rightmost_leaf(last)?;
        let cut_start = self.time_trees.calc_time_range_cut_start(&self.area_panels, first)?;
        let cut_end = self.time_trees.calc_time_range_cut_end(&self.area_panels, last)?;
        let (range_start, range_end) = (cut_start.max(start), cut_end.min(end));
        if range_start >= range_end {
            return Ok(());
        }

        ranges.insert(AreaTimeRange {
            start_time: range_start,
            end_time: range_end,
            full_start_time: self.time_trees.get_row(first)?.min_time(),
            full_end_time: self.time_trees.get_row(last)?.max_time(),
            start_pos: TimePosition { ap, tt: first },
            end_pos: TimePosition { ap, tt: last },
            dist_m: None,
        });
        Ok(())
    }

    /// Trips through every area of `areas` in order, within `[start, end)`
    ///
    /// Each path starts at the latest exit from the first area that still precedes the next
    /// area, so going back and forth before leaving does not produce extra paths.
    pub fn find_api_paths(
        &self,
        areas: &[ApRect],
        start: i64,
        end: i64,
        poll: Poll<'_>,
    ) -> Result<Vec<Path>> {
        let n = areas.len();
        if n < 2 {
            return Ok(Vec::new());
        }
        let mut visits = Vec::with_capacity(n);
        for area in areas {
            visits.push(self.time_ranges_for_area(area, start, end, poll)?.into_vec());
        }

        let mut paths = Vec::new();
        let mut chain = vec![0usize; n];
        let mut after = i64::MIN;
        'paths: loop {
            poll()?;
            let Some(first) = first_starting_after(&visits[0], after) else {
                break;
            };
            chain[0] = first;
            for k in 1..n {
                poll()?;
                let prev_start = visits[k - 1][chain[k - 1]].start_time;
                let Some(next) = first_starting_after(&visits[k], prev_start) else {
                    break 'paths;
                };
                chain[k] = next;
                // Earlier visits move up to the latest one still before their successor
                for j in (0..k).rev() {
                    let limit = visits[j + 1][chain[j + 1]].start_time;
                    if let Some(latest) = last_starting_before(&visits[j], limit) {
                        chain[j] = chain[j].max(latest);
                    }
                }
            }

            paths.push(self.build_path(areas, &visits, &chain, poll)?);
            after = visits[n - 1][chain[n - 1]].start_time;
        }
        tracing::debug!("Found {} paths through {n} areas", paths.len());
        Ok(paths)
    }

    fn build_path(
        &self,
        areas: &[ApRect],
        visits: &[Vec<AreaTimeRange>],
        chain: &[usize],
        poll: Poll<'_>,
    ) -> Result<Path> {
        let infos: Vec<AreaPanelInfo> = chain
            .iter()
            .enumerate()
            .map(|(area_index, &range_index)| {
                let range = &visits[area_index][range_index];
                AreaPanelInfo {
                    area_index,
                    range_index,
                    start_pos: range.start_pos,
                    end_pos: range.end_pos,
                    start_time: range.start_time,
                    end_time: range.end_time,
                }
            })
            .collect();

        let last = infos.len() - 1;
        let start_time = self.calc_actual_start_or_end(&infos[0], &areas[0], Direction::LatestBefore, poll)?;
        let end_time = self.calc_actual_start_or_end(&infos[last], &areas[last], Direction::EarliestAfter, poll)?;
        Ok(Path {
            start_time: start_time.min(end_time),
            end_time: end_time.max(start_time),
            areas: infos,
            dist_m: None,
        })
    }

    /// Where a path really leaves (`LatestBefore`) or reaches (`EarliestAfter`) an area
    ///
    /// Starting from the visit's exit (or entry) leaf, follows the panel links away from the
    /// rest of the path while the trail keeps moving away from (or towards) the area's center
    /// fast enough, so the boundary lands where the trip actually begins or ends.
    fn calc_actual_start_or_end(
        &self,
        visit: &AreaPanelInfo,
        area: &ApRect,
        direction: Direction,
        poll: Poll<'_>,
    ) -> Result<i64> {
        let center = area_center(area);
        let min_speed_squared = self.config().min_path_speed_m_per_s.powi(2);
        let max_units = self.widths.max_ap_units();

        let (mut pos, mut boundary) = match direction {
            Direction::LatestBefore => (visit.end_pos, visit.end_time),
            Direction::EarliestAfter => (visit.start_pos, visit.start_time),
        };
        for _ in 0..self.config().max_path_trim_steps {
            poll()?;
            let Some(next) = self.linked_leaf(pos.tt, direction)? else {
                break;
            };
            let (time, next_time) = match direction {
                Direction::LatestBefore => (
                    self.time_trees.calc_time_range_cut_end(&self.area_panels, pos.tt)?,
                    self.time_trees.calc_time_range_cut_end(&self.area_panels, next.tt)?,
                ),
                Direction::EarliestAfter => (
                    self.time_trees.calc_time_range_cut_start(&self.area_panels, pos.tt)?,
                    self.time_trees.calc_time_range_cut_start(&self.area_panels, next.tt)?,
                ),
            };
            let left_visit = match direction {
                Direction::LatestBefore => next_time < visit.start_time,
                Direction::EarliestAfter => next_time > visit.end_time,
            };
            if left_visit {
                break;
            }

            let here = self.area_panels.get_row(pos.ap)?.center(&self.widths)?;
            let there = self.area_panels.get_row(next.ap)?.center(&self.widths)?;
            if squared_distance(there, center) > squared_distance(here, center) {
                break;
            }
            let seconds = (time - next_time).abs().max(1) as f64;
            let meters = utils::ap_distance_m(here.0, here.1, there.0, there.1, max_units);
            if (meters / seconds).powi(2) < min_speed_squared {
                break;
            }

            pos = next;
            boundary = next_time;
        }
        Ok(boundary)
    }

    /// Leaf of the panel occupied right before (or after) the leaf `tt`
    fn linked_leaf(&self, tt: TtId, direction: Direction) -> Result<Option<TimePosition>> {
        let leaf = self.time_trees.get_row(tt)?;
        let (link, time) = match direction {
            Direction::LatestBefore => (leaf.prev_ap(), leaf.min_time()),
            Direction::EarliestAfter => (leaf.next_ap(), leaf.max_time() - 1),
        };
        let Some(ap) = link else {
            return Ok(None);
        };
        let root = self.area_panels.get_row(ap)?.time_tree().ok_or_else(|| {
            DataError::Corrupt(format!("panel {ap} is linked from {tt} but has no time tree"))
        })?;
        Ok(self
            .time_trees
            .find_leaf_for_time(root, time)?
            .map(|tt| TimePosition { ap, tt }))
    }
}
