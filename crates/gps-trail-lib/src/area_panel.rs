//! Area panels: a depth-bounded quadtree over the integer world
//!
//! The root panel covers the whole world at depth `max_depth`; every level down halves the
//! side length until depth 0, the smallest panel. Panels are created lazily the first time a
//! point falls inside them and are never deleted. Each panel owns a [`crate::TimeTree`] recording
//! when it was occupied, so ancestors carry the time coverage of all their descendants.

use crate::cache::RowCache;
use crate::row::{Column, ColumnType, Row, RowData, RowKey, RowLayout};
use crate::time_tree::{Direction, TtId};
use crate::trail::TrailIndex;
use crate::{DataError, Result};
use geo::{Coord, Rect};
use smallvec::{SmallVec, smallvec};
use std::fmt;
use std::sync::LazyLock;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Children per side of a panel
pub const NUM_SUB_PANELS_PER_SIDE: i64 = 2;

/// Children of a panel
pub const NUM_SUB_PANELS: usize = (NUM_SUB_PANELS_PER_SIDE * NUM_SUB_PANELS_PER_SIDE) as usize;

/// Half-open rectangle `[min, max)` in area-panel units
pub type ApRect = Rect<i64>;

/// Build an [`ApRect`] from two corners in any order
pub fn ap_rect(x1: i64, y1: i64, x2: i64, y2: i64) -> ApRect {
    Rect::new(Coord { x: x1, y: y1 }, Coord { x: x2, y: y2 })
}

/// Id of an [`AreaPanel`] row
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ApId(pub u32);

impl RowKey for ApId {
    #[inline]
    fn from_index(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ApId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ap#{}", self.0)
    }
}

/// Panel side length for every depth, built once per index
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepthWidths {
    widths: Vec<i64>,
}

impl DepthWidths {
    pub fn new(max_depth: u8, depth_0_units: i64) -> Self {
        let widths = (0..=max_depth)
            .map(|depth| depth_0_units << depth)
            .collect();
        Self { widths }
    }

    /// Side of a panel at `depth`, failing for depths above the root
    #[inline]
    pub fn units_at(&self, depth: u8) -> Result<i64> {
        self.widths.get(depth as usize).copied().ok_or_else(|| {
            DataError::Corrupt(format!(
                "depth {depth} is above the root depth {}",
                self.max_depth()
            ))
        })
    }

    #[inline]
    pub fn max_depth(&self) -> u8 {
        (self.widths.len() - 1) as u8
    }

    /// Side length of the world
    #[inline]
    pub fn max_ap_units(&self) -> i64 {
        self.widths.last().copied().unwrap_or_default()
    }
}

const X: usize = 0;
const Y: usize = 1;
const DEPTH: usize = 2;
const TIME_TREE: usize = 3;
const SUB_PANELS: usize = 4;

static AREA_PANEL_LAYOUT: LazyLock<RowLayout> = LazyLock::new(|| {
    RowLayout::new(&[
        Column::new("x", ColumnType::Int32),
        Column::new("y", ColumnType::Int32),
        Column::new("depth", ColumnType::Byte),
        Column::new("time_tree", ColumnType::Int32),
        Column::new("sub_panel_0", ColumnType::Int32),
        Column::new("sub_panel_1", ColumnType::Int32),
        Column::new("sub_panel_2", ColumnType::Int32),
        Column::new("sub_panel_3", ColumnType::Int32),
    ])
});

#[inline]
fn col(index: usize) -> &'static Column {
    AREA_PANEL_LAYOUT.column(index)
}

/// A quadtree node over `[x, x + width) x [y, y + width)` at a given depth
#[derive(Clone, Debug, PartialEq)]
pub struct AreaPanel {
    data: RowData,
}

impl Row for AreaPanel {
    type Id = ApId;
    const TABLE: &'static str = "area_panel";

    fn layout() -> &'static RowLayout {
        &AREA_PANEL_LAYOUT
    }

    fn from_data(data: RowData) -> Self {
        Self { data }
    }

    fn data(&self) -> &RowData {
        &self.data
    }

    fn data_mut(&mut self) -> &mut RowData {
        &mut self.data
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl AreaPanel {
    pub fn new(x: i64, y: i64, depth: u8) -> Self {
        let mut data = RowData::new(&AREA_PANEL_LAYOUT);
        data.set_int(col(X), x as i32);
        data.set_int(col(Y), y as i32);
        data.set_byte(col(DEPTH), depth);
        data.set_ref(col(TIME_TREE), None);
        for i in 0..NUM_SUB_PANELS {
            data.set_ref(col(SUB_PANELS + i), None);
        }
        Self { data }
    }

    #[inline]
    pub fn x(&self) -> i64 {
        self.data.get_int(col(X)) as i64
    }

    #[inline]
    pub fn y(&self) -> i64 {
        self.data.get_int(col(Y)) as i64
    }

    #[inline]
    pub fn depth(&self) -> u8 {
        self.data.get_byte(col(DEPTH))
    }

    #[inline]
    pub fn time_tree(&self) -> Option<TtId> {
        self.data.get_ref(col(TIME_TREE)).map(TtId)
    }

    #[inline]
    pub fn sub_panel(&self, index: usize) -> Option<ApId> {
        self.data.get_ref(col(SUB_PANELS + index)).map(ApId)
    }

    fn set_time_tree(&mut self, id: TtId) {
        self.data.set_ref(col(TIME_TREE), Some(id.0));
    }

    fn set_sub_panel(&mut self, index: usize, id: ApId) {
        self.data.set_ref(col(SUB_PANELS + index), Some(id.0));
    }

    #[inline]
    pub fn width(&self, widths: &DepthWidths) -> Result<i64> {
        widths.units_at(self.depth())
    }

    pub fn rect(&self, widths: &DepthWidths) -> Result<ApRect> {
        let width = self.width(widths)?;
        Ok(ap_rect(self.x(), self.y(), self.x() + width, self.y() + width))
    }

    /// Center of the panel in AP units
    pub fn center(&self, widths: &DepthWidths) -> Result<(f64, f64)> {
        let half = self.width(widths)? as f64 / 2.0;
        Ok((self.x() as f64 + half, self.y() as f64 + half))
    }

    pub fn contains_point(&self, widths: &DepthWidths, x: i64, y: i64) -> Result<bool> {
        let width = self.width(widths)?;
        Ok(x >= self.x() && x < self.x() + width && y >= self.y() && y < self.y() + width)
    }

    pub fn overlaps_area(&self, widths: &DepthWidths, area: &ApRect) -> Result<bool> {
        let width = self.width(widths)?;
        Ok(area.min().x < self.x() + width
            && area.max().x > self.x()
            && area.min().y < self.y() + width
            && area.max().y > self.y())
    }

    /// Bitmask of the sub panels (bit `x_index + y_index * 2`) that `area` touches
    pub fn get_overlapping_map(&self, widths: &DepthWidths, area: &ApRect) -> Result<u8> {
        if self.depth() == 0 || !self.overlaps_area(widths, area)? {
            return Ok(0);
        }
        let half = self.width(widths)? / NUM_SUB_PANELS_PER_SIDE;
        let (mid_x, mid_y) = (self.x() + half, self.y() + half);
        let x_halves = [area.min().x < mid_x, area.max().x > mid_x];
        let y_halves = [area.min().y < mid_y, area.max().y > mid_y];

        let mut map = 0;
        for (yi, &y_hit) in y_halves.iter().enumerate() {
            for (xi, &x_hit) in x_halves.iter().enumerate() {
                if x_hit && y_hit {
                    map |= 1 << (xi + yi * NUM_SUB_PANELS_PER_SIDE as usize);
                }
            }
        }
        Ok(map)
    }

    /// Index of the sub panel containing `(x, y)`
    pub fn child_index(&self, widths: &DepthWidths, x: i64, y: i64) -> Result<usize> {
        let half = self.half_width(widths)?;
        let xi = ((x - self.x()) / half).clamp(0, NUM_SUB_PANELS_PER_SIDE - 1);
        let yi = ((y - self.y()) / half).clamp(0, NUM_SUB_PANELS_PER_SIDE - 1);
        Ok((xi + yi * NUM_SUB_PANELS_PER_SIDE) as usize)
    }

    /// Lower-left corner of the sub panel at `index`
    pub fn child_origin(&self, widths: &DepthWidths, index: usize) -> Result<(i64, i64)> {
        let half = self.half_width(widths)?;
        let xi = index as i64 % NUM_SUB_PANELS_PER_SIDE;
        let yi = index as i64 / NUM_SUB_PANELS_PER_SIDE;
        Ok((self.x() + xi * half, self.y() + yi * half))
    }

    fn half_width(&self, widths: &DepthWidths) -> Result<i64> {
        if self.depth() == 0 {
            return Err(DataError::Corrupt(
                "depth 0 panels have no sub panels".to_string(),
            ));
        }
        Ok(self.width(widths)? / NUM_SUB_PANELS_PER_SIDE)
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl RowCache<AreaPanel> {
    /// The sub panel at `index`, failing on an index that cannot exist
    pub fn get_sub_area_panel(&self, ap: ApId, index: usize) -> Result<Option<ApId>> {
        if index >= NUM_SUB_PANELS {
            return Err(DataError::Corrupt(format!(
                "panel {ap} has no sub panel slot {index}"
            )));
        }
        Ok(self.get_row(ap)?.sub_panel(index))
    }

    /// Existing sub panels of `ap` with their slot indices
    pub fn sub_panels(&self, ap: ApId) -> Result<SmallVec<[(usize, ApId); NUM_SUB_PANELS]>> {
        let panel = self.get_row(ap)?;
        Ok((0..NUM_SUB_PANELS)
            .filter_map(|i| panel.sub_panel(i).map(|id| (i, id)))
            .collect())
    }

    /// Check the structure of loaded panels before any traversal relies on it
    ///
    /// Every sub panel sits one level below its parent at the origin of its slot, which also
    /// rules out cycles. The root must be the only panel at `widths.max_depth()`.
    pub fn validate(&self, widths: &DepthWidths, time_tree_count: usize) -> Result<()> {
        let corrupt = |ap: ApId, what: String| Err(DataError::Corrupt(format!("panel {ap} {what}")));
        let world = widths.max_ap_units();
        for (ap, panel) in self.iter() {
            let depth = panel.depth();
            let width = panel.width(widths)?;
            if (ap.0 == 0) != (depth == widths.max_depth()) {
                return corrupt(ap, format!("has depth {depth} but the root depth is {}", widths.max_depth()));
            }
            let (x, y) = (panel.x(), panel.y());
            if x < 0 || y < 0 || x % width != 0 || y % width != 0 || x + width > world || y + width > world {
                return corrupt(ap, format!("at ({x}, {y}) is not aligned to its width {width}"));
            }
            if let Some(tree) = panel.time_tree().filter(|tree| tree.0 as usize >= time_tree_count) {
                return corrupt(ap, format!("points at the missing time tree {tree}"));
            }
            for slot in 0..NUM_SUB_PANELS {
                let Some(child) = panel.sub_panel(slot) else {
                    continue;
                };
                if depth == 0 {
                    return corrupt(ap, format!("is at depth 0 but has the sub panel {child}"));
                }
                if child.0 as usize >= self.len() {
                    return corrupt(ap, format!("points at the missing sub panel {child}"));
                }
                let child_panel = self.get_row(child)?;
                if child_panel.depth() != depth - 1
                    || (child_panel.x(), child_panel.y()) != panel.child_origin(widths, slot)?
                {
                    return corrupt(ap, format!("has the misplaced sub panel {child} in slot {slot}"));
                }
            }
        }
        Ok(())
    }
}

/// Ranking of a panel for a timestamp: containing panels first, then by distance in seconds
type TimeScore = (u8, i64);

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl TrailIndex {
    /// Record a fix at `(x, y, time)` in `ap` and, recursively, in the sub panels containing it
    ///
    /// `prev_ap` is the panel at the same depth that received the previous fix, located at
    /// `(prev_x, prev_y, last_time)`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_point_to_panel(
        &mut self,
        ap: ApId,
        prev_ap: Option<ApId>,
        prev_x: i64,
        prev_y: i64,
        x: i64,
        y: i64,
        last_time: i64,
        time: i64,
        distance_m: f64,
    ) -> Result<()> {
        let panel = self.area_panels.get_row(ap)?;
        let root = panel.time_tree();

        let new_root = if prev_ap == Some(ap) {
            self.time_trees
                .add_segment_for_point(root, last_time + 1, time + 1, None, distance_m)?
        } else {
            let start = if prev_ap.is_some() { last_time + 1 } else { time };
            match root {
                None => self
                    .time_trees
                    .add_segment_for_point(None, start, time + 1, prev_ap, distance_m)?,
                // Coming back to a panel always starts a new leaf so its links stay exact
                Some(root) => self
                    .time_trees
                    .append_segment(root, start, time + 1, prev_ap, distance_m)?,
            }
        };
        if root != Some(new_root) {
            self.area_panels.get_row_mut(ap)?.set_time_tree(new_root);
        }

        if let Some(prev_ap) = prev_ap.filter(|&prev| prev != ap) {
            let prev_root = self.area_panels.get_row(prev_ap)?.time_tree().ok_or_else(|| {
                DataError::Corrupt(format!("previous panel {prev_ap} has no time tree"))
            })?;
            self.time_trees.extend_max_time(prev_root, time + 1)?;
            self.time_trees.set_next_ap_on_rightmost_path(prev_root, ap)?;
        }

        let panel = self.area_panels.get_row(ap)?;
        if panel.depth() == 0 {
            return Ok(());
        }

        let depth = panel.depth();
        let index = panel.child_index(&self.widths, x, y)?;
        let child = match panel.sub_panel(index) {
            Some(child) => child,
            None => {
                let (cx, cy) = panel.child_origin(&self.widths, index)?;
                let child = self.area_panels.new_row(AreaPanel::new(cx, cy, depth - 1));
                self.area_panels.get_row_mut(ap)?.set_sub_panel(index, child);
                child
            }
        };

        let prev_child = match prev_ap {
            Some(prev_ap) => {
                let prev_panel = self.area_panels.get_row(prev_ap)?;
                let prev_index = prev_panel.child_index(&self.widths, prev_x, prev_y)?;
                Some(prev_panel.sub_panel(prev_index).ok_or_else(|| {
                    DataError::Corrupt(format!(
                        "previous panel {prev_ap} is missing the sub panel {prev_index} of the previous fix"
                    ))
                })?)
            }
            None => None,
        };

        self.add_point_to_panel(child, prev_child, prev_x, prev_y, x, y, last_time, time, distance_m)
    }

    /// First sub panel of `ap`, starting at slot `from_index`, overlapping both `area` and
    /// `[start, end)`
    pub fn get_first_overlapping_sub_panel(
        &self,
        ap: ApId,
        area: &ApRect,
        start: i64,
        end: i64,
        from_index: usize,
    ) -> Result<Option<(usize, ApId)>> {
        let map = self.area_panels.get_row(ap)?.get_overlapping_map(&self.widths, area)?;
        for index in from_index..NUM_SUB_PANELS {
            if map & (1 << index) == 0 {
                continue;
            }
            let Some(child) = self.area_panels.get_sub_area_panel(ap, index)? else {
                continue;
            };
            let Some(tree) = self.area_panels.get_row(child)?.time_tree() else {
                continue;
            };
            if self.time_trees.intersects_time(tree, start, end)?.intersects() {
                return Ok(Some((index, child)));
            }
        }
        Ok(None)
    }

    /// Panel at `depth` holding `time`, or the nearest one in `direction` when no panel does
    ///
    /// Panels that were entered and left in the same second overlap in time, so every level
    /// keeps all candidates containing `time`. At the target depth the candidate whose cut
    /// range holds `time` wins.
    pub fn find_area_panel_for_time(
        &self,
        time: i64,
        depth: u8,
        direction: Direction,
    ) -> Result<Option<ApId>> {
        if self.area_panels.is_empty() {
            return Ok(None);
        }
        let root = ApId(0);
        let Some(root_score) = self.panel_time_score(root, time, direction, false)? else {
            return Ok(None);
        };

        let mut candidates: SmallVec<[(ApId, TimeScore); 8]> = smallvec![(root, root_score)];
        let mut level = self.widths.max_depth();
        while level > depth {
            let at_target = level - 1 == depth;
            let mut scored: SmallVec<[(ApId, TimeScore); 8]> = SmallVec::new();
            for &(candidate, _) in &candidates {
                for (_, child) in self.area_panels.sub_panels(candidate)? {
                    if let Some(score) = self.panel_time_score(child, time, direction, at_target)? {
                        scored.push((child, score));
                    }
                }
            }

            let Some(best) = scored.iter().map(|&(_, score)| score).min() else {
                return Err(DataError::Corrupt(format!(
                    "no sub panel at depth {} holds data {direction} {time}",
                    level - 1
                )));
            };
            scored.retain(|&mut (_, score)| if best.0 == 0 { score.0 == 0 } else { score == best });
            candidates = scored;
            level -= 1;
        }

        Ok(candidates
            .iter()
            .min_by_key(|&&(id, score)| (score, id))
            .map(|&(id, _)| id))
    }

    /// How well `ap` matches `time`, `None` when it has no data in `direction`
    fn panel_time_score(
        &self,
        ap: ApId,
        time: i64,
        direction: Direction,
        with_cut: bool,
    ) -> Result<Option<TimeScore>> {
        let Some(tree) = self.area_panels.get_row(ap)?.time_tree() else {
            return Ok(None);
        };
        if let Some(leaf) = self.time_trees.find_leaf_for_time(tree, time)? {
            if !with_cut {
                return Ok(Some((0, 0)));
            }
            let cut_start = self.time_trees.calc_time_range_cut_start(&self.area_panels, leaf)?;
            let cut_end = self.time_trees.calc_time_range_cut_end(&self.area_panels, leaf)?;
            let off_cut = if time < cut_start {
                cut_start - time
            } else if time >= cut_end {
                time - cut_end + 1
            } else {
                0
            };
            return Ok(Some((0, off_cut)));
        }
        match self.time_trees.get_nearest_time_point(tree, time, direction) {
            Ok(nearest) => Ok(Some((1, (nearest - time).abs()))),
            Err(DataError::OutOfRange { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trail::IndexConfig;

    fn scenario_index() -> TrailIndex {
        let mut index = TrailIndex::new(IndexConfig {
            max_depth: 1,
            depth_0_units: 1,
            ..IndexConfig::default()
        })
        .unwrap();
        index.add_point(0, 0, 100).unwrap();
        index.add_point(0, 0, 160).unwrap();
        index.add_point(1, 0, 220).unwrap();
        index
    }

    fn span(index: &TrailIndex, ap: ApId) -> (i64, i64) {
        let tree = index.area_panels.get_row(ap).unwrap().time_tree().unwrap();
        let tree = index.time_trees.get_row(tree).unwrap();
        (tree.min_time(), tree.max_time())
    }

    #[test]
    fn test_depth_widths() {
        let widths = DepthWidths::new(20, 1024);
        assert_eq!(widths.units_at(0).unwrap(), 1024);
        assert_eq!(widths.units_at(1).unwrap(), 2048);
        assert_eq!(widths.max_depth(), 20);
        assert_eq!(widths.max_ap_units(), 1 << 30);
        assert!(matches!(widths.units_at(21), Err(DataError::Corrupt(_))));
        assert!(matches!(
            AreaPanel::new(0, 0, 130).width(&widths),
            Err(DataError::Corrupt(_))
        ));
    }

    #[test]
    fn test_panel_geometry() {
        let widths = DepthWidths::new(2, 1);
        let panel = AreaPanel::new(0, 0, 2);
        assert_eq!(panel.width(&widths).unwrap(), 4);
        assert!(panel.contains_point(&widths, 3, 3).unwrap());
        assert!(!panel.contains_point(&widths, 4, 0).unwrap());

        assert_eq!(panel.child_index(&widths, 0, 0).unwrap(), 0);
        assert_eq!(panel.child_index(&widths, 3, 1).unwrap(), 1);
        assert_eq!(panel.child_index(&widths, 1, 2).unwrap(), 2);
        assert_eq!(panel.child_index(&widths, 2, 2).unwrap(), 3);
        assert_eq!(panel.child_origin(&widths, 3).unwrap(), (2, 2));

        assert!(panel.overlaps_area(&widths, &ap_rect(3, 3, 10, 10)).unwrap());
        assert!(!panel.overlaps_area(&widths, &ap_rect(4, 0, 10, 10)).unwrap());
    }

    #[test]
    fn test_overlapping_map() {
        let widths = DepthWidths::new(2, 1);
        let panel = AreaPanel::new(0, 0, 2);
        assert_eq!(panel.get_overlapping_map(&widths, &ap_rect(0, 0, 1, 1)).unwrap(), 0b0001);
        assert_eq!(panel.get_overlapping_map(&widths, &ap_rect(2, 0, 4, 1)).unwrap(), 0b0010);
        assert_eq!(panel.get_overlapping_map(&widths, &ap_rect(0, 0, 4, 1)).unwrap(), 0b0011);
        assert_eq!(panel.get_overlapping_map(&widths, &ap_rect(1, 1, 3, 3)).unwrap(), 0b1111);
        assert_eq!(panel.get_overlapping_map(&widths, &ap_rect(5, 5, 6, 6)).unwrap(), 0);

        let leaf = AreaPanel::new(0, 0, 0);
        assert_eq!(leaf.get_overlapping_map(&widths, &ap_rect(0, 0, 1, 1)).unwrap(), 0);
        assert!(leaf.child_index(&widths, 0, 0).is_err());
    }

    #[test]
    fn test_insertion_scenario() {
        let index = scenario_index();
        let root = ApId(0);
        assert_eq!(span(&index, root), (100, 221));

        let left = index.area_panels.get_sub_area_panel(root, 0).unwrap().unwrap();
        let right = index.area_panels.get_sub_area_panel(root, 1).unwrap().unwrap();
        assert_eq!(index.area_panels.get_sub_area_panel(root, 2).unwrap(), None);
        assert_eq!(span(&index, left), (100, 221));
        assert_eq!(span(&index, right), (161, 221));

        let left_tree = index.area_panels.get_row(left).unwrap().time_tree().unwrap();
        let right_tree = index.area_panels.get_row(right).unwrap().time_tree().unwrap();
        assert_eq!(index.time_trees.get_row(left_tree).unwrap().next_ap(), Some(right));
        assert_eq!(index.time_trees.get_row(right_tree).unwrap().prev_ap(), Some(left));

        // The shared seconds [161, 221) are split in the middle
        let cut_end = index
            .time_trees
            .calc_time_range_cut_end(&index.area_panels, left_tree)
            .unwrap();
        let cut_start = index
            .time_trees
            .calc_time_range_cut_start(&index.area_panels, right_tree)
            .unwrap();
        assert_eq!(cut_end, 191);
        assert_eq!(cut_start, 191);
    }

    #[test]
    fn test_invalid_sub_panel_slot() {
        let index = scenario_index();
        assert!(matches!(
            index.area_panels.get_sub_area_panel(ApId(0), 4),
            Err(DataError::Corrupt(_))
        ));
        assert!(matches!(
            index.area_panels.get_sub_area_panel(ApId(99), 0),
            Err(DataError::MissingRow { .. })
        ));
    }

    #[test]
    fn test_revisit_appends_new_leaf() {
        let mut index = scenario_index();
        index.add_point(0, 0, 300).unwrap();
        let left = index.area_panels.get_sub_area_panel(ApId(0), 0).unwrap().unwrap();
        let tree = index.area_panels.get_row(left).unwrap().time_tree().unwrap();
        let leaves = index.time_trees.get_all_bottom_level_time_trees(tree).unwrap();
        let spans: Vec<(i64, i64)> = leaves
            .iter()
            .map(|&id| {
                let leaf = index.time_trees.get_row(id).unwrap();
                (leaf.min_time(), leaf.max_time())
            })
            .collect();
        assert_eq!(spans, vec![(100, 221), (221, 301)]);
    }

    #[test]
    fn test_first_overlapping_sub_panel() {
        let index = scenario_index();
        let everywhere = ap_rect(0, 0, 2, 2);
        let (slot, _) = index
            .get_first_overlapping_sub_panel(ApId(0), &everywhere, 0, 1000, 0)
            .unwrap()
            .unwrap();
        assert_eq!(slot, 0);
        let (slot, _) = index
            .get_first_overlapping_sub_panel(ApId(0), &everywhere, 0, 1000, 1)
            .unwrap()
            .unwrap();
        assert_eq!(slot, 1);

        // Right panel only starts at 161
        assert_eq!(
            index
                .get_first_overlapping_sub_panel(ApId(0), &ap_rect(1, 0, 2, 1), 0, 150, 0)
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_find_area_panel_for_time() {
        let index = scenario_index();
        let left = index.area_panels.get_sub_area_panel(ApId(0), 0).unwrap();
        let right = index.area_panels.get_sub_area_panel(ApId(0), 1).unwrap();

        assert_eq!(index.find_area_panel_for_time(120, 0, Direction::LatestBefore).unwrap(), left);
        // Both panels hold 200, the cut decides
        assert_eq!(index.find_area_panel_for_time(170, 0, Direction::LatestBefore).unwrap(), left);
        assert_eq!(index.find_area_panel_for_time(200, 0, Direction::LatestBefore).unwrap(), right);
        assert_eq!(index.find_area_panel_for_time(1, 1, Direction::EarliestAfter).unwrap(), Some(ApId(0)));

        assert_eq!(index.find_area_panel_for_time(50, 0, Direction::EarliestAfter).unwrap(), left);
        assert_eq!(index.find_area_panel_for_time(50, 0, Direction::LatestBefore).unwrap(), None);
        assert!(index.find_area_panel_for_time(900, 0, Direction::LatestBefore).unwrap().is_some());
        assert_eq!(index.find_area_panel_for_time(900, 0, Direction::EarliestAfter).unwrap(), None);
    }

    /// (0,0) at 100, away to (3,3) at 110, back at 120, then on to (1,0) at 130
    fn revisit_index() -> TrailIndex {
        let mut index = TrailIndex::new(IndexConfig {
            max_depth: 2,
            depth_0_units: 1,
            ..IndexConfig::default()
        })
        .unwrap();
        for (x, y, time) in [(0, 0, 100), (3, 3, 110), (0, 0, 120), (1, 0, 130)] {
            index.add_point(x, y, time).unwrap();
        }
        index
    }

    #[test]
    fn test_find_area_panel_for_time_at_revisited_panel() {
        let index = revisit_index();
        let sub = |ap, slot| index.area_panels.get_sub_area_panel(ap, slot).unwrap().unwrap();
        let (near, far) = (sub(ApId(0), 0), sub(ApId(0), 3));
        let (home, side, away) = (sub(near, 0), sub(near, 1), sub(far, 3));
        let find = |time, depth| {
            index
                .find_area_panel_for_time(time, depth, Direction::LatestBefore)
                .unwrap()
        };

        // Home and away both hold every second of [101, 121); the cuts at 106 and 116 decide
        assert_eq!(find(105, 0), Some(home));
        assert_eq!(find(106, 0), Some(away));
        assert_eq!(find(115, 0), Some(away));
        assert_eq!(find(116, 0), Some(home));
        // Home and the next panel share [121, 131), cut at 126
        assert_eq!(find(125, 0), Some(home));
        assert_eq!(find(127, 0), Some(side));

        // The quadrants above them split the same way
        assert_eq!(find(115, 1), Some(far));
        assert_eq!(find(118, 1), Some(near));
    }
}
