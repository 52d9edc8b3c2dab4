//! Time tree: per-panel interval tree of occupied time spans
//!
//! A leaf records one contiguous stay `[min_time, max_time)` inside its area panel. Leaves are
//! only ever appended on the right, so the tree is grown with a weight-balanced append rule
//! instead of a general rebalancing scheme:
//!
//! - a new segment is pushed into the last child while that child is strictly lighter than
//!   its predecessor,
//! - otherwise it becomes a new last child if there is room,
//! - otherwise the whole node and the new segment become siblings under a fresh parent.
//!
//! Every inner node keeps the largest gap between consecutive children anywhere below it
//! (`time_jump`). A query range inside the node that is longer than that gap must hit data,
//! which is what lets range intersection finish on a single root-to-leaf path.

use crate::area_panel::{ApId, AreaPanel};
use crate::cache::RowCache;
use crate::row::{Column, ColumnType, Row, RowData, RowKey, RowLayout};
use crate::{DataError, Result};
use smallvec::SmallVec;
use std::fmt;
use std::sync::LazyLock;

/// Maximum number of children of a time tree node
pub const NUM_SUB_NODES: usize = 4;

/// Id of a [`TimeTree`] row
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TtId(pub u32);

impl RowKey for TtId {
    #[inline]
    fn from_index(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tt#{}", self.0)
    }
}

/// Which side of a timestamp to look for the nearest occupied second
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    LatestBefore,
    EarliestAfter,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::LatestBefore => f.write_str("latest before"),
            Direction::EarliestAfter => f.write_str("earliest after"),
        }
    }
}

/// Outcome of [`RowCache::intersects_time`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeOverlap {
    /// The query range ends before the tree starts
    RangeIsBefore,
    /// The query range starts after the tree ends
    RangeIsAfter,
    EnvelopsTimeTree,
    RangeOverlapsMinTime,
    RangeOverlapsMaxTime,
    /// The query range is longer than the widest gap in the tree
    IntersectsOverTimeJump,
    /// The query range falls entirely in a gap
    EmptyWithin,
    IntersectsWithin,
}

impl TimeOverlap {
    #[inline]
    pub fn intersects(self) -> bool {
        !matches!(
            self,
            TimeOverlap::RangeIsBefore | TimeOverlap::RangeIsAfter | TimeOverlap::EmptyWithin
        )
    }
}

const MIN_TIME: usize = 0;
const MAX_TIME: usize = 1;
const SUB_NODES: usize = 2;
const TOTAL_SUB_NODE_COUNT: usize = SUB_NODES + NUM_SUB_NODES;
const TIME_JUMP: usize = TOTAL_SUB_NODE_COUNT + 1;
const PREV_AP: usize = TIME_JUMP + 1;
const NEXT_AP: usize = PREV_AP + 1;
const NUM_POINTS: usize = NEXT_AP + 1;
const DISTANCE_M: usize = NUM_POINTS + 1;

static TIME_TREE_LAYOUT: LazyLock<RowLayout> = LazyLock::new(|| {
    RowLayout::new(&[
        Column::new("min_time_secs", ColumnType::Int64),
        Column::new("max_time_secs", ColumnType::Int64),
        Column::new("sub_node_0", ColumnType::Int32),
        Column::new("sub_node_1", ColumnType::Int32),
        Column::new("sub_node_2", ColumnType::Int32),
        Column::new("sub_node_3", ColumnType::Int32),
        Column::new("total_sub_node_count", ColumnType::Int32),
        Column::new("time_jump_secs", ColumnType::Int64),
        Column::new("prev_ap", ColumnType::Int32),
        Column::new("next_ap", ColumnType::Int32),
        Column::new("num_points", ColumnType::Int32),
        Column::new("distance_m", ColumnType::Float64),
    ])
});

#[inline]
fn col(index: usize) -> &'static Column {
    TIME_TREE_LAYOUT.column(index)
}

/// A time tree node
#[derive(Clone, Debug, PartialEq)]
pub struct TimeTree {
    data: RowData,
}

impl Row for TimeTree {
    type Id = TtId;
    const TABLE: &'static str = "time_tree";

    fn layout() -> &'static RowLayout {
        &TIME_TREE_LAYOUT
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

impl TimeTree {
    fn empty() -> Self {
        let mut tree = Self {
            data: RowData::new(&TIME_TREE_LAYOUT),
        };
        for i in 0..NUM_SUB_NODES {
            tree.set_sub_node(i, None);
        }
        tree.set_prev_ap(None);
        tree.set_next_ap(None);
        tree
    }

    /// A leaf holding the single segment `[start, end)`
    pub fn new_leaf(start: i64, end: i64, prev_ap: Option<ApId>, distance_m: f64) -> Self {
        let mut tree = Self::empty();
        tree.set_min_time(start);
        tree.set_max_time(end);
        tree.set_total_sub_node_count(1);
        tree.set_prev_ap(prev_ap);
        tree.set_num_points(1);
        tree.set_distance_m(distance_m);
        tree
    }

    #[inline]
    pub fn min_time(&self) -> i64 {
        self.data.get_long(col(MIN_TIME))
    }

    #[inline]
    pub fn max_time(&self) -> i64 {
        self.data.get_long(col(MAX_TIME))
    }

    #[inline]
    pub fn contains_time(&self, time: i64) -> bool {
        self.min_time() <= time && time < self.max_time()
    }

    #[inline]
    pub fn sub_node(&self, index: usize) -> Option<TtId> {
        self.data.get_ref(col(SUB_NODES + index)).map(TtId)
    }

    /// Children in time order
    pub fn sub_nodes(&self) -> SmallVec<[TtId; NUM_SUB_NODES]> {
        (0..NUM_SUB_NODES).map_while(|i| self.sub_node(i)).collect()
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.sub_node(0).is_none()
    }

    /// Number of leaf segments at or below this node
    #[inline]
    pub fn total_sub_node_count(&self) -> u32 {
        self.data.get_int(col(TOTAL_SUB_NODE_COUNT)) as u32
    }

    #[inline]
    pub fn time_jump(&self) -> i64 {
        self.data.get_long(col(TIME_JUMP))
    }

    /// Panel at the same depth occupied right before this span
    #[inline]
    pub fn prev_ap(&self) -> Option<ApId> {
        self.data.get_ref(col(PREV_AP)).map(ApId)
    }

    /// Panel at the same depth occupied right after this span
    #[inline]
    pub fn next_ap(&self) -> Option<ApId> {
        self.data.get_ref(col(NEXT_AP)).map(ApId)
    }

    #[inline]
    pub fn num_points(&self) -> u32 {
        self.data.get_int(col(NUM_POINTS)) as u32
    }

    #[inline]
    pub fn distance_m(&self) -> f64 {
        self.data.get_double(col(DISTANCE_M))
    }

    fn set_min_time(&mut self, value: i64) {
        self.data.set_long(col(MIN_TIME), value);
    }

    fn set_max_time(&mut self, value: i64) {
        self.data.set_long(col(MAX_TIME), value);
    }

    fn set_sub_node(&mut self, index: usize, id: Option<TtId>) {
        self.data.set_ref(col(SUB_NODES + index), id.map(|id| id.0));
    }

    fn set_total_sub_node_count(&mut self, value: u32) {
        self.data.set_int(col(TOTAL_SUB_NODE_COUNT), value as i32);
    }

    fn set_time_jump(&mut self, value: i64) {
        self.data.set_long(col(TIME_JUMP), value);
    }

    fn set_prev_ap(&mut self, id: Option<ApId>) {
        self.data.set_ref(col(PREV_AP), id.map(|id| id.0));
    }

    fn set_next_ap(&mut self, id: Option<ApId>) {
        self.data.set_ref(col(NEXT_AP), id.map(|id| id.0));
    }

    fn set_num_points(&mut self, value: u32) {
        self.data.set_int(col(NUM_POINTS), value as i32);
    }

    fn set_distance_m(&mut self, value: f64) {
        self.data.set_double(col(DISTANCE_M), value);
    }
}

/// Whether a node whose widest gap is `time_jump` counts as fully occupied over `span`
///
/// A zero tolerance never accepts an inner node, so exact queries always reach the leaves.
#[inline]
pub(crate) fn accept_fuzzy(time_jump: i64, span: i64, tolerance: f64) -> bool {
    tolerance > 0.0 && time_jump as f64 <= tolerance * span as f64
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl RowCache<TimeTree> {
    /// Record a stay of `[start, end)`, extending the latest leaf when it ends exactly at `start`
    ///
    /// Returns the (possibly new) root of the tree.
    pub fn add_segment_for_point(
        &mut self,
        root: Option<TtId>,
        start: i64,
        end: i64,
        prev_ap: Option<ApId>,
        distance_m: f64,
    ) -> Result<TtId> {
        let Some(root) = root else {
            return Ok(self.new_row(TimeTree::new_leaf(start, end, prev_ap, distance_m)));
        };
        if self.get_row(root)?.max_time() == start {
            self.extend_rightmost(root, end, distance_m)?;
            return Ok(root);
        }
        self.append_segment(root, start, end, prev_ap, distance_m)
    }

    /// Append `[start, end)` as a new leaf even when it touches the latest one
    pub fn append_segment(
        &mut self,
        root: TtId,
        start: i64,
        end: i64,
        prev_ap: Option<ApId>,
        distance_m: f64,
    ) -> Result<TtId> {
        let max = self.get_row(root)?.max_time();
        if start < max || end <= start {
            return Err(DataError::Corrupt(format!(
                "segment [{start}, {end}) cannot be appended to time tree {root} ending at {max}"
            )));
        }
        let leaf = self.new_row(TimeTree::new_leaf(start, end, prev_ap, distance_m));
        self.add_time_tree(root, leaf)
    }

    /// Extend the latest leaf to `end` and account one more point for it
    fn extend_rightmost(&mut self, root: TtId, end: i64, distance_m: f64) -> Result<()> {
        let mut id = root;
        loop {
            let node = self.get_row_mut(id)?;
            node.set_max_time(end);
            node.set_num_points(node.num_points() + 1);
            node.set_distance_m(node.distance_m() + distance_m);
            match node.sub_nodes().last() {
                Some(&child) => id = child,
                None => return Ok(()),
            }
        }
    }

    /// Stretch the latest leaf so that it covers up to `end`, without adding a point
    pub fn extend_max_time(&mut self, root: TtId, end: i64) -> Result<()> {
        let mut id = root;
        loop {
            let node = self.get_row_mut(id)?;
            node.set_max_time(node.max_time().max(end));
            match node.sub_nodes().last() {
                Some(&child) => id = child,
                None => return Ok(()),
            }
        }
    }

    /// Link the latest leaf (and every node above it) to the panel occupied next
    pub fn set_next_ap_on_rightmost_path(&mut self, root: TtId, next_ap: ApId) -> Result<()> {
        let mut id = root;
        loop {
            let node = self.get_row_mut(id)?;
            node.set_next_ap(Some(next_ap));
            match node.sub_nodes().last() {
                Some(&child) => id = child,
                None => return Ok(()),
            }
        }
    }

    /// Merge `other`, which starts after `node` ends, returning the new root
    pub fn add_time_tree(&mut self, node: TtId, other: TtId) -> Result<TtId> {
        let children = self.get_row(node)?.sub_nodes();
        let n = children.len();
        if n == 0 {
            return self.new_parent(&[node, other]);
        }

        let last = children[n - 1];
        if n >= 2
            && self.get_row(last)?.total_sub_node_count()
                < self.get_row(children[n - 2])?.total_sub_node_count()
        {
            let new_last = self.add_time_tree(last, other)?;
            self.get_row_mut(node)?.set_sub_node(n - 1, Some(new_last));
            self.recompute(node)?;
            Ok(node)
        } else if n < NUM_SUB_NODES {
            self.get_row_mut(node)?.set_sub_node(n, Some(other));
            self.recompute(node)?;
            Ok(node)
        } else {
            self.new_parent(&[node, other])
        }
    }

    fn new_parent(&mut self, children: &[TtId]) -> Result<TtId> {
        let mut parent = TimeTree::empty();
        for (i, &child) in children.iter().enumerate() {
            parent.set_sub_node(i, Some(child));
        }
        let id = self.new_row(parent);
        self.recompute(id)?;
        Ok(id)
    }

    /// Rebuild a node's aggregates from its children
    fn recompute(&mut self, id: TtId) -> Result<()> {
        let children = self.get_row(id)?.sub_nodes();
        let (Some(&first), Some(&last)) = (children.first(), children.last()) else {
            return Ok(());
        };

        let mut count = 0u32;
        let mut points = 0u32;
        let mut distance = 0.0;
        let mut jump = 0i64;
        let mut prev_max: Option<i64> = None;
        for &child_id in &children {
            let child = self.get_row(child_id)?;
            if let Some(prev_max) = prev_max {
                if child.min_time() < prev_max {
                    return Err(DataError::Corrupt(format!(
                        "time tree {child_id} starts at {} before its predecessor ends at {prev_max}",
                        child.min_time()
                    )));
                }
                jump = jump.max(child.min_time() - prev_max);
            }
            jump = jump.max(child.time_jump());
            count += child.total_sub_node_count();
            points += child.num_points();
            distance += child.distance_m();
            prev_max = Some(child.max_time());
        }

        let first = self.get_row(first)?;
        let (min, prev_ap) = (first.min_time(), first.prev_ap());
        let last = self.get_row(last)?;
        let (max, next_ap) = (last.max_time(), last.next_ap());

        let node = self.get_row_mut(id)?;
        node.set_min_time(min);
        node.set_max_time(max);
        node.set_total_sub_node_count(count);
        node.set_num_points(points);
        node.set_distance_m(distance);
        node.set_time_jump(jump);
        node.set_prev_ap(prev_ap);
        node.set_next_ap(next_ap);
        Ok(())
    }

    /// Check the structure of loaded time trees before any traversal relies on it
    ///
    /// An inner node has at least two disjoint non-empty children inside its span, so each
    /// child spans strictly less time than its parent and descending always ends.
    pub fn validate(&self, panel_count: usize) -> Result<()> {
        let corrupt = |id: TtId, what: String| Err(DataError::Corrupt(format!("time tree {id} {what}")));
        for (id, node) in self.iter() {
            if let Some(ap) = [node.prev_ap(), node.next_ap()]
                .into_iter()
                .flatten()
                .find(|ap| ap.0 as usize >= panel_count)
            {
                return corrupt(id, format!("links to the missing panel {ap}"));
            }
            if node.min_time() >= node.max_time() {
                return corrupt(id, format!("has the empty span [{}, {})", node.min_time(), node.max_time()));
            }

            let children = node.sub_nodes();
            if let Some(child) = children.iter().find(|child| child.0 as usize >= self.len()) {
                return corrupt(id, format!("points at the missing child {child}"));
            }
            if (children.len()..NUM_SUB_NODES).any(|i| node.sub_node(i).is_some()) {
                return corrupt(id, "has a gap between its children".to_string());
            }
            if children.is_empty() {
                if node.total_sub_node_count() != 1 {
                    return corrupt(id, format!("is a leaf counting {} leaves", node.total_sub_node_count()));
                }
                continue;
            }
            if children.len() < 2 {
                return corrupt(id, "has a single child".to_string());
            }

            let mut count = 0u64;
            let mut prev_max = node.min_time();
            for child_id in children {
                let child = self.get_row(child_id)?;
                if child.min_time() < prev_max || child.max_time() > node.max_time() {
                    return corrupt(id, format!("has the child {child_id} out of time order"));
                }
                count += u64::from(child.total_sub_node_count());
                prev_max = child.max_time();
            }
            if count != u64::from(node.total_sub_node_count()) {
                return corrupt(
                    id,
                    format!("counts {} leaves but its children hold {count}", node.total_sub_node_count()),
                );
            }
        }
        Ok(())
    }

    /// Classify how `[start, end)` meets the occupied time of the tree at `id`
    pub fn intersects_time(&self, id: TtId, start: i64, end: i64) -> Result<TimeOverlap> {
        if start >= end {
            return Ok(TimeOverlap::EmptyWithin);
        }
        let node = self.get_row(id)?;
        let (min, max) = (node.min_time(), node.max_time());
        if end <= min {
            return Ok(TimeOverlap::RangeIsBefore);
        }
        if start >= max {
            return Ok(TimeOverlap::RangeIsAfter);
        }
        if start <= min && end >= max {
            return Ok(TimeOverlap::EnvelopsTimeTree);
        }
        if start < min {
            return Ok(TimeOverlap::RangeOverlapsMinTime);
        }
        if end > max {
            return Ok(TimeOverlap::RangeOverlapsMaxTime);
        }
        if node.is_leaf() {
            return Ok(TimeOverlap::IntersectsWithin);
        }
        if end - start > node.time_jump() {
            return Ok(TimeOverlap::IntersectsOverTimeJump);
        }

        // The range is inside this node, so at most one child needs a closer look
        for child_id in node.sub_nodes() {
            let child = self.get_row(child_id)?;
            if end <= child.min_time() {
                return Ok(TimeOverlap::EmptyWithin);
            }
            if start < child.max_time() {
                if start <= child.min_time() || end >= child.max_time() {
                    return Ok(TimeOverlap::IntersectsWithin);
                }
                return self.intersects_time(child_id, start, end);
            }
        }
        Ok(TimeOverlap::EmptyWithin)
    }

    /// Nearest occupied second at or before (or at or after) `time`
    pub fn get_nearest_time_point(&self, root: TtId, time: i64, direction: Direction) -> Result<i64> {
        let mut id = root;
        loop {
            let node = self.get_row(id)?;
            match direction {
                Direction::LatestBefore if time < node.min_time() => {
                    return Err(DataError::OutOfRange { time, direction });
                }
                Direction::LatestBefore if time >= node.max_time() => {
                    return Ok(node.max_time() - 1);
                }
                Direction::EarliestAfter if time >= node.max_time() => {
                    return Err(DataError::OutOfRange { time, direction });
                }
                Direction::EarliestAfter if time < node.min_time() => {
                    return Ok(node.min_time());
                }
                _ => {}
            }
            if node.is_leaf() {
                return Ok(time);
            }

            let mut prev_max = node.min_time();
            let mut next = None;
            for child_id in node.sub_nodes() {
                let child = self.get_row(child_id)?;
                if time < child.min_time() {
                    return Ok(match direction {
                        Direction::LatestBefore => prev_max - 1,
                        Direction::EarliestAfter => child.min_time(),
                    });
                }
                if time < child.max_time() {
                    next = Some(child_id);
                    break;
                }
                prev_max = child.max_time();
            }
            id = next.ok_or_else(|| {
                DataError::Corrupt(format!("time tree {id} does not match the span of its children"))
            })?;
        }
    }

    /// The leaf whose span contains `time`, if any
    pub fn find_leaf_for_time(&self, root: TtId, time: i64) -> Result<Option<TtId>> {
        let mut id = root;
        loop {
            let node = self.get_row(id)?;
            if !node.contains_time(time) {
                return Ok(None);
            }
            if node.is_leaf() {
                return Ok(Some(id));
            }
            let mut next = None;
            for child_id in node.sub_nodes() {
                if self.get_row(child_id)?.contains_time(time) {
                    next = Some(child_id);
                    break;
                }
            }
            match next {
                Some(child_id) => id = child_id,
                None => return Ok(None),
            }
        }
    }

    /// The first leaf holding data at or after `time`
    pub fn leaf_at_or_after(&self, root: TtId, time: i64) -> Result<Option<TtId>> {
        match self.get_nearest_time_point(root, time, Direction::EarliestAfter) {
            Ok(found) => self.find_leaf_for_time(root, found),
            Err(DataError::OutOfRange { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The last leaf holding data at or before `time`
    pub fn leaf_at_or_before(&self, root: TtId, time: i64) -> Result<Option<TtId>> {
        match self.get_nearest_time_point(root, time, Direction::LatestBefore) {
            Ok(found) => self.find_leaf_for_time(root, found),
            Err(DataError::OutOfRange { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// First and last nodes covering the occupied part of `[start, end)`
    ///
    /// Descends only until a node's widest gap is within `tolerance` (a fraction of the
    /// clipped range), so with a non-zero tolerance small gaps at the edges are ignored.
    pub fn find_overlapping_range(
        &self,
        id: TtId,
        start: i64,
        end: i64,
        tolerance: f64,
    ) -> Result<Option<(TtId, TtId)>> {
        let node = self.get_row(id)?;
        let start = start.max(node.min_time());
        let end = end.min(node.max_time());
        if start >= end || !self.intersects_time(id, start, end)?.intersects() {
            return Ok(None);
        }
        if node.is_leaf() || accept_fuzzy(node.time_jump(), end - start, tolerance) {
            return Ok(Some((id, id)));
        }

        let children = node.sub_nodes();
        let mut first = None;
        for &child in &children {
            if let Some((found, _)) = self.find_overlapping_range(child, start, end, tolerance)? {
                first = Some(found);
                break;
            }
        }
        let mut last = None;
        for &child in children.iter().rev() {
            if let Some((_, found)) = self.find_overlapping_range(child, start, end, tolerance)? {
                last = Some(found);
                break;
            }
        }
        Ok(first.zip(last))
    }

    /// Every leaf in time order. O(n), keep it off hot paths.
    pub fn get_all_bottom_level_time_trees(&self, root: TtId) -> Result<Vec<TtId>> {
        let mut leaves = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = self.get_row(id)?;
            if node.is_leaf() {
                leaves.push(id);
            } else {
                stack.extend(node.sub_nodes().into_iter().rev());
            }
        }
        Ok(leaves)
    }

    /// Earliest leaf at or below `id`
    pub fn leftmost_leaf(&self, id: TtId) -> Result<TtId> {
        let mut id = id;
        while let Some(first) = self.get_row(id)?.sub_node(0) {
            id = first;
        }
        Ok(id)
    }

    /// Latest leaf at or below `id`
    pub fn rightmost_leaf(&self, id: TtId) -> Result<TtId> {
        let mut id = id;
        while let Some(&last) = self.get_row(id)?.sub_nodes().last() {
            id = last;
        }
        Ok(id)
    }

    /// Start of the span at `id` after removing the overlap with the previous panel
    ///
    /// Consecutive panels share the seconds between the last fix in one and the first fix in
    /// the other; the boundary is placed at the middle of that shared interval.
    pub fn calc_time_range_cut_start(&self, panels: &RowCache<AreaPanel>, id: TtId) -> Result<i64> {
        let node = self.get_row(id)?;
        let (min, max) = (node.min_time(), node.max_time());
        let Some(prev_ap) = node.prev_ap() else {
            return Ok(min);
        };
        let Some(prev_root) = panels.get_row(prev_ap)?.time_tree() else {
            return Err(DataError::Corrupt(format!(
                "time tree {id} links to panel {prev_ap} which has no time tree"
            )));
        };
        let Some(leaf) = self.find_leaf_for_time(prev_root, min)? else {
            return Ok(min);
        };
        let overlap_end = self.get_row(leaf)?.max_time().min(max);
        Ok(((min + overlap_end) / 2).clamp(min, max))
    }

    /// End of the span at `id` after removing the overlap with the next panel
    pub fn calc_time_range_cut_end(&self, panels: &RowCache<AreaPanel>, id: TtId) -> Result<i64> {
        let node = self.get_row(id)?;
        let (min, max) = (node.min_time(), node.max_time());
        let Some(next_ap) = node.next_ap() else {
            return Ok(max);
        };
        let Some(next_root) = panels.get_row(next_ap)?.time_tree() else {
            return Err(DataError::Corrupt(format!(
                "time tree {id} links to panel {next_ap} which has no time tree"
            )));
        };
        let Some(leaf) = self.find_leaf_for_time(next_root, max - 1)? else {
            return Ok(max);
        };
        let overlap_start = self.get_row(leaf)?.min_time().max(min);
        Ok(((overlap_start + max) / 2).clamp(min, max))
    }
}
