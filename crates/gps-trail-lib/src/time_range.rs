//! Query results: time ranges spent inside an area and paths between areas

use crate::area_panel::ApId;
use crate::time_tree::TtId;
use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A time tree leaf together with the panel that owns it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TimePosition {
    pub ap: ApId,
    pub tt: TtId,
}

/// A stretch of time spent inside a selected area
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AreaTimeRange {
    /// Start after splitting the seconds shared with the previous panel, clipped to the window
    pub start_time: i64,
    /// End after splitting the seconds shared with the next panel, clipped to the window
    pub end_time: i64,
    /// Raw start of the first leaf, including shared seconds
    pub full_start_time: i64,
    /// Raw end of the last leaf, including shared seconds
    pub full_end_time: i64,
    /// Leaf where the range starts
    pub start_pos: TimePosition,
    /// Leaf where the range ends
    pub end_pos: TimePosition,
    /// Distance travelled, filled in after the range is published
    pub dist_m: Option<f64>,
}

impl AreaTimeRange {
    #[inline]
    pub fn duration(&self) -> i64 {
        self.end_time - self.start_time
    }

    /// Check if both ranges overlap or one starts exactly where the other ends
    #[inline]
    pub fn touches(&self, other: &AreaTimeRange) -> bool {
        self.start_time <= other.end_time && other.start_time <= self.end_time
    }

    /// Grow `self` to cover `other` as well
    fn absorb(&mut self, other: AreaTimeRange) {
        if other.start_time < self.start_time {
            self.start_time = other.start_time;
            self.start_pos = other.start_pos;
        }
        if other.end_time > self.end_time {
            self.end_time = other.end_time;
            self.end_pos = other.end_pos;
        }
        self.full_start_time = self.full_start_time.min(other.full_start_time);
        self.full_end_time = self.full_end_time.max(other.full_end_time);
        self.dist_m = None;
    }
}

/// Non-overlapping [`AreaTimeRange`]s ordered by start time
///
/// Inserting a range that overlaps or touches existing ones merges them into one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimeRangeSet {
    ranges: BTreeMap<i64, AreaTimeRange>,
}

impl TimeRangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, range: AreaTimeRange) {
        let mut merged = range;

        // At most one earlier range can reach into the new one, since stored ranges never touch
        let before = self
            .ranges
            .range(..merged.start_time)
            .next_back()
            .filter(|(_, r)| r.touches(&merged))
            .map(|(&start, _)| start);
        if let Some(start) = before {
            if let Some(range) = self.ranges.remove(&start) {
                merged.absorb(range);
            }
        }

        let after: Vec<i64> = self
            .ranges
            .range(merged.start_time..=merged.end_time)
            .map(|(&start, _)| start)
            .collect();
        for start in after {
            if let Some(range) = self.ranges.remove(&start) {
                merged.absorb(range);
            }
        }

        self.ranges.insert(merged.start_time, merged);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AreaTimeRange> {
        self.ranges.values()
    }

    /// Total time covered
    pub fn total_duration(&self) -> i64 {
        self.ranges.values().map(AreaTimeRange::duration).sum()
    }

    pub fn into_vec(self) -> Vec<AreaTimeRange> {
        self.ranges.into_values().collect()
    }
}

/// Where a path passes through one of the selected areas
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AreaPanelInfo {
    /// Position of the area in the selection
    pub area_index: usize,
    /// Which of the area's time ranges the path goes through
    pub range_index: usize,
    /// Leaf where the visit starts
    pub start_pos: TimePosition,
    /// Leaf where the visit ends
    pub end_pos: TimePosition,
    pub start_time: i64,
    pub end_time: i64,
}

/// A trip through every selected area in order
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Path {
    /// Departure from the first area
    pub start_time: i64,
    /// Arrival in the last area
    pub end_time: i64,
    /// One visit per area, in selection order
    pub areas: Vec<AreaPanelInfo>,
    /// Distance travelled, filled in after the path is published
    pub dist_m: Option<f64>,
}

impl Path {
    #[inline]
    pub fn duration(&self) -> i64 {
        self.end_time - self.start_time
    }
}
