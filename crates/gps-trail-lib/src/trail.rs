//! TrailIndex - Top-level owner of the area panel and time tree tables
//!
//! This module provides the ingestion API (fixes in, panels and time trees out), index
//! statistics, persistence through a [`RowBackend`] and the lazy distance computation used by
//! query results.

use crate::area_panel::{ApId, AreaPanel, DepthWidths};
use crate::cache::{RowBackend, RowCache};
use crate::crypt::KeyRegistry;
use crate::time_tree::{Direction, TimeTree};
use crate::{DataError, Result, utils};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Configuration of the index
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IndexConfig {
    /// Depth of the root panel. Default: 20
    pub max_depth: u8,
    /// Side of a depth 0 panel in AP units. The world is `depth_0_units << max_depth` units
    /// wide. Default: 1024
    pub depth_0_units: i64,
    /// Fraction of a query range that a time tree gap may cover and still be treated as
    /// occupied (0.0 = exact). Default: 0.0
    pub range_fuzziness: f64,
    /// Slowest movement still considered part of a path when trimming its ends. Default: 0.5
    pub min_path_speed_m_per_s: f64,
    /// Most panels walked when trimming each end of a path. Default: 256
    pub max_path_trim_steps: usize,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_depth: 20,
            depth_0_units: 1024,
            range_fuzziness: 0.0,
            min_path_speed_m_per_s: 0.5,
            max_path_trim_steps: 256,
        }
    }
}

impl IndexConfig {
    /// Width of the world in AP units
    pub fn max_ap_units(&self) -> i64 {
        self.depth_0_units << self.max_depth
    }

    /// Reject configurations whose world does not fit the 32 bit panel coordinates
    pub fn validate(&self) -> Result<()> {
        let mismatch = |reason: String| Err(DataError::ConfigMismatch { reason });
        if self.depth_0_units <= 0 {
            return mismatch(format!("depth_0_units must be positive, got {}", self.depth_0_units));
        }
        if self.max_depth >= 63 {
            return mismatch(format!("max_depth must be below 63, got {}", self.max_depth));
        }
        let world = i128::from(self.depth_0_units) << self.max_depth;
        if world > i128::from(i32::MAX) {
            return mismatch(format!(
                "a world of {world} units ({} << {}) does not fit in 32 bit coordinates",
                self.depth_0_units, self.max_depth
            ));
        }
        if !(self.range_fuzziness.is_finite() && self.range_fuzziness >= 0.0) {
            return mismatch(format!("range_fuzziness must be finite and not negative, got {}", self.range_fuzziness));
        }
        if !(self.min_path_speed_m_per_s.is_finite() && self.min_path_speed_m_per_s >= 0.0) {
            return mismatch(format!(
                "min_path_speed_m_per_s must be finite and not negative, got {}",
                self.min_path_speed_m_per_s
            ));
        }
        Ok(())
    }
}

/// A GPS fix
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Fix {
    /// Seconds since the Unix epoch
    pub time_sec: i64,
    pub lat: f64,
    pub lon: f64,
}

/// Information about the index
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrailInfo {
    /// Number of fixes ingested
    pub num_points: u32,
    /// Total distance in meters
    pub total_distance_m: f64,
    /// Time of the first fix
    pub first_time: Option<i64>,
    /// Time of the last fix
    pub last_time: Option<i64>,
    pub area_panel_count: usize,
    pub time_tree_count: usize,
}

/// Where the previous fix went, needed to link it to the next one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LastPoint {
    x: i64,
    y: i64,
    time: i64,
}

/// The spatiotemporal index
#[derive(Debug, Clone)]
pub struct TrailIndex {
    pub(crate) area_panels: RowCache<AreaPanel>,
    pub(crate) time_trees: RowCache<TimeTree>,
    pub(crate) widths: DepthWidths,
    config: IndexConfig,
    last_point: Option<LastPoint>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl TrailIndex {
    /// Create an empty index holding only the root panel
    pub fn new(config: IndexConfig) -> Result<Self> {
        config.validate()?;
        let widths = DepthWidths::new(config.max_depth, config.depth_0_units);
        let mut area_panels = RowCache::new();
        area_panels.new_row(AreaPanel::new(0, 0, config.max_depth));
        Ok(Self {
            area_panels,
            time_trees: RowCache::new(),
            widths,
            config,
            last_point: None,
        })
    }

    #[inline]
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    #[inline]
    pub fn widths(&self) -> &DepthWidths {
        &self.widths
    }

    #[inline]
    pub fn area_panels(&self) -> &RowCache<AreaPanel> {
        &self.area_panels
    }

    #[inline]
    pub fn time_trees(&self) -> &RowCache<TimeTree> {
        &self.time_trees
    }

    /// The world panel
    #[inline]
    pub fn root_panel(&self) -> ApId {
        ApId(0)
    }

    /// Check if no fix has been ingested yet
    pub fn is_empty(&self) -> bool {
        self.last_point.is_none()
    }

    pub fn last_time(&self) -> Option<i64> {
        self.last_point.map(|p| p.time)
    }

    /// Ingest a WGS84 fix
    pub fn add_fix(&mut self, fix: &Fix) -> Result<()> {
        let (x, y) = utils::wgs84_to_ap_units(fix.lat, fix.lon, self.config.max_ap_units());
        self.add_point(x, y, fix.time_sec)
    }

    /// Ingest a fix given in AP units
    ///
    /// Fixes must arrive in strictly increasing time order.
    pub fn add_point(&mut self, x: i64, y: i64, time: i64) -> Result<()> {
        let max_units = self.widths.max_ap_units();
        if !(0..max_units).contains(&x) || !(0..max_units).contains(&y) {
            tracing::warn!("Rejecting fix at ({x}, {y}) outside of the world");
            return Err(DataError::OutOfWorld { x, y });
        }
        if let Some(last) = self.last_point {
            if time <= last.time {
                tracing::warn!("Rejecting fix at {time}, last fix was at {}", last.time);
                return Err(DataError::NonIncreasingTime {
                    last: last.time,
                    time,
                });
            }
        }

        let root = self.root_panel();
        match self.last_point {
            Some(last) => {
                let distance_m = utils::ap_distance_m(
                    last.x as f64 + 0.5,
                    last.y as f64 + 0.5,
                    x as f64 + 0.5,
                    y as f64 + 0.5,
                    max_units,
                );
                self.add_point_to_panel(
                    root,
                    Some(root),
                    last.x,
                    last.y,
                    x,
                    y,
                    last.time,
                    time,
                    distance_m,
                )?;
            }
            None => self.add_point_to_panel(root, None, x, y, x, y, time, time, 0.0)?,
        }
        self.last_point = Some(LastPoint { x, y, time });
        Ok(())
    }

    /// Summary of the index, O(1)
    pub fn info(&self) -> Result<TrailInfo> {
        let mut info = TrailInfo {
            area_panel_count: self.area_panels.len(),
            time_tree_count: self.time_trees.len(),
            ..TrailInfo::default()
        };
        if let Some(tree) = self.area_panels.get_row(self.root_panel())?.time_tree() {
            let tree = self.time_trees.get_row(tree)?;
            info.num_points = tree.num_points();
            info.total_distance_m = tree.distance_m();
            info.first_time = Some(tree.min_time());
            info.last_time = Some(tree.max_time() - 1);
        }
        Ok(info)
    }

    /// Write every modified row to `backend`, encrypted with the registry's default key
    pub fn flush(&mut self, keys: &KeyRegistry, backend: &mut dyn RowBackend) -> Result<usize> {
        #[cfg(feature = "profiling")]
        profiling::scope!("trail::flush");

        let written = self.area_panels.flush(keys, backend)? + self.time_trees.flush(keys, backend)?;
        backend.sync()?;
        tracing::info!(
            "Flushed {written} rows ({} panels, {} time trees in total)",
            self.area_panels.len(),
            self.time_trees.len()
        );
        Ok(written)
    }

    /// Read an index back from `backend`; an empty backend gives an empty index
    pub fn load(config: IndexConfig, keys: &KeyRegistry, backend: &mut dyn RowBackend) -> Result<Self> {
        #[cfg(feature = "profiling")]
        profiling::scope!("trail::load");

        config.validate()?;
        let area_panels: RowCache<AreaPanel> = RowCache::load(keys, backend)?;
        if area_panels.is_empty() {
            return Self::new(config);
        }
        let time_trees: RowCache<TimeTree> = RowCache::load(keys, backend)?;

        let root_depth = area_panels.top_row()?.depth();
        if root_depth != config.max_depth {
            return Err(DataError::ConfigMismatch {
                reason: format!(
                    "stored root panel has depth {root_depth}, configuration asks for {}",
                    config.max_depth
                ),
            });
        }

        let widths = DepthWidths::new(config.max_depth, config.depth_0_units);
        area_panels.validate(&widths, time_trees.len())?;
        time_trees.validate(area_panels.len())?;

        let mut index = Self {
            area_panels,
            time_trees,
            widths,
            config,
            last_point: None,
        };
        index.last_point = index.recover_last_point()?;
        tracing::info!(
            "Loaded {} panels and {} time trees",
            index.area_panels.len(),
            index.time_trees.len()
        );
        Ok(index)
    }

    /// Find the depth 0 panel that received the latest fix
    ///
    /// The exact coordinates are not stored, so the panel origin stands in for them.
    fn recover_last_point(&self) -> Result<Option<LastPoint>> {
        let root = self.root_panel();
        let Some(root_tree) = self.area_panels.get_row(root)?.time_tree() else {
            return Ok(None);
        };
        let max = self.time_trees.get_row(root_tree)?.max_time();

        let mut ap = root;
        while self.area_panels.get_row(ap)?.depth() > 0 {
            let mut next = None;
            for (_, child) in self.area_panels.sub_panels(ap)? {
                let Some(tree) = self.area_panels.get_row(child)?.time_tree() else {
                    continue;
                };
                let tree = self.time_trees.get_row(tree)?;
                if tree.max_time() == max && tree.next_ap().is_none() {
                    next = Some(child);
                    break;
                }
            }
            ap = next.ok_or_else(|| {
                DataError::Corrupt(format!("no sub panel of {ap} holds the latest fix"))
            })?;
        }

        let panel = self.area_panels.get_row(ap)?;
        Ok(Some(LastPoint {
            x: panel.x(),
            y: panel.y(),
            time: max - 1,
        }))
    }

    /// Distance travelled during `[start, end)`, following the panel chain at `depth`
    ///
    /// Leaves only partially inside the range contribute proportionally to the overlap.
    /// `poll` is called once per visited leaf and aborts the walk by returning an error.
    pub fn distance_for_range(
        &self,
        start: i64,
        end: i64,
        depth: u8,
        mut poll: impl FnMut() -> Result<()>,
    ) -> Result<f64> {
        let Some(ap) = self.find_area_panel_for_time(start, depth, Direction::EarliestAfter)? else {
            return Ok(0.0);
        };
        let Some(tree) = self.area_panels.get_row(ap)?.time_tree() else {
            return Ok(0.0);
        };
        let Some(mut leaf_id) = self.time_trees.leaf_at_or_after(tree, start)? else {
            return Ok(0.0);
        };

        let mut distance = 0.0;
        loop {
            poll()?;
            let leaf = self.time_trees.get_row(leaf_id)?;
            let (min, max) = (leaf.min_time(), leaf.max_time());
            if min >= end {
                break;
            }
            let (lo, hi) = (min.max(start), max.min(end));
            if hi > lo {
                distance += leaf.distance_m() * (hi - lo) as f64 / (max - min) as f64;
            }
            if max >= end {
                break;
            }
            let Some(next_ap) = leaf.next_ap() else {
                break;
            };
            let next_tree = self.area_panels.get_row(next_ap)?.time_tree().ok_or_else(|| {
                DataError::Corrupt(format!("panel {next_ap} is linked but has no time tree"))
            })?;
            match self.time_trees.find_leaf_for_time(next_tree, max - 1)? {
                Some(next) if next != leaf_id => leaf_id = next,
                _ => break,
            }
        }
        Ok(distance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBackend;
    use crate::crypt::{CryptKey, EncryptedRow, IV_LEN, KEY_ID_LEN};
    use crate::row::Row;

    fn small_config() -> IndexConfig {
        IndexConfig {
            max_depth: 4,
            depth_0_units: 1,
            ..IndexConfig::default()
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = IndexConfig::default();
        assert_eq!(config.max_ap_units(), 1 << 30);
        assert_eq!(small_config().max_ap_units(), 16);
    }

    #[test]
    fn test_config_validation() {
        assert!(IndexConfig::default().validate().is_ok());
        assert!(small_config().validate().is_ok());

        let bad = [
            IndexConfig { max_depth: 64, ..small_config() },
            IndexConfig { max_depth: 63, ..small_config() },
            IndexConfig { max_depth: 22, ..IndexConfig::default() },
            IndexConfig { max_depth: 21, ..IndexConfig::default() },
            IndexConfig { depth_0_units: 0, ..small_config() },
            IndexConfig { depth_0_units: -4, ..small_config() },
            IndexConfig { range_fuzziness: f64::NAN, ..small_config() },
            IndexConfig { min_path_speed_m_per_s: -1.0, ..small_config() },
        ];
        for config in bad {
            assert!(
                matches!(TrailIndex::new(config.clone()), Err(DataError::ConfigMismatch { .. })),
                "{config:?} was accepted"
            );
        }

        // The widest world that still fits
        let widest = IndexConfig { max_depth: 30, ..small_config() };
        assert_eq!(TrailIndex::new(widest).unwrap().widths().max_ap_units(), 1 << 30);
    }

    #[test]
    fn test_load_rejects_bad_config() {
        let keys = KeyRegistry::new(1, CryptKey::generate());
        let mut backend = MemoryBackend::new();
        let config = IndexConfig { max_depth: 64, ..small_config() };
        assert!(matches!(
            TrailIndex::load(config, &keys, &mut backend),
            Err(DataError::ConfigMismatch { .. })
        ));
    }

    #[test]
    fn test_empty_index() {
        let index = TrailIndex::new(small_config()).unwrap();
        assert!(index.is_empty());
        let info = index.info().unwrap();
        assert_eq!(info.num_points, 0);
        assert_eq!(info.first_time, None);
        assert_eq!(info.area_panel_count, 1);
    }

    #[test]
    fn test_root_span_covers_all_points() {
        let mut index = TrailIndex::new(small_config()).unwrap();
        let points = [(0, 0, 10), (1, 0, 20), (5, 7, 35), (15, 15, 36), (3, 3, 90)];
        for &(x, y, t) in &points {
            index.add_point(x, y, t).unwrap();
        }

        let info = index.info().unwrap();
        assert_eq!(info.num_points, points.len() as u32);
        assert_eq!(info.first_time, Some(10));
        assert_eq!(info.last_time, Some(90));
        assert!(info.total_distance_m > 0.0);

        // The root never leaves itself, so its tree is a single extended leaf
        let root_tree = index.area_panels.get_row(index.root_panel()).unwrap().time_tree().unwrap();
        let root_tree = index.time_trees.get_row(root_tree).unwrap();
        assert_eq!((root_tree.min_time(), root_tree.max_time()), (10, 91));
        assert_eq!(root_tree.total_sub_node_count(), 1);
    }

    #[test]
    fn test_rejects_bad_input() {
        let mut index = TrailIndex::new(small_config()).unwrap();
        index.add_point(1, 1, 100).unwrap();
        assert!(matches!(
            index.add_point(1, 1, 100),
            Err(DataError::NonIncreasingTime { last: 100, time: 100 })
        ));
        assert!(matches!(
            index.add_point(16, 0, 200),
            Err(DataError::OutOfWorld { x: 16, y: 0 })
        ));
        assert!(matches!(index.add_point(-1, 0, 200), Err(DataError::OutOfWorld { .. })));
        // Rejected fixes leave the index untouched
        assert_eq!(index.last_time(), Some(100));
    }

    #[test]
    fn test_add_fix_uses_wgs84() {
        let mut index = TrailIndex::new(IndexConfig::default()).unwrap();
        index.add_fix(&Fix { time_sec: 0, lat: 40.0, lon: -3.0 }).unwrap();
        index.add_fix(&Fix { time_sec: 60, lat: 40.0, lon: -2.99 }).unwrap();
        let info = index.info().unwrap();
        let expected = utils::haversine_m(40.0, -3.0, 40.0, -2.99);
        assert!(
            (info.total_distance_m - expected).abs() < 1.0,
            "got {}, expected {expected}",
            info.total_distance_m
        );
        assert_eq!(info.num_points, 2);
    }

    #[test]
    fn test_flush_and_load() {
        let keys = KeyRegistry::new(1, CryptKey::generate());
        let mut backend = MemoryBackend::new();
        let mut index = TrailIndex::new(small_config()).unwrap();
        for (i, &(x, y)) in [(0, 0), (0, 1), (4, 4), (4, 5), (9, 9)].iter().enumerate() {
            index.add_point(x, y, i as i64 * 10).unwrap();
        }
        let written = index.flush(&keys, &mut backend).unwrap();
        assert_eq!(written, index.area_panels.len() + index.time_trees.len());

        let mut loaded = TrailIndex::load(small_config(), &keys, &mut backend).unwrap();
        assert_eq!(loaded.info().unwrap(), index.info().unwrap());
        assert_eq!(loaded.last_time(), Some(40));

        // Ingestion continues where it left off
        loaded.add_point(9, 9, 50).unwrap();
        assert_eq!(loaded.info().unwrap().last_time, Some(50));
        assert!(matches!(
            loaded.add_point(9, 9, 45),
            Err(DataError::NonIncreasingTime { .. })
        ));
    }

    #[test]
    fn test_load_checks_depth() {
        let keys = KeyRegistry::new(1, CryptKey::generate());
        let mut backend = MemoryBackend::new();
        let mut index = TrailIndex::new(small_config()).unwrap();
        index.add_point(0, 0, 1).unwrap();
        index.flush(&keys, &mut backend).unwrap();

        let other = IndexConfig {
            max_depth: 5,
            ..small_config()
        };
        assert!(matches!(
            TrailIndex::load(other, &keys, &mut backend),
            Err(DataError::ConfigMismatch { .. })
        ));
    }

    fn flushed_small_index(keys: &KeyRegistry) -> (TrailIndex, MemoryBackend) {
        let mut backend = MemoryBackend::new();
        let mut index = TrailIndex::new(small_config()).unwrap();
        for (i, &(x, y)) in [(0, 0), (5, 5), (12, 3)].iter().enumerate() {
            index.add_point(x, y, i as i64 * 10).unwrap();
        }
        index.flush(keys, &mut backend).unwrap();
        (index, backend)
    }

    #[test]
    fn test_load_rejects_tampered_record() {
        let keys = KeyRegistry::new(1, CryptKey::generate());
        let (_, mut backend) = flushed_small_index(&keys);

        let size = EncryptedRow::encrypted_size(AreaPanel::layout().size(), true);
        let mut record = backend.read_record(AreaPanel::TABLE, 1, size).unwrap();
        record[KEY_ID_LEN + IV_LEN + 8] ^= 0x82;
        backend.write_record(AreaPanel::TABLE, 1, &record).unwrap();

        assert!(matches!(
            TrailIndex::load(small_config(), &keys, &mut backend),
            Err(DataError::Decrypt(_))
        ));
    }

    #[test]
    fn test_load_rejects_inconsistent_rows() {
        let keys = KeyRegistry::new(1, CryptKey::generate());
        let layout = AreaPanel::layout();

        // A panel deeper than the root, stored under a valid tag
        let (mut index, mut backend) = flushed_small_index(&keys);
        index.area_panels.get_row_mut(ApId(1)).unwrap().data_mut().set_byte(layout.column(2), 130);
        index.flush(&keys, &mut backend).unwrap();
        assert!(matches!(
            TrailIndex::load(small_config(), &keys, &mut backend),
            Err(DataError::Corrupt(_))
        ));

        // A time tree reference past the end of the table
        let (mut index, mut backend) = flushed_small_index(&keys);
        index.area_panels.get_row_mut(ApId(1)).unwrap().data_mut().set_ref(layout.column(3), Some(999));
        index.flush(&keys, &mut backend).unwrap();
        assert!(matches!(
            TrailIndex::load(small_config(), &keys, &mut backend),
            Err(DataError::Corrupt(_))
        ));

        // A panel moved off its parent's grid
        let (mut index, mut backend) = flushed_small_index(&keys);
        index.area_panels.get_row_mut(ApId(1)).unwrap().data_mut().set_int(layout.column(0), 3);
        index.flush(&keys, &mut backend).unwrap();
        assert!(matches!(
            TrailIndex::load(small_config(), &keys, &mut backend),
            Err(DataError::Corrupt(_))
        ));

        // A time tree node counting more leaves than its children hold
        let (mut index, mut backend) = flushed_small_index(&keys);
        let root_tree = index.area_panels.get_row(ApId(1)).unwrap().time_tree().unwrap();
        let tree_layout = TimeTree::layout();
        let column = tree_layout
            .columns()
            .iter()
            .find(|column| column.name == "total_sub_node_count")
            .unwrap();
        index.time_trees.get_row_mut(root_tree).unwrap().data_mut().set_int(column, 7);
        index.flush(&keys, &mut backend).unwrap();
        assert!(matches!(
            TrailIndex::load(small_config(), &keys, &mut backend),
            Err(DataError::Corrupt(_))
        ));

        // Untouched rows still load
        let (index, mut backend) = flushed_small_index(&keys);
        let loaded = TrailIndex::load(small_config(), &keys, &mut backend).unwrap();
        assert_eq!(loaded.info().unwrap(), index.info().unwrap());
    }

    #[test]
    fn test_distance_for_range() {
        let mut index = TrailIndex::new(small_config()).unwrap();
        for (i, x) in [0, 3, 6, 9, 12, 15].into_iter().enumerate() {
            index.add_point(x, 8, i as i64 * 100).unwrap();
        }
        let total = index.info().unwrap().total_distance_m;
        let full = index.distance_for_range(0, 501, 0, || Ok(())).unwrap();
        assert!((full - total).abs() < 1e-6 * total, "full {full}, total {total}");

        let part = index.distance_for_range(150, 350, 0, || Ok(())).unwrap();
        assert!(part > 0.0 && part < total);

        assert_eq!(index.distance_for_range(900, 1000, 0, || Ok(())).unwrap(), 0.0);
        assert!(matches!(
            index.distance_for_range(0, 501, 0, || Err(DataError::Interrupted)),
            Err(DataError::Interrupted)
        ));
    }
}
