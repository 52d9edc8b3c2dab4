//! GPS Trail Library - Spatiotemporal Index for Continuous GPS History
//!
//! This library answers two kinds of questions about years of recorded GPS fixes on a
//! resource-constrained device: "when was I inside this rectangle?" and "which trips went
//! from this rectangle to that one?". The core data structure is a depth-bounded quadtree
//! over a fixed integer world (area panels) where every panel carries an append-biased
//! interval tree of the time spans it was occupied (time trees).
//!
//! # Architecture
//!
//! - **[`RowData`] / [`Column`]**: Fixed-width binary row layout with typed accessors
//! - **[`EncryptedRow`]**: Random IV + stream cipher output, optionally prefixed by a key id
//! - **[`RowCache`]**: Arena of rows addressed by `u32` ids, with dirty tracking and flushing
//! - **[`AreaPanel`]**: Quadtree node over area-panel units at a given depth
//! - **[`TimeTree`]**: Weight-balanced interval tree of occupied time spans
//! - **[`ReadWriteThreadManager`]**: Reader-biased gate shared by ingestion and query threads
//! - **[`SelectedAreaSet`]**: Background engine computing time ranges and paths for areas
//! - **[`GpsContext`]**: Explicit owner of the index, its gate and the key registry
//!
//! # Performance Characteristics
//!
//! - **Ingestion**: O(D) per fix where D is the quadtree depth (amortized O(1) per time tree)
//! - **Range intersection**: O(log₄ N) per time tree, a single root-to-leaf path
//! - **Area query**: proportional to the panels overlapping the area and the leaves in the window

mod area_panel;
mod area_set;
mod cache;
mod context;
pub mod crypt;
mod row;
mod rw_gate;
mod time_range;
mod time_tree;
mod trail;
pub mod utils;

// Public API exports
pub use area_panel::{ApId, ApRect, AreaPanel, DepthWidths, ap_rect};
pub use area_set::{AreaSetResult, Published, RunOutcome, SelectedAreaSet};
pub use cache::{FileBackend, MemoryBackend, RowBackend, RowCache};
pub use context::{GpsContext, IngestReport};
pub use crypt::{CryptKey, EncryptedRow, KeyRegistry};
pub use row::{Column, ColumnType, Row, RowData, RowKey, RowLayout};
pub use rw_gate::{ReadGuard, ReadWriteThreadManager, WriteGuard};
pub use time_range::{AreaPanelInfo, AreaTimeRange, Path, TimePosition, TimeRangeSet};
pub use time_tree::{Direction, TimeOverlap, TimeTree, TtId};
pub use trail::{Fix, IndexConfig, TrailIndex, TrailInfo};

/// Error types for the index
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("Row {id} of table {table} does not exist")]
    MissingRow { table: &'static str, id: u32 },

    #[error("Corrupt index: {0}")]
    Corrupt(String),

    #[error("Decryption failed: {0}")]
    Decrypt(String),

    #[error("No key registered for key id {0}")]
    UnknownKey(u32),

    #[error("Time {time} is out of range looking for the {direction} point")]
    OutOfRange { time: i64, direction: Direction },

    #[error("Fix at {time} does not come after the last fix at {last}")]
    NonIncreasingTime { last: i64, time: i64 },

    #[error("Point ({x}, {y}) is outside of the world")]
    OutOfWorld { x: i64, y: i64 },

    #[error("Value of {len} bytes does not fit its column")]
    ValueTooLong { len: usize },

    #[error("Configuration mismatch: {reason}")]
    ConfigMismatch { reason: String },

    /// Cooperative cancellation of a query computation; never reported as a failure
    #[error("Computation interrupted by newer input")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that the main entry points are accessible
        let _: fn(IndexConfig) -> Result<TrailIndex> = TrailIndex::new;
        let _: fn() -> IndexConfig = IndexConfig::default;
    }

    #[test]
    fn test_error_messages() {
        let err = DataError::MissingRow {
            table: "time_tree",
            id: 7,
        };
        assert_eq!(err.to_string(), "Row 7 of table time_tree does not exist");

        let err = DataError::OutOfRange {
            time: 5,
            direction: Direction::LatestBefore,
        };
        assert!(err.to_string().contains("latest"));
    }
}
