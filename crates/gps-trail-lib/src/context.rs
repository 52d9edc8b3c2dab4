//! GpsContext - Owner of the index, its gate and the key registry
//!
//! Everything that used to be process-wide state lives here and is handed to whoever needs
//! it: ingestion takes the writer side of the gate, queries and area sets the reader side.

use crate::area_set::SelectedAreaSet;
use crate::cache::RowBackend;
use crate::crypt::KeyRegistry;
use crate::rw_gate::ReadWriteThreadManager;
use crate::trail::{Fix, IndexConfig, TrailIndex, TrailInfo};
use crate::{DataError, Result};
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Outcome of an ingestion batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IngestReport {
    pub accepted: usize,
    /// Fixes out of order or outside of the world
    pub rejected: usize,
}

/// Shared handle to an index and the keys protecting its rows
#[derive(Clone)]
pub struct GpsContext {
    index: Arc<ReadWriteThreadManager<TrailIndex>>,
    keys: Arc<KeyRegistry>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl GpsContext {
    /// A context around an empty index
    pub fn new(config: IndexConfig, keys: KeyRegistry) -> Result<Self> {
        Ok(Self {
            index: Arc::new(ReadWriteThreadManager::new(TrailIndex::new(config)?)),
            keys: Arc::new(keys),
        })
    }

    /// A context around the index stored in `backend`
    pub fn open(config: IndexConfig, keys: KeyRegistry, backend: &mut dyn RowBackend) -> Result<Self> {
        let index = TrailIndex::load(config, &keys, backend)?;
        Ok(Self {
            index: Arc::new(ReadWriteThreadManager::new(index)),
            keys: Arc::new(keys),
        })
    }

    #[inline]
    pub fn index(&self) -> &Arc<ReadWriteThreadManager<TrailIndex>> {
        &self.index
    }

    #[inline]
    pub fn keys(&self) -> &KeyRegistry {
        &self.keys
    }

    /// Append a batch of fixes under a single writer registration
    ///
    /// Fixes that arrive out of order or fall outside of the world are skipped and counted;
    /// any other failure stops the batch. Queued readers are let through between fixes.
    pub fn ingest(&self, fixes: impl IntoIterator<Item = Fix>) -> Result<IngestReport> {
        #[cfg(feature = "profiling")]
        profiling::scope!("context::ingest");

        let mut report = IngestReport::default();
        let mut index = self.index.write();
        for fix in fixes {
            match index.add_fix(&fix) {
                Ok(()) => report.accepted += 1,
                Err(DataError::NonIncreasingTime { .. } | DataError::OutOfWorld { .. }) => {
                    report.rejected += 1;
                }
                Err(e) => return Err(e),
            }
            if index.is_writing_holding_up_reading_threads() {
                index.pause_for_reading_threads();
            }
        }
        if report.rejected > 0 {
            tracing::warn!(
                "Skipped {} of {} fixes",
                report.rejected,
                report.accepted + report.rejected
            );
        }
        tracing::debug!("Ingested {} fixes", report.accepted);
        Ok(report)
    }

    /// Write modified rows to `backend`
    pub fn flush(&self, backend: &mut dyn RowBackend) -> Result<usize> {
        self.index.write().flush(&self.keys, backend)
    }

    pub fn info(&self) -> Result<TrailInfo> {
        self.index.read().info()
    }

    /// A new, empty area selection over this index
    pub fn selected_area_set(&self) -> Arc<SelectedAreaSet> {
        Arc::new(SelectedAreaSet::new(Arc::clone(&self.index)))
    }
}
