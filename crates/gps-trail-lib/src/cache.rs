//! Row store: an arena of rows addressed by stable `u32` ids
//!
//! Rows live in memory in a [`RowCache`]. Mutable access marks a row dirty; dirty rows become
//! visible in a [`RowBackend`] only after an explicit [`RowCache::flush`], encrypted one record
//! at a time. Records have a fixed size per table, so a record's offset is its id times the
//! record size.

use crate::crypt::{EncryptedRow, KeyRegistry};
use crate::row::{Row, RowData, RowKey};
use crate::{DataError, Result};
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Persistent storage of fixed-size encrypted records, one table per record type
pub trait RowBackend: Send {
    /// Number of records stored for `table`
    fn record_count(&mut self, table: &'static str, record_size: usize) -> Result<u32>;

    fn read_record(&mut self, table: &'static str, id: u32, record_size: usize) -> Result<Vec<u8>>;

    fn write_record(&mut self, table: &'static str, id: u32, record: &[u8]) -> Result<()>;

    /// Make every written record durable
    fn sync(&mut self) -> Result<()>;
}

/// In-memory backend, mostly for tests
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    tables: HashMap<&'static str, Vec<Option<Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RowBackend for MemoryBackend {
    fn record_count(&mut self, table: &'static str, _record_size: usize) -> Result<u32> {
        Ok(self.tables.get(table).map_or(0, |records| records.len() as u32))
    }

    fn read_record(&mut self, table: &'static str, id: u32, _record_size: usize) -> Result<Vec<u8>> {
        self.tables
            .get(table)
            .and_then(|records| records.get(id as usize))
            .and_then(|record| record.clone())
            .ok_or(DataError::MissingRow { table, id })
    }

    fn write_record(&mut self, table: &'static str, id: u32, record: &[u8]) -> Result<()> {
        let records = self.tables.entry(table).or_default();
        let index = id as usize;
        if records.len() <= index {
            records.resize(index + 1, None);
        }
        records[index] = Some(record.to_vec());
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

/// File backend storing each table in `<dir>/<table>.rows`
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
    files: HashMap<&'static str, File>,
}

impl FileBackend {
    /// Open (creating if needed) a backend rooted at `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: HashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&mut self, table: &'static str) -> Result<&mut File> {
        if !self.files.contains_key(table) {
            let path = self.dir.join(format!("{table}.rows"));
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            self.files.insert(table, file);
        }
        self.files
            .get_mut(table)
            .ok_or(DataError::Corrupt(format!("table file {table} vanished")))
    }
}

impl RowBackend for FileBackend {
    fn record_count(&mut self, table: &'static str, record_size: usize) -> Result<u32> {
        let len = self.file(table)?.metadata()?.len();
        if len % record_size as u64 != 0 {
            return Err(DataError::Corrupt(format!(
                "table {table} has {len} bytes, not a multiple of its {record_size} byte records"
            )));
        }
        Ok((len / record_size as u64) as u32)
    }

    fn read_record(&mut self, table: &'static str, id: u32, record_size: usize) -> Result<Vec<u8>> {
        let file = self.file(table)?;
        file.seek(SeekFrom::Start(id as u64 * record_size as u64))?;
        let mut record = vec![0u8; record_size];
        file.read_exact(&mut record)?;
        Ok(record)
    }

    fn write_record(&mut self, table: &'static str, id: u32, record: &[u8]) -> Result<()> {
        let file = self.file(table)?;
        file.seek(SeekFrom::Start(id as u64 * record.len() as u64))?;
        file.write_all(record)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        for file in self.files.values() {
            file.sync_all()?;
        }
        Ok(())
    }
}

/// Arena of rows of one record type with dirty tracking
#[derive(Debug, Clone)]
pub struct RowCache<R: Row> {
    rows: Vec<R>,
    dirty: BTreeSet<u32>,
}

impl<R: Row> Default for RowCache<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl<R: Row> RowCache<R> {
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            dirty: BTreeSet::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Store a new row under a freshly allocated id
    pub fn new_row(&mut self, row: R) -> R::Id {
        let index = self.rows.len() as u32;
        self.rows.push(row);
        self.dirty.insert(index);
        R::Id::from_index(index)
    }

    #[inline]
    pub fn get_row(&self, id: R::Id) -> Result<&R> {
        self.rows
            .get(id.index() as usize)
            .ok_or(DataError::MissingRow {
                table: R::TABLE,
                id: id.index(),
            })
    }

    /// Mutable access to a row, recording it as updated first
    #[inline]
    pub fn get_row_mut(&mut self, id: R::Id) -> Result<&mut R> {
        let index = id.index();
        if index as usize >= self.rows.len() {
            return Err(DataError::MissingRow {
                table: R::TABLE,
                id: index,
            });
        }
        self.notify_row_updated(id);
        Ok(&mut self.rows[index as usize])
    }

    #[inline]
    pub fn notify_row_updated(&mut self, id: R::Id) {
        self.dirty.insert(id.index());
    }

    /// Every row with its id, in allocation order
    pub fn iter(&self) -> impl Iterator<Item = (R::Id, &R)> {
        self.rows
            .iter()
            .enumerate()
            .map(|(index, row)| (R::Id::from_index(index as u32), row))
    }

    /// The first row ever allocated
    pub fn top_row(&self) -> Result<&R> {
        self.get_row(R::Id::from_index(0))
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Encrypt every dirty row and write it to `backend`, returning the number written
    pub fn flush(&mut self, keys: &KeyRegistry, backend: &mut dyn RowBackend) -> Result<usize> {
        let encoded: Vec<(u32, Vec<u8>)> = self
            .dirty
            .par_iter()
            .map(|&index| {
                let row = &self.rows[index as usize];
                EncryptedRow::encode_with_encoded_key(keys, row.data().as_bytes())
                    .map(|record| (index, record))
            })
            .collect::<Result<_>>()?;

        for (index, record) in &encoded {
            backend.write_record(R::TABLE, *index, record)?;
        }
        self.dirty.clear();
        tracing::debug!("Flushed {} rows of table {}", encoded.len(), R::TABLE);
        Ok(encoded.len())
    }

    /// Read and decrypt every row stored in `backend`
    pub fn load(keys: &KeyRegistry, backend: &mut dyn RowBackend) -> Result<Self> {
        let layout = R::layout();
        let record_size = EncryptedRow::encrypted_size(layout.size(), true);
        let count = backend.record_count(R::TABLE, record_size)?;

        let records = (0..count)
            .map(|id| backend.read_record(R::TABLE, id, record_size))
            .collect::<Result<Vec<_>>>()?;

        let rows = records
            .par_iter()
            .enumerate()
            .map(|(id, record)| {
                let plain = EncryptedRow::decode_with_encoded_key(keys, record).inspect_err(|e| {
                    tracing::warn!("Row {id} of table {} is unreadable, aborting the load: {e}", R::TABLE);
                })?;
                RowData::from_bytes(layout, plain).map(R::from_data)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rows,
            dirty: BTreeSet::new(),
        })
    }
}
