//! Columnar file-per-partition cold storage (§4.6). Each partition
//! (`(instrument, date)` for ticks, `(instrument, interval, date)` for
//! bars) is one `bincode`-encoded file; `query` does a full-file read with
//! an in-memory time-range filter, the same trade-off the teacher's
//! `backtest_v2/trade_recorder.rs` makes for its own per-session replay
//! files (read the whole recording, filter in memory) rather than
//! building a real columnar index.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::error::{DataCenterError, Result};

pub struct ColdArchive {
    dir: PathBuf,
}

impl ColdArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| DataCenterError::TransientIo {
            component: "cold_archive",
            source,
        })?;
        Ok(Self { dir })
    }

    fn tick_partition_path(&self, instrument_id: &str, date: NaiveDate) -> PathBuf {
        self.dir
            .join("ticks")
            .join(format!("{instrument_id}_{}.bin", date.format("%Y%m%d")))
    }

    fn bar_partition_path(&self, instrument_id: &str, interval_tag: &str, date: NaiveDate) -> PathBuf {
        self.dir
            .join("bars")
            .join(format!("{instrument_id}_{interval_tag}_{}.bin", date.format("%Y%m%d")))
    }

    /// Writes (or appends to, if the partition already exists) a
    /// partition file. Rows are merged so repeated archiver cycles for
    /// the same (instrument, date) don't clobber earlier rows.
    pub fn save_ticks(&self, instrument_id: &str, date: NaiveDate, rows: Vec<crate::model::Tick>) -> Result<()> {
        let path = self.tick_partition_path(instrument_id, date);
        self.save_partition(&path, rows)
    }

    pub fn save_bars(
        &self,
        instrument_id: &str,
        interval_tag: &str,
        date: NaiveDate,
        rows: Vec<crate::model::Bar>,
    ) -> Result<()> {
        let path = self.bar_partition_path(instrument_id, interval_tag, date);
        self.save_partition(&path, rows)
    }

    fn save_partition<T: Serialize + DeserializeOwned>(&self, path: &Path, mut rows: Vec<T>) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| DataCenterError::TransientIo {
                component: "cold_archive",
                source,
            })?;
        }
        if path.exists() {
            let mut existing = self.read_partition::<T>(path)?;
            existing.append(&mut rows);
            rows = existing;
        }
        let encoded = bincode::serialize(&rows).map_err(|e| DataCenterError::MalformedInput {
            component: "cold_archive",
            reason: e.to_string(),
        })?;
        std::fs::write(path, encoded).map_err(|source| DataCenterError::TransientIo {
            component: "cold_archive",
            source,
        })?;
        debug!(path = %path.display(), rows = rows.len(), "cold archive partition written");
        Ok(())
    }

    fn read_partition<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>> {
        let bytes = std::fs::read(path).map_err(|source| DataCenterError::TransientIo {
            component: "cold_archive",
            source,
        })?;
        bincode::deserialize(&bytes).map_err(|e| DataCenterError::MalformedInput {
            component: "cold_archive",
            reason: e.to_string(),
        })
    }

    /// Reads every partition file touching `[start, end]` and filters in
    /// memory, returning rows ordered by timestamp.
    pub fn query_ticks(
        &self,
        instrument_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<crate::model::Tick>> {
        let mut out = Vec::new();
        for date in dates_between(start, end) {
            let path = self.tick_partition_path(instrument_id, date);
            if !path.exists() {
                continue;
            }
            let rows: Vec<crate::model::Tick> = self.read_partition(&path)?;
            out.extend(rows.into_iter().filter(|r| r.timestamp >= start && r.timestamp <= end));
        }
        out.sort_by_key(|r| r.timestamp);
        Ok(out)
    }

    pub fn query_bars(
        &self,
        instrument_id: &str,
        interval_tag: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<crate::model::Bar>> {
        let mut out = Vec::new();
        for date in dates_between(start, end) {
            let path = self.bar_partition_path(instrument_id, interval_tag, date);
            if !path.exists() {
                continue;
            }
            let rows: Vec<crate::model::Bar> = self.read_partition(&path)?;
            out.extend(rows.into_iter().filter(|r| r.timestamp >= start && r.timestamp <= end));
        }
        out.sort_by_key(|r| r.timestamp);
        Ok(out)
    }
}

fn dates_between(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut d = start.date_naive();
    let end_date = end.date_naive();
    while d <= end_date {
        out.push(d);
        d += chrono::Duration::days(1);
    }
    out
}
