//! Per-day, per-instrument embedded row store (§4.4). One WAL-mode SQLite
//! file per trading day; one table per instrument within that file. Write
//! buffering, threshold flush and the per-file mutex dictionary are
//! modeled directly on the teacher's `signals/db_storage.rs` rusqlite
//! usage, generalized from that file's single fixed table to an
//! instrument-keyed table-per-contract layout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::{DataCenterError, Result};
use crate::model::{normalize_table_name, Bar, Tick, WriteBatch};

/// Buffer + threshold + per-file-lock parameters (§4.4 write pipeline).
#[derive(Debug, Clone, Copy)]
pub struct HotStoreConfig {
    pub tick_flush_threshold: usize,
    pub bar_flush_threshold: usize,
    pub max_flush_lifetime: Duration,
    pub stop_timeout: Duration,
}

struct DayBuffers {
    ticks: Vec<Tick>,
    bars: Vec<Bar>,
}

impl DayBuffers {
    fn new() -> Self {
        Self {
            ticks: Vec::new(),
            bars: Vec::new(),
        }
    }
}

/// Tracks an in-flight flush so `stop()` can report "zombie flush"
/// warnings for anything that outlives `max_flush_lifetime` (§4.4).
struct FlushMonitorEntry {
    started_at: Instant,
}

pub struct HotStore {
    dir: PathBuf,
    config: HotStoreConfig,
    buffers: Mutex<HashMap<String, DayBuffers>>,
    file_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    flush_monitor: Mutex<HashMap<String, FlushMonitorEntry>>,
    in_flight_flushes: Arc<std::sync::atomic::AtomicUsize>,
    zombie_flush_count: AtomicU64,
    stopped: std::sync::atomic::AtomicBool,
}

impl HotStore {
    pub fn new(dir: impl Into<PathBuf>, config: HotStoreConfig) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| DataCenterError::TransientIo {
            component: "hot_store",
            source,
        })?;
        Ok(Self {
            dir,
            config,
            buffers: Mutex::new(HashMap::new()),
            file_locks: Mutex::new(HashMap::new()),
            flush_monitor: Mutex::new(HashMap::new()),
            in_flight_flushes: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            zombie_flush_count: AtomicU64::new(0),
            stopped: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn zombie_flush_count(&self) -> u64 {
        self.zombie_flush_count.load(Ordering::Relaxed)
    }

    fn day_path(&self, trading_day: &str) -> PathBuf {
        self.dir.join(format!("{trading_day}.db"))
    }

    fn file_lock(&self, trading_day: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.file_locks
                .lock()
                .entry(trading_day.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Accepts a batch of ticks, buffering until `tick_flush_threshold` is
    /// crossed, at which point the buffer is atomically removed and
    /// flushed synchronously on a spawned thread (§4.4: "asynchronous
    /// flush goroutine").
    pub fn save_ticks(self: &Arc<Self>, batch: WriteBatch<Tick>) {
        if batch.is_empty() {
            return;
        }
        let trading_day = batch.trading_day.clone();
        let ready = {
            let mut buffers = self.buffers.lock();
            let entry = buffers
                .entry(trading_day.clone())
                .or_insert_with(DayBuffers::new);
            entry.ticks.extend(batch.rows);
            entry.ticks.len() >= self.config.tick_flush_threshold
        };
        if ready {
            self.trigger_flush(&trading_day);
        }
    }

    pub fn save_bars(self: &Arc<Self>, batch: WriteBatch<Bar>) {
        if batch.is_empty() {
            return;
        }
        let trading_day = batch.trading_day.clone();
        let ready = {
            let mut buffers = self.buffers.lock();
            let entry = buffers
                .entry(trading_day.clone())
                .or_insert_with(DayBuffers::new);
            entry.bars.extend(batch.rows);
            entry.bars.len() >= self.config.bar_flush_threshold
        };
        if ready {
            self.trigger_flush(&trading_day);
        }
    }

    fn take_buffer(&self, trading_day: &str) -> Option<DayBuffers> {
        self.buffers.lock().remove(trading_day)
    }

    fn trigger_flush(self: &Arc<Self>, trading_day: &str) {
        let Some(buffer) = self.take_buffer(trading_day) else {
            return;
        };
        let store = Arc::clone(self);
        let trading_day = trading_day.to_string();
        self.in_flight_flushes.fetch_add(1, Ordering::SeqCst);
        let name = format!("hotstore-flush-{trading_day}");
        self.flush_monitor.lock().insert(
            name.clone(),
            FlushMonitorEntry {
                started_at: Instant::now(),
            },
        );
        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                if let Err(e) = store.flush_buffer(&trading_day, buffer) {
                    warn!(trading_day, error = %e, "hot store flush failed");
                }
                store.flush_monitor.lock().remove(&name);
                store.in_flight_flushes.fetch_sub(1, Ordering::SeqCst);
            })
            .expect("failed to spawn hot store flush thread");
    }

    fn flush_buffer(&self, trading_day: &str, buffer: DayBuffers) -> Result<()> {
        let lock = self.file_lock(trading_day);
        let _guard = lock.lock();
        let conn = self.open_day(trading_day)?;

        let mut ticks = buffer.ticks;
        ticks.sort_by(|a, b| (a.instrument_id.as_str(), a.timestamp).cmp(&(b.instrument_id.as_str(), b.timestamp)));
        let mut bars = buffer.bars;
        bars.sort_by(|a, b| (a.instrument_id.as_str(), a.timestamp).cmp(&(b.instrument_id.as_str(), b.timestamp)));

        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|source| DataCenterError::TransientStorage { component: "hot_store", source })?;

        let result = (|| -> Result<()> {
            for tick in &ticks {
                self.insert_tick(&conn, tick)?;
            }
            for bar in &bars {
                self.insert_bar(&conn, bar)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT")
                    .map_err(|source| DataCenterError::TransientStorage { component: "hot_store", source })?;
                debug!(trading_day, ticks = ticks.len(), bars = bars.len(), "hot store flush committed");
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    fn open_day(&self, trading_day: &str) -> Result<Connection> {
        let path = self.day_path(trading_day);
        let conn = Connection::open(&path)
            .map_err(|source| DataCenterError::TransientStorage { component: "hot_store", source })?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|source| DataCenterError::TransientStorage { component: "hot_store", source })?;
        Ok(conn)
    }

    fn insert_tick(&self, conn: &Connection, tick: &Tick) -> Result<()> {
        let table = format!("tick_{}", normalize_table_name(&tick.instrument_id));
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    timestamp INTEGER NOT NULL,
                    instrument_id TEXT NOT NULL,
                    last_price REAL NOT NULL,
                    volume INTEGER NOT NULL,
                    open_interest INTEGER NOT NULL,
                    update_time TEXT NOT NULL,
                    payload BLOB NOT NULL
                )"
            ),
            [],
        )
        .map_err(|source| DataCenterError::TransientStorage { component: "hot_store", source })?;

        let payload = serde_json::to_vec(tick).map_err(|e| DataCenterError::MalformedInput {
            component: "hot_store",
            reason: e.to_string(),
        })?;
        conn.execute(
            &format!(
                "INSERT INTO {table} (timestamp, instrument_id, last_price, volume, open_interest, update_time, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            rusqlite::params![
                tick.timestamp.timestamp_millis(),
                tick.instrument_id,
                tick.last_price,
                tick.volume,
                tick.open_interest,
                tick.update_time,
                payload,
            ],
        )
        .map_err(|source| DataCenterError::TransientStorage { component: "hot_store", source })?;
        Ok(())
    }

    fn insert_bar(&self, conn: &Connection, bar: &Bar) -> Result<()> {
        let table = format!("kline_{}", normalize_table_name(&bar.instrument_id));
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    timestamp INTEGER NOT NULL,
                    bar_type TEXT NOT NULL,
                    instrument_id TEXT NOT NULL,
                    close_price REAL NOT NULL,
                    volume INTEGER NOT NULL,
                    payload BLOB NOT NULL
                )"
            ),
            [],
        )
        .map_err(|source| DataCenterError::TransientStorage { component: "hot_store", source })?;

        let payload = serde_json::to_vec(bar).map_err(|e| DataCenterError::MalformedInput {
            component: "hot_store",
            reason: e.to_string(),
        })?;
        conn.execute(
            &format!(
                "INSERT INTO {table} (timestamp, bar_type, instrument_id, close_price, volume, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ),
            rusqlite::params![
                bar.timestamp.timestamp_millis(),
                bar.bar_type,
                bar.instrument_id,
                bar.close_price,
                bar.volume,
                payload,
            ],
        )
        .map_err(|source| DataCenterError::TransientStorage { component: "hot_store", source })?;
        Ok(())
    }

    /// Single or multi-day range query over an instrument's tick table.
    /// A single relevant day opens that file directly; more than one
    /// attaches each day's file read-only and issues a `UNION ALL`
    /// (§4.4). Missing day files or missing per-instrument tables are
    /// treated as "no data that day", not an error.
    pub fn query_ticks(
        &self,
        instrument_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        days: &[String],
    ) -> Result<Vec<Tick>> {
        self.query_rows(instrument_id, "tick", None, start, end, days)
    }

    /// Bar queries are interval-specific (§4.7): `interval_tag` (e.g. `"5m"`)
    /// restricts the scan to that interval's rows only, so a query for one
    /// bar type never returns another's.
    pub fn query_bars(
        &self,
        instrument_id: &str,
        interval_tag: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        days: &[String],
    ) -> Result<Vec<Bar>>
    where
        Bar: serde::de::DeserializeOwned,
    {
        self.query_rows(instrument_id, "kline", Some(interval_tag), start, end, days)
    }

    fn query_rows<T>(
        &self,
        instrument_id: &str,
        prefix: &str,
        bar_type: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        days: &[String],
    ) -> Result<Vec<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let table = format!("{prefix}_{}", normalize_table_name(instrument_id));
        let existing_days: Vec<&String> = days.iter().filter(|d| self.day_path(d).exists()).collect();
        if existing_days.is_empty() {
            return Ok(Vec::new());
        }

        let conn = Connection::open_in_memory()
            .map_err(|source| DataCenterError::TransientStorage { component: "hot_store", source })?;

        let mut attached = Vec::new();
        for (i, day) in existing_days.iter().enumerate() {
            let alias = format!("day_{i}");
            let path = self.day_path(day);
            conn.execute(
                &format!("ATTACH DATABASE '{}' AS {alias}", path.display()),
                [],
            )
            .map_err(|source| DataCenterError::TransientStorage { component: "hot_store", source })?;
            if table_exists(&conn, &alias, &table)? {
                attached.push(alias);
            }
        }

        if attached.is_empty() {
            return Ok(Vec::new());
        }

        // Anonymous `?` placeholders so each UNION ALL branch gets its own
        // sequential binding rather than all branches sharing one `?1`/`?2`.
        let bar_type_predicate = if bar_type.is_some() { " AND bar_type = ?" } else { "" };
        let union_sql = attached
            .iter()
            .map(|alias| format!("SELECT payload, timestamp FROM {alias}.{table} WHERE timestamp BETWEEN ? AND ?{bar_type_predicate}"))
            .collect::<Vec<_>>()
            .join(" UNION ALL ");
        let sql = format!("{union_sql} ORDER BY timestamp ASC");

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|source| DataCenterError::TransientStorage { component: "hot_store", source })?;
        let start_ms = start.timestamp_millis();
        let end_ms = end.timestamp_millis();

        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        for _ in &attached {
            params.push(Box::new(start_ms));
            params.push(Box::new(end_ms));
            if let Some(bt) = bar_type {
                params.push(Box::new(bt.to_string()));
            }
        }

        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())), |row| {
                let payload: Vec<u8> = row.get(0)?;
                Ok(payload)
            })
            .map_err(|source| DataCenterError::TransientStorage { component: "hot_store", source })?;

        let mut out = Vec::new();
        for payload in rows {
            let payload = payload.map_err(|source| DataCenterError::TransientStorage { component: "hot_store", source })?;
            let row: T = serde_json::from_slice(&payload).map_err(|e| DataCenterError::MalformedInput {
                component: "hot_store",
                reason: e.to_string(),
            })?;
            out.push(row);
        }
        Ok(out)
    }

    /// Deletes rows for `instrument_id` in `[start, end]` from the single
    /// trading-day file `day` (§4.6 step 5). Used only by the archiver,
    /// after it has confirmed every row it is about to delete already has
    /// a verified copy in ColdArchive.
    pub fn delete_ticks(&self, instrument_id: &str, day: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<usize> {
        self.delete_rows(instrument_id, "tick", None, day, start, end)
    }

    pub fn delete_bars(
        &self,
        instrument_id: &str,
        interval_tag: &str,
        day: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        self.delete_rows(instrument_id, "kline", Some(interval_tag), day, start, end)
    }

    fn delete_rows(
        &self,
        instrument_id: &str,
        prefix: &str,
        bar_type: Option<&str>,
        day: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        if !self.day_path(day).exists() {
            return Ok(0);
        }
        let table = format!("{prefix}_{}", normalize_table_name(instrument_id));
        let lock = self.file_lock(day);
        let _guard = lock.lock();
        let conn = self.open_day(day)?;
        if !table_exists(&conn, "main", &table)? {
            return Ok(0);
        }

        let start_ms = start.timestamp_millis();
        let end_ms = end.timestamp_millis();
        let deleted = match bar_type {
            Some(bt) => conn
                .execute(
                    &format!("DELETE FROM {table} WHERE timestamp BETWEEN ?1 AND ?2 AND bar_type = ?3"),
                    rusqlite::params![start_ms, end_ms, bt],
                )
                .map_err(|source| DataCenterError::TransientStorage { component: "hot_store", source })?,
            None => conn
                .execute(
                    &format!("DELETE FROM {table} WHERE timestamp BETWEEN ?1 AND ?2"),
                    rusqlite::params![start_ms, end_ms],
                )
                .map_err(|source| DataCenterError::TransientStorage { component: "hot_store", source })?,
        };
        Ok(deleted)
    }

    /// Reclaims space freed by `delete_ticks`/`delete_bars` with a `VACUUM`
    /// pass over the day's file (§4.6 step 6). A no-op if the file does
    /// not exist; safe to call repeatedly.
    pub fn compact_day(&self, day: &str) -> Result<()> {
        if !self.day_path(day).exists() {
            return Ok(());
        }
        let lock = self.file_lock(day);
        let _guard = lock.lock();
        let conn = self.open_day(day)?;
        conn.execute_batch("VACUUM")
            .map_err(|source| DataCenterError::TransientStorage { component: "hot_store", source })?;
        Ok(())
    }

    /// Drains all remaining buffers synchronously (no new flush threads
    /// spawned) and waits up to `stop_timeout` for in-flight flushes.
    /// Anything still running past `max_flush_lifetime` is logged as a
    /// zombie flush but not forcibly killed (§4.4, §5 cancellation).
    pub fn stop(self: &Arc<Self>) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let remaining: Vec<String> = self.buffers.lock().keys().cloned().collect();
        for day in remaining {
            if let Some(buffer) = self.take_buffer(&day) {
                if let Err(e) = self.flush_buffer(&day, buffer) {
                    warn!(trading_day = day, error = %e, "final hot store flush failed during stop");
                }
            }
        }

        let deadline = Instant::now() + self.config.stop_timeout;
        while self.in_flight_flushes.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }

        let monitor = self.flush_monitor.lock();
        for (name, entry) in monitor.iter() {
            if entry.started_at.elapsed() >= self.config.max_flush_lifetime {
                self.zombie_flush_count.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("datacenter.hot_store.zombie_flush").increment(1);
                warn!(name, "zombie flush: exceeded max lifetime, not forcibly terminated");
            }
        }
    }
}

fn table_exists(conn: &Connection, alias: &str, table: &str) -> Result<bool> {
    let sql = format!("SELECT name FROM {alias}.sqlite_master WHERE type='table' AND name=?1");
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|source| DataCenterError::TransientStorage { component: "hot_store", source })?;
    let exists = stmt
        .exists(rusqlite::params![table])
        .map_err(|source| DataCenterError::TransientStorage { component: "hot_store", source })?;
    Ok(exists)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests_support::sample_tick;

    fn config() -> HotStoreConfig {
        HotStoreConfig {
            tick_flush_threshold: 2,
            bar_flush_threshold: 2,
            max_flush_lifetime: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(5),
        }
    }

    fn store(dir: &Path) -> Arc<HotStore> {
        Arc::new(HotStore::new(dir, config()).unwrap())
    }

    #[test]
    fn flush_triggers_at_threshold_and_rows_are_queryable() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let base = sample_tick();
        let day = base.trading_day.clone();

        let batch = WriteBatch {
            trading_day: day.clone(),
            rows: vec![base.clone(), base.clone()],
        };
        store.save_ticks(batch);
        store.stop();

        let rows = store
            .query_ticks(
                &base.instrument_id,
                base.timestamp - chrono::Duration::hours(1),
                base.timestamp + chrono::Duration::hours(1),
                &[day],
            )
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn missing_day_file_returns_empty_not_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let rows = store
            .query_ticks("rb2501", Utc::now(), Utc::now(), &["19990101".to_string()])
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn stop_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        store.stop();
        store.stop();
    }

    /// Scenario S2 (§8): a query spanning two day files unions both and
    /// returns rows in ascending timestamp order.
    #[test]
    fn s2_multi_day_query_unions_and_orders_by_timestamp() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let base = sample_tick();

        let mut day1 = base.clone();
        day1.trading_day = "20251027".into();
        day1.timestamp = Tick::derive_timestamp("20251027", "09:00:00", 0).unwrap();
        let mut day2 = base.clone();
        day2.trading_day = "20251028".into();
        day2.timestamp = Tick::derive_timestamp("20251028", "09:00:00", 0).unwrap();

        store.save_ticks(WriteBatch {
            trading_day: "20251027".into(),
            rows: vec![day1.clone(), day1.clone()],
        });
        store.save_ticks(WriteBatch {
            trading_day: "20251028".into(),
            rows: vec![day2.clone(), day2.clone()],
        });
        store.stop();

        let rows = store
            .query_ticks(
                &base.instrument_id,
                day1.timestamp - chrono::Duration::hours(1),
                day2.timestamp + chrono::Duration::hours(1),
                &["20251027".to_string(), "20251028".to_string()],
            )
            .unwrap();
        assert_eq!(rows.len(), 4);
        for pair in rows.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    fn sample_bar(base: &Tick, bar_type: &str) -> Bar {
        Bar {
            bar_type: bar_type.into(),
            trading_day: base.trading_day.clone(),
            update_time: base.update_time.clone(),
            instrument_id: base.instrument_id.clone(),
            exchange_id: base.exchange_id,
            volume: 10,
            open_interest: 100,
            open_price: 3500.0,
            highest_price: 3510.0,
            lowest_price: 3490.0,
            close_price: 3505.0,
            last_volume: 0,
            timestamp: base.timestamp,
        }
    }

    /// §4.7: a bar query for one interval must not return another
    /// interval's rows even though both live in the same `kline_<id>`
    /// table.
    #[test]
    fn query_bars_is_scoped_to_its_interval() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let base = sample_tick();
        let day = base.trading_day.clone();

        let bar_5m = sample_bar(&base, "5m");
        let bar_1m = sample_bar(&base, "1m");
        store.save_bars(WriteBatch {
            trading_day: day.clone(),
            rows: vec![bar_5m, bar_1m],
        });
        store.stop();

        let rows = store
            .query_bars(
                &base.instrument_id,
                "5m",
                base.timestamp - chrono::Duration::hours(1),
                base.timestamp + chrono::Duration::hours(1),
                &[day],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].bar_type, "5m");
    }

    /// §4.6 steps 5-6: deleting rows for a day removes them from
    /// subsequent queries, and `compact_day` runs cleanly afterward.
    #[test]
    fn delete_ticks_removes_rows_and_compact_day_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let base = sample_tick();
        let day = base.trading_day.clone();

        store.save_ticks(WriteBatch {
            trading_day: day.clone(),
            rows: vec![base.clone(), base.clone()],
        });
        store.stop();

        let deleted = store
            .delete_ticks(
                &base.instrument_id,
                &day,
                base.timestamp - chrono::Duration::hours(1),
                base.timestamp + chrono::Duration::hours(1),
            )
            .unwrap();
        assert_eq!(deleted, 2);

        let rows = store
            .query_ticks(
                &base.instrument_id,
                base.timestamp - chrono::Duration::hours(1),
                base.timestamp + chrono::Duration::hours(1),
                &[day.clone()],
            )
            .unwrap();
        assert!(rows.is_empty());

        store.compact_day(&day).unwrap();
    }
}
