//! Per-contract CSV append log (§4.5). A fixed pool of worker threads,
//! each owning a disjoint subset of instruments chosen by a stable hash so
//! the same instrument always lands on the same worker and its file never
//! sees cross-worker contention — the sharded-writer shape the teacher
//! uses in `performance/queues.rs`'s `QueueRegistry`, generalized from a
//! single queue per metric to one queue per shard.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHasher;
use parking_lot::Mutex;
use std::hash::{Hash, Hasher};
use tracing::{error, warn};

use crate::model::{Bar, Tick, WriteBatch};

#[derive(Debug, Clone, Copy)]
pub struct AppendLogConfig {
    pub worker_count: usize,
    pub batch_threshold: usize,
    pub queue_capacity: usize,
    pub direct_write_wait: Duration,
}

/// Anything appendable to a CSV row group. Implemented for `Tick` and
/// `Bar` so a single sharded pipeline serves both writers (§4.4's "parallel
/// secondary writer" note).
pub trait CsvRow: Send + 'static {
    fn instrument_id(&self) -> &str;
    fn header() -> &'static str;
    fn to_csv_row(&self) -> String;
    fn timestamp_key(&self) -> i64;
}

impl CsvRow for Tick {
    fn instrument_id(&self) -> &str {
        &self.instrument_id
    }
    fn header() -> &'static str {
        "TradingDay,ExchangeID,LastPrice,PreSettlementPrice,PreClosePrice,PreOpenInterest,\
OpenPrice,HighestPrice,LowestPrice,Volume,Turnover,OpenInterest,ClosePrice,SettlementPrice,\
UpperLimitPrice,LowerLimitPrice,PreDelta,CurrDelta,UpdateTime,UpdateMillisec,\
BidPrice1,BidPrice2,BidPrice3,BidPrice4,BidPrice5,BidVolume1,BidVolume2,BidVolume3,BidVolume4,BidVolume5,\
AskPrice1,AskPrice2,AskPrice3,AskPrice4,AskPrice5,AskVolume1,AskVolume2,AskVolume3,AskVolume4,AskVolume5,\
AveragePrice,ActionDay,InstrumentID,ExchangeInstID,BandingUpperPrice,BandingLowerPrice,Timestamp"
    }
    fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},\
{},{},{},{},{},{},{},{},{},{},\
{},{},{},{},{},{},{},{},{},{},\
{},{},{},{},{},{},{}",
            self.trading_day,
            self.exchange_id,
            self.last_price,
            self.pre_settlement_price,
            self.pre_close_price,
            self.pre_open_interest,
            self.open_price,
            self.highest_price,
            self.lowest_price,
            self.volume,
            self.turnover,
            self.open_interest,
            self.close_price,
            self.settlement_price,
            self.upper_limit_price,
            self.lower_limit_price,
            self.pre_delta,
            self.curr_delta,
            self.update_time,
            self.update_millisec,
            self.bid.prices[0],
            self.bid.prices[1],
            self.bid.prices[2],
            self.bid.prices[3],
            self.bid.prices[4],
            self.bid.volumes[0],
            self.bid.volumes[1],
            self.bid.volumes[2],
            self.bid.volumes[3],
            self.bid.volumes[4],
            self.ask.prices[0],
            self.ask.prices[1],
            self.ask.prices[2],
            self.ask.prices[3],
            self.ask.prices[4],
            self.ask.volumes[0],
            self.ask.volumes[1],
            self.ask.volumes[2],
            self.ask.volumes[3],
            self.ask.volumes[4],
            self.average_price,
            self.action_day,
            self.instrument_id,
            self.exchange_inst_id,
            self.banding_upper_price,
            self.banding_lower_price,
            self.timestamp.timestamp_millis(),
        )
    }
    fn timestamp_key(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

impl CsvRow for Bar {
    fn instrument_id(&self) -> &str {
        &self.instrument_id
    }
    fn header() -> &'static str {
        "BarType,TradingDay,UpdateTime,InstrumentID,ExchangeID,Volume,OpenInterest,\
OpenPrice,HighestPrice,LowestPrice,ClosePrice,LastVolume,Timestamp"
    }
    fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{},{},{},{}",
            self.bar_type,
            self.trading_day,
            self.update_time,
            self.instrument_id,
            self.exchange_id,
            self.volume,
            self.open_interest,
            self.open_price,
            self.highest_price,
            self.lowest_price,
            self.close_price,
            self.last_volume,
            self.timestamp.timestamp_millis(),
        )
    }
    fn timestamp_key(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

enum WorkItem<T> {
    Rows { trading_day: String, rows: Vec<T> },
    Shutdown,
}

struct Worker<T> {
    tx: crossbeam_channel::Sender<WorkItem<T>>,
}

/// Sharded, threshold-flushed append log. One instance handles exactly one
/// row kind (`Tick` or `Bar`) — callers keep one `AppendLog<Tick>` and one
/// `AppendLog<Bar>` side by side.
pub struct AppendLog<T: CsvRow> {
    base_dir: PathBuf,
    config: AppendLogConfig,
    workers: Vec<Worker<T>>,
    file_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl<T: CsvRow> AppendLog<T> {
    pub fn new(base_dir: impl Into<PathBuf>, config: AppendLogConfig) -> Arc<Self> {
        let base_dir = base_dir.into();
        let mut workers = Vec::with_capacity(config.worker_count);
        let mut receivers = Vec::with_capacity(config.worker_count);
        for _ in 0..config.worker_count {
            let (tx, rx) = crossbeam_channel::bounded::<WorkItem<T>>(config.queue_capacity);
            workers.push(Worker { tx });
            receivers.push(rx);
        }

        let log = Arc::new(Self {
            base_dir,
            config,
            workers,
            file_locks: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
        });

        let handles: Vec<_> = receivers
            .into_iter()
            .enumerate()
            .map(|(index, rx)| {
                let worker_log = Arc::clone(&log);
                std::thread::Builder::new()
                    .name(format!("append-log-worker-{index}"))
                    .spawn(move || worker_log.run_worker(rx))
                    .expect("failed to spawn append log worker")
            })
            .collect();
        *log.handles.lock() = handles;
        log
    }

    fn shard_for(&self, instrument_id: &str) -> usize {
        let mut hasher = FnvHasher::default();
        instrument_id.hash(&mut hasher);
        (hasher.finish() as usize) % self.config.worker_count.max(1)
    }

    /// Routes a batch to its shard. On a full queue, falls back to a
    /// bounded wait, then a direct (bypassing-the-queue) write, then
    /// `failed_writes.log` as the last resort — exactly the three-tier
    /// degraded path in §4.5.
    pub fn submit(&self, trading_day: String, mut rows_by_instrument: HashMap<String, Vec<T>>) {
        for (instrument_id, rows) in rows_by_instrument.drain() {
            let shard = self.shard_for(&instrument_id);
            let item = WorkItem::Rows {
                trading_day: trading_day.clone(),
                rows,
            };
            match self.workers[shard].tx.try_send(item) {
                Ok(()) => continue,
                Err(crossbeam_channel::TrySendError::Full(item)) => {
                    match self.send_with_timeout(shard, item) {
                        Ok(()) => continue,
                        Err(WorkItem::Rows { trading_day, rows }) => {
                            self.direct_write_or_fail(&trading_day, &instrument_id, rows);
                        }
                        Err(WorkItem::Shutdown) => {}
                    }
                }
                Err(crossbeam_channel::TrySendError::Disconnected(item)) => {
                    if let WorkItem::Rows { trading_day, rows } = item {
                        self.direct_write_or_fail(&trading_day, &instrument_id, rows);
                    }
                }
            }
        }
    }

    fn send_with_timeout(&self, shard: usize, item: WorkItem<T>) -> Result<(), WorkItem<T>> {
        match self
            .workers[shard]
            .tx
            .send_timeout(item, self.config.direct_write_wait)
        {
            Ok(()) => Ok(()),
            Err(crossbeam_channel::SendTimeoutError::Timeout(item))
            | Err(crossbeam_channel::SendTimeoutError::Disconnected(item)) => Err(item),
        }
    }

    fn direct_write_or_fail(&self, trading_day: &str, instrument_id: &str, rows: Vec<T>) {
        warn!(trading_day, instrument_id, "append log queue saturated; writing directly");
        if let Err(e) = self.flush_rows(trading_day, instrument_id, &rows) {
            error!(trading_day, instrument_id, error = %e, "direct write failed; recording to failed_writes.log");
            self.record_failed_write(trading_day, instrument_id, rows.len(), &e);
        }
    }

    fn run_worker(&self, rx: crossbeam_channel::Receiver<WorkItem<T>>) {
        let mut buffered: HashMap<(String, String), Vec<T>> = HashMap::new();
        let mut buffered_count = 0usize;
        let mut current_day: Option<String> = None;

        loop {
            match rx.recv_timeout(Duration::from_secs(1)) {
                Ok(WorkItem::Rows { trading_day, rows }) => {
                    let day_changed = current_day.as_deref().is_some_and(|d| d != trading_day);
                    if day_changed {
                        self.flush_all(&mut buffered, &mut buffered_count);
                    }
                    current_day = Some(trading_day.clone());
                    buffered_count += rows.len();
                    for row in rows {
                        buffered
                            .entry((trading_day.clone(), row.instrument_id().to_string()))
                            .or_default()
                            .push(row);
                    }
                    if buffered_count >= self.config.batch_threshold {
                        self.flush_all(&mut buffered, &mut buffered_count);
                    }
                }
                Ok(WorkItem::Shutdown) => break,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
        self.flush_all(&mut buffered, &mut buffered_count);
    }

    fn flush_all(&self, buffered: &mut HashMap<(String, String), Vec<T>>, count: &mut usize) {
        for ((trading_day, instrument_id), rows) in buffered.drain() {
            if let Err(e) = self.flush_rows(&trading_day, &instrument_id, &rows) {
                error!(trading_day, instrument_id, error = %e, "append log flush failed");
                self.record_failed_write(&trading_day, &instrument_id, rows.len(), &e);
            }
        }
        *count = 0;
    }

    fn instrument_path(&self, trading_day: &str, instrument_id: &str) -> PathBuf {
        self.base_dir.join(trading_day).join(format!("{instrument_id}.csv"))
    }

    fn flush_rows(&self, trading_day: &str, instrument_id: &str, rows: &[T]) -> std::io::Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let path = self.instrument_path(trading_day, instrument_id);
        let lock = Arc::clone(self.file_locks.lock().entry(path.clone()).or_insert_with(|| Arc::new(Mutex::new(()))));
        let _guard = lock.lock();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let write_header = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if write_header {
            writeln!(file, "{}", T::header())?;
        }
        for row in rows {
            writeln!(file, "{}", row.to_csv_row())?;
        }
        Ok(())
    }

    fn record_failed_write(&self, trading_day: &str, instrument_id: &str, row_count: usize, error: &std::io::Error) {
        let path = self.base_dir.join("failed_writes.log");
        let entry = format!(
            "{} instrument={} trading_day={} rows={} error={}\n",
            chrono::Utc::now().to_rfc3339(),
            instrument_id,
            trading_day,
            row_count,
            error
        );
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
            let _ = file.write_all(entry.as_bytes());
        }
    }

    /// Sends a shutdown sentinel to every worker and joins with a bounded
    /// per-worker wait (§4.5, §5 cancellation).
    pub fn stop(&self, per_worker_timeout: Duration) {
        for worker in &self.workers {
            let _ = worker.tx.send(WorkItem::Shutdown);
        }
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let (done_tx, done_rx) = crossbeam_channel::bounded(1);
            let name = handle.thread().name().unwrap_or("append-log-worker").to_string();
            std::thread::spawn(move || {
                let _ = handle.join();
                let _ = done_tx.send(());
            });
            if done_rx.recv_timeout(per_worker_timeout).is_err() {
                warn!(worker = name, "append log worker did not exit within timeout");
            }
        }
    }

    /// Post-session processing (§4.5): dedupes a day's CSV by timestamp
    /// key (last occurrence wins), sorts ascending, atomically replaces
    /// the file, then archives the whole day directory into a
    /// `.tar.gz` and removes the original.
    pub fn archive_day(&self, trading_day: &str) -> std::io::Result<()> {
        let day_dir = self.base_dir.join(trading_day);
        if !day_dir.exists() {
            return Ok(());
        }

        for entry in std::fs::read_dir(&day_dir)? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) == Some("csv") {
                dedup_and_sort_csv(&entry.path())?;
            }
        }

        let archive_path = self.base_dir.join(format!("{trading_day}.tar.gz"));
        let tar_gz = std::fs::File::create(&archive_path)?;
        let enc = flate2::write::GzEncoder::new(tar_gz, flate2::Compression::default());
        let mut builder = tar::Builder::new(enc);
        builder.append_dir_all(trading_day, &day_dir)?;
        builder.into_inner()?.finish()?;

        std::fs::remove_dir_all(&day_dir)?;
        Ok(())
    }
}

fn dedup_and_sort_csv(path: &Path) -> std::io::Result<()> {
    let content = std::fs::read_to_string(path)?;
    let mut lines = content.lines();
    let header = lines.next().unwrap_or("").to_string();

    let mut by_key: HashMap<i64, String> = HashMap::new();
    let mut order: Vec<i64> = Vec::new();
    for line in lines {
        let Some(key_str) = line.split(',').next() else { continue };
        let Ok(key) = key_str.parse::<i64>() else { continue };
        if !by_key.contains_key(&key) {
            order.push(key);
        }
        by_key.insert(key, line.to_string());
    }
    order.sort_unstable();

    let mut out = String::with_capacity(content.len());
    out.push_str(&header);
    out.push('\n');
    for key in order {
        out.push_str(&by_key[&key]);
        out.push('\n');
    }

    let tmp_path = path.with_extension("csv.tmp");
    std::fs::write(&tmp_path, out)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests_support::sample_tick;

    fn config(worker_count: usize) -> AppendLogConfig {
        AppendLogConfig {
            worker_count,
            batch_threshold: 2,
            queue_capacity: 16,
            direct_write_wait: Duration::from_millis(200),
        }
    }

    #[test]
    fn same_instrument_always_routes_to_same_shard() {
        let tmp = tempfile::tempdir().unwrap();
        let log: Arc<AppendLog<Tick>> = AppendLog::new(tmp.path(), config(4));
        let a = log.shard_for("rb2501");
        let b = log.shard_for("rb2501");
        assert_eq!(a, b);
    }

    #[test]
    fn submitted_rows_are_flushed_to_csv_on_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let log: Arc<AppendLog<Tick>> = AppendLog::new(tmp.path(), config(2));
        let tick = sample_tick();
        let mut rows = HashMap::new();
        rows.insert(tick.instrument_id.clone(), vec![tick.clone(), tick.clone()]);
        log.submit(tick.trading_day.clone(), rows);
        log.stop(Duration::from_secs(2));

        let path = tmp.path().join(&tick.trading_day).join(format!("{}.csv", tick.instrument_id));
        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(content.lines().count(), 3); // header + 2 rows
    }

    #[test]
    fn dedup_keeps_last_occurrence_and_sorts() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("x.csv");
        std::fs::write(&path, "timestamp,v\n2,b\n1,a\n2,c\n").unwrap();
        dedup_and_sort_csv(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "timestamp,v\n1,a\n2,c\n");
    }

    #[test]
    fn archive_day_produces_tar_gz_and_removes_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let log: Arc<AppendLog<Tick>> = AppendLog::new(tmp.path(), config(1));
        let tick = sample_tick();
        let mut rows = HashMap::new();
        rows.insert(tick.instrument_id.clone(), vec![tick.clone()]);
        log.submit(tick.trading_day.clone(), rows);
        log.stop(Duration::from_secs(2));

        log.archive_day(&tick.trading_day).unwrap();
        assert!(tmp.path().join(format!("{}.tar.gz", tick.trading_day)).exists());
        assert!(!tmp.path().join(&tick.trading_day).exists());
    }
}
