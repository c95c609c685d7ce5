//! Unified read/write façade hiding the hot/cold split (§4.7). Writers
//! always fan out to both; readers compute the retention cutoff and merge
//! hot and cold results by timestamp.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::error::Result;
use crate::model::{Bar, Tick, WriteBatch};
use crate::storage::{cold_archive::ColdArchive, hot_store::HotStore};

pub struct StorageRouter {
    hot: Arc<HotStore>,
    cold: Arc<ColdArchive>,
    retention_days: i64,
}

impl StorageRouter {
    pub fn new(hot: Arc<HotStore>, cold: Arc<ColdArchive>, retention_days: i64) -> Self {
        Self {
            hot,
            cold,
            retention_days,
        }
    }

    pub fn save_ticks(&self, batch: WriteBatch<Tick>) -> Result<()> {
        let day = batch.trading_day.clone();
        if let Some(first) = batch.rows.first() {
            let date = first.timestamp.date_naive();
            self.cold.save_ticks(&first.instrument_id, date, batch.rows.clone())?;
        }
        self.hot.save_ticks(WriteBatch {
            trading_day: day,
            rows: batch.rows,
        });
        Ok(())
    }

    pub fn save_bars(&self, batch: WriteBatch<Bar>, interval_tag: &str) -> Result<()> {
        let day = batch.trading_day.clone();
        if let Some(first) = batch.rows.first() {
            let date = first.timestamp.date_naive();
            self.cold
                .save_bars(&first.instrument_id, interval_tag, date, batch.rows.clone())?;
        }
        self.hot.save_bars(WriteBatch {
            trading_day: day,
            rows: batch.rows,
        });
        Ok(())
    }

    fn cutoff(&self) -> DateTime<Utc> {
        Utc::now() - ChronoDuration::days(self.retention_days)
    }

    /// Merges HotStore and ColdArchive results for `[start, end]`, split
    /// at the retention cutoff, sorted ascending by timestamp (§4.7).
    pub fn query_ticks(
        &self,
        instrument_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        hot_days: &[String],
    ) -> Result<Vec<Tick>> {
        let cutoff = self.cutoff();
        let mut out = Vec::new();

        if start < cutoff {
            let cold_end = end.min(cutoff);
            out.extend(self.cold.query_ticks(instrument_id, start, cold_end)?);
        }
        if end >= cutoff {
            let hot_start = start.max(cutoff);
            out.extend(self.hot.query_ticks(instrument_id, hot_start, end, hot_days)?);
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
        hot_days: &[String],
    ) -> Result<Vec<Bar>> {
        let cutoff = self.cutoff();
        let mut out = Vec::new();

        if start < cutoff {
            let cold_end = end.min(cutoff);
            out.extend(self.cold.query_bars(instrument_id, interval_tag, start, cold_end)?);
        }
        if end >= cutoff {
            let hot_start = start.max(cutoff);
            out.extend(self.hot.query_bars(instrument_id, interval_tag, hot_start, end, hot_days)?);
        }

        out.sort_by_key(|r| r.timestamp);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests_support::sample_tick;
    use std::time::Duration;

    fn router() -> (tempfile::TempDir, tempfile::TempDir, StorageRouter) {
        let hot_tmp = tempfile::tempdir().unwrap();
        let cold_tmp = tempfile::tempdir().unwrap();
        let hot = Arc::new(
            HotStore::new(
                hot_tmp.path(),
                crate::storage::hot_store::HotStoreConfig {
                    tick_flush_threshold: 1,
                    bar_flush_threshold: 1,
                    max_flush_lifetime: Duration::from_secs(30),
                    stop_timeout: Duration::from_secs(5),
                },
            )
            .unwrap(),
        );
        let cold = Arc::new(ColdArchive::new(cold_tmp.path()).unwrap());
        let retention_days = 7;
        (hot_tmp, cold_tmp, StorageRouter::new(hot, cold, retention_days))
    }

    #[test]
    fn recent_query_is_served_entirely_from_hot_store() {
        let (_h, _c, router) = router();
        let mut tick = sample_tick();
        let now = Utc::now();
        tick.trading_day = now.format("%Y%m%d").to_string();
        tick.action_day = tick.trading_day.clone();
        tick.timestamp = now;
        router
            .save_ticks(WriteBatch {
                trading_day: tick.trading_day.clone(),
                rows: vec![tick.clone()],
            })
            .unwrap();

        let rows = router
            .query_ticks(
                &tick.instrument_id,
                Utc::now() - ChronoDuration::days(1),
                Utc::now() + ChronoDuration::days(1),
                &[tick.trading_day.clone()],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn recent_bar_query_is_scoped_to_its_interval() {
        let (_h, _c, router) = router();
        let now = Utc::now();
        let trading_day = now.format("%Y%m%d").to_string();
        let bar_5m = Bar {
            bar_type: "5m".into(),
            trading_day: trading_day.clone(),
            update_time: "09:05:00".into(),
            instrument_id: "rb2501".into(),
            exchange_id: crate::model::ExchangeId::Shfe,
            volume: 10,
            open_interest: 100,
            open_price: 3500.0,
            highest_price: 3510.0,
            lowest_price: 3490.0,
            close_price: 3505.0,
            last_volume: 0,
            timestamp: now,
        };
        let mut bar_1m = bar_5m.clone();
        bar_1m.bar_type = "1m".into();

        router
            .save_bars(
                WriteBatch {
                    trading_day: trading_day.clone(),
                    rows: vec![bar_5m, bar_1m],
                },
                "5m",
            )
            .unwrap();

        let rows = router
            .query_bars(
                "rb2501",
                "5m",
                now - ChronoDuration::hours(1),
                now + ChronoDuration::hours(1),
                &[trading_day],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].bar_type, "5m");
    }
}
