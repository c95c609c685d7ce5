//! Scenario S3 (§8): feeding a burst of rows through a deliberately
//! undersized queue must never lose data. Every row lands on disk either
//! through the worker queue or the direct-write fallback; `failed_writes.log`
//! stays empty because neither path can actually fail on a healthy
//! filesystem.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use datacenter_core::model::{ExchangeId, Ladder5, Tick};
use datacenter_core::storage::{AppendLog, AppendLogConfig};

fn sample_tick() -> Tick {
    Tick {
        instrument_id: "rb2501".into(),
        exchange_id: ExchangeId::Shfe,
        trading_day: "20251027".into(),
        exchange_inst_id: "rb2501".into(),
        last_price: 3500.0,
        pre_settlement_price: 0.0,
        pre_close_price: 0.0,
        pre_open_interest: 0,
        open_price: 3500.0,
        highest_price: 3500.0,
        lowest_price: 3500.0,
        volume: 10,
        turnover: 0.0,
        open_interest: 1000,
        close_price: 3500.0,
        settlement_price: 0.0,
        upper_limit_price: 0.0,
        lower_limit_price: 0.0,
        pre_delta: 0.0,
        curr_delta: 0.0,
        update_time: "09:00:15".into(),
        update_millisec: 0,
        bid: Ladder5::default(),
        ask: Ladder5::default(),
        average_price: 0.0,
        action_day: "20251027".into(),
        banding_upper_price: 0.0,
        banding_lower_price: 0.0,
        timestamp: Tick::derive_timestamp("20251027", "09:00:15", 0).unwrap(),
    }
}

#[test]
fn s3_overflow_safety_no_rows_lost_under_backpressure() {
    let tmp = tempfile::tempdir().unwrap();
    let config = AppendLogConfig {
        worker_count: 1,
        batch_threshold: 1000,
        queue_capacity: 10,
        direct_write_wait: Duration::from_millis(50),
    };
    let log: Arc<AppendLog<Tick>> = AppendLog::new(tmp.path(), config);

    let base = sample_tick();
    for i in 0..100 {
        let mut tick = base.clone();
        tick.update_millisec = i;
        tick.timestamp = tick.timestamp + chrono::Duration::milliseconds(i as i64);
        let mut rows = HashMap::new();
        rows.insert(tick.instrument_id.clone(), vec![tick]);
        log.submit(base.trading_day.clone(), rows);
    }
    log.stop(Duration::from_secs(5));

    let csv_path = tmp.path().join(&base.trading_day).join(format!("{}.csv", base.instrument_id));
    let content = std::fs::read_to_string(&csv_path).unwrap();
    // header + 100 rows, all present and in arrival order.
    assert_eq!(content.lines().count(), 101);

    let failed_log = tmp.path().join("failed_writes.log");
    assert!(!failed_log.exists() || std::fs::read_to_string(&failed_log).unwrap().is_empty());
}
