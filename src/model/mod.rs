//! Core data model: ticks, bars, contracts and the events that carry them
//! across the bus. Mirrors the column order spec'd for the hot-store tables
//! (`TradingDay`, `ExchangeID`, ... down to `Timestamp`) so a row can be
//! bound to a SQL statement positionally without a lookup table.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod interval;

pub use interval::Interval;

/// Sentinel the gateway uses for "no value" on price fields. Normalized to
/// zero on ingest per the wire schema.
pub const MAX_FLOAT_SENTINEL: f64 = f32::MAX as f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeId {
    Cffex,
    Shfe,
    Czce,
    Dce,
    Ine,
    Gfex,
}

impl ExchangeId {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CFFEX" => Some(Self::Cffex),
            "SHFE" => Some(Self::Shfe),
            "CZCE" => Some(Self::Czce),
            "DCE" => Some(Self::Dce),
            "INE" => Some(Self::Ine),
            "GFEX" => Some(Self::Gfex),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cffex => "CFFEX",
            Self::Shfe => "SHFE",
            Self::Czce => "CZCE",
            Self::Dce => "DCE",
            Self::Ine => "INE",
            Self::Gfex => "GFEX",
        }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Five price/volume levels of a bid or ask ladder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Ladder5 {
    pub prices: [f64; 5],
    pub volumes: [i64; 5],
}

/// A single market-quote update for one instrument. Field order matches
/// the `tick_<instrument>` table schema (see §6.4) so writers can bind
/// columns positionally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub instrument_id: String,
    pub exchange_id: ExchangeId,
    pub trading_day: String,
    pub exchange_inst_id: String,
    pub last_price: f64,
    pub pre_settlement_price: f64,
    pub pre_close_price: f64,
    pub pre_open_interest: i64,
    pub open_price: f64,
    pub highest_price: f64,
    pub lowest_price: f64,
    /// Cumulative session volume. This is `Tick.Volume` in the hot-store
    /// schema, distinct from a bar's windowed `Volume`.
    pub volume: i64,
    pub turnover: f64,
    pub open_interest: i64,
    pub close_price: f64,
    pub settlement_price: f64,
    pub upper_limit_price: f64,
    pub lower_limit_price: f64,
    pub pre_delta: f64,
    pub curr_delta: f64,
    pub update_time: String,
    pub update_millisec: i32,
    pub bid: Ladder5,
    pub ask: Ladder5,
    pub average_price: f64,
    pub action_day: String,
    pub banding_upper_price: f64,
    pub banding_lower_price: f64,
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    /// Derives `timestamp` from `action_day + update_time + update_millisec`.
    /// Returns `None` if any component fails to parse — callers treat this
    /// as malformed input (dropped at the entry point, per §7).
    pub fn derive_timestamp(action_day: &str, update_time: &str, update_millisec: i32) -> Option<DateTime<Utc>> {
        let date = NaiveDate::parse_from_str(action_day, "%Y%m%d").ok()?;
        let time = NaiveTime::parse_from_str(update_time, "%H:%M:%S").ok()?;
        let naive = NaiveDateTime::new(date, time)
            + chrono::Duration::milliseconds(update_millisec.max(0) as i64);
        Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
    }

    /// Normalizes the "MAX_FLOAT" sentinel used by the gateway for unset
    /// price fields down to zero, per §6.3.
    pub fn normalize_sentinels(&mut self) {
        for p in [
            &mut self.last_price,
            &mut self.pre_settlement_price,
            &mut self.pre_close_price,
            &mut self.open_price,
            &mut self.highest_price,
            &mut self.lowest_price,
            &mut self.close_price,
            &mut self.settlement_price,
            &mut self.upper_limit_price,
            &mut self.lower_limit_price,
            &mut self.average_price,
        ] {
            if *p >= MAX_FLOAT_SENTINEL {
                *p = 0.0;
            }
        }
        for p in self.bid.prices.iter_mut().chain(self.ask.prices.iter_mut()) {
            if *p >= MAX_FLOAT_SENTINEL {
                *p = 0.0;
            }
        }
    }

    /// A tick is usable for bar synthesis / storage only if it carries a
    /// real price and a derivable timestamp (§3 invariants, §8 boundary
    /// behaviors: "tick with missing last_price -> ignored").
    pub fn is_usable(&self) -> bool {
        self.last_price > 0.0
    }
}

/// A closed or in-progress candlestick bar. Field order matches the
/// `kline_<instrument>` table schema (§6.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub bar_type: String,
    pub trading_day: String,
    pub update_time: String,
    pub instrument_id: String,
    pub exchange_id: ExchangeId,
    pub volume: i64,
    pub open_interest: i64,
    pub open_price: f64,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub close_price: f64,
    /// Cumulative volume snapshot taken when the bar opened; used to derive
    /// `volume` as `last_volume_at_close - last_volume` (§3 invariant).
    pub last_volume: i64,
    pub timestamp: DateTime<Utc>,
}

/// Static instrument -> exchange mapping entry, loaded once at startup.
#[derive(Debug)]
pub struct Contract {
    pub instrument_id: String,
    pub exchange_id: ExchangeId,
    subscribed: std::sync::atomic::AtomicBool,
    last_tick_time: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl Contract {
    pub fn new(instrument_id: String, exchange_id: ExchangeId) -> Self {
        Self {
            instrument_id,
            exchange_id,
            subscribed: std::sync::atomic::AtomicBool::new(false),
            last_tick_time: parking_lot::Mutex::new(None),
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Marks the contract subscribed. Returns `true` the first time it's
    /// called (subscription is issued exactly once per instrument, §3).
    pub fn mark_subscribed(&self) -> bool {
        self.subscribed
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::AcqRel,
                std::sync::atomic::Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn touch(&self, at: DateTime<Utc>) {
        *self.last_tick_time.lock() = Some(at);
    }

    pub fn last_tick_time(&self) -> Option<DateTime<Utc>> {
        *self.last_tick_time.lock()
    }
}

/// Event kinds the bus dispatches on. `is_market` partitions events between
/// the `market` and `general` queues (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Tick,
    Bar,
    Timer,
    MdGatewayLogin,
    TdGatewayLogin,
    SubscribeAll,
    SystemAlarm,
}

impl EventKind {
    pub fn is_market(self) -> bool {
        matches!(self, Self::Tick | Self::Bar)
    }
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    Tick(Box<Tick>),
    Bar(Box<Bar>),
    Timer { at: DateTime<Utc> },
    GatewayLogin { success: bool, trading_day: Option<String> },
    SubscribeAll { instrument_ids: Vec<String> },
    SystemAlarm { message: String },
}

/// An in-process pub/sub event. Discarded after dispatch; never mutated by
/// a subscriber.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub trace_id: Uuid,
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(kind: EventKind, source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            kind,
            trace_id: Uuid::new_v4(),
            source: source.into(),
            payload,
        }
    }

    pub fn with_trace_id(mut self, trace_id: Uuid) -> Self {
        self.trace_id = trace_id;
        self
    }
}

/// A buffered group of rows awaiting flush, grouped by trading day upstream
/// of the writers (§3).
#[derive(Debug, Clone, Default)]
pub struct WriteBatch<T> {
    pub trading_day: String,
    pub rows: Vec<T>,
}

impl<T> WriteBatch<T> {
    pub fn new(trading_day: impl Into<String>) -> Self {
        Self {
            trading_day: trading_day.into(),
            rows: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Normalizes an instrument id into a SQL-safe table-name fragment:
/// lowercase, strip everything outside `[a-z0-9_]`, prepend `c` if the
/// result starts with a digit, fall back to `unknown` if empty (§4.4).
pub fn normalize_table_name(instrument_id: &str) -> String {
    let mut out: String = instrument_id
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if out.is_empty() {
        return "unknown".to_string();
    }
    if out.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        out.insert(0, 'c');
    }
    out
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    pub(crate) fn sample_tick() -> Tick {
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::tests_support::sample_tick;

    #[test]
    fn normalizes_plain_instrument_ids() {
        assert_eq!(normalize_table_name("rb2501"), "rb2501");
        assert_eq!(normalize_table_name("RB2501"), "rb2501");
    }

    #[test]
    fn prepends_c_for_leading_digit() {
        assert_eq!(normalize_table_name("2501rb"), "c2501rb");
    }

    #[test]
    fn strips_non_word_characters() {
        assert_eq!(normalize_table_name("rb-2501.c"), "rb2501c");
    }

    #[test]
    fn falls_back_to_unknown_when_empty() {
        assert_eq!(normalize_table_name("---"), "unknown");
    }

    #[test]
    fn sentinel_prices_normalize_to_zero() {
        let mut tick = sample_tick();
        tick.last_price = MAX_FLOAT_SENTINEL;
        tick.normalize_sentinels();
        assert_eq!(tick.last_price, 0.0);
    }

    #[test]
    fn tick_without_price_is_unusable() {
        let mut tick = sample_tick();
        tick.last_price = 0.0;
        assert!(!tick.is_usable());
    }
}
