//! Static instrument table and market/trade gating protocol (§4.3). The
//! table is loaded once at startup into a fixed slab (`Vec<Contract>` plus
//! a name index) and never grows afterward — the same write-once,
//! read-many shape the teacher uses for its static route table in
//! `scrapers/market_catalog.rs`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::{DataCenterError, Result};
use crate::model::{Contract, ExchangeId};

/// Loaded once at startup; `contracts` never grows or shrinks afterward so
/// indices handed out by `index_of` stay valid for the registry's whole
/// lifetime.
pub struct ContractRegistry {
    contracts: Vec<Contract>,
    index: HashMap<String, usize>,
    market_ready: AtomicBool,
    trade_ready: AtomicBool,
    dispatched: AtomicBool,
    guard_timeout_secs: u64,
}

impl ContractRegistry {
    /// Parses the instrument table JSON (§6.2): an object mapping
    /// `instrument_id -> exchange_id`. A `BTreeMap` gives deterministic,
    /// sorted iteration order so the fixed slab it builds doesn't depend on
    /// JSON key order. Entries with an unrecognized exchange id are logged
    /// and skipped, not fatal — the rest of the table still loads.
    pub fn load(table_json: &str, guard_timeout_secs: u64) -> Result<Self> {
        let entries: BTreeMap<String, String> = serde_json::from_str(table_json).map_err(|e| {
            DataCenterError::Config(format!("instrument table parse failed: {e}"))
        })?;

        let mut contracts = Vec::with_capacity(entries.len());
        let mut index = HashMap::with_capacity(entries.len());
        for (instrument_id, exchange_id) in entries {
            let Some(exchange_id) = ExchangeId::parse(&exchange_id) else {
                warn!(instrument_id, exchange_id, "unknown exchange id; skipping instrument");
                continue;
            };
            index.insert(instrument_id.clone(), contracts.len());
            contracts.push(Contract::new(instrument_id, exchange_id));
        }

        Ok(Self {
            contracts,
            index,
            market_ready: AtomicBool::new(false),
            trade_ready: AtomicBool::new(false),
            dispatched: AtomicBool::new(false),
            guard_timeout_secs,
        })
    }

    pub fn contract(&self, instrument_id: &str) -> Option<&Contract> {
        self.index.get(instrument_id).map(|&i| &self.contracts[i])
    }

    pub fn contracts(&self) -> &[Contract] {
        &self.contracts
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    /// Records a tick's arrival time against its instrument, if known.
    /// Unknown instruments are logged and otherwise ignored — a tick for
    /// an instrument outside the static table cannot be dispatched
    /// (§4.3 "does not interfere with dispatch").
    pub fn observe_tick(&self, instrument_id: &str, at: chrono::DateTime<Utc>) {
        match self.contract(instrument_id) {
            Some(c) => c.touch(at),
            None => warn!(instrument_id, "tick for instrument outside static table"),
        }
    }

    pub fn set_market_ready(&self) {
        self.market_ready.store(true, Ordering::Release);
    }

    pub fn set_trade_ready(&self) {
        self.trade_ready.store(true, Ordering::Release);
    }

    pub fn market_ready(&self) -> bool {
        self.market_ready.load(Ordering::Acquire)
    }

    pub fn trade_ready(&self) -> bool {
        self.trade_ready.load(Ordering::Acquire)
    }

    /// True once both gateway sessions are ready. Checked on every guard
    /// tick and surfaced so callers (e.g. the supervisor's health probe)
    /// can observe gating progress.
    pub fn is_armed(&self) -> bool {
        self.market_ready() && self.trade_ready()
    }

    /// Forces `trade_ready` if the market session has been up long enough
    /// without a matching trade-session login. Returns `true` the instant
    /// it flips the flag, so callers can log a single warning rather than
    /// one per guard tick.
    fn force_trade_ready_if_timed_out(&self, market_ready_since: Option<std::time::Instant>) -> bool {
        if self.trade_ready() || !self.market_ready() {
            return false;
        }
        let Some(since) = market_ready_since else {
            return false;
        };
        if since.elapsed() >= Duration::from_secs(self.guard_timeout_secs) {
            self.trade_ready.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Marks the bulk subscription as issued. Returns `true` only the
    /// first time it's called — dispatch happens exactly once (§4.3
    /// "sticky `dispatched` flag").
    pub fn mark_dispatched(&self) -> bool {
        self.dispatched
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched.load(Ordering::Acquire)
    }

    /// Spawns the 3 s guard thread (§4.3, §5 cancellation). It polls
    /// `is_armed`, forces `trade_ready` after `guard_timeout_secs` of a
    /// lone market session, and invokes `on_armed` exactly once when both
    /// flags are up — stopping only when `stop_rx` fires, so the
    /// supervisor can bound its lifetime like every other background
    /// thread in this crate.
    pub fn spawn_guard(
        self: &Arc<Self>,
        on_armed: impl Fn() + Send + 'static,
        stop_rx: crossbeam_channel::Receiver<()>,
    ) -> std::thread::JoinHandle<()> {
        let registry = Arc::clone(self);
        std::thread::Builder::new()
            .name("contract-registry-guard".into())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(Duration::from_secs(3));
                let mut market_ready_since = None;
                loop {
                    crossbeam_channel::select! {
                        recv(ticker) -> _ => {
                            if registry.market_ready() && market_ready_since.is_none() {
                                market_ready_since = Some(std::time::Instant::now());
                            }
                            if registry.force_trade_ready_if_timed_out(market_ready_since) {
                                warn!(
                                    timeout_secs = registry.guard_timeout_secs,
                                    "forcing trade_ready after guard timeout; market data capture proceeds without a confirmed trade session"
                                );
                            }
                            if registry.is_armed() && registry.mark_dispatched() {
                                info!("both gateway sessions ready; issuing bulk subscription");
                                on_armed();
                                break;
                            }
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
            })
            .expect("failed to spawn contract registry guard thread")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> String {
        serde_json::json!({
            "rb2501": "SHFE",
            "IF2501": "CFFEX",
        })
        .to_string()
    }

    #[test]
    fn loads_instruments_into_fixed_slab() {
        let registry = ContractRegistry::load(&sample_table(), 60).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.contract("rb2501").unwrap().exchange_id,
            ExchangeId::Shfe
        );
    }

    #[test]
    fn skips_unknown_exchange_id_instead_of_failing_load() {
        let table = serde_json::json!({"x": "NOPE", "rb2501": "SHFE"}).to_string();
        let registry = ContractRegistry::load(&table, 60).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contract("x").is_none());
        assert!(registry.contract("rb2501").is_some());
    }

    #[test]
    fn arms_only_when_both_flags_are_set() {
        let registry = ContractRegistry::load(&sample_table(), 60).unwrap();
        assert!(!registry.is_armed());
        registry.set_market_ready();
        assert!(!registry.is_armed());
        registry.set_trade_ready();
        assert!(registry.is_armed());
    }

    #[test]
    fn mark_dispatched_is_exactly_once() {
        let registry = ContractRegistry::load(&sample_table(), 60).unwrap();
        assert!(registry.mark_dispatched());
        assert!(!registry.mark_dispatched());
    }

    #[test]
    fn observe_tick_updates_last_tick_time_for_known_instrument() {
        let registry = ContractRegistry::load(&sample_table(), 60).unwrap();
        let now = Utc::now();
        registry.observe_tick("rb2501", now);
        assert_eq!(registry.contract("rb2501").unwrap().last_tick_time(), Some(now));
    }

    #[test]
    fn observe_tick_on_unknown_instrument_does_not_panic() {
        let registry = ContractRegistry::load(&sample_table(), 60).unwrap();
        registry.observe_tick("does-not-exist", Utc::now());
    }

    /// Scenario S6 (§8): a market session alone for longer than the guard
    /// timeout forces `trade_ready` so capture is never blocked forever.
    #[test]
    fn force_trade_ready_flips_after_timeout_elapsed() {
        let registry = ContractRegistry::load(&sample_table(), 60).unwrap();
        registry.set_market_ready();
        let long_ago = std::time::Instant::now() - Duration::from_secs(61);
        assert!(registry.force_trade_ready_if_timed_out(Some(long_ago)));
        assert!(registry.trade_ready());
    }

    #[test]
    fn force_trade_ready_does_nothing_before_timeout() {
        let registry = ContractRegistry::load(&sample_table(), 60).unwrap();
        registry.set_market_ready();
        let recent = std::time::Instant::now();
        assert!(!registry.force_trade_ready_if_timed_out(Some(recent)));
        assert!(!registry.trade_ready());
    }
}
