//! Scenario S5 (§8): no subscription is issued until both the market and
//! trade gateway sessions report ready; once they do, exactly one bulk
//! subscription carrying every loaded instrument id is issued.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use datacenter_core::registry::ContractRegistry;

fn table() -> String {
    serde_json::json!({
        "rb2501": "SHFE",
        "IF2501": "CFFEX",
        "au2512": "SHFE",
    })
    .to_string()
}

#[test]
fn s5_subscribe_all_waits_for_both_gateways_then_fires_once() {
    let registry = Arc::new(ContractRegistry::load(&table(), 60).unwrap());
    let issued: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));

    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    let issued_for_guard = Arc::clone(&issued);
    let registry_for_guard = Arc::clone(&registry);
    registry.spawn_guard(
        move || {
            let ids: Vec<String> = registry_for_guard
                .contracts()
                .iter()
                .map(|c| c.instrument_id.clone())
                .collect();
            issued_for_guard.lock().unwrap().push(ids);
        },
        stop_rx,
    );

    // Neither gateway ready: no subscription after a few guard ticks.
    std::thread::sleep(Duration::from_millis(500));
    assert!(issued.lock().unwrap().is_empty());

    // Market session ready alone: still nothing.
    registry.set_market_ready();
    std::thread::sleep(Duration::from_millis(500));
    assert!(issued.lock().unwrap().is_empty());

    // Trade session ready too: the guard's next 3s tick fires exactly one
    // bulk subscription with every instrument id.
    registry.set_trade_ready();
    std::thread::sleep(Duration::from_secs(4));

    let calls = issued.lock().unwrap();
    assert_eq!(calls.len(), 1);
    let mut ids = calls[0].clone();
    ids.sort();
    assert_eq!(ids, vec!["IF2501".to_string(), "au2512".to_string(), "rb2501".to_string()]);
    assert!(registry.is_dispatched());

    let _ = stop_tx.send(());
}
