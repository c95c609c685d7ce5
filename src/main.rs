//! Process entry point: loads configuration, builds the storage and
//! ingestion stack, registers every component with the supervisor, and
//! runs until a shutdown signal arrives. The build-then-supervise shape
//! mirrors the teacher's own `main.rs`, generalized from a fixed startup
//! sequence into an explicit dependency graph (§4.8).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use datacenter_core::bargen::{BarClosedCallback, BarGeneratorSet};
use datacenter_core::config::DataCenterConfig;
use datacenter_core::event_bus::EventBus;
use datacenter_core::gateway::{EventBusGateway, GatewayAdapter, MockGatewayAdapter, SubscriptionIssuer};
use datacenter_core::model::{Bar, Event, EventKind, EventPayload, Tick, WriteBatch};
use datacenter_core::registry::ContractRegistry;
use datacenter_core::storage::{append_log, hot_store, AppendLog, Archiver, ColdArchive, HotStore, StorageRouter};
use datacenter_core::supervisor::{ComponentSpec, Supervisor};

/// How long a component's background thread gets to join during shutdown
/// before the supervisor logs it and moves on (§5 cancellation).
const STOP_GRACE: Duration = Duration::from_secs(10);

/// How long a market session can run alone before trade_ready is forced
/// (§4.3), and an archive cycle's polling period.
const GUARD_TIMEOUT_SECS: u64 = 60;
const ARCHIVE_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Parser, Debug)]
#[command(name = "datacenter", about = "Futures market-data ingestion and storage core")]
struct Cli {
    /// Path to a TOML config file. Falls back to DATACENTER_CONFIG_PATH, then `datacenter.toml`.
    #[arg(long, env = "DATACENTER_CONFIG_PATH")]
    config: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => DataCenterConfig::load(&path).context("loading config")?,
        None => DataCenterConfig::from_env(),
    };
    let intervals = config.parsed_intervals().context("parsing bar_intervals")?;

    let bus = EventBus::new(config.event_bus.clone());

    let hot = Arc::new(
        HotStore::new(
            config.hot_store_dir.as_str(),
            hot_store::HotStoreConfig {
                tick_flush_threshold: config.hot_store.tick_flush_threshold,
                bar_flush_threshold: config.hot_store.bar_flush_threshold,
                max_flush_lifetime: Duration::from_secs(config.hot_store.max_flush_lifetime_secs),
                stop_timeout: Duration::from_secs(config.hot_store.stop_timeout_secs),
            },
        )
        .context("opening hot store")?,
    );
    let cold = Arc::new(ColdArchive::new(config.cold_archive_dir.as_str()).context("opening cold archive")?);
    let router = Arc::new(StorageRouter::new(Arc::clone(&hot), Arc::clone(&cold), config.retention_days));

    let append_log_config = append_log::AppendLogConfig {
        worker_count: config.append_log.worker_count,
        batch_threshold: config.append_log.batch_threshold,
        queue_capacity: config.append_log.queue_capacity,
        direct_write_wait: Duration::from_secs(config.append_log.direct_write_wait_secs),
    };
    let tick_log: Arc<AppendLog<Tick>> =
        AppendLog::new(format!("{}/ticks", config.append_log_dir), append_log_config);
    let bar_log: Arc<AppendLog<Bar>> =
        AppendLog::new(format!("{}/bars", config.append_log_dir), append_log_config);

    let instrument_table =
        std::fs::read_to_string(&config.instrument_table_path).context("reading instrument table")?;
    let registry =
        Arc::new(ContractRegistry::load(&instrument_table, GUARD_TIMEOUT_SECS).context("loading contract registry")?);

    let gateway = Arc::new(EventBusGateway::new(Arc::clone(&bus)));
    let archiver = Arc::new(Archiver::new(
        Arc::clone(&hot),
        Arc::clone(&cold),
        config.retention_days,
        intervals.clone(),
        Arc::clone(&gateway) as Arc<dyn datacenter_core::gateway::AlarmSink>,
    ));

    // Stands in for the native broker binding (out of scope, §1): replays
    // nothing by default, but the same wiring drives a fixture-fed demo.
    let trading_day = chrono::Utc::now().format("%Y%m%d").to_string();
    let mock_adapter = Arc::new(MockGatewayAdapter::new(Vec::new(), trading_day));

    let bar_router = Arc::clone(&router);
    let bar_log_for_bars = Arc::clone(&bar_log);
    let bus_for_bars = Arc::clone(&bus);
    let bar_callback: BarClosedCallback = Arc::new(move |bar| {
        let interval_tag = bar.bar_type.clone();
        let batch = WriteBatch {
            trading_day: bar.trading_day.clone(),
            rows: vec![bar.clone()],
        };
        if let Err(e) = bar_router.save_bars(batch, &interval_tag) {
            warn!(error = %e, "failed to persist closed bar");
        }
        let mut rows = HashMap::new();
        rows.insert(bar.instrument_id.clone(), vec![bar.clone()]);
        bar_log_for_bars.submit(bar.trading_day.clone(), rows);
        let _ = bus_for_bars.publish(Event::new(EventKind::Bar, "bargen", EventPayload::Bar(Box::new(bar))));
    });
    let bargen = Arc::new(BarGeneratorSet::new(intervals, bar_callback));

    let supervisor = Supervisor::new();

    supervisor.register(ComponentSpec {
        name: "event_bus".into(),
        dependencies: vec![],
        start: {
            let bus = Arc::clone(&bus);
            Box::new(move || {
                bus.start();
                Ok(())
            })
        },
        stop: {
            let bus = Arc::clone(&bus);
            Box::new(move || bus.stop())
        },
        health: None,
    });

    supervisor.register(ComponentSpec {
        name: "hot_store".into(),
        dependencies: vec![],
        start: Box::new(|| Ok(())),
        stop: {
            let hot = Arc::clone(&hot);
            Box::new(move || hot.stop())
        },
        health: None,
    });

    supervisor.register(ComponentSpec {
        name: "cold_archive".into(),
        dependencies: vec![],
        start: Box::new(|| Ok(())),
        stop: Box::new(|| {}),
        health: None,
    });

    supervisor.register(ComponentSpec {
        name: "append_log_ticks".into(),
        dependencies: vec![],
        start: Box::new(|| Ok(())),
        stop: {
            let tick_log = Arc::clone(&tick_log);
            Box::new(move || tick_log.stop(STOP_GRACE))
        },
        health: None,
    });

    supervisor.register(ComponentSpec {
        name: "append_log_bars".into(),
        dependencies: vec![],
        start: Box::new(|| Ok(())),
        stop: {
            let bar_log = Arc::clone(&bar_log);
            Box::new(move || bar_log.stop(STOP_GRACE))
        },
        health: None,
    });

    supervisor.register(ComponentSpec {
        name: "storage_router".into(),
        dependencies: vec!["hot_store".into(), "cold_archive".into()],
        start: Box::new(|| Ok(())),
        stop: Box::new(|| {}),
        health: None,
    });

    let registry_stop_tx: Arc<Mutex<Option<crossbeam_channel::Sender<()>>>> = Arc::new(Mutex::new(None));
    supervisor.register(ComponentSpec {
        name: "contract_registry".into(),
        dependencies: vec!["event_bus".into()],
        start: {
            let registry = Arc::clone(&registry);
            let gateway = Arc::clone(&gateway);
            let stop_tx_slot = Arc::clone(&registry_stop_tx);
            Box::new(move || {
                let (tx, rx) = crossbeam_channel::bounded(1);
                *stop_tx_slot.lock() = Some(tx);
                let instrument_ids: Vec<String> =
                    registry.contracts().iter().map(|c| c.instrument_id.clone()).collect();
                let gateway = Arc::clone(&gateway);
                registry.spawn_guard(
                    move || gateway.subscribe_all(instrument_ids.clone()),
                    rx,
                );
                Ok(())
            })
        },
        stop: {
            let stop_tx_slot = Arc::clone(&registry_stop_tx);
            Box::new(move || {
                if let Some(tx) = stop_tx_slot.lock().take() {
                    let _ = tx.send(());
                }
            })
        },
        health: None,
    });

    supervisor.register(ComponentSpec {
        name: "ingestion_pipeline".into(),
        dependencies: vec![
            "event_bus".into(),
            "storage_router".into(),
            "append_log_ticks".into(),
            "contract_registry".into(),
        ],
        start: {
            let bus = Arc::clone(&bus);
            let registry = Arc::clone(&registry);
            let router = Arc::clone(&router);
            let tick_log = Arc::clone(&tick_log);
            let bargen = Arc::clone(&bargen);
            Box::new(move || {
                let registry_for_tick = Arc::clone(&registry);
                let router_for_tick = Arc::clone(&router);
                let tick_log_for_tick = Arc::clone(&tick_log);
                let bargen_for_tick = Arc::clone(&bargen);
                bus.subscribe_sync(EventKind::Tick, move |event| {
                    let EventPayload::Tick(raw) = &event.payload else { return };
                    let mut tick = (**raw).clone();
                    tick.normalize_sentinels();
                    if !tick.is_usable() {
                        return;
                    }
                    registry_for_tick.observe_tick(&tick.instrument_id, tick.timestamp);
                    bargen_for_tick.update_tick(&tick);

                    let trading_day = tick.trading_day.clone();
                    if let Err(e) = router_for_tick.save_ticks(WriteBatch {
                        trading_day: trading_day.clone(),
                        rows: vec![tick.clone()],
                    }) {
                        warn!(error = %e, "failed to persist tick");
                    }
                    let mut rows = HashMap::new();
                    rows.insert(tick.instrument_id.clone(), vec![tick]);
                    tick_log_for_tick.submit(trading_day, rows);
                });

                let registry_for_md = Arc::clone(&registry);
                bus.subscribe_sync(EventKind::MdGatewayLogin, move |_event| {
                    registry_for_md.set_market_ready();
                });
                let registry_for_td = Arc::clone(&registry);
                bus.subscribe_sync(EventKind::TdGatewayLogin, move |_event| {
                    registry_for_td.set_trade_ready();
                });
                Ok(())
            })
        },
        stop: Box::new(|| {}),
        health: None,
    });

    let archiver_stop_tx: Arc<Mutex<Option<crossbeam_channel::Sender<()>>>> = Arc::new(Mutex::new(None));
    supervisor.register(ComponentSpec {
        name: "archiver".into(),
        dependencies: vec!["storage_router".into(), "contract_registry".into()],
        start: {
            let archiver = Arc::clone(&archiver);
            let registry = Arc::clone(&registry);
            let stop_tx_slot = Arc::clone(&archiver_stop_tx);
            Box::new(move || {
                let (tx, rx) = crossbeam_channel::bounded(1);
                *stop_tx_slot.lock() = Some(tx);
                let archiver = Arc::clone(&archiver);
                let registry = Arc::clone(&registry);
                std::thread::Builder::new()
                    .name("archiver-guard".into())
                    .spawn(move || {
                        let ticker = crossbeam_channel::tick(ARCHIVE_INTERVAL);
                        loop {
                            crossbeam_channel::select! {
                                recv(ticker) -> _ => {
                                    let today = chrono::Utc::now().date_naive();
                                    let day = today - chrono::Duration::days(1);
                                    for contract in registry.contracts() {
                                        if let Err(e) = archiver.migrate_day(&contract.instrument_id, day, today) {
                                            warn!(instrument_id = %contract.instrument_id, error = %e, "archive cycle failed");
                                        }
                                    }
                                }
                                recv(rx) -> _ => break,
                            }
                        }
                    })
                    .expect("failed to spawn archiver thread");
                Ok(())
            })
        },
        stop: {
            let stop_tx_slot = Arc::clone(&archiver_stop_tx);
            Box::new(move || {
                if let Some(tx) = stop_tx_slot.lock().take() {
                    let _ = tx.send(());
                }
            })
        },
        health: None,
    });

    supervisor.register(ComponentSpec {
        name: "gateway".into(),
        dependencies: vec!["ingestion_pipeline".into()],
        start: {
            let adapter = Arc::clone(&mock_adapter);
            let bus = Arc::clone(&bus);
            Box::new(move || {
                adapter.start(Arc::clone(&bus));
                Ok(())
            })
        },
        stop: {
            let adapter = Arc::clone(&mock_adapter);
            Box::new(move || adapter.stop())
        },
        health: None,
    });

    supervisor.start().context("starting supervisor")?;
    info!("datacenter-core started");

    let shutdown_done = supervisor.spawn_signal_handler();
    ctrlc_await(&supervisor)?;
    shutdown_done
        .recv_timeout(Duration::from_secs(30))
        .unwrap_or_else(|_| warn!("supervisor shutdown did not confirm within grace period"));

    info!("datacenter-core stopped");
    Ok(())
}

/// Blocks the calling thread until Ctrl-C (or the process's equivalent
/// termination signal) arrives, then requests a supervisor shutdown.
/// Split out from `main` so the signal source can be swapped (tests drive
/// `Supervisor::request_shutdown` directly instead, per its own doc
/// comment).
fn ctrlc_await(supervisor: &Arc<Supervisor>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building ctrl-c runtime")?;
    runtime.block_on(tokio::signal::ctrl_c()).context("waiting for ctrl-c")?;
    supervisor.request_shutdown();
    Ok(())
}
