//! Gateway-facing boundary traits (§9 "cyclic references / back-pointers").
//! The native broker binding is out of scope for this core, but the bus
//! and registry still need a typed seam to call back across: writers get
//! an `AlarmSink` instead of a bus reference, and the registry gets a
//! `SubscriptionIssuer` instead of a gateway reference. A channel-backed
//! mock adapter exercises the whole pipeline end-to-end without a real
//! exchange connection — the same role the teacher's
//! `scrapers/mock_feed.rs` plays for its own ingestion tests.

use std::sync::Arc;

use tracing::info;

use crate::event_bus::EventBus;
use crate::model::{Event, EventKind, EventPayload};

/// Capability a storage writer or archiver needs to raise an operator
/// alarm without depending on the bus concretely.
pub trait AlarmSink: Send + Sync {
    fn raise(&self, message: String);
}

/// Capability the contract registry needs to issue the one-time bulk
/// subscription without depending on a concrete gateway type.
pub trait SubscriptionIssuer: Send + Sync {
    fn subscribe_all(&self, instrument_ids: Vec<String>);
}

/// Publishes alarms and subscription requests as ordinary bus events —
/// the default wiring used by `main.rs`. A real deployment could instead
/// hand the registry an adapter that calls straight into the native
/// gateway binding.
pub struct EventBusGateway {
    bus: Arc<EventBus>,
}

impl EventBusGateway {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl AlarmSink for EventBusGateway {
    fn raise(&self, message: String) {
        let event = Event::new(
            EventKind::SystemAlarm,
            "gateway",
            EventPayload::SystemAlarm { message },
        );
        let _ = self.bus.publish(event);
    }
}

impl SubscriptionIssuer for EventBusGateway {
    fn subscribe_all(&self, instrument_ids: Vec<String>) {
        let event = Event::new(
            EventKind::SubscribeAll,
            "gateway",
            EventPayload::SubscribeAll { instrument_ids },
        );
        let _ = self.bus.publish(event);
    }
}

/// A tick/bar source. The real implementation binds to the native broker
/// library (out of scope, §1); `MockGatewayAdapter` below stands in for
/// demos and integration tests.
pub trait GatewayAdapter: Send + Sync {
    /// Starts delivering ticks and login events onto the bus. Must be
    /// idempotent like every other component's `start()` (§4.8).
    fn start(&self, bus: Arc<EventBus>);
    fn stop(&self);
}

/// Feeds a fixed list of ticks onto the bus on a background thread, then
/// emits login events — enough to drive BarGeneratorSet, the storage
/// stack, and ContractRegistry gating without a real exchange connection.
pub struct MockGatewayAdapter {
    ticks: Vec<crate::model::Tick>,
    trading_day: String,
    stopped: Arc<std::sync::atomic::AtomicBool>,
}

impl MockGatewayAdapter {
    pub fn new(ticks: Vec<crate::model::Tick>, trading_day: impl Into<String>) -> Self {
        Self {
            ticks,
            trading_day: trading_day.into(),
            stopped: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }
}

impl GatewayAdapter for MockGatewayAdapter {
    fn start(&self, bus: Arc<EventBus>) {
        let ticks = self.ticks.clone();
        let trading_day = self.trading_day.clone();
        let stopped = Arc::clone(&self.stopped);
        std::thread::Builder::new()
            .name("mock-gateway".into())
            .spawn(move || {
                let _ = bus.publish(Event::new(
                    EventKind::MdGatewayLogin,
                    "mock-gateway",
                    EventPayload::GatewayLogin {
                        success: true,
                        trading_day: Some(trading_day.clone()),
                    },
                ));
                let _ = bus.publish(Event::new(
                    EventKind::TdGatewayLogin,
                    "mock-gateway",
                    EventPayload::GatewayLogin {
                        success: true,
                        trading_day: Some(trading_day),
                    },
                ));
                for tick in ticks {
                    if stopped.load(std::sync::atomic::Ordering::Acquire) {
                        break;
                    }
                    let _ = bus.publish(Event::new(
                        EventKind::Tick,
                        "mock-gateway",
                        EventPayload::Tick(Box::new(tick)),
                    ));
                }
                info!("mock gateway finished replaying ticks");
            })
            .expect("failed to spawn mock gateway thread");
    }

    fn stop(&self) {
        self.stopped.store(true, std::sync::atomic::Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventBusConfig;
    use crate::model::tests_support::sample_tick;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn mock_gateway_publishes_login_events_then_ticks() {
        let bus = EventBus::new(EventBusConfig::default());
        bus.start();

        let tick_count = Arc::new(AtomicUsize::new(0));
        let tick_count2 = Arc::clone(&tick_count);
        bus.subscribe_sync(EventKind::Tick, move |_event| {
            tick_count2.fetch_add(1, Ordering::SeqCst);
        });

        let adapter = MockGatewayAdapter::new(vec![sample_tick(), sample_tick()], "20251027");
        adapter.start(Arc::clone(&bus));

        std::thread::sleep(std::time::Duration::from_millis(200));
        bus.stop();
        assert_eq!(tick_count.load(Ordering::SeqCst), 2);
    }
}
