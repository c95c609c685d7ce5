//! In-process pub/sub event bus (§4.1). Two queues — `market` (ticks and
//! bars) and `general` (everything else) — each with its own bounded
//! `crossbeam_channel` and worker pool. Ticks can never be dropped: once
//! the bounded `market` queue is full and retries are exhausted, tick
//! events fall back to an unbounded overflow channel that the same workers
//! drain. Non-tick events are dropped (and counted) after the same retry
//! budget is exhausted.
//!
//! Async handlers run on a single background multi-thread-free tokio
//! runtime hosted on one dedicated OS thread (§9's coroutine note): this
//! keeps suspension semantics for async handlers without turning the whole
//! bus into an event loop.

mod trace;
mod worker;

pub use trace::current_trace_id;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::EventBusConfig;
use crate::model::{Event, EventKind};

type SyncHandler = dyn Fn(&Event) + Send + Sync + 'static;
type AsyncHandler = dyn Fn(Event) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Sync,
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

enum HandlerKind {
    Sync(Arc<SyncHandler>),
    Async(Arc<AsyncHandler>),
}

struct Subscription {
    id: HandlerId,
    handler: HandlerKind,
}

enum BusMessage {
    Event(Event),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum BusState {
    Created = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

struct Queue {
    tx: crossbeam_channel::Sender<BusMessage>,
    rx: crossbeam_channel::Receiver<BusMessage>,
    overflow_tx: crossbeam_channel::Sender<BusMessage>,
    overflow_rx: crossbeam_channel::Receiver<BusMessage>,
    capacity: usize,
}

impl Queue {
    fn bounded(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let (overflow_tx, overflow_rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            overflow_tx,
            overflow_rx,
            capacity,
        }
    }
}

pub struct EventBus {
    config: EventBusConfig,
    subscribers: RwLock<HashMap<EventKind, Vec<Subscription>>>,
    next_handler_id: AtomicU64,
    market: Queue,
    general: Queue,
    state: AtomicU8,
    worker_threads: parking_lot::Mutex<Vec<std::thread::JoinHandle<()>>>,
    timer_stop: crossbeam_channel::Sender<()>,
    timer_stop_rx: parking_lot::Mutex<Option<crossbeam_channel::Receiver<()>>>,
    async_runtime: tokio::runtime::Runtime,
    async_shutdown_tx: parking_lot::Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
    dropped_events: std::sync::atomic::AtomicU64,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Arc<Self> {
        let (timer_stop, timer_stop_rx) = crossbeam_channel::bounded(1);
        let async_runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build event bus async runtime");

        Arc::new(Self {
            market: Queue::bounded(config.soft_capacity),
            general: Queue::bounded(config.soft_capacity),
            config,
            subscribers: RwLock::new(HashMap::new()),
            next_handler_id: AtomicU64::new(1),
            state: AtomicU8::new(BusState::Created as u8),
            worker_threads: parking_lot::Mutex::new(Vec::new()),
            timer_stop,
            timer_stop_rx: parking_lot::Mutex::new(Some(timer_stop_rx)),
            async_runtime,
            async_shutdown_tx: parking_lot::Mutex::new(None),
            dropped_events: std::sync::atomic::AtomicU64::new(0),
        })
    }

    pub fn subscribe_sync<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.push_subscription(kind, HandlerKind::Sync(Arc::new(handler)))
    }

    pub fn subscribe_async<F, Fut>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed = move |event: Event| -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(handler(event))
        };
        self.push_subscription(kind, HandlerKind::Async(Arc::new(boxed)))
    }

    fn push_subscription(&self, kind: EventKind, handler: HandlerKind) -> HandlerId {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(kind)
            .or_default()
            .push(Subscription { id, handler });
        id
    }

    /// Idempotent: unsubscribing an id that isn't registered (anymore) is a
    /// no-op rather than an error.
    pub fn unsubscribe(&self, kind: EventKind, id: HandlerId) {
        if let Some(subs) = self.subscribers.write().get_mut(&kind) {
            subs.retain(|s| s.id != id);
        }
    }

    pub fn start(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                BusState::Created as u8,
                BusState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return; // already running/draining/stopped: idempotent no-op
        }

        let mut threads = self.worker_threads.lock();
        for i in 0..self.config.market_max_workers {
            threads.push(worker::spawn_worker(Arc::clone(self), QueueKind::Market, i));
        }
        for i in 0..self.config.general_max_workers {
            threads.push(worker::spawn_worker(Arc::clone(self), QueueKind::General, i));
        }

        // Drive the async-handler runtime on one dedicated background
        // thread (§9): handlers spawned via `Handle::spawn` only progress
        // while this block_on future is alive.
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        *self.async_shutdown_tx.lock() = Some(shutdown_tx);
        let driver_bus = Arc::clone(self);
        threads.push(std::thread::spawn(move || {
            driver_bus.async_runtime.block_on(async move {
                let _ = shutdown_rx.await;
            });
        }));
        drop(threads);

        let timer_bus = Arc::clone(self);
        let timer_stop_rx = self
            .timer_stop_rx
            .lock()
            .take()
            .expect("timer already started");
        let interval = Duration::from_millis(self.config.timer_interval_ms);
        self.worker_threads.lock().push(std::thread::spawn(move || {
            let ticker = crossbeam_channel::tick(interval);
            loop {
                crossbeam_channel::select! {
                    recv(ticker) -> _ => {
                        let event = Event::new(
                            EventKind::Timer,
                            "event_bus.timer",
                            crate::model::EventPayload::Timer { at: chrono::Utc::now() },
                        );
                        let _ = timer_bus.publish(event);
                    }
                    recv(timer_stop_rx) -> _ => break,
                }
            }
        }));
    }

    /// Non-blocking fast path with bounded backpressure. Ticks are never
    /// dropped: once `market`'s bounded sender is full and retries are
    /// exhausted, the event is routed to an unbounded overflow sender.
    /// Non-tick events are dropped (and counted) after the same retry
    /// budget.
    pub fn publish(&self, mut event: Event) -> Result<(), DataCenterBusy> {
        if event.trace_id.is_nil() {
            event.trace_id = Uuid::new_v4();
        }
        let queue = if event.kind.is_market() { &self.market } else { &self.general };
        let is_tick = event.kind == EventKind::Tick;

        let mut backoff = Duration::from_micros(100);
        let mut msg = BusMessage::Event(event);
        for _ in 0..self.config.publish_retries {
            match queue.tx.try_send(msg) {
                Ok(()) => return Ok(()),
                Err(crossbeam_channel::TrySendError::Full(back)) => {
                    msg = back;
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_millis(50));
                }
                Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                    return Err(DataCenterBusy::Disconnected);
                }
            }
        }

        if is_tick {
            // Ticks must never be dropped (§3 invariant, §4.1 overflow policy).
            queue
                .overflow_tx
                .send(msg)
                .map_err(|_| DataCenterBusy::Disconnected)?;
            Ok(())
        } else {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("datacenter.bus.dropped_events").increment(1);
            warn!("event dropped after exhausting publish retries");
            Err(DataCenterBusy::Dropped)
        }
    }

    pub fn dropped_event_count(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    fn subscribers_for(&self, kind: EventKind) -> Vec<HandlerSnapshot> {
        self.subscribers
            .read()
            .get(&kind)
            .map(|subs| {
                subs.iter()
                    .map(|s| match &s.handler {
                        HandlerKind::Sync(h) => HandlerSnapshot::Sync(Arc::clone(h)),
                        HandlerKind::Async(h) => HandlerSnapshot::Async(Arc::clone(h)),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `created -> running -> draining -> stopped`. Idempotent: calling
    /// `stop` more than once, or before `start`, never panics or double-runs
    /// shutdown work.
    pub fn stop(&self) {
        let prev = self.state.swap(BusState::Draining as u8, Ordering::AcqRel);
        if prev == BusState::Stopped as u8 || prev == BusState::Created as u8 {
            self.state.store(prev, Ordering::Release);
            return;
        }

        let _ = self.timer_stop.try_send(());
        // Every worker blocks in `select!` on this queue's channel, so each
        // one needs its own sentinel — a single Shutdown only wakes one
        // worker out of the pool, leaving the rest to idle until the join
        // grace period below expires.
        for _ in 0..self.config.market_max_workers {
            let _ = self.market.tx.send(BusMessage::Shutdown);
        }
        for _ in 0..self.config.general_max_workers {
            let _ = self.general.tx.send(BusMessage::Shutdown);
        }
        if let Some(tx) = self.async_shutdown_tx.lock().take() {
            let _ = tx.send(());
        }

        let threads = std::mem::take(&mut *self.worker_threads.lock());
        let grace = Duration::from_secs(3);
        for handle in threads {
            let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
            let _ = std::thread::Builder::new().spawn(move || {
                let _ = handle.join();
                let _ = done_tx.send(());
            });
            if done_rx.recv_timeout(grace).is_err() {
                warn!("event bus worker did not exit within the shutdown grace period");
            }
        }

        self.state.store(BusState::Stopped as u8, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataCenterBusy {
    Dropped,
    Disconnected,
}

pub(crate) enum HandlerSnapshot {
    Sync(Arc<SyncHandler>),
    Async(Arc<AsyncHandler>),
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum QueueKind {
    Market,
    General,
}

impl EventBus {
    pub(crate) fn queue(&self, kind: QueueKind) -> &Queue {
        match kind {
            QueueKind::Market => &self.market,
            QueueKind::General => &self.general,
        }
    }

    pub(crate) fn async_handle(&self) -> tokio::runtime::Handle {
        self.async_runtime.handle().clone()
    }

    pub(crate) fn dispatch(&self, event: Event) {
        let subs = self.subscribers_for(event.kind);
        for sub in subs {
            let trace_id = event.trace_id;
            match sub {
                HandlerSnapshot::Sync(handler) => {
                    trace::with_trace_id(trace_id, || {
                        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            handler(&event)
                        }));
                        if let Err(panic) = result {
                            error!(
                                trace_id = %trace_id,
                                kind = ?event.kind,
                                "sync handler panicked: {}",
                                panic_message(&panic)
                            );
                        }
                    });
                }
                HandlerSnapshot::Async(handler) => {
                    let event_clone = event.clone();
                    let fut = handler(event_clone);
                    let handle = self.async_handle();
                    handle.spawn(trace::scope_async(trace_id, async move {
                        let joined = tokio::spawn(fut).await;
                        if let Err(e) = joined {
                            error!(trace_id = %trace_id, "async handler panicked: {e}");
                        }
                    }));
                }
            }
        }
        debug!(trace_id = %event.trace_id, kind = ?event.kind, "event dispatched");
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventPayload;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn tick_event() -> Event {
        Event::new(
            EventKind::Tick,
            "test",
            EventPayload::Tick(Box::new(crate::model::tests_support::sample_tick())),
        )
    }

    #[test]
    fn sync_handler_receives_published_event() {
        let bus = EventBus::new(EventBusConfig::default());
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        bus.subscribe_sync(EventKind::Tick, move |_event| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.start();
        bus.publish(tick_event()).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        bus.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = EventBus::new(EventBusConfig::default());
        let id = bus.subscribe_sync(EventKind::Tick, |_| {});
        bus.unsubscribe(EventKind::Tick, id);
        bus.unsubscribe(EventKind::Tick, id); // second call must not panic
    }

    #[test]
    fn stop_is_idempotent_and_total() {
        let bus = EventBus::new(EventBusConfig::default());
        bus.start();
        bus.stop();
        bus.stop();
    }

    #[test]
    fn handler_panic_does_not_affect_other_subscribers() {
        let bus = EventBus::new(EventBusConfig::default());
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe_sync(EventKind::Tick, |_| panic!("boom"));
        let count2 = Arc::clone(&count);
        bus.subscribe_sync(EventKind::Tick, move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.start();
        bus.publish(tick_event()).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        bus.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
