//! Per-queue worker threads. Each worker selects between its queue's
//! bounded primary channel and its unbounded overflow channel (the
//! tick-never-drop fallback, §4.1) and dispatches whatever it receives.

use std::sync::Arc;

use tracing::debug;

use super::{BusMessage, EventBus, QueueKind};

pub(crate) fn spawn_worker(
    bus: Arc<EventBus>,
    queue_kind: QueueKind,
    index: usize,
) -> std::thread::JoinHandle<()> {
    let name = match queue_kind {
        QueueKind::Market => format!("bus-market-{index}"),
        QueueKind::General => format!("bus-general-{index}"),
    };

    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            let queue = bus.queue(queue_kind);
            loop {
                crossbeam_channel::select! {
                    recv(queue.rx) -> msg => match msg {
                        Ok(BusMessage::Event(event)) => bus.dispatch(event),
                        Ok(BusMessage::Shutdown) | Err(_) => break,
                    },
                    recv(queue.overflow_rx) -> msg => match msg {
                        Ok(BusMessage::Event(event)) => bus.dispatch(event),
                        Ok(BusMessage::Shutdown) | Err(_) => break,
                    },
                }
            }
            debug!(?queue_kind, index, "event bus worker exiting");
        })
        .expect("failed to spawn event bus worker")
}
