//! Ambient trace-id propagation (§4.1). The bus sets the current event's
//! trace id before invoking a handler and clears it afterward; handlers
//! observe it via [`current_trace_id`] rather than threading it through
//! every call signature.

use std::cell::Cell;

use uuid::Uuid;

thread_local! {
    static CURRENT_TRACE_ID: Cell<Option<Uuid>> = const { Cell::new(None) };
}

tokio::task_local! {
    static ASYNC_TRACE_ID: Uuid;
}

/// The trace id of the event currently being handled, if any. Works from
/// both sync handlers (thread-local) and async handlers (task-local).
pub fn current_trace_id() -> Option<Uuid> {
    if let Some(id) = CURRENT_TRACE_ID.with(|c| c.get()) {
        return Some(id);
    }
    ASYNC_TRACE_ID.try_with(|id| *id).ok()
}

pub(crate) fn with_trace_id<F, R>(id: Uuid, f: F) -> R
where
    F: FnOnce() -> R,
{
    CURRENT_TRACE_ID.with(|c| c.set(Some(id)));
    let result = f();
    CURRENT_TRACE_ID.with(|c| c.set(None));
    result
}

pub(crate) fn scope_async<F>(id: Uuid, fut: F) -> impl std::future::Future<Output = F::Output>
where
    F: std::future::Future,
{
    ASYNC_TRACE_ID.scope(id, fut)
}
