//! Dependency-ordered component lifecycle (§4.8). Components register
//! with a name, their dependencies, and start/stop/health callbacks;
//! `start()` runs them in Kahn topological order, `stop()` in reverse.
//! Modeled on the teacher's `main.rs` startup sequencing, generalized
//! from a fixed hand-written order into an explicit dependency graph.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use tracing::{error, info, warn};

use crate::error::{DataCenterError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ComponentState {
    Registered = 0,
    Running = 1,
    Stopped = 2,
    Error = 3,
}

pub type StartFn = Box<dyn Fn() -> Result<()> + Send>;
pub type StopFn = Box<dyn Fn() + Send>;
pub type HealthFn = Box<dyn Fn() -> bool + Send>;

struct Component {
    name: String,
    dependencies: Vec<String>,
    start: StartFn,
    stop: StopFn,
    health: Option<HealthFn>,
    state: AtomicU8,
}

impl Component {
    fn state(&self) -> ComponentState {
        match self.state.load(Ordering::Acquire) {
            1 => ComponentState::Running,
            2 => ComponentState::Stopped,
            3 => ComponentState::Error,
            _ => ComponentState::Registered,
        }
    }

    fn set_state(&self, s: ComponentState) {
        self.state.store(s as u8, Ordering::Release);
    }
}

/// Registration builder for one component, consumed by
/// `Supervisor::register`.
pub struct ComponentSpec {
    pub name: String,
    pub dependencies: Vec<String>,
    pub start: StartFn,
    pub stop: StopFn,
    pub health: Option<HealthFn>,
}

pub struct Supervisor {
    components: Mutex<HashMap<String, Component>>,
    order: Mutex<Vec<String>>,
    shutdown_tx: Mutex<Option<crossbeam_channel::Sender<()>>>,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            components: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            shutdown_tx: Mutex::new(None),
        })
    }

    pub fn register(&self, spec: ComponentSpec) {
        self.components.lock().insert(
            spec.name.clone(),
            Component {
                name: spec.name,
                dependencies: spec.dependencies,
                start: spec.start,
                stop: spec.stop,
                health: spec.health,
                state: AtomicU8::new(ComponentState::Registered as u8),
            },
        );
    }

    /// Kahn topological sort over the registered dependency graph. A
    /// cycle, or a dependency naming a component that was never
    /// registered, is a fatal configuration error (§4.8).
    fn topo_sort(&self) -> Result<Vec<String>> {
        let components = self.components.lock();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for name in components.keys() {
            in_degree.entry(name).or_insert(0);
        }
        for component in components.values() {
            for dep in &component.dependencies {
                if !components.contains_key(dep) {
                    return Err(DataCenterError::InvariantViolation {
                        component: "supervisor",
                        reason: format!(
                            "component '{}' depends on unregistered component '{dep}'",
                            component.name
                        ),
                    });
                }
                *in_degree.entry(component.name.as_str()).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(component.name.as_str());
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&name, _)| name)
            .collect();
        let mut queue_sorted: Vec<&str> = queue.drain(..).collect();
        queue_sorted.sort_unstable();
        let mut queue: VecDeque<&str> = queue_sorted.into();

        let mut order = Vec::with_capacity(components.len());
        while let Some(name) = queue.pop_front() {
            order.push(name.to_string());
            if let Some(deps) = dependents.get(name) {
                let mut next_ready = Vec::new();
                for &dependent in deps {
                    let degree = in_degree.get_mut(dependent).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        next_ready.push(dependent);
                    }
                }
                next_ready.sort_unstable();
                for d in next_ready {
                    queue.push_back(d);
                }
            }
        }

        if order.len() != components.len() {
            return Err(DataCenterError::InvariantViolation {
                component: "supervisor",
                reason: "cyclic dependency among registered components".to_string(),
            });
        }
        Ok(order)
    }

    /// Starts every component in topological order. On the first failure,
    /// aborts and stops the already-started tail in reverse order
    /// (§4.8).
    pub fn start(&self) -> Result<()> {
        let order = self.topo_sort()?;
        *self.order.lock() = order.clone();

        for (i, name) in order.iter().enumerate() {
            let result = {
                let components = self.components.lock();
                let component = &components[name];
                (component.start)()
            };
            match result {
                Ok(()) => {
                    let components = self.components.lock();
                    components[name].set_state(ComponentState::Running);
                    info!(component = name.as_str(), "component started");
                }
                Err(e) => {
                    error!(component = name.as_str(), error = %e, "component failed to start; rolling back");
                    {
                        let components = self.components.lock();
                        components[name].set_state(ComponentState::Error);
                    }
                    self.stop_range(&order[..i]);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn stop_range(&self, names: &[String]) {
        for name in names.iter().rev() {
            let components = self.components.lock();
            if let Some(component) = components.get(name) {
                if component.state() == ComponentState::Running {
                    (component.stop)();
                    component.set_state(ComponentState::Stopped);
                    info!(component = name.as_str(), "component stopped");
                }
            }
        }
    }

    /// Invokes every `stop-fn` in reverse topological order (§4.8).
    pub fn stop(&self) {
        let order = self.order.lock().clone();
        self.stop_range(&order);
    }

    /// Polls each component's health function, or treats `Running` as
    /// healthy when none was registered (§4.8).
    pub fn health_report(&self) -> Vec<(String, bool)> {
        let components = self.components.lock();
        let order = self.order.lock();
        order
            .iter()
            .map(|name| {
                let component = &components[name];
                let healthy = match &component.health {
                    Some(f) => f(),
                    None => component.state() == ComponentState::Running,
                };
                (name.clone(), healthy)
            })
            .collect()
    }

    /// Spawns a dedicated thread that calls `stop()` when a termination
    /// signal arrives (§4.8: "invokes `stop()` from a dedicated handler
    /// goroutine; the main process waits for it"). The returned receiver
    /// fires once `stop()` has completed.
    pub fn spawn_signal_handler(self: &Arc<Self>) -> crossbeam_channel::Receiver<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx);
        let supervisor = Arc::clone(self);
        std::thread::Builder::new()
            .name("supervisor-signal-handler".into())
            .spawn(move || {
                let _ = shutdown_rx.recv();
                warn!("shutdown signal received; stopping all components");
                supervisor.stop();
                let _ = tx.send(());
            })
            .expect("failed to spawn supervisor signal handler thread");
        rx
    }

    /// Triggers the signal handler thread registered via
    /// `spawn_signal_handler`. In `main.rs` this is wired to `ctrl_c()`;
    /// tests call it directly to exercise the same path deterministically.
    pub fn request_shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}
