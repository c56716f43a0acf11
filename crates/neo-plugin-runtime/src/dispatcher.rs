//! Lifecycle dispatcher.
//!
//! `PluginRuntime` is the host-facing entry point of one execution context.
//! It drives each plugin through
//! `Registered → Starting → Running → Stopping → Stopped` and routes events,
//! requests and timer ticks to the plugin's handlers.
//!
//! Handler errors and panics are caught here. Event failures are logged;
//! every other failure becomes a result the host can inspect.

use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::bridge::Bridge;
use crate::config::RuntimeConfig;
use crate::error::{panic_message, Result, RuntimeError};
use crate::host::{Clock, HostClock, HostOps};
use crate::plugin::{EventFn, HandlerResult, PluginContext, PluginDefinition};
use crate::registry::{PluginRegistry, PluginStatus};
use crate::timers::{Scheduler, TickReport};
use crate::types::{codes, Event, LifecycleState, ServiceRequest, ServiceResponse};

struct RuntimeState {
    config: RuntimeConfig,
    host: Rc<dyn HostOps>,
    registry: PluginRegistry,
    timers: Scheduler,
}

/// One isolated execution context. Cloning yields another handle to it.
#[derive(Clone)]
pub struct PluginRuntime {
    inner: Rc<RuntimeState>,
}

/// What to do with an event, decided under the registry borrow.
enum Delivery {
    Dispatch(Option<EventFn>, Rc<Value>, Event),
    Queued,
    Overflow,
    Skipped(LifecycleState),
}

/// Whether a request may proceed.
enum Gate {
    Open,
    Wait(oneshot::Receiver<bool>),
    Closed,
}

/// Settles a plugin left in `Starting` or `Stopping` when the start or stop
/// future is dropped before its handler finishes.
///
/// An abandoned start returns the plugin to `Registered` and releases
/// everything queued behind it; an abandoned stop removes the entry. Either
/// way the plugin's timers are cancelled.
struct TransitionGuard {
    registry: PluginRegistry,
    timers: Scheduler,
    id: String,
    in_flight: Option<LifecycleState>,
}

impl TransitionGuard {
    fn new(runtime: &PluginRuntime, id: &str, state: LifecycleState) -> Self {
        Self {
            registry: runtime.inner.registry.clone(),
            timers: runtime.inner.timers.clone(),
            id: id.to_string(),
            in_flight: Some(state),
        }
    }

    fn disarm(mut self) {
        self.in_flight = None;
    }
}

impl Drop for TransitionGuard {
    fn drop(&mut self) {
        let Some(state) = self.in_flight.take() else {
            return;
        };

        let cancelled = self.timers.cancel_owned_by(&self.id);
        if state == LifecycleState::Starting {
            // Dropping the waiters answers pending requests with NOT_RUNNING.
            self.registry.with_entry_mut(&self.id, |entry| {
                if entry.state == LifecycleState::Starting {
                    entry.state = LifecycleState::Registered;
                    entry.pending_events.clear();
                    entry.start_waiters.clear();
                }
            });
            tracing::warn!(plugin = %self.id, cancelled, "Start abandoned, plugin back to Registered");
        } else {
            self.registry.remove(&self.id);
            tracing::warn!(plugin = %self.id, cancelled, "Stop abandoned, plugin removed");
        }
    }
}

impl PluginRuntime {
    /// Create a runtime whose timers follow the host clock.
    pub fn new(host: Rc<dyn HostOps>, config: RuntimeConfig) -> Self {
        let clock: Rc<dyn Clock> = Rc::new(HostClock(host.clone()));
        Self::with_clock(host, config, clock)
    }

    /// Create a runtime with a separate clock for the timer scheduler.
    pub fn with_clock(host: Rc<dyn HostOps>, config: RuntimeConfig, clock: Rc<dyn Clock>) -> Self {
        let registry = PluginRegistry::new(config.context_id.clone());
        Self {
            inner: Rc::new(RuntimeState {
                config,
                host,
                registry,
                timers: Scheduler::new(clock),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.inner.registry
    }

    pub fn timers(&self) -> &Scheduler {
        &self.inner.timers
    }

    /// Register a plugin. `None` uses the context's own plugin id.
    pub fn register(&self, definition: PluginDefinition, id: Option<&str>) -> String {
        self.inner.registry.register(definition, id)
    }

    pub fn state(&self, id: &str) -> LifecycleState {
        self.inner.registry.state(id)
    }

    pub fn plugins(&self) -> Vec<PluginStatus> {
        self.inner.registry.statuses()
    }

    /// Fire due timers.
    pub fn tick(&self) -> TickReport {
        self.inner.timers.tick()
    }

    fn context(&self, id: &str, config: Rc<Value>) -> PluginContext {
        PluginContext::new(
            Bridge::new(id, self.inner.host.clone(), config),
            self.inner.timers.clone(),
            self.inner.registry.clone(),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Start / stop
    // ─────────────────────────────────────────────────────────────────────────

    /// Start a registered plugin.
    ///
    /// On failure the plugin returns to `Registered` so the host may retry.
    pub async fn start(&self, id: Option<&str>) -> Result<()> {
        let id = self.inner.registry.resolve(id)?;
        let definition = self
            .inner
            .registry
            .with_entry_mut(&id, |entry| match entry.state {
                LifecycleState::Registered => {
                    entry.state = LifecycleState::Starting;
                    Ok(entry.definition.clone())
                }
                state => Err(RuntimeError::InvalidState {
                    id: id.clone(),
                    operation: "start",
                    state,
                }),
            })
            .ok_or_else(|| RuntimeError::UnknownPlugin(id.clone()))??;
        tracing::debug!(plugin = %id, "Registered -> Starting");
        let guard = TransitionGuard::new(self, &id, LifecycleState::Starting);

        let config = Rc::new(self.inner.host.get_config(&id));
        self.inner
            .registry
            .with_entry_mut(&id, |entry| entry.config = config.clone());

        let outcome = match definition.on_start {
            Some(handler) => {
                let ctx = self.context(&id, config);
                invoke(&id, move || handler(ctx)).await
            }
            None => Ok(()),
        };
        guard.disarm();

        match outcome {
            Ok(()) => {
                let now = self.inner.host.now_ms();
                let (queued, waiters) = self
                    .inner
                    .registry
                    .with_entry_mut(&id, |entry| {
                        entry.state = LifecycleState::Running;
                        entry.started_at = Some(now);
                        (
                            std::mem::take(&mut entry.pending_events),
                            std::mem::take(&mut entry.start_waiters),
                        )
                    })
                    .unwrap_or_default();
                tracing::info!(plugin = %id, "Plugin started");

                // Waiting requests resume only once this call yields, so the
                // queued events still reach the plugin first.
                for waiter in waiters {
                    let _ = waiter.send(true);
                }
                for event in queued {
                    self.deliver(&id, event).await;
                }
                Ok(())
            }
            Err(err) => {
                let (dropped, waiters) = self
                    .inner
                    .registry
                    .with_entry_mut(&id, |entry| {
                        entry.state = LifecycleState::Registered;
                        (
                            std::mem::take(&mut entry.pending_events).len(),
                            std::mem::take(&mut entry.start_waiters),
                        )
                    })
                    .unwrap_or_default();
                self.inner.timers.cancel_owned_by(&id);
                tracing::error!(plugin = %id, "Start failed: {}", err);
                if dropped > 0 {
                    tracing::warn!(plugin = %id, dropped, "Discarding events queued during start");
                }

                for waiter in waiters {
                    let _ = waiter.send(false);
                }
                Err(err)
            }
        }
    }

    /// Stop a plugin and remove it from the registry.
    ///
    /// A plugin that was never started is unloaded without calling
    /// `on_stop`. The entry is removed even if `on_stop` fails.
    pub async fn stop(&self, id: Option<&str>) -> Result<()> {
        let id = self.inner.registry.resolve(id)?;
        let step = self
            .inner
            .registry
            .with_entry_mut(&id, |entry| match entry.state {
                LifecycleState::Running => {
                    entry.state = LifecycleState::Stopping;
                    Ok(Some((entry.definition.on_stop.clone(), entry.config.clone())))
                }
                LifecycleState::Registered => Ok(None),
                state => Err(RuntimeError::InvalidState {
                    id: id.clone(),
                    operation: "stop",
                    state,
                }),
            })
            .ok_or_else(|| RuntimeError::UnknownPlugin(id.clone()))??;

        let outcome = match step {
            Some((handler, config)) => {
                tracing::debug!(plugin = %id, "Running -> Stopping");
                let guard = TransitionGuard::new(self, &id, LifecycleState::Stopping);
                let outcome = match handler {
                    Some(handler) => {
                        let ctx = self.context(&id, config);
                        invoke(&id, move || handler(ctx)).await
                    }
                    None => Ok(()),
                };
                guard.disarm();
                outcome
            }
            None => Ok(()),
        };

        let cancelled = self.inner.timers.cancel_owned_by(&id);
        self.inner.registry.remove(&id);
        match &outcome {
            Ok(()) => tracing::info!(plugin = %id, cancelled, "Plugin stopped"),
            Err(err) => tracing::error!(plugin = %id, cancelled, "Stop failed, plugin removed: {}", err),
        }
        outcome
    }

    /// Stop every plugin, collecting failures.
    pub async fn shutdown(&self) -> Vec<(String, RuntimeError)> {
        let ids = self.inner.registry.ids();
        tracing::info!(count = ids.len(), "Shutting down plugins");

        let mut failures = Vec::new();
        for id in ids {
            if let Err(err) = self.stop(Some(&id)).await {
                failures.push((id, err));
            }
        }
        failures
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────────────────────

    /// Deliver an event to one plugin. A no-op unless the plugin is running
    /// (or starting, in which case the event is held until it runs).
    pub async fn event(&self, id: Option<&str>, event: Event) {
        match self.inner.registry.resolve(id) {
            Ok(id) => {
                self.deliver(&id, event).await;
            }
            Err(err) => tracing::debug!("Event {} dropped: {}", event.event_type, err),
        }
    }

    /// Deliver an event to every plugin subscribed to its type.
    ///
    /// Returns how many handlers were invoked.
    pub async fn broadcast(&self, event: Event) -> usize {
        let targets: Vec<String> = self
            .inner
            .registry
            .ids()
            .into_iter()
            .filter(|id| {
                self.inner
                    .registry
                    .get(id)
                    .is_some_and(|definition| definition.wants(&event))
            })
            .collect();

        let mut delivered = 0;
        for id in targets {
            if self.deliver(&id, event.clone()).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Returns whether a handler ran.
    async fn deliver(&self, id: &str, event: Event) -> bool {
        let queue = self.inner.config.queue_while_starting;
        let max_queued = self.inner.config.max_queued_events;

        let delivery = self
            .inner
            .registry
            .with_entry_mut(id, move |entry| match entry.state {
                LifecycleState::Running => Delivery::Dispatch(
                    entry.definition.on_event.clone(),
                    entry.config.clone(),
                    event,
                ),
                LifecycleState::Starting if queue => {
                    if entry.pending_events.len() >= max_queued {
                        Delivery::Overflow
                    } else {
                        entry.pending_events.push_back(event);
                        Delivery::Queued
                    }
                }
                state => Delivery::Skipped(state),
            })
            .unwrap_or(Delivery::Skipped(LifecycleState::Unregistered));

        match delivery {
            Delivery::Dispatch(Some(handler), config, event) => {
                let event_type = event.event_type.clone();
                let ctx = self.context(id, config);
                if let Err(err) = invoke(id, move || handler(ctx, event)).await {
                    tracing::error!(plugin = %id, event = %event_type, "Event handler failed: {}", err);
                }
                true
            }
            Delivery::Dispatch(None, _, _) => false,
            Delivery::Queued => {
                tracing::debug!(plugin = %id, "Event queued until plugin is running");
                false
            }
            Delivery::Overflow => {
                tracing::warn!(plugin = %id, max_queued, "Start queue full, event dropped");
                false
            }
            Delivery::Skipped(state) => {
                tracing::debug!(plugin = %id, %state, "Event dropped, plugin not running");
                false
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Requests
    // ─────────────────────────────────────────────────────────────────────────

    /// Route a request to one plugin. Always yields a response.
    pub async fn request(&self, id: Option<&str>, request: ServiceRequest) -> ServiceResponse {
        let id = match self.inner.registry.resolve(id) {
            Ok(id) => id,
            Err(err) => return err.into(),
        };

        let queue = self.inner.config.queue_while_starting;
        let gate = self
            .inner
            .registry
            .with_entry_mut(&id, |entry| match entry.state {
                LifecycleState::Running => Gate::Open,
                LifecycleState::Starting if queue => {
                    let (tx, rx) = oneshot::channel();
                    entry.start_waiters.push(tx);
                    Gate::Wait(rx)
                }
                _ => Gate::Closed,
            });

        match gate {
            None => return RuntimeError::UnknownPlugin(id).into(),
            Some(Gate::Closed) => return not_running(&id),
            Some(Gate::Wait(rx)) => {
                tracing::debug!(plugin = %id, "Request waiting for start to settle");
                if !matches!(rx.await, Ok(true)) {
                    return not_running(&id);
                }
            }
            Some(Gate::Open) => {}
        }

        self.dispatch_request(&id, request).await
    }

    async fn dispatch_request(&self, id: &str, request: ServiceRequest) -> ServiceResponse {
        let target = self.inner.registry.with_entry_mut(id, |entry| {
            (entry.state == LifecycleState::Running)
                .then(|| (entry.definition.on_request.clone(), entry.config.clone()))
        });

        let (handler, config) = match target {
            None => return RuntimeError::UnknownPlugin(id.to_string()).into(),
            Some(None) => return not_running(id),
            Some(Some(target)) => target,
        };
        let Some(handler) = handler else {
            return RuntimeError::NotImplemented("onRequest").into();
        };

        let request_type = request.request_type.clone();
        let ctx = self.context(id, config);
        match invoke(id, move || handler(ctx, request)).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(plugin = %id, request = %request_type, "Request handler failed: {}", err);
                err.into()
            }
        }
    }

    /// Route an untyped JSON request and return the response as JSON.
    pub async fn request_json(&self, id: Option<&str>, raw: Value) -> Value {
        let response = match serde_json::from_value::<ServiceRequest>(raw) {
            Ok(request) => self.request(id, request).await,
            Err(e) => ServiceResponse::error(
                codes::INVALID_REQUEST,
                format!("malformed service request: {e}"),
            ),
        };

        serde_json::to_value(&response).unwrap_or_else(|e| {
            serde_json::json!({
                "type": "Error",
                "code": codes::INVALID_RESPONSE,
                "message": e.to_string(),
            })
        })
    }
}

impl std::fmt::Debug for PluginRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRuntime")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

fn not_running(id: &str) -> ServiceResponse {
    ServiceResponse::error(codes::NOT_RUNNING, format!("Plugin '{id}' is not running"))
}

/// Run a handler, turning returned errors and panics (while building the
/// future or while polling it) into a `Handler` error.
async fn invoke<T>(
    plugin_id: &str,
    call: impl FnOnce() -> LocalBoxFuture<'static, HandlerResult<T>>,
) -> Result<T> {
    let failed = |message: String| RuntimeError::Handler {
        plugin_id: plugin_id.to_string(),
        message,
    };

    let future = panic::catch_unwind(AssertUnwindSafe(call))
        .map_err(|payload| failed(panic_message(&*payload)))?;

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(failed(format!("{err:#}"))),
        Err(payload) => Err(failed(panic_message(&*payload))),
    }
}
