//! Plugin definitions and the context handed to their handlers.

use std::fmt;
use std::future::Future;
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::bridge::{Bridge, Events, Log, Points};
use crate::console::Console;
use crate::registry::PluginRegistry;
use crate::timers::{Scheduler, TimerId, TimerKind};
use crate::types::{codes, Event, ServiceRequest, ServiceResponse};

/// Result type returned by plugin handlers.
pub type HandlerResult<T = ()> = anyhow::Result<T>;

pub(crate) type LifecycleFn = Rc<dyn Fn(PluginContext) -> LocalBoxFuture<'static, HandlerResult>>;
pub(crate) type EventFn =
    Rc<dyn Fn(PluginContext, Event) -> LocalBoxFuture<'static, HandlerResult>>;
pub(crate) type RequestFn = Rc<
    dyn Fn(PluginContext, ServiceRequest) -> LocalBoxFuture<'static, HandlerResult<ServiceResponse>>,
>;

/// A plugin: a set of optional lifecycle handlers.
///
/// ```ignore
/// let def = PluginDefinition::new("Hello")
///     .subscribe("Device/*")
///     .on_start(|ctx| async move {
///         ctx.log().info("started");
///         Ok(())
///     });
/// ```
#[derive(Clone, Default)]
pub struct PluginDefinition {
    pub name: String,
    /// Event type patterns used by [`crate::PluginRuntime::broadcast`].
    pub subscriptions: Vec<String>,
    pub(crate) on_start: Option<LifecycleFn>,
    pub(crate) on_stop: Option<LifecycleFn>,
    pub(crate) on_event: Option<EventFn>,
    pub(crate) on_request: Option<RequestFn>,
}

impl PluginDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add an event subscription pattern (`"*"`, `"Prefix/*"` or an exact type).
    pub fn subscribe(mut self, pattern: impl Into<String>) -> Self {
        self.subscriptions.push(pattern.into());
        self
    }

    pub fn on_start<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + 'static,
        Fut: Future<Output = HandlerResult> + 'static,
    {
        self.on_start = Some(Rc::new(move |ctx: PluginContext| handler(ctx).boxed_local()));
        self
    }

    pub fn on_stop<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + 'static,
        Fut: Future<Output = HandlerResult> + 'static,
    {
        self.on_stop = Some(Rc::new(move |ctx: PluginContext| handler(ctx).boxed_local()));
        self
    }

    pub fn on_event<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(PluginContext, Event) -> Fut + 'static,
        Fut: Future<Output = HandlerResult> + 'static,
    {
        self.on_event = Some(Rc::new(move |ctx: PluginContext, event: Event| {
            handler(ctx, event).boxed_local()
        }));
        self
    }

    pub fn on_request<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(PluginContext, ServiceRequest) -> Fut + 'static,
        Fut: Future<Output = HandlerResult<ServiceResponse>> + 'static,
    {
        self.on_request = Some(Rc::new(move |ctx: PluginContext, request: ServiceRequest| {
            handler(ctx, request).boxed_local()
        }));
        self
    }

    /// Request handler returning loosely-typed JSON.
    ///
    /// The value is validated into a [`ServiceResponse`]; a malformed shape is
    /// answered with an `INVALID_RESPONSE` error instead.
    pub fn on_request_json<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(PluginContext, ServiceRequest) -> Fut + 'static,
        Fut: Future<Output = HandlerResult<Value>> + 'static,
    {
        self.on_request = Some(Rc::new(move |ctx: PluginContext, request: ServiceRequest| {
            let plugin_id = ctx.plugin_id().to_string();
            let pending = handler(ctx, request);
            async move {
                let raw = pending.await?;
                Ok(ServiceResponse::from_json(raw).unwrap_or_else(|e| {
                    tracing::warn!(plugin = %plugin_id, "Malformed response: {}", e);
                    ServiceResponse::error(codes::INVALID_RESPONSE, e.to_string())
                }))
            }
            .boxed_local()
        }));
        self
    }

    pub fn has_on_start(&self) -> bool {
        self.on_start.is_some()
    }

    pub fn has_on_stop(&self) -> bool {
        self.on_stop.is_some()
    }

    pub fn has_on_event(&self) -> bool {
        self.on_event.is_some()
    }

    pub fn has_on_request(&self) -> bool {
        self.on_request.is_some()
    }

    /// Whether any subscription pattern matches the event.
    pub fn wants(&self, event: &Event) -> bool {
        self.subscriptions.iter().any(|pattern| event.matches(pattern))
    }
}

impl fmt::Debug for PluginDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDefinition")
            .field("name", &self.name)
            .field("subscriptions", &self.subscriptions)
            .field("on_start", &self.has_on_start())
            .field("on_stop", &self.has_on_stop())
            .field("on_event", &self.has_on_event())
            .field("on_request", &self.has_on_request())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Context
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a handler can reach: the bridge, a console, timers owned by
/// the plugin, and the registry.
#[derive(Clone)]
pub struct PluginContext {
    bridge: Bridge,
    timers: Scheduler,
    registry: PluginRegistry,
}

impl PluginContext {
    pub(crate) fn new(bridge: Bridge, timers: Scheduler, registry: PluginRegistry) -> Self {
        Self {
            bridge,
            timers,
            registry,
        }
    }

    pub fn plugin_id(&self) -> &str {
        self.bridge.plugin_id()
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn log(&self) -> Log<'_> {
        self.bridge.log()
    }

    pub fn points(&self) -> Points<'_> {
        self.bridge.points()
    }

    pub fn events(&self) -> Events<'_> {
        self.bridge.events()
    }

    pub fn console(&self) -> Console {
        Console::new(self.bridge.clone())
    }

    pub fn config(&self) -> &Value {
        self.bridge.config()
    }

    pub fn config_value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.bridge.config_value(key)
    }

    pub fn now(&self) -> u64 {
        self.bridge.now()
    }

    pub async fn sleep(&self, millis: u64) {
        self.bridge.sleep(millis).await;
    }

    /// Schedule a timer owned by this plugin. It is cancelled when the
    /// plugin stops.
    ///
    /// Once the plugin has been unloaded nothing is scheduled; the returned
    /// id never fires.
    pub fn schedule<F>(&self, kind: TimerKind, delay_ms: u64, args: Vec<Value>, callback: F) -> TimerId
    where
        F: FnMut(&[Value]) -> anyhow::Result<()> + 'static,
    {
        if !self.registry.contains(self.plugin_id()) {
            tracing::warn!(plugin = %self.plugin_id(), "Plugin unloaded, timer not scheduled");
            return self.timers.allocate_id();
        }
        self.timers
            .schedule_owned(Some(self.plugin_id()), kind, delay_ms, args, Box::new(callback))
    }

    pub fn set_timeout<F>(&self, delay_ms: u64, mut callback: F) -> TimerId
    where
        F: FnMut() -> anyhow::Result<()> + 'static,
    {
        self.schedule(TimerKind::OneShot, delay_ms, Vec::new(), move |_| callback())
    }

    pub fn set_interval<F>(&self, delay_ms: u64, mut callback: F) -> TimerId
    where
        F: FnMut() -> anyhow::Result<()> + 'static,
    {
        self.schedule(TimerKind::Interval, delay_ms, Vec::new(), move |_| callback())
    }

    pub fn clear_timer(&self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.plugin_id())
            .finish_non_exhaustive()
    }
}
