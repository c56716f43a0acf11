//! Host primitives consumed by the runtime.
//!
//! The execution context has no I/O of its own. Everything a plugin can do
//! outside the runtime goes through a `HostOps` implementation supplied by
//! whoever created the context.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HostError;
use crate::types::{Event, PointValue};

/// Severity of a plugin log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primitive operations provided by the host.
///
/// All calls happen on the execution context's single thread, so
/// implementations need not be `Send`.
#[async_trait::async_trait(?Send)]
pub trait HostOps {
    /// Record a log line written by a plugin.
    fn log(&self, plugin_id: &str, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(plugin = %plugin_id, "{}", message),
            LogLevel::Debug => tracing::debug!(plugin = %plugin_id, "{}", message),
            LogLevel::Info => tracing::info!(plugin = %plugin_id, "{}", message),
            LogLevel::Warn => tracing::warn!(plugin = %plugin_id, "{}", message),
            LogLevel::Error => tracing::error!(plugin = %plugin_id, "{}", message),
        }
    }

    /// Read the current value of a point.
    async fn point_read(&self, path: &str) -> Result<PointValue, HostError>;

    /// Write a value to a point, resolving once acknowledged.
    async fn point_write(&self, path: &str, value: PointValue) -> Result<(), HostError>;

    /// Publish an event to the host's event bus.
    fn event_publish(&self, event: Event) -> Result<(), HostError>;

    /// Configuration for a plugin, fetched once when it starts.
    fn get_config(&self, _plugin_id: &str) -> serde_json::Value {
        serde_json::Value::Object(Default::default())
    }

    /// The authoritative virtual clock, in milliseconds.
    fn now_ms(&self) -> u64;

    /// Suspend for the given number of milliseconds.
    async fn sleep(&self, millis: u64) {
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Clocks
// ─────────────────────────────────────────────────────────────────────────────

/// Time source for the timer scheduler.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// Reads time from the host's `now_ms` primitive.
pub(crate) struct HostClock(pub(crate) Rc<dyn HostOps>);

impl Clock for HostClock {
    fn now_ms(&self) -> u64 {
        self.0.now_ms()
    }
}

/// A clock that only moves when told to.
///
/// Hosts can back `now_ms` with it, and tests use it to drive timers
/// deterministically.
#[derive(Debug, Default)]
pub struct VirtualClock {
    now: Cell<u64>,
}

impl VirtualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Cell::new(start_ms),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.now.get()
    }

    pub fn set(&self, ms: u64) {
        self.now.set(ms);
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get().saturating_add(ms));
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}
