//! Neo Plugin Runtime
//!
//! The in-context half of Neo's plugin system: everything that runs inside a
//! single sandboxed execution context once a plugin has been loaded into it.
//!
//! # Architecture
//!
//! - The context has no I/O of its own. The host supplies primitives through
//!   [`HostOps`] and plugins reach them only through the [`Bridge`]
//! - [`PluginRuntime`] drives each plugin through its lifecycle and routes
//!   events and requests to the plugin's handlers
//! - Timers are virtual: the host advances time by calling
//!   [`PluginRuntime::tick`]
//! - Execution is single-threaded and cooperative. Handlers suspend only at
//!   host calls (point reads/writes, sleep)
//!
//! ```ignore
//! let runtime = PluginRuntime::new(host, RuntimeConfig::default());
//! runtime.register(
//!     PluginDefinition::new("Thermostat")
//!         .subscribe("Point/*")
//!         .on_event(|ctx, event| async move {
//!             ctx.console().log(&[&"saw", &event.event_type]);
//!             Ok(())
//!         }),
//!     None,
//! );
//! runtime.start(None).await?;
//! runtime.broadcast(Event::new("Point/Changed")).await;
//! ```

mod bridge;
mod config;
mod console;
mod dispatcher;
mod error;
mod host;
mod plugin;
mod registry;
mod timers;
mod types;

#[cfg(test)]
mod testing;

pub use bridge::{Bridge, Events, Log, Points};
pub use config::RuntimeConfig;
pub use console::Console;
pub use dispatcher::PluginRuntime;
pub use error::{HostError, Result, RuntimeError};
pub use host::{Clock, HostOps, LogLevel, VirtualClock};
pub use plugin::{HandlerResult, PluginContext, PluginDefinition};
pub use registry::{PluginRegistry, PluginStatus};
pub use timers::{Scheduler, TickReport, TimerCallback, TimerId, TimerKind};
pub use types::{codes, Event, LifecycleState, PointValue, ServiceRequest, ServiceResponse};
