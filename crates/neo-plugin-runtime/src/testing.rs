//! Test doubles shared by the unit tests.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::HostError;
use crate::host::{HostOps, LogLevel, VirtualClock};
use crate::types::{Event, PointValue};

/// Install a test subscriber once; honours `RUST_LOG`.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// In-memory host that records everything plugins do.
#[derive(Default)]
pub(crate) struct MockHost {
    pub clock: VirtualClock,
    pub logs: RefCell<Vec<(String, LogLevel, String)>>,
    pub published: RefCell<Vec<Event>>,
    pub publish_calls: Cell<usize>,
    pub points: RefCell<HashMap<String, PointValue>>,
    pub configs: RefCell<HashMap<String, serde_json::Value>>,
    pub config_calls: Cell<usize>,
    pub fail_points: Cell<bool>,
    pub fail_publish: Cell<bool>,
}

impl MockHost {
    pub fn new() -> Rc<Self> {
        init_tracing();
        Rc::new(Self::default())
    }

    pub fn log_messages(&self) -> Vec<String> {
        self.logs.borrow().iter().map(|(_, _, m)| m.clone()).collect()
    }
}

#[async_trait::async_trait(?Send)]
impl HostOps for MockHost {
    fn log(&self, plugin_id: &str, level: LogLevel, message: &str) {
        self.logs
            .borrow_mut()
            .push((plugin_id.to_string(), level, message.to_string()));
    }

    async fn point_read(&self, path: &str) -> Result<PointValue, HostError> {
        if self.fail_points.get() {
            return Err(HostError::Unavailable("point store offline".into()));
        }
        // Yield once so reads behave like a real suspension point.
        tokio::task::yield_now().await;
        self.points
            .borrow()
            .get(path)
            .cloned()
            .ok_or_else(|| HostError::NotFound(path.to_string()))
    }

    async fn point_write(&self, path: &str, value: PointValue) -> Result<(), HostError> {
        if self.fail_points.get() {
            return Err(HostError::Rejected("read only".into()));
        }
        tokio::task::yield_now().await;
        self.points.borrow_mut().insert(path.to_string(), value);
        Ok(())
    }

    fn event_publish(&self, event: Event) -> Result<(), HostError> {
        self.publish_calls.set(self.publish_calls.get() + 1);
        if self.fail_publish.get() {
            return Err(HostError::Unavailable("bus closed".into()));
        }
        self.published.borrow_mut().push(event);
        Ok(())
    }

    fn get_config(&self, plugin_id: &str) -> serde_json::Value {
        self.config_calls.set(self.config_calls.get() + 1);
        self.configs
            .borrow()
            .get(plugin_id)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}))
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    async fn sleep(&self, millis: u64) {
        self.clock.advance(millis);
        tokio::task::yield_now().await;
    }
}
