//! Capability bridge.
//!
//! The typed façade plugins use instead of calling host primitives directly.
//! A `Bridge` is bound to one plugin id and the config snapshot that plugin
//! was started with; it holds no other state.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Result, RuntimeError};
use crate::host::{HostOps, LogLevel};
use crate::types::{Event, PointValue};

/// Capability operations available to one plugin.
#[derive(Clone)]
pub struct Bridge {
    plugin_id: Rc<str>,
    host: Rc<dyn HostOps>,
    config: Rc<Value>,
}

impl Bridge {
    pub(crate) fn new(plugin_id: &str, host: Rc<dyn HostOps>, config: Rc<Value>) -> Self {
        Self {
            plugin_id: Rc::from(plugin_id),
            host,
            config,
        }
    }

    /// Id of the plugin this bridge acts for.
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn log(&self) -> Log<'_> {
        Log { bridge: self }
    }

    pub fn points(&self) -> Points<'_> {
        Points { bridge: self }
    }

    pub fn events(&self) -> Events<'_> {
        Events { bridge: self }
    }

    /// Configuration snapshot taken when the plugin started.
    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Get a config value as a specific type
    pub fn config_value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.config
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// The host's virtual clock in milliseconds.
    pub fn now(&self) -> u64 {
        self.host.now_ms()
    }

    /// Suspend for `millis` using the host's sleep primitive.
    pub async fn sleep(&self, millis: u64) {
        self.host.sleep(millis).await;
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("plugin_id", &self.plugin_id)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────────

/// Leveled log sink. Never fails.
pub struct Log<'a> {
    bridge: &'a Bridge,
}

impl Log<'_> {
    pub fn write(&self, level: LogLevel, message: impl fmt::Display) {
        let bridge = self.bridge;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            bridge
                .host
                .log(&bridge.plugin_id, level, &message.to_string());
        }));
        if outcome.is_err() {
            tracing::warn!(plugin = %bridge.plugin_id, "Log sink panicked, line dropped");
        }
    }

    pub fn trace(&self, message: impl fmt::Display) {
        self.write(LogLevel::Trace, message);
    }

    pub fn debug(&self, message: impl fmt::Display) {
        self.write(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.write(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl fmt::Display) {
        self.write(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.write(LogLevel::Error, message);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Points
// ─────────────────────────────────────────────────────────────────────────────

/// Point reads and writes. Both suspend until the host answers.
pub struct Points<'a> {
    bridge: &'a Bridge,
}

impl Points<'_> {
    pub async fn read(&self, path: &str) -> Result<PointValue> {
        Ok(self.bridge.host.point_read(path).await?)
    }

    pub async fn write(&self, path: &str, value: impl Into<PointValue>) -> Result<()> {
        let value = value.into();
        value.check_encodable()?;
        self.bridge.host.point_write(path, value).await?;
        Ok(())
    }

    /// Write an untyped JSON value, encoding it as a point value first.
    pub async fn write_json(&self, path: &str, value: Value) -> Result<()> {
        let value = PointValue::try_from(value)?;
        self.write(path, value).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

pub struct Events<'a> {
    bridge: &'a Bridge,
}

impl Events<'_> {
    /// Publish an event. The type is validated before the host is touched;
    /// a missing source or timestamp is filled in.
    pub fn publish(&self, mut event: Event) -> Result<()> {
        if event.event_type.is_empty() {
            return Err(RuntimeError::Validation(
                "event type must be a non-empty string".to_string(),
            ));
        }

        if event.source.is_none() {
            event.source = Some(self.bridge.plugin_id.to_string());
        }
        if event.timestamp.is_none() {
            event.timestamp = Some(self.bridge.host.now_ms());
        }

        self.bridge.host.event_publish(event)?;
        Ok(())
    }

    /// Create and publish an event
    pub fn emit(&self, event_type: impl Into<String>, data: Value) -> Result<()> {
        self.publish(Event::new(event_type).with_data(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HostError;
    use crate::testing::MockHost;
    use serde_json::json;

    fn bridge(host: &Rc<MockHost>) -> Bridge {
        Bridge::new("p1", host.clone(), Rc::new(json!({"setpoint": 21.5, "zone": "north"})))
    }

    #[tokio::test]
    async fn test_point_read_write() {
        let host = MockHost::new();
        let bridge = bridge(&host);

        bridge.points().write("ahu/sat", 55.5).await.unwrap();
        assert_eq!(
            bridge.points().read("ahu/sat").await.unwrap(),
            PointValue::Real(55.5)
        );
    }

    #[tokio::test]
    async fn test_point_read_host_failure() {
        let host = MockHost::new();
        let bridge = bridge(&host);

        let err = bridge.points().read("missing").await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::HostCommunication(HostError::NotFound(_))
        ));

        host.fail_points.set(true);
        let err = bridge.points().write("ahu/sat", true).await.unwrap_err();
        assert!(matches!(err, RuntimeError::HostCommunication(_)));
    }

    #[tokio::test]
    async fn test_point_write_rejects_unencodable() {
        let host = MockHost::new();
        let bridge = bridge(&host);

        let err = bridge.points().write("ahu/sat", f64::NAN).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Serialization(_)));

        let err = bridge
            .points()
            .write_json("ahu/sat", json!({"not": "a point"}))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Serialization(_)));
        assert!(host.points.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_point_write_json() {
        let host = MockHost::new();
        let bridge = bridge(&host);

        bridge.points().write_json("modes", json!([1, 2])).await.unwrap();
        assert_eq!(
            host.points.borrow().get("modes"),
            Some(&PointValue::Array(vec![
                PointValue::Integer(1),
                PointValue::Integer(2)
            ]))
        );
    }

    #[test]
    fn test_publish_rejects_empty_type_without_calling_host() {
        let host = MockHost::new();
        let bridge = bridge(&host);

        let err = bridge.events().publish(Event::new("")).unwrap_err();
        assert!(matches!(err, RuntimeError::Validation(_)));
        assert_eq!(host.publish_calls.get(), 0);
    }

    #[test]
    fn test_publish_fills_source_and_timestamp() {
        let host = MockHost::new();
        host.clock.set(5_000);
        let bridge = bridge(&host);

        bridge.events().emit("Alarm", json!({"level": 2})).unwrap();
        bridge
            .events()
            .publish(Event::new("Other").with_source("elsewhere").with_timestamp(1))
            .unwrap();

        let published = host.published.borrow();
        assert_eq!(published[0].source.as_deref(), Some("p1"));
        assert_eq!(published[0].timestamp, Some(5_000));
        assert_eq!(published[1].source.as_deref(), Some("elsewhere"));
        assert_eq!(published[1].timestamp, Some(1));
    }

    #[test]
    fn test_publish_host_failure() {
        let host = MockHost::new();
        host.fail_publish.set(true);
        let bridge = bridge(&host);

        let err = bridge.events().emit("Alarm", Value::Null).unwrap_err();
        assert!(matches!(err, RuntimeError::HostCommunication(_)));
    }

    #[test]
    fn test_log_stringifies() {
        let host = MockHost::new();
        let bridge = bridge(&host);

        bridge.log().info(42);
        bridge.log().error(format_args!("bad {}", "thing"));

        let logs = host.logs.borrow();
        assert_eq!(logs[0], ("p1".to_string(), LogLevel::Info, "42".to_string()));
        assert_eq!(logs[1].1, LogLevel::Error);
        assert_eq!(logs[1].2, "bad thing");
    }

    #[test]
    fn test_log_survives_panicking_display() {
        struct Explodes;
        impl fmt::Display for Explodes {
            fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
                panic!("display exploded")
            }
        }

        let host = MockHost::new();
        let bridge = bridge(&host);
        bridge.log().warn(Explodes);
        assert!(host.logs.borrow().is_empty());
    }

    #[test]
    fn test_config_snapshot() {
        let host = MockHost::new();
        let bridge = bridge(&host);

        assert_eq!(bridge.config_value::<f64>("setpoint"), Some(21.5));
        assert_eq!(bridge.config_value::<String>("zone").as_deref(), Some("north"));
        assert_eq!(bridge.config_value::<String>("missing"), None);

        let mut copy = bridge.config().clone();
        copy["setpoint"] = json!(30);
        assert_eq!(bridge.config_value::<f64>("setpoint"), Some(21.5));
    }

    #[tokio::test]
    async fn test_now_and_sleep() {
        let host = MockHost::new();
        host.clock.set(100);
        let bridge = bridge(&host);

        assert_eq!(bridge.now(), 100);
        bridge.sleep(50).await;
        assert_eq!(bridge.now(), 150);
    }
}
