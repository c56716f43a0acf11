//! Runtime configuration.
//!
//! Usually supplied by the supervisor that creates the execution context,
//! either built in code or read from a TOML file:
//!
//! ```toml
//! context_id = "hvac-plugins"
//! queue_while_starting = true
//! max_queued_events = 64
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Configuration for one execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Plugin id assigned to this execution context. Used when a plugin
    /// registers without naming itself.
    #[serde(default = "default_context_id")]
    pub context_id: String,

    /// Hold events and requests that arrive while a plugin is starting and
    /// deliver them once it is running. When false they are dropped.
    #[serde(default = "default_true")]
    pub queue_while_starting: bool,

    /// Per-plugin bound on events held while starting.
    #[serde(default = "default_max_queued_events")]
    pub max_queued_events: usize,
}

fn default_context_id() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_queued_events() -> usize {
    256
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            context_id: default_context_id(),
            queue_while_starting: true,
            max_queued_events: default_max_queued_events(),
        }
    }
}

impl RuntimeConfig {
    /// Create a config for the given context id with default settings.
    pub fn new(context_id: impl Into<String>) -> Self {
        Self {
            context_id: context_id.into(),
            ..Default::default()
        }
    }

    pub fn with_queue_while_starting(mut self, queue: bool) -> Self {
        self.queue_while_starting = queue;
        self
    }

    pub fn with_max_queued_events(mut self, max: usize) -> Self {
        self.max_queued_events = max;
        self
    }

    /// Parse a config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: RuntimeConfig =
            toml::from_str(text).map_err(|e| RuntimeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RuntimeError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.context_id.is_empty() {
            return Err(RuntimeError::Config("context_id must not be empty".to_string()));
        }
        Ok(())
    }
}
