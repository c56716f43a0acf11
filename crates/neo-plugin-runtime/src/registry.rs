//! Plugin registry.
//!
//! Maps plugin ids to their definition and lifecycle state. Owned by one
//! runtime; clones share the same table.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Result, RuntimeError};
use crate::plugin::PluginDefinition;
use crate::types::{Event, LifecycleState};

pub(crate) struct RegistryEntry {
    pub definition: PluginDefinition,
    pub state: LifecycleState,
    /// Config snapshot taken at start.
    pub config: Rc<Value>,
    /// Events that arrived while starting.
    pub pending_events: VecDeque<Event>,
    /// Requests waiting for the start to settle; sent `true` on success.
    pub start_waiters: Vec<oneshot::Sender<bool>>,
    pub started_at: Option<u64>,
}

/// Point-in-time view of one registered plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginStatus {
    pub id: String,
    pub name: String,
    pub state: LifecycleState,
    pub started_at: Option<u64>,
}

struct RegistryInner {
    default_id: String,
    entries: BTreeMap<String, RegistryEntry>,
    current: Option<String>,
}

#[derive(Clone)]
pub struct PluginRegistry {
    inner: Rc<RefCell<RegistryInner>>,
}

impl PluginRegistry {
    /// Create an empty registry. `default_id` is used when a plugin
    /// registers without naming itself.
    pub fn new(default_id: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(RegistryInner {
                default_id: default_id.into(),
                entries: BTreeMap::new(),
                current: None,
            })),
        }
    }

    /// Insert or replace a definition. Replacing keeps the lifecycle state.
    ///
    /// The id becomes the current plugin.
    pub fn register(&self, definition: PluginDefinition, id: Option<&str>) -> String {
        let mut inner = self.inner.borrow_mut();
        let id = id.map_or_else(|| inner.default_id.clone(), str::to_string);

        match inner.entries.get_mut(&id) {
            Some(entry) => {
                tracing::debug!(plugin = %id, state = %entry.state, "Replacing plugin definition");
                entry.definition = definition;
            }
            None => {
                tracing::debug!(plugin = %id, name = %definition.name, "Plugin registered");
                inner.entries.insert(
                    id.clone(),
                    RegistryEntry {
                        definition,
                        state: LifecycleState::Registered,
                        config: Rc::new(Value::Object(Default::default())),
                        pending_events: VecDeque::new(),
                        start_waiters: Vec::new(),
                        started_at: None,
                    },
                );
            }
        }

        inner.current = Some(id.clone());
        id
    }

    /// Definition registered under `id`.
    pub fn get(&self, id: &str) -> Option<PluginDefinition> {
        self.inner
            .borrow()
            .entries
            .get(id)
            .map(|entry| entry.definition.clone())
    }

    /// Lifecycle state of `id`; `Unregistered` if unknown.
    pub fn state(&self, id: &str) -> LifecycleState {
        self.inner
            .borrow()
            .entries
            .get(id)
            .map_or(LifecycleState::Unregistered, |entry| entry.state)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.borrow().entries.contains_key(id)
    }

    /// Most recently registered id, if it is still present.
    pub fn current(&self) -> Option<String> {
        self.inner.borrow().current.clone()
    }

    /// Resolve an optional id to a concrete one, falling back to the current
    /// plugin.
    pub fn resolve(&self, id: Option<&str>) -> Result<String> {
        match id {
            Some(id) => Ok(id.to_string()),
            None => self.current().ok_or(RuntimeError::NoCurrentPlugin),
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.borrow().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().entries.is_empty()
    }

    pub fn statuses(&self) -> Vec<PluginStatus> {
        self.inner
            .borrow()
            .entries
            .iter()
            .map(|(id, entry)| PluginStatus {
                id: id.clone(),
                name: entry.definition.name.clone(),
                state: entry.state,
                started_at: entry.started_at,
            })
            .collect()
    }

    pub fn status(&self, id: &str) -> Option<PluginStatus> {
        self.statuses().into_iter().find(|status| status.id == id)
    }

    pub(crate) fn remove(&self, id: &str) -> Option<RegistryEntry> {
        let mut inner = self.inner.borrow_mut();
        if inner.current.as_deref() == Some(id) {
            inner.current = None;
        }
        inner.entries.remove(id)
    }

    /// Run `f` against the entry for `id`. The borrow ends when `f` returns,
    /// so `f` must not call back into the registry.
    pub(crate) fn with_entry_mut<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut RegistryEntry) -> R,
    ) -> Option<R> {
        self.inner.borrow_mut().entries.get_mut(id).map(f)
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("ids", &self.ids())
            .field("current", &self.current())
            .finish()
    }
}
