//! Virtual timer scheduler.
//!
//! The execution context has no OS timers. Timers are recorded here and fired
//! only when the host calls [`Scheduler::tick`], at whatever cadence it likes.
//!
//! A tick reads the clock once, snapshots the due timers, and only then runs
//! callbacks, so a callback may schedule or cancel timers (including itself)
//! without disturbing the pass. Interval timers fire at most once per tick:
//! a late tick does not replay the periods it missed.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use serde_json::Value;

use crate::error::panic_message;
use crate::host::Clock;

/// Identifier of a scheduled timer. Never reused within a scheduler.
pub type TimerId = u64;

/// Callback invoked with the arguments given at schedule time.
pub type TimerCallback = Box<dyn FnMut(&[Value]) -> anyhow::Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    OneShot,
    Interval,
}

struct TimerHandle {
    kind: TimerKind,
    fire_at: u64,
    delay_ms: u64,
    /// Taken out while the callback runs.
    callback: Option<TimerCallback>,
    args: Rc<[Value]>,
    owner: Option<String>,
}

struct TimerTable {
    next_id: TimerId,
    timers: BTreeMap<TimerId, TimerHandle>,
}

/// Outcome of one tick pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Callbacks invoked during the pass.
    pub fired: usize,
    /// Invoked callbacks that returned an error or panicked.
    pub failed: usize,
}

/// Tick-driven timer table. Cloning yields another handle to the same table.
#[derive(Clone)]
pub struct Scheduler {
    table: Rc<RefCell<TimerTable>>,
    clock: Rc<dyn Clock>,
}

impl Scheduler {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            table: Rc::new(RefCell::new(TimerTable {
                next_id: 1,
                timers: BTreeMap::new(),
            })),
            clock,
        }
    }

    /// Schedule a callback `delay_ms` from now. Returns immediately.
    pub fn schedule<F>(&self, kind: TimerKind, delay_ms: u64, args: Vec<Value>, callback: F) -> TimerId
    where
        F: FnMut(&[Value]) -> anyhow::Result<()> + 'static,
    {
        self.schedule_owned(None, kind, delay_ms, args, Box::new(callback))
    }

    /// One-shot timer with no arguments.
    pub fn set_timeout<F>(&self, delay_ms: u64, mut callback: F) -> TimerId
    where
        F: FnMut() -> anyhow::Result<()> + 'static,
    {
        self.schedule(TimerKind::OneShot, delay_ms, Vec::new(), move |_| callback())
    }

    /// Interval timer with no arguments.
    pub fn set_interval<F>(&self, delay_ms: u64, mut callback: F) -> TimerId
    where
        F: FnMut() -> anyhow::Result<()> + 'static,
    {
        self.schedule(TimerKind::Interval, delay_ms, Vec::new(), move |_| callback())
    }

    pub(crate) fn schedule_owned(
        &self,
        owner: Option<&str>,
        kind: TimerKind,
        delay_ms: u64,
        args: Vec<Value>,
        callback: TimerCallback,
    ) -> TimerId {
        let fire_at = self.clock.now_ms().saturating_add(delay_ms);
        let id = self.allocate_id();
        let mut table = self.table.borrow_mut();
        table.timers.insert(
            id,
            TimerHandle {
                kind,
                fire_at,
                delay_ms,
                callback: Some(callback),
                args: args.into(),
                owner: owner.map(str::to_string),
            },
        );
        tracing::trace!(timer = id, ?kind, fire_at, "Timer scheduled");
        id
    }

    /// Take the next id without scheduling anything under it.
    pub(crate) fn allocate_id(&self) -> TimerId {
        let mut table = self.table.borrow_mut();
        let id = table.next_id;
        table.next_id += 1;
        id
    }

    /// Cancel a timer. Unknown or already fired ids are ignored.
    ///
    /// Returns whether a pending timer was removed.
    pub fn cancel(&self, id: TimerId) -> bool {
        self.table.borrow_mut().timers.remove(&id).is_some()
    }

    /// Cancel every timer scheduled on behalf of `owner`.
    pub fn cancel_owned_by(&self, owner: &str) -> usize {
        let mut table = self.table.borrow_mut();
        let before = table.timers.len();
        table
            .timers
            .retain(|_, timer| timer.owner.as_deref() != Some(owner));
        before - table.timers.len()
    }

    /// Number of pending timers.
    pub fn pending(&self) -> usize {
        self.table.borrow().timers.len()
    }

    /// Earliest time at which a pending timer becomes due.
    pub fn next_due(&self) -> Option<u64> {
        self.table
            .borrow()
            .timers
            .values()
            .map(|timer| timer.fire_at)
            .min()
    }

    /// Fire every timer that is due at the current clock time.
    pub fn tick(&self) -> TickReport {
        let now = self.clock.now_ms();
        let due: Vec<TimerId> = self
            .table
            .borrow()
            .timers
            .iter()
            .filter(|(_, timer)| timer.fire_at <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut report = TickReport::default();
        for id in due {
            let Some((kind, mut callback, args, owner)) = self.take_due(id) else {
                // Cancelled by an earlier callback in this pass.
                continue;
            };

            report.fired += 1;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&args[..])));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(format!("{err:#}")),
                Err(payload) => Some(panic_message(&*payload)),
            };
            if let Some(message) = failure {
                report.failed += 1;
                tracing::error!(
                    timer = id,
                    plugin = owner.as_deref().unwrap_or("-"),
                    "Timer callback failed: {}",
                    message
                );
            }

            if kind == TimerKind::Interval {
                let mut table = self.table.borrow_mut();
                // Gone if the callback cancelled its own interval.
                if let Some(timer) = table.timers.get_mut(&id) {
                    timer.callback = Some(callback);
                    timer.fire_at = now.saturating_add(timer.delay_ms);
                }
            }
        }

        report
    }

    /// Remove a one-shot, or borrow an interval's callback, for invocation.
    fn take_due(
        &self,
        id: TimerId,
    ) -> Option<(TimerKind, TimerCallback, Rc<[Value]>, Option<String>)> {
        let mut table = self.table.borrow_mut();
        let timer = table.timers.get_mut(&id)?;
        match timer.kind {
            TimerKind::OneShot => {
                let timer = table.timers.remove(&id)?;
                let callback = timer.callback?;
                Some((timer.kind, callback, timer.args, timer.owner))
            }
            TimerKind::Interval => {
                let callback = timer.callback.take()?;
                Some((
                    timer.kind,
                    callback,
                    timer.args.clone(),
                    timer.owner.clone(),
                ))
            }
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .finish()
    }
}
