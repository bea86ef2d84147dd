//! Bounded-concurrency load scheduler
//!
//! Paces displaying (fetch + decode) of preview URLs that are already
//! resolved. Tasks are keyed by row; a pump drains at most `max_in_flight`
//! pending task futures at a time, high lane first, and re-pumps whenever one
//! settles.

use crate::priority::{LaneQueue, LoadPriority, LoadRun, LoadTask, TicketId, Upsert};
use crate::yield_point::{PumpBudget, PumpUrgency, YieldPoint};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Default number of concurrently pending loads
pub const MAX_IN_FLIGHT: usize = 2;

/// Load scheduler configuration
#[derive(Debug, Clone)]
pub struct LoadSchedulerConfig {
    /// Maximum number of pending (asynchronous) task bodies at once
    pub max_in_flight: usize,

    /// Time a single pump pass may spend running synchronous bodies
    pub pump_budget: Duration,
}

impl Default for LoadSchedulerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: MAX_IN_FLIGHT,
            pump_budget: PumpBudget::DEFAULT,
        }
    }
}

impl LoadSchedulerConfig {
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn with_pump_budget(mut self, budget: Duration) -> Self {
        self.pump_budget = budget;
        self
    }
}

/// Load scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// `schedule()` calls that created a new queue entry
    pub scheduled: u64,

    /// `schedule()` calls that replaced a queued entry
    pub replaced: u64,

    /// Task bodies invoked
    pub started: u64,

    /// Task bodies finished (synchronously or by settling)
    pub completed: u64,

    /// Entries removed by `cancel()` before starting
    pub cancelled: u64,

    /// Entries currently queued
    pub queued: usize,

    /// Pending task bodies currently holding a slot
    pub in_flight: usize,
}

struct SchedulerState {
    lanes: LaneQueue,
    running: HashSet<String>,
    in_flight: usize,
    pump_scheduled: bool,
    next_ticket: TicketId,
    stats: LoadStats,
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    yield_point: YieldPoint,
    config: LoadSchedulerConfig,
}

/// Two-lane, bounded-concurrency task runner
///
/// # Example
///
/// ```
/// use jobrow_scheduler::{LoadPriority, LoadRun, LoadScheduler};
///
/// let scheduler = LoadScheduler::with_defaults();
/// let handle = scheduler.schedule("row-1", || LoadRun::Done, LoadPriority::High);
///
/// assert_eq!(handle.key(), "row-1");
/// assert_eq!(scheduler.stats().scheduled, 1);
/// ```
#[derive(Clone)]
pub struct LoadScheduler {
    inner: Arc<SchedulerInner>,
}

impl LoadScheduler {
    pub fn new(yield_point: YieldPoint, config: LoadSchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState {
                    lanes: LaneQueue::new(),
                    running: HashSet::new(),
                    in_flight: 0,
                    pump_scheduled: false,
                    next_ticket: 1,
                    stats: LoadStats::default(),
                }),
                yield_point,
                config,
            }),
        }
    }

    /// Timer-driven scheduler with default limits
    pub fn with_defaults() -> Self {
        Self::new(YieldPoint::timer_only(), LoadSchedulerConfig::default())
    }

    /// Schedule `run` under `key`
    ///
    /// If `key` is already queued its body is replaced; `High` also moves it
    /// to the front of the high lane. Returns a handle that cancels this
    /// particular scheduling if it has not started.
    pub fn schedule<F>(&self, key: &str, run: F, priority: LoadPriority) -> ScheduledLoad
    where
        F: FnOnce() -> LoadRun + Send + 'static,
    {
        let ticket = {
            let mut state = self.inner.state.lock();
            let ticket = state.next_ticket;
            state.next_ticket += 1;

            let task: LoadTask = Box::new(run);
            match state.lanes.upsert(key, ticket, priority, task) {
                Upsert::Inserted => state.stats.scheduled += 1,
                Upsert::Replaced => state.stats.replaced += 1,
            }
            ticket
        };
        trace!(key, ?priority, ticket, "load scheduled");

        SchedulerInner::request_pump(&self.inner);

        ScheduledLoad {
            key: key.to_string(),
            ticket,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Check whether `key` has a queued (not started) entry
    pub fn is_queued(&self, key: &str) -> bool {
        self.inner.state.lock().lanes.contains(key)
    }

    /// Lane of the queued entry for `key`, if any
    pub fn queued_priority(&self, key: &str) -> Option<LoadPriority> {
        self.inner.state.lock().lanes.priority_of(key)
    }

    /// Check whether a body for `key` is currently running
    pub fn is_running(&self, key: &str) -> bool {
        self.inner.state.lock().running.contains(key)
    }

    pub fn stats(&self) -> LoadStats {
        let state = self.inner.state.lock();
        let mut stats = state.stats.clone();
        stats.queued = state.lanes.len();
        stats.in_flight = state.in_flight;
        stats
    }
}

impl SchedulerInner {
    fn request_pump(this: &Arc<Self>) {
        let urgency = {
            let mut state = this.state.lock();
            if state.pump_scheduled
                || state.lanes.is_empty()
                || state.in_flight >= this.config.max_in_flight
                || !state.lanes.has_runnable(&state.running)
            {
                return;
            }
            state.pump_scheduled = true;
            if state.lanes.has_high() {
                PumpUrgency::Visible
            } else {
                PumpUrgency::Background
            }
        };

        let weak = Arc::downgrade(this);
        this.yield_point.defer(
            urgency,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    SchedulerInner::pump(&inner);
                }
            }),
        );
    }

    fn pump(this: &Arc<Self>) {
        let budget = PumpBudget::new(this.config.pump_budget);
        this.state.lock().pump_scheduled = false;

        loop {
            let next = {
                let mut state = this.state.lock();
                if state.in_flight >= this.config.max_in_flight {
                    None
                } else {
                    let running = std::mem::take(&mut state.running);
                    let popped = state.lanes.pop_runnable(&running);
                    state.running = running;
                    if let Some((key, _)) = &popped {
                        state.running.insert(key.clone());
                        state.stats.started += 1;
                    }
                    popped
                }
            };

            let Some((key, task)) = next else {
                break;
            };

            match std::panic::catch_unwind(AssertUnwindSafe(task.run)) {
                Ok(LoadRun::Pending(future)) => Self::track_pending(this, key, future),
                Ok(LoadRun::Done) => Self::finish(this, &key, false),
                Err(_) => {
                    warn!(key = %key, "load task panicked");
                    Self::finish(this, &key, false);
                }
            }

            if budget.is_exceeded() {
                trace!("pump budget exceeded, yielding");
                break;
            }
        }

        Self::request_pump(this);
    }

    fn track_pending(
        this: &Arc<Self>,
        key: String,
        future: futures::future::BoxFuture<'static, ()>,
    ) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(key = %key, "no tokio runtime for pending load, dropping it");
                Self::finish(this, &key, false);
                return;
            }
        };

        this.state.lock().in_flight += 1;
        let weak: Weak<Self> = Arc::downgrade(this);
        handle.spawn(async move {
            if AssertUnwindSafe(future).catch_unwind().await.is_err() {
                warn!(key = %key, "pending load panicked");
            }
            if let Some(inner) = weak.upgrade() {
                Self::finish(&inner, &key, true);
                Self::request_pump(&inner);
            }
        });
    }

    fn finish(this: &Arc<Self>, key: &str, was_pending: bool) {
        let mut state = this.state.lock();
        state.running.remove(key);
        if was_pending {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        state.stats.completed += 1;
    }
}

/// Cancel handle for one `schedule()` call
#[must_use = "dropping the handle does not cancel the load"]
pub struct ScheduledLoad {
    key: String,
    ticket: TicketId,
    inner: Weak<SchedulerInner>,
}

impl ScheduledLoad {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Remove the task if it has not started
    ///
    /// Returns `true` if the entry was removed. A later `schedule()` for the
    /// same key owns the entry, so cancelling a superseded handle is a no-op.
    pub fn cancel(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut state = inner.state.lock();
        let removed = state.lanes.remove(&self.key, self.ticket);
        if removed {
            state.stats.cancelled += 1;
            debug!(key = %self.key, "queued load cancelled");
        }
        removed
    }
}

impl std::fmt::Debug for ScheduledLoad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledLoad")
            .field("key", &self.key)
            .field("ticket", &self.ticket)
            .finish()
    }
}
