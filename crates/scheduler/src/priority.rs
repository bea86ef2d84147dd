//! Two-lane task queue for preview loads
//!
//! Tasks are keyed by row identity. A key has at most one pending entry:
//! scheduling an existing key replaces its run function instead of adding a
//! second entry. High-priority entries are always drained before normal
//! ones, FIFO within each lane.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;

/// Load priority lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LoadPriority {
    /// Rows that already show something
    #[default]
    Normal = 0,

    /// Rows that currently show nothing (first paint matters most)
    High = 1,
}

/// Result of invoking a load task body
pub enum LoadRun {
    /// The task finished synchronously and does not hold an in-flight slot
    Done,

    /// The task is still running; it holds an in-flight slot until settled
    Pending(BoxFuture<'static, ()>),
}

impl LoadRun {
    /// Wrap a future as a pending run
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        LoadRun::Pending(future.boxed())
    }
}

impl std::fmt::Debug for LoadRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadRun::Done => f.write_str("Done"),
            LoadRun::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

/// A load task body
pub type LoadTask = Box<dyn FnOnce() -> LoadRun + Send + 'static>;

/// Unique id of one `schedule()` call, used to match cancel handles
pub type TicketId = u64;

pub(crate) struct PendingTask {
    pub(crate) ticket: TicketId,
    pub(crate) priority: LoadPriority,
    pub(crate) run: LoadTask,
}

/// Outcome of [`LaneQueue::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Upsert {
    Inserted,
    Replaced,
}

/// Keyed two-lane FIFO queue
///
/// Not thread-safe on its own; the load scheduler keeps it behind its state
/// mutex.
#[derive(Default)]
pub(crate) struct LaneQueue {
    high: VecDeque<String>,
    normal: VecDeque<String>,
    tasks: HashMap<String, PendingTask>,
}

impl LaneQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the pending task for `key`
    ///
    /// Replacing keeps the existing lane position, except that `High`
    /// relocates the key to the front of the high lane.
    pub(crate) fn upsert(
        &mut self,
        key: &str,
        ticket: TicketId,
        priority: LoadPriority,
        run: LoadTask,
    ) -> Upsert {
        if let Some(existing) = self.tasks.get_mut(key) {
            existing.ticket = ticket;
            existing.run = run;
            if priority == LoadPriority::High {
                existing.priority = LoadPriority::High;
                self.high.retain(|k| k != key);
                self.normal.retain(|k| k != key);
                self.high.push_front(key.to_string());
            }
            return Upsert::Replaced;
        }

        self.tasks.insert(
            key.to_string(),
            PendingTask {
                ticket,
                priority,
                run,
            },
        );
        match priority {
            LoadPriority::High => self.high.push_back(key.to_string()),
            LoadPriority::Normal => self.normal.push_back(key.to_string()),
        }
        Upsert::Inserted
    }

    /// Remove the pending task for `key` if it still belongs to `ticket`
    pub(crate) fn remove(&mut self, key: &str, ticket: TicketId) -> bool {
        match self.tasks.get(key) {
            Some(task) if task.ticket == ticket => {}
            _ => return false,
        }
        self.tasks.remove(key);
        self.high.retain(|k| k != key);
        self.normal.retain(|k| k != key);
        true
    }

    /// Pop the first runnable task, high lane first
    ///
    /// Keys in `busy` are skipped and stay queued so a key never runs
    /// concurrently with itself.
    pub(crate) fn pop_runnable(&mut self, busy: &HashSet<String>) -> Option<(String, PendingTask)> {
        for lane in [&mut self.high, &mut self.normal] {
            if let Some(index) = lane.iter().position(|k| !busy.contains(k)) {
                if let Some(key) = lane.remove(index) {
                    if let Some(task) = self.tasks.remove(&key) {
                        return Some((key, task));
                    }
                }
            }
        }
        None
    }

    pub(crate) fn has_runnable(&self, busy: &HashSet<String>) -> bool {
        self.high
            .iter()
            .chain(self.normal.iter())
            .any(|k| !busy.contains(k))
    }

    pub(crate) fn has_high(&self) -> bool {
        !self.high.is_empty()
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.tasks.contains_key(key)
    }

    pub(crate) fn priority_of(&self, key: &str) -> Option<LoadPriority> {
        self.tasks.get(key).map(|t| t.priority)
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
