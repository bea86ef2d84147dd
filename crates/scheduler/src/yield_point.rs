//! Host yield points for the load pump
//!
//! The load pump never runs inline with `schedule()`. It defers itself to a
//! host-provided callback: the next paint frame when visible content is
//! waiting, an idle callback otherwise. Hosts that expose neither get a
//! zero-delay timer on the tokio runtime. The strategy is resolved once from
//! [`HostCapabilities`] when the scheduler is built.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Callback handed to the host; invoking it runs one pump pass
pub type Wake = Box<dyn FnOnce() + Send + 'static>;

/// Host primitive that runs a callback before the next paint
pub trait FrameHost: Send + Sync {
    fn request_frame(&self, wake: Wake);
}

/// Host primitive that runs a callback when the event loop is idle
///
/// Implementations must invoke `wake` no later than `timeout`, even if the
/// loop never goes idle.
pub trait IdleHost: Send + Sync {
    fn request_idle(&self, timeout: Duration, wake: Wake);
}

/// Scheduling primitives the host offers
#[derive(Clone, Default)]
pub struct HostCapabilities {
    pub frame: Option<Arc<dyn FrameHost>>,
    pub idle: Option<Arc<dyn IdleHost>>,
}

impl HostCapabilities {
    /// No host primitives; every pump goes through the timer fallback
    pub fn timer_only() -> Self {
        Self::default()
    }

    pub fn with_frame(mut self, frame: Arc<dyn FrameHost>) -> Self {
        self.frame = Some(frame);
        self
    }

    pub fn with_idle(mut self, idle: Arc<dyn IdleHost>) -> Self {
        self.idle = Some(idle);
        self
    }
}

/// How urgently the pump wants to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpUrgency {
    /// High-priority work is waiting
    Visible,
    /// Only normal-priority work is waiting
    Background,
}

/// Concrete primitive chosen for one deferral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldStrategy {
    Frame,
    Idle,
    Timer,
}

/// Pluggable deferral point selected from host capabilities
#[derive(Clone)]
pub struct YieldPoint {
    caps: HostCapabilities,
    idle_timeout: Duration,
}

impl YieldPoint {
    /// Default bound on how long an idle callback may be postponed
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(200);

    pub fn new(caps: HostCapabilities) -> Self {
        Self {
            caps,
            idle_timeout: Self::DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn timer_only() -> Self {
        Self::new(HostCapabilities::timer_only())
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Pick the primitive for a given urgency
    ///
    /// Visible work prefers a paint frame, background work prefers idle time,
    /// and both degrade toward the timer.
    pub fn strategy_for(&self, urgency: PumpUrgency) -> YieldStrategy {
        let has_frame = self.caps.frame.is_some();
        let has_idle = self.caps.idle.is_some();
        match urgency {
            PumpUrgency::Visible if has_frame => YieldStrategy::Frame,
            PumpUrgency::Background if has_idle => YieldStrategy::Idle,
            _ if has_frame => YieldStrategy::Frame,
            _ => YieldStrategy::Timer,
        }
    }

    /// Defer `wake` to the chosen primitive
    pub fn defer(&self, urgency: PumpUrgency, wake: Wake) {
        match (self.strategy_for(urgency), &self.caps.frame, &self.caps.idle) {
            (YieldStrategy::Frame, Some(frame), _) => frame.request_frame(wake),
            (YieldStrategy::Idle, _, Some(idle)) => idle.request_idle(self.idle_timeout, wake),
            _ => defer_to_timer(wake),
        }
    }
}

fn defer_to_timer(wake: Wake) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            // Zero-delay: runs after everything already queued on the runtime
            handle.spawn(async move {
                tokio::task::yield_now().await;
                wake();
            });
        }
        Err(_) => {
            tracing::trace!("no tokio runtime for timer yield point, pumping inline");
            wake();
        }
    }
}

/// Time budget for one pump pass
///
/// Synchronous task bodies do not occupy in-flight slots, so a single pass
/// could otherwise drain hundreds of them without yielding.
#[derive(Debug, Clone)]
pub(crate) struct PumpBudget {
    started: Instant,
    budget: Duration,
}

impl PumpBudget {
    /// Half of a 60 FPS frame
    pub(crate) const DEFAULT: Duration = Duration::from_micros(8_333);

    pub(crate) fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub(crate) fn is_exceeded(&self) -> bool {
        self.started.elapsed() >= self.budget
    }
}
