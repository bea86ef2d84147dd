//! Progress smoothing
//!
//! Turns a job's coarse `progress` field plus optional encoder telemetry into
//! a single eased 0-100 value per row. Between backend reports the value is
//! extrapolated from the last sample's speed, never regresses within an
//! epoch, and eases over a window derived from the reporting interval.

use crate::job::{JobStatus, JobView, ProgressSample};
use jobrow_cache::PipelineConfig;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Backend reporting interval assumed when the host has none configured
pub const DEFAULT_REPORT_INTERVAL_MS: u64 = 250;

/// Telemetry older than this is not extrapolated
pub const DEFAULT_STALE_AFTER_MS: u64 = 30_000;

/// Extrapolated values stop short of completion
pub const MAX_ESTIMATE: f64 = 99.9;

const EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressConfig {
    pub report_interval_ms: u64,
    pub stale_after_ms: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: DEFAULT_REPORT_INTERVAL_MS,
            stale_after_ms: DEFAULT_STALE_AFTER_MS,
        }
    }
}

impl From<&PipelineConfig> for ProgressConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            report_interval_ms: config.progress_interval_ms,
            stale_after_ms: config.stale_after_ms,
        }
    }
}

/// Easing window for a backend reporting interval
///
/// Fast reporting is already smooth and gets no easing; slow reporting eases
/// over the interval itself, capped at one second.
pub fn easing_duration_ms(report_interval_ms: u64) -> u64 {
    match report_interval_ms {
        0..=79 => 0,
        80..=200 => 150,
        ms => ms.min(1000),
    }
}

/// Job fields the smoother consumes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgressInput {
    pub status: JobStatus,
    pub progress: f64,
    pub duration_seconds: Option<f64>,
    pub sample: ProgressSample,
}

impl From<&JobView> for ProgressInput {
    fn from(job: &JobView) -> Self {
        Self {
            status: job.status,
            progress: job.progress,
            duration_seconds: job.duration_seconds(),
            sample: job.wait_metadata.clone().unwrap_or_default(),
        }
    }
}

/// Identity of one telemetry sample, used to freeze stale estimates
#[derive(Debug, Clone, Copy, PartialEq)]
struct SampleKey {
    epoch: Option<u64>,
    out_time_seconds: f64,
    updated_at_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct FrozenEstimate {
    key: SampleKey,
    value: f64,
}

/// Ease-out cubic interpolation between two values
#[derive(Debug, Clone, Copy, Default)]
struct EaseTrack {
    from: f64,
    to: f64,
    start_ms: u64,
    duration_ms: u64,
}

impl EaseTrack {
    fn fixed(value: f64, now_ms: u64) -> Self {
        Self {
            from: value,
            to: value,
            start_ms: now_ms,
            duration_ms: 0,
        }
    }

    fn position(&self, now_ms: u64) -> f64 {
        let elapsed = now_ms.saturating_sub(self.start_ms);
        if self.duration_ms == 0 || elapsed >= self.duration_ms {
            return self.to;
        }
        let t = elapsed as f64 / self.duration_ms as f64;
        let eased = 1.0 - (1.0 - t).powi(3);
        self.from + (self.to - self.from) * eased
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Per-row progress smoothing state
///
/// # Example
///
/// ```
/// use jobrow_core::{JobStatus, ProgressInput, ProgressSmoother};
///
/// let mut smoother = ProgressSmoother::default();
/// smoother.observe(
///     &ProgressInput {
///         status: JobStatus::Processing,
///         progress: 25.0,
///         ..Default::default()
///     },
///     0,
/// );
/// assert_eq!(smoother.tick(0), 25.0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ProgressSmoother {
    config: ProgressConfig,
    input: Option<ProgressInput>,

    /// Value held while paused and used as the resume baseline
    remembered: Option<f64>,

    /// Highest value shown in the current processing run
    peak: f64,

    /// One-shot permission to move below `peak`
    allow_back: bool,

    epoch: Option<u64>,
    last_out_time: Option<f64>,
    frozen: Option<FrozenEstimate>,
    pending_snap: Option<f64>,

    initialized: bool,
    displayed: f64,
    transition_ms: u64,
    track: EaseTrack,
}

impl ProgressSmoother {
    pub fn new(config: ProgressConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> ProgressConfig {
        self.config
    }

    /// Ingest the latest job fields
    pub fn observe(&mut self, input: &ProgressInput, now_ms: u64) {
        let prev = self.input.as_ref().map(|i| i.status);
        let sample = &input.sample;

        if let (Some(old), Some(new)) = (self.epoch, sample.epoch) {
            if old != new {
                self.roll_back("epoch changed");
            }
        }
        if sample.epoch.is_some() {
            self.epoch = sample.epoch;
        }

        if let (Some(old), Some(new)) = (self.last_out_time, sample.out_time_seconds) {
            if new + EPSILON < old {
                self.roll_back("out time decreased");
            }
        }
        if sample.out_time_seconds.is_some() {
            self.last_out_time = sample.out_time_seconds;
        }

        match input.status {
            JobStatus::Paused => {
                if prev != Some(JobStatus::Paused) || sample.percent.is_some() {
                    let held = sample
                        .percent
                        .map(clamp_percent)
                        .unwrap_or_else(|| clamp_percent(input.progress).max(self.peak));
                    self.remembered = Some(held);
                }
            }
            JobStatus::Processing => {
                let restarting = match prev {
                    Some(JobStatus::Queued | JobStatus::Paused) => true,
                    Some(status) => status.is_terminal(),
                    None => false,
                };
                if restarting {
                    let snap = self.remembered.take().unwrap_or(0.0);
                    self.pending_snap = Some(snap);
                    self.peak = snap;
                    self.allow_back = false;
                    self.frozen = None;
                }
            }
            JobStatus::Queued => {}
            _ => self.remembered = None,
        }

        self.input = Some(input.clone());
        trace!(status = ?input.status, progress = input.progress, now_ms, "progress observed");
    }

    /// Advance to `now_ms` and return the displayed percentage
    pub fn tick(&mut self, now_ms: u64) -> f64 {
        let Some(input) = self.input.clone() else {
            return self.displayed;
        };

        if let Some(snap) = self.pending_snap.take() {
            self.assign(snap, 0, now_ms);
            return self.displayed;
        }

        let target = self.target(&input, now_ms);
        if !self.initialized || (target - self.displayed).abs() > EPSILON {
            // First paint and terminal states are assigned, not eased
            let duration = if !self.initialized || input.status.is_terminal() {
                0
            } else {
                easing_duration_ms(self.config.report_interval_ms)
            };
            self.assign(target, duration, now_ms);
        }
        self.displayed
    }

    /// Percentage the bar should show once its transition completes
    pub fn displayed(&self) -> f64 {
        self.displayed
    }

    /// Easing duration of the current transition
    pub fn transition_ms(&self) -> u64 {
        self.transition_ms
    }

    /// Eased visual position, for hosts without native transitions
    pub fn rendered_at(&self, now_ms: u64) -> f64 {
        self.track.position(now_ms)
    }

    /// Forget everything (for example when the row shows another job)
    pub fn reset(&mut self) {
        *self = Self::new(self.config);
    }

    fn assign(&mut self, value: f64, duration_ms: u64, now_ms: u64) {
        self.track = if duration_ms == 0 {
            EaseTrack::fixed(value, now_ms)
        } else {
            EaseTrack {
                from: self.track.position(now_ms),
                to: value,
                start_ms: now_ms,
                duration_ms,
            }
        };
        self.displayed = value;
        self.transition_ms = duration_ms;
        self.initialized = true;
    }

    fn roll_back(&mut self, reason: &'static str) {
        trace!(reason, peak = self.peak, "progress rollback permitted");
        self.allow_back = true;
        self.frozen = None;
    }

    fn target(&mut self, input: &ProgressInput, now_ms: u64) -> f64 {
        match input.status {
            status if status.is_terminal() => 100.0,
            JobStatus::Paused => self.remembered.unwrap_or(self.displayed),
            JobStatus::Queued => self
                .remembered
                .or(input.sample.percent.map(clamp_percent))
                .unwrap_or_else(|| clamp_percent(input.progress)),
            _ => {
                let baseline = clamp_percent(input.progress);
                let raw = match self.estimate(input, now_ms) {
                    Some(estimate) => estimate.max(baseline),
                    None => baseline,
                };
                let value = if self.allow_back {
                    self.allow_back = false;
                    raw
                } else {
                    raw.max(self.peak)
                };
                self.peak = value;
                value
            }
        }
    }

    /// Extrapolated percentage from the last telemetry sample
    fn estimate(&mut self, input: &ProgressInput, now_ms: u64) -> Option<f64> {
        let sample = &input.sample;
        let out_time = sample.out_time_seconds.filter(|t| t.is_finite())?;
        let speed = sample.speed.filter(|s| s.is_finite() && *s > 0.0)?;
        let updated_at = sample.updated_at_ms?;
        let duration = input
            .duration_seconds
            .filter(|d| d.is_finite() && *d > 0.0)?;

        let key = SampleKey {
            epoch: sample.epoch,
            out_time_seconds: out_time,
            updated_at_ms: updated_at,
        };

        let elapsed_ms = now_ms.saturating_sub(updated_at);
        if elapsed_ms >= self.config.stale_after_ms {
            return self
                .frozen
                .filter(|frozen| frozen.key == key)
                .map(|frozen| frozen.value);
        }

        let estimated_out = out_time + speed * elapsed_ms as f64 / 1000.0;
        let percent = (estimated_out / duration * 100.0).clamp(0.0, MAX_ESTIMATE);
        self.frozen = Some(FrozenEstimate {
            key,
            value: percent,
        });
        Some(percent)
    }
}
