//! Job row live-update core
//!
//! Keeps every row of a job list in sync with the backend without flooding
//! it: preview generation is deduplicated through [`EnsureQueue`], image
//! loads are paced by a shared [`jobrow_scheduler::LoadScheduler`], each row's
//! thumbnail is driven by a [`RowPreviewController`], and progress bars are
//! smoothed by [`ProgressSmoother`].
//!
//! The host side (the real backend, URL scheme and image decoder) plugs in
//! through the traits in [`backend`].

pub mod backend;
pub mod ensure;
pub mod error;
pub mod job;
pub mod preview_url;
pub mod progress;
pub mod row_preview;

#[cfg(test)]
mod testing;

pub use backend::{DirectBytesLoader, ImageDecoder, PerfHints, PreviewBackend, PreviewUrlBuilder};
pub use ensure::{EnsureCancel, EnsureParams, EnsureQueue, EnsureStats, EnsureTicket};
pub use error::{BackendError, PreviewIoError, Result};
pub use job::{JobStatus, JobType, JobView, MediaInfo, ProgressSample};
pub use preview_url::{with_cache_bust, AssetUrlBuilder, DataUrlLoader, ASSET_BASE};
pub use progress::{
    easing_duration_ms, ProgressConfig, ProgressInput, ProgressSmoother,
    DEFAULT_REPORT_INTERVAL_MS, DEFAULT_STALE_AFTER_MS, MAX_ESTIMATE,
};
pub use row_preview::{
    PreviewPipeline, RecoveryLedger, RecoveryOutcome, RecoverySteps, RowPreviewController,
    RowSnapshot, SnapshotChange,
};
