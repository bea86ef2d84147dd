//! Job fields observed by preview rows and progress bars
//!
//! These mirror the queue snapshot the backend emits (camelCase JSON), so a
//! host can deserialize a snapshot row straight into a [`JobView`].

use serde::{Deserialize, Serialize};

/// Lifecycle state of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    #[serde(alias = "waiting")]
    Queued,
    Processing,
    Paused,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl JobStatus {
    /// Completed, failed, skipped or cancelled
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Skipped | JobStatus::Cancelled
        )
    }
}

/// Kind of media a job processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    #[default]
    Video,
    Image,
    Audio,
}

/// Fine-grained progress telemetry attached to a job
///
/// All fields are optional: older snapshots and jobs that never reported
/// telemetry simply leave them out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgressSample {
    /// Restart marker; a change is the only sanctioned backward jump
    #[serde(rename = "progressEpoch")]
    pub epoch: Option<u64>,

    /// Media timestamp reached by the encoder at the last sample
    #[serde(rename = "lastProgressOutTimeSeconds")]
    pub out_time_seconds: Option<f64>,

    /// Encoder speed multiplier (1.0 = realtime)
    #[serde(rename = "lastProgressSpeed")]
    pub speed: Option<f64>,

    /// Wall-clock time of the last sample
    #[serde(rename = "lastProgressUpdatedAtMs")]
    pub updated_at_ms: Option<u64>,

    /// Percentage remembered when the job was paused
    #[serde(rename = "lastProgressPercent")]
    pub percent: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MediaInfo {
    pub duration_seconds: Option<f64>,
}

/// The slice of a job record that rows react to
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobView {
    pub id: String,

    #[serde(rename = "type")]
    pub job_type: JobType,

    pub status: JobStatus,

    /// Coarse progress reported by the backend (0-100)
    pub progress: f64,

    pub preview_path: Option<String>,

    /// Bumped whenever the file at `preview_path` is rewritten in place
    pub preview_revision: u64,

    pub output_path: Option<String>,
    pub input_path: Option<String>,
    pub media_info: Option<MediaInfo>,

    #[serde(alias = "progressSample")]
    pub wait_metadata: Option<ProgressSample>,
}

impl JobView {
    pub fn new(id: impl Into<String>, job_type: JobType) -> Self {
        Self {
            id: id.into(),
            job_type,
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_preview(mut self, path: impl Into<String>, revision: u64) -> Self {
        self.preview_path = Some(path.into());
        self.preview_revision = revision;
        self
    }

    pub fn with_output_path(mut self, path: impl Into<String>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn with_input_path(mut self, path: impl Into<String>) -> Self {
        self.input_path = Some(path.into());
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.media_info = Some(MediaInfo {
            duration_seconds: Some(seconds),
        });
        self
    }

    pub fn with_sample(mut self, sample: ProgressSample) -> Self {
        self.wait_metadata = Some(sample);
        self
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.media_info.as_ref().and_then(|m| m.duration_seconds)
    }

    /// Preview path with blank strings treated as absent
    pub fn preview_path(&self) -> Option<&str> {
        non_blank(self.preview_path.as_deref())
    }

    pub fn output_path(&self) -> Option<&str> {
        non_blank(self.output_path.as_deref())
    }

    pub fn input_path(&self) -> Option<&str> {
        non_blank(self.input_path.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}
