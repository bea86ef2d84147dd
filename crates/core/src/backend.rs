//! Collaborator boundary of the preview pipeline
//!
//! Everything the pipeline consumes from the outside world is a trait here so
//! hosts (and tests) can plug in their own RPC layer, URL scheme and image
//! decoder.

use crate::error::Result;
use async_trait::async_trait;

/// Generates or resolves preview images on the backend
#[async_trait]
pub trait PreviewBackend: Send + Sync {
    /// Resolve the default-size preview, generating it if needed
    ///
    /// `Ok(None)` means the backend has no preview for this job (for example
    /// an audio job).
    async fn ensure_preview(&self, job_id: &str) -> Result<Option<String>>;

    /// Resolve a preview scaled to `height_px`
    async fn ensure_preview_variant(&self, job_id: &str, height_px: u32) -> Result<Option<String>>;

    /// Whether auto-ensure should be attempted at all
    fn is_available(&self) -> bool {
        true
    }
}

/// Loads preview bytes without going through the URL scheme's caching
#[async_trait]
pub trait DirectBytesLoader: Send + Sync {
    /// Returns a self-contained displayable URL (for example a `data:` URL)
    async fn load_direct(&self, path: &str) -> Result<String>;
}

/// Maps a preview path and revision to a displayable URL
///
/// Must be pure: the same inputs always yield the same URL, and a different
/// revision yields a different URL.
pub trait PreviewUrlBuilder: Send + Sync {
    fn build(&self, path: &str, revision: u64) -> Option<String>;
}

/// Fetches and decodes an image ahead of display
#[async_trait]
pub trait ImageDecoder: Send + Sync {
    async fn decode(&self, url: &str) -> Result<()>;
}

/// Global list performance hints owned by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfHints {
    /// Rows may ask the backend to generate missing previews
    pub allow_auto_ensure: bool,

    /// Rows may start new fetch/decode work
    pub allow_loads: bool,

    /// The list is being scrolled
    pub is_scrolling: bool,
}

impl Default for PerfHints {
    fn default() -> Self {
        Self {
            allow_auto_ensure: true,
            allow_loads: true,
            is_scrolling: false,
        }
    }
}

impl PerfHints {
    /// Loads are allowed only while the list is not scrolling
    pub fn loads_allowed(&self) -> bool {
        self.allow_loads && !self.is_scrolling
    }

    pub fn scrolling(mut self, is_scrolling: bool) -> Self {
        self.is_scrolling = is_scrolling;
        self
    }

    pub fn with_loads(mut self, allow: bool) -> Self {
        self.allow_loads = allow;
        self
    }

    pub fn with_auto_ensure(mut self, allow: bool) -> Self {
        self.allow_auto_ensure = allow;
        self
    }
}
