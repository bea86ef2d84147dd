//! Displayable URLs for preview files
//!
//! [`AssetUrlBuilder`] maps a preview path to the host's asset protocol.
//! [`DataUrlLoader`] is the direct-bytes fallback: it reads the file and
//! inlines it as a `data:` URL, bypassing any caching on the asset scheme.

use crate::backend::{DirectBytesLoader, PreviewUrlBuilder};
use crate::error::{BackendError, PreviewIoError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Characters left alone by a JavaScript `encodeURIComponent`
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Default asset protocol prefix (macOS/Linux webviews)
pub const ASSET_BASE: &str = "asset://localhost/";

/// Builds `asset://` URLs with a revision query for cache busting
///
/// # Example
///
/// ```
/// use jobrow_core::{AssetUrlBuilder, PreviewUrlBuilder};
///
/// let builder = AssetUrlBuilder::default();
/// assert_eq!(
///     builder.build("/previews/a b.jpg", 2).as_deref(),
///     Some("asset://localhost/%2Fpreviews%2Fa%20b.jpg?rev=2")
/// );
/// assert_eq!(builder.build("  ", 2), None);
/// ```
#[derive(Debug, Clone)]
pub struct AssetUrlBuilder {
    base: String,
}

impl Default for AssetUrlBuilder {
    fn default() -> Self {
        Self {
            base: ASSET_BASE.to_string(),
        }
    }
}

impl AssetUrlBuilder {
    /// Use a different protocol prefix (e.g. `http://asset.localhost/` on Windows)
    pub fn with_base(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }
}

impl PreviewUrlBuilder for AssetUrlBuilder {
    fn build(&self, path: &str, revision: u64) -> Option<String> {
        let path = path.trim();
        if path.is_empty() {
            return None;
        }
        let encoded = utf8_percent_encode(path, URI_COMPONENT);
        if revision == 0 {
            Some(format!("{}{}", self.base, encoded))
        } else {
            Some(format!("{}{}?rev={}", self.base, encoded, revision))
        }
    }
}

/// Append a cache-busting marker to `url`
///
/// `data:` URLs are returned unchanged.
pub fn with_cache_bust(url: &str, marker: u64) -> String {
    if url.starts_with("data:") {
        return url.to_string();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}cb={marker}")
}

/// Reads preview files from a trusted directory as `data:` URLs
#[derive(Debug, Clone)]
pub struct DataUrlLoader {
    previews_root: PathBuf,
}

impl DataUrlLoader {
    pub fn new(previews_root: impl Into<PathBuf>) -> Self {
        Self {
            previews_root: previews_root.into(),
        }
    }

    pub fn previews_root(&self) -> &Path {
        &self.previews_root
    }

    /// Read `path` and encode it as a `data:` URL
    ///
    /// Only jpg/jpeg/png/webp files under the previews root are served.
    pub fn read_data_url(&self, path: &str) -> Result<String, PreviewIoError> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(PreviewIoError::Empty);
        }

        let canonical = fs::canonicalize(trimmed).map_err(PreviewIoError::NotReadable)?;
        let root = fs::canonicalize(&self.previews_root)
            .unwrap_or_else(|_| self.previews_root.clone());
        if !canonical.starts_with(&root) {
            return Err(PreviewIoError::OutsideRoot);
        }

        let mime = mime_for(&canonical).ok_or(PreviewIoError::UnsupportedType)?;
        let bytes = fs::read(&canonical)?;
        debug!(path = %canonical.display(), bytes = bytes.len(), "inlined preview");

        Ok(format!("data:{mime};base64,{}", STANDARD.encode(&bytes)))
    }
}

fn mime_for(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)?;
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

#[async_trait]
impl DirectBytesLoader for DataUrlLoader {
    async fn load_direct(&self, path: &str) -> Result<String, BackendError> {
        let loader = self.clone();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || loader.read_data_url(&path))
            .await
            .map_err(|e| BackendError::Call(e.to_string()))?
            .map_err(BackendError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_asset_url_encoding() {
        let builder = AssetUrlBuilder::default();
        assert_eq!(
            builder.build("/tmp/x(1)'s.jpg", 0).as_deref(),
            Some("asset://localhost/%2Ftmp%2Fx(1)'s.jpg")
        );
        assert_eq!(
            builder.build("C:\\previews\\é.jpg", 7).as_deref(),
            Some("asset://localhost/C%3A%5Cpreviews%5C%C3%A9.jpg?rev=7")
        );
    }

    #[test]
    fn test_revision_changes_url() {
        let builder = AssetUrlBuilder::with_base("http://asset.localhost/");
        let a = builder.build("p.jpg", 1);
        let b = builder.build("p.jpg", 2);
        assert_ne!(a, b);
        assert_eq!(a, builder.build("p.jpg", 1));
        assert_eq!(a.as_deref(), Some("http://asset.localhost/p.jpg?rev=1"));
    }

    #[test]
    fn test_cache_bust() {
        assert_eq!(with_cache_bust("asset://localhost/p.jpg", 3), "asset://localhost/p.jpg?cb=3");
        assert_eq!(
            with_cache_bust("asset://localhost/p.jpg?rev=2", 3),
            "asset://localhost/p.jpg?rev=2&cb=3"
        );
        assert_eq!(with_cache_bust("data:image/png;base64,AA==", 3), "data:image/png;base64,AA==");
    }

    #[test]
    fn test_data_url_inside_root() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("job-1.PNG");
        fs::write(&path, b"abc").unwrap();

        let loader = DataUrlLoader::new(root.path());
        let url = loader.read_data_url(&format!("  {}  ", path.display())).unwrap();
        assert_eq!(url, "data:image/png;base64,YWJj");
    }

    #[test]
    fn test_data_url_rejects_outside_root() {
        let root = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let path = other.path().join("job-1.jpg");
        fs::write(&path, b"abc").unwrap();

        let loader = DataUrlLoader::new(root.path());
        let err = loader.read_data_url(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, PreviewIoError::OutsideRoot));
    }

    #[test]
    fn test_data_url_rejects_bad_inputs() {
        let root = TempDir::new().unwrap();
        let text = root.path().join("notes.txt");
        fs::write(&text, b"abc").unwrap();
        let loader = DataUrlLoader::new(root.path());

        assert!(matches!(loader.read_data_url(" "), Err(PreviewIoError::Empty)));
        assert!(matches!(
            loader.read_data_url(text.to_str().unwrap()),
            Err(PreviewIoError::UnsupportedType)
        ));
        let missing = root.path().join("missing.jpg");
        assert!(matches!(
            loader.read_data_url(missing.to_str().unwrap()),
            Err(PreviewIoError::NotReadable(_))
        ));
    }

    #[tokio::test]
    async fn test_load_direct_maps_errors() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("job-2.webp");
        fs::write(&path, b"hi").unwrap();
        let loader = DataUrlLoader::new(root.path());

        let url = loader.load_direct(path.to_str().unwrap()).await.unwrap();
        assert!(url.starts_with("data:image/webp;base64,"));

        let err = loader.load_direct("").await.unwrap_err();
        assert!(matches!(err, BackendError::Preview(PreviewIoError::Empty)));
    }
}
