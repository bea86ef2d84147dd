//! Error types for backend calls and preview file access
//!
//! None of these cross the pipeline's public entry points: the ensure queue
//! and row controllers log them and degrade to "no preview".

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PreviewIoError {
    #[error("preview path is empty")]
    Empty,

    #[error("preview path is not readable: {0}")]
    NotReadable(#[source] io::Error),

    #[error("preview path is outside the previews root")]
    OutsideRoot,

    #[error("unsupported preview file type")]
    UnsupportedType,

    #[error("failed to read preview file: {0}")]
    Io(#[from] io::Error),
}

/// Failure reported by a preview backend collaborator
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend call failed: {0}")]
    Call(String),

    #[error("image decode failed: {0}")]
    Decode(String),

    #[error(transparent)]
    Preview(#[from] PreviewIoError),
}

pub type Result<T, E = BackendError> = std::result::Result<T, E>;
