//! In-memory collaborators for unit tests

use crate::backend::{DirectBytesLoader, ImageDecoder, PreviewBackend};
use crate::error::{BackendError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Backend that serves `/previews/<job>.jpg` and records every call
pub struct MockBackend {
    pub calls: Mutex<Vec<String>>,
    pub failing: Mutex<HashSet<String>>,
    pub empty: Mutex<HashSet<String>>,
    pub available: AtomicBool,
    gate: Option<Arc<Semaphore>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Backend whose calls block until `release` is called
    pub fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (Arc::new(Self::build(Some(gate.clone()))), gate)
    }

    fn build(gate: Option<Arc<Semaphore>>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            empty: Mutex::new(HashSet::new()),
            available: AtomicBool::new(true),
            gate,
        }
    }

    pub fn fail(&self, job_id: &str) {
        self.failing.lock().insert(job_id.to_string());
    }

    pub fn recover(&self, job_id: &str) {
        self.failing.lock().remove(job_id);
    }

    pub fn return_nothing_for(&self, job_id: &str) {
        self.empty.lock().insert(job_id.to_string());
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    async fn respond(&self, call: String, job_id: &str, path: String) -> Result<Option<String>> {
        self.calls.lock().push(call);
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if self.failing.lock().contains(job_id) {
            return Err(BackendError::Call(format!("ffmpeg failed for {job_id}")));
        }
        if self.empty.lock().contains(job_id) {
            return Ok(None);
        }
        Ok(Some(path))
    }
}

#[async_trait]
impl PreviewBackend for MockBackend {
    async fn ensure_preview(&self, job_id: &str) -> Result<Option<String>> {
        self.respond(
            format!("default:{job_id}"),
            job_id,
            format!("/previews/{job_id}.jpg"),
        )
        .await
    }

    async fn ensure_preview_variant(&self, job_id: &str, height_px: u32) -> Result<Option<String>> {
        self.respond(
            format!("h{height_px}:{job_id}"),
            job_id,
            format!("/previews/{job_id}-h{height_px}.jpg"),
        )
        .await
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

/// Direct loader that returns `data:` URLs or fails on demand
#[derive(Default)]
pub struct MockLoader {
    pub calls: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl DirectBytesLoader for MockLoader {
    async fn load_direct(&self, path: &str) -> Result<String> {
        self.calls.lock().push(path.to_string());
        if self.fail.load(Ordering::SeqCst) {
            return Err(BackendError::Call("read failed".to_string()));
        }
        Ok(format!("data:image/jpeg;base64,{}", path.len()))
    }
}

/// Decoder that records URLs and optionally blocks until released
pub struct MockDecoder {
    pub decoded: Mutex<Vec<String>>,
    pub fail: AtomicBool,
    gate: Option<Arc<Semaphore>>,
}

impl MockDecoder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            decoded: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            gate: None,
        })
    }

    pub fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let decoder = Arc::new(Self {
            decoded: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            gate: Some(gate.clone()),
        });
        (decoder, gate)
    }

    pub fn decoded(&self) -> Vec<String> {
        self.decoded.lock().clone()
    }
}

#[async_trait]
impl ImageDecoder for MockDecoder {
    async fn decode(&self, url: &str) -> Result<()> {
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(BackendError::Decode(url.to_string()));
        }
        self.decoded.lock().push(url.to_string());
        Ok(())
    }
}

/// Let spawned tasks on the current-thread runtime run to their next await
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
