//! Single-flight preview ensure queue
//!
//! Serializes "make sure a preview exists" backend calls behind one worker,
//! coalesces concurrent callers for the same `(job, size)` into one call, and
//! remembers resolved paths for a short while.
//!
//! Nothing here returns an error: backend failures are logged and every
//! attached caller receives `None`.

use crate::backend::PreviewBackend;
use futures::FutureExt;
use jobrow_cache::{PipelineConfig, TtlCache};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Generation parameters for an ensure request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EnsureParams {
    /// Target height of a sized variant; `None` for the default preview
    pub height_px: Option<u32>,
}

impl EnsureParams {
    pub fn sized(height_px: u32) -> Self {
        Self {
            height_px: Some(height_px),
        }
    }

    /// Key distinguishing requests for the same job
    pub fn cache_key(&self) -> String {
        match self.height_px {
            Some(h) => format!("h{h}"),
            None => "default".to_string(),
        }
    }
}

/// Ensure queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnsureStats {
    pub requests: u64,
    pub cache_hits: u64,
    pub backend_calls: u64,

    /// Callers that joined an already queued or running request
    pub coalesced: u64,

    /// Requests dropped because every caller cancelled before they ran
    pub cancelled_before_start: u64,

    pub invalidations: u64,

    /// Backend calls that errored, panicked or resolved nothing
    pub failures: u64,

    /// Requests waiting for the worker
    pub queued: usize,
}

type RequestKey = (String, String);
type Consumer = oneshot::Sender<Option<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Queued,
    Running,
}

struct EnsureRequest {
    id: u64,
    params: EnsureParams,
    state: RequestState,
    consumers: HashMap<u64, Consumer>,
}

/// Cached outcome for a job, remembering which variant produced it
#[derive(Debug, Clone)]
struct Resolved {
    params: EnsureParams,
    path: String,
}

struct QueueState {
    /// job id → resolved path; lookups ignore params
    resolved: TtlCache<String, Resolved>,
    requests: HashMap<RequestKey, EnsureRequest>,

    /// Running requests that were invalidated; their result is delivered but
    /// never cached
    detached: HashMap<u64, (RequestKey, EnsureRequest)>,

    pending: VecDeque<RequestKey>,
    worker_active: bool,
    next_id: u64,
    stats: EnsureStats,
}

impl QueueState {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Pop the next request that still has someone waiting for it
    fn pop_runnable(&mut self) -> Option<(RequestKey, u64, EnsureParams)> {
        while let Some(key) = self.pending.pop_front() {
            let Some(request) = self.requests.get_mut(&key) else {
                continue;
            };
            if request.state != RequestState::Queued {
                continue;
            }
            if request.consumers.is_empty() {
                self.requests.remove(&key);
                self.stats.cancelled_before_start += 1;
                continue;
            }
            request.state = RequestState::Running;
            return Some((key, request.id, request.params));
        }
        None
    }
}

struct EnsureInner {
    backend: Arc<dyn PreviewBackend>,
    state: Mutex<QueueState>,
}

/// Process-wide ensure queue, shared by every row
///
/// Cloning is cheap and yields a handle to the same queue.
#[derive(Clone)]
pub struct EnsureQueue {
    inner: Arc<EnsureInner>,
}

impl EnsureQueue {
    pub fn new(backend: Arc<dyn PreviewBackend>, config: &PipelineConfig) -> Self {
        Self {
            inner: Arc::new(EnsureInner {
                backend,
                state: Mutex::new(QueueState {
                    resolved: TtlCache::new(config.resolved_capacity, config.resolved_ttl()),
                    requests: HashMap::new(),
                    detached: HashMap::new(),
                    pending: VecDeque::new(),
                    worker_active: false,
                    next_id: 1,
                    stats: EnsureStats::default(),
                }),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn PreviewBackend> {
        &self.inner.backend
    }

    /// Ask for a preview path for `job_id`
    ///
    /// A fresh resolved path for the job is returned immediately whatever
    /// `params` say; callers wanting a different variant must
    /// [`invalidate`](Self::invalidate) first.
    pub fn request(&self, job_id: &str, params: EnsureParams) -> EnsureTicket {
        if job_id.trim().is_empty() {
            return EnsureTicket::ready(None);
        }

        let (rx, cancel, spawn_worker) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.stats.requests += 1;

            if let Some(hit) = state.resolved.get(&job_id.to_string(), now()) {
                let path = hit.path.clone();
                state.stats.cache_hits += 1;
                trace!(job_id, "ensure served from cache");
                return EnsureTicket::ready(Some(path));
            }

            let key: RequestKey = (job_id.to_string(), params.cache_key());
            let consumer_id = state.next_id();
            let (tx, rx) = oneshot::channel();

            let request_id = match state.requests.get_mut(&key) {
                Some(request) => {
                    request.consumers.insert(consumer_id, tx);
                    let id = request.id;
                    state.stats.coalesced += 1;
                    id
                }
                None => {
                    let id = state.next_id();
                    let mut consumers = HashMap::new();
                    consumers.insert(consumer_id, tx);
                    state.requests.insert(
                        key.clone(),
                        EnsureRequest {
                            id,
                            params,
                            state: RequestState::Queued,
                            consumers,
                        },
                    );
                    state.pending.push_back(key.clone());
                    debug!(job_id, cache_key = %key.1, "ensure request queued");
                    id
                }
            };

            let spawn_worker = !state.worker_active;
            state.worker_active = true;

            let cancel = EnsureCancel {
                target: Some(Arc::new(CancelTarget {
                    inner: Arc::downgrade(&self.inner),
                    key,
                    request_id,
                    consumer_id,
                })),
            };
            (rx, cancel, spawn_worker)
        };

        if spawn_worker {
            EnsureInner::spawn_worker(&self.inner);
        }

        EnsureTicket {
            outcome: TicketOutcome::Waiting(rx),
            cancel,
        }
    }

    /// Forget the resolved path for `job_id` and drop any request for the
    /// `(job_id, params)` key
    ///
    /// Callers of a queued request resolve to `None`; a running request still
    /// delivers its result but does not populate the cache.
    pub fn invalidate(&self, job_id: &str, params: EnsureParams) {
        let key: RequestKey = (job_id.to_string(), params.cache_key());
        let dropped = {
            let mut state = self.inner.state.lock();
            state.stats.invalidations += 1;
            state.resolved.remove(&key.0);

            match state.requests.remove(&key) {
                Some(request) if request.state == RequestState::Running => {
                    state.detached.insert(request.id, (key.clone(), request));
                    None
                }
                Some(request) => {
                    state.pending.retain(|k| k != &key);
                    Some(request)
                }
                None => None,
            }
        };

        if let Some(request) = dropped {
            for (_, consumer) in request.consumers {
                let _ = consumer.send(None);
            }
        }
        debug!(job_id, cache_key = %key.1, "ensure key invalidated");
    }

    /// Fresh resolved path for `job_id`, without counting a request
    pub fn peek_cached(&self, job_id: &str) -> Option<String> {
        self.inner
            .state
            .lock()
            .resolved
            .peek(&job_id.to_string(), now())
            .map(|hit| hit.path.clone())
    }

    /// Params of the request that produced the cached path for `job_id`
    pub fn cached_params(&self, job_id: &str) -> Option<EnsureParams> {
        self.inner
            .state
            .lock()
            .resolved
            .peek(&job_id.to_string(), now())
            .map(|hit| hit.params)
    }

    /// Drop only the cached path for `job_id`, leaving requests untouched
    ///
    /// Lets a caller that needs another variant coalesce with a request that
    /// is already queued for it instead of being served the cached one.
    pub fn forget_resolved(&self, job_id: &str) {
        let removed = self.inner.state.lock().resolved.remove(&job_id.to_string());
        if removed.is_some() {
            debug!(job_id, "resolved path forgotten");
        }
    }

    /// Whether a queued or running request exists for the key
    pub fn is_pending(&self, job_id: &str, params: EnsureParams) -> bool {
        let key: RequestKey = (job_id.to_string(), params.cache_key());
        self.inner.state.lock().requests.contains_key(&key)
    }

    pub fn stats(&self) -> EnsureStats {
        let state = self.inner.state.lock();
        let mut stats = state.stats.clone();
        stats.queued = state
            .requests
            .values()
            .filter(|r| r.state == RequestState::Queued)
            .count();
        stats
    }
}

impl EnsureInner {
    fn spawn_worker(this: &Arc<Self>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(Self::run_worker(this.clone()));
            }
            Err(_) => {
                warn!("no tokio runtime for the ensure worker, resolving queued requests to None");
                let mut state = this.state.lock();
                state.worker_active = false;
                let keys: Vec<RequestKey> = state.pending.drain(..).collect();
                for key in keys {
                    state.requests.remove(&key);
                }
            }
        }
    }

    async fn run_worker(this: Arc<Self>) {
        loop {
            let next = {
                let mut state = this.state.lock();
                match state.pop_runnable() {
                    Some(next) => {
                        state.stats.backend_calls += 1;
                        Some(next)
                    }
                    None => {
                        state.worker_active = false;
                        None
                    }
                }
            };
            let Some((key, request_id, params)) = next else {
                trace!("ensure worker idle");
                return;
            };

            let result = this.call_backend(&key.0, params).await;
            this.deliver(&key, request_id, result);
        }
    }

    async fn call_backend(&self, job_id: &str, params: EnsureParams) -> Option<String> {
        let call = async {
            match params.height_px {
                Some(h) => self.backend.ensure_preview_variant(job_id, h).await,
                None => self.backend.ensure_preview(job_id).await,
            }
        };

        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(Some(path))) if !path.trim().is_empty() => Some(path),
            Ok(Ok(_)) => {
                debug!(job_id, "backend resolved no preview");
                None
            }
            Ok(Err(err)) => {
                warn!(job_id, error = %err, "ensure preview failed");
                None
            }
            Err(_) => {
                warn!(job_id, "ensure preview panicked");
                None
            }
        }
    }

    fn deliver(&self, key: &RequestKey, request_id: u64, result: Option<String>) {
        let consumers = {
            let mut state = self.state.lock();
            if result.is_none() {
                state.stats.failures += 1;
            }

            let owns_key = state
                .requests
                .get(key)
                .is_some_and(|r| r.id == request_id);

            if owns_key {
                let request = state.requests.remove(key);
                if let (Some(path), Some(request)) = (&result, &request) {
                    let resolved = Resolved {
                        params: request.params,
                        path: path.clone(),
                    };
                    state.resolved.insert(key.0.clone(), resolved, now());
                }
                request.map(|r| r.consumers)
            } else {
                state.detached.remove(&request_id).map(|(_, r)| r.consumers)
            }
        };

        let Some(consumers) = consumers else {
            return;
        };
        trace!(job_id = %key.0, consumers = consumers.len(), "ensure result fanned out");
        for (_, consumer) in consumers {
            let _ = consumer.send(result.clone());
        }
    }
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

struct CancelTarget {
    inner: Weak<EnsureInner>,
    key: RequestKey,
    request_id: u64,
    consumer_id: u64,
}

/// Detaches one caller from its ensure request
#[derive(Clone, Default)]
pub struct EnsureCancel {
    target: Option<Arc<CancelTarget>>,
}

impl EnsureCancel {
    /// Stop waiting for the result
    ///
    /// If this was the last caller of a request that has not started, the
    /// request leaves the queue without a backend call. Cancelling twice is a
    /// no-op.
    pub fn cancel(&self) {
        let Some(target) = &self.target else {
            return;
        };
        let Some(inner) = target.inner.upgrade() else {
            return;
        };

        let mut guard = inner.state.lock();
        let state = &mut *guard;
        let live = state
            .requests
            .get(&target.key)
            .is_some_and(|r| r.id == target.request_id);

        if live {
            let mut drop_request = false;
            if let Some(request) = state.requests.get_mut(&target.key) {
                request.consumers.remove(&target.consumer_id);
                drop_request =
                    request.state == RequestState::Queued && request.consumers.is_empty();
            }
            if drop_request {
                state.requests.remove(&target.key);
                let key = target.key.clone();
                state.pending.retain(|k| k != &key);
                state.stats.cancelled_before_start += 1;
                debug!(job_id = %key.0, cache_key = %key.1, "ensure request cancelled before start");
            }
        } else if let Some((_, request)) = state.detached.get_mut(&target.request_id) {
            request.consumers.remove(&target.consumer_id);
        }
    }
}

enum TicketOutcome {
    Ready(Option<String>),
    Waiting(oneshot::Receiver<Option<String>>),
}

/// One caller's view of an ensure request
#[must_use = "an ensure ticket does nothing unless awaited or cancelled"]
pub struct EnsureTicket {
    outcome: TicketOutcome,
    cancel: EnsureCancel,
}

impl EnsureTicket {
    fn ready(path: Option<String>) -> Self {
        Self {
            outcome: TicketOutcome::Ready(path),
            cancel: EnsureCancel::default(),
        }
    }

    /// Whether the result was available without queuing
    pub fn is_ready(&self) -> bool {
        matches!(self.outcome, TicketOutcome::Ready(_))
    }

    /// Cloneable cancel handle, usable while [`wait`](Self::wait) is pending
    pub fn cancel_handle(&self) -> EnsureCancel {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolved preview path, or `None` on failure, invalidation or cancel
    pub async fn wait(self) -> Option<String> {
        match self.outcome {
            TicketOutcome::Ready(path) => path,
            TicketOutcome::Waiting(rx) => rx.await.ok().flatten(),
        }
    }
}

impl std::fmt::Debug for EnsureTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnsureTicket")
            .field("ready", &self.is_ready())
            .finish()
    }
}
