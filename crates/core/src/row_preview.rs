//! Per-row preview controller
//!
//! Decides which preview URL one list row should render for its job, and
//! recovers when the rendered image fails to load.
//!
//! The host drives it with [`RowPreviewController::update`] on every change
//! of the job fields or perf hints and reads the result from
//! [`RowPreviewController::preview_url`] or a [`watch`] subscription.

use crate::backend::{DirectBytesLoader, ImageDecoder, PerfHints, PreviewBackend, PreviewUrlBuilder};
use crate::ensure::{EnsureCancel, EnsureParams, EnsureQueue};
use crate::job::{JobType, JobView};
use crate::preview_url::{with_cache_bust, AssetUrlBuilder};
use futures::FutureExt;
use jobrow_cache::{PipelineConfig, WarmDecodeCache};
use jobrow_scheduler::{
    AbortController, HostCapabilities, LoadPriority, LoadRun, LoadScheduler, LoadSchedulerConfig,
    ScheduledLoad, YieldPoint,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Fallback steps already taken for one preview path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySteps {
    pub variant_retried: bool,
    pub direct_tried: bool,
    pub regenerate_tried: bool,
    pub exhausted: bool,
}

/// Process-wide record of recovery attempts, keyed by path and revision
///
/// Shared by every row so that a remounted row never repeats a step. Entries
/// never expire; only [`RecoveryLedger::clear`] re-enables a path.
#[derive(Debug, Default)]
pub struct RecoveryLedger {
    entries: Mutex<HashMap<String, RecoverySteps>>,
}

impl RecoveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self, path: &str, revision: u64) -> RecoverySteps {
        self.entries
            .lock()
            .get(&ledger_key(path, revision))
            .copied()
            .unwrap_or_default()
    }

    fn record(&self, path: &str, revision: u64, update: impl FnOnce(&mut RecoverySteps)) {
        let mut entries = self.entries.lock();
        update(entries.entry(ledger_key(path, revision)).or_default());
    }

    /// Number of paths with at least one recovery step taken
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Allow automatic recovery for a path again (after a manual action)
    pub fn clear(&self, path: &str, revision: u64) {
        self.entries.lock().remove(&ledger_key(path, revision));
    }
}

fn ledger_key(path: &str, revision: u64) -> String {
    format!("{path}#{revision}")
}

static CACHE_BUST_SEQ: AtomicU64 = AtomicU64::new(1);

/// Shared collaborators of every row controller
#[derive(Clone)]
pub struct PreviewPipeline {
    pub ensure: EnsureQueue,
    pub scheduler: LoadScheduler,
    pub warm: Arc<WarmDecodeCache>,
    pub ledger: Arc<RecoveryLedger>,
    pub urls: Arc<dyn PreviewUrlBuilder>,
    pub direct: Option<Arc<dyn DirectBytesLoader>>,
    pub decoder: Option<Arc<dyn ImageDecoder>>,
}

impl PreviewPipeline {
    /// Pipeline with a timer-driven scheduler and `asset://` URLs
    pub fn new(backend: Arc<dyn PreviewBackend>, config: &PipelineConfig) -> Self {
        Self::with_host(backend, config, HostCapabilities::timer_only())
    }

    /// Pipeline whose load pump defers to the host's frame and idle callbacks
    ///
    /// Idle deferrals are bounded by the configured idle timeout.
    pub fn with_host(
        backend: Arc<dyn PreviewBackend>,
        config: &PipelineConfig,
        host: HostCapabilities,
    ) -> Self {
        let yield_point = YieldPoint::new(host).with_idle_timeout(config.idle_timeout());
        Self {
            ensure: EnsureQueue::new(backend, config),
            scheduler: LoadScheduler::new(
                yield_point,
                LoadSchedulerConfig::default().with_max_in_flight(config.max_in_flight),
            ),
            warm: Arc::new(WarmDecodeCache::new(config.warm_capacity, config.warm_ttl())),
            ledger: Arc::new(RecoveryLedger::new()),
            urls: Arc::new(AssetUrlBuilder::default()),
            direct: None,
            decoder: None,
        }
    }

    /// Replace the load scheduler, for example to share one across pipelines
    pub fn with_scheduler(mut self, scheduler: LoadScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_url_builder(mut self, urls: Arc<dyn PreviewUrlBuilder>) -> Self {
        self.urls = urls;
        self
    }

    pub fn with_direct_loader(mut self, loader: Arc<dyn DirectBytesLoader>) -> Self {
        self.direct = Some(loader);
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn ImageDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn backend(&self) -> &Arc<dyn PreviewBackend> {
        self.ensure.backend()
    }
}

/// Everything a row reacts to
#[derive(Debug, Clone, PartialEq)]
pub struct RowSnapshot {
    pub job: JobView,

    /// Requested preview height; `None` (or 0) means the default preview
    pub desired_height: Option<u32>,

    pub hints: PerfHints,
}

impl RowSnapshot {
    pub fn new(job: JobView) -> Self {
        Self {
            job,
            desired_height: None,
            hints: PerfHints::default(),
        }
    }

    pub fn with_height(mut self, height_px: u32) -> Self {
        self.desired_height = Some(height_px);
        self
    }

    pub fn with_hints(mut self, hints: PerfHints) -> Self {
        self.hints = hints;
        self
    }

    fn height(&self) -> Option<u32> {
        self.desired_height.filter(|h| *h > 0)
    }

    fn preview_fields_differ(&self, other: &Self) -> bool {
        let (a, b) = (&self.job, &other.job);
        a.job_type != b.job_type
            || a.preview_path != b.preview_path
            || a.preview_revision != b.preview_revision
            || a.output_path != b.output_path
            || a.input_path != b.input_path
    }
}

/// What changed between two snapshots, most significant first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotChange {
    Mounted,
    IdentityChanged,
    HeightChanged,
    PreviewChanged,
    HintsChanged,
    Unchanged,
}

impl SnapshotChange {
    pub fn classify(prev: Option<&RowSnapshot>, next: &RowSnapshot) -> Self {
        let Some(prev) = prev else {
            return SnapshotChange::Mounted;
        };
        if prev.job.id != next.job.id {
            SnapshotChange::IdentityChanged
        } else if prev.height() != next.height() {
            SnapshotChange::HeightChanged
        } else if prev.preview_fields_differ(next) {
            SnapshotChange::PreviewChanged
        } else if prev.hints != next.hints {
            SnapshotChange::HintsChanged
        } else {
            SnapshotChange::Unchanged
        }
    }

    fn resets_identity(self) -> bool {
        matches!(
            self,
            SnapshotChange::IdentityChanged | SnapshotChange::HeightChanged
        )
    }
}

/// Result of [`RowPreviewController::handle_preview_error`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// A replacement URL is being displayed
    Recovered(String),

    /// Every fallback was tried; the row shows no preview for this path
    Exhausted,

    /// The row changed identity or unmounted while recovering
    Abandoned,

    /// The row had no preview source to recover
    NothingToRecover,
}

struct EnsuredPath {
    job_id: String,
    height: Option<u32>,
    path: String,
}

/// Replacement URL for a source path, set by error recovery
struct OverrideUrl {
    for_path: String,
    url: String,
}

struct Source {
    path: String,
    revision: u64,
}

#[derive(Default)]
struct RowState {
    snapshot: Option<RowSnapshot>,

    /// Bumped on identity or height change; async results from an older
    /// generation are dropped
    generation: u64,

    ensured: Option<EnsuredPath>,
    ensure_attempted: bool,
    ensure_cancel: Option<EnsureCancel>,
    recovery_cancel: Option<EnsureCancel>,

    load: Option<ScheduledLoad>,
    load_url: Option<String>,
    decode_abort: Option<AbortController>,

    shown: Option<String>,
    override_url: Option<OverrideUrl>,
    unmounted: bool,
}

impl RowState {
    fn ensured_for(&self, job_id: &str, height: Option<u32>) -> Option<&str> {
        self.ensured
            .as_ref()
            .filter(|e| e.job_id == job_id && e.height == height)
            .map(|e| e.path.as_str())
    }

    fn take_load(&mut self) -> InFlight {
        self.load_url = None;
        InFlight {
            load: self.load.take(),
            decode: self.decode_abort.take(),
            ..Default::default()
        }
    }

    fn take_in_flight(&mut self) -> InFlight {
        let mut stopped = self.take_load();
        stopped.ensure = self.ensure_cancel.take();
        stopped.recovery = self.recovery_cancel.take();
        stopped
    }
}

/// Handles to cancel once the row lock is released
#[derive(Default)]
struct InFlight {
    ensure: Option<EnsureCancel>,
    recovery: Option<EnsureCancel>,
    load: Option<ScheduledLoad>,
    decode: Option<AbortController>,
}

impl InFlight {
    fn merge(&mut self, other: InFlight) {
        self.ensure = self.ensure.take().or(other.ensure);
        self.recovery = self.recovery.take().or(other.recovery);
        self.load = self.load.take().or(other.load);
        self.decode = self.decode.take().or(other.decode);
    }

    fn cancel(self) {
        if let Some(ensure) = self.ensure {
            ensure.cancel();
        }
        if let Some(recovery) = self.recovery {
            recovery.cancel();
        }
        if let Some(load) = self.load {
            load.cancel();
        }
        if let Some(decode) = self.decode {
            decode.abort();
        }
    }
}

struct StartEnsure {
    generation: u64,
    job_id: String,
    params: EnsureParams,
}

struct StartLoad {
    generation: u64,
    url: String,
    priority: LoadPriority,
}

/// Side effects decided under the row lock and applied after releasing it
#[derive(Default)]
struct Plan {
    stop: InFlight,
    ensure: Option<StartEnsure>,
    load: Option<StartLoad>,
}

struct RowInner {
    row_key: String,
    pipeline: PreviewPipeline,
    state: Mutex<RowState>,
    url_tx: watch::Sender<Option<String>>,
}

/// Preview state machine for one list row
///
/// Dropping the controller cancels everything the row has in flight.
pub struct RowPreviewController {
    inner: Arc<RowInner>,
}

impl RowPreviewController {
    /// Create a controller for the row identified by `row_key`
    ///
    /// `row_key` keys the row's load slot and warm decode entry, so it should
    /// be stable across remounts of the same row.
    pub fn new(row_key: impl Into<String>, pipeline: PreviewPipeline) -> Self {
        let (url_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(RowInner {
                row_key: row_key.into(),
                pipeline,
                state: Mutex::new(RowState::default()),
                url_tx,
            }),
        }
    }

    pub fn row_key(&self) -> &str {
        &self.inner.row_key
    }

    /// Feed the latest job fields and hints
    ///
    /// A changed job id or desired height cancels every pending ensure, load
    /// and decode of the row and resets its memo before re-deriving the URL.
    pub fn update(&self, snapshot: RowSnapshot) -> SnapshotChange {
        let (change, plan) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.unmounted {
                return SnapshotChange::Unchanged;
            }

            let change = SnapshotChange::classify(state.snapshot.as_ref(), &snapshot);
            let mut stopped = InFlight::default();
            if change.resets_identity() {
                debug!(row = %self.inner.row_key, ?change, "row preview reset");
                stopped = state.take_in_flight();
                state.generation += 1;
                state.ensured = None;
                state.ensure_attempted = false;
                state.override_url = None;
                if change == SnapshotChange::IdentityChanged {
                    self.inner.show(state, None);
                }
            }
            state.snapshot = Some(snapshot);

            let mut plan = self.inner.plan(state);
            plan.stop.merge(stopped);
            (change, plan)
        };

        self.inner.apply(plan);
        change
    }

    /// URL the row should render right now
    pub fn preview_url(&self) -> Option<String> {
        self.inner.state.lock().shown.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.inner.url_tx.subscribe()
    }

    /// Recover from the rendered image failing to load
    ///
    /// Walks the fallback chain (sized variant re-request, direct bytes, base
    /// regeneration) and never repeats a step already tried for the current
    /// preview path.
    pub async fn handle_preview_error(&self) -> RecoveryOutcome {
        RowInner::recover(&self.inner).await
    }

    /// Cancel everything in flight and stop reacting to updates
    pub fn unmount(&self) {
        let stopped = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.unmounted {
                return;
            }
            state.unmounted = true;
            let stopped = state.take_in_flight();
            self.inner.show(state, None);
            stopped
        };
        stopped.cancel();
        trace!(row = %self.inner.row_key, "row unmounted");
    }
}

impl Drop for RowPreviewController {
    fn drop(&mut self) {
        self.unmount();
    }
}

impl std::fmt::Debug for RowPreviewController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowPreviewController")
            .field("row_key", &self.inner.row_key)
            .field("preview_url", &self.preview_url())
            .finish()
    }
}

struct RecoveryContext {
    generation: u64,
    job_id: String,
    height: Option<u32>,
    source: Source,
    variant_in_play: bool,
}

impl RowInner {
    fn show(&self, state: &mut RowState, url: Option<String>) {
        if state.shown != url {
            state.shown = url.clone();
            self.url_tx.send_replace(url);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.state.lock();
        state.generation == generation && !state.unmounted
    }

    /// Pick the path the row should display, before any URL mapping
    fn select_source(&self, state: &RowState, snapshot: &RowSnapshot) -> Option<Source> {
        let job = &snapshot.job;
        let height = snapshot.height();
        let ensured = state.ensured_for(&job.id, height);

        if let Some(path) = job.preview_path() {
            if let (Some(_), Some(variant)) = (height, ensured) {
                return Some(Source {
                    path: variant.to_string(),
                    revision: 0,
                });
            }
            return Some(Source {
                path: path.to_string(),
                revision: job.preview_revision,
            });
        }

        if job.job_type == JobType::Image {
            if let Some(path) = job.output_path().or(job.input_path()) {
                return Some(Source {
                    path: path.to_string(),
                    revision: job.preview_revision,
                });
            }
        }

        ensured
            .map(str::to_string)
            .or_else(|| self.pipeline.ensure.peek_cached(&job.id))
            .map(|path| Source { path, revision: 0 })
    }

    fn ensure_params(
        &self,
        state: &RowState,
        snapshot: &RowSnapshot,
        source: Option<&Source>,
    ) -> Option<EnsureParams> {
        let job = &snapshot.job;
        let height = snapshot.height();

        let eligible = match job.job_type {
            JobType::Video => true,
            JobType::Image => height.is_some(),
            JobType::Audio => false,
        };
        if !eligible || state.ensure_attempted || state.ensure_cancel.is_some() {
            return None;
        }
        if height.is_none() && (job.preview_path().is_some() || source.is_some()) {
            return None;
        }
        if state.ensured_for(&job.id, height).is_some() {
            return None;
        }
        if !snapshot.hints.allow_auto_ensure || !self.pipeline.backend().is_available() {
            return None;
        }
        Some(EnsureParams { height_px: height })
    }

    /// Re-derive the desired URL and decide what to start or stop
    fn plan(&self, state: &mut RowState) -> Plan {
        let mut plan = Plan::default();
        if state.unmounted {
            return plan;
        }
        let Some(snapshot) = state.snapshot.clone() else {
            return plan;
        };

        let source = self.select_source(state, &snapshot);
        if let Some(params) = self.ensure_params(state, &snapshot, source.as_ref()) {
            state.ensure_attempted = true;
            plan.ensure = Some(StartEnsure {
                generation: state.generation,
                job_id: snapshot.job.id.clone(),
                params,
            });
        }

        let desired = source.and_then(|source| {
            if self.pipeline.ledger.steps(&source.path, source.revision).exhausted {
                return None;
            }
            match &state.override_url {
                Some(o) if o.for_path == source.path => Some(o.url.clone()),
                _ => self.pipeline.urls.build(&source.path, source.revision),
            }
        });

        let Some(url) = desired else {
            plan.stop.merge(state.take_load());
            self.show(state, None);
            return plan;
        };

        let shown = state.shown.as_deref() == Some(url.as_str());
        let loading = state.load_url.as_deref() == Some(url.as_str());

        if !snapshot.hints.loads_allowed() {
            // Backpressure: only a known-good decode may be shown
            let warm = self.pipeline.warm.matches(&self.row_key, &url);
            if shown && warm && state.load_url.is_none() {
                return plan;
            }
            plan.stop.merge(state.take_load());
            self.show(state, warm.then_some(url));
            return plan;
        }

        if shown {
            if state.load_url.is_some() && !loading {
                plan.stop.merge(state.take_load());
            }
            return plan;
        }
        if loading {
            return plan;
        }

        plan.stop.merge(state.take_load());
        let priority = if state.shown.is_none() {
            LoadPriority::High
        } else {
            LoadPriority::Normal
        };
        state.load_url = Some(url.clone());
        plan.load = Some(StartLoad {
            generation: state.generation,
            url,
            priority,
        });
        plan
    }

    fn apply(self: &Arc<Self>, plan: Plan) {
        plan.stop.cancel();
        if let Some(load) = plan.load {
            self.start_load(load);
        }
        if let Some(ensure) = plan.ensure {
            self.start_ensure(ensure);
        }
    }

    fn replan(self: &Arc<Self>) {
        let plan = {
            let mut state = self.state.lock();
            self.plan(&mut state)
        };
        self.apply(plan);
    }

    fn start_ensure(self: &Arc<Self>, start: StartEnsure) {
        let StartEnsure {
            generation,
            job_id,
            params,
        } = start;
        debug!(row = %self.row_key, job_id = %job_id, cache_key = %params.cache_key(), "auto-ensuring preview");

        let ensure = &self.pipeline.ensure;
        // The resolved cache is per job; a sized request must not be answered
        // with a path produced for other params
        if params.height_px.is_some()
            && ensure
                .cached_params(&job_id)
                .is_some_and(|cached| cached != params)
        {
            ensure.forget_resolved(&job_id);
        }

        let ticket = ensure.request(&job_id, params);
        if ticket.is_ready() {
            let path = ticket.wait().now_or_never().flatten();
            self.on_ensured(generation, job_id, params.height_px, path);
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(row = %self.row_key, "no tokio runtime to await ensure result");
                ticket.cancel();
                return;
            }
        };

        {
            let mut state = self.state.lock();
            if state.generation != generation || state.unmounted {
                drop(state);
                ticket.cancel();
                return;
            }
            state.ensure_cancel = Some(ticket.cancel_handle());
        }

        let weak = Arc::downgrade(self);
        handle.spawn(async move {
            let path = ticket.wait().await;
            if let Some(row) = weak.upgrade() {
                row.on_ensured(generation, job_id, params.height_px, path);
            }
        });
    }

    fn on_ensured(
        self: &Arc<Self>,
        generation: u64,
        job_id: String,
        height: Option<u32>,
        path: Option<String>,
    ) {
        let plan = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.generation != generation || state.unmounted {
                return;
            }
            state.ensure_cancel = None;
            match path {
                Some(path) => {
                    trace!(row = %self.row_key, path = %path, "preview ensured");
                    state.ensured = Some(EnsuredPath {
                        job_id,
                        height,
                        path,
                    });
                }
                None => debug!(row = %self.row_key, job_id = %job_id, "backend resolved no preview"),
            }
            self.plan(state)
        };
        self.apply(plan);
    }

    fn start_load(self: &Arc<Self>, start: StartLoad) {
        let StartLoad {
            generation,
            url,
            priority,
        } = start;
        let weak = Arc::downgrade(self);
        let task_url = url.clone();
        let handle = self.pipeline.scheduler.schedule(
            &self.row_key,
            move || run_load(weak, generation, task_url),
            priority,
        );

        let mut state = self.state.lock();
        if state.generation == generation && state.load_url.as_deref() == Some(url.as_str()) {
            state.load = Some(handle);
        }
    }

    /// A load body ran for a URL the row no longer wants
    fn on_stale_load(self: &Arc<Self>) {
        let stopped = {
            let mut state = self.state.lock();
            if state.unmounted {
                return;
            }
            state.take_load()
        };
        stopped.cancel();
        self.replan();
    }

    fn finish_load(&self, generation: u64, url: &str, decoded: bool) {
        let mut state = self.state.lock();
        if state.generation != generation || state.load_url.as_deref() != Some(url) {
            return;
        }
        state.load_url = None;
        state.decode_abort = None;
        if decoded && state.shown.as_deref() == Some(url) {
            self.pipeline.warm.mark(&self.row_key, url);
        }
    }

    async fn recover(self: &Arc<Self>) -> RecoveryOutcome {
        let ctx = {
            let state = self.state.lock();
            if state.unmounted {
                return RecoveryOutcome::Abandoned;
            }
            let Some(snapshot) = state.snapshot.as_ref() else {
                return RecoveryOutcome::NothingToRecover;
            };
            let Some(source) = self.select_source(&state, snapshot) else {
                return RecoveryOutcome::NothingToRecover;
            };
            let height = snapshot.height();
            let variant_in_play = height.is_some()
                && state.ensured_for(&snapshot.job.id, height) == Some(source.path.as_str());
            RecoveryContext {
                generation: state.generation,
                job_id: snapshot.job.id.clone(),
                height,
                source,
                variant_in_play,
            }
        };

        let ledger = self.pipeline.ledger.clone();
        let (path, revision) = (ctx.source.path.as_str(), ctx.source.revision);
        let steps = ledger.steps(path, revision);
        if steps.exhausted {
            return RecoveryOutcome::Exhausted;
        }
        warn!(row = %self.row_key, path, "preview failed to display, recovering");

        if ctx.variant_in_play && !steps.variant_retried {
            ledger.record(path, revision, |s| s.variant_retried = true);
            let params = EnsureParams {
                height_px: ctx.height,
            };
            if let Some(fresh) = self.ensure_again(&ctx, params).await {
                return self.redisplay(&ctx, RedisplayUrl::Asset(fresh), true);
            }
            if !self.is_current(ctx.generation) {
                return RecoveryOutcome::Abandoned;
            }
        }

        if let Some(loader) = self.pipeline.direct.clone() {
            if !steps.direct_tried {
                ledger.record(path, revision, |s| s.direct_tried = true);
                match loader.load_direct(path).await {
                    Ok(data_url) => {
                        return self.redisplay(&ctx, RedisplayUrl::Inline(data_url), false);
                    }
                    Err(err) => warn!(row = %self.row_key, path, error = %err, "direct preview load failed"),
                }
                if !self.is_current(ctx.generation) {
                    return RecoveryOutcome::Abandoned;
                }
            }
        }

        if !steps.regenerate_tried {
            ledger.record(path, revision, |s| s.regenerate_tried = true);
            if let Some(fresh) = self.ensure_again(&ctx, EnsureParams::default()).await {
                return self.redisplay(&ctx, RedisplayUrl::Asset(fresh), false);
            }
            if !self.is_current(ctx.generation) {
                return RecoveryOutcome::Abandoned;
            }
        }

        ledger.record(path, revision, |s| s.exhausted = true);
        warn!(row = %self.row_key, path, "preview recovery exhausted");
        let plan = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.generation != ctx.generation {
                return RecoveryOutcome::Abandoned;
            }
            state.override_url = None;
            self.plan(state)
        };
        self.apply(plan);
        RecoveryOutcome::Exhausted
    }

    /// Invalidate and re-request a preview, cancellable like any row ensure
    async fn ensure_again(
        self: &Arc<Self>,
        ctx: &RecoveryContext,
        params: EnsureParams,
    ) -> Option<String> {
        self.pipeline.ensure.invalidate(&ctx.job_id, params);
        let ticket = self.pipeline.ensure.request(&ctx.job_id, params);
        {
            let mut state = self.state.lock();
            if state.generation != ctx.generation || state.unmounted {
                drop(state);
                ticket.cancel();
                return None;
            }
            state.recovery_cancel = Some(ticket.cancel_handle());
        }

        let path = ticket.wait().await;

        let mut state = self.state.lock();
        if state.generation != ctx.generation {
            return None;
        }
        state.recovery_cancel = None;
        path
    }

    fn redisplay(
        self: &Arc<Self>,
        ctx: &RecoveryContext,
        url: RedisplayUrl,
        is_variant: bool,
    ) -> RecoveryOutcome {
        let (plan, url) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.generation != ctx.generation || state.unmounted {
                return RecoveryOutcome::Abandoned;
            }

            let (for_path, url) = match url {
                RedisplayUrl::Inline(url) => (ctx.source.path.clone(), url),
                RedisplayUrl::Asset(path) => {
                    if is_variant || ctx.height.is_none() {
                        state.ensured = Some(EnsuredPath {
                            job_id: ctx.job_id.clone(),
                            height: ctx.height,
                            path: path.clone(),
                        });
                    }
                    let revision = if path == ctx.source.path {
                        ctx.source.revision
                    } else {
                        0
                    };
                    let Some(base) = self.pipeline.urls.build(&path, revision) else {
                        return RecoveryOutcome::NothingToRecover;
                    };
                    // The override belongs to whatever the row now selects
                    let for_path = state
                        .snapshot
                        .as_ref()
                        .and_then(|snapshot| self.select_source(&*state, snapshot))
                        .map_or(path, |source| source.path);
                    let busted = with_cache_bust(&base, CACHE_BUST_SEQ.fetch_add(1, Ordering::Relaxed));
                    (for_path, busted)
                }
            };

            debug!(row = %self.row_key, url = %url, "redisplaying recovered preview");
            state.override_url = Some(OverrideUrl {
                for_path,
                url: url.clone(),
            });
            (self.plan(state), url)
        };
        self.apply(plan);
        RecoveryOutcome::Recovered(url)
    }
}

enum RedisplayUrl {
    /// Freshly ensured path, mapped through the URL builder with a cache bust
    Asset(String),
    /// Self-contained URL from the direct-bytes loader
    Inline(String),
}

/// Body of a scheduled row load
fn run_load(weak: Weak<RowInner>, generation: u64, url: String) -> LoadRun {
    let Some(row) = weak.upgrade() else {
        return LoadRun::Done;
    };

    let decode = {
        let mut guard = row.state.lock();
        let state = &mut *guard;
        if state.unmounted {
            return LoadRun::Done;
        }
        if state.generation != generation || state.load_url.as_deref() != Some(url.as_str()) {
            drop(guard);
            row.on_stale_load();
            return LoadRun::Done;
        }

        state.load = None;
        row.show(state, Some(url.clone()));
        row.pipeline.decoder.clone().map(|decoder| {
            let abort = AbortController::new();
            state.decode_abort = Some(abort.clone());
            (decoder, abort)
        })
    };

    let Some((decoder, abort)) = decode else {
        row.finish_load(generation, &url, true);
        return LoadRun::Done;
    };

    let signal = abort.signal();
    let weak = Arc::downgrade(&row);
    LoadRun::pending(async move {
        let outcome = tokio::select! {
            _ = signal.aborted() => None,
            result = decoder.decode(&url) => Some(result),
        };
        let Some(row) = weak.upgrade() else {
            return;
        };
        match outcome {
            None => trace!(row = %row.row_key, url = %url, "pre-decode aborted"),
            Some(Ok(())) => row.finish_load(generation, &url, true),
            Some(Err(err)) => {
                debug!(row = %row.row_key, url = %url, error = %err, "pre-decode failed");
                row.finish_load(generation, &url, false);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{settle, MockBackend, MockDecoder, MockLoader};
    use jobrow_scheduler::{IdleHost, Wake};
    use std::time::Duration;

    fn url_for(path: &str, revision: u64) -> String {
        AssetUrlBuilder::default()
            .build(path, revision)
            .unwrap_or_default()
    }

    fn pipeline(backend: &Arc<MockBackend>) -> PreviewPipeline {
        PreviewPipeline::new(backend.clone(), &PipelineConfig::default())
    }

    fn video(id: &str) -> JobView {
        JobView::new(id, JobType::Video)
    }

    #[tokio::test]
    async fn test_preview_path_is_loaded_and_marked_warm() {
        let backend = MockBackend::new();
        let pipeline = pipeline(&backend);
        let row = RowPreviewController::new("row-1", pipeline.clone());

        let change = row.update(RowSnapshot::new(video("j1").with_preview("/p/a.jpg", 2)));
        assert_eq!(change, SnapshotChange::Mounted);
        settle().await;

        let url = url_for("/p/a.jpg", 2);
        assert_eq!(row.preview_url(), Some(url.clone()));
        assert!(pipeline.warm.matches("row-1", &url));
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_backpressure_defers_decode_until_loads_allowed() {
        let backend = MockBackend::new();
        let decoder = MockDecoder::new();
        let pipeline = pipeline(&backend).with_decoder(decoder.clone());
        let row = RowPreviewController::new("row-1", pipeline.clone());
        let job = video("j1").with_preview("/p/a.jpg", 0);
        let url = url_for("/p/a.jpg", 0);

        row.update(RowSnapshot::new(job.clone()).with_hints(PerfHints::default().scrolling(true)));
        settle().await;
        assert_eq!(row.preview_url(), None);
        assert!(decoder.decoded().is_empty());

        let change = row.update(RowSnapshot::new(job.clone()));
        assert_eq!(change, SnapshotChange::HintsChanged);
        settle().await;
        assert_eq!(row.preview_url(), Some(url.clone()));
        assert_eq!(decoder.decoded(), vec![url.clone()]);
        assert!(pipeline.warm.matches("row-1", &url));

        // Re-applying the same snapshot never decodes twice
        row.update(RowSnapshot::new(job));
        settle().await;
        assert_eq!(decoder.decoded().len(), 1);
    }

    #[tokio::test]
    async fn test_warm_decode_shows_while_scrolling() {
        let backend = MockBackend::new();
        let pipeline = pipeline(&backend);
        let job = video("j1").with_preview("/p/a.jpg", 0);
        let url = url_for("/p/a.jpg", 0);

        let first = RowPreviewController::new("row-1", pipeline.clone());
        first.update(RowSnapshot::new(job.clone()));
        settle().await;
        drop(first);

        let remounted = RowPreviewController::new("row-1", pipeline.clone());
        remounted.update(RowSnapshot::new(job).with_hints(PerfHints::default().with_loads(false)));
        assert_eq!(remounted.preview_url(), Some(url));
    }

    #[tokio::test]
    async fn test_scrolling_hides_url_without_warm_decode() {
        let backend = MockBackend::new();
        let decoder = MockDecoder::new();
        decoder.fail.store(true, Ordering::SeqCst);
        let pipeline = pipeline(&backend).with_decoder(decoder.clone());
        let row = RowPreviewController::new("row-1", pipeline.clone());
        let job = video("j1").with_preview("/p/a.jpg", 0);

        row.update(RowSnapshot::new(job.clone()));
        settle().await;
        assert_eq!(row.preview_url(), Some(url_for("/p/a.jpg", 0)));

        row.update(RowSnapshot::new(job).with_hints(PerfHints::default().scrolling(true)));
        assert_eq!(row.preview_url(), None);
    }

    #[tokio::test]
    async fn test_losing_load_hint_aborts_decode() {
        let backend = MockBackend::new();
        let (decoder, gate) = MockDecoder::gated();
        let pipeline = pipeline(&backend).with_decoder(decoder.clone());
        let row = RowPreviewController::new("row-1", pipeline.clone());
        let job = video("j1").with_preview("/p/a.jpg", 0);
        let url = url_for("/p/a.jpg", 0);

        row.update(RowSnapshot::new(job.clone()));
        settle().await;
        assert_eq!(row.preview_url(), Some(url.clone()));

        let change =
            row.update(RowSnapshot::new(job.clone()).with_hints(PerfHints::default().scrolling(true)));
        assert_eq!(change, SnapshotChange::HintsChanged);
        assert_eq!(row.preview_url(), None);

        gate.add_permits(8);
        settle().await;
        assert!(decoder.decoded().is_empty());
        assert!(!pipeline.warm.matches("row-1", &url));
        assert_eq!(row.preview_url(), None);

        // Loads resume with a single fresh decode
        row.update(RowSnapshot::new(job));
        settle().await;
        assert_eq!(decoder.decoded(), vec![url.clone()]);
        assert!(pipeline.warm.matches("row-1", &url));
    }

    #[derive(Default)]
    struct IdleRecorder {
        timeouts: Mutex<Vec<Duration>>,
        wakes: Mutex<Vec<Wake>>,
    }

    impl IdleHost for IdleRecorder {
        fn request_idle(&self, timeout: Duration, wake: Wake) {
            self.timeouts.lock().push(timeout);
            self.wakes.lock().push(wake);
        }
    }

    #[tokio::test]
    async fn test_host_idle_callbacks_use_configured_timeout() {
        let backend = MockBackend::new();
        let idle = Arc::new(IdleRecorder::default());
        let config = PipelineConfig::default().with_idle_timeout_ms(75);
        let pipeline = PreviewPipeline::with_host(
            backend.clone(),
            &config,
            HostCapabilities::timer_only().with_idle(idle.clone()),
        );
        let row = RowPreviewController::new("row-1", pipeline);

        // First paint is visible work and skips the idle callback
        row.update(RowSnapshot::new(video("j1").with_preview("/p/a.jpg", 0)));
        settle().await;
        assert_eq!(row.preview_url(), Some(url_for("/p/a.jpg", 0)));
        assert!(idle.timeouts.lock().is_empty());

        row.update(RowSnapshot::new(video("j1").with_preview("/p/a.jpg", 1)));
        settle().await;
        assert_eq!(*idle.timeouts.lock(), vec![Duration::from_millis(75)]);
        assert_eq!(row.preview_url(), Some(url_for("/p/a.jpg", 0)));

        let wakes: Vec<Wake> = idle.wakes.lock().drain(..).collect();
        for wake in wakes {
            wake();
        }
        settle().await;
        assert_eq!(row.preview_url(), Some(url_for("/p/a.jpg", 1)));
    }

    #[tokio::test]
    async fn test_failed_decode_is_not_warm() {
        let backend = MockBackend::new();
        let decoder = MockDecoder::new();
        decoder.fail.store(true, Ordering::SeqCst);
        let pipeline = pipeline(&backend).with_decoder(decoder.clone());
        let row = RowPreviewController::new("row-1", pipeline.clone());

        row.update(RowSnapshot::new(video("j1").with_preview("/p/a.jpg", 0)));
        settle().await;

        let url = url_for("/p/a.jpg", 0);
        assert_eq!(row.preview_url(), Some(url.clone()));
        assert!(!pipeline.warm.matches("row-1", &url));
    }

    #[tokio::test]
    async fn test_auto_ensure_runs_once() {
        let backend = MockBackend::new();
        let pipeline = pipeline(&backend);
        let row = RowPreviewController::new("row-1", pipeline.clone());

        row.update(RowSnapshot::new(video("j1")));
        assert_eq!(row.preview_url(), None);
        settle().await;
        settle().await;

        assert_eq!(row.preview_url(), Some(url_for("/previews/j1.jpg", 0)));
        assert_eq!(backend.calls(), vec!["default:j1".to_string()]);

        row.update(RowSnapshot::new(video("j1")));
        settle().await;

        // A second row for the same job reuses the resolved path
        let other = RowPreviewController::new("row-2", pipeline.clone());
        other.update(RowSnapshot::new(video("j1")));
        settle().await;
        assert_eq!(other.preview_url(), Some(url_for("/previews/j1.jpg", 0)));
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_height_change_requests_real_variant() {
        let backend = MockBackend::new();
        let pipeline = pipeline(&backend);
        let row = RowPreviewController::new("row-1", pipeline.clone());

        row.update(RowSnapshot::new(video("j1")));
        settle().await;
        settle().await;
        assert_eq!(row.preview_url(), Some(url_for("/previews/j1.jpg", 0)));

        let change = row.update(RowSnapshot::new(video("j1")).with_height(120));
        assert_eq!(change, SnapshotChange::HeightChanged);
        settle().await;
        settle().await;

        assert_eq!(
            backend.calls(),
            vec!["default:j1".to_string(), "h120:j1".to_string()]
        );
        assert_eq!(row.preview_url(), Some(url_for("/previews/j1-h120.jpg", 0)));

        // Another row at the same height is served the cached variant
        let other = RowPreviewController::new("row-2", pipeline.clone());
        other.update(RowSnapshot::new(video("j1")).with_height(120));
        settle().await;
        assert_eq!(other.preview_url(), Some(url_for("/previews/j1-h120.jpg", 0)));
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_auto_ensure_respects_gates() {
        let backend = MockBackend::new();
        let pipeline = pipeline(&backend);

        let disabled = RowPreviewController::new("row-1", pipeline.clone());
        disabled.update(
            RowSnapshot::new(video("j1")).with_hints(PerfHints::default().with_auto_ensure(false)),
        );

        let audio = RowPreviewController::new("row-2", pipeline.clone());
        audio.update(RowSnapshot::new(JobView::new("j2", JobType::Audio)));

        let image = RowPreviewController::new("row-3", pipeline.clone());
        image.update(RowSnapshot::new(JobView::new("j3", JobType::Image)));

        backend.set_available(false);
        let offline = RowPreviewController::new("row-4", pipeline.clone());
        offline.update(RowSnapshot::new(video("j4")));

        settle().await;
        assert_eq!(backend.call_count(), 0);
        assert_eq!(offline.preview_url(), None);
    }

    #[tokio::test]
    async fn test_sized_variant_replaces_preview_path() {
        let backend = MockBackend::new();
        let pipeline = pipeline(&backend);
        let row = RowPreviewController::new("row-1", pipeline.clone());

        row.update(RowSnapshot::new(video("j1").with_preview("/p/a.jpg", 3)).with_height(120));
        assert_eq!(row.preview_url(), None);
        settle().await;
        settle().await;

        assert_eq!(row.preview_url(), Some(url_for("/previews/j1-h120.jpg", 0)));
        assert_eq!(backend.calls(), vec!["h120:j1".to_string()]);
    }

    #[tokio::test]
    async fn test_image_falls_back_to_output_then_input() {
        let backend = MockBackend::new();
        let pipeline = pipeline(&backend);
        let row = RowPreviewController::new("row-1", pipeline.clone());

        let image = JobView::new("j1", JobType::Image).with_input_path("/in/x.png");
        row.update(RowSnapshot::new(image.clone()));
        settle().await;
        assert_eq!(row.preview_url(), Some(url_for("/in/x.png", 0)));

        let change = row.update(RowSnapshot::new(image.with_output_path("/out/x.webp")));
        assert_eq!(change, SnapshotChange::PreviewChanged);
        settle().await;
        assert_eq!(row.preview_url(), Some(url_for("/out/x.webp", 0)));
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_identity_change_cancels_in_flight_work() {
        let (backend, backend_gate) = MockBackend::gated();
        let (decoder, decoder_gate) = MockDecoder::gated();
        let pipeline = pipeline(&backend).with_decoder(decoder.clone());
        let row = RowPreviewController::new("row-1", pipeline.clone());

        row.update(RowSnapshot::new(video("a").with_preview("/p/a.jpg", 0)));
        settle().await;
        let url_a = url_for("/p/a.jpg", 0);
        assert_eq!(row.preview_url(), Some(url_a.clone()));

        // Occupy the ensure worker so the row's request stays queued
        let busy = pipeline.ensure.request("busy", EnsureParams::default());
        settle().await;

        assert_eq!(row.update(RowSnapshot::new(video("b"))), SnapshotChange::IdentityChanged);
        assert_eq!(row.preview_url(), None);
        row.update(RowSnapshot::new(video("c")));
        assert_eq!(pipeline.ensure.stats().cancelled_before_start, 1);

        backend_gate.add_permits(8);
        decoder_gate.add_permits(8);
        assert_eq!(busy.wait().await, Some("/previews/busy.jpg".to_string()));
        settle().await;
        settle().await;

        assert_eq!(
            backend.calls(),
            vec!["default:busy".to_string(), "default:c".to_string()]
        );
        assert!(decoder.decoded().iter().all(|url| url != &url_a));
        assert!(!pipeline.warm.matches("row-1", &url_a));
        assert_eq!(row.preview_url(), Some(url_for("/previews/c.jpg", 0)));
    }

    #[tokio::test]
    async fn test_first_load_is_high_priority() {
        let backend = MockBackend::new();
        let pipeline = pipeline(&backend);
        let row = RowPreviewController::new("row-1", pipeline.clone());

        row.update(RowSnapshot::new(video("j1").with_preview("/p/a.jpg", 0)));
        assert_eq!(
            pipeline.scheduler.queued_priority("row-1"),
            Some(LoadPriority::High)
        );
        settle().await;

        row.update(RowSnapshot::new(video("j1").with_preview("/p/a.jpg", 1)));
        assert_eq!(
            pipeline.scheduler.queued_priority("row-1"),
            Some(LoadPriority::Normal)
        );
        // The old image stays up until the replacement has loaded
        assert_eq!(row.preview_url(), Some(url_for("/p/a.jpg", 0)));
        settle().await;
        assert_eq!(row.preview_url(), Some(url_for("/p/a.jpg", 1)));
    }

    #[tokio::test]
    async fn test_recovery_walks_chain_once() {
        let backend = MockBackend::new();
        let loader = Arc::new(MockLoader::default());
        let pipeline = pipeline(&backend).with_direct_loader(loader.clone());
        let row = RowPreviewController::new("row-1", pipeline.clone());
        let job = video("j1").with_preview("/p/a.jpg", 0);

        row.update(RowSnapshot::new(job.clone()));
        settle().await;

        let data_url = "data:image/jpeg;base64,8".to_string();
        assert_eq!(
            row.handle_preview_error().await,
            RecoveryOutcome::Recovered(data_url.clone())
        );
        settle().await;
        assert_eq!(row.preview_url(), Some(data_url));

        let RecoveryOutcome::Recovered(regenerated) = row.handle_preview_error().await else {
            panic!("expected a regenerated preview");
        };
        assert!(regenerated.starts_with(&url_for("/previews/j1.jpg", 0)));
        assert!(regenerated.contains("?cb="));
        settle().await;
        assert_eq!(row.preview_url(), Some(regenerated));

        assert_eq!(row.handle_preview_error().await, RecoveryOutcome::Exhausted);
        assert_eq!(row.preview_url(), None);
        assert_eq!(row.handle_preview_error().await, RecoveryOutcome::Exhausted);

        assert_eq!(loader.calls.lock().len(), 1);
        assert_eq!(backend.calls(), vec!["default:j1".to_string()]);

        // Remounting the row does not start over
        let remounted = RowPreviewController::new("row-2", pipeline.clone());
        remounted.update(RowSnapshot::new(job));
        settle().await;
        assert_eq!(remounted.preview_url(), None);
        assert_eq!(remounted.handle_preview_error().await, RecoveryOutcome::Exhausted);
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_path_stays_dark_after_time_passes() {
        let backend = MockBackend::new();
        let pipeline = pipeline(&backend);
        let job = video("j1").with_preview("/p/a.jpg", 0);

        let row = RowPreviewController::new("row-1", pipeline.clone());
        row.update(RowSnapshot::new(job.clone()));
        settle().await;
        assert!(matches!(
            row.handle_preview_error().await,
            RecoveryOutcome::Recovered(_)
        ));
        assert_eq!(row.handle_preview_error().await, RecoveryOutcome::Exhausted);
        drop(row);
        let calls = backend.call_count();

        tokio::time::advance(Duration::from_secs(11 * 60)).await;

        let remounted = RowPreviewController::new("row-1", pipeline.clone());
        remounted.update(RowSnapshot::new(job));
        settle().await;
        assert_eq!(remounted.preview_url(), None);
        assert!(pipeline.ledger.steps("/p/a.jpg", 0).exhausted);
        assert_eq!(backend.call_count(), calls);
    }

    #[tokio::test]
    async fn test_recovery_retries_sized_variant_first() {
        let backend = MockBackend::new();
        let pipeline = pipeline(&backend);
        let row = RowPreviewController::new("row-1", pipeline.clone());

        row.update(RowSnapshot::new(video("j1").with_preview("/p/a.jpg", 0)).with_height(90));
        settle().await;
        settle().await;
        assert_eq!(row.preview_url(), Some(url_for("/previews/j1-h90.jpg", 0)));

        let RecoveryOutcome::Recovered(url) = row.handle_preview_error().await else {
            panic!("expected the variant to be re-requested");
        };
        assert!(url.starts_with(&url_for("/previews/j1-h90.jpg", 0)));
        assert!(url.contains("?cb="));
        assert_eq!(backend.calls(), vec!["h90:j1".to_string(), "h90:j1".to_string()]);
    }

    #[tokio::test]
    async fn test_recovery_without_source() {
        let backend = MockBackend::new();
        let row = RowPreviewController::new("row-1", pipeline(&backend));
        row.update(RowSnapshot::new(JobView::new("j1", JobType::Audio)));

        assert_eq!(
            row.handle_preview_error().await,
            RecoveryOutcome::NothingToRecover
        );
    }

    #[tokio::test]
    async fn test_subscribe_and_unmount() {
        let backend = MockBackend::new();
        let row = RowPreviewController::new("row-1", pipeline(&backend));
        let mut rx = row.subscribe();

        row.update(RowSnapshot::new(video("j1").with_preview("/p/a.jpg", 0)));
        settle().await;
        assert!(rx.has_changed().unwrap_or(false));
        assert_eq!(*rx.borrow_and_update(), Some(url_for("/p/a.jpg", 0)));

        row.unmount();
        assert_eq!(*rx.borrow(), None);
        assert_eq!(
            row.update(RowSnapshot::new(video("j2"))),
            SnapshotChange::Unchanged
        );
        assert_eq!(row.preview_url(), None);
    }

    #[test]
    fn test_classify_orders_changes() {
        let base = RowSnapshot::new(video("j1").with_preview("/p/a.jpg", 0));
        assert_eq!(SnapshotChange::classify(None, &base), SnapshotChange::Mounted);
        assert_eq!(
            SnapshotChange::classify(Some(&base), &base.clone()),
            SnapshotChange::Unchanged
        );

        let other_job = RowSnapshot::new(video("j2")).with_height(64);
        assert_eq!(
            SnapshotChange::classify(Some(&base), &other_job),
            SnapshotChange::IdentityChanged
        );

        let taller = base.clone().with_height(64);
        assert_eq!(
            SnapshotChange::classify(Some(&base), &taller),
            SnapshotChange::HeightChanged
        );
        // Height 0 means the default preview
        assert_eq!(
            SnapshotChange::classify(Some(&base), &base.clone().with_height(0)),
            SnapshotChange::Unchanged
        );

        let bumped = RowSnapshot::new(video("j1").with_preview("/p/a.jpg", 1));
        assert_eq!(
            SnapshotChange::classify(Some(&base), &bumped),
            SnapshotChange::PreviewChanged
        );

        let scrolling = base.clone().with_hints(PerfHints::default().scrolling(true));
        assert_eq!(
            SnapshotChange::classify(Some(&base), &scrolling),
            SnapshotChange::HintsChanged
        );
    }

    #[test]
    fn test_ledger_keys_by_revision() {
        let ledger = RecoveryLedger::default();
        ledger.record("/p/a.jpg", 1, |s| s.direct_tried = true);

        assert!(ledger.steps("/p/a.jpg", 1).direct_tried);
        assert_eq!(ledger.steps("/p/a.jpg", 2), RecoverySteps::default());

        ledger.clear("/p/a.jpg", 1);
        assert_eq!(ledger.steps("/p/a.jpg", 1), RecoverySteps::default());
        assert!(ledger.is_empty());
    }
}
