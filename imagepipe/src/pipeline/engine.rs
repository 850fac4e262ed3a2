//! The image pipeline engine.
//!
//! [`ImagePipeline`] turns requests into a chain of shared work units:
//!
//! ```text
//! request [P1, P2] ──▶ process(k=2) ──▶ process(k=1) ──▶ decode ──▶ fetch
//!                          ▲                 ▲              ▲          ▲
//!              registry by ProcessingKey ────┘   by LoadKey ┘  by DataKey
//! ```
//!
//! Only the terminal unit is created at submission. Each unit resolves its
//! own input lazily when its driver starts: first the disk cache (terminal
//! units only), then the memory cache for the next shorter prefix, and
//! only then by subscribing to the upstream unit. Two requests sharing a
//! prefix therefore share every unit up to the point where they diverge.

use crate::pipeline::coalesce::{Coalesced, CoalescerStats, CoalescingRegistry};
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::error::PipelineError;
use crate::pipeline::scheduler::StageScheduler;
use crate::pipeline::stages::{decode_stage, fetch_stage, process_stage, ResultCacheWriter};
use crate::pipeline::task::{
    CacheType, CancelOnDrop, CompletionCallback, ImageResponse, ImageTask, Progress,
    ProgressCallback, TaskResult,
};
use crate::pipeline::work_unit::{
    CommitPolicy, Dependency, ProgressSink, StageKind, StageResult, Subscription, WorkUnit,
};
use crate::processing::ImageContainer;
use crate::request::{DataKey, DecodingHints, ImageRequest, LoadKey, ProcessingKey, RequestKeys};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Output of decode and process units.
#[derive(Clone)]
struct StageImage {
    image: ImageContainer,
    cache_type: Option<CacheType>,
}

impl StageImage {
    fn computed(image: ImageContainer) -> Self {
        Self {
            image,
            cache_type: None,
        }
    }

    fn from_disk(image: ImageContainer) -> Self {
        Self {
            image,
            cache_type: Some(CacheType::Disk),
        }
    }
}

/// A request together with every key derived from it.
///
/// The request that creates a unit is the one whose processors drive it;
/// any other request joining the unit has the same key and therefore
/// equivalent processors.
struct RequestPlan {
    request: ImageRequest,
    keys: RequestKeys,
}

impl RequestPlan {
    fn new(request: ImageRequest) -> Self {
        let keys = RequestKeys::derive(&request);
        Self { request, keys }
    }
}

/// Coalescing statistics for every stage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineStats {
    pub fetch: CoalescerStats,
    pub decode: CoalescerStats,
    pub process: CoalescerStats,
    /// Live work units across all stages
    pub in_flight: usize,
}

struct PipelineInner {
    config: PipelineConfig,
    context: PipelineContext,
    writer: ResultCacheWriter,
    runtime: Handle,
    fetches: CoalescingRegistry<DataKey, Bytes>,
    decodes: CoalescingRegistry<LoadKey, StageImage>,
    processes: CoalescingRegistry<ProcessingKey, StageImage>,
    fetch_scheduler: Arc<StageScheduler>,
    decode_scheduler: Arc<StageScheduler>,
    process_scheduler: Arc<StageScheduler>,
    invalidated: AtomicBool,
}

/// Loads and processes images, sharing work between equivalent requests.
///
/// Cheaply cloneable; clones share the same registries and caches.
#[derive(Clone)]
pub struct ImagePipeline {
    inner: Arc<PipelineInner>,
}

impl ImagePipeline {
    /// Creates a pipeline on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::RuntimeUnavailable`] outside a runtime.
    pub fn new(config: PipelineConfig, context: PipelineContext) -> Result<Self, PipelineError> {
        let runtime = Handle::try_current().map_err(|_| PipelineError::RuntimeUnavailable)?;
        Ok(Self::with_runtime(config, context, runtime))
    }

    /// Creates a pipeline that spawns its work on `runtime`.
    pub fn with_runtime(config: PipelineConfig, context: PipelineContext, runtime: Handle) -> Self {
        let enabled = config.coalescing_enabled;
        info!(
            coalescing = enabled,
            max_concurrent_fetches = config.max_concurrent_fetches,
            max_concurrent_decodes = config.max_concurrent_decodes,
            max_concurrent_processing = config.max_concurrent_processing,
            "Creating image pipeline"
        );

        let inner = PipelineInner {
            writer: ResultCacheWriter::new(&context),
            fetch_scheduler: Arc::new(StageScheduler::new(
                "fetch",
                config.max_concurrent_fetches,
            )),
            decode_scheduler: Arc::new(StageScheduler::new(
                "decode",
                config.max_concurrent_decodes,
            )),
            process_scheduler: Arc::new(StageScheduler::new(
                "process",
                config.max_concurrent_processing,
            )),
            fetches: CoalescingRegistry::new(StageKind::Fetch, enabled),
            decodes: CoalescingRegistry::new(StageKind::Decode, enabled),
            processes: CoalescingRegistry::new(StageKind::Process, enabled),
            invalidated: AtomicBool::new(false),
            config,
            context,
            runtime,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn context(&self) -> &PipelineContext {
        &self.inner.context
    }

    /// Submits a request.
    ///
    /// `on_complete` is invoked exactly once on a runtime thread, never from
    /// within this call, unless the returned task is cancelled first.
    pub fn submit<C>(&self, request: ImageRequest, on_complete: C) -> ImageTask
    where
        C: FnOnce(TaskResult) + Send + 'static,
    {
        self.inner.submit(request, None, Box::new(on_complete))
    }

    /// Submits a request, receiving fetch progress as well.
    ///
    /// Progress values never decrease and stop once the task finishes or
    /// is cancelled.
    pub fn submit_with_progress<P, C>(
        &self,
        request: ImageRequest,
        on_progress: P,
        on_complete: C,
    ) -> ImageTask
    where
        P: Fn(Progress) + Send + Sync + 'static,
        C: FnOnce(TaskResult) + Send + 'static,
    {
        self.inner
            .submit(request, Some(Box::new(on_progress)), Box::new(on_complete))
    }

    /// Loads an image, cancelling the request if the future is dropped.
    pub async fn load(&self, request: ImageRequest) -> TaskResult {
        let (tx, rx) = oneshot::channel();
        let task = self.submit(request, move |result| {
            let _ = tx.send(result);
        });

        let guard = CancelOnDrop::new(task);
        let result = rx.await.unwrap_or(Err(PipelineError::Shutdown));
        guard.disarm();
        result
    }

    /// Returns the memory-cached result for `request`, if any.
    pub fn cached_image(&self, request: &ImageRequest) -> Option<ImageContainer> {
        let key = RequestKeys::derive(request).full_result_key();
        self.inner.context.memory_cache.get(&key)
    }

    /// Shuts the pipeline down.
    ///
    /// All in-flight work is cancelled and every outstanding task completes
    /// with [`PipelineError::Shutdown`], as does anything submitted later.
    /// Cache contents are left alone.
    pub fn invalidate(&self) {
        if self.inner.invalidated.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Invalidating image pipeline");
        self.inner.processes.abort_all();
        self.inner.decodes.abort_all();
        self.inner.fetches.abort_all();
    }

    pub fn is_invalidated(&self) -> bool {
        self.inner.invalidated.load(Ordering::Acquire)
    }

    /// Returns a snapshot of coalescing statistics.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            fetch: self.inner.fetches.stats(),
            decode: self.inner.decodes.stats(),
            process: self.inner.processes.stats(),
            in_flight: self.inner.fetches.in_flight_count()
                + self.inner.decodes.in_flight_count()
                + self.inner.processes.in_flight_count(),
        }
    }

    /// Logs coalescing statistics for every stage.
    pub fn log_stats(&self) {
        self.inner.fetches.log_stats();
        self.inner.decodes.log_stats();
        self.inner.processes.log_stats();
    }
}

impl std::fmt::Debug for ImagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePipeline")
            .field("config", &self.inner.config)
            .field("invalidated", &self.is_invalidated())
            .field("stats", &self.stats())
            .finish()
    }
}

impl PipelineInner {
    fn submit(
        self: &Arc<Self>,
        request: ImageRequest,
        on_progress: Option<ProgressCallback>,
        on_complete: CompletionCallback,
    ) -> ImageTask {
        let task = ImageTask::new(
            request.locator().clone(),
            request.priority(),
            on_progress,
            on_complete,
        );

        if self.invalidated.load(Ordering::Acquire) {
            self.deliver(&task, Err(PipelineError::Shutdown));
            return task;
        }

        let plan = Arc::new(RequestPlan::new(request));
        let policy = *plan.request.cache_policy();

        if policy.reads_memory() {
            if let Some(image) = self.context.memory_cache.get(&plan.keys.full_result_key()) {
                debug!(task = %task.id(), locator = %task.locator(), "Memory cache hit");
                self.deliver(&task, Ok(ImageResponse::new(image, Some(CacheType::Memory))));
                return task;
            }
        }

        let (tx, rx) = oneshot::channel();
        let mut subscription = Subscription::new(task.id(), task.priority(), tx).with_commit(
            CommitPolicy {
                memory: policy.writes_memory(),
                disk: policy.writes_disk(),
            },
        );
        if let Some(sink) = task.progress_sink() {
            subscription = subscription.with_progress(sink);
        }

        let target = self.attach_image(&plan, plan.keys.depth(), subscription, true);
        if self.invalidated.load(Ordering::Acquire) {
            // Invalidated while attaching: its sweep may have missed this unit
            target.detach(task.id());
            self.deliver(&task, Err(PipelineError::Shutdown));
            return task;
        }
        task.attach(target);
        debug!(
            task = %task.id(),
            locator = %task.locator(),
            steps = plan.keys.depth(),
            priority = %task.priority(),
            "Task submitted"
        );

        let waiter = task.clone();
        self.runtime.spawn(async move {
            let result = match rx.await {
                Ok(result) => {
                    result.map(|output| ImageResponse::new(output.image, output.cache_type))
                }
                Err(_) => Err(PipelineError::Shutdown),
            };
            waiter.finish(result);
        });

        task
    }

    /// Completes a task from a runtime thread.
    fn deliver(&self, task: &ImageTask, result: TaskResult) {
        let task = task.clone();
        self.runtime.spawn(async move { task.finish(result) });
    }

    /// Attaches `subscription` to the unit producing prefix `depth`.
    ///
    /// `terminal` marks the unit as the final stage of the subscriber's
    /// request, which only matters if this call creates it.
    fn attach_image(
        self: &Arc<Self>,
        plan: &Arc<RequestPlan>,
        depth: usize,
        subscription: Subscription<StageImage>,
        terminal: bool,
    ) -> Arc<dyn Dependency> {
        match plan.keys.processing_key(depth) {
            Some(key) => {
                let outcome = self.processes.get_or_create(key, subscription, || {
                    WorkUnit::new(
                        StageKind::Process,
                        key.result_key().to_string(),
                        Arc::clone(&self.process_scheduler),
                    )
                });
                if let Coalesced::Created(unit) = &outcome {
                    self.start_process(Arc::clone(plan), Arc::clone(unit), depth, terminal);
                }
                outcome.into_unit()
            }
            None => {
                let key = &plan.keys.load;
                let outcome = self.decodes.get_or_create(key, subscription, || {
                    WorkUnit::new(
                        StageKind::Decode,
                        key.result_key().to_string(),
                        Arc::clone(&self.decode_scheduler),
                    )
                });
                if let Coalesced::Created(unit) = &outcome {
                    self.start_decode(Arc::clone(plan), Arc::clone(unit), terminal);
                }
                outcome.into_unit()
            }
        }
    }

    fn attach_fetch(
        self: &Arc<Self>,
        plan: &Arc<RequestPlan>,
        subscription: Subscription<Bytes>,
    ) -> Arc<dyn Dependency> {
        let key = &plan.keys.data;
        let outcome = self.fetches.get_or_create(key, subscription, || {
            WorkUnit::new(
                StageKind::Fetch,
                key.locator.to_string(),
                Arc::clone(&self.fetch_scheduler),
            )
        });
        if let Coalesced::Created(unit) = &outcome {
            self.start_fetch(Arc::clone(plan), Arc::clone(unit));
        }
        outcome.into_unit()
    }

    fn start_fetch(self: &Arc<Self>, plan: Arc<RequestPlan>, unit: Arc<WorkUnit<Bytes>>) {
        let pipeline = Arc::clone(self);
        let driver = Arc::clone(&unit);
        unit.spawn(&self.runtime, async move { pipeline.run_fetch(plan, driver).await });
    }

    fn start_decode(
        self: &Arc<Self>,
        plan: Arc<RequestPlan>,
        unit: Arc<WorkUnit<StageImage>>,
        terminal: bool,
    ) {
        let pipeline = Arc::clone(self);
        let driver = Arc::clone(&unit);
        unit.spawn(&self.runtime, async move {
            pipeline.run_decode(plan, driver, terminal).await
        });
    }

    fn start_process(
        self: &Arc<Self>,
        plan: Arc<RequestPlan>,
        unit: Arc<WorkUnit<StageImage>>,
        depth: usize,
        terminal: bool,
    ) {
        let pipeline = Arc::clone(self);
        let driver = Arc::clone(&unit);
        unit.spawn(&self.runtime, async move {
            pipeline.run_process(plan, driver, depth, terminal).await
        });
    }

    async fn run_fetch(
        self: Arc<Self>,
        plan: Arc<RequestPlan>,
        unit: Arc<WorkUnit<Bytes>>,
    ) -> StageResult<Bytes> {
        let _permit = unit.acquire_slot().await;
        if !unit.mark_running() {
            return Err(PipelineError::Cancelled);
        }
        fetch_stage(self.context.loader.as_ref(), &plan.keys.data, |progress| {
            unit.report_progress(progress)
        })
        .await
    }

    async fn run_decode(
        self: Arc<Self>,
        plan: Arc<RequestPlan>,
        unit: Arc<WorkUnit<StageImage>>,
        terminal: bool,
    ) -> StageResult<StageImage> {
        let hints = plan.keys.load.decoding;
        let result_key = plan.keys.load.result_key();

        if terminal && self.reads_disk(&plan) {
            if let Some(image) = self.writer.read_disk(&result_key, hints).await {
                let commit = memory_only(unit.commit_policy());
                self.writer.commit(&result_key, &image, None, commit).await;
                return Ok(StageImage::from_disk(image));
            }
        }

        let data = self.await_fetch(&plan, &unit).await?;

        let permit = unit.acquire_slot().await;
        if !unit.mark_running() {
            return Err(PipelineError::Cancelled);
        }
        let image = decode_stage(Arc::clone(&self.context.decoder), data.clone(), hints).await?;
        drop(permit);

        self.writer
            .commit(&result_key, &image, Some(data), unit.commit_policy())
            .await;
        Ok(StageImage::computed(image))
    }

    async fn run_process(
        self: Arc<Self>,
        plan: Arc<RequestPlan>,
        unit: Arc<WorkUnit<StageImage>>,
        depth: usize,
        terminal: bool,
    ) -> StageResult<StageImage> {
        let (Some(key), Some(processor)) = (
            plan.keys.processing_key(depth),
            plan.request.processors().get(depth.wrapping_sub(1)),
        ) else {
            return Err(PipelineError::Internal(format!(
                "no processing step at depth {}",
                depth
            )));
        };
        let result_key = key.result_key();
        let processor = Arc::clone(processor);

        if terminal && self.reads_disk(&plan) {
            if let Some(image) = self
                .writer
                .read_disk(&result_key, DecodingHints::default())
                .await
            {
                let commit = memory_only(unit.commit_policy());
                self.writer.commit(&result_key, &image, None, commit).await;
                return Ok(StageImage::from_disk(image));
            }
        }

        let input = self.await_prefix(&plan, &unit, depth - 1).await?;

        let permit = unit.acquire_slot().await;
        if !unit.mark_running() {
            return Err(PipelineError::Cancelled);
        }
        let output = process_stage(processor, input).await?;
        drop(permit);

        self.writer
            .commit(&result_key, &output, None, unit.commit_policy())
            .await;
        Ok(StageImage::computed(output))
    }

    fn reads_disk(&self, plan: &RequestPlan) -> bool {
        self.config.cache_lookup.disk_full_keys && plan.request.cache_policy().reads_disk()
    }

    /// Resolves the image for prefix `depth` on behalf of `unit`.
    ///
    /// Served from the memory cache when possible; otherwise `unit`
    /// subscribes to the upstream unit and waits for it.
    async fn await_prefix(
        self: &Arc<Self>,
        plan: &Arc<RequestPlan>,
        unit: &Arc<WorkUnit<StageImage>>,
        depth: usize,
    ) -> Result<ImageContainer, PipelineError> {
        if self.config.cache_lookup.memory_prefixes && plan.request.cache_policy().reads_memory() {
            if let Some(key) = plan.keys.result_key(depth) {
                if let Some(image) = self.context.memory_cache.get(&key) {
                    debug!(key = %key, "Memory cache hit for prefix");
                    return Ok(image);
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        let subscription =
            Subscription::new(unit.id(), unit.priority(), tx).with_progress(forward_progress(unit));
        let upstream = self.attach_image(plan, depth, subscription, false);
        unit.set_upstream(upstream);

        let output = rx.await.map_err(|_| PipelineError::Cancelled)??;
        Ok(output.image)
    }

    async fn await_fetch(
        self: &Arc<Self>,
        plan: &Arc<RequestPlan>,
        unit: &Arc<WorkUnit<StageImage>>,
    ) -> Result<Bytes, PipelineError> {
        let (tx, rx) = oneshot::channel();
        let subscription =
            Subscription::new(unit.id(), unit.priority(), tx).with_progress(forward_progress(unit));
        let upstream = self.attach_fetch(plan, subscription);
        unit.set_upstream(upstream);

        rx.await.map_err(|_| PipelineError::Cancelled)?
    }
}

/// Progress sink relaying upstream progress through `unit`.
fn forward_progress<T>(unit: &Arc<WorkUnit<T>>) -> ProgressSink
where
    T: Clone + Send + 'static,
{
    let unit = Arc::downgrade(unit);
    Arc::new(move |progress: Progress| {
        if let Some(unit) = unit.upgrade() {
            unit.report_progress(progress);
        }
    })
}

fn memory_only(policy: CommitPolicy) -> CommitPolicy {
    CommitPolicy {
        memory: policy.memory,
        disk: false,
    }
}
