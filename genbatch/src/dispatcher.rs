//! The batch dispatcher.
//!
//! A [`Dispatcher`] owns every job and batch. Jobs are decomposed into batches when they
//! start, batches wait in a single FIFO queue shared by all jobs and are admitted one at a time
//! under the [`ConcurrencyLimiter`] and the [`RateLimiter`]. Each admitted batch runs on its
//! own task and reports back to the dispatcher, which updates the job, retries or pauses it
//! according to the [`FailurePolicy`] and publishes a [`DispatcherEvent`] for every change.
//!
//! All state lives behind one lock that is never held across an `.await`, so the queue is
//! processed synchronously and can be triggered from anywhere: job transitions, batch
//! outcomes, expired timers and capacity notifications of the concurrency limiter.
use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use futures::future::try_join_all;
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::{
    collaborators::{CollaboratorError, Collaborators},
    concurrency::{ConcurrencyLimiter, ConcurrencySnapshot},
    events::{DispatcherEvent, EventSender, DEFAULT_EVENT_CAPACITY},
    job::{Batch, BatchError, BatchId, ExecutionMode, Job, JobEntry, JobId, JobState},
    model::{ModelConfig, ModelRegistry},
    notifier::CapacityAvailable,
    policy::{ErrorClass, FailurePolicy},
    rate_limit::{RateLimitSnapshot, RateLimiter},
};

mod runner;

pub use runner::{BatchOutput, ExecutionError};
use runner::{BatchRunner, BatchTask};

pub const DEFAULT_IMAGE_BYTE_BUDGET: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Cannot {action} job {job_id} while it is {from}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        action: &'static str,
    },
    #[error("Invalid job entry: {0}")]
    InvalidEntry(String),
    #[error("Failed to resolve the references of job {job_id}: {source}")]
    ReferenceResolution {
        job_id: JobId,
        #[source]
        source: CollaboratorError,
    },
}

/// Settings merged into the dispatcher by [`Dispatcher::configure`].
///
/// Unset fields leave the current value alone. Models are merged into the registry rather than
/// replacing it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherOptions {
    pub failure_policy: Option<FailurePolicy>,
    pub models: Option<ModelRegistry>,
    /// Root of the output directories, batches write to `output_root/output_subdir`.
    pub output_root: Option<PathBuf>,
    /// Directory reference patterns are resolved against.
    pub reference_root: Option<PathBuf>,
    /// Byte budget of each compressed reference image.
    pub image_byte_budget: Option<usize>,
}

impl DispatcherOptions {
    pub fn with_failure_policy(self, failure_policy: FailurePolicy) -> Self {
        Self {
            failure_policy: Some(failure_policy),
            ..self
        }
    }

    pub fn with_models(self, models: ModelRegistry) -> Self {
        Self {
            models: Some(models),
            ..self
        }
    }

    pub fn with_model(mut self, id: impl Into<String>, config: ModelConfig) -> Self {
        self.models
            .get_or_insert_with(Default::default)
            .insert(id, config);
        self
    }

    pub fn with_output_root(self, output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: Some(output_root.into()),
            ..self
        }
    }

    pub fn with_reference_root(self, reference_root: impl Into<PathBuf>) -> Self {
        Self {
            reference_root: Some(reference_root.into()),
            ..self
        }
    }

    pub fn with_image_byte_budget(self, image_byte_budget: usize) -> Self {
        Self {
            image_byte_budget: Some(image_byte_budget),
            ..self
        }
    }
}

#[derive(Debug, Clone)]
struct Settings {
    failure_policy: FailurePolicy,
    models: ModelRegistry,
    output_root: PathBuf,
    reference_root: PathBuf,
    image_byte_budget: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            failure_policy: Default::default(),
            models: Default::default(),
            output_root: PathBuf::from("output"),
            reference_root: PathBuf::from("."),
            image_byte_budget: DEFAULT_IMAGE_BYTE_BUDGET,
        }
    }
}

impl Settings {
    fn apply(&mut self, options: DispatcherOptions) {
        if let Some(failure_policy) = options.failure_policy {
            self.failure_policy = failure_policy;
        }
        if let Some(models) = options.models {
            self.models.merge(models);
        }
        if let Some(output_root) = options.output_root {
            self.output_root = output_root;
        }
        if let Some(reference_root) = options.reference_root {
            self.reference_root = reference_root;
        }
        if let Some(image_byte_budget) = options.image_byte_budget {
            self.image_byte_budget = image_byte_budget;
        }
    }
}

/// Point in time view of a [`Dispatcher`].
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherSnapshot {
    pub running: bool,
    pub paused: bool,
    /// A graceful stop is waiting for batches in flight.
    pub stopping: bool,
    pub queue_length: usize,
    pub in_flight: usize,
    pub active_jobs: usize,
    pub rate_limit: RateLimitSnapshot,
    pub concurrency: ConcurrencySnapshot,
}

#[derive(Debug, Default)]
struct State {
    running: bool,
    paused: bool,
    stopping: bool,
    cancel_requested: bool,
    rate_limit_wake_pending: bool,
    /// Cancelled by a force stop, every timer of the dispatcher watches it.
    cancellation: CancellationToken,
    settings: Settings,
    jobs: FxHashMap<JobId, Job>,
    queue: VecDeque<Batch>,
    in_flight: FxHashMap<BatchId, Batch>,
    awaiting_retry: FxHashMap<BatchId, Batch>,
    /// Batches of paused jobs, put back in the queue when their job resumes.
    parked: Vec<Batch>,
}

impl State {
    fn can_admit(&self) -> bool {
        self.running && !self.paused && !self.cancel_requested
    }

    fn job_mut(&mut self, job_id: JobId) -> Result<&mut Job, DispatcherError> {
        self.jobs
            .get_mut(&job_id)
            .ok_or(DispatcherError::JobNotFound(job_id))
    }

    fn job(&self, job_id: JobId) -> Result<Job, DispatcherError> {
        self.jobs
            .get(&job_id)
            .cloned()
            .ok_or(DispatcherError::JobNotFound(job_id))
    }

    /// Queued, in flight, awaiting retry and parked batches of the job.
    fn outstanding(&self, job_id: JobId) -> usize {
        let of_job = |batch: &&Batch| batch.job_id == job_id;
        self.queue.iter().filter(of_job).count()
            + self.in_flight.values().filter(of_job).count()
            + self.awaiting_retry.values().filter(of_job).count()
            + self.parked.iter().filter(of_job).count()
    }

    /// Forgets every batch of the job that is not in flight.
    fn drop_pending(&mut self, job_id: JobId) -> usize {
        let before = self.queue.len() + self.awaiting_retry.len() + self.parked.len();
        self.queue.retain(|batch| batch.job_id != job_id);
        self.awaiting_retry.retain(|_, batch| batch.job_id != job_id);
        self.parked.retain(|batch| batch.job_id != job_id);
        before - (self.queue.len() + self.awaiting_retry.len() + self.parked.len())
    }

    /// Creates `count` batches for the job, queued if it runs and parked if it is paused.
    fn add_batches(&mut self, job_id: JobId, count: u32, ids: &AtomicU64) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        let park = job.state == JobState::Paused;
        let batches = (0..count).map(|_| {
            let batch_id = BatchId::from(ids.fetch_add(1, Ordering::Relaxed));
            Batch::new(batch_id, job_id, job.take_batch_index(), job.entry.model.clone())
        });
        if park {
            self.parked.extend(batches);
        } else {
            self.queue.extend(batches);
        }
    }

    /// Moves the parked batches of the job to the tail of the queue, keeping their order.
    fn unpark(&mut self, job_id: JobId) -> usize {
        let (resumed, parked): (Vec<_>, Vec<_>) = std::mem::take(&mut self.parked)
            .into_iter()
            .partition(|batch| batch.job_id == job_id);
        self.parked = parked;
        let count = resumed.len();
        self.queue.extend(resumed);
        count
    }

    /// Adds the batches the job lacks to cover its live target, see [`Job::missing_batches`].
    ///
    /// Jobs still resolving their references are left alone, `start_job` queues their batches.
    fn top_up(&mut self, job_id: JobId, ids: &AtomicU64) -> u32 {
        let Some(job) = self
            .jobs
            .get(&job_id)
            .filter(|job| job.resolved_references.is_some())
        else {
            return 0;
        };
        let outstanding = u32::try_from(self.outstanding(job_id)).unwrap_or(u32::MAX);
        let missing = job.missing_batches(outstanding);
        if missing > 0 {
            self.add_batches(job_id, missing, ids);
        }
        missing
    }

    fn batch_task(&self, batch: &Batch) -> Option<BatchTask> {
        let job = self.jobs.get(&batch.job_id)?;
        let settings = &self.settings;
        let output_dir = match &job.entry.output_subdir {
            Some(subdir) => settings.output_root.join(subdir),
            None => settings.output_root.clone(),
        };
        Some(BatchTask {
            batch_id: batch.id,
            job_id: job.id,
            index: batch.index,
            images_per_batch: job.entry.images_per_batch,
            prompt: job.entry.prompt.clone(),
            model_id: batch.model.clone(),
            model: settings.models.get(&batch.model).cloned(),
            references: job.resolved_references.clone().unwrap_or_default(),
            byte_budget: settings.image_byte_budget,
            output_dir,
            filename_prefix: job.entry.filename_prefix.clone(),
        })
    }
}

struct Inner {
    state: Mutex<State>,
    concurrency: Arc<ConcurrencyLimiter>,
    rate_limiter: Arc<RateLimiter>,
    collaborators: Collaborators,
    runner: BatchRunner,
    events: EventSender,
    event_receiver: Mutex<Option<mpsc::Receiver<DispatcherEvent>>>,
    capacity: Mutex<Option<mpsc::UnboundedReceiver<CapacityAvailable>>>,
    /// Fired whenever the in-flight set becomes empty.
    drained: Notify,
    shutdown: CancellationToken,
    next_job_id: AtomicU64,
    next_batch_id: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Schedules the batches of generation jobs.
///
/// Cloning is cheap, every clone drives the same queue. Operations that may admit batches
/// spawn tasks and must be called from within a tokio runtime.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("collaborators", &self.inner.collaborators)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn validate(entry: &JobEntry) -> Result<(), DispatcherError> {
    if entry.images_per_batch == 0 {
        return Err(DispatcherError::InvalidEntry(
            "images_per_batch must be at least 1".to_owned(),
        ));
    }
    match entry.mode {
        ExecutionMode::Fixed { batch_count: 0 } => Err(DispatcherError::InvalidEntry(
            "batch_count must be at least 1".to_owned(),
        )),
        ExecutionMode::Target { target_images: 0 } => Err(DispatcherError::InvalidEntry(
            "target_images must be at least 1".to_owned(),
        )),
        _ => Ok(()),
    }
}

impl Dispatcher {
    pub fn new(
        concurrency: Arc<ConcurrencyLimiter>,
        rate_limiter: Arc<RateLimiter>,
        collaborators: Collaborators,
    ) -> Self {
        Self::with_event_capacity(
            concurrency,
            rate_limiter,
            collaborators,
            DEFAULT_EVENT_CAPACITY,
        )
    }

    /// Like [`Dispatcher::new`] with a custom bound on the event channel.
    pub fn with_event_capacity(
        concurrency: Arc<ConcurrencyLimiter>,
        rate_limiter: Arc<RateLimiter>,
        collaborators: Collaborators,
        event_capacity: usize,
    ) -> Self {
        let (events, event_receiver) = EventSender::channel(event_capacity);
        let capacity = concurrency.subscribe();
        Self {
            inner: Arc::new(Inner {
                state: Default::default(),
                runner: BatchRunner::new(collaborators.clone()),
                concurrency,
                rate_limiter,
                collaborators,
                events,
                event_receiver: Mutex::new(Some(event_receiver)),
                capacity: Mutex::new(Some(capacity)),
                drained: Notify::new(),
                shutdown: CancellationToken::new(),
                next_job_id: AtomicU64::new(1),
                next_batch_id: AtomicU64::new(1),
            }),
        }
    }

    /// The receiving end of the event channel. Only the first call returns it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<DispatcherEvent>> {
        lock(&self.inner.event_receiver).take()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.inner.state)
    }

    fn emit(&self, event: DispatcherEvent) {
        self.inner.events.emit(event);
    }

    /// Merges `options` into the current settings. Batches already running are not affected.
    pub fn configure(&self, options: DispatcherOptions) {
        let mut state = self.state();
        state.settings.apply(options);
        tracing::debug!(settings = ?state.settings, "Dispatcher configured");
    }

    /// Registers a job. Nothing is queued until [`Dispatcher::start_job`].
    pub fn create_job(&self, entry: JobEntry) -> Result<Job, DispatcherError> {
        validate(&entry)?;
        let job_id = JobId::from(self.inner.next_job_id.fetch_add(1, Ordering::Relaxed));
        let job = Job::new(job_id, entry);
        tracing::debug!(
            %job_id,
            entry_id = %job.entry.entry_id,
            expected_batches = job.stats.expected_batches,
            "Created job {job_id}"
        );
        self.state().jobs.insert(job_id, job.clone());
        self.emit(DispatcherEvent::JobCreated { job: job.clone() });
        Ok(job)
    }

    /// Starts a queued job: resolves its references and queues its batches.
    ///
    /// When the references cannot be resolved the job fails and the error is returned.
    pub async fn start_job(&self, job_id: JobId) -> Result<Job, DispatcherError> {
        let (patterns, reference_root, cached) = {
            let mut state = self.state();
            let reference_root = state.settings.reference_root.clone();
            let job = state.job_mut(job_id)?;
            if job.state != JobState::Queued {
                return Err(DispatcherError::InvalidTransition {
                    job_id,
                    from: job.state,
                    action: "start",
                });
            }
            job.mark_running();
            tracing::debug!(%job_id, "Starting job {job_id}");
            let started = (
                job.entry.references.clone(),
                reference_root,
                job.resolved_references.clone(),
            );
            self.emit(DispatcherEvent::JobStarted { job: job.clone() });
            started
        };

        let references = match cached {
            Some(references) => Ok(references),
            None => self.resolve_references(&patterns, &reference_root).await,
        };

        let job = {
            let mut state = self.state();
            let job = state.job_mut(job_id)?;
            match references {
                Ok(references) => job.resolved_references = Some(references),
                Err(source) => {
                    if job.state.is_active() {
                        let error = BatchError {
                            details: source.details.clone(),
                            ..BatchError::new(format!("Failed to resolve references: {source}"), 0)
                        };
                        tracing::error!(%job_id, ?source, "Job {job_id} failed to start: {source}");
                        job.last_error = Some(error.clone());
                        job.mark_finished(JobState::Failed);
                        self.emit(DispatcherEvent::JobFailed {
                            job: job.clone(),
                            error,
                        });
                    }
                    return Err(DispatcherError::ReferenceResolution { job_id, source });
                }
            }
            if job.state.is_terminal() {
                return Ok(job.clone());
            }
            let count = job.initial_batch_count();
            state.add_batches(job_id, count, &self.inner.next_batch_id);
            tracing::debug!(%job_id, count, "Queued {count} batches for job {job_id}");
            state.job(job_id)?
        };
        self.process_queue();
        Ok(job)
    }

    async fn resolve_references(
        &self,
        patterns: &[String],
        base_dir: &Path,
    ) -> Result<Arc<Vec<PathBuf>>, CollaboratorError> {
        let resolver = &self.inner.collaborators.resolver;
        let resolved = try_join_all(
            patterns
                .iter()
                .map(|pattern| resolver.resolve_pattern(pattern, base_dir)),
        )
        .await?;
        Ok(Arc::new(resolved.into_iter().flatten().collect()))
    }

    /// Pauses a running job. Its queued batches are set aside as the queue reaches them.
    pub fn pause_job(&self, job_id: JobId) -> Result<Job, DispatcherError> {
        let mut state = self.state();
        let job = state.job_mut(job_id)?;
        if job.state != JobState::Running {
            return Err(DispatcherError::InvalidTransition {
                job_id,
                from: job.state,
                action: "pause",
            });
        }
        job.mark_paused(None);
        tracing::debug!(%job_id, "Paused job {job_id}");
        let job = job.clone();
        self.emit(DispatcherEvent::JobPaused { job: job.clone() });
        Ok(job)
    }

    /// Resumes a paused job, whether it was paused by the user or by the failure policy.
    pub fn resume_job(&self, job_id: JobId) -> Result<Job, DispatcherError> {
        let job = {
            let mut state = self.state();
            let job = state.job_mut(job_id)?;
            if job.state != JobState::Paused {
                return Err(DispatcherError::InvalidTransition {
                    job_id,
                    from: job.state,
                    action: "resume",
                });
            }
            job.mark_resumed();
            let requeued = state.unpark(job_id);
            let added = state.top_up(job_id, &self.inner.next_batch_id);
            tracing::debug!(%job_id, requeued, added, "Resumed job {job_id}");
            self.emit(DispatcherEvent::JobResumed {
                job: state.job(job_id)?,
            });
            self.settle_if_idle(&mut state, job_id);
            state.job(job_id)?
        };
        self.process_queue();
        Ok(job)
    }

    /// Cancels an unfinished job. Batches in flight run to completion but their outcome is
    /// discarded.
    pub fn cancel_job(&self, job_id: JobId) -> Result<Job, DispatcherError> {
        let mut state = self.state();
        let job = state.job_mut(job_id)?;
        if job.state.is_terminal() {
            return Err(DispatcherError::InvalidTransition {
                job_id,
                from: job.state,
                action: "cancel",
            });
        }
        job.mark_finished(JobState::Cancelled);
        let job = job.clone();
        let dropped = state.drop_pending(job_id);
        tracing::debug!(%job_id, dropped, "Cancelled job {job_id}");
        self.emit(DispatcherEvent::JobCancelled { job: job.clone() });
        Ok(job)
    }

    /// Changes the number of images a running or paused job aims for.
    ///
    /// Queued batches are left alone and a lower target completes the job early. A higher one
    /// adds batches right away to a running job and when a paused job resumes.
    pub fn update_job_target(
        &self,
        job_id: JobId,
        target_images: u32,
    ) -> Result<Job, DispatcherError> {
        if target_images == 0 {
            return Err(DispatcherError::InvalidEntry(
                "target_images must be at least 1".to_owned(),
            ));
        }
        let job = {
            let mut state = self.state();
            let job = state.job_mut(job_id)?;
            if !matches!(job.state, JobState::Running | JobState::Paused) {
                return Err(DispatcherError::InvalidTransition {
                    job_id,
                    from: job.state,
                    action: "update the target of",
                });
            }
            job.update_target(target_images);
            tracing::debug!(
                %job_id,
                target_images,
                expected_batches = job.stats.expected_batches,
                "Updated target of job {job_id}"
            );
            self.emit(DispatcherEvent::JobTargetUpdated { job: job.clone() });
            self.check_completion(&mut state, job_id);
            if state.job(job_id)?.state == JobState::Running {
                let added = state.top_up(job_id, &self.inner.next_batch_id);
                tracing::debug!(%job_id, added, "Topped up job {job_id}");
            }
            state.job(job_id)?
        };
        self.process_queue();
        Ok(job)
    }

    pub fn get_job(&self, job_id: JobId) -> Option<Job> {
        self.state().jobs.get(&job_id).cloned()
    }

    /// Queued, running and paused jobs, oldest first.
    pub fn get_active_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<_> = self
            .state()
            .jobs
            .values()
            .filter(|job| job.state.is_active())
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    /// The batches waiting in the queue, in admission order.
    pub fn get_queued_batches(&self) -> Vec<Batch> {
        self.state().queue.iter().cloned().collect()
    }

    pub fn get_state(&self) -> DispatcherSnapshot {
        let state = self.state();
        DispatcherSnapshot {
            running: state.running,
            paused: state.paused,
            stopping: state.stopping,
            queue_length: state.queue.len(),
            in_flight: state.in_flight.len(),
            active_jobs: state.jobs.values().filter(|job| job.state.is_active()).count(),
            rate_limit: self.inner.rate_limiter.snapshot(),
            concurrency: self.inner.concurrency.snapshot(),
        }
    }

    /// Starts admitting batches. Must be called from within a tokio runtime.
    pub fn start(&self) {
        {
            let mut state = self.state();
            if state.running {
                return;
            }
            state.running = true;
            state.paused = false;
            state.cancel_requested = false;
            if state.cancellation.is_cancelled() {
                state.cancellation = CancellationToken::new();
            }
            tracing::info!(queue_length = state.queue.len(), "Dispatcher started");
            self.emit(DispatcherEvent::Started);
        }
        self.spawn_capacity_listener();
        self.process_queue();
    }

    /// Stops admitting batches and waits for the batches in flight to finish.
    pub async fn stop(&self) {
        {
            let mut state = self.state();
            if !state.running {
                return;
            }
            state.running = false;
            state.stopping = true;
            tracing::info!(
                in_flight = state.in_flight.len(),
                "Stopping dispatcher, waiting for batches in flight"
            );
            self.emit(DispatcherEvent::Stopping);
        }
        loop {
            let drained = self.inner.drained.notified();
            let idle = self.state().in_flight.is_empty();
            if idle {
                break;
            }
            drained.await;
        }
        self.state().stopping = false;
        tracing::info!("Dispatcher stopped");
        self.emit(DispatcherEvent::Stopped);
    }

    /// Stops immediately, dropping the queue, the batches in flight and pending retries.
    ///
    /// Batches still running finish in the background, their outcome is discarded but their
    /// concurrency slot is given back. Nothing is admitted until [`Dispatcher::start`].
    ///
    /// Running jobs are paused, [`Dispatcher::resume_job`] replaces the batches they lost.
    pub fn force_stop(&self) {
        let mut state = self.state();
        state.cancellation.cancel();
        let dropped = state.queue.len() + state.awaiting_retry.len() + state.parked.len();
        let abandoned = state.in_flight.len();
        state.queue.clear();
        state.in_flight.clear();
        state.awaiting_retry.clear();
        state.parked.clear();
        state.running = false;
        state.paused = false;
        state.stopping = false;
        state.cancel_requested = true;
        state.rate_limit_wake_pending = false;
        tracing::warn!(dropped, abandoned, "Dispatcher force stopped");
        self.inner.drained.notify_waiters();
        self.emit(DispatcherEvent::ForceStopped);
        for job in state
            .jobs
            .values_mut()
            .filter(|job| job.state == JobState::Running)
        {
            job.mark_paused(None);
            job.pause_reason = Some("Dispatcher force stopped".to_owned());
            tracing::debug!(job_id = %job.id, "Paused job {} after force stop", job.id);
            self.emit(DispatcherEvent::JobPaused { job: job.clone() });
        }
    }

    /// Holds every admission until [`Dispatcher::resume`], batches in flight carry on.
    pub fn pause(&self) {
        let mut state = self.state();
        if !state.paused {
            state.paused = true;
            tracing::debug!("Dispatcher paused");
            self.emit(DispatcherEvent::Paused);
        }
    }

    pub fn resume(&self) {
        {
            let mut state = self.state();
            if !state.paused {
                return;
            }
            state.paused = false;
            tracing::debug!("Dispatcher resumed");
            self.emit(DispatcherEvent::Resumed);
        }
        self.process_queue();
    }

    fn spawn_capacity_listener(&self) {
        let Some(mut capacity) = lock(&self.inner.capacity).take() else {
            return;
        };
        let dispatcher = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = capacity.recv() => {
                        let (Some(_), Some(inner)) = (message, dispatcher.upgrade()) else {
                            break;
                        };
                        Dispatcher { inner }.process_queue();
                    }
                }
            }
            tracing::debug!("Capacity listener shut down");
        });
    }

    /// Admits batches from the head of the queue until a gate closes.
    fn process_queue(&self) {
        let mut state = self.state();
        while state.can_admit() {
            let Some(head) = state.queue.front() else {
                break;
            };
            let job_id = head.job_id;
            match state.jobs.get(&job_id).map(|job| job.state) {
                Some(JobState::Running) => {}
                Some(JobState::Paused) => {
                    if let Some(batch) = state.queue.pop_front() {
                        tracing::trace!(%job_id, batch_id = %batch.id, "Parking batch of paused job {job_id}");
                        state.parked.push(batch);
                    }
                    continue;
                }
                _ => {
                    if let Some(batch) = state.queue.pop_front() {
                        tracing::debug!(%job_id, batch_id = %batch.id, "Dropping batch of inactive job {job_id}");
                    }
                    continue;
                }
            }
            if !self.inner.concurrency.can_start() {
                tracing::trace!("No concurrency slot available");
                break;
            }
            if !self.inner.rate_limiter.can_make_call() {
                let wait = self.inner.rate_limiter.next_available_in();
                self.schedule_rate_limit_wake(&mut state, wait);
                break;
            }
            let Some(mut batch) = state.queue.pop_front() else {
                break;
            };
            let Some(task) = state.batch_task(&batch) else {
                continue;
            };
            self.inner.rate_limiter.record_call();
            self.inner.concurrency.acquire();
            batch.mark_in_flight();
            let batch_id = batch.id;
            tracing::debug!(%job_id, %batch_id, index = batch.index, "Dispatching batch {batch_id}");
            self.emit(DispatcherEvent::BatchStarted {
                job_id,
                batch: batch.clone(),
            });
            state.in_flight.insert(batch_id, batch);
            let dispatcher = self.clone();
            tokio::spawn(async move { dispatcher.run_batch(task).await });
        }
    }

    async fn run_batch(self, task: BatchTask) {
        let batch_id = task.batch_id;
        let result = self.inner.runner.run(task).await;
        self.inner.concurrency.release();
        self.handle_outcome(batch_id, result);
    }

    fn handle_outcome(&self, batch_id: BatchId, result: Result<BatchOutput, ExecutionError>) {
        {
            let mut state = self.state();
            match state.in_flight.remove(&batch_id) {
                None => tracing::debug!(
                    %batch_id,
                    "Discarding outcome of batch {batch_id}, it is no longer tracked"
                ),
                Some(batch) => match result {
                    Ok(output) => self.handle_batch_complete(&mut state, batch, output),
                    Err(error) => self.handle_batch_error(&mut state, batch, error),
                },
            }
            if state.in_flight.is_empty() {
                self.inner.drained.notify_waiters();
            }
        }
        self.process_queue();
    }

    fn handle_batch_complete(&self, state: &mut State, mut batch: Batch, output: BatchOutput) {
        let (job_id, batch_id) = (batch.job_id, batch.id);
        let Some(job) = state
            .jobs
            .get_mut(&job_id)
            .filter(|job| job.state.is_active())
        else {
            tracing::debug!(%job_id, %batch_id, "Discarding result of batch {batch_id}, job {job_id} is no longer active");
            return;
        };
        batch.mark_completed(output);
        job.record_success(batch.image_count);
        tracing::debug!(
            %job_id,
            %batch_id,
            images = batch.image_count,
            "Batch {batch_id} complete"
        );
        self.emit(DispatcherEvent::BatchCompleted {
            job: job.clone(),
            batch,
        });
        self.check_completion(state, job_id);
        self.replenish(state, job_id);
    }

    fn handle_batch_error(&self, state: &mut State, mut batch: Batch, error: ExecutionError) {
        let (job_id, batch_id) = (batch.job_id, batch.id);
        let policy = state.settings.failure_policy.clone();
        let Some(job) = state
            .jobs
            .get_mut(&job_id)
            .filter(|job| job.state.is_active())
        else {
            tracing::debug!(%job_id, %batch_id, ?error, "Discarding failure of batch {batch_id}, job {job_id} is no longer active");
            return;
        };
        let batch_error = error.to_batch_error(batch.index);
        batch.mark_failed(batch_error.clone());
        job.record_failure(batch_error.clone());
        let consecutive_failures = job.consecutive_failures;
        self.emit(DispatcherEvent::BatchFailed {
            job: job.clone(),
            batch: batch.clone(),
            error: batch_error.clone(),
        });

        if job.state == JobState::Running && policy.should_auto_pause(consecutive_failures) {
            let reason = format!(
                "Paused after {consecutive_failures} consecutive failures, last error: {batch_error}"
            );
            tracing::warn!(%job_id, "Job {job_id} paused automatically: {reason}");
            job.mark_paused(Some(reason.clone()));
            self.emit(DispatcherEvent::JobAutoPaused {
                job: job.clone(),
                reason,
            });
        }

        let retry_policy = &policy.retry_policy;
        if policy.classify(&error) == ErrorClass::Retryable
            && batch.retries < retry_policy.max_retries
        {
            let delay = retry_policy.delay(consecutive_failures);
            tracing::warn!(
                %job_id,
                %batch_id,
                ?error,
                "Batch {batch_id} failed and will be retried in {delay:?}: {error}"
            );
            let cancellation = state.cancellation.clone();
            state.awaiting_retry.insert(batch_id, batch);
            self.schedule_retry(cancellation, batch_id, delay);
        } else {
            tracing::error!(
                %job_id,
                %batch_id,
                ?error,
                "Batch {batch_id} failed and will not be retried: {error}"
            );
            job.record_given_up();
            self.settle_if_idle(state, job_id);
        }
    }

    fn schedule_retry(&self, cancellation: CancellationToken, batch_id: BatchId, delay: Duration) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancellation.cancelled() => {}
                _ = tokio::time::sleep(delay) => dispatcher.requeue(batch_id),
            }
        });
    }

    fn requeue(&self, batch_id: BatchId) {
        {
            let mut state = self.state();
            let Some(mut batch) = state.awaiting_retry.remove(&batch_id) else {
                return;
            };
            let job_id = batch.job_id;
            match state.jobs.get(&job_id).map(|job| job.state) {
                Some(JobState::Running) => {
                    batch.mark_requeued();
                    tracing::debug!(%job_id, %batch_id, retries = batch.retries, "Batch {batch_id} back in the queue");
                    state.queue.push_back(batch);
                }
                Some(JobState::Paused) => {
                    batch.mark_requeued();
                    tracing::debug!(%job_id, %batch_id, "Parking retry of batch {batch_id}, job {job_id} is paused");
                    state.parked.push(batch);
                }
                _ => {
                    tracing::debug!(%job_id, %batch_id, "Dropping retry of batch {batch_id}, job {job_id} is no longer active");
                }
            }
        }
        self.process_queue();
    }

    fn schedule_rate_limit_wake(&self, state: &mut State, wait: Duration) {
        if state.rate_limit_wake_pending {
            return;
        }
        state.rate_limit_wake_pending = true;
        tracing::debug!(?wait, "Rate limited, next call allowed in {wait:?}");
        self.emit(DispatcherEvent::RateLimited { wait });
        let dispatcher = self.clone();
        let cancellation = state.cancellation.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancellation.cancelled() => {}
                _ = tokio::time::sleep(wait) => {
                    dispatcher.state().rate_limit_wake_pending = false;
                    dispatcher.process_queue();
                }
            }
        });
    }

    /// Completes the job once it produced its target number of images or ran its expected
    /// number of batches.
    fn check_completion(&self, state: &mut State, job_id: JobId) {
        let Some(job) = state
            .jobs
            .get_mut(&job_id)
            .filter(|job| job.state.is_active())
        else {
            return;
        };
        if !job.has_reached_target() {
            return;
        }
        job.mark_finished(JobState::Completed);
        let job = job.clone();
        let dropped = state.drop_pending(job_id);
        tracing::info!(
            %job_id,
            dropped,
            total_images = job.stats.total_images,
            "Job {job_id} complete"
        );
        self.emit(DispatcherEvent::JobCompleted { job });
    }

    /// Tops up a running job left with nothing to run, or settles it when it lacks nothing.
    fn replenish(&self, state: &mut State, job_id: JobId) {
        let running = state
            .jobs
            .get(&job_id)
            .is_some_and(|job| job.state == JobState::Running);
        if !running || state.outstanding(job_id) > 0 {
            return;
        }
        let added = state.top_up(job_id, &self.inner.next_batch_id);
        if added > 0 {
            tracing::debug!(%job_id, added, "Topped up job {job_id}");
        } else {
            self.settle_if_idle(state, job_id);
        }
    }

    /// Finishes a running job that has no batch left to run.
    ///
    /// It fails only when a batch failed and the job did not reach its target.
    fn settle_if_idle(&self, state: &mut State, job_id: JobId) {
        if state.outstanding(job_id) > 0 {
            return;
        }
        let Some(job) = state
            .jobs
            .get_mut(&job_id)
            .filter(|job| job.state == JobState::Running && job.resolved_references.is_some())
        else {
            return;
        };
        if job.stats.failed_batches == 0
            || (job.stats.successful_batches > 0 && job.has_reached_target())
        {
            job.mark_finished(JobState::Completed);
            tracing::info!(%job_id, "Job {job_id} complete");
            self.emit(DispatcherEvent::JobCompleted { job: job.clone() });
            return;
        }
        let error = job
            .last_error
            .clone()
            .unwrap_or_else(|| BatchError::new("No batch left to run", 0));
        job.mark_finished(JobState::Failed);
        tracing::error!(%job_id, %error, "Job {job_id} failed, no batch left to run");
        self.emit(DispatcherEvent::JobFailed {
            job: job.clone(),
            error,
        });
    }
}
