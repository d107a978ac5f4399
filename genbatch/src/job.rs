use std::{fmt::Display, path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod batch;
pub mod entry;

pub use batch::{Batch, BatchError, BatchId, BatchState};
pub use entry::{ExecutionMode, JobEntry, PromptConfig};

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(u64);

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<JobId> for u64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Queued, running and paused jobs are active.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(state)
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    /// Every attempt, retries included.
    pub total_batches: u32,
    pub successful_batches: u32,
    pub failed_batches: u32,
    pub total_images: u32,
    pub expected_batches: u32,
    pub expected_images: u32,
}

/// Settings that may change while the job runs.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct LiveConfig {
    pub target_images: u32,
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub entry: JobEntry,
    pub state: JobState,
    pub stats: JobStats,
    pub consecutive_failures: u32,
    pub last_error: Option<BatchError>,
    pub auto_paused: bool,
    pub pause_reason: Option<String>,
    pub live_config: LiveConfig,
    /// Reference images resolved on the first start of the job.
    pub resolved_references: Option<Arc<Vec<PathBuf>>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub(crate) next_batch_index: u32,
    /// Batches that will not run again: successes and failures that were not retried.
    #[serde(skip)]
    pub(crate) settled_batches: u32,
}

impl Job {
    pub(crate) fn new(id: JobId, entry: JobEntry) -> Self {
        let images_per_batch = entry.images_per_batch;
        let (expected_batches, target_images) = match entry.mode {
            ExecutionMode::Fixed { batch_count } => {
                (batch_count, batch_count.saturating_mul(images_per_batch))
            }
            ExecutionMode::Target { target_images } => {
                (batches_for(target_images, images_per_batch), target_images)
            }
        };
        Self {
            id,
            entry,
            state: JobState::Queued,
            stats: JobStats {
                expected_batches,
                expected_images: expected_batches.saturating_mul(images_per_batch),
                ..Default::default()
            },
            consecutive_failures: 0,
            last_error: None,
            auto_paused: false,
            pause_reason: None,
            live_config: LiveConfig {
                target_images,
                paused: false,
            },
            resolved_references: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            next_batch_index: 0,
            settled_batches: 0,
        }
    }

    /// Hands out the index of the next batch created for this job.
    pub(crate) fn take_batch_index(&mut self) -> u32 {
        let index = self.next_batch_index;
        self.next_batch_index += 1;
        index
    }

    /// The number of batches to enqueue when the job starts.
    pub(crate) fn initial_batch_count(&self) -> u32 {
        match self.entry.mode {
            ExecutionMode::Fixed { batch_count } => batch_count,
            ExecutionMode::Target { .. } => {
                batches_for(self.live_config.target_images, self.entry.images_per_batch)
            }
        }
    }

    /// The number of successful batches needed to reach the live target.
    pub(crate) fn required_batches(&self) -> u32 {
        batches_for(self.live_config.target_images, self.entry.images_per_batch)
    }

    /// The batches still to create given `outstanding` queued, running or pending ones.
    ///
    /// Target mode counts successes only, so failed batches are replaced. Fixed mode runs
    /// `expected_batches` batches once each.
    pub(crate) fn missing_batches(&self, outstanding: u32) -> u32 {
        let (required, done) = match self.entry.mode {
            ExecutionMode::Target { .. } => {
                (self.required_batches(), self.stats.successful_batches)
            }
            ExecutionMode::Fixed { .. } => (self.stats.expected_batches, self.settled_batches),
        };
        required.saturating_sub(done.saturating_add(outstanding))
    }

    pub(crate) fn has_reached_target(&self) -> bool {
        self.stats.total_images >= self.live_config.target_images
            || self.stats.total_batches >= self.stats.expected_batches
    }

    pub(crate) fn mark_running(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.state = JobState::Running;
        self.live_config.paused = false;
    }

    pub(crate) fn mark_paused(&mut self, reason: Option<String>) {
        self.state = JobState::Paused;
        self.live_config.paused = true;
        self.auto_paused = reason.is_some();
        self.pause_reason = reason;
    }

    pub(crate) fn mark_resumed(&mut self) {
        self.mark_running();
        self.auto_paused = false;
        self.pause_reason = None;
        self.consecutive_failures = 0;
    }

    pub(crate) fn mark_finished(&mut self, state: JobState) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.live_config.paused = false;
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }

    pub(crate) fn update_target(&mut self, target_images: u32) {
        let expected_batches = batches_for(target_images, self.entry.images_per_batch);
        self.live_config.target_images = target_images;
        self.stats.expected_batches = expected_batches;
        self.stats.expected_images = expected_batches.saturating_mul(self.entry.images_per_batch);
    }

    pub(crate) fn record_success(&mut self, image_count: u32) {
        self.stats.total_batches += 1;
        self.stats.successful_batches += 1;
        self.stats.total_images += image_count;
        self.settled_batches += 1;
        self.consecutive_failures = 0;
    }

    pub(crate) fn record_failure(&mut self, error: BatchError) {
        self.stats.total_batches += 1;
        self.stats.failed_batches += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error);
    }

    /// A failed batch that will not be retried.
    pub(crate) fn record_given_up(&mut self) {
        self.settled_batches += 1;
    }
}

/// Ceiling division of images into batches.
pub(crate) fn batches_for(images: u32, images_per_batch: u32) -> u32 {
    if images_per_batch == 0 {
        return 0;
    }
    images.div_ceil(images_per_batch)
}

#[cfg(test)]
mod test {
    use super::*;

    fn job(entry: JobEntry) -> Job {
        Job::new(1.into(), entry)
    }

    #[test]
    fn fixed_mode_expectations() {
        let job = job(JobEntry::fixed("entry", "model", 5).with_images_per_batch(4));

        assert_eq!(job.stats.expected_batches, 5);
        assert_eq!(job.stats.expected_images, 20);
        assert_eq!(job.live_config.target_images, 20);
        assert_eq!(job.initial_batch_count(), 5);
        assert_eq!(job.state, JobState::Queued);
    }

    #[test]
    fn target_mode_expectations() {
        let job = job(JobEntry::target("entry", "model", 10).with_images_per_batch(4));

        assert_eq!(job.stats.expected_batches, 3);
        assert_eq!(job.stats.expected_images, 12);
        assert_eq!(job.live_config.target_images, 10);
        assert_eq!(job.initial_batch_count(), 3);
    }

    #[test]
    fn target_reached_by_images_before_batches() {
        let mut job = job(JobEntry::target("entry", "model", 4).with_images_per_batch(1));
        job.update_target(2);

        job.record_success(1);
        assert!(!job.has_reached_target());
        job.record_success(1);
        assert!(job.has_reached_target());
    }

    #[test]
    fn update_target_uses_images_per_batch() {
        let mut job = job(JobEntry::target("entry", "model", 10).with_images_per_batch(4));

        job.update_target(17);
        assert_eq!(job.stats.expected_batches, 5);
        assert_eq!(job.stats.expected_images, 20);

        job.update_target(17);
        assert_eq!(job.stats.expected_batches, 5);
    }

    #[test]
    fn missing_batches_follow_the_raised_target() {
        let mut fixed = job(JobEntry::fixed("entry", "model", 3));
        fixed.record_success(1);
        fixed.record_failure(BatchError::new("boom", 1));
        fixed.record_given_up();
        fixed.update_target(5);
        assert_eq!(fixed.missing_batches(1), 2);

        let mut target = job(JobEntry::target("entry", "model", 2));
        target.record_success(1);
        target.record_failure(BatchError::new("boom", 1));
        target.record_given_up();
        target.update_target(5);
        assert_eq!(target.missing_batches(1), 3);
        assert_eq!(target.missing_batches(9), 0);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut job = job(JobEntry::fixed("entry", "model", 3));
        job.record_failure(BatchError::new("boom", 0));
        job.record_failure(BatchError::new("boom", 1));
        assert_eq!(job.consecutive_failures, 2);

        job.record_success(1);

        assert_eq!(job.consecutive_failures, 0);
        assert_eq!(
            job.stats,
            JobStats {
                total_batches: 3,
                successful_batches: 1,
                failed_batches: 2,
                total_images: 1,
                expected_batches: 3,
                expected_images: 3,
            }
        );
    }

    #[test]
    fn timestamps_are_never_rewound() {
        let mut job = job(JobEntry::fixed("entry", "model", 1));
        job.mark_running();
        let started_at = job.started_at;
        job.mark_paused(None);
        job.mark_resumed();
        assert_eq!(job.started_at, started_at);

        job.mark_finished(JobState::Completed);
        let finished_at = job.finished_at;
        job.mark_finished(JobState::Completed);
        assert_eq!(job.finished_at, finished_at);
        assert!(job.created_at <= job.started_at.unwrap());
        assert!(job.started_at <= job.finished_at);
    }
}
