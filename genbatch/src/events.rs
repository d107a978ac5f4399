//! Notifications published by a [`crate::Dispatcher`].
//!
//! Events go through a bounded channel with a single consumer, taken with
//! [`crate::Dispatcher::take_events`]. The dispatcher never waits for the consumer: when the
//! channel is full, or nobody is listening, events are dropped.
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::job::{Batch, BatchError, Job, JobId};

pub(crate) const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatcherEvent {
    JobCreated { job: Job },
    JobStarted { job: Job },
    JobPaused { job: Job },
    JobResumed { job: Job },
    JobCancelled { job: Job },
    JobTargetUpdated { job: Job },
    JobAutoPaused { job: Job, reason: String },
    JobCompleted { job: Job },
    JobFailed { job: Job, error: BatchError },
    BatchStarted { job_id: JobId, batch: Batch },
    BatchCompleted { job: Job, batch: Batch },
    BatchFailed { job: Job, batch: Batch, error: BatchError },
    RateLimited {
        #[serde(with = "crate::rate_limit::duration_ms")]
        wait: Duration,
    },
    Started,
    Stopping,
    Stopped,
    ForceStopped,
    Paused,
    Resumed,
}

impl DispatcherEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobCreated { .. } => "job-created",
            Self::JobStarted { .. } => "job-started",
            Self::JobPaused { .. } => "job-paused",
            Self::JobResumed { .. } => "job-resumed",
            Self::JobCancelled { .. } => "job-cancelled",
            Self::JobTargetUpdated { .. } => "job-target-updated",
            Self::JobAutoPaused { .. } => "job-auto-paused",
            Self::JobCompleted { .. } => "job-completed",
            Self::JobFailed { .. } => "job-failed",
            Self::BatchStarted { .. } => "batch-started",
            Self::BatchCompleted { .. } => "batch-completed",
            Self::BatchFailed { .. } => "batch-failed",
            Self::RateLimited { .. } => "rate-limited",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::ForceStopped => "force-stopped",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
        }
    }
}

#[derive(Debug)]
pub(crate) struct EventSender {
    sender: mpsc::Sender<DispatcherEvent>,
}

impl EventSender {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<DispatcherEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    pub(crate) fn emit(&self, event: DispatcherEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(event = event.name(), "Event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::trace!(event = event.name(), "No event subscriber, dropping event");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn full_channel_drops_instead_of_blocking() {
        let (sender, mut receiver) = EventSender::channel(1);

        sender.emit(DispatcherEvent::Started);
        sender.emit(DispatcherEvent::Paused);

        assert_eq!(receiver.recv().await.map(|event| event.name()), Some("started"));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn serializes_with_a_type_tag() {
        let event = DispatcherEvent::RateLimited {
            wait: Duration::from_millis(1500),
        };

        assert_eq!(
            serde_json::to_value(event).unwrap(),
            serde_json::json!({ "type": "rate_limited", "wait": 1500 })
        );
    }
}
