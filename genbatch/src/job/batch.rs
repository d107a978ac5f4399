use std::{fmt::Display, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    collaborators::{ReferenceDescriptor, SavedFile},
    dispatcher::BatchOutput,
};

use super::JobId;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId(u64);

impl From<u64> for BatchId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<BatchId> for u64 {
    fn from(value: BatchId) -> Self {
        value.0
    }
}

impl Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BatchId({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Queued,
    InFlight,
    Completed,
    Failed,
}

/// Structured record of why a batch, or the start of a job, failed.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BatchError {
    pub message: String,
    /// The status code of the remote call, when there was one.
    pub code: Option<u16>,
    pub details: Option<String>,
    pub hint: Option<String>,
    pub batch_index: u32,
}

impl BatchError {
    pub fn new(message: impl Into<String>, batch_index: u32) -> Self {
        Self {
            message: message.into(),
            code: None,
            details: None,
            hint: None,
            batch_index,
        }
    }
}

impl Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (status {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: BatchId,
    pub job_id: JobId,
    pub index: u32,
    pub state: BatchState,
    /// How many times the batch went back into the queue after a failure.
    pub retries: u32,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub image_count: u32,
    pub files: Vec<SavedFile>,
    pub prompt: Option<String>,
    pub references: Vec<ReferenceDescriptor>,
    pub model: String,
    pub output_dir: Option<PathBuf>,
    pub error: Option<BatchError>,
}

impl Batch {
    pub(crate) fn new(id: BatchId, job_id: JobId, index: u32, model: String) -> Self {
        Self {
            id,
            job_id,
            index,
            state: BatchState::Queued,
            retries: 0,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            image_count: 0,
            files: vec![],
            prompt: None,
            references: vec![],
            model,
            output_dir: None,
            error: None,
        }
    }

    pub(crate) fn mark_in_flight(&mut self) {
        self.state = BatchState::InFlight;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn mark_completed(&mut self, output: BatchOutput) {
        self.state = BatchState::Completed;
        self.completed_at = Some(Utc::now());
        self.image_count = output.files.len() as u32;
        self.files = output.files;
        self.prompt = Some(output.prompt);
        self.references = output.references;
        self.output_dir = Some(output.output_dir);
        self.error = None;
    }

    pub(crate) fn mark_failed(&mut self, error: BatchError) {
        self.state = BatchState::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error);
    }

    /// Puts a failed batch back in the queue for another attempt.
    pub(crate) fn mark_requeued(&mut self) {
        self.state = BatchState::Queued;
        self.retries += 1;
        self.queued_at = Utc::now();
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
    }
}
