//! A batch dispatcher for image generation jobs.
//!
//! A job asks for a number of images from a generation model. The [`Dispatcher`] splits it
//! into batches, one provider call each, and runs the batches of every job from a single queue
//! while keeping to a concurrency limit and a sliding window rate limit. Failed batches are
//! retried with exponential backoff or given up on depending on the [`policy::FailurePolicy`],
//! and a job that keeps failing is paused before it burns through the provider quota.
//!
//! The dispatcher does not talk to a provider or touch the file system itself. Everything
//! outside scheduling is delegated to the [`collaborators`], and progress is reported through
//! a channel of [`events::DispatcherEvent`]s.
//!
//! # Example
//!
//! ```
//! # use std::sync::Arc;
//! use genbatch::prelude::*;
//! use genbatch::testing::{self, ScriptedApi};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let dispatcher = Dispatcher::new(
//!     Arc::new(ConcurrencyLimiter::new(ConcurrencyConfig::default().with_max_concurrent(2))),
//!     Arc::new(RateLimiter::new(RateLimitConfig::default().with_max_calls(30))),
//!     testing::collaborators(Arc::new(ScriptedApi::new())),
//! );
//! dispatcher.configure(
//!     DispatcherOptions::default()
//!         .with_model("flash", ModelConfig::new("flash-image-001"))
//!         .with_output_root("generated"),
//! );
//! let mut events = dispatcher.take_events().unwrap();
//!
//! let job = dispatcher
//!     .create_job(JobEntry::target("sunsets", "flash", 10).with_images_per_batch(4))
//!     .unwrap();
//! assert_eq!(job.stats.expected_batches, 3);
//!
//! dispatcher.start_job(job.id).await.unwrap();
//! dispatcher.start();
//!
//! while let Some(event) = events.recv().await {
//!     if let DispatcherEvent::JobCompleted { job } = event {
//!         assert_eq!(job.state, JobState::Completed);
//!         assert_eq!(job.stats.total_images, 12);
//!         break;
//!     }
//! }
//! dispatcher.stop().await;
//! # });
//! ```
pub mod backoff;
pub mod collaborators;
pub mod concurrency;
pub mod dispatcher;
pub mod events;
pub mod job;
pub mod model;
pub mod notifier;
pub mod policy;
pub mod prelude;
pub mod rate_limit;
pub mod testing;

pub use dispatcher::{Dispatcher, DispatcherError};
