//! Staged processing of one media item.
//!
//! A job runs Fast, Medium and Slow stages in order. Each stage runs its
//! registered [`StageOperation`]s concurrently through the operation call
//! chain (retry, circuit breaker, cache) and must satisfy its
//! [`CompletionPredicate`] before the next stage starts.

pub mod operation;
pub mod processor;
pub mod progress;
pub mod runner;
pub mod stage;

pub use operation::{OperationContext, PartialResult, StageOperation};
pub use processor::{PipelineJob, PipelineOutcome, StagedPipeline};
pub use progress::{
    ChannelProgressSink, ProgressEvent, ProgressReporter, ProgressSink, ProgressUpdate,
};
pub use runner::{OperationReplay, OperationRunner};
pub use stage::{CompletionPredicate, Stage, StageSpec, default_stages};
