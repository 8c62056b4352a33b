//! Priority job queue and the worker pool that drains it.

pub mod job_queue;
pub mod work_item;
pub mod worker_pool;

pub use job_queue::{JobQueue, QueueConfig, QueueStatus, SubmitReceipt};
pub use work_item::{JobStatus, Priority, WorkItem};
pub use worker_pool::{ShutdownReport, WorkerPool, WorkerPoolConfig};
