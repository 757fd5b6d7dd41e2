pub mod queue;

pub use queue::{DiskJob, DiskQueue, JobKind, JobStatus, QueueSnapshot};

pub const DEFAULT_MAX_WORKERS: usize = 4;
