//! Background workers.

pub mod evaluation_worker;

pub use evaluation_worker::{EvaluationWorker, TickOutcome, WorkerConfig, WorkerError, WorkerPoolHandle, WorkerStats};
