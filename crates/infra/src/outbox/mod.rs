//! Outbox processing: moving committed outbox rows into the job queue.

pub mod processor;
pub mod retry;

pub use processor::{
    BatchReport, HealthHandle, OutboxProcessor, OutboxProcessorConfig, PollInterval,
    ProcessorHealth, ProcessorTotals,
};
pub use retry::RetryPolicy;
