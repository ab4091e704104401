//! Background workers and their lifecycle handles.

pub mod handle;
pub mod job_consumer;
pub mod retention;

pub use handle::{ShutdownSignal, TaskHandle};
pub use job_consumer::{ConsumeOutcome, JobConsumer, StageJobHandler};
pub use retention::{RetentionPolicy, RetentionSweeper, SweepReport};
