//! Fallback layers that converge jobs created outside the command handler
//! back onto the validated lifecycle.
//!
//! Both layers go through [`CommandHandler::initialize`](crate::command_handler::CommandHandler::initialize)
//! with keys derived from the job, and neither ever returns an error to its
//! caller: a failure is logged at `warn` and reported in the outcome.

pub mod queue_backup;
pub mod self_healing;

pub use queue_backup::{ListenerOutcome, QueueBackupListener};
pub use self_healing::{HealOutcome, SelfHealingCheck};

/// Key scope for commands issued by the queue-backup listener.
pub const QUEUE_BACKUP_SCOPE: &str = "queue-backup";
/// Key scope for commands issued by the worker self-healing check.
pub const WORKER_HEAL_SCOPE: &str = "worker-heal";
