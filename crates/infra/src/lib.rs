//! Infrastructure layer: durable store, idempotency tiers, job queues, and
//! the background tasks that keep lifecycle state and the queue consistent.
//!
//! ## Write path
//!
//! [`command_handler::CommandHandler`] is the only component that changes
//! lifecycle state. It writes the state change, its audit events, one outbox
//! row per job and the idempotency record in one store transaction.
//!
//! ## Background tasks
//!
//! - [`outbox::OutboxProcessor`]: moves committed outbox rows into the queue
//! - [`safety_net::QueueBackupListener`]: initializes state for jobs created
//!   outside the command handler
//! - [`workers::JobConsumer`]: runs stage jobs behind the
//!   [`safety_net::SelfHealingCheck`]
//! - [`workers::RetentionSweeper`]: purges aged-out rows
//!
//! Background tasks coordinate only through the store and the queue.

pub mod command_handler;
pub mod config;
pub mod idempotency;
pub mod outbox;
pub mod queue;
pub mod routing;
pub mod safety_net;
pub mod store;
pub mod workers;


pub use command_handler::{CommandError, CommandHandler};
pub use config::{ConfigError, OrchestratorConfig};
pub use routing::StageRoutes;
