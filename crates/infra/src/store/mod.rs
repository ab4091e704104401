//! Durable store boundary.
//!
//! Four logical tables back the orchestration core:
//!
//! - entity lifecycle records (one per entity)
//! - outbox entries (jobs waiting to be created in the queue)
//! - idempotency records (key → composed command result)
//! - transition events (append-only audit history)
//!
//! Every write to the first, third and fourth tables, and every insert into the
//! second, happens inside [`CommandStore::initialize_atomic`], which applies
//! them all or none.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{FaultPoint, InMemoryStore};
pub use postgres::PostgresStore;
pub use r#trait::{
    AtomicOutcome, CommandStore, DurableStore, IdempotencyRecord, InitializeCommand,
    InitializeResult, LifecycleQuery, LifecycleRecord, OutboxEntry, OutboxRef, OutboxStore,
    Pagination, RetentionStore, SharedStore, StoreError,
};
