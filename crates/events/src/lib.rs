//! Messages exchanged between orchestration components.
//!
//! - [`TransitionEvent`]: the append-only audit row written with every state change
//! - [`JobDescriptor`]: a job the caller wants created once the state change commits
//! - [`JobCreated`]: what a queue announces to its subscribers after accepting a job
//! - [`Subscription`]: async receiving end of a queue announcement stream

pub mod bus;
pub mod job;
pub mod transition;

pub use bus::Subscription;
pub use job::{ENTITY_ID_FIELD, JobCreated, JobDescriptor};
pub use transition::TransitionEvent;
