//! `conduit-core`: lifecycle domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the stage-qualified lifecycle states of a generation entity, and
//! the validator that decides which state changes are legal.

pub mod error;
pub mod id;
pub mod state;
pub mod transition;

pub use error::{DomainError, DomainResult};
pub use id::{EntityId, EventId, IdempotencyKey, OutboxId};
pub use state::{InitiatedBy, LifecycleState, Phase, Stage};
pub use transition::{Hop, StateMachine, TransitionPlan};
