//! State machine validator.
//!
//! Pure business rules that decide which lifecycle changes are legal. It has
//! no side effects; the command path calls it inside its transaction before
//! anything is written.
//!
//! Legal edges:
//!
//! ```text
//! pending            → stage_2_init
//! stage_N_init       → stage_N_processing
//! stage_N_processing → stage_N_complete
//! stage_N_complete   → stage_(N+1)_init   (last stage: → finalizing)
//! finalizing         → completed
//! any non-terminal   → failed | cancelled
//! completed | failed | cancelled → pending   (restart)
//! ```

use crate::error::{DomainError, DomainResult};
use crate::id::EntityId;
use crate::state::{LifecycleState, Phase, Stage};

/// One validated edge of the state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Hop {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// What the command path must write for a requested state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionPlan {
    /// No lifecycle record exists yet; create one in this state.
    Create(LifecycleState),
    /// The record already is (or is further inside) the requested stage.
    Unchanged(LifecycleState),
    /// Apply these edges in order.
    Advance(Vec<Hop>),
}

impl TransitionPlan {
    /// State of the record once the plan is applied.
    pub fn resulting_state(&self) -> LifecycleState {
        match self {
            TransitionPlan::Create(state) | TransitionPlan::Unchanged(state) => *state,
            TransitionPlan::Advance(hops) => hops
                .last()
                .map(|h| h.to)
                .unwrap_or(LifecycleState::Pending),
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, TransitionPlan::Unchanged(_))
    }
}

/// Stateless lifecycle validator.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateMachine;

impl StateMachine {
    /// Whether `from → to` is an edge of the state machine.
    pub fn can_transition(from: LifecycleState, to: LifecycleState) -> bool {
        use LifecycleState::*;

        match (from, to) {
            (from, Failed | Cancelled) => !from.is_terminal(),
            (Completed | Failed | Cancelled, Pending) => true,
            (Pending, InStage { stage, phase: Phase::Init }) => stage == Stage::first(),
            (
                InStage { stage: a, phase: Phase::Init },
                InStage { stage: b, phase: Phase::Processing },
            ) => a == b,
            (
                InStage { stage: a, phase: Phase::Processing },
                InStage { stage: b, phase: Phase::Complete },
            ) => a == b,
            (
                InStage { stage: a, phase: Phase::Complete },
                InStage { stage: b, phase: Phase::Init },
            ) => a.next() == Some(b),
            (InStage { stage, phase: Phase::Complete }, Finalizing) => stage.next().is_none(),
            (Finalizing, Completed) => true,
            _ => false,
        }
    }

    /// All states reachable from `from` in one edge.
    pub fn allowed_targets(from: LifecycleState) -> Vec<LifecycleState> {
        LifecycleState::all()
            .into_iter()
            .filter(|to| Self::can_transition(from, *to))
            .collect()
    }

    /// Validate a single edge, producing a distinguishable error on rejection.
    pub fn validate(
        entity_id: &EntityId,
        from: LifecycleState,
        to: LifecycleState,
    ) -> DomainResult<Hop> {
        if Self::can_transition(from, to) {
            Ok(Hop { from, to })
        } else {
            Err(DomainError::invalid_transition(
                entity_id.as_str(),
                Some(from),
                to,
            ))
        }
    }

    /// Decide what initializing `entity_id` into `requested` means given its
    /// current state.
    ///
    /// - no record: create it, but only in an entry state
    /// - already there (or further inside the requested stage): unchanged
    /// - a legal edge: advance
    /// - terminal and asking for the first stage: restart through `pending`
    /// - anything else is an invalid transition
    pub fn plan(
        entity_id: &EntityId,
        current: Option<LifecycleState>,
        requested: LifecycleState,
    ) -> DomainResult<TransitionPlan> {
        let Some(current) = current else {
            if requested.is_entry() {
                return Ok(TransitionPlan::Create(requested));
            }
            return Err(DomainError::invalid_transition(
                entity_id.as_str(),
                None,
                requested,
            ));
        };

        if current == requested || is_reentry(current, requested) {
            return Ok(TransitionPlan::Unchanged(current));
        }

        if Self::can_transition(current, requested) {
            return Ok(TransitionPlan::Advance(vec![Hop {
                from: current,
                to: requested,
            }]));
        }

        if current.is_terminal() && requested == Stage::first().init() {
            let restart = Self::validate(entity_id, current, LifecycleState::Pending)?;
            let enter = Self::validate(entity_id, LifecycleState::Pending, requested)?;
            return Ok(TransitionPlan::Advance(vec![restart, enter]));
        }

        Err(DomainError::invalid_transition(
            entity_id.as_str(),
            Some(current),
            requested,
        ))
    }
}

/// Asking for `stage_N_init` while already processing or done with stage N.
fn is_reentry(current: LifecycleState, requested: LifecycleState) -> bool {
    match (current, requested) {
        (
            LifecycleState::InStage { stage: a, phase: Phase::Processing | Phase::Complete },
            LifecycleState::InStage { stage: b, phase: Phase::Init },
        ) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entity() -> EntityId {
        EntityId::new("course-1").unwrap()
    }

    fn any_state() -> impl Strategy<Value = LifecycleState> {
        prop::sample::select(LifecycleState::all())
    }

    #[test]
    fn happy_path_walks_every_stage() {
        let mut path = vec![LifecycleState::Pending];
        for stage in Stage::ALL {
            path.extend([stage.init(), stage.processing(), stage.complete()]);
        }
        path.extend([LifecycleState::Finalizing, LifecycleState::Completed]);

        for pair in path.windows(2) {
            assert!(
                StateMachine::can_transition(pair[0], pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn skipping_stages_is_rejected() {
        let err = StateMachine::validate(
            &entity(),
            Stage::DocumentProcessing.complete(),
            Stage::StructureGeneration.processing(),
        )
        .unwrap_err();

        assert_eq!(
            err,
            DomainError::InvalidTransition {
                entity_id: "course-1".to_string(),
                from: Some(Stage::DocumentProcessing.complete()),
                to: Stage::StructureGeneration.processing(),
            }
        );
    }

    #[test]
    fn only_first_stage_leaves_pending() {
        assert!(StateMachine::can_transition(
            LifecycleState::Pending,
            Stage::DocumentProcessing.init()
        ));
        assert!(!StateMachine::can_transition(
            LifecycleState::Pending,
            Stage::Analysis.init()
        ));
    }

    #[test]
    fn terminal_states_only_restart() {
        for terminal in [
            LifecycleState::Completed,
            LifecycleState::Failed,
            LifecycleState::Cancelled,
        ] {
            assert_eq!(
                StateMachine::allowed_targets(terminal),
                vec![LifecycleState::Pending]
            );
        }
    }

    #[test]
    fn plan_creates_only_in_entry_states() {
        assert_eq!(
            StateMachine::plan(&entity(), None, Stage::Summarization.init()).unwrap(),
            TransitionPlan::Create(Stage::Summarization.init())
        );
        assert!(
            StateMachine::plan(&entity(), None, Stage::Summarization.processing())
                .unwrap_err()
                .is_invalid_transition()
        );
    }

    #[test]
    fn plan_treats_reentry_as_unchanged() {
        let plan = StateMachine::plan(
            &entity(),
            Some(Stage::Analysis.processing()),
            Stage::Analysis.init(),
        )
        .unwrap();
        assert_eq!(plan, TransitionPlan::Unchanged(Stage::Analysis.processing()));
        assert!(plan.is_noop());
    }

    #[test]
    fn plan_restarts_terminal_into_first_stage() {
        let plan = StateMachine::plan(
            &entity(),
            Some(LifecycleState::Failed),
            Stage::first().init(),
        )
        .unwrap();

        assert_eq!(
            plan,
            TransitionPlan::Advance(vec![
                Hop { from: LifecycleState::Failed, to: LifecycleState::Pending },
                Hop { from: LifecycleState::Pending, to: Stage::first().init() },
            ])
        );
        assert_eq!(plan.resulting_state(), Stage::first().init());
    }

    #[test]
    fn plan_does_not_move_backwards() {
        assert!(StateMachine::plan(
            &entity(),
            Some(Stage::Analysis.init()),
            Stage::Summarization.init(),
        )
        .is_err());
    }

    proptest! {
        #[test]
        fn edges_never_skip_or_share_stages(from in any_state(), to in any_state()) {
            if StateMachine::can_transition(from, to) {
                if let (Some(a), Some(b)) = (from.stage(), to.stage()) {
                    prop_assert!(a == b || a.next() == Some(b));
                }
            }
        }

        #[test]
        fn only_restart_edges_are_bidirectional(a in any_state(), b in any_state()) {
            if StateMachine::can_transition(a, b) && StateMachine::can_transition(b, a) {
                let pair = [a, b];
                prop_assert!(pair.contains(&LifecycleState::Pending));
                prop_assert!(pair.iter().any(|s| s.is_terminal()));
            }
        }

        #[test]
        fn rejected_edges_never_plan_an_advance(from in any_state(), to in any_state()) {
            if !StateMachine::can_transition(from, to) {
                match StateMachine::plan(&entity(), Some(from), to) {
                    Ok(TransitionPlan::Advance(hops)) => {
                        // Only the restart shortcut chains edges.
                        prop_assert!(from.is_terminal());
                        prop_assert_eq!(hops.len(), 2);
                    }
                    Ok(TransitionPlan::Unchanged(state)) => prop_assert_eq!(state, from),
                    Ok(TransitionPlan::Create(_)) => prop_assert!(false, "create with a current state"),
                    Err(err) => prop_assert!(err.is_invalid_transition()),
                }
            }
        }

        #[test]
        fn every_planned_hop_is_a_legal_edge(from in any_state(), to in any_state()) {
            if let Ok(TransitionPlan::Advance(hops)) = StateMachine::plan(&entity(), Some(from), to) {
                for hop in hops {
                    prop_assert!(StateMachine::can_transition(hop.from, hop.to));
                }
            }
        }
    }
}
