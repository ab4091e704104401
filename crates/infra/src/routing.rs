//! Which pipeline stage a queue's jobs belong to.

use std::collections::BTreeMap;

use conduit_core::{LifecycleState, Stage};

/// Queue name → stage mapping used by the fallback layers to decide which
/// state a job implies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRoutes {
    routes: BTreeMap<String, Stage>,
}

impl Default for StageRoutes {
    /// Every stage on its default queue.
    fn default() -> Self {
        Self {
            routes: Stage::ALL
                .into_iter()
                .map(|stage| (stage.default_queue().to_string(), stage))
                .collect(),
        }
    }
}

impl StageRoutes {
    /// No routes at all.
    pub fn empty() -> Self {
        Self {
            routes: BTreeMap::new(),
        }
    }

    /// Route `queue_name` to `stage`, replacing any previous route.
    pub fn with_route(mut self, queue_name: impl Into<String>, stage: Stage) -> Self {
        self.routes.insert(queue_name.into(), stage);
        self
    }

    pub fn stage_for(&self, queue_name: &str) -> Option<Stage> {
        self.routes.get(queue_name).copied()
    }

    /// State a freshly created job on `queue_name` expects its entity to be in.
    pub fn expected_state(&self, queue_name: &str) -> Option<LifecycleState> {
        self.stage_for(queue_name).map(Stage::init)
    }

    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_routes_cover_every_stage() {
        let routes = StageRoutes::default();
        for stage in Stage::ALL {
            assert_eq!(routes.stage_for(stage.default_queue()), Some(stage));
        }
        assert_eq!(routes.queues().count(), Stage::ALL.len());
    }

    #[test]
    fn custom_route_overrides_and_expected_state_is_stage_init() {
        let routes = StageRoutes::empty().with_route("llm-outline", Stage::StructureGeneration);
        assert_eq!(
            routes.expected_state("llm-outline"),
            Some(Stage::StructureGeneration.init())
        );
        assert_eq!(routes.stage_for("analysis"), None);
    }
}
