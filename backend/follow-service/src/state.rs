use std::sync::Arc;
use std::time::Duration;

use crate::cache::CounterCache;
use crate::repository::{CounterStore, RelationStore, UserDirectory};
use crate::services::{CounterMaintainer, DriftQueue, FollowOrchestrator, GraphQueryService};

/// Shared state handed to every HTTP worker
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: FollowOrchestrator,
    pub queries: GraphQueryService,
    pub maintainer: CounterMaintainer,
    pub drift: DriftQueue,
    pub relations: Arc<dyn RelationStore>,
    pub directory: Arc<dyn UserDirectory>,
    pub cache: Option<CounterCache>,
}

impl AppState {
    pub fn new(
        relations: Arc<dyn RelationStore>,
        directory: Arc<dyn UserDirectory>,
        counters: Arc<dyn CounterStore>,
        step_timeout: Duration,
    ) -> Self {
        let drift = DriftQueue::new();
        let maintainer = CounterMaintainer::new(counters.clone(), relations.clone())
            .with_call_timeout(step_timeout);
        let orchestrator = FollowOrchestrator::new(
            relations.clone(),
            directory.clone(),
            maintainer.clone(),
            drift.clone(),
            step_timeout,
        );
        let queries = GraphQueryService::new(relations.clone(), directory.clone(), counters)
            .with_call_timeout(step_timeout);

        Self {
            orchestrator,
            queries,
            maintainer,
            drift,
            relations,
            directory,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: CounterCache) -> Self {
        self.cache = Some(cache);
        self
    }
}
