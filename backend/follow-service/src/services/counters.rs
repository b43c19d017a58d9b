use idempotent_consumer::IdempotencyKey;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::deadline::with_deadline;
use crate::domain::{CounterApplication, CounterDelta, CounterField, Edge, UserCounters};
use crate::error::{DirectoryError, ReconcileError};
use crate::metrics;
use crate::repository::{CounterStore, RelationStore};

const EDGE_CREATED_SCOPE: &str = "follow.created";
const EDGE_REMOVED_SCOPE: &str = "follow.removed";

/// Bound on each storage call made outside the follow orchestrator
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Key guarding the increments of one edge instance
pub fn edge_created_key(edge_id: Uuid) -> IdempotencyKey {
    IdempotencyKey::derive(EDGE_CREATED_SCOPE, edge_id)
}

/// Key guarding the decrements of one edge instance
pub fn edge_removed_key(edge_id: Uuid) -> IdempotencyKey {
    IdempotencyKey::derive(EDGE_REMOVED_SCOPE, edge_id)
}

/// Result of recounting one user's edges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recomputed {
    pub user_id: Uuid,
    pub previous: UserCounters,
    pub current: UserCounters,
}

impl Recomputed {
    pub fn corrected(&self) -> bool {
        self.previous != self.current
    }

    /// Absolute correction summed over both counters
    pub fn drift(&self) -> i64 {
        (self.previous.follower_count - self.current.follower_count).abs()
            + (self.previous.following_count - self.current.following_count).abs()
    }
}

/// Keeps the denormalized follower/following counters in step with the
/// edge set.
///
/// Every edge instance moves the counters at most once per direction: the
/// deltas and an idempotency key derived from the edge id are committed as
/// one unit by the counter store. A removal that overtakes the increment of
/// the same edge voids that increment instead of decrementing.
#[derive(Clone)]
pub struct CounterMaintainer {
    store: Arc<dyn CounterStore>,
    relations: Arc<dyn RelationStore>,
    call_timeout: Duration,
}

impl CounterMaintainer {
    pub fn new(store: Arc<dyn CounterStore>, relations: Arc<dyn RelationStore>) -> Self {
        Self {
            store,
            relations,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Deadline for the storage calls of reads and recomputation
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// +1 following for the follower, +1 followers for the followee
    pub async fn on_edge_created(&self, edge: &Edge) -> Result<CounterApplication, DirectoryError> {
        let key = edge_created_key(edge.id);
        let application = if self.store.apply_deltas_once(&key, &edge_deltas(edge, 1)).await? {
            CounterApplication::Applied
        } else {
            CounterApplication::Duplicate
        };
        debug!(key = %key, result = ?application, "Edge created counter step");
        Ok(application)
    }

    /// -1 on the same counters, clamped at zero.
    ///
    /// `Voided` when the edge's increment had not been applied yet; that
    /// increment is then spent and never lands.
    pub async fn on_edge_removed(&self, edge: &Edge) -> Result<CounterApplication, DirectoryError> {
        let key = edge_removed_key(edge.id);
        let application = self
            .store
            .reverse_deltas_once(&key, &edge_created_key(edge.id), &edge_deltas(edge, -1))
            .await?;
        debug!(key = %key, result = ?application, "Edge removed counter step");
        Ok(application)
    }

    /// Recount a user's edges and overwrite both counters with the result.
    pub async fn recompute_counters(&self, user_id: Uuid) -> Result<Recomputed, ReconcileError> {
        let limit = self.call_timeout;
        let previous = with_deadline(limit, "get_counters", self.store.get_counters(user_id))
            .await?
            .ok_or(ReconcileError::UnknownUser(user_id))?;

        let current = UserCounters::new(
            with_deadline(limit, "count_followers", self.relations.count_followers(user_id))
                .await?,
            with_deadline(limit, "count_following", self.relations.count_following(user_id))
                .await?,
        );

        if previous != current {
            let overwrite = self.store.overwrite_counters(user_id, current);
            if !with_deadline(limit, "overwrite_counters", overwrite).await? {
                return Err(ReconcileError::UnknownUser(user_id));
            }
            info!(
                user = %user_id,
                previous_followers = previous.follower_count,
                previous_following = previous.following_count,
                followers = current.follower_count,
                following = current.following_count,
                "Corrected counter drift"
            );
        }

        Ok(Recomputed {
            user_id,
            previous,
            current,
        })
    }

    pub async fn get_counters(
        &self,
        user_id: Uuid,
    ) -> Result<Option<UserCounters>, DirectoryError> {
        with_deadline(self.call_timeout, "get_counters", self.store.get_counters(user_id)).await
    }
}

fn edge_deltas(edge: &Edge, delta: i64) -> [CounterDelta; 2] {
    [
        CounterDelta::new(edge.follower_id, CounterField::Following, delta),
        CounterDelta::new(edge.followee_id, CounterField::Followers, delta),
    ]
}

/// Users whose counters may lag behind the edge set.
///
/// Filled by partially failed operations, drained by the reconciliation
/// worker. Cloning shares the same queue.
#[derive(Clone, Default)]
pub struct DriftQueue {
    users: Arc<Mutex<HashSet<Uuid>>>,
}

impl DriftQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, user_ids: &[Uuid]) {
        let mut users = self.users.lock();
        users.extend(user_ids.iter().copied());
        metrics::set_drift_queue_size(users.len());
    }

    /// Take every queued user, in ascending id order.
    pub fn drain(&self) -> Vec<Uuid> {
        let mut users = self.users.lock();
        let mut drained: Vec<Uuid> = users.drain().collect();
        metrics::set_drift_queue_size(0);
        drained.sort();
        drained
    }

    pub fn contains(&self, user_id: Uuid) -> bool {
        self.users.lock().contains(&user_id)
    }

    pub fn len(&self) -> usize {
        self.users.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
