use async_trait::async_trait;
use idempotent_consumer::IdempotencyKey;
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::{
    CounterApplication, CounterDelta, CounterField, Edge, EdgePage, PageRequest, Profile,
    UserCounters,
};
use crate::error::{DirectoryError, RelationError};

/// Persistence of follow edges.
///
/// Implementations enforce pair uniqueness themselves: of two concurrent
/// `create_edge` calls for the same pair exactly one stores an edge and the
/// other observes `AlreadyExists`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelationStore: Send + Sync {
    /// Persist a new edge.
    ///
    /// Fails with `InvalidEdge` on a self-follow and with
    /// `AlreadyExists(existing)` when the pair is already linked.
    async fn create_edge(
        &self,
        follower_id: Uuid,
        followee_id: Uuid,
    ) -> Result<Edge, RelationError>;

    /// Remove the edge of a pair and return it.
    ///
    /// Fails with `NotFound { tombstone }` when no live edge exists; the
    /// tombstone is the last edge removed for this pair, if any.
    async fn delete_edge(
        &self,
        follower_id: Uuid,
        followee_id: Uuid,
    ) -> Result<Edge, RelationError>;

    async fn get_edge(
        &self,
        follower_id: Uuid,
        followee_id: Uuid,
    ) -> Result<Option<Edge>, RelationError>;

    /// Edges with `followee_id = user_id`, newest first
    async fn list_followers(
        &self,
        user_id: Uuid,
        page: PageRequest,
    ) -> Result<EdgePage, RelationError>;

    /// Edges with `follower_id = user_id`, newest first
    async fn list_following(
        &self,
        user_id: Uuid,
        page: PageRequest,
    ) -> Result<EdgePage, RelationError>;

    async fn count_followers(&self, user_id: Uuid) -> Result<i64, RelationError>;

    async fn count_following(&self, user_id: Uuid) -> Result<i64, RelationError>;

    async fn health_check(&self) -> Result<(), RelationError> {
        Ok(())
    }
}

/// Read side of the external user directory
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Active profile of `user_id`; `None` for unknown or deleted users.
    async fn get_profile(&self, user_id: Uuid) -> Result<Option<Profile>, DirectoryError>;

    /// Active profiles keyed by id; missing ids are simply absent.
    async fn get_profiles_batch(
        &self,
        user_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Profile>, DirectoryError>;

    /// Ids of users with a counters row, ascending, strictly after `after`.
    async fn list_user_ids(
        &self,
        after: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<Uuid>, DirectoryError>;

    async fn health_check(&self) -> Result<(), DirectoryError> {
        Ok(())
    }
}

/// Counter storage owned by the user directory.
///
/// Every mutation is an atomic delta applied by the storage layer, never a
/// read-modify-write from the caller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add `delta` to one counter, clamping at zero; returns the
    /// new value (`0` when the user has no counters row).
    async fn apply_counter_delta(
        &self,
        user_id: Uuid,
        field: CounterField,
        delta: i64,
    ) -> Result<i64, DirectoryError>;

    /// Record `key` and apply every delta as one atomic unit.
    ///
    /// Returns `false` without touching any counter when `key` was already
    /// recorded.
    async fn apply_deltas_once(
        &self,
        key: &IdempotencyKey,
        deltas: &[CounterDelta],
    ) -> Result<bool, DirectoryError>;

    /// Record `key` and apply `deltas`, which reverse the change guarded by
    /// `reverses`, as one atomic unit.
    ///
    /// When `reverses` was never recorded the reversed change never moved a
    /// counter: `reverses` is recorded now so it can no longer be applied,
    /// and the result is `Voided` with every counter untouched. `Duplicate`
    /// when `key` was already recorded.
    async fn reverse_deltas_once(
        &self,
        key: &IdempotencyKey,
        reverses: &IdempotencyKey,
        deltas: &[CounterDelta],
    ) -> Result<CounterApplication, DirectoryError>;

    async fn get_counters(&self, user_id: Uuid) -> Result<Option<UserCounters>, DirectoryError>;

    /// Replace both counters; reconciliation only.
    async fn overwrite_counters(
        &self,
        user_id: Uuid,
        counters: UserCounters,
    ) -> Result<bool, DirectoryError>;
}
