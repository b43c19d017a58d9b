//! In-process backends for local development and tests.
//!
//! Every operation runs under a single lock, which gives the same
//! atomicity guarantees as the PostgreSQL implementations.

use async_trait::async_trait;
use idempotent_consumer::IdempotencyKey;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::{CounterStore, RelationStore, UserDirectory};
use crate::domain::{
    CounterApplication, CounterDelta, CounterField, Edge, EdgePage, PageRequest, Profile,
    UserCounters,
};
use crate::error::{DirectoryError, RelationError};

type Pair = (Uuid, Uuid);

#[derive(Default)]
struct Graph {
    edges: HashMap<Pair, Edge>,
    tombstones: HashMap<Pair, Edge>,
}

#[derive(Default)]
pub struct InMemoryRelationStore {
    graph: RwLock<Graph>,
}

impl InMemoryRelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live edges
    pub fn len(&self) -> usize {
        self.graph.read().edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn list<F>(&self, page: PageRequest, matches: F) -> EdgePage
    where
        F: Fn(&Edge) -> bool,
    {
        let graph = self.graph.read();
        let mut edges: Vec<Edge> = graph
            .edges
            .values()
            .filter(|edge| matches(edge))
            .filter(|edge| page.cursor.map_or(true, |cursor| cursor.precedes(edge)))
            .cloned()
            .collect();
        drop(graph);

        edges.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        edges.truncate(page.limit as usize + 1);
        EdgePage::from_overfetch(edges, page.limit)
    }
}

#[async_trait]
impl RelationStore for InMemoryRelationStore {
    async fn create_edge(
        &self,
        follower_id: Uuid,
        followee_id: Uuid,
    ) -> Result<Edge, RelationError> {
        if follower_id == followee_id {
            return Err(RelationError::InvalidEdge);
        }

        let mut graph = self.graph.write();
        if let Some(existing) = graph.edges.get(&(follower_id, followee_id)) {
            return Err(RelationError::AlreadyExists(existing.clone()));
        }

        let edge = Edge::new_follow(follower_id, followee_id);
        graph.edges.insert((follower_id, followee_id), edge.clone());
        Ok(edge)
    }

    async fn delete_edge(
        &self,
        follower_id: Uuid,
        followee_id: Uuid,
    ) -> Result<Edge, RelationError> {
        let pair = (follower_id, followee_id);
        let mut graph = self.graph.write();

        match graph.edges.remove(&pair) {
            Some(edge) => {
                graph.tombstones.insert(pair, edge.clone());
                Ok(edge)
            }
            None => Err(RelationError::NotFound {
                tombstone: graph.tombstones.get(&pair).cloned(),
            }),
        }
    }

    async fn get_edge(
        &self,
        follower_id: Uuid,
        followee_id: Uuid,
    ) -> Result<Option<Edge>, RelationError> {
        Ok(self
            .graph
            .read()
            .edges
            .get(&(follower_id, followee_id))
            .cloned())
    }

    async fn list_followers(
        &self,
        user_id: Uuid,
        page: PageRequest,
    ) -> Result<EdgePage, RelationError> {
        Ok(self.list(page, |edge| edge.followee_id == user_id))
    }

    async fn list_following(
        &self,
        user_id: Uuid,
        page: PageRequest,
    ) -> Result<EdgePage, RelationError> {
        Ok(self.list(page, |edge| edge.follower_id == user_id))
    }

    async fn count_followers(&self, user_id: Uuid) -> Result<i64, RelationError> {
        let graph = self.graph.read();
        Ok(graph.edges.values().filter(|e| e.followee_id == user_id).count() as i64)
    }

    async fn count_following(&self, user_id: Uuid) -> Result<i64, RelationError> {
        let graph = self.graph.read();
        Ok(graph.edges.values().filter(|e| e.follower_id == user_id).count() as i64)
    }
}

#[derive(Default)]
struct Directory {
    profiles: HashMap<Uuid, Profile>,
    counters: HashMap<Uuid, UserCounters>,
    applied_keys: HashSet<IdempotencyKey>,
}

impl Directory {
    fn apply_all(&mut self, deltas: &[CounterDelta]) {
        for delta in deltas {
            if let Some(counters) = self.counters.get_mut(&delta.user_id) {
                counters.apply(delta.field, delta.delta);
            }
        }
    }
}

/// User directory and counter storage kept in process memory
#[derive(Default)]
pub struct InMemoryUserDirectory {
    state: Mutex<Directory>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a profile with zeroed counters (existing counters are kept).
    pub fn insert_profile(&self, profile: Profile) {
        let mut state = self.state.lock();
        state.counters.entry(profile.id).or_default();
        state.profiles.insert(profile.id, profile);
    }

    /// Delete a profile; its counters row stays, as with a soft delete.
    pub fn remove_profile(&self, user_id: Uuid) -> Option<Profile> {
        self.state.lock().profiles.remove(&user_id)
    }

    /// Write counters directly, bypassing idempotency; used to simulate drift.
    pub fn force_counters(&self, user_id: Uuid, counters: UserCounters) {
        self.state.lock().counters.insert(user_id, counters);
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn get_profile(&self, user_id: Uuid) -> Result<Option<Profile>, DirectoryError> {
        Ok(self.state.lock().profiles.get(&user_id).cloned())
    }

    async fn get_profiles_batch(
        &self,
        user_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Profile>, DirectoryError> {
        let state = self.state.lock();
        Ok(user_ids
            .iter()
            .filter_map(|id| state.profiles.get(id).map(|p| (*id, p.clone())))
            .collect())
    }

    async fn list_user_ids(
        &self,
        after: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<Uuid>, DirectoryError> {
        let state = self.state.lock();
        let mut ids: Vec<Uuid> = state
            .counters
            .keys()
            .copied()
            .filter(|id| after.map_or(true, |after| *id > after))
            .collect();
        ids.sort();
        ids.truncate(limit as usize);
        Ok(ids)
    }
}

#[async_trait]
impl CounterStore for InMemoryUserDirectory {
    async fn apply_counter_delta(
        &self,
        user_id: Uuid,
        field: CounterField,
        delta: i64,
    ) -> Result<i64, DirectoryError> {
        let mut state = self.state.lock();
        Ok(state
            .counters
            .get_mut(&user_id)
            .map_or(0, |counters| counters.apply(field, delta)))
    }

    async fn apply_deltas_once(
        &self,
        key: &IdempotencyKey,
        deltas: &[CounterDelta],
    ) -> Result<bool, DirectoryError> {
        let mut state = self.state.lock();
        if !state.applied_keys.insert(key.clone()) {
            return Ok(false);
        }
        state.apply_all(deltas);
        Ok(true)
    }

    async fn reverse_deltas_once(
        &self,
        key: &IdempotencyKey,
        reverses: &IdempotencyKey,
        deltas: &[CounterDelta],
    ) -> Result<CounterApplication, DirectoryError> {
        let mut state = self.state.lock();
        if !state.applied_keys.insert(key.clone()) {
            return Ok(CounterApplication::Duplicate);
        }
        if state.applied_keys.insert(reverses.clone()) {
            return Ok(CounterApplication::Voided);
        }
        state.apply_all(deltas);
        Ok(CounterApplication::Applied)
    }

    async fn get_counters(&self, user_id: Uuid) -> Result<Option<UserCounters>, DirectoryError> {
        Ok(self.state.lock().counters.get(&user_id).copied())
    }

    async fn overwrite_counters(
        &self,
        user_id: Uuid,
        counters: UserCounters,
    ) -> Result<bool, DirectoryError> {
        let mut state = self.state.lock();
        match state.counters.get_mut(&user_id) {
            Some(slot) => {
                *slot = UserCounters::new(
                    counters.follower_count.max(0),
                    counters.following_count.max(0),
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
