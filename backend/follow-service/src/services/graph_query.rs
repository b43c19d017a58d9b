use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::counters::DEFAULT_CALL_TIMEOUT;
use super::deadline::with_deadline;
use crate::domain::{Edge, EdgeCursor, EdgePage, PageRequest, Profile, UserCounters};
use crate::error::{ServiceError, ServiceResult};
use crate::repository::{CounterStore, RelationStore, UserDirectory};

/// One row of a follower/following list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FollowListItem {
    pub profile: Profile,
    pub edge: Edge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowListPage {
    pub items: Vec<FollowListItem>,
    /// Continuation of the underlying edge listing
    pub next_cursor: Option<EdgeCursor>,
}

#[derive(Clone, Copy)]
enum Direction {
    Followers,
    Following,
}

/// Read side of the follow graph: edge listings joined with profiles.
#[derive(Clone)]
pub struct GraphQueryService {
    relations: Arc<dyn RelationStore>,
    directory: Arc<dyn UserDirectory>,
    counters: Arc<dyn CounterStore>,
    call_timeout: Duration,
}

impl GraphQueryService {
    pub fn new(
        relations: Arc<dyn RelationStore>,
        directory: Arc<dyn UserDirectory>,
        counters: Arc<dyn CounterStore>,
    ) -> Self {
        Self {
            relations,
            directory,
            counters,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Deadline for each storage call of a query
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Users following `user_id`, newest first
    pub async fn get_followers(
        &self,
        user_id: Uuid,
        page: PageRequest,
    ) -> ServiceResult<FollowListPage> {
        self.list(Direction::Followers, user_id, page).await
    }

    /// Users `user_id` follows, newest first
    pub async fn get_following(
        &self,
        user_id: Uuid,
        page: PageRequest,
    ) -> ServiceResult<FollowListPage> {
        self.list(Direction::Following, user_id, page).await
    }

    pub async fn is_following(&self, follower_id: Uuid, followee_id: Uuid) -> ServiceResult<bool> {
        let edge = with_deadline(
            self.call_timeout,
            "get_edge",
            self.relations.get_edge(follower_id, followee_id),
        )
        .await?;
        Ok(edge.is_some())
    }

    /// Stored counters; may lag the lists until reconciliation catches up.
    pub async fn get_counters(&self, user_id: Uuid) -> ServiceResult<UserCounters> {
        with_deadline(
            self.call_timeout,
            "get_counters",
            self.counters.get_counters(user_id),
        )
        .await?
        .ok_or(ServiceError::UnknownUser(user_id))
    }

    async fn list(
        &self,
        direction: Direction,
        user_id: Uuid,
        page: PageRequest,
    ) -> ServiceResult<FollowListPage> {
        if user_id.is_nil() {
            return Err(ServiceError::InvalidRequest("user id must not be nil".to_string()));
        }

        let edge_page = match direction {
            Direction::Followers => {
                let listing = self.relations.list_followers(user_id, page);
                with_deadline(self.call_timeout, "list_followers", listing).await?
            }
            Direction::Following => {
                let listing = self.relations.list_following(user_id, page);
                with_deadline(self.call_timeout, "list_following", listing).await?
            }
        };

        let other_side = |edge: &Edge| match direction {
            Direction::Followers => edge.follower_id,
            Direction::Following => edge.followee_id,
        };

        self.join_profiles(edge_page, other_side).await
    }

    async fn join_profiles<F>(
        &self,
        edge_page: EdgePage,
        other_side: F,
    ) -> ServiceResult<FollowListPage>
    where
        F: Fn(&Edge) -> Uuid,
    {
        let EdgePage { edges, next_cursor } = edge_page;
        if edges.is_empty() {
            return Ok(FollowListPage {
                items: Vec::new(),
                next_cursor,
            });
        }

        let mut seen = HashSet::with_capacity(edges.len());
        let ids: Vec<Uuid> = edges
            .iter()
            .map(&other_side)
            .filter(|id| seen.insert(*id))
            .collect();
        let batch = self.directory.get_profiles_batch(&ids);
        let mut profiles = with_deadline(self.call_timeout, "get_profiles_batch", batch).await?;

        let total = edges.len();
        let items: Vec<FollowListItem> = edges
            .into_iter()
            .filter_map(|edge| {
                let id = other_side(&edge);
                // a user appears at most once per side, so the profile can move out
                profiles.remove(&id).map(|profile| FollowListItem { profile, edge })
            })
            .collect();

        if items.len() < total {
            debug!(omitted = total - items.len(), "Omitted edges without an active profile");
        }

        Ok(FollowListPage { items, next_cursor })
    }
}
