//! Follow graph API endpoints
//!
//! POST /api/v1/graph/follow - Follow a user
//! POST /api/v1/graph/unfollow - Unfollow a user
//! GET /api/v1/graph/followers/{user_id} - Users following a user
//! GET /api/v1/graph/following/{user_id} - Users a user is following
//! GET /api/v1/graph/counters/{user_id} - Follower/following counts
//! GET /api/v1/graph/is-following - Check a single edge

use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::CounterLookup;
use crate::domain::{PageRequest, Profile, UserCounters};
use crate::error::ServiceResult;
use crate::services::{FollowListPage, FollowStatus, UnfollowStatus};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct FollowRequest {
    pub initiator: Uuid,
    pub target: Uuid,
}

#[derive(Debug, Serialize)]
pub struct FollowResponse {
    pub status: FollowStatus,
    pub edge_created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct UnfollowResponse {
    pub status: UnfollowStatus,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct FollowListEntry {
    pub profile: Profile,
    pub followed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct FollowListResponse {
    pub items: Vec<FollowListEntry>,
    pub next_cursor: Option<String>,
}

impl From<FollowListPage> for FollowListResponse {
    fn from(page: FollowListPage) -> Self {
        Self {
            items: page
                .items
                .into_iter()
                .map(|item| FollowListEntry {
                    followed_at: item.edge.created_at,
                    profile: item.profile,
                })
                .collect(),
            next_cursor: page.next_cursor.map(|c| c.encode()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct IsFollowingQuery {
    pub follower: Uuid,
    pub followee: Uuid,
}

#[derive(Debug, Serialize)]
pub struct IsFollowingResponse {
    pub is_following: bool,
}

/// Drop cached counters of users touched by a mutation
async fn invalidate_counters(state: &AppState, user_ids: &[Uuid]) {
    if let Some(cache) = &state.cache {
        if let Err(e) = cache.invalidate(user_ids).await {
            warn!(error = %e, "Failed to invalidate cached counters");
        }
    }
}

pub async fn follow(
    state: web::Data<AppState>,
    body: web::Json<FollowRequest>,
) -> ServiceResult<HttpResponse> {
    let outcome = state.orchestrator.follow(body.initiator, body.target).await?;
    invalidate_counters(&state, &outcome.affected_users).await;

    info!(
        follower = %body.initiator,
        followee = %body.target,
        status = outcome.status.as_str(),
        "Follow request handled"
    );

    let response = FollowResponse {
        status: outcome.status,
        edge_created_at: outcome.edge_created_at(),
    };
    Ok(match outcome.status {
        FollowStatus::Partial => HttpResponse::Accepted().json(response),
        _ => HttpResponse::Ok().json(response),
    })
}

pub async fn unfollow(
    state: web::Data<AppState>,
    body: web::Json<FollowRequest>,
) -> ServiceResult<HttpResponse> {
    let outcome = state.orchestrator.unfollow(body.initiator, body.target).await?;
    invalidate_counters(&state, &outcome.affected_users).await;

    info!(
        follower = %body.initiator,
        followee = %body.target,
        status = outcome.status.as_str(),
        "Unfollow request handled"
    );

    let response = UnfollowResponse {
        status: outcome.status,
    };
    Ok(match outcome.status {
        UnfollowStatus::Partial => HttpResponse::Accepted().json(response),
        _ => HttpResponse::Ok().json(response),
    })
}

pub async fn get_followers(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    query: web::Query<ListQuery>,
) -> ServiceResult<HttpResponse> {
    let page = PageRequest::from_query(query.cursor.as_deref(), query.limit)?;
    let result = state.queries.get_followers(path.into_inner(), page).await?;
    Ok(HttpResponse::Ok().json(FollowListResponse::from(result)))
}

pub async fn get_following(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    query: web::Query<ListQuery>,
) -> ServiceResult<HttpResponse> {
    let page = PageRequest::from_query(query.cursor.as_deref(), query.limit)?;
    let result = state.queries.get_following(path.into_inner(), page).await?;
    Ok(HttpResponse::Ok().json(FollowListResponse::from(result)))
}

/// Counters with Redis read-through when the cache is configured
pub async fn get_counters(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ServiceResult<HttpResponse> {
    let user_id = path.into_inner();

    let mut fill_generation = None;
    if let Some(cache) = &state.cache {
        match cache.get(user_id).await {
            Ok(CounterLookup::Hit(counters)) => return Ok(HttpResponse::Ok().json(counters)),
            Ok(CounterLookup::Miss { generation }) => fill_generation = Some(generation),
            Err(e) => warn!(user = %user_id, error = %e, "Redis counter read failed, using store"),
        }
    }

    let counters: UserCounters = state.queries.get_counters(user_id).await?;

    if let (Some(cache), Some(generation)) = (&state.cache, fill_generation) {
        match cache.fill(user_id, counters, generation).await {
            Ok(true) => {}
            Ok(false) => debug!(user = %user_id, "Counters changed since read; cache not filled"),
            Err(e) => warn!(user = %user_id, error = %e, "Failed to warm counter cache"),
        }
    }

    Ok(HttpResponse::Ok().json(counters))
}

pub async fn is_following(
    state: web::Data<AppState>,
    query: web::Query<IsFollowingQuery>,
) -> ServiceResult<HttpResponse> {
    let is_following = state
        .queries
        .is_following(query.follower, query.followee)
        .await?;
    Ok(HttpResponse::Ok().json(IsFollowingResponse { is_following }))
}
