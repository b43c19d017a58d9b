use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::counters::{CounterMaintainer, DriftQueue};
use super::deadline::with_deadline;
use crate::domain::{CounterApplication, Edge};
use crate::error::{DirectoryError, RelationError, ServiceError, ServiceResult};
use crate::metrics::OperationTimer;
use crate::repository::{RelationStore, UserDirectory};

/// Progress of one follow/unfollow call.
///
/// `Pending → EdgeWritten → CountersApplied → Done`, or `Pending → Failed`.
/// A partial operation stops in `EdgeWritten`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    EdgeWritten,
    CountersApplied,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FollowStatus {
    Done,
    AlreadyFollowing,
    /// Edge stored, counters not yet updated; safe to retry
    Partial,
}

impl FollowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FollowStatus::Done => "done",
            FollowStatus::AlreadyFollowing => "already-following",
            FollowStatus::Partial => "partial",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnfollowStatus {
    Done,
    NotFollowing,
    /// Edge removed, counters not yet updated; safe to retry
    Partial,
}

impl UnfollowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnfollowStatus::Done => "done",
            UnfollowStatus::NotFollowing => "not-following",
            UnfollowStatus::Partial => "partial",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowOutcome {
    pub status: FollowStatus,
    pub state: OperationState,
    /// The stored edge: new, or the existing one for `AlreadyFollowing`
    pub edge: Edge,
    /// Users whose lists and counters this call may have changed
    pub affected_users: Vec<Uuid>,
}

impl FollowOutcome {
    pub fn edge_created_at(&self) -> DateTime<Utc> {
        self.edge.created_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnfollowOutcome {
    pub status: UnfollowStatus,
    pub state: OperationState,
    /// The removed edge, or the pair's tombstone for `NotFollowing`
    pub removed_edge: Option<Edge>,
    pub affected_users: Vec<Uuid>,
}

struct Transitions {
    operation: &'static str,
    follower: Uuid,
    followee: Uuid,
    state: OperationState,
}

impl Transitions {
    fn start(operation: &'static str, follower: Uuid, followee: Uuid) -> Self {
        Self {
            operation,
            follower,
            followee,
            state: OperationState::Pending,
        }
    }

    fn advance(&mut self, next: OperationState) {
        debug!(
            operation = self.operation,
            follower = %self.follower,
            followee = %self.followee,
            from = ?self.state,
            to = ?next,
            "Follow operation state transition"
        );
        self.state = next;
    }
}

/// Public entry point for follow graph mutations.
///
/// Sequences the edge mutation and the counter update. The edge is the source
/// of truth: once written it is never rolled back, and a failed counter step
/// is reported as partial and queued for reconciliation.
#[derive(Clone)]
pub struct FollowOrchestrator {
    relations: Arc<dyn RelationStore>,
    directory: Arc<dyn UserDirectory>,
    counters: CounterMaintainer,
    drift: DriftQueue,
    step_timeout: Duration,
}

impl FollowOrchestrator {
    pub fn new(
        relations: Arc<dyn RelationStore>,
        directory: Arc<dyn UserDirectory>,
        counters: CounterMaintainer,
        drift: DriftQueue,
        step_timeout: Duration,
    ) -> Self {
        Self {
            relations,
            directory,
            counters,
            drift,
            step_timeout,
        }
    }

    pub async fn follow(&self, initiator: Uuid, target: Uuid) -> ServiceResult<FollowOutcome> {
        let timer = OperationTimer::start("follow");
        let result = self.run_follow(initiator, target).await;
        timer.finish(match &result {
            Ok(outcome) => outcome.status.as_str(),
            Err(e) => error_label(e),
        });
        result
    }

    pub async fn unfollow(&self, initiator: Uuid, target: Uuid) -> ServiceResult<UnfollowOutcome> {
        let timer = OperationTimer::start("unfollow");
        let result = self.run_unfollow(initiator, target).await;
        timer.finish(match &result {
            Ok(outcome) => outcome.status.as_str(),
            Err(e) => error_label(e),
        });
        result
    }

    async fn run_follow(&self, initiator: Uuid, target: Uuid) -> ServiceResult<FollowOutcome> {
        let mut transitions = Transitions::start("follow", initiator, target);
        if let Err(e) = validate_pair(initiator, target) {
            transitions.advance(OperationState::Failed);
            return Err(e);
        }

        let profile = with_deadline(
            self.step_timeout,
            "get_profile",
            self.directory.get_profile(target),
        )
        .await;
        match profile {
            Ok(Some(_)) => {}
            Ok(None) => {
                transitions.advance(OperationState::Failed);
                return Err(ServiceError::UnknownUser(target));
            }
            Err(e) => {
                transitions.advance(OperationState::Failed);
                return Err(e.into());
            }
        }

        let affected_users = vec![initiator, target];
        let repair = PendingRepair::arm(&self.drift, &affected_users);
        let created = with_deadline(
            self.step_timeout,
            "create_edge",
            self.relations.create_edge(initiator, target),
        )
        .await;
        let (edge, mut status) = match created {
            Ok(edge) => (edge, FollowStatus::Done),
            Err(RelationError::AlreadyExists(existing)) => {
                (existing, FollowStatus::AlreadyFollowing)
            }
            Err(e) => {
                // a timed out write may still have landed; the guard queues the pair
                transitions.advance(OperationState::Failed);
                return Err(e.into());
            }
        };
        transitions.advance(OperationState::EdgeWritten);

        // Re-driven for an existing edge too: the key makes it a no-op unless
        // an earlier attempt stopped before its counters were applied.
        let applied = with_deadline(
            self.step_timeout,
            "on_edge_created",
            self.counters.on_edge_created(&edge),
        )
        .await;
        repair.disarm();

        match applied {
            Ok(application) => {
                if status == FollowStatus::AlreadyFollowing
                    && application == CounterApplication::Applied
                {
                    // reconciliation may already have counted this edge
                    info!(edge = %edge.id, "Applied missing counter update for existing edge");
                    self.drift.mark(&affected_users);
                }
                transitions.advance(OperationState::CountersApplied);
                transitions.advance(OperationState::Done);
            }
            Err(e) if status == FollowStatus::AlreadyFollowing => {
                self.mark_lagging("follow", &edge, &affected_users, &e);
            }
            Err(e) => {
                self.mark_lagging("follow", &edge, &affected_users, &e);
                status = FollowStatus::Partial;
            }
        }

        Ok(FollowOutcome {
            status,
            state: transitions.state,
            edge,
            affected_users,
        })
    }

    async fn run_unfollow(&self, initiator: Uuid, target: Uuid) -> ServiceResult<UnfollowOutcome> {
        let mut transitions = Transitions::start("unfollow", initiator, target);
        if let Err(e) = validate_pair(initiator, target) {
            transitions.advance(OperationState::Failed);
            return Err(e);
        }

        let affected_users = vec![initiator, target];
        let repair = PendingRepair::arm(&self.drift, &affected_users);
        let deleted = with_deadline(
            self.step_timeout,
            "delete_edge",
            self.relations.delete_edge(initiator, target),
        )
        .await;
        let (removed_edge, mut status) = match deleted {
            Ok(edge) => (Some(edge), UnfollowStatus::Done),
            Err(RelationError::NotFound { tombstone }) => (tombstone, UnfollowStatus::NotFollowing),
            Err(e) => {
                transitions.advance(OperationState::Failed);
                return Err(e.into());
            }
        };
        transitions.advance(OperationState::EdgeWritten);

        let edge = match removed_edge {
            Some(edge) => edge,
            None => {
                repair.disarm();
                transitions.advance(OperationState::CountersApplied);
                transitions.advance(OperationState::Done);
                return Ok(UnfollowOutcome {
                    status,
                    state: transitions.state,
                    removed_edge: None,
                    affected_users,
                });
            }
        };

        let applied = with_deadline(
            self.step_timeout,
            "on_edge_removed",
            self.counters.on_edge_removed(&edge),
        )
        .await;
        repair.disarm();

        match applied {
            Ok(application) => {
                if application == CounterApplication::Voided {
                    // the follow that created this edge never counted it, but
                    // reconciliation may have
                    info!(edge = %edge.id, "Edge removed before its counters were applied");
                    self.drift.mark(&affected_users);
                }
                transitions.advance(OperationState::CountersApplied);
                transitions.advance(OperationState::Done);
            }
            Err(e) if status == UnfollowStatus::NotFollowing => {
                self.mark_lagging("unfollow", &edge, &affected_users, &e);
            }
            Err(e) => {
                self.mark_lagging("unfollow", &edge, &affected_users, &e);
                status = UnfollowStatus::Partial;
            }
        }

        Ok(UnfollowOutcome {
            status,
            state: transitions.state,
            removed_edge: Some(edge),
            affected_users,
        })
    }

    fn mark_lagging(
        &self,
        operation: &'static str,
        edge: &Edge,
        users: &[Uuid],
        error: &DirectoryError,
    ) {
        warn!(
            operation,
            edge = %edge.id,
            follower = %edge.follower_id,
            followee = %edge.followee_id,
            error = %error,
            "Counter update failed after edge mutation; queued for reconciliation"
        );
        self.drift.mark(users);
    }
}

/// Queues the pair for reconciliation when dropped while armed: covers a
/// request cancelled between the edge mutation and its counter step.
struct PendingRepair<'a> {
    drift: &'a DriftQueue,
    users: &'a [Uuid],
    armed: bool,
}

impl<'a> PendingRepair<'a> {
    fn arm(drift: &'a DriftQueue, users: &'a [Uuid]) -> Self {
        Self {
            drift,
            users,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingRepair<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(users = ?self.users, "Follow operation interrupted; queued for reconciliation");
            self.drift.mark(self.users);
        }
    }
}

fn validate_pair(initiator: Uuid, target: Uuid) -> ServiceResult<()> {
    if initiator.is_nil() || target.is_nil() {
        return Err(ServiceError::InvalidRequest("user ids must not be nil".to_string()));
    }
    if initiator == target {
        return Err(ServiceError::InvalidRequest("a user cannot follow themselves".to_string()));
    }
    Ok(())
}

fn error_label(error: &ServiceError) -> &'static str {
    match error {
        ServiceError::InvalidRequest(_) => "invalid_request",
        ServiceError::UnknownUser(_) => "unknown_user",
        ServiceError::Unavailable(_) => "unavailable",
        ServiceError::Internal(_) => "internal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Profile;
    use crate::repository::{
        CounterStore, InMemoryRelationStore, InMemoryUserDirectory, MockCounterStore, MockRelationStore,
    };

    const STEP_TIMEOUT: Duration = Duration::from_millis(200);

    fn users(directory: &InMemoryUserDirectory) -> (Uuid, Uuid) {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        directory.insert_profile(Profile::new(a, "A", "a"));
        directory.insert_profile(Profile::new(b, "B", "b"));
        (a, b)
    }

    #[tokio::test]
    async fn test_counter_failure_reports_partial() {
        let directory = Arc::new(InMemoryUserDirectory::new());
        let relations = Arc::new(InMemoryRelationStore::new());
        let (a, b) = users(&directory);

        let mut counters = MockCounterStore::new();
        counters
            .expect_apply_deltas_once()
            .times(1)
            .returning(|_, _| Err(DirectoryError::Unavailable("connection reset".into())));
        let drift = DriftQueue::new();
        let orchestrator = FollowOrchestrator::new(
            relations.clone(),
            directory,
            CounterMaintainer::new(Arc::new(counters), relations.clone()),
            drift.clone(),
            STEP_TIMEOUT,
        );

        let outcome = orchestrator.follow(a, b).await.unwrap();

        assert_eq!(outcome.status, FollowStatus::Partial);
        assert_eq!(outcome.state, OperationState::EdgeWritten);
        assert!(relations.get_edge(a, b).await.unwrap().is_some());
        assert!(drift.contains(a) && drift.contains(b));
    }

    #[tokio::test]
    async fn test_edge_store_failure_is_unavailable() {
        let directory = Arc::new(InMemoryUserDirectory::new());
        let (a, b) = users(&directory);

        let mut relations = MockRelationStore::new();
        relations
            .expect_create_edge()
            .returning(|_, _| Err(RelationError::Unavailable("pool timed out".into())));
        let relations: Arc<dyn RelationStore> = Arc::new(relations);
        let orchestrator = FollowOrchestrator::new(
            relations.clone(),
            directory.clone(),
            CounterMaintainer::new(directory.clone(), relations),
            DriftQueue::new(),
            STEP_TIMEOUT,
        );

        let result = orchestrator.follow(a, b).await;

        assert!(matches!(result, Err(ServiceError::Unavailable(_))));
        assert_eq!(
            directory.get_counters(a).await.unwrap().unwrap().following_count,
            0
        );
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let directory = Arc::new(InMemoryUserDirectory::new());
        let relations = Arc::new(InMemoryRelationStore::new());
        let (a, _) = users(&directory);
        let orchestrator = FollowOrchestrator::new(
            relations.clone(),
            directory.clone(),
            CounterMaintainer::new(directory, relations.clone()),
            DriftQueue::new(),
            STEP_TIMEOUT,
        );

        let result = orchestrator.follow(a, Uuid::new_v4()).await;

        assert!(matches!(result, Err(ServiceError::UnknownUser(_))));
        assert!(relations.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_nil_and_self() {
        let directory = Arc::new(InMemoryUserDirectory::new());
        let relations = Arc::new(InMemoryRelationStore::new());
        let (a, _) = users(&directory);
        let orchestrator = FollowOrchestrator::new(
            relations.clone(),
            directory.clone(),
            CounterMaintainer::new(directory, relations),
            DriftQueue::new(),
            STEP_TIMEOUT,
        );

        assert!(matches!(
            orchestrator.follow(a, a).await,
            Err(ServiceError::InvalidRequest(_))
        ));
        assert!(matches!(
            orchestrator.unfollow(Uuid::nil(), a).await,
            Err(ServiceError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&FollowStatus::AlreadyFollowing).unwrap(),
            "\"already-following\""
        );
        assert_eq!(
            serde_json::to_string(&UnfollowStatus::NotFollowing).unwrap(),
            "\"not-following\""
        );
        assert_eq!(FollowStatus::Partial.as_str(), "partial");
    }
}
