//! Follow graph consistency properties, exercised end to end on the
//! in-memory backends.

use async_trait::async_trait;
use follow_service::config::ReconciliationConfig;
use follow_service::domain::{
    CounterApplication, CounterDelta, CounterField, PageRequest, Profile, UserCounters,
};
use follow_service::error::{DirectoryError, ReconcileError, ServiceError};
use follow_service::repository::{
    CounterStore, InMemoryRelationStore, InMemoryUserDirectory, RelationStore,
};
use follow_service::services::{FollowStatus, OperationState, UnfollowStatus};
use follow_service::state::AppState;
use follow_service::workers::{CycleReport, ReconciliationWorker};
use futures::future::join_all;
use idempotent_consumer::IdempotencyKey;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

const STEP_TIMEOUT: Duration = Duration::from_millis(100);

/// Counter store that fails, delays or stalls a configurable number of calls
struct FlakyCounterStore {
    inner: Arc<InMemoryUserDirectory>,
    fail_next: AtomicUsize,
    delay_next: AtomicUsize,
    stall_next: AtomicUsize,
    stall_reads: AtomicUsize,
}

impl FlakyCounterStore {
    fn new(inner: Arc<InMemoryUserDirectory>) -> Self {
        Self {
            inner,
            fail_next: AtomicUsize::new(0),
            delay_next: AtomicUsize::new(0),
            stall_next: AtomicUsize::new(0),
            stall_reads: AtomicUsize::new(0),
        }
    }

    fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Hold the next `n` keyed writes for 200ms before they reach the store
    fn delay_next(&self, n: usize) {
        self.delay_next.store(n, Ordering::SeqCst);
    }

    fn stall_next(&self, n: usize) {
        self.stall_next.store(n, Ordering::SeqCst);
    }

    fn stall_reads(&self, n: usize) {
        self.stall_reads.store(n, Ordering::SeqCst);
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn before_write(&self) -> Result<(), DirectoryError> {
        if Self::take(&self.fail_next) {
            return Err(DirectoryError::Unavailable("injected failure".into()));
        }
        if Self::take(&self.delay_next) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        if Self::take(&self.stall_next) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for FlakyCounterStore {
    async fn apply_counter_delta(
        &self,
        user_id: Uuid,
        field: CounterField,
        delta: i64,
    ) -> Result<i64, DirectoryError> {
        self.inner.apply_counter_delta(user_id, field, delta).await
    }

    async fn apply_deltas_once(
        &self,
        key: &IdempotencyKey,
        deltas: &[CounterDelta],
    ) -> Result<bool, DirectoryError> {
        self.before_write().await?;
        self.inner.apply_deltas_once(key, deltas).await
    }

    async fn reverse_deltas_once(
        &self,
        key: &IdempotencyKey,
        reverses: &IdempotencyKey,
        deltas: &[CounterDelta],
    ) -> Result<CounterApplication, DirectoryError> {
        self.before_write().await?;
        self.inner.reverse_deltas_once(key, reverses, deltas).await
    }

    async fn get_counters(&self, user_id: Uuid) -> Result<Option<UserCounters>, DirectoryError> {
        if Self::take(&self.stall_reads) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        self.inner.get_counters(user_id).await
    }

    async fn overwrite_counters(
        &self,
        user_id: Uuid,
        counters: UserCounters,
    ) -> Result<bool, DirectoryError> {
        self.inner.overwrite_counters(user_id, counters).await
    }
}

struct Harness {
    state: AppState,
    directory: Arc<InMemoryUserDirectory>,
    relations: Arc<InMemoryRelationStore>,
    counters: Arc<FlakyCounterStore>,
}

impl Harness {
    fn new() -> Self {
        Self::with_step_timeout(STEP_TIMEOUT)
    }

    fn with_step_timeout(step_timeout: Duration) -> Self {
        let directory = Arc::new(InMemoryUserDirectory::new());
        let relations = Arc::new(InMemoryRelationStore::new());
        let counters = Arc::new(FlakyCounterStore::new(directory.clone()));
        let state = AppState::new(
            relations.clone(),
            directory.clone(),
            counters.clone(),
            step_timeout,
        );
        Self {
            state,
            directory,
            relations,
            counters,
        }
    }

    fn user(&self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.directory
            .insert_profile(Profile::new(id, name, name.to_lowercase()));
        id
    }

    async fn counters(&self, user: Uuid) -> UserCounters {
        self.directory.get_counters(user).await.unwrap().unwrap()
    }

    async fn reconcile(&self) -> CycleReport {
        let mut worker = ReconciliationWorker::new(
            self.state.maintainer.clone(),
            self.state.directory.clone(),
            self.state.drift.clone(),
            &ReconciliationConfig {
                enabled: true,
                interval_secs: 60,
                sweep_batch: 10,
            },
        );
        worker.run_cycle().await
    }

    async fn follower_ids(&self, user: Uuid) -> Vec<Uuid> {
        self.state
            .queries
            .get_followers(user, PageRequest::default())
            .await
            .unwrap()
            .items
            .into_iter()
            .map(|item| item.profile.id)
            .collect()
    }
}

#[tokio::test]
async fn follow_increments_both_counters_and_lists_the_follower() {
    let h = Harness::new();
    let (a, b) = (h.user("A"), h.user("B"));

    let outcome = h.state.orchestrator.follow(a, b).await.unwrap();

    assert_eq!(outcome.status, FollowStatus::Done);
    assert_eq!(outcome.state, OperationState::Done);
    assert_eq!(h.counters(a).await, UserCounters::new(0, 1));
    assert_eq!(h.counters(b).await, UserCounters::new(1, 0));
    assert_eq!(h.follower_ids(b).await, vec![a]);
    assert!(h.state.queries.is_following(a, b).await.unwrap());
}

#[tokio::test]
async fn follow_twice_equals_follow_once() {
    let h = Harness::new();
    let (a, b) = (h.user("A"), h.user("B"));

    let first = h.state.orchestrator.follow(a, b).await.unwrap();
    let second = h.state.orchestrator.follow(a, b).await.unwrap();

    assert_eq!(second.status, FollowStatus::AlreadyFollowing);
    assert_eq!(second.edge, first.edge);
    assert_eq!(h.relations.len(), 1);
    assert_eq!(h.counters(b).await, UserCounters::new(1, 0));
    assert_eq!(h.counters(a).await, UserCounters::new(0, 1));
}

#[tokio::test]
async fn unfollow_without_edge_is_a_no_op() {
    let h = Harness::new();
    let (a, b) = (h.user("A"), h.user("B"));

    let outcome = h.state.orchestrator.unfollow(a, b).await.unwrap();

    assert_eq!(outcome.status, UnfollowStatus::NotFollowing);
    assert!(outcome.removed_edge.is_none());
    assert_eq!(h.counters(a).await, UserCounters::default());
    assert_eq!(h.counters(b).await, UserCounters::default());
}

#[tokio::test]
async fn follow_then_unfollow_restores_state() {
    let h = Harness::new();
    let (a, b) = (h.user("A"), h.user("B"));

    h.state.orchestrator.follow(a, b).await.unwrap();
    let outcome = h.state.orchestrator.unfollow(a, b).await.unwrap();

    assert_eq!(outcome.status, UnfollowStatus::Done);
    assert!(h.relations.is_empty());
    assert_eq!(h.counters(a).await, UserCounters::default());
    assert_eq!(h.counters(b).await, UserCounters::default());
    assert!(h.follower_ids(b).await.is_empty());

    // a second unfollow only re-drives the already applied decrement
    let again = h.state.orchestrator.unfollow(a, b).await.unwrap();
    assert_eq!(again.status, UnfollowStatus::NotFollowing);
    assert_eq!(h.counters(b).await, UserCounters::default());
}

#[tokio::test]
async fn refollow_after_unfollow_counts_again() {
    let h = Harness::new();
    let (a, b) = (h.user("A"), h.user("B"));

    let first = h.state.orchestrator.follow(a, b).await.unwrap();
    h.state.orchestrator.unfollow(a, b).await.unwrap();
    let second = h.state.orchestrator.follow(a, b).await.unwrap();

    assert_eq!(second.status, FollowStatus::Done);
    assert_ne!(first.edge.id, second.edge.id);
    assert_eq!(h.counters(b).await, UserCounters::new(1, 0));
}

#[tokio::test]
async fn self_follow_is_rejected_without_state_change() {
    let h = Harness::new();
    let a = h.user("A");

    let result = h.state.orchestrator.follow(a, a).await;

    assert!(matches!(result, Err(ServiceError::InvalidRequest(_))));
    assert!(h.relations.is_empty());
    assert_eq!(h.counters(a).await, UserCounters::default());
}

#[tokio::test]
async fn counters_never_go_negative() {
    let h = Harness::new();
    let (a, b) = (h.user("A"), h.user("B"));

    h.state.orchestrator.follow(a, b).await.unwrap();
    // drift: the counters were lost before the unfollow
    h.directory.force_counters(b, UserCounters::default());
    h.directory.force_counters(a, UserCounters::default());

    h.state.orchestrator.unfollow(a, b).await.unwrap();

    assert_eq!(h.counters(a).await, UserCounters::default());
    assert_eq!(h.counters(b).await, UserCounters::default());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_follows_of_one_pair_create_one_edge() {
    let h = Harness::new();
    let (a, b) = (h.user("A"), h.user("B"));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let orchestrator = h.state.orchestrator.clone();
            tokio::spawn(async move { orchestrator.follow(a, b).await })
        })
        .collect();

    let mut done = 0;
    for result in join_all(handles).await {
        let outcome = result.unwrap().unwrap();
        if outcome.status == FollowStatus::Done {
            done += 1;
        } else {
            assert_eq!(outcome.status, FollowStatus::AlreadyFollowing);
        }
    }

    assert_eq!(done, 1);
    assert_eq!(h.relations.len(), 1);
    assert_eq!(h.counters(b).await, UserCounters::new(1, 0));
    assert_eq!(h.counters(a).await, UserCounters::new(0, 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_follows_of_one_target_are_all_counted() {
    let h = Harness::new();
    let target = h.user("Target");
    let followers: Vec<Uuid> = (0..25).map(|i| h.user(&format!("F{}", i))).collect();

    let handles: Vec<_> = followers
        .iter()
        .map(|&follower| {
            let orchestrator = h.state.orchestrator.clone();
            tokio::spawn(async move { orchestrator.follow(follower, target).await })
        })
        .collect();
    for result in join_all(handles).await {
        assert_eq!(result.unwrap().unwrap().status, FollowStatus::Done);
    }

    assert_eq!(h.counters(target).await, UserCounters::new(25, 0));
    let recomputed = h.state.maintainer.recompute_counters(target).await.unwrap();
    assert!(!recomputed.corrected());
}

#[tokio::test]
async fn recompute_matches_direct_edge_count() {
    let h = Harness::new();
    let users: Vec<Uuid> = (0..4).map(|i| h.user(&format!("U{}", i))).collect();
    h.state.orchestrator.follow(users[0], users[1]).await.unwrap();
    h.state.orchestrator.follow(users[2], users[1]).await.unwrap();
    h.state.orchestrator.follow(users[1], users[3]).await.unwrap();
    h.directory.force_counters(users[1], UserCounters::new(40, 0));

    let result = h.state.maintainer.recompute_counters(users[1]).await.unwrap();

    let expected = UserCounters::new(
        h.relations.count_followers(users[1]).await.unwrap(),
        h.relations.count_following(users[1]).await.unwrap(),
    );
    assert_eq!(expected, UserCounters::new(2, 1));
    assert_eq!(result.current, expected);
    assert_eq!(h.counters(users[1]).await, expected);
}

#[tokio::test]
async fn listing_omits_deleted_profiles_without_error() {
    let h = Harness::new();
    let target = h.user("Target");
    let (kept, deleted) = (h.user("Kept"), h.user("Deleted"));
    h.state.orchestrator.follow(kept, target).await.unwrap();
    h.state.orchestrator.follow(deleted, target).await.unwrap();

    h.directory.remove_profile(deleted);

    assert_eq!(h.follower_ids(target).await, vec![kept]);
    // counters still reflect both edges until the edge itself goes away
    assert_eq!(h.counters(target).await, UserCounters::new(2, 0));
}

#[tokio::test]
async fn retry_after_partial_follow_heals_without_double_counting() {
    let h = Harness::new();
    let (a, b) = (h.user("A"), h.user("B"));
    h.counters.fail_next(1);

    let partial = h.state.orchestrator.follow(a, b).await.unwrap();
    assert_eq!(partial.status, FollowStatus::Partial);
    assert_eq!(partial.state, OperationState::EdgeWritten);
    assert_eq!(h.counters(b).await, UserCounters::default());
    assert!(h.state.drift.contains(a) && h.state.drift.contains(b));

    let retry = h.state.orchestrator.follow(a, b).await.unwrap();
    assert_eq!(retry.status, FollowStatus::AlreadyFollowing);
    assert_eq!(h.counters(b).await, UserCounters::new(1, 0));

    h.state.orchestrator.follow(a, b).await.unwrap();
    assert_eq!(h.counters(b).await, UserCounters::new(1, 0));
    assert_eq!(h.counters(a).await, UserCounters::new(0, 1));
}

#[tokio::test]
async fn retried_unfollow_applies_decrement_exactly_once() {
    let h = Harness::new();
    let (a, b) = (h.user("A"), h.user("B"));
    h.state.orchestrator.follow(a, b).await.unwrap();
    h.counters.fail_next(1);

    let partial = h.state.orchestrator.unfollow(a, b).await.unwrap();
    assert_eq!(partial.status, UnfollowStatus::Partial);
    assert_eq!(h.counters(b).await, UserCounters::new(1, 0));

    let retry = h.state.orchestrator.unfollow(a, b).await.unwrap();
    assert_eq!(retry.status, UnfollowStatus::NotFollowing);
    assert_eq!(h.counters(b).await, UserCounters::default());

    h.state.orchestrator.unfollow(a, b).await.unwrap();
    assert_eq!(h.counters(b).await, UserCounters::default());
    assert_eq!(h.counters(a).await, UserCounters::default());
}

#[tokio::test]
async fn counter_step_timeout_is_partial_and_reconciled() {
    let h = Harness::new();
    let (a, b) = (h.user("A"), h.user("B"));
    h.counters.stall_next(1);

    let outcome = h.state.orchestrator.follow(a, b).await.unwrap();
    assert_eq!(outcome.status, FollowStatus::Partial);
    assert!(h.relations.get_edge(a, b).await.unwrap().is_some());

    let report = h.reconcile().await;

    assert_eq!(report.corrected, 2);
    assert_eq!(h.counters(a).await, UserCounters::new(0, 1));
    assert_eq!(h.counters(b).await, UserCounters::new(1, 0));
}

#[tokio::test]
async fn unknown_target_is_rejected() {
    let h = Harness::new();
    let a = h.user("A");

    let result = h.state.orchestrator.follow(a, Uuid::new_v4()).await;

    assert!(matches!(result, Err(ServiceError::UnknownUser(_))));
    assert!(h.relations.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unfollow_overtaking_the_follow_counter_step_keeps_counters_exact() {
    let h = Harness::with_step_timeout(Duration::from_secs(2));
    let (a, b) = (h.user("A"), h.user("B"));
    h.counters.delay_next(1);

    let orchestrator = h.state.orchestrator.clone();
    let follow = tokio::spawn(async move { orchestrator.follow(a, b).await });
    // the edge exists, its increment is still held back
    tokio::time::sleep(Duration::from_millis(50)).await;
    let unfollow = h.state.orchestrator.unfollow(a, b).await.unwrap();
    let follow = follow.await.unwrap().unwrap();

    assert_eq!(follow.status, FollowStatus::Done);
    assert_eq!(unfollow.status, UnfollowStatus::Done);
    assert!(h.relations.is_empty());
    assert_eq!(h.counters(a).await, UserCounters::default());
    assert_eq!(h.counters(b).await, UserCounters::default());
    for user in [a, b] {
        let recomputed = h.state.maintainer.recompute_counters(user).await.unwrap();
        assert!(!recomputed.corrected());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_follows_and_unfollows_keep_counters_exact() {
    let h = Harness::with_step_timeout(Duration::from_secs(2));
    let users: Vec<Uuid> = (0..4).map(|i| h.user(&format!("U{}", i))).collect();

    let handles: Vec<_> = (0..200)
        .map(|i| {
            let orchestrator = h.state.orchestrator.clone();
            let (follower, followee) = (users[i % 4], users[(i / 4 + i + 1) % 4]);
            let follow = i % 3 != 0;
            tokio::spawn(async move {
                if follower == followee {
                    return Ok(());
                }
                if follow {
                    orchestrator.follow(follower, followee).await.map(|_| ())
                } else {
                    orchestrator.unfollow(follower, followee).await.map(|_| ())
                }
            })
        })
        .collect();
    for result in join_all(handles).await {
        result.unwrap().unwrap();
    }

    for &user in &users {
        let counters = h.counters(user).await;
        assert!(counters.follower_count >= 0 && counters.following_count >= 0);
        let recomputed = h.state.maintainer.recompute_counters(user).await.unwrap();
        assert!(
            !recomputed.corrected(),
            "counters of {} drifted: {:?} -> {:?}",
            user,
            recomputed.previous,
            recomputed.current
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_follow_is_queued_for_reconciliation() {
    let h = Harness::with_step_timeout(Duration::from_secs(10));
    let (a, b) = (h.user("A"), h.user("B"));
    h.counters.stall_next(1);

    let orchestrator = h.state.orchestrator.clone();
    let follow = tokio::spawn(async move { orchestrator.follow(a, b).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    follow.abort();
    assert!(follow.await.unwrap_err().is_cancelled());

    assert!(h.relations.get_edge(a, b).await.unwrap().is_some());
    assert!(h.state.drift.contains(a) && h.state.drift.contains(b));

    let report = h.reconcile().await;
    assert_eq!(report.corrected, 2);
    assert_eq!(h.counters(a).await, UserCounters::new(0, 1));
    assert_eq!(h.counters(b).await, UserCounters::new(1, 0));
}

#[tokio::test]
async fn failed_redrive_of_existing_edge_still_reports_already_following() {
    let h = Harness::new();
    let (a, b) = (h.user("A"), h.user("B"));
    h.state.orchestrator.follow(a, b).await.unwrap();
    h.counters.fail_next(1);

    let outcome = h.state.orchestrator.follow(a, b).await.unwrap();

    assert_eq!(outcome.status, FollowStatus::AlreadyFollowing);
    assert!(h.state.drift.contains(a) && h.state.drift.contains(b));
    assert_eq!(h.counters(b).await, UserCounters::new(1, 0));
}

#[tokio::test]
async fn stalled_counter_reads_are_bounded() {
    let h = Harness::new();
    let a = h.user("A");

    h.counters.stall_reads(1);
    let started = Instant::now();
    let recomputed = h.state.maintainer.recompute_counters(a).await;
    assert!(matches!(
        recomputed,
        Err(ReconcileError::Directory(DirectoryError::Unavailable(_)))
    ));

    h.counters.stall_reads(1);
    let read = h.state.queries.get_counters(a).await;
    assert!(matches!(read, Err(ServiceError::Unavailable(_))));
    assert!(started.elapsed() < Duration::from_secs(2));
}
