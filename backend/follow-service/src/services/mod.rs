pub mod counters;
pub mod deadline;
pub mod follow;
pub mod graph_query;

pub use counters::{CounterMaintainer, DriftQueue, Recomputed};
pub use follow::{
    FollowOrchestrator, FollowOutcome, FollowStatus, OperationState, UnfollowOutcome,
    UnfollowStatus,
};
pub use graph_query::{FollowListItem, FollowListPage, GraphQueryService};
