use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Public profile as served by the user directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Profile {
    pub id: Uuid,
    pub display_name: String,
    pub handle: String,
    pub avatar_url: Option<String>,
}

impl Profile {
    pub fn new(id: Uuid, display_name: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            handle: handle.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, avatar_url: impl Into<String>) -> Self {
        self.avatar_url = Some(avatar_url.into());
        self
    }
}

/// Denormalized follow counters of one user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserCounters {
    pub follower_count: i64,
    pub following_count: i64,
}

impl UserCounters {
    pub fn new(follower_count: i64, following_count: i64) -> Self {
        Self {
            follower_count,
            following_count,
        }
    }

    /// Apply `delta` to `field`, never going below zero.
    pub fn apply(&mut self, field: CounterField, delta: i64) -> i64 {
        let slot = match field {
            CounterField::Followers => &mut self.follower_count,
            CounterField::Following => &mut self.following_count,
        };
        *slot = slot.saturating_add(delta).max(0);
        *slot
    }
}

/// What a keyed counter write did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterApplication {
    Applied,
    /// The key was already recorded; no counter moved
    Duplicate,
    /// The change being reversed was never applied. Its key is now recorded
    /// as well, so neither direction moves a counter.
    Voided,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterField {
    Followers,
    Following,
}

impl CounterField {
    /// Column holding this counter in the `users` table
    pub fn column(&self) -> &'static str {
        match self {
            CounterField::Followers => "follower_count",
            CounterField::Following => "following_count",
        }
    }
}

/// A signed change to one counter of one user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDelta {
    pub user_id: Uuid,
    pub field: CounterField,
    pub delta: i64,
}

impl CounterDelta {
    pub fn new(user_id: Uuid, field: CounterField, delta: i64) -> Self {
        Self {
            user_id,
            field,
            delta,
        }
    }

    /// Sort deltas by user so concurrent multi-user updates lock rows in the
    /// same order.
    pub fn lock_order(deltas: &[CounterDelta]) -> Vec<CounterDelta> {
        let mut ordered = deltas.to_vec();
        ordered.sort_by_key(|d| (d.user_id, d.field));
        ordered
    }
}
