//! # Idempotent Consumer Library
//!
//! Exactly-once application of side effects that are triggered by retryable
//! operations. A side effect is identified by an [`IdempotencyKey`]; the key
//! is claimed inside the same PostgreSQL transaction that performs the side
//! effect, so either both become visible or neither does.
//!
//! ## Architecture
//!
//! ```text
//! Edge mutation → IdempotencyKey → BEGIN
//!                                    ├─ INSERT processed_events (ON CONFLICT DO NOTHING)
//!                                    ├─ side effect (only when the key was claimed)
//!                                  COMMIT
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use idempotent_consumer::{ClaimResult, IdempotencyGuard, IdempotencyKey};
//! use uuid::Uuid;
//!
//! # async fn example(
//! #     pool: sqlx::PgPool,
//! #     edge_id: Uuid,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let guard = IdempotencyGuard::new(pool.clone());
//! let key = IdempotencyKey::derive("follow.created", edge_id);
//!
//! let mut tx = pool.begin().await?;
//! match guard.claim(&mut tx, &key, None).await? {
//!     ClaimResult::Claimed => {
//!         // apply the side effect on `tx`
//!         tx.commit().await?;
//!     }
//!     ClaimResult::AlreadyClaimed => {
//!         tx.rollback().await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Safety
//!
//! Ten transactions claiming the same key concurrently: the first INSERT
//! wins, the other nine block on the unique index until it commits and then
//! observe `AlreadyClaimed`. If the winner rolls back, one of the waiters
//! claims the key instead.
//!
//! Claimed keys are never expired: a key that disappears would let a late
//! retry apply its side effect a second time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

mod error;

pub use error::{IdempotencyError, IdempotencyResult};

/// Maximum length of a key, matches the `processed_events.event_id` column.
pub const MAX_KEY_LEN: usize = 255;

/// Identifier of one logical side effect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Build a key from an arbitrary string, validating its shape.
    pub fn new(raw: impl Into<String>) -> IdempotencyResult<Self> {
        let raw = raw.into();
        Self::validate(&raw)?;
        Ok(Self(raw))
    }

    /// Derive a key from an operation scope and the id of the entity it
    /// applies to, e.g. `follow.created:6f1c…`.
    pub fn derive(scope: &'static str, entity_id: Uuid) -> Self {
        Self(format!("{}:{}", scope, entity_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(raw: &str) -> IdempotencyResult<()> {
        if raw.trim().is_empty() {
            return Err(IdempotencyError::InvalidKey(
                "key cannot be empty".to_string(),
            ));
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(IdempotencyError::InvalidKey(format!(
                "key exceeds {} characters (got {})",
                MAX_KEY_LEN,
                raw.len()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of claiming a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResult {
    /// First claim: the caller owns the side effect.
    Claimed,
    /// The key was recorded before; the side effect must not run again.
    AlreadyClaimed,
}

impl ClaimResult {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimResult::Claimed)
    }
}

/// A claimed key as stored in `processed_events`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub event_id: String,
    pub processed_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

/// Records claimed idempotency keys in PostgreSQL.
///
/// Cheap to clone; shares the underlying pool.
#[derive(Clone)]
pub struct IdempotencyGuard {
    pool: PgPool,
}

impl IdempotencyGuard {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Claim `key` inside `tx`.
    ///
    /// The claim only becomes durable when `tx` commits, together with
    /// whatever side effect the caller performed on the same transaction.
    pub async fn claim(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &IdempotencyKey,
        metadata: Option<serde_json::Value>,
    ) -> IdempotencyResult<ClaimResult> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, processed_at, metadata)
            VALUES ($1, NOW(), $2)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(key.as_str())
        .bind(metadata)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            debug!(key = %key, "Idempotency key already claimed");
            Ok(ClaimResult::AlreadyClaimed)
        } else {
            debug!(key = %key, "Idempotency key claimed");
            Ok(ClaimResult::Claimed)
        }
    }

    /// Whether `key` has been claimed by a committed transaction.
    pub async fn is_claimed(&self, key: &IdempotencyKey) -> IdempotencyResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM processed_events WHERE event_id = $1
            ) AS exists
            "#,
        )
        .bind(key.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("exists")?)
    }

    /// Fetch the stored record for `key`, if any.
    pub async fn get(&self, key: &IdempotencyKey) -> IdempotencyResult<Option<ProcessedEvent>> {
        let row = sqlx::query(
            r#"
            SELECT event_id, processed_at, metadata
            FROM processed_events
            WHERE event_id = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(ProcessedEvent {
                event_id: row.try_get("event_id")?,
                processed_at: row.try_get("processed_at")?,
                metadata: row.try_get("metadata")?,
            })
        })
        .transpose()
    }
}
