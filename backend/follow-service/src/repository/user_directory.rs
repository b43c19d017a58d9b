use async_trait::async_trait;
use idempotent_consumer::{ClaimResult, IdempotencyGuard, IdempotencyKey};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{CounterStore, UserDirectory};
use crate::domain::{CounterApplication, CounterDelta, CounterField, Profile, UserCounters};
use crate::error::DirectoryError;

/// PostgreSQL-backed user directory: profiles and follow counters live on
/// the same `users` row.
#[derive(Clone)]
pub struct PostgresUserDirectory {
    pool: PgPool,
    guard: IdempotencyGuard,
}

impl PostgresUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        let guard = IdempotencyGuard::new(pool.clone());
        Self { pool, guard }
    }

    /// Insert or refresh a profile. Counters of an existing row are kept.
    pub async fn upsert_profile(&self, profile: &Profile) -> Result<(), DirectoryError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, display_name, handle, avatar_url, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            ON CONFLICT (id) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                handle = EXCLUDED.handle,
                avatar_url = EXCLUDED.avatar_url,
                deleted_at = NULL,
                updated_at = NOW()
            "#,
        )
        .bind(profile.id)
        .bind(&profile.display_name)
        .bind(&profile.handle)
        .bind(&profile.avatar_url)
        .execute(&self.pool)
        .await?;

        debug!("Upserted user in PostgreSQL: {} ({})", profile.id, profile.handle);
        Ok(())
    }

    /// Hide a profile from lookups; its edges and counters stay in place.
    pub async fn soft_delete_user(&self, user_id: Uuid) -> Result<(), DirectoryError> {
        sqlx::query("UPDATE users SET deleted_at = NOW(), updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        debug!("Soft deleted user in PostgreSQL: {}", user_id);
        Ok(())
    }

    /// Apply deltas in lock order; users without a row are skipped.
    async fn apply_all_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        key: &IdempotencyKey,
        deltas: &[CounterDelta],
    ) -> Result<(), DirectoryError> {
        for delta in CounterDelta::lock_order(deltas) {
            if Self::apply_delta_in_tx(tx, &delta).await?.is_none() {
                warn!(
                    user = %delta.user_id,
                    key = %key,
                    "Skipping counter delta for user without a users row"
                );
            }
        }
        Ok(())
    }

    async fn apply_delta_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        delta: &CounterDelta,
    ) -> Result<Option<i64>, DirectoryError> {
        let column = delta.field.column();
        let value: Option<i64> = sqlx::query_scalar(&format!(
            r#"
            UPDATE users
            SET {column} = GREATEST({column} + $2, 0), updated_at = NOW()
            WHERE id = $1
            RETURNING {column}
            "#,
            column = column
        ))
        .bind(delta.user_id)
        .bind(delta.delta)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(value)
    }
}

#[async_trait]
impl UserDirectory for PostgresUserDirectory {
    async fn get_profile(&self, user_id: Uuid) -> Result<Option<Profile>, DirectoryError> {
        let profile = sqlx::query_as::<_, Profile>(
            r#"
            SELECT id, display_name, handle, avatar_url
            FROM users
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(profile)
    }

    async fn get_profiles_batch(
        &self,
        user_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Profile>, DirectoryError> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let profiles = sqlx::query_as::<_, Profile>(
            r#"
            SELECT id, display_name, handle, avatar_url
            FROM users
            WHERE id = ANY($1) AND deleted_at IS NULL
            "#,
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(profiles.into_iter().map(|p| (p.id, p)).collect())
    }

    async fn list_user_ids(
        &self,
        after: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<Uuid>, DirectoryError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM users
            WHERE ($1::uuid IS NULL OR id > $1)
            ORDER BY id
            LIMIT $2
            "#,
        )
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn health_check(&self) -> Result<(), DirectoryError> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CounterStore for PostgresUserDirectory {
    async fn apply_counter_delta(
        &self,
        user_id: Uuid,
        field: CounterField,
        delta: i64,
    ) -> Result<i64, DirectoryError> {
        let mut tx = self.pool.begin().await?;
        let value =
            Self::apply_delta_in_tx(&mut tx, &CounterDelta::new(user_id, field, delta)).await?;
        tx.commit().await?;

        Ok(value.unwrap_or_else(|| {
            warn!(user = %user_id, field = ?field, "Counter delta for user without a users row");
            0
        }))
    }

    async fn apply_deltas_once(
        &self,
        key: &IdempotencyKey,
        deltas: &[CounterDelta],
    ) -> Result<bool, DirectoryError> {
        let mut tx = self.pool.begin().await?;

        let metadata = serde_json::to_value(deltas).ok();
        if self.guard.claim(&mut tx, key, metadata).await? == ClaimResult::AlreadyClaimed {
            tx.rollback().await?;
            return Ok(false);
        }

        Self::apply_all_in_tx(&mut tx, key, deltas).await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn reverse_deltas_once(
        &self,
        key: &IdempotencyKey,
        reverses: &IdempotencyKey,
        deltas: &[CounterDelta],
    ) -> Result<CounterApplication, DirectoryError> {
        let mut tx = self.pool.begin().await?;

        let metadata = serde_json::to_value(deltas).ok();
        if self.guard.claim(&mut tx, key, metadata).await? == ClaimResult::AlreadyClaimed {
            tx.rollback().await?;
            return Ok(CounterApplication::Duplicate);
        }

        // Blocks on the unique index while a transaction applying `reverses`
        // is in flight, so the outcome reflects its commit or rollback.
        let voided = serde_json::json!({ "voided_by": key.as_str() });
        if self.guard.claim(&mut tx, reverses, Some(voided)).await? == ClaimResult::Claimed {
            tx.commit().await?;
            debug!(key = %key, reverses = %reverses, "Reversed change was never applied");
            return Ok(CounterApplication::Voided);
        }

        Self::apply_all_in_tx(&mut tx, key, deltas).await?;

        tx.commit().await?;
        Ok(CounterApplication::Applied)
    }

    async fn get_counters(&self, user_id: Uuid) -> Result<Option<UserCounters>, DirectoryError> {
        let counters = sqlx::query_as::<_, UserCounters>(
            "SELECT follower_count, following_count FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(counters)
    }

    async fn overwrite_counters(
        &self,
        user_id: Uuid,
        counters: UserCounters,
    ) -> Result<bool, DirectoryError> {
        let affected = sqlx::query(
            r#"
            UPDATE users
            SET follower_count = $2, following_count = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(counters.follower_count.max(0))
        .bind(counters.following_count.max(0))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }
}
