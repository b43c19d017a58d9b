use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use super::RelationStore;
use crate::domain::{Edge, EdgePage, PageRequest};
use crate::error::RelationError;

const EDGE_COLUMNS: &str = "id, follower_id, followee_id, created_at";

/// PostgreSQL relation store (source of truth for the follow graph)
#[derive(Clone)]
pub struct PostgresRelationStore {
    pool: PgPool,
}

/// Which side of the edge a listing filters on
#[derive(Clone, Copy)]
enum ListSide {
    Followers,
    Following,
}

impl ListSide {
    fn filter_column(self) -> &'static str {
        match self {
            ListSide::Followers => "followee_id",
            ListSide::Following => "follower_id",
        }
    }
}

impl PostgresRelationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_edge(
        &self,
        follower_id: Uuid,
        followee_id: Uuid,
    ) -> Result<Option<Edge>, RelationError> {
        let edge = sqlx::query_as::<_, Edge>(&format!(
            "SELECT {} FROM follows WHERE follower_id = $1 AND followee_id = $2",
            EDGE_COLUMNS
        ))
        .bind(follower_id)
        .bind(followee_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(edge)
    }

    async fn fetch_tombstone(
        &self,
        follower_id: Uuid,
        followee_id: Uuid,
    ) -> Result<Option<Edge>, RelationError> {
        let tombstone = sqlx::query_as::<_, Edge>(
            r#"
            SELECT edge_id AS id, follower_id, followee_id, created_at
            FROM follow_tombstones
            WHERE follower_id = $1 AND followee_id = $2
            "#,
        )
        .bind(follower_id)
        .bind(followee_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tombstone)
    }

    async fn list(
        &self,
        side: ListSide,
        user_id: Uuid,
        page: PageRequest,
    ) -> Result<EdgePage, RelationError> {
        let (cursor_ts, cursor_id) = match page.cursor {
            Some(cursor) => (Some(cursor.created_at), Some(cursor.edge_id)),
            None => (None, None),
        };

        // Fetch one extra row to learn whether another page exists
        let edges = sqlx::query_as::<_, Edge>(&format!(
            r#"
            SELECT {columns} FROM follows
            WHERE {filter} = $1
              AND ($2::timestamptz IS NULL OR (created_at, id) < ($2, $3))
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            "#,
            columns = EDGE_COLUMNS,
            filter = side.filter_column(),
        ))
        .bind(user_id)
        .bind(cursor_ts)
        .bind(cursor_id)
        .bind(page.limit as i64 + 1)
        .fetch_all(&self.pool)
        .await?;

        Ok(EdgePage::from_overfetch(edges, page.limit))
    }

    async fn count(&self, side: ListSide, user_id: Uuid) -> Result<i64, RelationError> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM follows WHERE {} = $1",
            side.filter_column()
        ))
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl RelationStore for PostgresRelationStore {
    async fn create_edge(
        &self,
        follower_id: Uuid,
        followee_id: Uuid,
    ) -> Result<Edge, RelationError> {
        if follower_id == followee_id {
            return Err(RelationError::InvalidEdge);
        }

        let candidate = Edge::new_follow(follower_id, followee_id);
        let inserted = sqlx::query_as::<_, Edge>(&format!(
            r#"
            INSERT INTO follows (id, follower_id, followee_id, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (follower_id, followee_id) DO NOTHING
            RETURNING {}
            "#,
            EDGE_COLUMNS
        ))
        .bind(candidate.id)
        .bind(follower_id)
        .bind(followee_id)
        .bind(candidate.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(edge) = inserted {
            debug!(
                "Created FOLLOWS in PostgreSQL: {} -> {}",
                follower_id, followee_id
            );
            return Ok(edge);
        }

        // Lost the race (or a plain duplicate): report the stored edge
        match self.fetch_edge(follower_id, followee_id).await? {
            Some(existing) => Err(RelationError::AlreadyExists(existing)),
            None => Err(RelationError::Unavailable(
                "follow edge changed concurrently, retry".to_string(),
            )),
        }
    }

    async fn delete_edge(
        &self,
        follower_id: Uuid,
        followee_id: Uuid,
    ) -> Result<Edge, RelationError> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query_as::<_, Edge>(&format!(
            "DELETE FROM follows WHERE follower_id = $1 AND followee_id = $2 RETURNING {}",
            EDGE_COLUMNS
        ))
        .bind(follower_id)
        .bind(followee_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(edge) = removed else {
            tx.rollback().await?;
            let tombstone = self.fetch_tombstone(follower_id, followee_id).await?;
            return Err(RelationError::NotFound { tombstone });
        };

        sqlx::query(
            r#"
            INSERT INTO follow_tombstones
                (follower_id, followee_id, edge_id, created_at, removed_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (follower_id, followee_id) DO UPDATE SET
                edge_id = EXCLUDED.edge_id,
                created_at = EXCLUDED.created_at,
                removed_at = EXCLUDED.removed_at
            "#,
        )
        .bind(edge.follower_id)
        .bind(edge.followee_id)
        .bind(edge.id)
        .bind(edge.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            "Deleted FOLLOWS in PostgreSQL: {} -> {}",
            follower_id, followee_id
        );
        Ok(edge)
    }

    async fn get_edge(
        &self,
        follower_id: Uuid,
        followee_id: Uuid,
    ) -> Result<Option<Edge>, RelationError> {
        self.fetch_edge(follower_id, followee_id).await
    }

    async fn list_followers(
        &self,
        user_id: Uuid,
        page: PageRequest,
    ) -> Result<EdgePage, RelationError> {
        self.list(ListSide::Followers, user_id, page).await
    }

    async fn list_following(
        &self,
        user_id: Uuid,
        page: PageRequest,
    ) -> Result<EdgePage, RelationError> {
        self.list(ListSide::Following, user_id, page).await
    }

    async fn count_followers(&self, user_id: Uuid) -> Result<i64, RelationError> {
        self.count(ListSide::Followers, user_id).await
    }

    async fn count_following(&self, user_id: Uuid) -> Result<i64, RelationError> {
        self.count(ListSide::Following, user_id).await
    }

    async fn health_check(&self) -> Result<(), RelationError> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}
