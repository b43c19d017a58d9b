use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default number of edges per page
pub const DEFAULT_PAGE_LIMIT: u32 = 50;
/// Upper bound on edges per page
pub const MAX_PAGE_LIMIT: u32 = 100;

/// 關注邊（有向邊）: `follower_id` follows `followee_id`.
///
/// Edges are immutable. A pair that is followed, unfollowed and followed
/// again yields two edges with different ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Edge {
    pub id: Uuid,
    pub follower_id: Uuid,
    pub followee_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    pub fn new_follow(follower_id: Uuid, followee_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            follower_id,
            followee_id,
            // PostgreSQL and the cursor format keep microseconds only
            created_at: Utc::now().trunc_subsecs(6),
        }
    }

    /// Sort key used by every listing: newest first, ties broken by id.
    pub fn sort_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CursorError {
    #[error("Invalid cursor encoding: {0}")]
    Encoding(String),
    #[error("Invalid cursor format")]
    Format,
}

/// Keyset position inside an edge listing.
///
/// The next page holds edges strictly after this position in
/// `(created_at DESC, id DESC)` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeCursor {
    pub created_at: DateTime<Utc>,
    pub edge_id: Uuid,
}

impl EdgeCursor {
    pub fn after(edge: &Edge) -> Self {
        Self {
            created_at: edge.created_at,
            edge_id: edge.id,
        }
    }

    /// Whether `edge` sorts after this cursor position.
    pub fn precedes(&self, edge: &Edge) -> bool {
        edge.sort_key() < (self.created_at, self.edge_id)
    }

    /// Opaque form handed to clients: base64("id:<uuid>,ts:<micros>")
    pub fn encode(&self) -> String {
        let raw = format!(
            "id:{},ts:{}",
            self.edge_id,
            self.created_at.timestamp_micros()
        );
        general_purpose::URL_SAFE_NO_PAD.encode(raw)
    }

    pub fn decode(cursor: &str) -> Result<Self, CursorError> {
        let decoded = general_purpose::URL_SAFE_NO_PAD
            .decode(cursor)
            .map_err(|e| CursorError::Encoding(e.to_string()))?;
        let raw = String::from_utf8(decoded).map_err(|e| CursorError::Encoding(e.to_string()))?;

        let (id_part, ts_part) = raw.split_once(',').ok_or(CursorError::Format)?;
        let edge_id = id_part
            .strip_prefix("id:")
            .and_then(|id| Uuid::parse_str(id).ok())
            .ok_or(CursorError::Format)?;
        let micros = ts_part
            .strip_prefix("ts:")
            .and_then(|ts| ts.parse::<i64>().ok())
            .ok_or(CursorError::Format)?;
        let created_at = Utc
            .timestamp_micros(micros)
            .single()
            .ok_or(CursorError::Format)?;

        Ok(Self {
            created_at,
            edge_id,
        })
    }
}

/// Bounded page request for edge listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub cursor: Option<EdgeCursor>,
    pub limit: u32,
}

impl PageRequest {
    /// Build a request, clamping `limit` into `1..=MAX_PAGE_LIMIT`.
    pub fn new(cursor: Option<EdgeCursor>, limit: Option<u32>) -> Self {
        Self {
            cursor,
            limit: limit
                .unwrap_or(DEFAULT_PAGE_LIMIT)
                .clamp(1, MAX_PAGE_LIMIT),
        }
    }

    pub fn first(limit: u32) -> Self {
        Self::new(None, Some(limit))
    }

    /// Parse the optional client-supplied cursor string.
    pub fn from_query(cursor: Option<&str>, limit: Option<u32>) -> Result<Self, CursorError> {
        let cursor = cursor
            .filter(|c| !c.is_empty())
            .map(EdgeCursor::decode)
            .transpose()?;
        Ok(Self::new(cursor, limit))
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// One page of edges plus the position to continue from
#[derive(Debug, Clone, Default)]
pub struct EdgePage {
    pub edges: Vec<Edge>,
    /// `Some` iff more edges exist after this page
    pub next_cursor: Option<EdgeCursor>,
}

impl EdgePage {
    /// Build a page from up to `limit + 1` sorted edges; the extra edge only
    /// signals that another page exists.
    pub fn from_overfetch(mut edges: Vec<Edge>, limit: u32) -> Self {
        let limit = limit as usize;
        let has_more = edges.len() > limit;
        edges.truncate(limit);
        let next_cursor = if has_more {
            edges.last().map(EdgeCursor::after)
        } else {
            None
        };
        Self { edges, next_cursor }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn edge_at(offset_secs: i64) -> Edge {
        let mut edge = Edge::new_follow(Uuid::new_v4(), Uuid::new_v4());
        edge.created_at = edge.created_at + Duration::seconds(offset_secs);
        edge
    }

    #[test]
    fn test_create_follow_edge() {
        let follower = Uuid::new_v4();
        let followee = Uuid::new_v4();

        let edge = Edge::new_follow(follower, followee);

        assert_eq!(edge.follower_id, follower);
        assert_eq!(edge.followee_id, followee);
        assert_eq!(edge.created_at.timestamp_subsec_nanos() % 1_000, 0);
    }

    #[test]
    fn test_cursor_encode_decode() {
        let edge = Edge::new_follow(Uuid::new_v4(), Uuid::new_v4());
        let cursor = EdgeCursor::after(&edge);

        let decoded = EdgeCursor::decode(&cursor.encode()).unwrap();

        assert_eq!(decoded, cursor);
    }

    #[test]
    fn test_cursor_rejects_garbage() {
        assert!(matches!(
            EdgeCursor::decode("not base64!"),
            Err(CursorError::Encoding(_))
        ));
        let wrong_shape = general_purpose::URL_SAFE_NO_PAD.encode("offset:10");
        assert_eq!(EdgeCursor::decode(&wrong_shape), Err(CursorError::Format));
    }

    #[test]
    fn test_cursor_precedes_older_edges_only() {
        let newer = edge_at(10);
        let older = edge_at(-10);
        let cursor = EdgeCursor::after(&edge_at(0));

        assert!(cursor.precedes(&older));
        assert!(!cursor.precedes(&newer));
    }

    #[test]
    fn test_page_request_clamps_limit() {
        assert_eq!(PageRequest::new(None, None).limit, DEFAULT_PAGE_LIMIT);
        assert_eq!(PageRequest::new(None, Some(0)).limit, 1);
        assert_eq!(PageRequest::new(None, Some(10_000)).limit, MAX_PAGE_LIMIT);
    }

    #[test]
    fn test_page_request_ignores_empty_cursor() {
        let page = PageRequest::from_query(Some(""), Some(5)).unwrap();
        assert!(page.cursor.is_none());
        assert_eq!(page.limit, 5);
    }

    #[test]
    fn test_overfetch_sets_next_cursor() {
        let edges: Vec<Edge> = (0..3).map(|i| edge_at(-i)).collect();

        let page = EdgePage::from_overfetch(edges.clone(), 2);
        assert_eq!(page.edges.len(), 2);
        assert_eq!(page.next_cursor, Some(EdgeCursor::after(&edges[1])));

        let last = EdgePage::from_overfetch(edges, 3);
        assert_eq!(last.edges.len(), 3);
        assert!(last.next_cursor.is_none());
    }
}
