use actix_web::{web, HttpResponse};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::UserCounters;
use crate::error::ServiceResult;
use crate::metrics;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub user_id: Uuid,
    pub previous: UserCounters,
    pub current: UserCounters,
    pub corrected: bool,
}

/// Recount one user's edges and overwrite the stored counters
pub async fn reconcile_user(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ServiceResult<HttpResponse> {
    let user_id = path.into_inner();
    let result = state.maintainer.recompute_counters(user_id).await?;

    if result.corrected() {
        metrics::record_reconciliation("corrected", result.drift());
        if let Some(cache) = &state.cache {
            if let Err(e) = cache.invalidate(&[user_id]).await {
                tracing::warn!(user = %user_id, error = %e, "Failed to invalidate cached counters");
            }
        }
    } else {
        metrics::record_reconciliation("unchanged", 0);
    }

    tracing::info!(
        user = %user_id,
        corrected = result.corrected(),
        drift = result.drift(),
        "Manual counter reconciliation"
    );

    Ok(HttpResponse::Ok().json(ReconcileResponse {
        user_id,
        previous: result.previous,
        current: result.current,
        corrected: result.corrected(),
    }))
}
