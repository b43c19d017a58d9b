use actix_web::{web, HttpResponse, Responder};
use serde::Serialize;
use std::collections::HashMap;

use crate::metrics;
use crate::state::AppState;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Serialize)]
struct ComponentCheck {
    status: ComponentStatus,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    latency_ms: Option<u64>,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    status: ComponentStatus,
    checks: HashMap<String, ComponentCheck>,
    drift_queue_size: usize,
}

/// Liveness check
pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().body("OK")
}

/// Readiness check
///
/// Relation store and user directory are critical; the counters cache only
/// degrades the service.
pub async fn readiness_check(state: web::Data<AppState>) -> impl Responder {
    let mut checks = HashMap::new();
    let mut overall = ComponentStatus::Healthy;

    let start = std::time::Instant::now();
    let relations = match state.relations.health_check().await {
        Ok(()) => ComponentCheck {
            status: ComponentStatus::Healthy,
            message: "relation store reachable".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            overall = ComponentStatus::Unhealthy;
            ComponentCheck {
                status: ComponentStatus::Unhealthy,
                message: e.to_string(),
                latency_ms: None,
            }
        }
    };
    checks.insert("relation_store".to_string(), relations);

    let start = std::time::Instant::now();
    let directory = match state.directory.health_check().await {
        Ok(()) => ComponentCheck {
            status: ComponentStatus::Healthy,
            message: "user directory reachable".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            overall = ComponentStatus::Unhealthy;
            ComponentCheck {
                status: ComponentStatus::Unhealthy,
                message: e.to_string(),
                latency_ms: None,
            }
        }
    };
    checks.insert("user_directory".to_string(), directory);

    if let Some(cache) = &state.cache {
        let start = std::time::Instant::now();
        let redis = match cache.ping().await {
            Ok(()) => ComponentCheck {
                status: ComponentStatus::Healthy,
                message: "counters cache reachable".to_string(),
                latency_ms: Some(start.elapsed().as_millis() as u64),
            },
            Err(e) => {
                if overall == ComponentStatus::Healthy {
                    overall = ComponentStatus::Degraded;
                }
                ComponentCheck {
                    status: ComponentStatus::Degraded,
                    message: e.to_string(),
                    latency_ms: None,
                }
            }
        };
        checks.insert("redis".to_string(), redis);
    }

    let ready = overall != ComponentStatus::Unhealthy;
    let body = ReadinessResponse {
        ready,
        status: overall,
        checks,
        drift_queue_size: state.drift.len(),
    };

    if ready {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

/// Prometheus scrape endpoint
pub async fn metrics_handler() -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::gather_metrics())
}
