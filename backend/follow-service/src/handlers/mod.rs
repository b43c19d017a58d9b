pub mod admin;
pub mod graph;
pub mod health;

use actix_web::{error::JsonPayloadError, web, HttpRequest};

use crate::error::ServiceError;

fn json_error(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    ServiceError::InvalidRequest(err.to_string()).into()
}

fn query_error(err: actix_web::error::QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    ServiceError::InvalidRequest(err.to_string()).into()
}

fn path_error(err: actix_web::error::PathError, _req: &HttpRequest) -> actix_web::Error {
    ServiceError::InvalidRequest(err.to_string()).into()
}

/// Register every route of the service
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error))
        .app_data(web::QueryConfig::default().error_handler(query_error))
        .app_data(web::PathConfig::default().error_handler(path_error))
        .route("/health", web::get().to(health::health_check))
        .route("/ready", web::get().to(health::readiness_check))
        .route("/metrics", web::get().to(health::metrics_handler))
        .service(
            web::scope("/api/v1/graph")
                .route("/follow", web::post().to(graph::follow))
                .route("/unfollow", web::post().to(graph::unfollow))
                .route("/followers/{user_id}", web::get().to(graph::get_followers))
                .route("/following/{user_id}", web::get().to(graph::get_following))
                .route("/counters/{user_id}", web::get().to(graph::get_counters))
                .route("/is-following", web::get().to(graph::is_following)),
        )
        .service(
            web::scope("/admin")
                .route("/reconcile/{user_id}", web::post().to(admin::reconcile_user)),
        );
}
