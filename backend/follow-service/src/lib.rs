pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod repository;
pub mod services;
pub mod state;
pub mod workers;
