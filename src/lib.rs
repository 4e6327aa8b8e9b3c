// Library surface shared by the server binary and the integration tests

pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod event_handlers;
pub mod kafka;
pub mod logger;
pub mod memory_store;
pub mod middleware;
pub mod models;
pub mod rate_limit;
pub mod relay;
pub mod routes;
pub mod schema;
pub mod services;
pub mod state;
pub mod store;
pub mod ws;

// Re-export common types
pub use crate::config::AppConfig;
pub use crate::errors::{ApiError, StoreError};
pub use crate::state::AppState;
pub use crate::store::{SharedStore, Store};
