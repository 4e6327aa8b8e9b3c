use diesel::pg::PgConnection;
use diesel::r2d2::{self, ConnectionManager};
use log::warn;
use std::env;

// Type aliases
pub type DbPool = r2d2::Pool<ConnectionManager<PgConnection>>;

const DEFAULT_JWT_SECRET: &str = "your_jwt_secret_key_here";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

// Config
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    /// Public origin of the web client, used to build join links.
    pub app_base_url: String,
    pub jwt_secret: String,
    pub jwt_issuer: Option<String>,
    pub rate_limit: RateLimitSettings,
    pub sign_in_path: String,
    pub relay_channel_capacity: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct RateLimitSettings {
    pub capacity: u32,
    pub refill_tokens: u32,
    pub refill_interval_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self { capacity: 30, refill_tokens: 2, refill_interval_secs: 10 }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let jwt_secret = match env::var("AUTH_JWT_SECRET") {
            Ok(val) => val,
            Err(e) => {
                warn!("Failed to load AUTH_JWT_SECRET: {}", e);
                warn!("Using default JWT secret - THIS IS NOT SECURE FOR PRODUCTION!");
                DEFAULT_JWT_SECRET.to_string()
            }
        };

        let store_backend = match env::var("STORE_BACKEND").as_deref() {
            Ok("memory") => StoreBackend::Memory,
            _ => StoreBackend::Postgres,
        };

        let defaults = RateLimitSettings::default();

        Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("PORT", 8080),
            store_backend,
            database_url: env::var("DATABASE_URL").ok(),
            app_base_url: env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            jwt_secret,
            jwt_issuer: env::var("AUTH_JWT_ISSUER").ok(),
            rate_limit: RateLimitSettings {
                capacity: env_or("RATE_LIMIT_CAPACITY", defaults.capacity),
                refill_tokens: env_or("RATE_LIMIT_REFILL_TOKENS", defaults.refill_tokens),
                refill_interval_secs: env_or(
                    "RATE_LIMIT_REFILL_INTERVAL_SECS",
                    defaults.refill_interval_secs,
                ),
            },
            sign_in_path: env::var("SIGN_IN_PATH").unwrap_or_else(|_| "/sign-in".to_string()),
            relay_channel_capacity: env_or("RELAY_CHANNEL_CAPACITY", 128),
        }
    }

    /// Configuration used by tests and the in-memory development mode.
    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            store_backend: StoreBackend::Memory,
            database_url: None,
            app_base_url: "http://localhost:3000".to_string(),
            jwt_secret: "test-secret".to_string(),
            jwt_issuer: None,
            rate_limit: RateLimitSettings::default(),
            sign_in_path: "/sign-in".to_string(),
            relay_channel_capacity: 16,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.jwt_secret == DEFAULT_JWT_SECRET {
            warn!("Using default JWT secret is not secure for production!");
        }

        if self.store_backend == StoreBackend::Postgres && self.database_url.is_none() {
            return Err("DATABASE_URL must be set".to_string());
        }

        if self.rate_limit.capacity == 0 {
            return Err("RATE_LIMIT_CAPACITY must be positive".to_string());
        }

        if self.rate_limit.refill_tokens == 0 || self.rate_limit.refill_interval_secs == 0 {
            return Err("RATE_LIMIT refill settings must be positive".to_string());
        }

        if self.relay_channel_capacity == 0 {
            return Err("RELAY_CHANNEL_CAPACITY must be positive".to_string());
        }

        Ok(())
    }

    pub fn join_link(&self, code: &str) -> String {
        format!("{}/sessions/join/{}", self.app_base_url.trim_end_matches('/'), code)
    }
}
