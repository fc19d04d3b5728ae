//! Environment configuration for the gateway.

use std::env;

pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/0";
pub const DEFAULT_JWT_SECRET: &str = "development-secret-key";

#[derive(Debug, Clone)]
pub struct Config {
    /// Listening port (`SOCKET_PORT`).
    pub port: u16,
    /// Shared secret for access token verification (`JWT_SECRET`, falling
    /// back to `SECRET_KEY`).
    pub jwt_secret: String,
    /// Backplane connection URL (`REDIS_URL`).
    pub redis_url: String,
    /// Allowed cross-origin sources (`SOCKET_CORS_ORIGINS`, comma-separated).
    /// Empty means any origin is allowed.
    pub cors_origins: Vec<String>,
}

impl Config {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: env::var("SOCKET_PORT")
                .ok()
                .and_then(|port| port.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            jwt_secret: env::var("JWT_SECRET")
                .or_else(|_| env::var("SECRET_KEY"))
                .unwrap_or_else(|_| DEFAULT_JWT_SECRET.to_string()),
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
            cors_origins: parse_origins(&env::var("SOCKET_CORS_ORIGINS").unwrap_or_default()),
        }
    }
}

fn parse_origins(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(ToString::to_string)
        .collect()
}
