use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use tracing::warn;

/// Placeholder JWT secrets that must not be used outside development.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub token_ttl: chrono::Duration,
    /// Per-connection push queue. A connection that falls this far behind is evicted.
    pub outbound_buffer: usize,
}

impl ServerConfig {
    /// Read `PARLEY_*` variables, falling back to development defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let jwt_secret = std::env::var("PARLEY_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            warn!("PARLEY_JWT_SECRET is unset or a placeholder; tokens are forgeable");
        }

        let port = env_or("PARLEY_PORT", "3000")
            .parse()
            .context("PARLEY_PORT must be a port number")?;
        let token_ttl_hours: i64 = env_or("PARLEY_TOKEN_TTL_HOURS", "24")
            .parse()
            .context("PARLEY_TOKEN_TTL_HOURS must be an integer")?;
        let outbound_buffer = env_or("PARLEY_OUTBOUND_BUFFER", "256")
            .parse()
            .context("PARLEY_OUTBOUND_BUFFER must be an integer")?;

        Ok(Self {
            host: env_or("PARLEY_HOST", "0.0.0.0"),
            port,
            db_path: env_or("PARLEY_DB_PATH", "parley.db").into(),
            jwt_secret,
            token_ttl: chrono::Duration::hours(token_ttl_hours),
            outbound_buffer,
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            db_path: "parley.db".into(),
            jwt_secret: "dev-secret-change-me".into(),
            token_ttl: chrono::Duration::hours(24),
            outbound_buffer: 256,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}
