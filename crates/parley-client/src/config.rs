use std::time::Duration;

use parley_types::models::UserId;

use crate::backoff::BackoffPolicy;

/// Everything a session needs to reach the server and keep itself alive.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP base URL of the server, e.g. `http://127.0.0.1:3000`.
    pub base_url: String,
    pub token: String,
    pub user_id: UserId,
    pub heartbeat_interval: Duration,
    pub backoff: BackoffPolicy,
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, user_id: UserId) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            user_id,
            heartbeat_interval: Duration::from_secs(25),
            backoff: BackoffPolicy::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Gateway URL for this session's token.
    pub fn ws_url(&self) -> String {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{}/ws/{}", base, self.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_follows_the_http_scheme() {
        let config = ClientConfig::new("http://localhost:3000/", "abc", UserId(1));
        assert_eq!(config.ws_url(), "ws://localhost:3000/ws/abc");

        let config = ClientConfig::new("https://chat.example.com", "abc", UserId(1));
        assert_eq!(config.ws_url(), "wss://chat.example.com/ws/abc");
    }

    #[test]
    fn builders_override_defaults() {
        let config = ClientConfig::new("http://localhost:3000", "abc", UserId(1))
            .with_heartbeat_interval(Duration::from_secs(5))
            .with_connect_timeout(Duration::from_secs(2));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.backoff, BackoffPolicy::default());
    }
}
