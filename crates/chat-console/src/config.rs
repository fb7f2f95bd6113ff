use std::path::Path;
use std::time::Duration;

use centrifuge_client::{ClientConfig, SubscriptionConfig, TimingConfig};
use serde::{Deserialize, Serialize};

use crate::error::{ConsoleError, ConsoleResult};

pub(crate) const DEFAULT_ENDPOINT: &str = "ws://localhost:8088/connection/websocket";
pub(crate) const DEFAULT_USER: &str = "user-4";
pub(crate) const DEFAULT_CHANNEL: &str = "parser-3";
pub(crate) const DEFAULT_HISTORY_LIMIT: u32 = 100;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub endpoint: String,
    /// HMAC secret the connection token is signed with.
    pub secret: String,
    pub user: String,
    pub channel: String,
    pub history_limit: u32,
    /// Token lifetime in seconds; 0 issues a token without expiry.
    pub token_ttl: i64,
    pub recoverable: bool,
    pub join_leave: bool,
    pub request_timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            secret: String::new(),
            user: DEFAULT_USER.to_string(),
            channel: DEFAULT_CHANNEL.to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            token_ttl: 0,
            recoverable: true,
            join_leave: true,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

/// Values given on the command line or through the environment. They take
/// precedence over the config file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub endpoint: Option<String>,
    pub secret: Option<String>,
    pub user: Option<String>,
    pub channel: Option<String>,
    pub history_limit: Option<u32>,
    pub token_ttl: Option<i64>,
}

/// Build the effective config: defaults, then the optional YAML file, then
/// `overrides`.
pub async fn resolve(path: Option<&Path>, overrides: Overrides) -> ConsoleResult<ChatConfig> {
    let mut config = match path {
        Some(path) => load(path).await?,
        None => ChatConfig::default(),
    };
    config.apply(overrides);
    config.validate()?;
    Ok(config)
}

async fn load(path: &Path) -> ConsoleResult<ChatConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConsoleError::Config(format!("read {}: {e}", path.display())))?;
    serde_yaml_ng::from_str(&content)
        .map_err(|e| ConsoleError::Config(format!("parse {}: {e}", path.display())))
}

impl ChatConfig {
    fn apply(&mut self, overrides: Overrides) {
        let Overrides {
            endpoint,
            secret,
            user,
            channel,
            history_limit,
            token_ttl,
        } = overrides;
        if let Some(v) = endpoint {
            self.endpoint = v;
        }
        if let Some(v) = secret {
            self.secret = v;
        }
        if let Some(v) = user {
            self.user = v;
        }
        if let Some(v) = channel {
            self.channel = v;
        }
        if let Some(v) = history_limit {
            self.history_limit = v;
        }
        if let Some(v) = token_ttl {
            self.token_ttl = v;
        }
    }

    fn validate(&self) -> ConsoleResult<()> {
        if self.secret.is_empty() {
            return Err(ConsoleError::Config(
                "token secret is required (--secret, CHAT_TOKEN_SECRET, or `secret` in the config file)"
                    .to_string(),
            ));
        }
        for (value, label) in [
            (&self.endpoint, "endpoint"),
            (&self.user, "user"),
            (&self.channel, "channel"),
        ] {
            if value.trim().is_empty() {
                return Err(ConsoleError::Config(format!("{label} must not be empty")));
            }
        }
        if self.history_limit == 0 {
            return Err(ConsoleError::Config(
                "history_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Unix expiry for a token issued now; 0 when the token never expires.
    pub fn token_expiry(&self) -> i64 {
        if self.token_ttl <= 0 {
            return 0;
        }
        chrono::Utc::now().timestamp() + self.token_ttl
    }

    pub fn client_config(&self, token: String) -> ClientConfig {
        let mut config = ClientConfig::new(self.endpoint.clone(), token);
        config.name = Some(env!("CARGO_PKG_NAME").to_string());
        config.version = Some(env!("CARGO_PKG_VERSION").to_string());
        config.timing = TimingConfig {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            ..TimingConfig::default()
        };
        config
    }

    pub fn subscription_config(&self) -> SubscriptionConfig {
        SubscriptionConfig {
            recoverable: self.recoverable,
            join_leave: self.join_leave,
        }
    }
}
