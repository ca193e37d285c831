//! Process configuration read from the environment.

use std::path::PathBuf;
use std::time::Duration;

use farewatch_storage::{HttpClientConfig, StoreConfig, TokenBucketConfig};
use thiserror::Error;

pub const DEFAULT_USER_AGENT: &str = "farewatch-bot/0.1";
pub const DEFAULT_PROVIDER_REQUESTS_PER_MINUTE: u32 = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: `{value}` ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub discord_token: String,
    pub store: StoreConfig,
    pub serpapi_api_key: String,
    pub broadcast_channel_id: u64,
    pub alert_interval: Duration,
    pub alerts_run_on_startup: bool,
    pub http_timeout: Duration,
    pub provider_timeout: Duration,
    /// `None` leaves provider requests unthrottled.
    pub provider_requests_per_minute: Option<u32>,
    pub command_prefix: String,
    pub deal_regions_file: Option<PathBuf>,
    pub user_agent: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`AppConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(key))
        };
        let optional = |key: &'static str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let channel = required("DISCORD_CHANNEL_ID")?;
        let broadcast_channel_id = channel.parse().map_err(|_| ConfigError::Invalid {
            key: "DISCORD_CHANNEL_ID",
            value: channel.clone(),
            reason: "expected a numeric channel id",
        })?;

        let positive =
            |key: &'static str, default: u64| parse_positive(key, optional(key), default);
        let alert_hours = positive("ALERT_INTERVAL_HOURS", 168)?;
        let http_secs = positive("HTTP_TIMEOUT_SECS", 20)?;
        let provider_secs = positive("PROVIDER_TIMEOUT_SECS", 30)?;

        let provider_requests_per_minute = match optional("SERPAPI_REQUESTS_PER_MINUTE") {
            None => Some(DEFAULT_PROVIDER_REQUESTS_PER_MINUTE),
            Some(v) => match v.parse::<u32>() {
                Ok(0) => None,
                Ok(n) => Some(n),
                Err(_) => {
                    return Err(ConfigError::Invalid {
                        key: "SERPAPI_REQUESTS_PER_MINUTE",
                        value: v,
                        reason: "expected a whole number, 0 to disable",
                    })
                }
            },
        };

        let alerts_run_on_startup = match optional("ALERTS_RUN_ON_STARTUP") {
            None => true,
            Some(v) => parse_flag(&v).ok_or(ConfigError::Invalid {
                key: "ALERTS_RUN_ON_STARTUP",
                value: v,
                reason: "expected true or false",
            })?,
        };

        Ok(Self {
            discord_token: required("DISCORD_TOKEN")?,
            store: StoreConfig {
                url: required("SUPABASE_URL")?,
                api_key: required("SUPABASE_KEY")?,
            },
            serpapi_api_key: required("SERPAPI_API_KEY")?,
            broadcast_channel_id,
            alert_interval: Duration::from_secs(alert_hours * 3600),
            alerts_run_on_startup,
            http_timeout: Duration::from_secs(http_secs),
            provider_timeout: Duration::from_secs(provider_secs),
            provider_requests_per_minute,
            command_prefix: optional("COMMAND_PREFIX").unwrap_or_else(|| "!".to_string()),
            deal_regions_file: optional("DEAL_REGIONS_FILE").map(PathBuf::from),
            user_agent: optional("FAREWATCH_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    /// Client settings for the search provider: the shared settings plus a
    /// token bucket refilling one request every `60s / rpm`.
    pub fn provider_http_config(&self) -> HttpClientConfig {
        let token_bucket = self.provider_requests_per_minute.map(|rpm| TokenBucketConfig {
            capacity: rpm,
            refill_every: Duration::from_secs(60) / rpm,
        });
        HttpClientConfig {
            token_bucket,
            ..self.http_client_config()
        }
    }
}

fn parse_positive(
    key: &'static str,
    value: Option<String>,
    default: u64,
) -> Result<u64, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::Invalid {
            key,
            value,
            reason: "expected a positive integer",
        }),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "1" | "true" | "TRUE" | "True" | "yes" => Some(true),
        "0" | "false" | "FALSE" | "False" | "no" => Some(false),
        _ => None,
    }
}
