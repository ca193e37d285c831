//! Discord REST delivery for alerts and command replies.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use farewatch_core::{Message, NotificationSink, Recipient, SinkError};
use farewatch_storage::{classify_status, BackoffPolicy, HttpClientConfig, RetryDisposition};
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
/// Discord rejects plain messages longer than this.
pub const CONTENT_LIMIT: usize = 2000;

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    #[serde(default)]
    retry_after: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ChannelBody {
    id: String,
}

/// Request body for one outgoing message.
pub fn message_payload(message: &Message) -> Value {
    match message {
        Message::Text(text) => {
            let content: String = if text.chars().count() > CONTENT_LIMIT {
                text.chars().take(CONTENT_LIMIT - 1).chain(std::iter::once('…')).collect()
            } else {
                text.clone()
            };
            json!({ "content": content })
        }
        Message::Embed(embed) => json!({ "embeds": [embed] }),
    }
}

/// Wait requested by a 429 body, falling back to the backoff policy.
fn retry_delay(body: &str, backoff: &BackoffPolicy, attempt: usize) -> Duration {
    serde_json::from_str::<RateLimitBody>(body)
        .ok()
        .and_then(|b| b.retry_after)
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| Duration::from_secs_f64(secs).min(backoff.max_delay))
        .unwrap_or_else(|| backoff.delay_for_attempt(attempt))
}

#[derive(Debug)]
pub struct DiscordSink {
    client: reqwest::Client,
    token: String,
    base_url: String,
    backoff: BackoffPolicy,
    broadcast_channel: u64,
    dm_channels: Mutex<HashMap<String, u64>>,
}

impl DiscordSink {
    pub fn new(
        token: impl Into<String>,
        broadcast_channel: u64,
        http: &HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: http.build_client()?,
            token: token.into(),
            base_url: DISCORD_API_BASE.to_string(),
            backoff: http.backoff,
            broadcast_channel,
            dm_channels: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn channel_for(&self, recipient: &Recipient) -> Result<u64, SinkError> {
        match recipient {
            Recipient::Broadcast => Ok(self.broadcast_channel),
            Recipient::Channel(id) => Ok(*id),
            Recipient::DirectMessage(user_id) => self.dm_channel(user_id).await,
        }
    }

    async fn dm_channel(&self, user_id: &str) -> Result<u64, SinkError> {
        if let Some(id) = self.dm_channels.lock().await.get(user_id) {
            return Ok(*id);
        }
        let body = self
            .post("users/@me/channels", &json!({ "recipient_id": user_id }))
            .await?;
        let channel: ChannelBody = serde_json::from_str(&body)
            .map_err(|err| SinkError::Recipient(format!("unexpected DM channel body: {err}")))?;
        let id = channel
            .id
            .parse()
            .map_err(|_| {
                SinkError::Recipient(format!("DM channel id `{}` is not numeric", channel.id))
            })?;
        self.dm_channels.lock().await.insert(user_id.to_string(), id);
        Ok(id)
    }

    /// POSTs `payload`, retrying only on 429. Returns the response body.
    async fn post(&self, path: &str, payload: &Value) -> Result<String, SinkError> {
        let url = format!("{}/{}", self.base_url, path);
        let mut attempt = 0;
        loop {
            let response = self
                .client
                .post(url.as_str())
                .header(AUTHORIZATION, format!("Bot {}", self.token))
                .json(payload)
                .send()
                .await
                .map_err(|err| SinkError::Transport(err.to_string()))?;
            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|err| SinkError::Transport(err.to_string()))?;

            if status.is_success() {
                debug!(path, "discord request delivered");
                return Ok(body);
            }
            let retryable = classify_status(status) == RetryDisposition::Retryable;
            if retryable && attempt < self.backoff.max_retries {
                let delay = retry_delay(&body, &self.backoff, attempt);
                let delay_ms = delay.as_millis() as u64;
                warn!(path, attempt, delay_ms, "discord rate limited; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return Err(match status {
                StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                    SinkError::Recipient(format!("discord returned {status} for {path}: {body}"))
                }
                _ => SinkError::Transport(format!("discord returned {status} for {path}: {body}")),
            });
        }
    }
}

#[async_trait]
impl NotificationSink for DiscordSink {
    async fn send(&self, recipient: &Recipient, message: &Message) -> Result<(), SinkError> {
        let channel = self.channel_for(recipient).await?;
        self.post(&format!("channels/{channel}/messages"), &message_payload(message))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farewatch_core::{Color, Embed};

    #[test]
    fn embeds_are_wrapped_in_an_embeds_array() {
        let embed = Embed::new("🎯 Flights Under $600", Color::GREEN).field("a", "b").footer("f");
        let payload = message_payload(&Message::Embed(embed));
        assert_eq!(payload["embeds"][0]["title"], "🎯 Flights Under $600");
        assert_eq!(payload["embeds"][0]["color"], 0x2ECC71);
        assert_eq!(payload["embeds"][0]["fields"][0]["inline"], false);
        assert!(payload.get("content").is_none());
    }

    #[test]
    fn long_text_is_clipped_to_the_content_limit() {
        let payload = message_payload(&Message::Text("x".repeat(2500)));
        let content = payload["content"].as_str().unwrap();
        assert_eq!(content.chars().count(), CONTENT_LIMIT);
        assert!(content.ends_with('…'));
    }

    #[test]
    fn rate_limit_delay_prefers_retry_after() {
        let backoff = BackoffPolicy::default();
        let limited =
            r#"{"message":"You are being rate limited.","retry_after":1.5,"global":false}"#;
        assert_eq!(retry_delay(limited, &backoff, 0), Duration::from_millis(1500));
        assert_eq!(retry_delay("not json", &backoff, 1), Duration::from_secs(1));
        assert_eq!(retry_delay(r#"{"retry_after":3600}"#, &backoff, 0), backoff.max_delay);
    }
}
