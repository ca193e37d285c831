//! Minimal Discord gateway client: identify, heartbeat, and route
//! `MESSAGE_CREATE` events that carry the command prefix to the handlers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use farewatch_core::{NotificationSink, Recipient};
use farewatch_storage::BackoffPolicy;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::handler::CommandHandler;

pub const GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

pub const INTENT_GUILD_MESSAGES: u64 = 1 << 9;
pub const INTENT_DIRECT_MESSAGES: u64 = 1 << 12;
pub const INTENT_MESSAGE_CONTENT: u64 = 1 << 15;
pub const INTENTS: u64 = INTENT_GUILD_MESSAGES | INTENT_DIRECT_MESSAGES | INTENT_MESSAGE_CONTENT;

const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;
const OP_HEARTBEAT_ACK: u8 = 11;

#[derive(Debug, Deserialize)]
struct Frame {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMessageCreate {
    channel_id: String,
    #[serde(default)]
    content: String,
    author: RawAuthor,
}

#[derive(Debug, Deserialize)]
struct RawAuthor {
    id: String,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize)]
struct RawHello {
    heartbeat_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub channel_id: u64,
    pub author_id: String,
    pub author_is_bot: bool,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    Hello { heartbeat_interval: Duration },
    Ready,
    MessageCreate(IncomingMessage),
    OtherDispatch(String),
    HeartbeatRequest,
    HeartbeatAck,
    Reconnect,
    InvalidSession,
    Unknown(u8),
}

/// Decodes one gateway text frame and its sequence number.
pub fn decode_frame(text: &str) -> Result<(Option<u64>, GatewayEvent)> {
    let frame: Frame = serde_json::from_str(text).context("decoding gateway frame")?;
    let event = match frame.op {
        OP_HELLO => {
            let hello: RawHello = serde_json::from_value(frame.d).context("decoding hello")?;
            GatewayEvent::Hello {
                heartbeat_interval: Duration::from_millis(hello.heartbeat_interval),
            }
        }
        OP_DISPATCH => match frame.t.as_deref() {
            Some("READY") => GatewayEvent::Ready,
            Some("MESSAGE_CREATE") => {
                let raw: RawMessageCreate =
                    serde_json::from_value(frame.d).context("decoding MESSAGE_CREATE")?;
                GatewayEvent::MessageCreate(IncomingMessage {
                    channel_id: raw
                        .channel_id
                        .parse()
                        .with_context(|| format!("channel id `{}`", raw.channel_id))?,
                    author_id: raw.author.id,
                    author_is_bot: raw.author.bot,
                    content: raw.content,
                })
            }
            other => GatewayEvent::OtherDispatch(other.unwrap_or_default().to_string()),
        },
        OP_HEARTBEAT => GatewayEvent::HeartbeatRequest,
        OP_HEARTBEAT_ACK => GatewayEvent::HeartbeatAck,
        OP_RECONNECT => GatewayEvent::Reconnect,
        OP_INVALID_SESSION => GatewayEvent::InvalidSession,
        op => GatewayEvent::Unknown(op),
    };
    Ok((frame.s, event))
}

pub fn identify_payload(token: &str) -> Value {
    json!({
        "op": OP_IDENTIFY,
        "d": {
            "token": token,
            "intents": INTENTS,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "farewatch",
                "device": "farewatch"
            }
        }
    })
}

pub fn heartbeat_payload(sequence: Option<u64>) -> Value {
    json!({ "op": OP_HEARTBEAT, "d": sequence })
}

/// Close codes after which reconnecting cannot succeed (bad token, bad
/// intents, bad shard or API version).
pub const FATAL_CLOSE_CODES: &[u16] = &[4004, 4010, 4011, 4012, 4013, 4014];

#[derive(Debug, Error)]
#[error("gateway closed the session with fatal code {code}: {reason}")]
pub struct FatalClose {
    pub code: u16,
    pub reason: String,
}

pub fn is_fatal_close(code: u16) -> bool {
    FATAL_CLOSE_CODES.contains(&code)
}

pub struct GatewayListener {
    token: String,
    url: String,
    handler: Arc<CommandHandler>,
    sink: Arc<dyn NotificationSink>,
    backoff: BackoffPolicy,
}

impl GatewayListener {
    pub fn new(
        token: impl Into<String>,
        handler: Arc<CommandHandler>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            token: token.into(),
            url: GATEWAY_URL.to_string(),
            handler,
            sink,
            backoff: BackoffPolicy {
                max_retries: usize::MAX,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
            },
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Reconnects after every session end, waiting at least the base delay
    /// each time. Returns only on a fatal close code.
    pub async fn run(&self) -> Result<()> {
        let mut failures = 0usize;
        loop {
            let mut ready = false;
            let outcome = self.session(&mut ready).await;
            if ready {
                failures = 0;
            }
            match outcome {
                Ok(()) => info!("gateway session ended"),
                Err(err) if err.downcast_ref::<FatalClose>().is_some() => return Err(err),
                Err(err) => warn!(error = %format!("{err:#}"), "gateway session failed"),
            }
            let delay = self.backoff.delay_for_attempt(failures);
            failures = failures.saturating_add(1);
            info!(delay_ms = delay.as_millis() as u64, "reconnecting to gateway");
            tokio::time::sleep(delay).await;
        }
    }

    async fn session(&self, ready: &mut bool) -> Result<()> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .context("connecting to discord gateway")?;
        let (mut write, mut read) = stream.split();

        let heartbeat_interval = match read.next().await {
            Some(Ok(WsMessage::Text(text))) => match decode_frame(text.as_str())?.1 {
                GatewayEvent::Hello { heartbeat_interval } => heartbeat_interval,
                other => bail!("expected hello, got {other:?}"),
            },
            Some(Ok(other)) => bail!("expected hello, got {other:?}"),
            Some(Err(err)) => return Err(err).context("reading hello"),
            None => bail!("gateway closed before hello"),
        };
        write
            .send(WsMessage::text(identify_payload(&self.token).to_string()))
            .await
            .context("sending identify")?;

        let mut heartbeat =
            tokio::time::interval(heartbeat_interval.max(Duration::from_millis(100)));
        heartbeat.tick().await;
        let mut sequence: Option<u64> = None;
        let mut awaiting_ack = false;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if awaiting_ack {
                        bail!("no heartbeat ack before the next heartbeat");
                    }
                    write
                        .send(WsMessage::text(heartbeat_payload(sequence).to_string()))
                        .await
                        .context("sending heartbeat")?;
                    awaiting_ack = true;
                }
                frame = read.next() => {
                    let text = match frame {
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(WsMessage::Close(close))) => {
                            if let Some(frame) = close {
                                let code = u16::from(frame.code);
                                if is_fatal_close(code) {
                                    return Err(FatalClose {
                                        code,
                                        reason: frame.reason.as_str().to_string(),
                                    }
                                    .into());
                                }
                                let reason = frame.reason.as_str();
                                info!(code, reason, "gateway closed the connection");
                            }
                            return Ok(());
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => return Err(err).context("reading gateway frame"),
                        None => return Ok(()),
                    };
                    let (seq, event) = match decode_frame(text.as_str()) {
                        Ok(decoded) => decoded,
                        Err(err) => {
                            let error = format!("{err:#}");
                            warn!(%error, "skipping undecodable gateway frame");
                            continue;
                        }
                    };
                    if seq.is_some() {
                        sequence = seq;
                    }
                    match event {
                        GatewayEvent::Ready => {
                            *ready = true;
                            info!("gateway session ready");
                        }
                        GatewayEvent::MessageCreate(message) => self.route(message),
                        GatewayEvent::HeartbeatRequest => {
                            write
                                .send(WsMessage::text(heartbeat_payload(sequence).to_string()))
                                .await
                                .context("answering heartbeat request")?;
                        }
                        GatewayEvent::HeartbeatAck => awaiting_ack = false,
                        GatewayEvent::Reconnect | GatewayEvent::InvalidSession => {
                            info!(?event, "gateway asked for a new session");
                            return Ok(());
                        }
                        GatewayEvent::OtherDispatch(_) | GatewayEvent::Hello { .. } => {}
                        GatewayEvent::Unknown(op) => debug!(op, "ignoring gateway opcode"),
                    }
                }
            }
        }
    }

    fn route(&self, message: IncomingMessage) {
        let prefixed = message.content.trim_start().starts_with(self.handler.prefix());
        if message.author_is_bot || !prefixed {
            return;
        }
        let handler = self.handler.clone();
        let sink = self.sink.clone();
        let span = info_span!(
            "command",
            channel_id = message.channel_id,
            user_id = %message.author_id
        );
        tokio::spawn(
            async move {
                let reply = handler.handle_line(&message.author_id, &message.content).await;
                let Some(reply) = reply else {
                    return;
                };
                let recipient = Recipient::Channel(message.channel_id);
                if let Err(err) = sink.deliver(&recipient, &reply).await {
                    warn!(error = %err, "could not deliver command reply");
                }
            }
            .instrument(span),
        );
    }
}
