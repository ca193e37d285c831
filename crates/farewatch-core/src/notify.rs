//! Notification payloads and the sink contract shared by the alert job and
//! the command handlers.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Embed accent color as a 24-bit RGB value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Color(pub u32);

impl Color {
    pub const GREEN: Color = Color(0x2ECC71);
    pub const ORANGE: Color = Color(0xE67E22);
    pub const BLUE: Color = Color(0x3498DB);
    pub const RED: Color = Color(0xE74C3C);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedFooter {
    pub text: String,
}

/// Structured notification: title, description, color, ordered fields and a
/// footer. Serializes to the chat platform's embed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embed {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub color: Color,
    #[serde(default)]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
}

impl Embed {
    pub fn new(title: impl Into<String>, color: Color) -> Self {
        Self {
            title: title.into(),
            description: None,
            color,
            fields: Vec::new(),
            footer: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(EmbedField {
            name: name.into(),
            value: value.into(),
            inline: false,
        });
        self
    }

    pub fn push_field(&mut self, field: EmbedField) {
        self.fields.push(field);
    }

    pub fn footer(mut self, text: impl Into<String>) -> Self {
        self.footer = Some(EmbedFooter { text: text.into() });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Embed(Embed),
}

/// Ordered messages answering one command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub messages: Vec<Message>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::Text(text.into())],
        }
    }

    pub fn embed(embed: Embed) -> Self {
        Self {
            messages: vec![Message::Embed(embed)],
        }
    }

    pub fn then_text(mut self, text: impl Into<String>) -> Self {
        self.messages.push(Message::Text(text.into()));
        self
    }

    pub fn then_embed(mut self, embed: Embed) -> Self {
        self.messages.push(Message::Embed(embed));
        self
    }

    pub fn embeds(&self) -> impl Iterator<Item = &Embed> {
        self.messages.iter().filter_map(|m| match m {
            Message::Embed(embed) => Some(embed),
            Message::Text(_) => None,
        })
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.messages.iter().filter_map(|m| match m {
            Message::Text(text) => Some(text.as_str()),
            Message::Embed(_) => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Recipient {
    /// The configured alerts channel.
    Broadcast,
    Channel(u64),
    DirectMessage(String),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("notification transport failed: {0}")]
    Transport(String),
    #[error("recipient unavailable: {0}")]
    Recipient(String),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, recipient: &Recipient, message: &Message) -> Result<(), SinkError>;

    async fn deliver(&self, recipient: &Recipient, reply: &Reply) -> Result<(), SinkError> {
        for message in &reply.messages {
            self.send(recipient, message).await?;
        }
        Ok(())
    }
}

/// Writes plain-text renderings to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

#[async_trait]
impl NotificationSink for ConsoleSink {
    async fn send(&self, _recipient: &Recipient, message: &Message) -> Result<(), SinkError> {
        println!("{}", crate::present::render_plain(message));
        Ok(())
    }
}

/// Keeps every delivered message in memory; can be told to refuse deliveries.
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(Recipient, Message)>>,
    fail: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<(Recipient, Message)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, recipient: &Recipient, message: &Message) -> Result<(), SinkError> {
        if self.fail {
            return Err(SinkError::Transport("recording sink set to fail".into()));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((recipient.clone(), message.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embed_serializes_to_platform_shape() {
        let embed = Embed::new("Flights", Color::GREEN)
            .description("Found 1 flight")
            .field("💵 $450", "leg")
            .footer("footer");
        let json = serde_json::to_value(&embed).unwrap();
        assert_eq!(json["color"], 0x2ECC71);
        assert_eq!(json["fields"][0]["inline"], false);
        assert_eq!(json["footer"]["text"], "footer");

        let bare = serde_json::to_value(Embed::new("t", Color::BLUE)).unwrap();
        assert!(bare.get("description").is_none());
        assert!(bare.get("footer").is_none());
    }

    #[tokio::test]
    async fn deliver_stops_at_first_failure() {
        let sink = RecordingSink::failing();
        let reply = Reply::text("a").then_text("b");
        assert!(sink.deliver(&Recipient::Broadcast, &reply).await.is_err());
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn deliver_sends_messages_in_order() {
        let sink = RecordingSink::new();
        let reply = Reply::text("first").then_embed(Embed::new("second", Color::BLUE));
        sink.deliver(&Recipient::Channel(9), &reply).await.unwrap();
        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, Message::Text("first".into()));
        assert_eq!(sent[1].0, Recipient::Channel(9));
    }
}
