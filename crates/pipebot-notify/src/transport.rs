use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub text: String,
    /// Post under the bot's own identity rather than as a threaded reply.
    pub is_bot_voice: bool,
}

impl OutboundMessage {
    pub fn reply(channel: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            text: text.into(),
            is_bot_voice: false,
        }
    }

    pub fn bot_voice(channel: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            text: text.into(),
            is_bot_voice: true,
        }
    }
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<()>;
}

/// Transport that keeps every message in memory. Used by the `handle`
/// command and by tests.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<OutboundMessage>>,
    failing_channels: Vec<String>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends to any of `channels` fail instead of being recorded.
    pub fn failing_on(channels: &[&str]) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing_channels: channels.iter().map(|channel| channel.to_string()).collect(),
        }
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        if self.failing_channels.contains(&message.channel) {
            return Err(anyhow!("channel {} rejected the message", message.channel));
        }
        self.sent
            .lock()
            .map_err(|_| anyhow!("recording transport lock is poisoned"))?
            .push(message.clone());
        Ok(())
    }
}
