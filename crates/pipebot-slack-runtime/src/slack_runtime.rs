//! Socket-mode Slack bridge feeding chat messages to [`RunPipelineEvent`].

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use pipebot_core::{current_unix_timestamp_ms, is_older_than};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::run_pipeline_event::{InboundMessage, RunPipelineEvent};

mod processed_event_ledger;
mod slack_api_client;

use processed_event_ledger::ProcessedEventLedger;
pub use slack_api_client::{SlackApiClient, SlackApiClientConfig};

#[derive(Debug, Clone)]
pub struct SlackBridgeRuntimeConfig {
    pub state_dir: PathBuf,
    /// Resolved through `auth.test` when unset.
    pub bot_user_id: Option<String>,
    pub processed_event_cap: usize,
    /// Events older than this are acknowledged and dropped; 0 disables.
    pub max_event_age_seconds: u64,
    pub reconnect_delay: Duration,
    /// How long in-flight messages may run after shutdown is requested.
    pub shutdown_grace: Duration,
    /// A channel worker with nothing queued for this long exits.
    pub channel_idle_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct SlackSocketEnvelope {
    #[serde(default)]
    envelope_id: String,
    #[serde(rename = "type")]
    envelope_type: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlackBridgeEventKind {
    AppMention,
    DirectMessage,
    ChannelMessage,
}

impl SlackBridgeEventKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::AppMention => "app_mention",
            Self::DirectMessage => "message.im",
            Self::ChannelMessage => "message.channels",
        }
    }
}

#[derive(Debug, Clone)]
struct SlackBridgeEvent {
    key: String,
    kind: SlackBridgeEventKind,
    event_id: String,
    occurred_unix_ms: u64,
    channel_id: String,
    user_id: String,
    text: String,
    mentions_bot: bool,
}

impl SlackBridgeEvent {
    /// Plain channel chatter only counts as an answer to a pending
    /// conversation; new requests in a channel must mention the bot.
    fn needs_pending_conversation(&self) -> bool {
        self.kind == SlackBridgeEventKind::ChannelMessage && !self.mentions_bot
    }

    fn into_inbound_message(self, bot_user_id: &str) -> InboundMessage {
        InboundMessage {
            text: strip_bot_mention(&self.text, bot_user_id),
            sender: format!("<@{}>", self.user_id),
            channel: self.channel_id,
        }
    }
}

#[derive(Debug)]
struct QueuedMessage {
    message: InboundMessage,
    needs_pending_conversation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionExit {
    Closed,
    ShutdownRequested,
}

/// Runs the bridge until ctrl-c. `shutdown_tx` is flipped to true on exit so
/// in-flight dispatches stop issuing new trigger calls.
pub async fn run_slack_bridge(
    config: SlackBridgeRuntimeConfig,
    slack_client: Arc<SlackApiClient>,
    event: Arc<RunPipelineEvent>,
    shutdown_tx: watch::Sender<bool>,
) -> Result<()> {
    let mut runtime = SlackBridgeRuntime::new(config, slack_client, event, shutdown_tx).await?;
    let result = runtime.run().await;
    runtime.shutdown().await;
    result
}

struct SlackBridgeRuntime {
    config: SlackBridgeRuntimeConfig,
    slack_client: Arc<SlackApiClient>,
    event: Arc<RunPipelineEvent>,
    ledger: ProcessedEventLedger,
    bot_user_id: String,
    channel_workers: HashMap<String, mpsc::UnboundedSender<QueuedMessage>>,
    workers: JoinSet<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl SlackBridgeRuntime {
    async fn new(
        config: SlackBridgeRuntimeConfig,
        slack_client: Arc<SlackApiClient>,
        event: Arc<RunPipelineEvent>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.state_dir)
            .with_context(|| format!("failed to create {}", config.state_dir.display()))?;

        let bot_user_id = match config.bot_user_id.clone() {
            Some(user_id) if !user_id.trim().is_empty() => user_id.trim().to_string(),
            _ => slack_client.resolve_bot_user_id().await?,
        };
        let ledger = ProcessedEventLedger::open(
            config.state_dir.join("slack-state.json"),
            config.processed_event_cap,
        )?;

        Ok(Self {
            config,
            slack_client,
            event,
            ledger,
            bot_user_id,
            channel_workers: HashMap::new(),
            workers: JoinSet::new(),
            shutdown_tx,
        })
    }

    async fn run(&mut self) -> Result<()> {
        loop {
            let socket_url = match self.slack_client.open_socket_connection().await {
                Ok(url) => Some(url),
                Err(error) => {
                    tracing::warn!(error = %format!("{error:#}"), "slack socket connection failed");
                    None
                }
            };

            if let Some(socket_url) = socket_url {
                tracing::info!("slack bridge socket connected");
                match self.run_socket_session(&socket_url).await {
                    Ok(SessionExit::ShutdownRequested) => return Ok(()),
                    Ok(SessionExit::Closed) => tracing::info!("slack socket closed"),
                    Err(error) => {
                        tracing::warn!(error = %format!("{error:#}"), "slack socket session error")
                    }
                }
            }

            tokio::select! {
                _ = tokio::signal::ctrl_c() => return Ok(()),
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    async fn run_socket_session(&mut self, socket_url: &str) -> Result<SessionExit> {
        let (stream, _response) = connect_async(socket_url)
            .await
            .context("failed to connect slack socket mode websocket")?;
        let (mut sink, mut source) = stream.split();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => return Ok(SessionExit::ShutdownRequested),
                maybe_message = source.next() => {
                    let Some(message_result) = maybe_message else {
                        return Ok(SessionExit::Closed);
                    };
                    let message = message_result.context("failed reading slack websocket message")?;
                    let Some(envelope) = parse_socket_envelope(message)? else {
                        continue;
                    };
                    if envelope.envelope_type == "disconnect" {
                        return Ok(SessionExit::Closed);
                    }
                    if !envelope.envelope_id.is_empty() {
                        ack_envelope(&mut sink, &envelope.envelope_id).await?;
                    }
                    self.accept_envelope(&envelope);
                }
            }
        }
    }

    /// A bad envelope is logged and skipped; it never ends the session.
    fn accept_envelope(&mut self, envelope: &SlackSocketEnvelope) {
        if let Err(error) = self.handle_envelope(envelope) {
            tracing::warn!(
                envelope_type = %envelope.envelope_type,
                envelope_id = %envelope.envelope_id,
                error = %format!("{error:#}"),
                "skipping slack envelope"
            );
        }
    }

    /// Deduplicates, filters and queues one envelope for its channel worker.
    fn handle_envelope(&mut self, envelope: &SlackSocketEnvelope) -> Result<()> {
        let Some(event) = normalize_socket_envelope(envelope, &self.bot_user_id)? else {
            return Ok(());
        };

        if !self.ledger.record(&event.key) {
            tracing::debug!(event_key = %event.key, "skipping duplicate slack event");
            return Ok(());
        }
        self.ledger.persist()?;

        let max_age_ms = self.config.max_event_age_seconds.saturating_mul(1_000);
        if is_older_than(event.occurred_unix_ms, max_age_ms, current_unix_timestamp_ms()) {
            tracing::debug!(event_key = %event.key, "skipping stale slack event");
            return Ok(());
        }

        tracing::debug!(
            event_key = %event.key,
            event_id = %event.event_id,
            kind = event.kind.as_str(),
            channel = %event.channel_id,
            "queueing slack message"
        );
        let needs_pending_conversation = event.needs_pending_conversation();
        self.enqueue(QueuedMessage {
            message: event.into_inbound_message(&self.bot_user_id),
            needs_pending_conversation,
        });
        Ok(())
    }

    fn enqueue(&mut self, queued: QueuedMessage) {
        // Idle workers close their queue and exit; forget them here.
        self.channel_workers.retain(|_, sender| !sender.is_closed());
        while self.workers.try_join_next().is_some() {}

        let channel = queued.message.channel.clone();
        let queued = match self.channel_workers.get(&channel) {
            Some(sender) => match sender.send(queued) {
                Ok(()) => return,
                Err(mpsc::error::SendError(queued)) => queued,
            },
            None => queued,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        // A fresh channel cannot be closed yet.
        let _ = sender.send(queued);
        self.workers.spawn(run_channel_worker(
            self.event.clone(),
            receiver,
            self.config.channel_idle_timeout,
        ));
        self.channel_workers.insert(channel, sender);
    }

    async fn shutdown(&mut self) {
        tracing::info!("slack bridge shutdown requested");
        let _ = self.shutdown_tx.send(true);
        self.channel_workers.clear();
        let grace = self.config.shutdown_grace;
        let workers = &mut self.workers;
        let drained = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("slack bridge shutdown grace elapsed, aborting channel workers");
            self.workers.abort_all();
        }
    }
}

async fn run_channel_worker(
    event: Arc<RunPipelineEvent>,
    mut receiver: mpsc::UnboundedReceiver<QueuedMessage>,
    idle_timeout: Duration,
) {
    loop {
        match tokio::time::timeout(idle_timeout, receiver.recv()).await {
            Ok(Some(queued)) => process_queued_message(&event, queued).await,
            Ok(None) => return,
            Err(_) => break,
        }
    }
    // Anything sent before the close still belongs to this worker.
    receiver.close();
    while let Some(queued) = receiver.recv().await {
        process_queued_message(&event, queued).await;
    }
}

async fn process_queued_message(event: &RunPipelineEvent, queued: QueuedMessage) {
    let QueuedMessage {
        message,
        needs_pending_conversation,
    } = queued;
    if needs_pending_conversation {
        match event.has_pending_conversation(&message.channel) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(channel = %message.channel, "ignoring channel message without bot mention");
                return;
            }
            Err(error) => {
                tracing::warn!(channel = %message.channel, error = %format!("{error:#}"), "slack message dropped");
                return;
            }
        }
    }
    match event.handle(&message).await {
        Ok(report) => {
            tracing::debug!(channel = %message.channel, report = ?report, "slack message handled")
        }
        Err(error) => tracing::warn!(
            channel = %message.channel,
            error = %format!("{error:#}"),
            "slack message handling failed"
        ),
    }
}

async fn ack_envelope<S>(sink: &mut S, envelope_id: &str) -> Result<()>
where
    S: futures_util::Sink<WsMessage> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let ack = json!({ "envelope_id": envelope_id }).to_string();
    sink.send(WsMessage::Text(ack.into()))
        .await
        .context("failed to send slack socket ack")
}

fn parse_socket_envelope(message: WsMessage) -> Result<Option<SlackSocketEnvelope>> {
    let text = match message {
        WsMessage::Text(text) => text.as_str().to_owned(),
        WsMessage::Binary(bytes) => {
            String::from_utf8(bytes.to_vec()).context("invalid utf-8 slack socket payload")?
        }
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Close(_) | WsMessage::Frame(_) => {
            return Ok(None)
        }
    };
    serde_json::from_str::<SlackSocketEnvelope>(&text)
        .map(Some)
        .context("failed to parse slack socket envelope")
}

#[derive(Debug, Deserialize)]
struct SlackEventCallbackEnvelope {
    event_id: String,
    event_time: u64,
    event: SlackEventPayload,
}

#[derive(Debug, Deserialize)]
struct SlackEventPayload {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    channel_type: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

/// Keeps human-authored mentions and messages. Edits, joins and other
/// subtyped messages are dropped along with anything a bot posted.
fn normalize_socket_envelope(
    envelope: &SlackSocketEnvelope,
    bot_user_id: &str,
) -> Result<Option<SlackBridgeEvent>> {
    if envelope.envelope_type != "events_api" {
        return Ok(None);
    }

    // `app_rate_limited` and friends share the envelope type but carry no event.
    if envelope.payload.get("type").and_then(Value::as_str) != Some("event_callback") {
        return Ok(None);
    }
    let callback = serde_json::from_value::<SlackEventCallbackEnvelope>(envelope.payload.clone())
        .context("failed to decode slack event callback payload")?;

    let event = callback.event;
    if event.subtype.is_some() || event.bot_id.is_some() {
        return Ok(None);
    }
    let user_id = match event.user {
        Some(user) if !user.trim().is_empty() => user,
        _ => return Ok(None),
    };
    if user_id == bot_user_id {
        return Ok(None);
    }
    let channel_id = match event.channel {
        Some(channel) if !channel.trim().is_empty() => channel,
        _ => return Ok(None),
    };
    let message_ts = match event.ts {
        Some(ts) if !ts.trim().is_empty() => ts,
        _ => return Ok(None),
    };

    let kind = match event.event_type.as_str() {
        "app_mention" => SlackBridgeEventKind::AppMention,
        "message" if event.channel_type.as_deref() == Some("im") || channel_id.starts_with('D') => {
            SlackBridgeEventKind::DirectMessage
        }
        "message" => SlackBridgeEventKind::ChannelMessage,
        _ => return Ok(None),
    };

    let text = event.text.unwrap_or_default();
    Ok(Some(SlackBridgeEvent {
        key: format!("{channel_id}:{message_ts}"),
        kind,
        event_id: callback.event_id,
        occurred_unix_ms: callback.event_time.saturating_mul(1_000),
        channel_id,
        user_id,
        mentions_bot: text.contains(&format!("<@{bot_user_id}>")),
        text,
    }))
}

fn strip_bot_mention(text: &str, bot_user_id: &str) -> String {
    let mention = format!("<@{bot_user_id}>");
    text.replace(&mention, " ").trim().to_string()
}
