//! Host-facing entry point: one inbound chat message in, replies out.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context, Result};
use pipebot_conversation::{
    run_pending_migrations, run_pipeline_migrations, ConversationStore, ScenarioDictionary,
    SlotFillingCoordinator, Turn, RUN_PIPELINE_SCENARIO,
};
use pipebot_dispatch::{
    DispatchConfig, DispatchEngine, DispatchOutcome, PipelineTriggerClient, PullRequestInfoClient,
};
use pipebot_intent::matches_trigger;
use pipebot_notify::{ChatTransport, NotificationComposer, OutboundMessage};
use tokio::sync::watch;

pub const CANCELLED_REPLY: &str = "Okay, I dropped that request.";
pub const DISPATCH_FAILED_REPLY: &str =
    "Something went wrong on my side while starting the pipeline. Please try again.";

/// A message addressed to the bot, already stripped of transport markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub channel: String,
    /// Transport-specific mention of the author, used in announcements.
    pub sender: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventReport {
    /// Not a pipeline request and no conversation is pending.
    Ignored,
    Asked { prompt: String },
    Dispatched { outcomes: Vec<DispatchOutcome> },
    Cancelled,
    /// The request could not be understood; `reply` explains why.
    Rejected { reply: String },
}

#[derive(Debug, Clone, Default)]
pub struct RunPipelineEventConfig {
    pub dispatch: DispatchConfig,
    pub announcement_channel: Option<String>,
    /// 0 disables expiry.
    pub conversation_ttl_ms: u64,
}

pub struct RunPipelineEvent {
    coordinator: SlotFillingCoordinator,
    engine: DispatchEngine,
    composer: NotificationComposer,
    transport: Arc<dyn ChatTransport>,
    shutdown: watch::Receiver<bool>,
    channel_gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RunPipelineEvent {
    /// Applies pending scenario migrations and checks that the run-pipeline
    /// scenario is present afterwards.
    pub fn install(dictionary: &dyn ScenarioDictionary) -> Result<Vec<&'static str>> {
        let applied = Self::update(dictionary)?;
        dictionary
            .find_scenario(RUN_PIPELINE_SCENARIO)
            .context("failed to read scenario dictionary")?
            .ok_or_else(|| anyhow!("scenario '{RUN_PIPELINE_SCENARIO}' missing after install"))?;
        Ok(applied)
    }

    /// Applies scenario migrations added since the last install or update.
    pub fn update(dictionary: &dyn ScenarioDictionary) -> Result<Vec<&'static str>> {
        run_pending_migrations(dictionary, &run_pipeline_migrations())
            .context("failed to apply scenario migrations")
    }

    pub fn from_dictionary(
        dictionary: &dyn ScenarioDictionary,
        store: Arc<dyn ConversationStore>,
        info_client: Arc<dyn PullRequestInfoClient>,
        trigger_client: Arc<dyn PipelineTriggerClient>,
        transport: Arc<dyn ChatTransport>,
        config: RunPipelineEventConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let scenario = dictionary
            .find_scenario(RUN_PIPELINE_SCENARIO)
            .context("failed to read scenario dictionary")?
            .ok_or_else(|| {
                anyhow!("scenario '{RUN_PIPELINE_SCENARIO}' is not installed; run `pipebot install`")
            })?;
        let coordinator = SlotFillingCoordinator::new(scenario, store, config.conversation_ttl_ms)
            .context("invalid run-pipeline scenario")?;
        Ok(Self {
            coordinator,
            engine: DispatchEngine::new(info_client, trigger_client, config.dispatch),
            composer: NotificationComposer::new(config.announcement_channel),
            transport,
            shutdown,
            channel_gates: Mutex::new(HashMap::new()),
        })
    }

    /// Handles one message. Messages of the same channel are processed one
    /// at a time in arrival order. The error path is reserved for replies
    /// that could not be delivered.
    pub async fn handle(&self, message: &InboundMessage) -> Result<EventReport> {
        let gate = self.channel_gate(&message.channel)?;
        let result = {
            let _guard = gate.lock().await;
            self.handle_gated(message).await
        };
        drop(gate);
        self.release_channel_gate(&message.channel);
        result
    }

    /// True while `channel` is answering questions, so its next message
    /// belongs to this event even without a trigger keyword.
    pub fn has_pending_conversation(&self, channel: &str) -> Result<bool> {
        self.coordinator
            .has_pending_conversation(channel)
            .with_context(|| format!("failed to look up conversation for channel {channel}"))
    }

    async fn handle_gated(&self, message: &InboundMessage) -> Result<EventReport> {
        let report = self.evaluate(message).await;
        let reply = match &report {
            EventReport::Ignored | EventReport::Dispatched { .. } => None,
            EventReport::Asked { prompt } => Some(prompt.clone()),
            EventReport::Cancelled => Some(CANCELLED_REPLY.to_string()),
            EventReport::Rejected { reply } => Some(reply.clone()),
        };
        if let Some(reply) = reply {
            self.transport
                .send(&OutboundMessage::reply(&message.channel, reply))
                .await
                .with_context(|| format!("failed to reply in channel {}", message.channel))?;
        }
        Ok(report)
    }

    async fn evaluate(&self, message: &InboundMessage) -> EventReport {
        let channel = message.channel.as_str();
        let addressed = match self.is_addressed(message) {
            Ok(addressed) => addressed,
            Err(reply) => return EventReport::Rejected { reply },
        };
        if !addressed {
            tracing::debug!(channel, "message is not a pipeline request");
            return EventReport::Ignored;
        }

        let turn = match self.coordinator.handle_message(channel, &message.text) {
            Ok(turn) => turn,
            Err(error) => {
                tracing::warn!(channel, error = %error, "pipeline request rejected");
                return EventReport::Rejected {
                    reply: error.user_message(),
                };
            }
        };

        let intent = match turn {
            Turn::Ready(intent) => intent,
            Turn::AskNext { prompt } => return EventReport::Asked { prompt },
            Turn::Abandoned => return EventReport::Cancelled,
        };
        let Some(pipeline) = intent.pipeline.clone() else {
            return EventReport::Rejected {
                reply: DISPATCH_FAILED_REPLY.to_string(),
            };
        };

        let outcomes = match self
            .engine
            .dispatch_until(&intent, self.shutdown.clone())
            .await
        {
            Ok(outcomes) => outcomes,
            Err(error) => {
                tracing::warn!(channel, error = %error, "dispatch refused");
                return EventReport::Rejected {
                    reply: DISPATCH_FAILED_REPLY.to_string(),
                };
            }
        };

        if let Err(error) = self
            .composer
            .deliver(
                self.transport.as_ref(),
                channel,
                &message.sender,
                &pipeline,
                &outcomes,
            )
            .await
        {
            tracing::warn!(channel, error = %format!("{error:#}"), "dispatch reply was not delivered");
        }
        EventReport::Dispatched { outcomes }
    }

    fn is_addressed(&self, message: &InboundMessage) -> std::result::Result<bool, String> {
        match self.coordinator.has_pending_conversation(&message.channel) {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(error) => {
                tracing::warn!(channel = %message.channel, error = %error, "conversation lookup failed");
                return Err(error.user_message());
            }
        }
        matches_trigger(&message.text).map_err(|error| {
            tracing::warn!(channel = %message.channel, error = %error, "trigger rule failed");
            error.user_message().to_string()
        })
    }

    fn channel_gate(&self, channel: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut gates = self
            .channel_gates
            .lock()
            .map_err(|_| anyhow!("channel gate registry is poisoned"))?;
        Ok(gates.entry(channel.to_string()).or_default().clone())
    }

    fn release_channel_gate(&self, channel: &str) {
        let Ok(mut gates) = self.channel_gates.lock() else {
            return;
        };
        if gates
            .get(channel)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            gates.remove(channel);
        }
    }

    #[cfg(test)]
    fn tracked_channel_count(&self) -> usize {
        self.channel_gates.lock().map(|gates| gates.len()).unwrap_or_default()
    }
}
