use anyhow::{Context, Result};
use pipebot_core::truncate_for_error;
use pipebot_dispatch::{DispatchOutcome, FailureStage, OutcomeStatus};
use pipebot_intent::PipelineName;

use crate::transport::{ChatTransport, OutboundMessage};

pub const DONE_REPLY_PREFIX: &str = "Done. Here the link to the build status report: ";
pub const NOTHING_TO_RUN_REPLY: &str = "There was nothing to run for this request.";
pub const MAX_DETAIL_CHARS: usize = 600;

/// Renders dispatch results for chat and sends them.
#[derive(Debug, Clone, Default)]
pub struct NotificationComposer {
    announcement_channel: Option<String>,
}

impl NotificationComposer {
    pub fn new(announcement_channel: Option<String>) -> Self {
        Self {
            announcement_channel: announcement_channel
                .map(|channel| channel.trim().to_string())
                .filter(|channel| !channel.is_empty()),
        }
    }

    pub fn announcement_channel(&self) -> Option<&str> {
        self.announcement_channel.as_deref()
    }

    pub fn compose_reply(&self, pipeline: &PipelineName, outcomes: &[DispatchOutcome]) -> String {
        if outcomes.is_empty() {
            return NOTHING_TO_RUN_REPLY.to_string();
        }

        if outcomes.iter().all(DispatchOutcome::is_triggered) {
            if let [single] = outcomes {
                return format!(
                    "{DONE_REPLY_PREFIX}{}",
                    single.build_url().unwrap_or_default()
                );
            }
            let mut lines = vec![format!(
                "Done. Pipeline `{pipeline}` is running for {} targets:",
                outcomes.len()
            )];
            lines.extend(outcomes.iter().map(|outcome| {
                format!(
                    "- {}: {}",
                    outcome.target.label(),
                    outcome.build_url().unwrap_or_default()
                )
            }));
            return lines.join("\n");
        }

        let triggered = outcomes.iter().filter(|outcome| outcome.is_triggered()).count();
        let mut lines = vec![format!(
            "Pipeline `{pipeline}` started for {triggered} of {} targets:",
            outcomes.len()
        )];
        lines.extend(outcomes.iter().map(|outcome| render_outcome_line(pipeline, outcome)));
        lines.join("\n")
    }

    /// Announcement for the configured channel, or `None` when no channel is
    /// configured or nothing was started.
    pub fn compose_announcement(
        &self,
        requester: &str,
        pipeline: &PipelineName,
        outcomes: &[DispatchOutcome],
    ) -> Option<OutboundMessage> {
        let channel = self.announcement_channel.as_deref()?;
        let started = outcomes
            .iter()
            .filter_map(|outcome| {
                let branch = outcome.branch()?;
                Some(format!("{} on `{branch}`", outcome.target.label()))
            })
            .collect::<Vec<_>>();
        if started.is_empty() {
            return None;
        }
        let requester = requester.trim();
        let requester = if requester.is_empty() {
            "Someone"
        } else {
            requester
        };
        Some(OutboundMessage::bot_voice(
            channel,
            format!(
                "{requester} started pipeline `{pipeline}` for {}",
                started.join(", ")
            ),
        ))
    }

    /// Sends the reply to `channel`, then the announcement. Only the reply
    /// can fail the call.
    pub async fn deliver(
        &self,
        transport: &dyn ChatTransport,
        channel: &str,
        requester: &str,
        pipeline: &PipelineName,
        outcomes: &[DispatchOutcome],
    ) -> Result<()> {
        let reply = OutboundMessage::reply(channel, self.compose_reply(pipeline, outcomes));
        transport
            .send(&reply)
            .await
            .with_context(|| format!("failed to send dispatch reply to channel {channel}"))?;

        if let Some(announcement) = self.compose_announcement(requester, pipeline, outcomes) {
            if let Err(error) = transport.send(&announcement).await {
                tracing::warn!(
                    channel = %announcement.channel,
                    pipeline = %pipeline,
                    error = %error,
                    "release announcement was not delivered"
                );
            }
        }
        Ok(())
    }
}

fn render_outcome_line(pipeline: &PipelineName, outcome: &DispatchOutcome) -> String {
    let label = outcome.target.label();
    match &outcome.status {
        OutcomeStatus::Triggered {
            build_url, branch, ..
        } => format!("- {label}: started on `{branch}`, build report: {build_url}"),
        OutcomeStatus::Failed {
            stage: FailureStage::InfoLookup,
            detail,
        } => format!(
            "- {label}: failed to get the info from the API about this pull-request. Reason: {}",
            truncate_for_error(detail, MAX_DETAIL_CHARS)
        ),
        OutcomeStatus::Failed {
            stage: FailureStage::Trigger,
            detail,
        } => format!(
            "- {label}: I tried to run pipeline `{pipeline}` and I failed. Reason: {}",
            truncate_for_error(detail, MAX_DETAIL_CHARS)
        ),
        OutcomeStatus::NotAttempted => {
            format!("- {label}: not attempted, the bot is shutting down")
        }
    }
}
