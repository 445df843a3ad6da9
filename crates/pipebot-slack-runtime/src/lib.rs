//! Chat-facing runtime for pipebot.
//!
//! [`RunPipelineEvent`] is the transport-neutral handler a host feeds inbound
//! messages to; [`run_slack_bridge`] hosts it on a Slack Socket Mode
//! connection.

pub mod run_pipeline_event;
pub mod slack_runtime;

pub use run_pipeline_event::{
    EventReport, InboundMessage, RunPipelineEvent, RunPipelineEventConfig, CANCELLED_REPLY,
    DISPATCH_FAILED_REPLY,
};
pub use slack_runtime::{
    run_slack_bridge, SlackApiClient, SlackApiClientConfig, SlackBridgeRuntimeConfig,
};
