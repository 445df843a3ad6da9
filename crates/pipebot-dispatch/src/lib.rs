//! Multi-target pipeline dispatch.
//!
//! [`DispatchEngine`] runs one trigger attempt per target of a complete
//! [`pipebot_intent::Intent`], isolating failures so every target gets exactly
//! one [`DispatchOutcome`], in input order.

pub mod dispatch_engine;
pub mod dispatch_types;
pub mod downstream;

pub use dispatch_engine::{build_status_url, DispatchConfig, DispatchEngine};
pub use dispatch_types::{DispatchOutcome, DispatchTarget, FailureStage, OutcomeStatus};
pub use downstream::{
    PipelineSelector, PipelineTarget, PipelineTriggerClient, PipelineTriggerRequest,
    PullRequestInfo, PullRequestInfoClient, TriggeredPipeline,
};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("refusing to dispatch an incomplete intent")]
    IncompleteIntent,
}
