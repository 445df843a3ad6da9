//! Intent model and lexical extraction rules for pipeline-trigger chat commands.
//!
//! A chat message such as `start staging-deploy repository api-gateway` is
//! turned into an [`Intent`]: one pipeline name plus any number of
//! pull-request and repository targets. Each entity has its own named rule in
//! [`extraction_rules`] so the rules can be tested and changed independently.

pub mod extraction_rules;
pub mod intent_types;

pub use extraction_rules::{
    destination_from_answer, extract_intent, extract_pipeline, extract_pull_requests,
    extract_repositories, matches_trigger, pipeline_from_answer,
};
pub use intent_types::{Intent, PipelineName, PullRequestTarget, RepositoryTarget};

use thiserror::Error;

/// Errors produced while extracting an intent from chat text.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("pull-request link '{url}' has an invalid id '{raw_id}'")]
    MalformedReference { url: String, raw_id: String },
    #[error("extraction rule '{pattern}' failed to compile: {source}")]
    InvalidRule {
        pattern: &'static str,
        #[source]
        source: regex::Error,
    },
}

impl ExtractionError {
    /// Text shown to the requester when their message could not be parsed.
    pub fn user_message(&self) -> &'static str {
        "Failed to extract the data from your message"
    }
}
