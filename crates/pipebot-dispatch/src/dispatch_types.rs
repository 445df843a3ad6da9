use pipebot_intent::{PullRequestTarget, RepositoryTarget};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchTarget {
    PullRequest(PullRequestTarget),
    Repository(RepositoryTarget),
}

impl DispatchTarget {
    pub fn label(&self) -> String {
        match self {
            Self::PullRequest(pull_request) => pull_request.label(),
            Self::Repository(repository) => format!("repository {}", repository.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    InfoLookup,
    Trigger,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Triggered {
        build_number: u64,
        build_url: String,
        branch: String,
    },
    Failed {
        stage: FailureStage,
        detail: String,
    },
    /// Skipped because the dispatcher was shutting down.
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub target: DispatchTarget,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

impl DispatchOutcome {
    pub fn is_triggered(&self) -> bool {
        matches!(self.status, OutcomeStatus::Triggered { .. })
    }

    pub fn build_url(&self) -> Option<&str> {
        match &self.status {
            OutcomeStatus::Triggered { build_url, .. } => Some(build_url),
            _ => None,
        }
    }

    pub fn branch(&self) -> Option<&str> {
        match &self.status {
            OutcomeStatus::Triggered { branch, .. } => Some(branch),
            _ => None,
        }
    }
}
