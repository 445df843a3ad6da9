use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Pipeline selector pattern, restricted to `[a-z0-9_-]+`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineName(String);

impl PipelineName {
    /// Returns `None` unless `raw` is a non-empty `[a-z0-9_-]+` token.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty() && raw.chars().all(is_pipeline_char);
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PipelineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_pipeline_char(ch: char) -> bool {
    ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_'
}

/// A pull-request reference. `workspace`, `repository_slug` and `id` identify
/// it; `title`, `description` and `branch` stay empty until the dispatcher
/// looks the pull request up.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullRequestTarget {
    pub workspace: String,
    pub repository_slug: String,
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub branch: String,
}

impl PullRequestTarget {
    pub fn new(workspace: impl Into<String>, repository_slug: impl Into<String>, id: i64) -> Self {
        Self {
            workspace: workspace.into(),
            repository_slug: repository_slug.into(),
            id,
            ..Self::default()
        }
    }

    /// Short `workspace/slug#id` label used in replies and logs.
    pub fn label(&self) -> String {
        format!("{}/{}#{}", self.workspace, self.repository_slug, self.id)
    }
}

impl PartialEq for PullRequestTarget {
    fn eq(&self, other: &Self) -> bool {
        self.workspace == other.workspace
            && self.repository_slug == other.repository_slug
            && self.id == other.id
    }
}

impl Eq for PullRequestTarget {}

impl Hash for PullRequestTarget {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.workspace.hash(state);
        self.repository_slug.hash(state);
        self.id.hash(state);
    }
}

/// A repository named in chat; workspace and branch come from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryTarget {
    pub name: String,
}

impl RepositoryTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub pipeline: Option<PipelineName>,
    #[serde(default)]
    pub pull_requests: Vec<PullRequestTarget>,
    #[serde(default)]
    pub repositories: Vec<RepositoryTarget>,
}

impl Intent {
    pub fn has_targets(&self) -> bool {
        !self.pull_requests.is_empty() || !self.repositories.is_empty()
    }

    /// Only complete intents may be dispatched.
    pub fn is_complete(&self) -> bool {
        self.pipeline.is_some() && self.has_targets()
    }

    pub fn target_count(&self) -> usize {
        self.pull_requests.len() + self.repositories.len()
    }
}
