//! Contracts for the CI platform clients the dispatcher drives.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const REF_TYPE_BRANCH: &str = "branch";
const TARGET_TYPE_PIPELINE_REF: &str = "pipeline_ref_target";
const SELECTOR_TYPE_CUSTOM: &str = "custom";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PullRequestInfo {
    pub title: String,
    pub description: String,
    pub source_branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSelector {
    #[serde(rename = "type")]
    pub selector_type: String,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineTarget {
    pub ref_name: String,
    pub ref_type: String,
    #[serde(rename = "type")]
    pub target_type: String,
    pub selector: PipelineSelector,
}

/// Body of a pipeline-trigger call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineTriggerRequest {
    pub target: PipelineTarget,
}

impl PipelineTriggerRequest {
    /// Runs the custom pipeline `pipeline` on the head of `branch`.
    pub fn custom_pipeline_on_branch(branch: &str, pipeline: &str) -> Self {
        Self {
            target: PipelineTarget {
                ref_name: branch.to_string(),
                ref_type: REF_TYPE_BRANCH.to_string(),
                target_type: TARGET_TYPE_PIPELINE_REF.to_string(),
                selector: PipelineSelector {
                    selector_type: SELECTOR_TYPE_CUSTOM.to_string(),
                    pattern: pipeline.to_string(),
                },
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TriggeredPipeline {
    pub build_number: u64,
}

#[async_trait]
pub trait PullRequestInfoClient: Send + Sync {
    async fn pull_request_info(
        &self,
        workspace: &str,
        repository_slug: &str,
        id: i64,
    ) -> anyhow::Result<PullRequestInfo>;
}

/// Starts pipelines. Retry policy, if any, belongs to the implementation.
#[async_trait]
pub trait PipelineTriggerClient: Send + Sync {
    async fn trigger_pipeline(
        &self,
        workspace: &str,
        repository_slug: &str,
        request: &PipelineTriggerRequest,
    ) -> anyhow::Result<TriggeredPipeline>;
}
