//! Bitbucket 2.0 API client for pull-request lookups and pipeline triggers.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use pipebot_core::{
    is_retryable_status, is_retryable_transport_error, parse_retry_after, retry_delay,
    truncate_for_error,
};
use pipebot_dispatch::{
    PipelineTriggerClient, PipelineTriggerRequest, PullRequestInfo, PullRequestInfoClient,
    TriggeredPipeline,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;

pub const DEFAULT_BITBUCKET_API_BASE: &str = "https://api.bitbucket.org/2.0";
const RETRY_ATTEMPT_HEADER: &str = "x-pipebot-retry-attempt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BitbucketAuth {
    Anonymous,
    /// Username plus app password.
    Basic {
        username: String,
        app_password: String,
    },
    Bearer(String),
}

impl BitbucketAuth {
    /// Picks bearer auth when a token is set, else basic auth when both
    /// halves of the app password pair are set.
    pub fn from_parts(username: &str, app_password: &str, token: &str) -> Self {
        let (username, app_password, token) = (username.trim(), app_password.trim(), token.trim());
        if !token.is_empty() {
            return Self::Bearer(token.to_string());
        }
        if !username.is_empty() && !app_password.is_empty() {
            return Self::Basic {
                username: username.to_string(),
                app_password: app_password.to_string(),
            };
        }
        Self::Anonymous
    }

    fn apply(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Self::Anonymous => builder,
            Self::Basic {
                username,
                app_password,
            } => builder.basic_auth(username, Some(app_password)),
            Self::Bearer(token) => builder.bearer_auth(token),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BitbucketClientConfig {
    pub api_base: String,
    pub auth: BitbucketAuth,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
}

impl Default for BitbucketClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_BITBUCKET_API_BASE.to_string(),
            auth: BitbucketAuth::Anonymous,
            request_timeout_ms: 15_000,
            retry_max_attempts: 3,
            retry_base_delay_ms: 500,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    source: Option<PullRequestEndpoint>,
}

#[derive(Debug, Deserialize)]
struct PullRequestEndpoint {
    branch: Option<BranchRef>,
}

#[derive(Debug, Deserialize)]
struct BranchRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PipelineResponse {
    build_number: Option<u64>,
}

#[derive(Clone)]
pub struct BitbucketClient {
    http: reqwest::Client,
    api_base: String,
    auth: BitbucketAuth,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl BitbucketClient {
    pub fn new(config: BitbucketClientConfig) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("pipebot"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .context("failed to create bitbucket api client")?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            auth: config.auth,
            retry_max_attempts: config.retry_max_attempts.max(1),
            retry_base_delay_ms: config.retry_base_delay_ms.max(1),
        })
    }

    fn repository_url(&self, workspace: &str, repository_slug: &str) -> String {
        format!(
            "{}/repositories/{workspace}/{repository_slug}",
            self.api_base
        )
    }

    /// Sends the request built by `builder`, retrying rate limits, server
    /// errors and transport failures. Requests that are not `idempotent` are
    /// only retried when the server cannot have acted on them (429 and
    /// connection failures).
    async fn request_json<T, F>(
        &self,
        operation: &str,
        mut builder: F,
        idempotent: bool,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let response = self
                .auth
                .apply(builder())
                .header(RETRY_ATTEMPT_HEADER, attempt.saturating_sub(1).to_string())
                .send()
                .await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<T>()
                            .await
                            .with_context(|| format!("failed to decode bitbucket {operation}"));
                    }

                    let retry_after = parse_retry_after(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    let retryable = if idempotent {
                        is_retryable_status(status.as_u16())
                    } else {
                        status.as_u16() == 429
                    };
                    if attempt < self.retry_max_attempts && retryable {
                        tracing::debug!(
                            operation,
                            attempt,
                            status = status.as_u16(),
                            "retrying bitbucket request"
                        );
                        tokio::time::sleep(retry_delay(
                            self.retry_base_delay_ms,
                            attempt,
                            retry_after,
                        ))
                        .await;
                        continue;
                    }

                    bail!(
                        "bitbucket api {operation} failed with status {}: {}",
                        status.as_u16(),
                        truncate_for_error(&body, 800)
                    );
                }
                Err(error) => {
                    let retryable = if idempotent {
                        is_retryable_transport_error(&error)
                    } else {
                        error.is_connect()
                    };
                    if attempt < self.retry_max_attempts && retryable {
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, None))
                            .await;
                        continue;
                    }
                    return Err(error)
                        .with_context(|| format!("bitbucket api {operation} request failed"));
                }
            }
        }
    }
}

#[async_trait]
impl PullRequestInfoClient for BitbucketClient {
    async fn pull_request_info(
        &self,
        workspace: &str,
        repository_slug: &str,
        id: i64,
    ) -> Result<PullRequestInfo> {
        let url = format!(
            "{}/pullrequests/{id}",
            self.repository_url(workspace, repository_slug)
        );
        let response: PullRequestResponse = self
            .request_json("pull request lookup", || self.http.get(&url), true)
            .await?;
        let source_branch = response
            .source
            .and_then(|source| source.branch)
            .map(|branch| branch.name)
            .unwrap_or_default();
        Ok(PullRequestInfo {
            title: response.title,
            description: response.description,
            source_branch,
        })
    }
}

#[async_trait]
impl PipelineTriggerClient for BitbucketClient {
    async fn trigger_pipeline(
        &self,
        workspace: &str,
        repository_slug: &str,
        request: &PipelineTriggerRequest,
    ) -> Result<TriggeredPipeline> {
        let url = format!(
            "{}/pipelines/",
            self.repository_url(workspace, repository_slug)
        );
        let response: PipelineResponse = self
            .request_json(
                "pipeline trigger",
                || self.http.post(&url).json(request),
                false,
            )
            .await?;
        let build_number = response
            .build_number
            .ok_or_else(|| anyhow!("bitbucket pipeline trigger response missing build_number"))?;
        Ok(TriggeredPipeline { build_number })
    }
}
