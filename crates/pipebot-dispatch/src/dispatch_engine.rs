use std::{future::Future, sync::Arc, time::Duration};

use pipebot_intent::{Intent, PipelineName, PullRequestTarget, RepositoryTarget};
use tokio::sync::{watch, Semaphore};

use crate::dispatch_types::{DispatchOutcome, DispatchTarget, FailureStage, OutcomeStatus};
use crate::downstream::{PipelineTriggerClient, PipelineTriggerRequest, PullRequestInfoClient};
use crate::DispatchError;

pub const DEFAULT_WEB_BASE: &str = "https://bitbucket.org";

/// Settings for target resolution, fan-out, and per-call deadlines.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Workspace that bare repository names live in.
    pub default_workspace: String,
    /// Branch that repository targets are built from.
    pub default_branch: String,
    /// Web origin used to build links to build results.
    pub web_base: String,
    pub max_concurrency: usize,
    pub call_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_workspace: String::new(),
            default_branch: "master".to_string(),
            web_base: DEFAULT_WEB_BASE.to_string(),
            max_concurrency: 4,
            call_timeout: Duration::from_secs(20),
        }
    }
}

/// Link to the result page of a started pipeline.
pub fn build_status_url(
    web_base: &str,
    workspace: &str,
    repository_slug: &str,
    build_number: u64,
) -> String {
    format!(
        "{}/{workspace}/{repository_slug}/addon/pipelines/home#!/results/{build_number}",
        web_base.trim_end_matches('/')
    )
}

pub struct DispatchEngine {
    info_client: Arc<dyn PullRequestInfoClient>,
    trigger_client: Arc<dyn PipelineTriggerClient>,
    config: DispatchConfig,
}

impl DispatchEngine {
    pub fn new(
        info_client: Arc<dyn PullRequestInfoClient>,
        trigger_client: Arc<dyn PipelineTriggerClient>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            info_client,
            trigger_client,
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub async fn dispatch(&self, intent: &Intent) -> Result<Vec<DispatchOutcome>, DispatchError> {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        self.dispatch_until(intent, shutdown_rx).await
    }

    /// Dispatches every target of `intent`: pull requests first, then
    /// repositories, each in extraction order. Once `shutdown` flips to true
    /// no further calls are issued and remaining targets are reported as
    /// [`OutcomeStatus::NotAttempted`].
    pub async fn dispatch_until(
        &self,
        intent: &Intent,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<DispatchOutcome>, DispatchError> {
        let pipeline = match (&intent.pipeline, intent.has_targets()) {
            (Some(pipeline), true) => pipeline.clone(),
            _ => return Err(DispatchError::IncompleteIntent),
        };

        let targets = intent
            .pull_requests
            .iter()
            .cloned()
            .map(DispatchTarget::PullRequest)
            .chain(
                intent
                    .repositories
                    .iter()
                    .cloned()
                    .map(DispatchTarget::Repository),
            )
            .collect::<Vec<_>>();

        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut scheduled = Vec::with_capacity(targets.len());
        for target in targets {
            if *shutdown.borrow() {
                scheduled.push((target, None));
                continue;
            }
            let permit = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => None,
                permit = permits.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                scheduled.push((target, None));
                continue;
            };

            let job = TargetJob {
                info_client: self.info_client.clone(),
                trigger_client: self.trigger_client.clone(),
                config: self.config.clone(),
                pipeline: pipeline.clone(),
                shutdown: shutdown.clone(),
            };
            let task_target = target.clone();
            let handle = tokio::spawn(async move {
                let outcome = job.run(task_target).await;
                drop(permit);
                outcome
            });
            scheduled.push((target, Some(handle)));
        }

        let mut outcomes = Vec::with_capacity(scheduled.len());
        for (target, handle) in scheduled {
            let outcome = match handle {
                None => DispatchOutcome {
                    target,
                    status: OutcomeStatus::NotAttempted,
                },
                Some(handle) => match handle.await {
                    Ok(outcome) => outcome,
                    Err(error) => DispatchOutcome {
                        target,
                        status: OutcomeStatus::Failed {
                            stage: FailureStage::Trigger,
                            detail: format!("dispatch task ended unexpectedly: {error}"),
                        },
                    },
                },
            };
            outcomes.push(outcome);
        }

        let triggered = outcomes.iter().filter(|outcome| outcome.is_triggered()).count();
        tracing::info!(
            pipeline = %pipeline,
            targets = outcomes.len(),
            triggered,
            "dispatch finished"
        );
        Ok(outcomes)
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Sender gone: shutdown can no longer be requested.
            std::future::pending::<()>().await;
        }
    }
}

struct TargetJob {
    info_client: Arc<dyn PullRequestInfoClient>,
    trigger_client: Arc<dyn PipelineTriggerClient>,
    config: DispatchConfig,
    pipeline: PipelineName,
    shutdown: watch::Receiver<bool>,
}

impl TargetJob {
    async fn run(self, target: DispatchTarget) -> DispatchOutcome {
        let outcome = match target {
            DispatchTarget::PullRequest(pull_request) => self.run_pull_request(pull_request).await,
            DispatchTarget::Repository(repository) => self.run_repository(repository).await,
        };
        match &outcome.status {
            OutcomeStatus::Triggered { build_url, .. } => tracing::info!(
                pipeline = %self.pipeline,
                dispatch_target = %outcome.target.label(),
                build_url = %build_url,
                "pipeline triggered"
            ),
            OutcomeStatus::Failed { stage, detail } => tracing::warn!(
                pipeline = %self.pipeline,
                dispatch_target = %outcome.target.label(),
                stage = ?stage,
                detail = %detail,
                "pipeline dispatch failed"
            ),
            OutcomeStatus::NotAttempted => tracing::debug!(
                pipeline = %self.pipeline,
                dispatch_target = %outcome.target.label(),
                "pipeline dispatch skipped during shutdown"
            ),
        }
        outcome
    }

    async fn run_pull_request(&self, mut pull_request: PullRequestTarget) -> DispatchOutcome {
        let lookup = self
            .bounded("pull-request info lookup", {
                let workspace = pull_request.workspace.clone();
                let slug = pull_request.repository_slug.clone();
                let id = pull_request.id;
                let client = self.info_client.clone();
                async move { client.pull_request_info(&workspace, &slug, id).await }
            })
            .await;
        let info = match lookup {
            Ok(info) if !info.source_branch.trim().is_empty() => info,
            Ok(_) => {
                return failed(
                    DispatchTarget::PullRequest(pull_request),
                    FailureStage::InfoLookup,
                    "pull request has no source branch".to_string(),
                )
            }
            Err(detail) => {
                return failed(
                    DispatchTarget::PullRequest(pull_request),
                    FailureStage::InfoLookup,
                    detail,
                )
            }
        };

        pull_request.title = info.title;
        pull_request.description = info.description.replace('\\', "");
        pull_request.branch = info.source_branch;

        if *self.shutdown.borrow() {
            return DispatchOutcome {
                target: DispatchTarget::PullRequest(pull_request),
                status: OutcomeStatus::NotAttempted,
            };
        }

        let workspace = pull_request.workspace.clone();
        let slug = pull_request.repository_slug.clone();
        let branch = pull_request.branch.clone();
        self.trigger(DispatchTarget::PullRequest(pull_request), workspace, slug, branch)
            .await
    }

    async fn run_repository(&self, repository: RepositoryTarget) -> DispatchOutcome {
        let workspace = self.config.default_workspace.trim().to_string();
        if workspace.is_empty() {
            return failed(
                DispatchTarget::Repository(repository),
                FailureStage::Trigger,
                "no default workspace is configured for repository targets".to_string(),
            );
        }
        let slug = repository.name.clone();
        let branch = self.config.default_branch.clone();
        self.trigger(DispatchTarget::Repository(repository), workspace, slug, branch)
            .await
    }

    async fn trigger(
        &self,
        target: DispatchTarget,
        workspace: String,
        slug: String,
        branch: String,
    ) -> DispatchOutcome {
        let request =
            PipelineTriggerRequest::custom_pipeline_on_branch(&branch, self.pipeline.as_str());
        let client = self.trigger_client.clone();
        let call_workspace = workspace.clone();
        let call_slug = slug.clone();
        let result = self
            .bounded("pipeline trigger", async move {
                client
                    .trigger_pipeline(&call_workspace, &call_slug, &request)
                    .await
            })
            .await;
        match result {
            Ok(triggered) => DispatchOutcome {
                target,
                status: OutcomeStatus::Triggered {
                    build_number: triggered.build_number,
                    build_url: build_status_url(
                        &self.config.web_base,
                        &workspace,
                        &slug,
                        triggered.build_number,
                    ),
                    branch,
                },
            },
            Err(detail) => failed(target, FailureStage::Trigger, detail),
        }
    }

    /// Runs one downstream call under the configured deadline, flattening
    /// errors and timeouts into a detail string.
    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, String> {
        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(format!("{operation} failed: {error:#}")),
            Err(_) => Err(format!(
                "{operation} timed out after {}ms",
                self.config.call_timeout.as_millis()
            )),
        }
    }
}

fn failed(target: DispatchTarget, stage: FailureStage, detail: String) -> DispatchOutcome {
    DispatchOutcome {
        target,
        status: OutcomeStatus::Failed { stage, detail },
    }
}
