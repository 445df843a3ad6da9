use std::{collections::HashSet, path::Path, sync::Arc};

use async_trait::async_trait;
use pipebot_conversation::{
    FileConversationStore, FileScenarioDictionary, InMemoryConversationStore,
    InMemoryScenarioDictionary, ScenarioDictionary,
};
use pipebot_dispatch::{
    DispatchConfig, FailureStage, OutcomeStatus, PipelineTriggerClient, PipelineTriggerRequest,
    PullRequestInfo, PullRequestInfoClient, TriggeredPipeline,
};
use pipebot_notify::RecordingTransport;
use pipebot_slack_runtime::{EventReport, InboundMessage, RunPipelineEvent, RunPipelineEventConfig};
use tempfile::tempdir;
use tokio::sync::{watch, Mutex as AsyncMutex};

#[derive(Debug, Clone, PartialEq, Eq)]
struct TriggerCall {
    workspace: String,
    repository_slug: String,
    branch: String,
    pipeline: String,
}

/// Pull request `id` lives on branch `feature/<id>`.
struct BranchPerIdInfo;

#[async_trait]
impl PullRequestInfoClient for BranchPerIdInfo {
    async fn pull_request_info(
        &self,
        _workspace: &str,
        _repository_slug: &str,
        id: i64,
    ) -> anyhow::Result<PullRequestInfo> {
        Ok(PullRequestInfo {
            title: format!("PR {id}"),
            description: "Bumps \\`tokio\\`".to_string(),
            source_branch: format!("feature/{id}"),
        })
    }
}

#[derive(Default)]
struct ScriptedTrigger {
    failing_branches: HashSet<String>,
    calls: AsyncMutex<Vec<TriggerCall>>,
}

impl ScriptedTrigger {
    fn failing_on(branches: &[&str]) -> Self {
        Self {
            failing_branches: branches.iter().map(|branch| branch.to_string()).collect(),
            calls: AsyncMutex::new(Vec::new()),
        }
    }

    async fn calls(&self) -> Vec<TriggerCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl PipelineTriggerClient for ScriptedTrigger {
    async fn trigger_pipeline(
        &self,
        workspace: &str,
        repository_slug: &str,
        request: &PipelineTriggerRequest,
    ) -> anyhow::Result<TriggeredPipeline> {
        let branch = request.target.ref_name.clone();
        let mut calls = self.calls.lock().await;
        calls.push(TriggerCall {
            workspace: workspace.to_string(),
            repository_slug: repository_slug.to_string(),
            branch: branch.clone(),
            pipeline: request.target.selector.pattern.clone(),
        });
        if self.failing_branches.contains(&branch) {
            anyhow::bail!("pipeline runner rejected branch {branch}");
        }
        Ok(TriggeredPipeline {
            build_number: 40 + calls.len() as u64,
        })
    }
}

struct Bot {
    event: RunPipelineEvent,
    transport: Arc<RecordingTransport>,
    trigger: Arc<ScriptedTrigger>,
    _shutdown: watch::Sender<bool>,
}

impl Bot {
    fn in_memory(trigger: ScriptedTrigger, transport: RecordingTransport) -> Self {
        let dictionary = InMemoryScenarioDictionary::new();
        Self::build(
            &dictionary,
            Arc::new(InMemoryConversationStore::new()),
            trigger,
            transport,
        )
    }

    fn on_disk(state_dir: &Path) -> Self {
        let dictionary =
            FileScenarioDictionary::open(state_dir.join("scenarios.json")).expect("dictionary");
        let store = FileConversationStore::open(state_dir.join("conversations.json"))
            .expect("conversation store");
        Self::build(
            &dictionary,
            Arc::new(store),
            ScriptedTrigger::default(),
            RecordingTransport::new(),
        )
    }

    fn build(
        dictionary: &dyn ScenarioDictionary,
        store: Arc<dyn pipebot_conversation::ConversationStore>,
        trigger: ScriptedTrigger,
        transport: RecordingTransport,
    ) -> Self {
        RunPipelineEvent::install(dictionary).expect("install");
        let trigger = Arc::new(trigger);
        let transport = Arc::new(transport);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let event = RunPipelineEvent::from_dictionary(
            dictionary,
            store,
            Arc::new(BranchPerIdInfo),
            trigger.clone(),
            transport.clone(),
            RunPipelineEventConfig {
                dispatch: DispatchConfig {
                    default_workspace: "acme".to_string(),
                    default_branch: "main".to_string(),
                    ..DispatchConfig::default()
                },
                announcement_channel: Some("releases".to_string()),
                conversation_ttl_ms: 0,
            },
            shutdown_rx,
        )
        .expect("event");
        Self {
            event,
            transport,
            trigger,
            _shutdown: shutdown_tx,
        }
    }

    async fn say(&self, channel: &str, text: &str) -> EventReport {
        self.event
            .handle(&InboundMessage {
                channel: channel.to_string(),
                sender: "<@U7>".to_string(),
                text: text.to_string(),
            })
            .await
            .expect("handle")
    }
}

#[tokio::test]
async fn integration_one_shot_and_conversation_paths_trigger_identically() {
    let one_shot = Bot::in_memory(ScriptedTrigger::default(), RecordingTransport::new());
    one_shot
        .say(
            "C1",
            "start staging-deploy https://bitbucket.org/john/test-repo/pull-requests/1/diff and repository billing",
        )
        .await;

    let conversation = Bot::in_memory(ScriptedTrigger::default(), RecordingTransport::new());
    assert!(matches!(
        conversation.say("C1", "start").await,
        EventReport::Asked { .. }
    ));
    assert!(matches!(
        conversation
            .say(
                "C1",
                "<https://bitbucket.org/john/test-repo/pull-requests/1/diff|PR 1> and repository billing",
            )
            .await,
        EventReport::Asked { .. }
    ));
    conversation.say("C1", "staging-deploy").await;

    // Targets run concurrently, so compare by repository.
    let expected = vec![
        TriggerCall {
            workspace: "acme".to_string(),
            repository_slug: "billing".to_string(),
            branch: "main".to_string(),
            pipeline: "staging-deploy".to_string(),
        },
        TriggerCall {
            workspace: "john".to_string(),
            repository_slug: "test-repo".to_string(),
            branch: "feature/1".to_string(),
            pipeline: "staging-deploy".to_string(),
        },
    ];
    let mut direct_calls = one_shot.trigger.calls().await;
    let mut conversation_calls = conversation.trigger.calls().await;
    direct_calls.sort_by(|left, right| left.repository_slug.cmp(&right.repository_slug));
    conversation_calls.sort_by(|left, right| left.repository_slug.cmp(&right.repository_slug));
    assert_eq!(direct_calls, expected);
    assert_eq!(conversation_calls, expected);
}

#[tokio::test]
async fn integration_first_pull_request_failure_does_not_block_second() {
    let bot = Bot::in_memory(
        ScriptedTrigger::failing_on(&["feature/1"]),
        RecordingTransport::new(),
    );

    let report = bot
        .say(
            "C1",
            "run deploy https://bitbucket.org/acme/api/pull-requests/1 https://bitbucket.org/acme/api/pull-requests/2",
        )
        .await;

    let EventReport::Dispatched { outcomes } = report else {
        panic!("expected dispatch, got {report:?}");
    };
    assert!(matches!(
        outcomes[0].status,
        OutcomeStatus::Failed {
            stage: FailureStage::Trigger,
            ..
        }
    ));
    assert!(outcomes[1].is_triggered());

    let sent = bot.transport.sent();
    assert!(sent[0].text.contains("started for 1 of 2 targets"));
    assert!(sent[0].text.contains("- acme/api#1: I tried to run pipeline `deploy`"));
    assert_eq!(sent[1].channel, "releases");
    assert_eq!(
        sent[1].text,
        "<@U7> started pipeline `deploy` for acme/api#2 on `feature/2`"
    );
}

#[tokio::test]
async fn integration_replay_failure_resets_and_next_message_starts_fresh() {
    let bot = Bot::in_memory(ScriptedTrigger::default(), RecordingTransport::new());

    bot.say("C1", "start").await;
    bot.say("C1", "https://bitbucket.org/acme/api/pull-requests/oops")
        .await;
    let report = bot.say("C1", "deploy").await;
    let EventReport::Rejected { reply } = report else {
        panic!("expected rejection, got {report:?}");
    };
    assert!(reply.starts_with("Failed to extract the data from your message"));

    // Back to idle: a non-trigger message is no longer claimed.
    assert_eq!(bot.say("C1", "deploy").await, EventReport::Ignored);
    assert!(matches!(
        bot.say("C1", "start deploy repository billing").await,
        EventReport::Dispatched { .. }
    ));
}

#[tokio::test]
async fn integration_channels_keep_independent_conversations() {
    let bot = Bot::in_memory(ScriptedTrigger::default(), RecordingTransport::new());

    bot.say("C1", "start").await;
    bot.say("C2", "start nightly").await;
    bot.say("C1", "repository billing").await;
    let c2 = bot.say("C2", "repository search").await;
    let c1 = bot.say("C1", "deploy").await;

    assert!(matches!(c1, EventReport::Dispatched { .. }));
    // C2 still has the pipeline question pending.
    assert!(matches!(c2, EventReport::Asked { .. }));
    let calls = bot.trigger.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].repository_slug, "billing");
    assert_eq!(calls[0].pipeline, "deploy");
}

#[tokio::test]
async fn integration_pending_conversation_survives_restart() {
    let temp = tempdir().expect("tempdir");

    {
        let bot = Bot::on_disk(temp.path());
        bot.say("C1", "start").await;
        bot.say("C1", "repository billing").await;
    }

    let restarted = Bot::on_disk(temp.path());
    let report = restarted.say("C1", "deploy").await;
    let EventReport::Dispatched { outcomes } = report else {
        panic!("expected dispatch, got {report:?}");
    };
    assert_eq!(outcomes[0].branch(), Some("main"));
}

#[tokio::test]
async fn integration_announcement_failure_keeps_primary_reply() {
    let bot = Bot::in_memory(
        ScriptedTrigger::default(),
        RecordingTransport::failing_on(&["releases"]),
    );

    let report = bot.say("C1", "start deploy repository billing").await;

    assert!(matches!(report, EventReport::Dispatched { .. }));
    let sent = bot.transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0]
        .text
        .starts_with("Done. Here the link to the build status report: https://bitbucket.org/acme/billing/"));
}
