//! Subcommand runners.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use pipebot_bitbucket::{BitbucketAuth, BitbucketClient, BitbucketClientConfig};
use pipebot_conversation::{FileConversationStore, FileScenarioDictionary};
use pipebot_dispatch::DispatchConfig;
use pipebot_notify::{ChatTransport, OutboundMessage};
use pipebot_slack_runtime::{
    run_slack_bridge, EventReport, InboundMessage, RunPipelineEvent, RunPipelineEventConfig,
    SlackApiClient, SlackApiClientConfig, SlackBridgeRuntimeConfig,
};
use tokio::sync::watch;

use crate::bootstrap_helpers::ensure_state_dir;
use crate::cli_args::{Cli, CliCommand, HandleArgs, SlackArgs};

const SCENARIO_FILE: &str = "scenarios.json";
const CONVERSATION_FILE: &str = "conversations.json";

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    ensure_state_dir(&cli.state_dir)?;
    match &cli.command {
        CliCommand::Install => run_install(&cli),
        CliCommand::Handle(args) => run_handle(&cli, args).await,
        CliCommand::Slack(args) => run_slack(&cli, args).await,
    }
}

fn open_dictionary(cli: &Cli) -> Result<FileScenarioDictionary> {
    let path = cli.state_dir.join(SCENARIO_FILE);
    FileScenarioDictionary::open(path.clone())
        .with_context(|| format!("failed to open scenario dictionary {}", path.display()))
}

fn run_install(cli: &Cli) -> Result<()> {
    let dictionary = open_dictionary(cli)?;
    let applied = RunPipelineEvent::install(&dictionary)?;
    if applied.is_empty() {
        println!("scenario dictionary is up to date");
    }
    for name in applied {
        println!("applied migration {name}");
    }
    Ok(())
}

fn build_event(
    cli: &Cli,
    transport: Arc<dyn ChatTransport>,
    shutdown: watch::Receiver<bool>,
) -> Result<RunPipelineEvent> {
    let dictionary = open_dictionary(cli)?;
    RunPipelineEvent::install(&dictionary)?;

    let conversations_path = cli.state_dir.join(CONVERSATION_FILE);
    let store = FileConversationStore::open(conversations_path.clone()).with_context(|| {
        format!(
            "failed to open conversation store {}",
            conversations_path.display()
        )
    })?;

    let bitbucket = Arc::new(BitbucketClient::new(BitbucketClientConfig {
        api_base: cli.bitbucket_api_base.clone(),
        auth: BitbucketAuth::from_parts(
            &cli.bitbucket_username,
            &cli.bitbucket_app_password,
            &cli.bitbucket_token,
        ),
        request_timeout_ms: cli.request_timeout_ms,
        retry_max_attempts: cli.retry_max_attempts,
        retry_base_delay_ms: cli.retry_base_delay_ms,
    })?);

    let config = RunPipelineEventConfig {
        dispatch: DispatchConfig {
            default_workspace: cli.default_workspace.clone(),
            default_branch: cli.default_branch.clone(),
            web_base: cli.bitbucket_web_base.clone(),
            max_concurrency: cli.dispatch_concurrency,
            call_timeout: Duration::from_millis(cli.dispatch_call_timeout_ms),
        },
        announcement_channel: cli.announcement_channel.clone(),
        conversation_ttl_ms: cli.conversation_ttl_seconds.saturating_mul(1_000),
    };

    RunPipelineEvent::from_dictionary(
        &dictionary,
        Arc::new(store),
        bitbucket.clone(),
        bitbucket,
        transport,
        config,
        shutdown,
    )
}

/// Prints outbound messages; the `handle` command's chat transport.
struct ConsoleTransport;

#[async_trait]
impl ChatTransport for ConsoleTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        if message.is_bot_voice {
            println!("[{}] (announcement) {}", message.channel, message.text);
        } else {
            println!("[{}] {}", message.channel, message.text);
        }
        Ok(())
    }
}

async fn run_handle(cli: &Cli, args: &HandleArgs) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let event = build_event(cli, Arc::new(ConsoleTransport), shutdown_rx)?;
    let message = InboundMessage {
        channel: args.channel.clone(),
        sender: args.sender.clone(),
        text: args.message_text(),
    };

    let handling = event.handle(&message);
    tokio::pin!(handling);
    let report = tokio::select! {
        report = &mut handling => report?,
        _ = tokio::signal::ctrl_c() => {
            // Stop issuing trigger calls but report what already started.
            let _ = shutdown_tx.send(true);
            handling.await?
        }
    };
    if report == EventReport::Ignored {
        eprintln!("message ignored: it does not start with `start` or `run`");
    }
    Ok(())
}

async fn run_slack(cli: &Cli, args: &SlackArgs) -> Result<()> {
    let slack_client = Arc::new(SlackApiClient::new(SlackApiClientConfig {
        api_base: args.slack_api_base.clone(),
        app_token: args.slack_app_token.clone(),
        bot_token: args.slack_bot_token.clone(),
        announcement_username: args.slack_announcement_username.clone(),
        request_timeout_ms: cli.request_timeout_ms,
        retry_max_attempts: cli.retry_max_attempts,
        retry_base_delay_ms: cli.retry_base_delay_ms,
    })?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let event = build_event(cli, slack_client.clone(), shutdown_rx)?;

    run_slack_bridge(
        SlackBridgeRuntimeConfig {
            state_dir: cli.state_dir.join("slack"),
            bot_user_id: args.slack_bot_user_id.clone(),
            processed_event_cap: args.slack_processed_event_cap,
            max_event_age_seconds: args.slack_max_event_age_seconds,
            reconnect_delay: Duration::from_millis(args.slack_reconnect_delay_ms),
            shutdown_grace: Duration::from_millis(args.shutdown_grace_ms),
            channel_idle_timeout: Duration::from_millis(args.slack_channel_idle_timeout_ms),
        },
        slack_client,
        Arc::new(event),
        shutdown_tx,
    )
    .await
}
