use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "pipebot",
    about = "Chat bot that starts Bitbucket pipelines for pull requests and repositories",
    version
)]
pub struct Cli {
    #[arg(
        long = "state-dir",
        env = "PIPEBOT_STATE_DIR",
        default_value = ".pipebot",
        global = true,
        help = "Directory for the scenario dictionary, pending conversations and transport state"
    )]
    pub state_dir: PathBuf,

    #[arg(
        long = "log-level",
        env = "PIPEBOT_LOG_LEVEL",
        global = true,
        help = "Tracing filter directive (for example `info` or `pipebot_dispatch=debug`). Defaults to RUST_LOG, then `warn`"
    )]
    pub log_level: Option<String>,

    #[arg(
        long = "bitbucket-api-base",
        env = "PIPEBOT_BITBUCKET_API_BASE",
        default_value = "https://api.bitbucket.org/2.0",
        global = true,
        help = "Base URL for the Bitbucket 2.0 REST API"
    )]
    pub bitbucket_api_base: String,

    #[arg(
        long = "bitbucket-web-base",
        env = "PIPEBOT_BITBUCKET_WEB_BASE",
        default_value = "https://bitbucket.org",
        global = true,
        help = "Web origin used to build links to pipeline results"
    )]
    pub bitbucket_web_base: String,

    #[arg(
        long = "bitbucket-username",
        env = "PIPEBOT_BITBUCKET_USERNAME",
        default_value = "",
        global = true,
        help = "Bitbucket username for app-password authentication"
    )]
    pub bitbucket_username: String,

    #[arg(
        long = "bitbucket-app-password",
        env = "PIPEBOT_BITBUCKET_APP_PASSWORD",
        default_value = "",
        hide_env_values = true,
        hide_default_value = true,
        global = true,
        help = "Bitbucket app password paired with --bitbucket-username"
    )]
    pub bitbucket_app_password: String,

    #[arg(
        long = "bitbucket-token",
        env = "PIPEBOT_BITBUCKET_TOKEN",
        default_value = "",
        hide_env_values = true,
        hide_default_value = true,
        global = true,
        help = "Bitbucket access token; takes precedence over the app password"
    )]
    pub bitbucket_token: String,

    #[arg(
        long = "default-workspace",
        env = "PIPEBOT_DEFAULT_WORKSPACE",
        default_value = "",
        global = true,
        help = "Workspace that `repository <name>` targets belong to"
    )]
    pub default_workspace: String,

    #[arg(
        long = "default-branch",
        env = "PIPEBOT_DEFAULT_BRANCH",
        default_value = "master",
        global = true,
        help = "Branch that `repository <name>` targets are built from"
    )]
    pub default_branch: String,

    #[arg(
        long = "dispatch-concurrency",
        env = "PIPEBOT_DISPATCH_CONCURRENCY",
        default_value_t = 4,
        value_parser = parse_positive_usize,
        global = true,
        help = "Maximum number of targets dispatched at the same time"
    )]
    pub dispatch_concurrency: usize,

    #[arg(
        long = "dispatch-call-timeout-ms",
        env = "PIPEBOT_DISPATCH_CALL_TIMEOUT_MS",
        default_value_t = 60_000,
        value_parser = parse_positive_u64,
        global = true,
        help = "Deadline for one pull-request lookup or pipeline trigger, retries included"
    )]
    pub dispatch_call_timeout_ms: u64,

    #[arg(
        long = "request-timeout-ms",
        env = "PIPEBOT_REQUEST_TIMEOUT_MS",
        default_value_t = 15_000,
        value_parser = parse_positive_u64,
        global = true,
        help = "Timeout for a single HTTP request"
    )]
    pub request_timeout_ms: u64,

    #[arg(
        long = "retry-max-attempts",
        env = "PIPEBOT_RETRY_MAX_ATTEMPTS",
        default_value_t = 3,
        value_parser = parse_positive_usize,
        global = true,
        help = "Attempts per HTTP call for retryable failures"
    )]
    pub retry_max_attempts: usize,

    #[arg(
        long = "retry-base-delay-ms",
        env = "PIPEBOT_RETRY_BASE_DELAY_MS",
        default_value_t = 500,
        value_parser = parse_positive_u64,
        global = true,
        help = "Base delay for exponential retry backoff"
    )]
    pub retry_base_delay_ms: u64,

    #[arg(
        long = "announcement-channel",
        env = "PIPEBOT_ANNOUNCEMENT_CHANNEL",
        global = true,
        help = "Channel that receives a release announcement after successful dispatches"
    )]
    pub announcement_channel: Option<String>,

    #[arg(
        long = "conversation-ttl-seconds",
        env = "PIPEBOT_CONVERSATION_TTL_SECONDS",
        default_value_t = 900,
        global = true,
        help = "Pending conversations older than this are forgotten (0 keeps them forever)"
    )]
    pub conversation_ttl_seconds: u64,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Serve requests from Slack over Socket Mode.
    Slack(SlackArgs),
    /// Process one message and print the replies.
    Handle(HandleArgs),
    /// Apply pending scenario migrations and exit.
    Install,
}

#[derive(Debug, Args)]
pub struct SlackArgs {
    #[arg(
        long = "slack-api-base",
        env = "PIPEBOT_SLACK_API_BASE",
        default_value = "https://slack.com/api",
        help = "Base URL for the Slack Web API"
    )]
    pub slack_api_base: String,

    #[arg(
        long = "slack-app-token",
        env = "PIPEBOT_SLACK_APP_TOKEN",
        hide_env_values = true,
        help = "Slack Socket Mode app token (xapp-...)"
    )]
    pub slack_app_token: String,

    #[arg(
        long = "slack-bot-token",
        env = "PIPEBOT_SLACK_BOT_TOKEN",
        hide_env_values = true,
        help = "Slack bot token (xoxb-...)"
    )]
    pub slack_bot_token: String,

    #[arg(
        long = "slack-bot-user-id",
        env = "PIPEBOT_SLACK_BOT_USER_ID",
        help = "Bot user id; resolved with auth.test when omitted"
    )]
    pub slack_bot_user_id: Option<String>,

    #[arg(
        long = "slack-announcement-username",
        env = "PIPEBOT_SLACK_ANNOUNCEMENT_USERNAME",
        help = "Display name used for release announcements"
    )]
    pub slack_announcement_username: Option<String>,

    #[arg(
        long = "slack-reconnect-delay-ms",
        env = "PIPEBOT_SLACK_RECONNECT_DELAY_MS",
        default_value_t = 2_000,
        value_parser = parse_positive_u64,
        help = "Delay before reconnecting a dropped Socket Mode session"
    )]
    pub slack_reconnect_delay_ms: u64,

    #[arg(
        long = "slack-processed-event-cap",
        env = "PIPEBOT_SLACK_PROCESSED_EVENT_CAP",
        default_value_t = 2_048,
        value_parser = parse_positive_usize,
        help = "Number of handled event keys kept for duplicate suppression"
    )]
    pub slack_processed_event_cap: usize,

    #[arg(
        long = "slack-max-event-age-seconds",
        env = "PIPEBOT_SLACK_MAX_EVENT_AGE_SECONDS",
        default_value_t = 600,
        help = "Drop events older than this many seconds (0 disables)"
    )]
    pub slack_max_event_age_seconds: u64,

    #[arg(
        long = "slack-channel-idle-timeout-ms",
        env = "PIPEBOT_SLACK_CHANNEL_IDLE_TIMEOUT_MS",
        default_value_t = 300_000,
        value_parser = parse_positive_u64,
        help = "Release a channel's message queue after this long without traffic"
    )]
    pub slack_channel_idle_timeout_ms: u64,

    #[arg(
        long = "shutdown-grace-ms",
        env = "PIPEBOT_SHUTDOWN_GRACE_MS",
        default_value_t = 10_000,
        help = "How long in-flight requests may finish after ctrl-c"
    )]
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Args)]
pub struct HandleArgs {
    #[arg(
        long,
        env = "PIPEBOT_HANDLE_CHANNEL",
        default_value = "cli",
        help = "Conversation key; reuse it to answer follow-up questions"
    )]
    pub channel: String,

    #[arg(
        long,
        env = "PIPEBOT_HANDLE_SENDER",
        default_value = "cli-user",
        help = "Requester name used in announcements"
    )]
    pub sender: String,

    #[arg(
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        help = "Message text, for example: start deploy repository billing"
    )]
    pub text: Vec<String>,
}

impl HandleArgs {
    pub fn message_text(&self) -> String {
        self.text.join(" ")
    }
}
