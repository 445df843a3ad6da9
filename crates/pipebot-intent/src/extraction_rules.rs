//! Named extraction rules.
//!
//! Grammar:
//! - pull request: any `http(s)://` link shaped like
//!   `.../<workspace>/<repository_slug>/pull-requests/<id>`; a non-numeric id
//!   rejects the whole message.
//! - repository: the keyword `repository` followed by a `[a-z0-9_-]+` token,
//!   any number of times.
//! - pipeline: the token right after a leading `start` / `run` (optionally
//!   `run pipeline <name>`); at most one per message.

use std::sync::OnceLock;

use regex::Regex;

use crate::{ExtractionError, Intent, PipelineName, PullRequestTarget, RepositoryTarget};

const URL_PATTERN: &str = r#"https?://[^\s<>|"']+"#;
const PULL_REQUEST_URL_PATTERN: &str = r"/(?P<workspace>[^/\s]+)/(?P<repository_slug>[^/\s]+)/pull-requests(?:/(?P<pull_request_id>[^/\s?#]*))?";
const REPOSITORY_PATTERN: &str = r"(?i:\brepository)\s+(?P<name>[a-z0-9_-]+)(?:$|[\s.,;:!?])";
const PIPELINE_PATTERN: &str = r"^\s*(?i:start|run)(?:\s+(?i:pipeline))?\s+(?P<pipeline>\S+)";
const TRIGGER_PATTERN: &str = r"^\s*(?i:start|run)(?:\s|$)";

const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', ')'];
const RESERVED_PIPELINE_WORDS: &[&str] = &["pipeline", "repository"];

static URL_RULE: OnceLock<Regex> = OnceLock::new();
static PULL_REQUEST_RULE: OnceLock<Regex> = OnceLock::new();
static REPOSITORY_RULE: OnceLock<Regex> = OnceLock::new();
static PIPELINE_RULE: OnceLock<Regex> = OnceLock::new();
static TRIGGER_RULE: OnceLock<Regex> = OnceLock::new();

fn compiled(
    cell: &'static OnceLock<Regex>,
    pattern: &'static str,
) -> Result<&'static Regex, ExtractionError> {
    if let Some(regex) = cell.get() {
        return Ok(regex);
    }
    let regex =
        Regex::new(pattern).map_err(|source| ExtractionError::InvalidRule { pattern, source })?;
    Ok(cell.get_or_init(|| regex))
}

/// Returns every pull-request link in `text`, left to right.
pub fn extract_pull_requests(text: &str) -> Result<Vec<PullRequestTarget>, ExtractionError> {
    let url_rule = compiled(&URL_RULE, URL_PATTERN)?;
    let pull_request_rule = compiled(&PULL_REQUEST_RULE, PULL_REQUEST_URL_PATTERN)?;

    let mut targets = Vec::new();
    for found in url_rule.find_iter(text) {
        let url = found.as_str().trim_end_matches(TRAILING_PUNCTUATION);
        let Some(captures) = pull_request_rule.captures(url) else {
            continue;
        };
        let raw_id = captures
            .name("pull_request_id")
            .map(|value| value.as_str())
            .unwrap_or_default();
        let id = parse_pull_request_id(raw_id).ok_or_else(|| {
            ExtractionError::MalformedReference {
                url: url.to_string(),
                raw_id: raw_id.to_string(),
            }
        })?;
        let target =
            PullRequestTarget::new(&captures["workspace"], &captures["repository_slug"], id);
        tracing::debug!(pull_request = %target.label(), "matched pull-request link");
        targets.push(target);
    }
    Ok(targets)
}

fn parse_pull_request_id(raw: &str) -> Option<i64> {
    if raw.is_empty() || !raw.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    raw.parse::<i64>().ok()
}

/// Returns every `repository <name>` mention in `text`, in order of appearance.
pub fn extract_repositories(text: &str) -> Result<Vec<RepositoryTarget>, ExtractionError> {
    let rule = compiled(&REPOSITORY_RULE, REPOSITORY_PATTERN)?;
    Ok(rule
        .captures_iter(text)
        .filter_map(|captures| captures.name("name"))
        .map(|name| name.as_str())
        .filter(|name| !name.is_empty())
        .map(RepositoryTarget::new)
        .collect())
}

/// Returns the pipeline named after a leading trigger keyword. Anything that
/// is not a valid pipeline token yields `None` so callers ask for it instead.
pub fn extract_pipeline(text: &str) -> Result<Option<PipelineName>, ExtractionError> {
    let rule = compiled(&PIPELINE_RULE, PIPELINE_PATTERN)?;
    let Some(captures) = rule.captures(text) else {
        return Ok(None);
    };
    let token = captures["pipeline"].trim_end_matches(TRAILING_PUNCTUATION);
    if RESERVED_PIPELINE_WORDS
        .iter()
        .any(|reserved| token.eq_ignore_ascii_case(reserved))
    {
        return Ok(None);
    }
    Ok(PipelineName::parse(token))
}

/// True when `text` opens with `start` or `run`.
pub fn matches_trigger(text: &str) -> Result<bool, ExtractionError> {
    Ok(compiled(&TRIGGER_RULE, TRIGGER_PATTERN)?.is_match(text))
}

/// Runs all three rules over a single one-shot message.
pub fn extract_intent(text: &str) -> Result<Intent, ExtractionError> {
    Ok(Intent {
        pipeline: extract_pipeline(text)?,
        pull_requests: extract_pull_requests(text)?,
        repositories: extract_repositories(text)?,
    })
}

/// Reads the answer to "where should I run it?". A bare `[a-z0-9_-]+` word
/// with no link and no `repository` keyword is taken as a repository name.
pub fn destination_from_answer(
    answer: &str,
) -> Result<(Vec<PullRequestTarget>, Vec<RepositoryTarget>), ExtractionError> {
    let pull_requests = extract_pull_requests(answer)?;
    let mut repositories = extract_repositories(answer)?;
    if pull_requests.is_empty() && repositories.is_empty() {
        let bare = answer.trim().trim_end_matches(TRAILING_PUNCTUATION);
        if PipelineName::parse(bare).is_some() {
            repositories.push(RepositoryTarget::new(bare));
        }
    }
    Ok((pull_requests, repositories))
}

/// Reads the answer to "which pipeline?". Accepts either the bare name or a
/// full `start <name>` phrase.
pub fn pipeline_from_answer(answer: &str) -> Result<Option<PipelineName>, ExtractionError> {
    if matches_trigger(answer)? {
        return extract_pipeline(answer);
    }
    Ok(PipelineName::parse(
        answer.trim().trim_end_matches(TRAILING_PUNCTUATION),
    ))
}
