//! Conversation lifecycle: `Idle` -> `AwaitingAnswer(k)` -> `Idle`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use pipebot_core::{current_unix_timestamp_ms, is_older_than};
use pipebot_intent::{
    destination_from_answer, extract_intent, pipeline_from_answer, ExtractionError, Intent,
};
use thiserror::Error;

use crate::conversation_state::ConversationState;
use crate::conversation_store::{ConversationStore, ConversationStoreError};
use crate::scenario::{ScenarioDefinition, Slot};

const CANCEL_ANSWER: &str = "cancel";

/// What to do with the current message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Turn {
    /// Both slots are filled; dispatch it.
    Ready(Intent),
    AskNext { prompt: String },
    /// The requester cancelled a pending conversation.
    Abandoned,
}

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("failed to extract intent from message: {0}")]
    Extraction(#[source] ExtractionError),
    #[error("failed to extract intent from collected answers: {0}")]
    Replay(#[source] ExtractionError),
    #[error("collected {collected} answers for {expected} questions")]
    Mismatch { expected: usize, collected: usize },
    #[error("collected answers did not name both a pipeline and a target")]
    IncompleteAnswers,
    #[error("scenario '{name}' has no question for the {slot:?} slot")]
    IncompleteScenario { name: String, slot: Slot },
    #[error(transparent)]
    Store(#[from] ConversationStoreError),
}

impl ConversationError {
    /// Reply shown to the requester. Every error resolves to one of these.
    pub fn user_message(&self) -> String {
        match self {
            Self::Extraction(error) => error.user_message().to_string(),
            Self::Replay(error) => format!(
                "{}. Let's start over: send `start <pipeline>` with the pull-request links or `repository <name>`.",
                error.user_message()
            ),
            Self::Mismatch { .. } => {
                "I lost track of your answers. Could you please repeat your request?".to_string()
            }
            Self::IncompleteAnswers => "I still don't know which pipeline to run and where. Let's start over: send `start <pipeline>` with the pull-request links or `repository <name>`.".to_string(),
            Self::IncompleteScenario { .. } | Self::Store(_) => {
                "Something went wrong on my side while handling your request. Please try again."
                    .to_string()
            }
        }
    }
}

/// Decides between dispatching, asking the next question, or resetting.
pub struct SlotFillingCoordinator {
    scenario: ScenarioDefinition,
    store: Arc<dyn ConversationStore>,
    conversation_ttl_ms: u64,
    channel_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SlotFillingCoordinator {
    /// `conversation_ttl_ms == 0` keeps pending conversations forever.
    pub fn new(
        scenario: ScenarioDefinition,
        store: Arc<dyn ConversationStore>,
        conversation_ttl_ms: u64,
    ) -> Result<Self, ConversationError> {
        for slot in [Slot::Destination, Slot::Pipeline] {
            if !scenario.covers(slot) {
                return Err(ConversationError::IncompleteScenario {
                    name: scenario.name.clone(),
                    slot,
                });
            }
        }
        Ok(Self {
            scenario,
            store,
            conversation_ttl_ms,
            channel_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn scenario(&self) -> &ScenarioDefinition {
        &self.scenario
    }

    /// True when `channel` is in the middle of answering questions.
    pub fn has_pending_conversation(&self, channel: &str) -> Result<bool, ConversationError> {
        let now_unix_ms = current_unix_timestamp_ms();
        Ok(self
            .store
            .load(channel)?
            .is_some_and(|state| state.is_active() && !self.is_expired(&state, now_unix_ms)))
    }

    pub fn handle_message(&self, channel: &str, text: &str) -> Result<Turn, ConversationError> {
        let gate = self.channel_gate(channel)?;
        let turn = {
            let _guard = gate.lock().map_err(|_| ConversationStoreError::Poisoned)?;
            self.handle_locked(channel, text)
        };
        drop(gate);
        self.release_channel_gate(channel);
        turn
    }

    fn handle_locked(&self, channel: &str, text: &str) -> Result<Turn, ConversationError> {
        let now_unix_ms = current_unix_timestamp_ms();

        let pending = match self.store.load(channel)? {
            Some(state) if state.is_active() && !self.is_expired(&state, now_unix_ms) => {
                Some(state)
            }
            Some(_) => {
                tracing::debug!(channel, "discarding abandoned conversation");
                self.store.remove(channel)?;
                None
            }
            None => None,
        };

        match pending {
            None => self.handle_idle(channel, text, now_unix_ms),
            Some(state) => self.handle_answer(state, text, now_unix_ms),
        }
    }

    fn handle_idle(
        &self,
        channel: &str,
        text: &str,
        now_unix_ms: u64,
    ) -> Result<Turn, ConversationError> {
        let intent = extract_intent(text).map_err(ConversationError::Extraction)?;
        if intent.is_complete() {
            tracing::debug!(channel, "one-shot request is complete");
            return Ok(Turn::Ready(intent));
        }

        self.store
            .save(ConversationState::awaiting_first_answer(channel, now_unix_ms))?;
        tracing::debug!(channel, question = 0, "request incomplete, asking first question");
        Ok(Turn::AskNext {
            prompt: self.prompt_at(0),
        })
    }

    fn handle_answer(
        &self,
        mut state: ConversationState,
        text: &str,
        now_unix_ms: u64,
    ) -> Result<Turn, ConversationError> {
        let channel = state.channel.clone();
        if text.trim().eq_ignore_ascii_case(CANCEL_ANSWER) {
            self.store.remove(&channel)?;
            tracing::debug!(channel = %channel, "conversation cancelled by requester");
            return Ok(Turn::Abandoned);
        }

        state.collected_answers.push(text.to_string());
        let next_index = state.pending_question_index + 1;
        if next_index < self.scenario.questions.len() {
            state.pending_question_index = next_index;
            state.updated_unix_ms = now_unix_ms;
            self.store.save(state)?;
            tracing::debug!(channel = %channel, question = next_index, "asking next question");
            return Ok(Turn::AskNext {
                prompt: self.prompt_at(next_index),
            });
        }

        // Last answer: the conversation ends here whatever the replay yields.
        self.store.remove(&channel)?;

        let expected = self.scenario.questions.len();
        let collected = state.collected_answers.len();
        if collected != expected {
            tracing::warn!(channel = %channel, expected, collected, "conversation answer count mismatch");
            return Err(ConversationError::Mismatch {
                expected,
                collected,
            });
        }

        let intent = self
            .replay(&state.collected_answers)
            .map_err(ConversationError::Replay)?;
        if !intent.is_complete() {
            return Err(ConversationError::IncompleteAnswers);
        }
        tracing::debug!(channel = %channel, "conversation produced a complete request");
        Ok(Turn::Ready(intent))
    }

    /// Rebuilds an intent by feeding each answer to the rule for its slot.
    fn replay(&self, answers: &[String]) -> Result<Intent, ExtractionError> {
        let mut intent = Intent::default();
        for (question, answer) in self.scenario.questions.iter().zip(answers) {
            match question.slot {
                Slot::Destination => {
                    let (pull_requests, repositories) = destination_from_answer(answer)?;
                    intent.pull_requests.extend(pull_requests);
                    intent.repositories.extend(repositories);
                }
                Slot::Pipeline => {
                    if let Some(pipeline) = pipeline_from_answer(answer)? {
                        intent.pipeline = Some(pipeline);
                    }
                }
            }
        }
        Ok(intent)
    }

    fn prompt_at(&self, index: usize) -> String {
        self.scenario
            .questions
            .get(index)
            .map(|question| question.prompt.clone())
            .unwrap_or_default()
    }

    fn is_expired(&self, state: &ConversationState, now_unix_ms: u64) -> bool {
        is_older_than(state.updated_unix_ms, self.conversation_ttl_ms, now_unix_ms)
    }

    fn channel_gate(&self, channel: &str) -> Result<Arc<Mutex<()>>, ConversationStoreError> {
        let mut locks = self
            .channel_locks
            .lock()
            .map_err(|_| ConversationStoreError::Poisoned)?;
        Ok(locks.entry(channel.to_string()).or_default().clone())
    }

    /// Drops the channel's lock once no other caller holds a handle to it.
    fn release_channel_gate(&self, channel: &str) {
        let Ok(mut locks) = self.channel_locks.lock() else {
            return;
        };
        if locks
            .get(channel)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            locks.remove(channel);
        }
    }

    #[cfg(test)]
    fn tracked_channel_count(&self) -> usize {
        self.channel_locks.lock().map(|locks| locks.len()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pipebot_intent::{extract_intent, PipelineName, PullRequestTarget, RepositoryTarget};

    use super::{ConversationError, SlotFillingCoordinator, Turn};
    use crate::{
        ConversationState, ConversationStore, InMemoryConversationStore, Question,
        ScenarioDefinition, Slot,
    };

    const DESTINATION_PROMPT: &str = "Where should I run it?";
    const PIPELINE_PROMPT: &str = "Which pipeline should I run?";

    fn two_question_scenario() -> ScenarioDefinition {
        ScenarioDefinition {
            name: "run_pipeline".to_string(),
            version: "1.0.0".to_string(),
            questions: vec![
                Question::new(Slot::Destination, DESTINATION_PROMPT),
                Question::new(Slot::Pipeline, PIPELINE_PROMPT),
            ],
        }
    }

    fn coordinator() -> (SlotFillingCoordinator, Arc<InMemoryConversationStore>) {
        let store = Arc::new(InMemoryConversationStore::new());
        let coordinator = SlotFillingCoordinator::new(two_question_scenario(), store.clone(), 0)
            .expect("coordinator");
        (coordinator, store)
    }

    fn ask(prompt: &str) -> Turn {
        Turn::AskNext {
            prompt: prompt.to_string(),
        }
    }

    #[test]
    fn functional_complete_one_shot_message_bypasses_conversation_state() {
        let (coordinator, store) = coordinator();
        let turn = coordinator
            .handle_message(
                "C1",
                "start staging-deploy https://bitbucket.org/john/test-repo/pull-requests/1/testing-pr-flow",
            )
            .expect("turn");

        let Turn::Ready(intent) = turn else {
            panic!("expected ready intent, got {turn:?}");
        };
        assert_eq!(intent.pipeline, PipelineName::parse("staging-deploy"));
        assert_eq!(
            intent.pull_requests,
            vec![PullRequestTarget::new("john", "test-repo", 1)]
        );
        assert!(store.is_empty());
    }

    #[test]
    fn functional_bare_start_asks_first_question_instead_of_failing() {
        let (coordinator, store) = coordinator();
        let turn = coordinator.handle_message("C1", "start").expect("turn");
        assert_eq!(turn, ask(DESTINATION_PROMPT));

        let state = store.load("C1").expect("load").expect("state created");
        assert_eq!(state.pending_question_index, 0);
        assert!(state.collected_answers.is_empty());
    }

    #[test]
    fn regression_concurrent_answers_on_one_channel_are_applied_one_at_a_time() {
        let (coordinator, store) = coordinator();
        coordinator.handle_message("C1", "start").expect("start");

        // Both answers fit either slot, so only the interleaving is checked.
        let (left, right) = std::thread::scope(|scope| {
            let left = scope.spawn(|| coordinator.handle_message("C1", "deploy"));
            let right = scope.spawn(|| coordinator.handle_message("C1", "billing"));
            (
                left.join().expect("left thread"),
                right.join().expect("right thread"),
            )
        });
        let turns = [left.expect("left turn"), right.expect("right turn")];

        let asked = turns
            .iter()
            .filter(|turn| **turn == ask(PIPELINE_PROMPT))
            .count();
        assert_eq!(asked, 1);
        let intent = turns
            .iter()
            .find_map(|turn| match turn {
                Turn::Ready(intent) => Some(intent.clone()),
                _ => None,
            })
            .expect("one turn completes the conversation");
        let pipeline = intent.pipeline.expect("pipeline").to_string();
        assert_eq!(intent.repositories.len(), 1);
        assert_ne!(pipeline, intent.repositories[0].name);
        assert!(store.is_empty());
        assert_eq!(coordinator.tracked_channel_count(), 0);
    }

    #[test]
    fn functional_valid_target_without_pipeline_is_still_a_clarifying_question() {
        let (coordinator, _store) = coordinator();
        let turn = coordinator
            .handle_message("C1", "start repository api")
            .expect("turn");
        assert_eq!(turn, ask(DESTINATION_PROMPT));
    }

    #[test]
    fn integration_two_question_conversation_builds_intent_and_resets() {
        let (coordinator, store) = coordinator();
        assert_eq!(
            coordinator.handle_message("C1", "start").expect("first"),
            ask(DESTINATION_PROMPT)
        );
        assert_eq!(
            coordinator
                .handle_message("C1", "repository api and repository web")
                .expect("destination"),
            ask(PIPELINE_PROMPT)
        );
        assert_eq!(
            store
                .load("C1")
                .expect("load")
                .expect("pending")
                .pending_question_index,
            1
        );

        let turn = coordinator
            .handle_message("C1", "nightly-build")
            .expect("pipeline");
        let Turn::Ready(intent) = turn else {
            panic!("expected ready intent, got {turn:?}");
        };
        assert_eq!(intent.pipeline, PipelineName::parse("nightly-build"));
        assert_eq!(
            intent.repositories,
            vec![RepositoryTarget::new("api"), RepositoryTarget::new("web")]
        );
        assert!(store.load("C1").expect("load").is_none());
    }

    #[test]
    fn integration_conversation_path_round_trips_direct_extraction() {
        for (destination, pipeline) in [
            ("repository api", "staging-deploy"),
            (
                "https://bitbucket.org/john/test-repo/pull-requests/1/testing-pr-flow",
                "deploy",
            ),
            (
                "https://bitbucket.org/acme/web/pull-requests/9 repository api",
                "build_all",
            ),
        ] {
            let direct = extract_intent(&format!("start {pipeline} {destination}"))
                .expect("direct extraction");
            assert!(direct.is_complete());

            let (coordinator, _store) = coordinator();
            coordinator.handle_message("C9", "start").expect("start");
            coordinator
                .handle_message("C9", destination)
                .expect("destination");
            let Turn::Ready(replayed) = coordinator
                .handle_message("C9", pipeline)
                .expect("pipeline")
            else {
                panic!("expected ready intent");
            };
            assert_eq!(replayed, direct);
        }
    }

    #[test]
    fn regression_replay_failure_resets_and_next_message_starts_fresh() {
        let (coordinator, store) = coordinator();
        coordinator.handle_message("C1", "start").expect("start");
        coordinator
            .handle_message(
                "C1",
                "https://bitbucket.org/john/test-repo/pull-requests/oops",
            )
            .expect("destination is stored, not parsed yet");

        let error = coordinator
            .handle_message("C1", "deploy")
            .expect_err("replay fails");
        assert!(matches!(error, ConversationError::Replay(_)));
        assert!(error.user_message().contains("start over"));
        assert!(store.load("C1").expect("load").is_none());

        let turn = coordinator
            .handle_message("C1", "start deploy repository api")
            .expect("fresh attempt");
        assert!(matches!(turn, Turn::Ready(_)));
    }

    #[test]
    fn regression_answer_count_mismatch_resets_conversation() {
        let (coordinator, store) = coordinator();
        let mut corrupted = ConversationState::awaiting_first_answer("C1", 0);
        corrupted.pending_question_index = 1;
        store.save(corrupted).expect("seed");

        let error = coordinator
            .handle_message("C1", "deploy")
            .expect_err("mismatch");
        assert!(matches!(
            error,
            ConversationError::Mismatch {
                expected: 2,
                collected: 1
            }
        ));
        assert!(error.user_message().contains("repeat your request"));
        assert!(store.load("C1").expect("load").is_none());
    }

    #[test]
    fn regression_unusable_answers_reset_with_retry_prompt() {
        let (coordinator, store) = coordinator();
        coordinator.handle_message("C1", "start").expect("start");
        coordinator
            .handle_message("C1", "no idea, the usual one")
            .expect("destination");
        let error = coordinator
            .handle_message("C1", "deploy")
            .expect_err("no targets");
        assert!(matches!(error, ConversationError::IncompleteAnswers));
        assert!(store.load("C1").expect("load").is_none());
    }

    #[test]
    fn functional_malformed_one_shot_message_is_an_error_without_state() {
        let (coordinator, store) = coordinator();
        let error = coordinator
            .handle_message(
                "C1",
                "start deploy https://bitbucket.org/john/test-repo/pull-requests/test/testing-pr-flow",
            )
            .expect_err("malformed");
        assert_eq!(
            error.user_message(),
            "Failed to extract the data from your message"
        );
        assert!(store.is_empty());
    }

    #[test]
    fn functional_cancel_abandons_pending_conversation() {
        let (coordinator, store) = coordinator();
        coordinator.handle_message("C1", "start").expect("start");
        assert!(coordinator.has_pending_conversation("C1").expect("pending"));
        assert_eq!(
            coordinator.handle_message("C1", " Cancel ").expect("cancel"),
            Turn::Abandoned
        );
        assert!(store.is_empty());
        assert!(!coordinator.has_pending_conversation("C1").expect("pending"));
    }

    #[test]
    fn regression_expired_conversation_is_treated_as_idle() {
        let store = Arc::new(InMemoryConversationStore::new());
        let coordinator =
            SlotFillingCoordinator::new(two_question_scenario(), store.clone(), 1_000)
                .expect("coordinator");
        store
            .save(ConversationState::awaiting_first_answer("C1", 1))
            .expect("seed stale state");

        let turn = coordinator
            .handle_message("C1", "start deploy repository api")
            .expect("handled as idle");
        assert!(matches!(turn, Turn::Ready(_)));
        assert!(store.load("C1").expect("load").is_none());
    }

    #[test]
    fn functional_channels_do_not_share_conversations() {
        let (coordinator, store) = coordinator();
        coordinator.handle_message("C1", "start").expect("C1 start");
        let turn = coordinator
            .handle_message("C2", "repository api")
            .expect("C2 idle");
        assert_eq!(turn, ask(DESTINATION_PROMPT));
        assert_eq!(
            store.load("C1").expect("load").expect("C1").collected_answers,
            Vec::<String>::new()
        );
        assert_eq!(
            store.load("C2").expect("load").expect("C2").pending_question_index,
            0
        );
    }

    #[test]
    fn regression_scenario_missing_pipeline_question_is_rejected() {
        let scenario = ScenarioDefinition {
            name: "broken".to_string(),
            version: "0.0.1".to_string(),
            questions: vec![Question::new(Slot::Destination, DESTINATION_PROMPT)],
        };
        let result =
            SlotFillingCoordinator::new(scenario, Arc::new(InMemoryConversationStore::new()), 0);
        assert!(matches!(
            result,
            Err(ConversationError::IncompleteScenario {
                slot: Slot::Pipeline,
                ..
            })
        ));
    }

    #[test]
    fn functional_three_question_scenario_asks_every_question_in_order() {
        let scenario = ScenarioDefinition {
            name: "run_pipeline".to_string(),
            version: "2.0.0".to_string(),
            questions: vec![
                Question::new(Slot::Destination, "Which pull requests?"),
                Question::new(Slot::Destination, "Any repositories?"),
                Question::new(Slot::Pipeline, PIPELINE_PROMPT),
            ],
        };
        let coordinator =
            SlotFillingCoordinator::new(scenario, Arc::new(InMemoryConversationStore::new()), 0)
                .expect("coordinator");
        assert_eq!(
            coordinator.handle_message("C1", "run").expect("start"),
            ask("Which pull requests?")
        );
        assert_eq!(
            coordinator
                .handle_message("C1", "https://bitbucket.org/acme/api/pull-requests/5")
                .expect("prs"),
            ask("Any repositories?")
        );
        assert_eq!(
            coordinator.handle_message("C1", "web").expect("repos"),
            ask(PIPELINE_PROMPT)
        );
        let Turn::Ready(intent) = coordinator.handle_message("C1", "deploy").expect("pipeline")
        else {
            panic!("expected ready intent");
        };
        assert_eq!(intent.target_count(), 2);
    }
}
