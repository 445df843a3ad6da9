use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    #[default]
    None,
    AwaitingIntent,
}

/// In-progress question/answer exchange for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    pub channel: String,
    pub pending_question_index: usize,
    #[serde(default)]
    pub collected_answers: Vec<String>,
    #[serde(default)]
    pub scenario_kind: ScenarioKind,
    #[serde(default)]
    pub updated_unix_ms: u64,
}

impl ConversationState {
    /// State right after the first question has been asked.
    pub fn awaiting_first_answer(channel: impl Into<String>, now_unix_ms: u64) -> Self {
        Self {
            channel: channel.into(),
            pending_question_index: 0,
            collected_answers: Vec::new(),
            scenario_kind: ScenarioKind::AwaitingIntent,
            updated_unix_ms: now_unix_ms,
        }
    }

    pub fn is_active(&self) -> bool {
        self.scenario_kind == ScenarioKind::AwaitingIntent
    }
}
