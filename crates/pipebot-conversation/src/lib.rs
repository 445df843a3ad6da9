//! Multi-turn slot filling for pipeline-trigger requests.
//!
//! When a message does not name both a pipeline and a target, the
//! [`SlotFillingCoordinator`] keeps a per-channel [`ConversationState`] in a
//! [`ConversationStore`] and walks the requester through the questions of a
//! [`ScenarioDefinition`] until the intent can be rebuilt from the answers.

pub mod conversation_state;
pub mod conversation_store;
pub mod scenario;
pub mod slot_filling;

pub use conversation_state::{ConversationState, ScenarioKind};
pub use conversation_store::{
    ConversationStore, ConversationStoreError, FileConversationStore, InMemoryConversationStore,
    StoreResult,
};
pub use scenario::{
    run_pending_migrations, run_pipeline_migrations, FileScenarioDictionary,
    InMemoryScenarioDictionary, Question, ScenarioDefinition, ScenarioDictionary,
    ScenarioMigration, Slot, RUN_PIPELINE_SCENARIO,
};
pub use slot_filling::{ConversationError, SlotFillingCoordinator, Turn};
