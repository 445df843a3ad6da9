use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::{Mutex, RwLock},
};

use pipebot_core::{load_state, save_state, StateFileError, VersionedState};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conversation_state::ConversationState;

pub type StoreResult<T> = Result<T, ConversationStoreError>;

/// Errors returned by conversation stores and scenario dictionaries.
#[derive(Debug, Error)]
pub enum ConversationStoreError {
    #[error(transparent)]
    StateFile(#[from] StateFileError),
    #[error("state lock is poisoned")]
    Poisoned,
}

/// Keyed storage for in-progress conversations. One entry per channel; a save
/// replaces whatever the channel had before.
pub trait ConversationStore: Send + Sync {
    fn load(&self, channel: &str) -> StoreResult<Option<ConversationState>>;
    fn save(&self, state: ConversationState) -> StoreResult<()>;
    fn remove(&self, channel: &str) -> StoreResult<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    states: RwLock<HashMap<String, ConversationState>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.read().map(|states| states.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConversationStore for InMemoryConversationStore {
    fn load(&self, channel: &str) -> StoreResult<Option<ConversationState>> {
        let states = self
            .states
            .read()
            .map_err(|_| ConversationStoreError::Poisoned)?;
        Ok(states.get(channel).cloned())
    }

    fn save(&self, state: ConversationState) -> StoreResult<()> {
        let mut states = self
            .states
            .write()
            .map_err(|_| ConversationStoreError::Poisoned)?;
        states.insert(state.channel.clone(), state);
        Ok(())
    }

    fn remove(&self, channel: &str) -> StoreResult<()> {
        let mut states = self
            .states
            .write()
            .map_err(|_| ConversationStoreError::Poisoned)?;
        states.remove(channel);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConversationStateFile {
    schema_version: u32,
    #[serde(default)]
    conversations: BTreeMap<String, ConversationState>,
}

impl Default for ConversationStateFile {
    fn default() -> Self {
        Self {
            schema_version: Self::SCHEMA_VERSION,
            conversations: BTreeMap::new(),
        }
    }
}

impl VersionedState for ConversationStateFile {
    const SCHEMA_VERSION: u32 = 1;

    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

/// Conversation store persisted to a single JSON file so a restarted bot can
/// pick up half-finished exchanges.
#[derive(Debug)]
pub struct FileConversationStore {
    path: PathBuf,
    state: Mutex<ConversationStateFile>,
}

impl FileConversationStore {
    pub fn open(path: PathBuf) -> StoreResult<Self> {
        let state = load_state::<ConversationStateFile>(&path)?;
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn mutate(&self, apply: impl FnOnce(&mut ConversationStateFile) -> bool) -> StoreResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ConversationStoreError::Poisoned)?;
        if apply(&mut state) {
            save_state(&self.path, &*state)?;
        }
        Ok(())
    }
}

impl ConversationStore for FileConversationStore {
    fn load(&self, channel: &str) -> StoreResult<Option<ConversationState>> {
        let state = self
            .state
            .lock()
            .map_err(|_| ConversationStoreError::Poisoned)?;
        Ok(state.conversations.get(channel).cloned())
    }

    fn save(&self, conversation: ConversationState) -> StoreResult<()> {
        self.mutate(|state| {
            state
                .conversations
                .insert(conversation.channel.clone(), conversation);
            true
        })
    }

    fn remove(&self, channel: &str) -> StoreResult<()> {
        self.mutate(|state| state.conversations.remove(channel).is_some())
    }
}
