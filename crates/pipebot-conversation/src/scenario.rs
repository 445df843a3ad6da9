//! Clarifying-question scenarios and their versioned installation.
//!
//! Question definitions live in a [`ScenarioDictionary`]. Changes to them ship
//! as named [`ScenarioMigration`]s that run once per dictionary, so an existing
//! deployment is upgraded in place instead of growing a second code path.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::{Mutex, RwLock},
};

use pipebot_core::{load_state, save_state, VersionedState};
use serde::{Deserialize, Serialize};

use crate::conversation_store::{ConversationStoreError, StoreResult};

pub const RUN_PIPELINE_SCENARIO: &str = "run_pipeline";

/// Intent slot a question fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Destination,
    Pipeline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub slot: Slot,
    pub prompt: String,
}

impl Question {
    pub fn new(slot: Slot, prompt: impl Into<String>) -> Self {
        Self {
            slot,
            prompt: prompt.into(),
        }
    }
}

/// Ordered list of questions asked when a request is incomplete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioDefinition {
    pub name: String,
    pub version: String,
    pub questions: Vec<Question>,
}

impl ScenarioDefinition {
    pub fn covers(&self, slot: Slot) -> bool {
        self.questions.iter().any(|question| question.slot == slot)
    }
}

/// Persistence for scenario definitions and the migration ledger.
pub trait ScenarioDictionary: Send + Sync {
    fn find_scenario(&self, name: &str) -> StoreResult<Option<ScenarioDefinition>>;
    fn upsert_scenario(&self, scenario: ScenarioDefinition) -> StoreResult<()>;
    fn is_migration_executed(&self, name: &str) -> StoreResult<bool>;
    fn mark_migration_executed(&self, name: &str) -> StoreResult<()>;
}

/// One named, run-once change to the dictionary.
pub trait ScenarioMigration: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, dictionary: &dyn ScenarioDictionary) -> StoreResult<()>;
}

/// Applies every migration not yet recorded in `dictionary`, in order, and
/// returns the names of those that ran.
pub fn run_pending_migrations(
    dictionary: &dyn ScenarioDictionary,
    migrations: &[Box<dyn ScenarioMigration>],
) -> StoreResult<Vec<&'static str>> {
    let mut applied = Vec::new();
    for migration in migrations {
        let name = migration.name();
        if dictionary.is_migration_executed(name)? {
            tracing::debug!(migration = name, "scenario migration already executed");
            continue;
        }
        migration.apply(dictionary)?;
        dictionary.mark_migration_executed(name)?;
        tracing::info!(migration = name, "scenario migration executed");
        applied.push(name);
    }
    Ok(applied)
}

/// Migrations for the run-pipeline scenario, oldest first.
pub fn run_pipeline_migrations() -> Vec<Box<dyn ScenarioMigration>> {
    vec![
        Box::new(InstallRunPipelineScenario),
        Box::new(RewordDestinationQuestion),
    ]
}

struct InstallRunPipelineScenario;

impl ScenarioMigration for InstallRunPipelineScenario {
    fn name(&self) -> &'static str {
        "install-run-pipeline-scenario"
    }

    fn apply(&self, dictionary: &dyn ScenarioDictionary) -> StoreResult<()> {
        dictionary.upsert_scenario(ScenarioDefinition {
            name: RUN_PIPELINE_SCENARIO.to_string(),
            version: "1.0.0".to_string(),
            questions: vec![
                Question::new(
                    Slot::Destination,
                    "Please define the pull-request, because I don't understand for which branch I need to run it",
                ),
                Question::new(
                    Slot::Pipeline,
                    "Could you please tell me which pipeline I should run?",
                ),
            ],
        })
    }
}

/// Destination answers may name several pull requests and repositories.
struct RewordDestinationQuestion;

impl ScenarioMigration for RewordDestinationQuestion {
    fn name(&self) -> &'static str {
        "reword-destination-question"
    }

    fn apply(&self, dictionary: &dyn ScenarioDictionary) -> StoreResult<()> {
        let Some(mut scenario) = dictionary.find_scenario(RUN_PIPELINE_SCENARIO)? else {
            return Ok(());
        };
        for question in &mut scenario.questions {
            if question.slot == Slot::Destination {
                question.prompt = "Where should I run it? Paste the pull-request links and/or write `repository <name>` for each repository.".to_string();
            }
        }
        scenario.version = "1.1.0".to_string();
        dictionary.upsert_scenario(scenario)
    }
}

#[derive(Debug, Default)]
struct DictionaryContents {
    scenarios: BTreeMap<String, ScenarioDefinition>,
    executed_migrations: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct InMemoryScenarioDictionary {
    inner: RwLock<DictionaryContents>,
}

impl InMemoryScenarioDictionary {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScenarioDictionary for InMemoryScenarioDictionary {
    fn find_scenario(&self, name: &str) -> StoreResult<Option<ScenarioDefinition>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| ConversationStoreError::Poisoned)?;
        Ok(inner.scenarios.get(name).cloned())
    }

    fn upsert_scenario(&self, scenario: ScenarioDefinition) -> StoreResult<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| ConversationStoreError::Poisoned)?;
        inner.scenarios.insert(scenario.name.clone(), scenario);
        Ok(())
    }

    fn is_migration_executed(&self, name: &str) -> StoreResult<bool> {
        let inner = self
            .inner
            .read()
            .map_err(|_| ConversationStoreError::Poisoned)?;
        Ok(inner.executed_migrations.contains(name))
    }

    fn mark_migration_executed(&self, name: &str) -> StoreResult<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| ConversationStoreError::Poisoned)?;
        inner.executed_migrations.insert(name.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScenarioDictionaryFile {
    schema_version: u32,
    #[serde(default)]
    scenarios: BTreeMap<String, ScenarioDefinition>,
    #[serde(default)]
    executed_migrations: BTreeSet<String>,
}

impl Default for ScenarioDictionaryFile {
    fn default() -> Self {
        Self {
            schema_version: Self::SCHEMA_VERSION,
            scenarios: BTreeMap::new(),
            executed_migrations: BTreeSet::new(),
        }
    }
}

impl VersionedState for ScenarioDictionaryFile {
    const SCHEMA_VERSION: u32 = 1;

    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

#[derive(Debug)]
pub struct FileScenarioDictionary {
    path: PathBuf,
    state: Mutex<ScenarioDictionaryFile>,
}

impl FileScenarioDictionary {
    pub fn open(path: PathBuf) -> StoreResult<Self> {
        let state = load_state::<ScenarioDictionaryFile>(&path)?;
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn read<T>(&self, view: impl FnOnce(&ScenarioDictionaryFile) -> T) -> StoreResult<T> {
        let state = self
            .state
            .lock()
            .map_err(|_| ConversationStoreError::Poisoned)?;
        Ok(view(&state))
    }

    fn write(&self, apply: impl FnOnce(&mut ScenarioDictionaryFile)) -> StoreResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ConversationStoreError::Poisoned)?;
        apply(&mut state);
        save_state(&self.path, &*state)?;
        Ok(())
    }
}

impl ScenarioDictionary for FileScenarioDictionary {
    fn find_scenario(&self, name: &str) -> StoreResult<Option<ScenarioDefinition>> {
        self.read(|state| state.scenarios.get(name).cloned())
    }

    fn upsert_scenario(&self, scenario: ScenarioDefinition) -> StoreResult<()> {
        self.write(|state| {
            state.scenarios.insert(scenario.name.clone(), scenario);
        })
    }

    fn is_migration_executed(&self, name: &str) -> StoreResult<bool> {
        self.read(|state| state.executed_migrations.contains(name))
    }

    fn mark_migration_executed(&self, name: &str) -> StoreResult<()> {
        self.write(|state| {
            state.executed_migrations.insert(name.to_string());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{
        run_pending_migrations, run_pipeline_migrations, FileScenarioDictionary,
        InMemoryScenarioDictionary, ScenarioDictionary, Slot, RUN_PIPELINE_SCENARIO,
    };

    #[test]
    fn functional_run_pipeline_migrations_install_two_ordered_questions() {
        let dictionary = InMemoryScenarioDictionary::new();
        let applied =
            run_pending_migrations(&dictionary, &run_pipeline_migrations()).expect("migrate");
        assert_eq!(
            applied,
            vec!["install-run-pipeline-scenario", "reword-destination-question"]
        );

        let scenario = dictionary
            .find_scenario(RUN_PIPELINE_SCENARIO)
            .expect("find")
            .expect("installed");
        assert_eq!(scenario.version, "1.1.0");
        let slots = scenario
            .questions
            .iter()
            .map(|question| question.slot)
            .collect::<Vec<_>>();
        assert_eq!(slots, vec![Slot::Destination, Slot::Pipeline]);
        assert!(scenario.questions[0].prompt.contains("repository <name>"));
    }

    #[test]
    fn regression_migrations_run_once_per_dictionary() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("scenarios.json");
        {
            let dictionary = FileScenarioDictionary::open(path.clone()).expect("open");
            run_pending_migrations(&dictionary, &run_pipeline_migrations()).expect("first run");
        }
        let dictionary = FileScenarioDictionary::open(path).expect("reopen");
        let applied =
            run_pending_migrations(&dictionary, &run_pipeline_migrations()).expect("second run");
        assert!(applied.is_empty());
        assert!(dictionary
            .is_migration_executed("install-run-pipeline-scenario")
            .expect("ledger"));
        assert!(dictionary
            .find_scenario(RUN_PIPELINE_SCENARIO)
            .expect("find")
            .is_some());
    }
}
