//! Ledger persistence with atomic writes and forward-compatibility refusal.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;

use crate::ENGINE_SCHEMA_VERSION;
use crate::error::EngineError;
use crate::remap::PathRemap;
use crate::state::types::{AppliedSkill, CustomModification, SkillState, StructuredOutcomes};
use crate::version::compare_versions;

/// Loads and saves the ledger at `.g2/state.yaml`.
#[derive(Debug, Clone)]
pub struct StateStore {
    state_path: PathBuf,
}

impl StateStore {
    pub fn new(state_path: PathBuf) -> Self {
        Self { state_path }
    }

    pub fn exists(&self) -> bool {
        self.state_path.exists()
    }

    /// Read and validate the ledger.
    ///
    /// Refuses a ledger written by a newer engine than this one.
    pub fn load(&self) -> anyhow::Result<SkillState> {
        if !self.state_path.exists() {
            anyhow::bail!(
                "{} not found. Run init first.",
                self.state_path.display()
            );
        }
        let content = fs::read_to_string(&self.state_path)
            .with_context(|| format!("Failed to read state: {}", self.state_path.display()))?;
        let state: SkillState = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse state: {}", self.state_path.display()))?;

        if compare_versions(&state.skills_system_version, ENGINE_SCHEMA_VERSION)
            == Ordering::Greater
        {
            return Err(EngineError::precondition(format!(
                "state.yaml version {} is newer than engine version {}. Update your skills engine.",
                state.skills_system_version, ENGINE_SCHEMA_VERSION
            ))
            .into());
        }

        Ok(state)
    }

    /// Atomically write the ledger (write-temp then rename).
    pub fn save(&self, state: &SkillState) -> anyhow::Result<()> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content =
            serde_yaml::to_string(state).context("Failed to serialize state")?;

        let tmp_path = self.state_path.with_extension("yaml.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write state: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.state_path).with_context(|| {
            format!("Failed to move state into place: {}", self.state_path.display())
        })?;
        Ok(())
    }

    /// Record a skill application, replacing any previous entry by name.
    pub fn record_applied_skill(
        &self,
        name: &str,
        version: &str,
        file_hashes: BTreeMap<String, String>,
        structured_outcomes: Option<StructuredOutcomes>,
    ) -> anyhow::Result<()> {
        let mut state = self.load()?;
        state.applied_skills.retain(|s| s.name != name);
        state.applied_skills.push(AppliedSkill {
            name: name.to_string(),
            version: version.to_string(),
            applied_at: Utc::now().to_rfc3339(),
            file_hashes,
            structured_outcomes,
            custom_patch: None,
            custom_patch_description: None,
        });
        self.save(&state)
    }

    /// Drop a skill's ledger entry, if present.
    pub fn remove_applied_skill(&self, name: &str) -> anyhow::Result<()> {
        let mut state = self.load()?;
        state.applied_skills.retain(|s| s.name != name);
        self.save(&state)
    }

    /// Append a custom-modification record.
    pub fn record_custom_modification(
        &self,
        description: &str,
        files_modified: Vec<String>,
        patch_file: &str,
    ) -> anyhow::Result<()> {
        let mut state = self.load()?;
        let mods = state.custom_modifications.get_or_insert_with(Vec::new);
        mods.push(CustomModification {
            description: description.to_string(),
            applied_at: Utc::now().to_rfc3339(),
            files_modified,
            patch_file: patch_file.to_string(),
        });
        self.save(&state)
    }

    /// Load the path remap from the ledger.
    pub fn path_remap(&self) -> anyhow::Result<PathRemap> {
        let state = self.load()?;
        Ok(PathRemap::from_map(state.path_remap.unwrap_or_default()))
    }

    /// Merge new remappings into the ledger.
    pub fn merge_path_remap(&self, remap: BTreeMap<String, String>) -> anyhow::Result<()> {
        let mut state = self.load()?;
        let merged = state.path_remap.get_or_insert_with(BTreeMap::new);
        merged.extend(remap);
        self.save(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> StateStore {
        StateStore::new(dir.path().join(".g2/state.yaml"))
    }

    fn fresh_state() -> SkillState {
        SkillState::new(ENGINE_SCHEMA_VERSION.to_string(), "1.0.0".to_string())
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let store = store_in(&tmp);
        store.save(&fresh_state()).expect("save should succeed");

        let loaded = store.load().expect("load should succeed");
        assert_eq!(loaded.core_version, "1.0.0");
        assert!(!tmp.path().join(".g2/state.yaml.tmp").exists());
    }

    #[test]
    fn test_load_missing_fails() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        assert!(store_in(&tmp).load().is_err());
    }

    #[test]
    fn test_newer_schema_refused() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let store = store_in(&tmp);
        let mut state = fresh_state();
        state.skills_system_version = "99.0.0".to_string();
        store.save(&state).expect("save should succeed");

        let err = store.load().expect_err("newer schema must be refused");
        assert!(err.downcast_ref::<EngineError>().is_some());
    }

    #[test]
    fn test_record_replaces_by_name() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let store = store_in(&tmp);
        store.save(&fresh_state()).expect("save should succeed");

        store
            .record_applied_skill("telegram", "1.0.0", BTreeMap::new(), None)
            .expect("record should succeed");
        store
            .record_applied_skill("discord", "1.0.0", BTreeMap::new(), None)
            .expect("record should succeed");
        store
            .record_applied_skill("telegram", "2.0.0", BTreeMap::new(), None)
            .expect("record should succeed");

        let state = store.load().expect("load should succeed");
        assert_eq!(state.applied_skills.len(), 2);
        // Re-application moves the skill to the end of the order
        assert_eq!(state.applied_skills[0].name, "discord");
        assert_eq!(state.applied_skills[1].name, "telegram");
        assert_eq!(state.applied_skills[1].version, "2.0.0");
    }

    #[test]
    fn test_path_remap_merge() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let store = store_in(&tmp);
        store.save(&fresh_state()).expect("save should succeed");

        let mut first = BTreeMap::new();
        first.insert("src/old.ts".to_string(), "src/new.ts".to_string());
        store.merge_path_remap(first).expect("merge should succeed");

        let mut second = BTreeMap::new();
        second.insert("src/a.ts".to_string(), "src/b.ts".to_string());
        store.merge_path_remap(second).expect("merge should succeed");

        let remap = store.path_remap().expect("load should succeed");
        assert_eq!(remap.resolve("src/old.ts"), "src/new.ts");
        assert_eq!(remap.resolve("src/a.ts"), "src/b.ts");
        assert_eq!(remap.resolve("src/other.ts"), "src/other.ts");
    }
}
