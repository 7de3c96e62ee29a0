//! Ledger entry types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::manifest::StructuredAdditions;

/// The persisted skills ledger.
///
/// `applied_skills` order equals application order; replay depends on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillState {
    /// Schema version of the ledger format.
    pub skills_system_version: String,

    /// Version of the core code base the ledger tracks.
    pub core_version: String,

    /// Applied skills, in application order.
    #[serde(default)]
    pub applied_skills: Vec<AppliedSkill>,

    /// User-authored modifications layered on top of skills.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_modifications: Option<Vec<CustomModification>>,

    /// Old relative path -> new relative path, for renames carried by core
    /// updates. Never applied to skill-package paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_remap: Option<BTreeMap<String, String>>,

    /// Set when skills have been flattened into the base; presence blocks
    /// per-skill uninstall.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebased_at: Option<String>,
}

impl SkillState {
    /// Create a fresh ledger with no applied skills.
    pub fn new(skills_system_version: String, core_version: String) -> Self {
        Self {
            skills_system_version,
            core_version,
            applied_skills: Vec::new(),
            custom_modifications: None,
            path_remap: None,
            rebased_at: None,
        }
    }

    /// Look up an applied skill by name.
    pub fn applied_skill(&self, name: &str) -> Option<&AppliedSkill> {
        self.applied_skills.iter().find(|s| s.name == name)
    }

    /// Names of all applied skills, in application order.
    pub fn applied_names(&self) -> Vec<String> {
        self.applied_skills.iter().map(|s| s.name.clone()).collect()
    }

    /// Custom modifications, empty slice when none were recorded.
    pub fn custom_mods(&self) -> &[CustomModification] {
        self.custom_modifications.as_deref().unwrap_or(&[])
    }
}

/// One installed skill in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedSkill {
    pub name: String,
    pub version: String,

    /// RFC 3339 timestamp of the application.
    pub applied_at: String,

    /// Relative path -> SHA-256 hex of the file as applied. Refreshed by
    /// every operation that touches the file.
    pub file_hashes: BTreeMap<String, String>,

    /// Echo of the manifest's structured additions plus its test command,
    /// kept so update/uninstall can replay them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_outcomes: Option<StructuredOutcomes>,

    /// Patch file of user customizations bound to this skill, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_patch: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_patch_description: Option<String>,
}

/// Structured manifest data echoed into the ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredOutcomes {
    #[serde(flatten)]
    pub additions: StructuredAdditions,

    /// The skill's declared test command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
}

impl StructuredOutcomes {
    /// Build outcomes from a manifest's structured block and test command.
    pub fn from_manifest(
        additions: Option<&StructuredAdditions>,
        test: Option<&str>,
    ) -> Option<Self> {
        let additions = additions.cloned().unwrap_or_default();
        if additions.is_empty() && test.is_none() {
            return None;
        }
        Some(Self {
            additions,
            test: test.map(str::to_string),
        })
    }
}

/// A user-authored overlay recorded as a patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomModification {
    pub description: String,

    /// RFC 3339 timestamp of the commit.
    pub applied_at: String,

    pub files_modified: Vec<String>,

    /// Patch location under `.g2/custom/`, project-relative.
    pub patch_file: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_applied_skill_lookup() {
        let mut state = SkillState::new("0.1.0".to_string(), "1.0.0".to_string());
        state.applied_skills.push(AppliedSkill {
            name: "telegram".to_string(),
            version: "1.0.0".to_string(),
            applied_at: "2026-01-01T00:00:00Z".to_string(),
            file_hashes: BTreeMap::new(),
            structured_outcomes: None,
            custom_patch: None,
            custom_patch_description: None,
        });

        assert!(state.applied_skill("telegram").is_some());
        assert!(state.applied_skill("discord").is_none());
        assert_eq!(state.applied_names(), vec!["telegram".to_string()]);
    }

    #[test]
    fn test_state_yaml_round_trip() {
        let state = SkillState::new("0.1.0".to_string(), "1.2.3".to_string());
        let yaml = serde_yaml::to_string(&state).expect("serialize should succeed");
        // Optional fields are omitted entirely, not serialized as nulls
        assert!(!yaml.contains("rebased_at"));
        assert!(!yaml.contains("path_remap"));

        let back: SkillState = serde_yaml::from_str(&yaml).expect("parse should succeed");
        assert_eq!(back.core_version, "1.2.3");
        assert!(back.applied_skills.is_empty());
    }

    #[test]
    fn test_outcomes_absent_when_empty() {
        assert!(StructuredOutcomes::from_manifest(None, None).is_none());
        let outcomes = StructuredOutcomes::from_manifest(None, Some("npm test"))
            .expect("test command alone should produce outcomes");
        assert_eq!(outcomes.test.as_deref(), Some("npm test"));
    }
}
