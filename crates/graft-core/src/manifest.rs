//! Skill manifest parsing, validation, and compatibility checks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::ENGINE_SCHEMA_VERSION;
use crate::error::EngineError;
use crate::state::SkillState;
use crate::version::compare_versions;

/// A file operation carried by a manifest, executed before adds.
///
/// The tag is the operation type; unknown types are rejected at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileOperation {
    Rename { from: String, to: String },
    Move { from: String, to: String },
    Delete { path: String },
}

impl FileOperation {
    /// The source path of the operation, when it has one.
    pub fn from_path(&self) -> Option<&str> {
        match self {
            Self::Rename { from, .. } | Self::Move { from, .. } => Some(from),
            Self::Delete { .. } => None,
        }
    }
}

/// Structured configuration additions a skill can carry.
///
/// Also flattened into ledger outcomes, so it must tolerate sibling keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredAdditions {
    /// Package name -> version range for the dependency table.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub npm_dependencies: BTreeMap<String, String>,

    /// Variable names to declare in the env file.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_additions: Vec<String>,

    /// Service name -> definition for the container-service manifest.
    #[serde(default, skip_serializing_if = "serde_yaml::Mapping::is_empty")]
    pub docker_compose_services: serde_yaml::Mapping,
}

impl StructuredAdditions {
    pub fn is_empty(&self) -> bool {
        self.npm_dependencies.is_empty()
            && self.env_additions.is_empty()
            && self.docker_compose_services.is_empty()
    }
}

/// A skill package's manifest.
///
/// Unknown keys are rejected so schema drift surfaces at parse time rather
/// than as silently ignored fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkillManifest {
    /// Unique skill identifier.
    pub skill: String,
    pub version: String,

    #[serde(default)]
    pub description: String,

    /// Core version the skill was authored against.
    pub core_version: String,

    /// New relative paths the skill adds.
    pub adds: Vec<String>,

    /// Existing relative paths the skill modifies.
    pub modifies: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<StructuredAdditions>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_ops: Vec<FileOperation>,

    /// Skills this one cannot coexist with.
    #[serde(default)]
    pub conflicts: Vec<String>,

    /// Skills that must be applied before this one.
    #[serde(default)]
    pub depends: Vec<String>,

    /// Shell command verifying the skill after application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,

    /// Engine-version floor for applying this skill.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_skills_system_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tested_with: Option<Vec<String>>,

    /// Shell commands run after a successful merge, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_apply: Vec<String>,
}

/// Read and validate a skill manifest from a package directory.
pub fn read_manifest(skill_dir: &Path) -> anyhow::Result<SkillManifest> {
    let manifest_path = skill_dir.join("manifest.yaml");
    if !manifest_path.exists() {
        anyhow::bail!("Manifest not found: {}", manifest_path.display());
    }
    let content = fs_read(&manifest_path)?;
    let manifest: SkillManifest = serde_yaml::from_str(&content).map_err(|err| {
        EngineError::invalid_input(format!(
            "Invalid manifest {}: {}",
            manifest_path.display(),
            err
        ))
    })?;

    for path in manifest.adds.iter().chain(manifest.modifies.iter()) {
        validate_relative(path)?;
    }
    Ok(manifest)
}

/// Reject absolute paths and any `..` segment.
pub fn validate_relative(rel_path: &str) -> Result<(), EngineError> {
    let path = Path::new(rel_path);
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
    if escapes {
        return Err(EngineError::InvalidInput(format!(
            "invalid path in manifest: {rel_path} (must be relative without \"..\")"
        )));
    }
    Ok(())
}

/// Check the engine-version floor; too-new skills are refused.
pub fn check_engine_version(manifest: &SkillManifest) -> Result<(), EngineError> {
    if let Some(floor) = &manifest.min_skills_system_version
        && compare_versions(floor, ENGINE_SCHEMA_VERSION) == std::cmp::Ordering::Greater
    {
        return Err(EngineError::Precondition(format!(
            "Skill requires skills system version {floor} but current is \
             {ENGINE_SCHEMA_VERSION}. Update your skills engine."
        )));
    }
    Ok(())
}

/// Warn (never block) when a skill targets a newer core than the ledger's.
pub fn check_core_version(manifest: &SkillManifest, state: &SkillState) -> Option<String> {
    if compare_versions(&manifest.core_version, &state.core_version) == std::cmp::Ordering::Greater
    {
        return Some(format!(
            "Skill targets core {} but current core is {}. The merge might still \
             work but there's a compatibility risk.",
            manifest.core_version, state.core_version
        ));
    }
    None
}

/// Require every declared dependency to already be applied.
pub fn check_dependencies(manifest: &SkillManifest, state: &SkillState) -> Result<(), EngineError> {
    let applied = state.applied_names();
    let missing: Vec<&str> = manifest
        .depends
        .iter()
        .filter(|dep| !applied.iter().any(|name| name == *dep))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(EngineError::Precondition(format!(
            "Missing dependencies: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Refuse when any conflicting skill is currently applied.
pub fn check_conflicts(manifest: &SkillManifest, state: &SkillState) -> Result<(), EngineError> {
    let applied = state.applied_names();
    let conflicting: Vec<&str> = manifest
        .conflicts
        .iter()
        .filter(|c| applied.iter().any(|name| name == *c))
        .map(String::as_str)
        .collect();
    if !conflicting.is_empty() {
        return Err(EngineError::Precondition(format!(
            "Conflicting skills: {}",
            conflicting.join(", ")
        )));
    }
    Ok(())
}

/// Path to a skill's added file inside its package.
pub fn add_source(skill_dir: &Path, rel_path: &str) -> PathBuf {
    skill_dir.join("add").join(rel_path)
}

/// Path to a skill's modified-file content inside its package.
///
/// Always keyed by the manifest's original path; packages are never remapped.
pub fn modify_source(skill_dir: &Path, rel_path: &str) -> PathBuf {
    skill_dir.join("modify").join(rel_path)
}

fn fs_read(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest: {}", path.display()))
}
