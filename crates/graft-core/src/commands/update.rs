//! Core update: preview and apply a new core with three-way merges.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{info, warn};

use crate::backup::{clear_backup, create_backup, restore_backup};
use crate::commands::customize::CustomizeSession;
use crate::commands::replay::StructuredAggregate;
use crate::context::EngineContext;
use crate::diff::apply_patch_3way;
use crate::error::EngineError;
use crate::exec::run_shell;
use crate::fs::{copy_dir, copy_file, sha256_file, walk_files};
use crate::lock::LockGuard;
use crate::merge::{MergeDisposition, merge_into_working};
use crate::resolutions::clear_resolutions;
use crate::state::SkillState;

/// What a core update would change, computed before touching anything.
#[derive(Debug, Default)]
pub struct UpdatePreview {
    pub current_version: String,
    pub new_version: String,
    pub files_changed: Vec<String>,
    pub files_deleted: Vec<String>,
    /// Changed files also tracked by an applied skill.
    pub conflict_risk: Vec<String>,
    /// Changed files also touched by a custom modification.
    pub custom_patches_at_risk: Vec<String>,
}

/// Report of an update attempt.
#[derive(Debug, Default)]
pub struct UpdateReport {
    pub updated: bool,
    pub previous_version: String,
    pub new_version: String,
    pub merge_conflicts: Vec<String>,
    pub backup_pending: bool,
    pub custom_patch_failures: Vec<String>,
    /// Per skill: did its test pass against the new core.
    pub skill_reapply_results: BTreeMap<String, bool>,
}

/// Swaps the base for a new core while preserving skill and user overlays.
#[derive(Debug)]
pub struct UpdateCommand<'a> {
    ctx: &'a EngineContext,
}

impl<'a> UpdateCommand<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    /// Compare the new core against the base snapshot.
    pub fn preview(&self, new_core: &Path) -> anyhow::Result<UpdatePreview> {
        let ctx = self.ctx;
        let state = ctx.state_store().load()?;

        let new_core_files = walk_files(new_core)?;
        let mut preview = UpdatePreview {
            current_version: state.core_version.clone(),
            new_version: read_core_version(new_core),
            ..Default::default()
        };

        for rel_path in &new_core_files {
            let base_path = ctx.base_dir().join(rel_path);
            if !base_path.exists()
                || sha256_file(&base_path)? != sha256_file(&new_core.join(rel_path))?
            {
                preview.files_changed.push(rel_path.clone());
            }
        }

        for rel_path in walk_files(&ctx.base_dir())? {
            if !new_core_files.contains(&rel_path) {
                preview.files_deleted.push(rel_path);
            }
        }

        for rel_path in &preview.files_changed {
            if state
                .applied_skills
                .iter()
                .any(|skill| skill.file_hashes.contains_key(rel_path))
            {
                preview.conflict_risk.push(rel_path.clone());
            }
            if state
                .custom_mods()
                .iter()
                .any(|custom| custom.files_modified.contains(rel_path))
            {
                preview.custom_patches_at_risk.push(rel_path.clone());
            }
        }

        Ok(preview)
    }

    pub fn execute(&self, new_core: &Path) -> anyhow::Result<UpdateReport> {
        let ctx = self.ctx;
        if CustomizeSession::new(ctx).is_active() {
            return Err(EngineError::precondition(
                "A customize session is active. Commit or abort it first.",
            )
            .into());
        }
        let state = ctx.state_store().load()?;

        let _guard = LockGuard::acquire(ctx)?;
        match self.run_locked(&state, new_core) {
            Ok(report) => Ok(report),
            Err(err) => {
                restore_backup(ctx)?;
                clear_backup(ctx)?;
                Err(err)
            }
        }
    }

    fn run_locked(&self, state: &SkillState, new_core: &Path) -> anyhow::Result<UpdateReport> {
        let ctx = self.ctx;
        let preview = self.preview(new_core)?;
        let mut report = UpdateReport {
            previous_version: preview.current_version.clone(),
            new_version: preview.new_version.clone(),
            ..Default::default()
        };

        // --- Backup everything the update may rewrite or delete ---
        let backup_paths: Vec<PathBuf> = preview
            .files_changed
            .iter()
            .chain(preview.files_deleted.iter())
            .map(|rel| ctx.project_root().join(rel))
            .collect();
        create_backup(ctx, &backup_paths)?;

        // --- Three-way merge each changed file: working <- base -> new core ---
        for rel_path in &preview.files_changed {
            let current = ctx.project_root().join(rel_path);
            let base = ctx.base_dir().join(rel_path);
            let incoming = new_core.join(rel_path);

            if !current.exists() {
                copy_file(&incoming, &current)?;
                continue;
            }
            if !base.exists() {
                copy_file(&current, &base)?;
            }

            match merge_into_working(ctx.project_root(), rel_path, &current, &base, &incoming)? {
                MergeDisposition::Clean | MergeDisposition::AutoResolved => {}
                MergeDisposition::Conflict => report.merge_conflicts.push(rel_path.clone()),
            }
        }

        if !report.merge_conflicts.is_empty() {
            report.backup_pending = true;
            warn!(
                files = %report.merge_conflicts.join(", "),
                "update conflicts; backup preserved for manual resolution"
            );
            return Ok(report);
        }

        // --- Drop files the new core removed ---
        for rel_path in &preview.files_deleted {
            let current = ctx.project_root().join(rel_path);
            if current.exists() {
                fs::remove_file(&current).with_context(|| {
                    format!("Failed to remove deleted core file: {}", current.display())
                })?;
            }
        }

        // --- Re-apply custom patches, collecting failures ---
        for custom in state.custom_mods() {
            let patch_path = ctx.project_root().join(&custom.patch_file);
            if !patch_path.exists() {
                report.custom_patch_failures.push(format!(
                    "{}: patch file missing ({})",
                    custom.description, custom.patch_file
                ));
                continue;
            }
            if let Err(err) = apply_patch_3way(ctx.project_root(), &patch_path) {
                warn!(
                    patch = %custom.patch_file,
                    error = %err,
                    "custom patch did not re-apply after update"
                );
                report.custom_patch_failures.push(custom.description.clone());
            }
        }

        // --- Merge path remaps shipped with the new core ---
        let remap_file = new_core.join(".g2-meta").join("path_remap.yaml");
        if remap_file.exists() {
            let content = fs::read_to_string(&remap_file)
                .with_context(|| format!("Failed to read {}", remap_file.display()))?;
            let remap: BTreeMap<String, String> = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", remap_file.display()))?;
            if !remap.is_empty() {
                ctx.state_store().merge_path_remap(remap)?;
            }
        }

        // --- Replace the base with the new core ---
        let base_dir = ctx.base_dir();
        if base_dir.exists() {
            fs::remove_dir_all(&base_dir)
                .with_context(|| format!("Failed to clear base: {}", base_dir.display()))?;
        }
        copy_dir(new_core, &base_dir)?;

        // --- Re-apply structured outcomes aggregated across all skills ---
        let mut aggregate = StructuredAggregate::default();
        for skill in &state.applied_skills {
            if let Some(outcomes) = &skill.structured_outcomes {
                aggregate.absorb(&outcomes.additions);
            }
        }
        aggregate.apply(ctx)?;
        if aggregate.has_dependencies() {
            crate::structured::run_dependency_install(ctx.project_root())?;
        }

        // --- Run each skill's test against the new core ---
        for skill in &state.applied_skills {
            let Some(test) = skill
                .structured_outcomes
                .as_ref()
                .and_then(|o| o.test.as_deref())
            else {
                continue;
            };
            let passed = run_shell(test, ctx.project_root()).is_ok();
            report
                .skill_reapply_results
                .insert(skill.name.clone(), passed);
        }

        // --- Bump the core version; the base changed, so the cache is stale ---
        let mut new_state = ctx.state_store().load()?;
        new_state.core_version = preview.new_version.clone();
        ctx.state_store().save(&new_state)?;
        clear_resolutions(ctx)?;

        clear_backup(ctx)?;
        info!(
            from = %report.previous_version,
            to = %report.new_version,
            "core updated"
        );
        report.updated = true;
        Ok(report)
    }
}

/// Read the core version from the new core's package.json, tolerating absence.
fn read_core_version(core_dir: &Path) -> String {
    let pkg_path = core_dir.join("package.json");
    fs::read_to_string(&pkg_path)
        .ok()
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
        .and_then(|pkg| pkg.get("version").and_then(|v| v.as_str()).map(String::from))
        .unwrap_or_else(|| "unknown".to_string())
}
