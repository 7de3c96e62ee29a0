//! Uninstall a skill by replaying the remaining skills on a clean base.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use tracing::{info, warn};

use crate::backup::{clear_backup, create_backup, restore_backup};
use crate::commands::replay::{find_skill_dir, replay_skills, reset_to_base};
use crate::context::EngineContext;
use crate::diff::apply_patch_3way;
use crate::error::EngineError;
use crate::exec::run_shell;
use crate::fs::sha256_file;
use crate::lock::LockGuard;
use crate::state::SkillState;

/// Report of an uninstall attempt.
#[derive(Debug, Default)]
pub struct UninstallReport {
    pub skill: String,
    pub removed: bool,
    /// Set when the skill carries a custom patch and the caller did not
    /// confirm; nothing was changed.
    pub custom_patch_warning: Option<String>,
    /// Per remaining skill: did its test pass after the replay.
    pub replay_results: BTreeMap<String, bool>,
}

/// Removes a skill via replay-without: reset its files, then re-apply every
/// remaining skill in original order.
#[derive(Debug)]
pub struct UninstallCommand<'a> {
    ctx: &'a EngineContext,
}

impl<'a> UninstallCommand<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    pub fn execute(&self, skill_name: &str, confirm: bool) -> anyhow::Result<UninstallReport> {
        let ctx = self.ctx;
        let state = ctx.state_store().load()?;

        // After a rebase the base already includes every skill
        if state.rebased_at.is_some() {
            return Err(EngineError::precondition(
                "Cannot uninstall individual skills after rebase. The base includes all \
                 skill modifications. To remove a skill, start from a clean core and \
                 re-apply the skills you want.",
            )
            .into());
        }

        let Some(entry) = state.applied_skill(skill_name) else {
            return Err(EngineError::precondition(format!(
                "Skill \"{skill_name}\" is not applied."
            ))
            .into());
        };

        if let Some(patch) = &entry.custom_patch
            && !confirm
        {
            let description = entry
                .custom_patch_description
                .as_deref()
                .unwrap_or("no description");
            warn!(skill = skill_name, patch = %patch, "uninstall would discard a custom patch");
            return Ok(UninstallReport {
                skill: skill_name.to_string(),
                custom_patch_warning: Some(format!(
                    "Skill \"{skill_name}\" has a custom patch ({description}). Uninstalling \
                     will lose these customizations. Re-run with confirmation to proceed."
                )),
                ..Default::default()
            });
        }

        let _guard = LockGuard::acquire(ctx)?;
        match self.run_locked(&state, skill_name) {
            Ok(report) => Ok(report),
            Err(err) => {
                restore_backup(ctx)?;
                clear_backup(ctx)?;
                Err(err)
            }
        }
    }

    fn run_locked(&self, state: &SkillState, skill_name: &str) -> anyhow::Result<UninstallReport> {
        let ctx = self.ctx;
        let entry = state
            .applied_skill(skill_name)
            .expect("presence was checked before locking");

        // --- Backup every file any applied skill or custom patch touches ---
        let mut all_touched: BTreeSet<String> = BTreeSet::new();
        for skill in &state.applied_skills {
            all_touched.extend(skill.file_hashes.keys().cloned());
        }
        for custom in state.custom_mods() {
            all_touched.extend(custom.files_modified.iter().cloned());
        }
        let backup_paths: Vec<PathBuf> = all_touched
            .iter()
            .map(|rel| ctx.project_root().join(rel))
            .collect();
        create_backup(ctx, &backup_paths)?;

        // --- Locate every remaining skill's package before touching files ---
        let remaining: Vec<String> = state
            .applied_skills
            .iter()
            .filter(|s| s.name != skill_name)
            .map(|s| s.name.clone())
            .collect();
        let mut skill_dirs: BTreeMap<String, PathBuf> = BTreeMap::new();
        for name in &remaining {
            let Some(dir) = find_skill_dir(ctx, name) else {
                return Err(EngineError::precondition(format!(
                    "Cannot find skill package for \"{name}\" in .claude/skills/. All \
                     remaining skills must be available for replay."
                ))
                .into());
            };
            skill_dirs.insert(name.clone(), dir);
        }

        // --- Reset files only the removed skill touched; replay covers the rest ---
        let remap = ctx.state_store().path_remap()?;
        let remaining_files: BTreeSet<String> = state
            .applied_skills
            .iter()
            .filter(|s| s.name != skill_name)
            .flat_map(|s| s.file_hashes.keys().cloned())
            .collect();
        let exclusive: BTreeSet<String> = entry
            .file_hashes
            .keys()
            .filter(|path| !remaining_files.contains(*path))
            .cloned()
            .collect();
        reset_to_base(ctx, &exclusive, &remap)?;

        // --- Replay the remaining skills on the clean base ---
        let replay = replay_skills(ctx, &remaining, &skill_dirs)?;
        if !replay.success {
            return Err(EngineError::precondition(format!(
                "Replay failed: {}",
                replay.error.unwrap_or_else(|| "unknown error".to_string())
            ))
            .into());
        }

        // --- Re-apply standalone custom modifications ---
        for custom in state.custom_mods() {
            let patch_path = ctx.project_root().join(&custom.patch_file);
            if patch_path.exists()
                && let Err(err) = apply_patch_3way(ctx.project_root(), &patch_path)
            {
                warn!(
                    patch = %custom.patch_file,
                    error = %err,
                    "custom patch did not re-apply after uninstall"
                );
            }
        }

        // --- Run remaining skills' tests ---
        let mut replay_results: BTreeMap<String, bool> = BTreeMap::new();
        for skill in &state.applied_skills {
            if skill.name == skill_name {
                continue;
            }
            let Some(test) = skill
                .structured_outcomes
                .as_ref()
                .and_then(|o| o.test.as_deref())
            else {
                continue;
            };
            let passed = run_shell(test, ctx.project_root()).is_ok();
            replay_results.insert(skill.name.clone(), passed);
        }
        let failures: Vec<&str> = replay_results
            .iter()
            .filter(|(_, passed)| !**passed)
            .map(|(name, _)| name.as_str())
            .collect();
        if !failures.is_empty() {
            return Err(EngineError::precondition(format!(
                "Tests failed after uninstall: {}",
                failures.join(", ")
            ))
            .into());
        }

        // --- Update the ledger: drop the skill, refresh remaining hashes ---
        let mut new_state = state.clone();
        new_state.applied_skills.retain(|s| s.name != skill_name);
        for skill in &mut new_state.applied_skills {
            let mut refreshed = BTreeMap::new();
            for rel_path in skill.file_hashes.keys() {
                let path = ctx.project_root().join(rel_path);
                if path.exists() {
                    refreshed.insert(rel_path.clone(), sha256_file(&path)?);
                }
            }
            skill.file_hashes = refreshed;
        }
        ctx.state_store().save(&new_state)?;

        clear_backup(ctx)?;
        info!(skill = skill_name, "skill uninstalled");
        Ok(UninstallReport {
            skill: skill_name.to_string(),
            removed: true,
            custom_patch_warning: None,
            replay_results,
        })
    }
}
