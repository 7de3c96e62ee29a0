//! Rebase: flatten applied skills into the base, or carry them onto a new one.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};

use crate::backup::{clear_backup, create_backup, restore_backup};
use crate::context::EngineContext;
use crate::diff::unified_file_diff;
use crate::error::EngineError;
use crate::fs::{copy_dir, copy_file, sha256_file, walk_files};
use crate::lock::LockGuard;
use crate::merge::{merge_file, try_auto_resolve};
use crate::resolutions::clear_resolutions;
use crate::state::SkillState;

/// Report of a rebase attempt.
#[derive(Debug, Default)]
pub struct RebaseReport {
    pub flattened: bool,
    pub patch_file: Option<String>,
    pub files_in_patch: usize,
    pub rebased_at: Option<String>,
    pub merge_conflicts: Vec<String>,
    pub backup_pending: bool,
}

/// Rewrites the base snapshot.
///
/// Flatten mode copies the post-skill working tree into the base; new-base
/// mode swaps the base and three-way merges the accumulated overlay onto it.
/// Both modes archive the old-base-to-working-tree diff first and invalidate
/// the resolution cache afterwards.
#[derive(Debug)]
pub struct RebaseCommand<'a> {
    ctx: &'a EngineContext,
}

impl<'a> RebaseCommand<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    pub fn execute(&self, new_base: Option<&Path>) -> anyhow::Result<RebaseReport> {
        let ctx = self.ctx;
        let state = ctx.state_store().load()?;
        if state.applied_skills.is_empty() {
            return Err(EngineError::precondition("No skills applied. Nothing to rebase.").into());
        }

        let _guard = LockGuard::acquire(ctx)?;
        match self.run_locked(&state, new_base) {
            Ok(report) => Ok(report),
            Err(err) => {
                restore_backup(ctx)?;
                clear_backup(ctx)?;
                Err(err)
            }
        }
    }

    fn run_locked(
        &self,
        state: &SkillState,
        new_base: Option<&Path>,
    ) -> anyhow::Result<RebaseReport> {
        let ctx = self.ctx;
        let tracked = collect_tracked_files(ctx, state)?;

        // --- Backup the tracked set, the base copies, and the ledger ---
        let mut backup_paths: Vec<PathBuf> = Vec::new();
        for rel_path in &tracked {
            let working = ctx.project_root().join(rel_path);
            if working.exists() {
                backup_paths.push(working);
            }
            let base_copy = ctx.base_dir().join(rel_path);
            if base_copy.exists() {
                backup_paths.push(base_copy);
            }
        }
        backup_paths.push(ctx.state_path());
        create_backup(ctx, &backup_paths)?;

        // --- Archival diff: base -> working tree ---
        let mut report = RebaseReport::default();
        let mut combined_patch = String::new();
        for rel_path in &tracked {
            let base_path = ctx.base_dir().join(rel_path);
            let working_path = ctx.project_root().join(rel_path);
            if !base_path.exists() && !working_path.exists() {
                continue;
            }
            if let Some(patch) = unified_file_diff(&base_path, &working_path, rel_path)? {
                combined_patch.push_str(&patch);
                report.files_in_patch += 1;
            }
        }
        let patch_path = ctx.combined_patch_path();
        fs::write(&patch_path, &combined_patch)
            .with_context(|| format!("Failed to write {}", patch_path.display()))?;
        report.patch_file = Some(patch_path.display().to_string());

        if let Some(new_base) = new_base {
            let conflicts = self.rebase_onto(&tracked, new_base)?;
            if !conflicts.is_empty() {
                report.merge_conflicts = conflicts;
                report.backup_pending = true;
                warn!(
                    files = %report.merge_conflicts.join(", "),
                    "rebase conflicts; backup preserved for manual resolution"
                );
                return Ok(report);
            }
        } else {
            self.flatten(&tracked)?;
            report.flattened = true;
        }

        // --- Ledger: refresh hashes, drop custom mods, mark the rebase ---
        let now = Utc::now().to_rfc3339();
        let mut new_state = state.clone();
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
        new_state.custom_modifications = None;
        new_state.rebased_at = Some(now.clone());
        ctx.state_store().save(&new_state)?;

        // Every cached resolution hashed the old base into its inputs
        clear_resolutions(ctx)?;
        clear_backup(ctx)?;

        info!(files = report.files_in_patch, "rebase complete");
        report.rebased_at = Some(now);
        Ok(report)
    }

    /// Flatten: the base becomes the post-skill working tree.
    fn flatten(&self, tracked: &BTreeSet<String>) -> anyhow::Result<()> {
        let ctx = self.ctx;
        for rel_path in tracked {
            let working = ctx.project_root().join(rel_path);
            let base = ctx.base_dir().join(rel_path);
            if working.exists() {
                copy_file(&working, &base)?;
            } else if base.exists() {
                fs::remove_file(&base).with_context(|| {
                    format!("Failed to remove deleted file from base: {}", base.display())
                })?;
            }
        }
        Ok(())
    }

    /// New-base mode: swap the base, then merge the saved overlay per file:
    /// new base (ours) <- old base -> saved working tree (theirs).
    fn rebase_onto(
        &self,
        tracked: &BTreeSet<String>,
        new_base: &Path,
    ) -> anyhow::Result<Vec<String>> {
        let ctx = self.ctx;

        // The working tree is about to be overwritten; keep the overlay
        let mut saved: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for rel_path in tracked {
            let working = ctx.project_root().join(rel_path);
            if working.exists() {
                saved.insert(
                    rel_path.clone(),
                    fs::read(&working).with_context(|| {
                        format!("Failed to read working file: {}", working.display())
                    })?,
                );
            }
        }

        let base_dir = ctx.base_dir();
        if base_dir.exists() {
            fs::remove_dir_all(&base_dir)
                .with_context(|| format!("Failed to clear base: {}", base_dir.display()))?;
        }
        copy_dir(new_base, &base_dir)?;
        copy_dir(new_base, ctx.project_root())?;

        let mut conflicts = Vec::new();
        for rel_path in tracked {
            let Some(saved_content) = saved.get(rel_path) else {
                continue;
            };
            let current = ctx.project_root().join(rel_path);
            let new_base_src = new_base.join(rel_path);

            if !new_base_src.exists() {
                // Overlay-only file; the new base does not carry it
                if let Some(parent) = current.parent() {
                    fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create directory: {}", parent.display())
                    })?;
                }
                fs::write(&current, saved_content).with_context(|| {
                    format!("Failed to restore overlay file: {}", current.display())
                })?;
                continue;
            }

            let new_base_content = fs::read(&new_base_src).with_context(|| {
                format!("Failed to read new base file: {}", new_base_src.display())
            })?;
            if new_base_content == *saved_content {
                continue;
            }

            // The old base now only exists inside the backup
            let old_base_path = ctx
                .backup_dir()
                .join(".g2")
                .join("base")
                .join(rel_path);
            if !old_base_path.exists() {
                fs::write(&current, saved_content).with_context(|| {
                    format!("Failed to restore overlay file: {}", current.display())
                })?;
                continue;
            }

            let theirs = tempfile::Builder::new()
                .prefix("graft-rebase-")
                .tempfile()
                .context("Failed to create rebase scratch file")?;
            fs::write(theirs.path(), saved_content)
                .context("Failed to stage overlay content for merge")?;

            let outcome = merge_file(&current, &old_base_path, theirs.path())?;
            if outcome.clean {
                continue;
            }

            let old_base_content = fs::read(&old_base_path).with_context(|| {
                format!("Failed to read old base: {}", old_base_path.display())
            })?;
            let resolved = try_auto_resolve(
                ctx.project_root(),
                rel_path,
                &current,
                &old_base_content,
                &new_base_content,
                saved_content,
            )?;
            if !resolved {
                conflicts.push(rel_path.clone());
            }
        }
        Ok(conflicts)
    }
}

/// Every path applied skills or custom modifications track, plus every file
/// already in the base snapshot.
fn collect_tracked_files(
    ctx: &EngineContext,
    state: &SkillState,
) -> anyhow::Result<BTreeSet<String>> {
    let mut tracked: BTreeSet<String> = BTreeSet::new();
    for skill in &state.applied_skills {
        tracked.extend(skill.file_hashes.keys().cloned());
    }
    for custom in state.custom_mods() {
        tracked.extend(custom.files_modified.iter().cloned());
    }
    tracked.extend(walk_files(&ctx.base_dir())?);
    Ok(tracked)
}
