//! Apply a skill package to the project.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::backup::{clear_backup, create_backup, restore_backup};
use crate::commands::customize::CustomizeSession;
use crate::context::EngineContext;
use crate::error::EngineError;
use crate::exec::run_shell;
use crate::file_ops::execute_file_ops;
use crate::fs::{copy_file, sha256_file};
use crate::lock::LockGuard;
use crate::manifest::{
    SkillManifest, add_source, check_conflicts, check_core_version, check_dependencies,
    check_engine_version, modify_source, read_manifest,
};
use crate::merge::{MergeDisposition, merge_into_working};
use crate::remap::PathRemap;
use crate::resolutions::load_resolutions;
use crate::state::{SkillState, StructuredOutcomes};
use crate::structured::{
    merge_dependencies, merge_env_additions, merge_services, run_dependency_install,
};

/// Report of an apply attempt.
///
/// `applied` is false with `backup_pending` when merges conflicted; the
/// caller resolves by hand and then either records the application and
/// clears the backup, or restores and clears it.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub skill: String,
    pub version: String,
    pub applied: bool,
    pub merge_conflicts: Vec<String>,
    pub backup_pending: bool,
    /// Skill-managed files whose working-tree content had drifted from base.
    pub untracked_changes: Vec<String>,
    pub warnings: Vec<String>,
}

/// Applies a skill package: file ops, adds, three-way merges, structured
/// merges, post-apply hooks, ledger record, and the skill's own test.
#[derive(Debug)]
pub struct ApplyCommand<'a> {
    ctx: &'a EngineContext,
}

impl<'a> ApplyCommand<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    pub fn execute(&self, skill_dir: &Path) -> anyhow::Result<ApplyReport> {
        let ctx = self.ctx;
        let manifest = read_manifest(skill_dir)?;
        let state = ctx.state_store().load()?;

        // --- Pre-flight, before the lock and before anything is touched ---
        check_engine_version(&manifest)?;
        if CustomizeSession::new(ctx).is_active() {
            return Err(EngineError::precondition(
                "A customize session is active. Commit or abort it first.",
            )
            .into());
        }
        check_dependencies(&manifest, &state)?;
        check_conflicts(&manifest, &state)?;

        let mut warnings = Vec::new();
        if let Some(warning) = check_core_version(&manifest, &state) {
            warn!("{warning}");
            warnings.push(warning);
        }

        let remap = ctx.state_store().path_remap()?;
        let drift = detect_drift(ctx, &manifest, &remap)?;
        if !drift.is_empty() {
            info!(
                files = %drift.join(", "),
                "drift detected; three-way merge will reconcile changes"
            );
        }

        let _guard = LockGuard::acquire(ctx)?;

        let mut added_files: Vec<PathBuf> = Vec::new();
        let outcome = self.run_locked(
            skill_dir,
            &manifest,
            &state,
            &remap,
            drift,
            warnings,
            &mut added_files,
        );
        match outcome {
            Ok(report) => Ok(report),
            Err(err) => {
                // Unwind: drop the files this apply introduced, then put the
                // backed-up set back
                remove_added(&added_files);
                restore_backup(ctx)?;
                clear_backup(ctx)?;
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_locked(
        &self,
        skill_dir: &Path,
        manifest: &SkillManifest,
        state: &SkillState,
        remap: &PathRemap,
        drift: Vec<String>,
        warnings: Vec<String>,
        added_files: &mut Vec<PathBuf>,
    ) -> anyhow::Result<ApplyReport> {
        let ctx = self.ctx;
        let mut report = ApplyReport {
            skill: manifest.skill.clone(),
            version: manifest.version.clone(),
            untracked_changes: drift,
            warnings,
            ..Default::default()
        };

        // --- Backup every path this apply may touch ---
        let mut backup_paths: Vec<PathBuf> = Vec::new();
        for rel_path in manifest.modifies.iter().chain(manifest.adds.iter()) {
            backup_paths.push(ctx.project_root().join(remap.resolve(rel_path)));
        }
        for op in &manifest.file_ops {
            if let Some(from) = op.from_path() {
                backup_paths.push(ctx.project_root().join(remap.resolve(from)));
            }
        }
        backup_paths.push(ctx.package_json_path());
        backup_paths.push(ctx.package_lock_path());
        backup_paths.push(ctx.env_file_path());
        backup_paths.push(ctx.compose_path());
        create_backup(ctx, &backup_paths)?;

        // --- File operations run before adds ---
        if !manifest.file_ops.is_empty() {
            let ops_report = execute_file_ops(&manifest.file_ops, ctx.project_root())?;
            report.warnings.extend(ops_report.warnings);
        }

        // --- Copy added files, remembering what did not exist for rollback ---
        for rel_path in &manifest.adds {
            let src = add_source(skill_dir, rel_path);
            if !src.exists() {
                continue;
            }
            let dest = ctx.project_root().join(remap.resolve(rel_path));
            if !dest.exists() {
                added_files.push(dest.clone());
            }
            copy_file(&src, &dest)?;
        }

        // --- Preload recorded resolutions for this skill combination ---
        let mut combination = state.applied_names();
        combination.push(manifest.skill.clone());
        load_resolutions(ctx, &combination, Some(skill_dir))?;

        // --- Three-way merge each modified file ---
        for rel_path in &manifest.modifies {
            let resolved = remap.resolve(rel_path).to_string();
            let current = ctx.project_root().join(&resolved);
            let base = ctx.base_dir().join(&resolved);
            let skill_path = modify_source(skill_dir, rel_path);

            if !skill_path.exists() {
                anyhow::bail!("Skill modified file not found: {}", skill_path.display());
            }
            if !current.exists() {
                copy_file(&skill_path, &current)?;
                continue;
            }
            if !base.exists() {
                // First touch of this file; the pre-skill content becomes base
                copy_file(&current, &base)?;
            }

            match merge_into_working(ctx.project_root(), &resolved, &current, &base, &skill_path)?
            {
                MergeDisposition::Clean | MergeDisposition::AutoResolved => {}
                MergeDisposition::Conflict => report.merge_conflicts.push(rel_path.clone()),
            }
        }

        if !report.merge_conflicts.is_empty() {
            // The backup stays on disk so the caller can resolve by hand and
            // then commit (record + clear) or abort (restore + clear)
            report.backup_pending = true;
            warn!(
                files = %report.merge_conflicts.join(", "),
                "merge conflicts; backup preserved for manual resolution"
            );
            return Ok(report);
        }

        // --- Structured merges ---
        if let Some(structured) = &manifest.structured {
            if !structured.npm_dependencies.is_empty() {
                merge_dependencies(&ctx.package_json_path(), &structured.npm_dependencies)?;
            }
            if !structured.env_additions.is_empty() {
                merge_env_additions(&ctx.env_file_path(), &structured.env_additions)?;
            }
            if !structured.docker_compose_services.is_empty() {
                merge_services(&ctx.compose_path(), &structured.docker_compose_services)?;
            }
            if !structured.npm_dependencies.is_empty() {
                run_dependency_install(ctx.project_root())?;
            }
        }

        // --- Post-apply hooks ---
        for command in &manifest.post_apply {
            run_shell(command, ctx.project_root())?;
        }

        // --- Record the application before its test runs ---
        let file_hashes = collect_file_hashes(ctx, manifest, remap)?;
        let outcomes =
            StructuredOutcomes::from_manifest(manifest.structured.as_ref(), manifest.test.as_deref());
        ctx.state_store().record_applied_skill(
            &manifest.skill,
            &manifest.version,
            file_hashes,
            outcomes,
        )?;

        // --- Verify; failure also unwinds the fresh ledger entry ---
        if let Some(test) = &manifest.test
            && let Err(err) = run_shell(test, ctx.project_root())
        {
            ctx.state_store().remove_applied_skill(&manifest.skill)?;
            return Err(err.context(format!("Tests failed for skill {}", manifest.skill)));
        }

        clear_backup(ctx)?;
        info!(skill = %manifest.skill, version = %manifest.version, "skill applied");
        report.applied = true;
        Ok(report)
    }
}

/// Paths whose working-tree hash differs from their base copy.
fn detect_drift(
    ctx: &EngineContext,
    manifest: &SkillManifest,
    remap: &PathRemap,
) -> anyhow::Result<Vec<String>> {
    let mut drift = Vec::new();
    for rel_path in &manifest.modifies {
        let resolved = remap.resolve(rel_path);
        let current = ctx.project_root().join(resolved);
        let base = ctx.base_dir().join(resolved);
        if current.exists()
            && base.exists()
            && sha256_file(&current)? != sha256_file(&base)?
        {
            drift.push(rel_path.clone());
        }
    }
    Ok(drift)
}

/// Refresh the hash of every add and modify target after a successful apply.
fn collect_file_hashes(
    ctx: &EngineContext,
    manifest: &SkillManifest,
    remap: &PathRemap,
) -> anyhow::Result<BTreeMap<String, String>> {
    let mut hashes = BTreeMap::new();
    for rel_path in manifest.adds.iter().chain(manifest.modifies.iter()) {
        let resolved = remap.resolve(rel_path).to_string();
        let path = ctx.project_root().join(&resolved);
        if path.exists() {
            hashes.insert(resolved, sha256_file(&path)?);
        }
    }
    Ok(hashes)
}

fn remove_added(added_files: &[PathBuf]) {
    for file in added_files {
        if file.exists()
            && let Err(err) = fs::remove_file(file)
        {
            warn!(path = %file.display(), error = %err, "failed to remove added file during rollback");
        }
    }
}
