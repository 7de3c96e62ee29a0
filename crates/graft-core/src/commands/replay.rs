//! Replay skills from a clean base.
//!
//! The shared subroutine behind uninstall: reset every file the named skills
//! touch back to base, then apply each skill in its original order. Structured
//! outcomes are aggregated across all replayed skills and applied once at the
//! end -- last-write-wins for dependencies and services, order-preserving
//! union for env additions.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

use crate::context::EngineContext;
use crate::file_ops::execute_file_ops;
use crate::fs::copy_file;
use crate::manifest::{StructuredAdditions, add_source, modify_source, read_manifest};
use crate::merge::{MergeDisposition, merge_into_working};
use crate::remap::PathRemap;
use crate::resolutions::load_resolutions;
use crate::structured::{
    merge_dependencies, merge_env_additions, merge_services, run_dependency_install,
};

/// Per-skill outcome of a replay.
#[derive(Debug, Clone)]
pub struct SkillReplayOutcome {
    pub success: bool,
    pub error: Option<String>,
}

/// Result of replaying a list of skills.
#[derive(Debug, Default)]
pub struct ReplayReport {
    pub success: bool,
    pub per_skill: BTreeMap<String, SkillReplayOutcome>,
    pub merge_conflicts: Vec<String>,
    pub error: Option<String>,
}

/// Structured outcomes aggregated across skills, applied once.
#[derive(Debug, Default)]
pub struct StructuredAggregate {
    dependencies: BTreeMap<String, String>,
    env_additions: Vec<String>,
    services: serde_yaml::Mapping,
}

impl StructuredAggregate {
    /// Fold one skill's structured additions into the aggregate.
    pub fn absorb(&mut self, additions: &StructuredAdditions) {
        for (name, range) in &additions.npm_dependencies {
            self.dependencies.insert(name.clone(), range.clone());
        }
        for var in &additions.env_additions {
            if !self.env_additions.contains(var) {
                self.env_additions.push(var.clone());
            }
        }
        for (name, definition) in &additions.docker_compose_services {
            self.services.insert(name.clone(), definition.clone());
        }
    }

    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
    }

    /// Apply the aggregate to the project's structured targets.
    pub fn apply(&self, ctx: &EngineContext) -> anyhow::Result<()> {
        if !self.dependencies.is_empty() {
            merge_dependencies(&ctx.package_json_path(), &self.dependencies)?;
        }
        if !self.env_additions.is_empty() {
            merge_env_additions(&ctx.env_file_path(), &self.env_additions)?;
        }
        if !self.services.is_empty() {
            merge_services(&ctx.compose_path(), &self.services)?;
        }
        Ok(())
    }
}

/// Scan the skills root for a package whose manifest declares `skill_name`.
pub fn find_skill_dir(ctx: &EngineContext, skill_name: &str) -> Option<PathBuf> {
    let skills_root = ctx.skills_root();
    let entries = fs::read_dir(&skills_root).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() || !path.join("manifest.yaml").exists() {
            continue;
        }
        // Invalid manifests in neighbouring packages are not this skill's problem
        match read_manifest(&path) {
            Ok(manifest) if manifest.skill == skill_name => return Some(path),
            _ => continue,
        }
    }
    None
}

/// Replay `skills` (in order) from a clean base.
pub fn replay_skills(
    ctx: &EngineContext,
    skills: &[String],
    skill_dirs: &BTreeMap<String, PathBuf>,
) -> anyhow::Result<ReplayReport> {
    let mut report = ReplayReport::default();
    let remap = ctx.state_store().path_remap()?;

    // Collect every file any skill in the list touches
    let mut touched: BTreeSet<String> = BTreeSet::new();
    for skill_name in skills {
        let Some(skill_dir) = skill_dirs.get(skill_name) else {
            report.per_skill.insert(
                skill_name.clone(),
                SkillReplayOutcome {
                    success: false,
                    error: Some(format!("Skill directory not found for: {skill_name}")),
                },
            );
            report.error = Some(format!("Missing skill directory for: {skill_name}"));
            return Ok(report);
        };
        let manifest = read_manifest(skill_dir)?;
        touched.extend(manifest.adds.iter().cloned());
        touched.extend(manifest.modifies.iter().cloned());
    }

    reset_to_base(ctx, &touched, &remap)?;

    // Preload recorded resolutions; the last skill sits on top and is the
    // one whose merges can conflict
    let top_skill_dir = skills.last().and_then(|name| skill_dirs.get(name));
    load_resolutions(ctx, skills, top_skill_dir.map(PathBuf::as_path))?;

    let mut aggregate = StructuredAggregate::default();

    for skill_name in skills {
        let skill_dir = &skill_dirs[skill_name];
        let conflicts = replay_one(ctx, skill_name, skill_dir, &remap, &mut aggregate)?;
        if conflicts.is_empty() {
            report.per_skill.insert(
                skill_name.clone(),
                SkillReplayOutcome {
                    success: true,
                    error: None,
                },
            );
        } else {
            report.per_skill.insert(
                skill_name.clone(),
                SkillReplayOutcome {
                    success: false,
                    error: Some(format!("Merge conflicts: {}", conflicts.join(", "))),
                },
            );
            report.merge_conflicts.extend(conflicts);
            // Later skills would merge against conflict markers
            break;
        }
    }

    if !report.merge_conflicts.is_empty() {
        report.error = Some(format!(
            "Unresolved merge conflicts: {}",
            report.merge_conflicts.join(", ")
        ));
        return Ok(report);
    }

    aggregate.apply(ctx)?;
    if aggregate.has_dependencies()
        && let Err(err) = run_dependency_install(ctx.project_root())
    {
        warn!(error = %err, "dependency install failed after replay");
    }

    report.success = true;
    Ok(report)
}

/// Reset a set of touched files to their base copies (or delete add-only files).
pub fn reset_to_base(
    ctx: &EngineContext,
    touched: &BTreeSet<String>,
    remap: &PathRemap,
) -> anyhow::Result<()> {
    for rel_path in touched {
        let resolved = remap.resolve(rel_path);
        let current = ctx.project_root().join(resolved);
        let base = ctx.base_dir().join(resolved);
        if base.exists() {
            copy_file(&base, &current)?;
        } else if current.exists() {
            fs::remove_file(&current)
                .with_context(|| format!("Failed to remove added file: {}", current.display()))?;
        }
    }
    Ok(())
}

/// Replay a single skill; returns the paths left conflicted.
fn replay_one(
    ctx: &EngineContext,
    skill_name: &str,
    skill_dir: &Path,
    remap: &PathRemap,
    aggregate: &mut StructuredAggregate,
) -> anyhow::Result<Vec<String>> {
    debug!(skill = skill_name, "replaying skill");
    let manifest = read_manifest(skill_dir)?;

    if !manifest.file_ops.is_empty() {
        execute_file_ops(&manifest.file_ops, ctx.project_root())?;
    }

    for rel_path in &manifest.adds {
        let src = add_source(skill_dir, rel_path);
        if src.exists() {
            let dest = ctx.project_root().join(remap.resolve(rel_path));
            copy_file(&src, &dest)?;
        }
    }

    let mut conflicts = Vec::new();
    for rel_path in &manifest.modifies {
        let resolved = remap.resolve(rel_path).to_string();
        let current = ctx.project_root().join(&resolved);
        let base = ctx.base_dir().join(&resolved);
        let skill_path = modify_source(skill_dir, rel_path);

        if !skill_path.exists() {
            conflicts.push(rel_path.clone());
            continue;
        }
        if !current.exists() {
            copy_file(&skill_path, &current)?;
            continue;
        }
        if !base.exists() {
            // First touch of this file; the pre-skill content becomes base
            copy_file(&current, &base)?;
        }

        match merge_into_working(ctx.project_root(), &resolved, &current, &base, &skill_path)? {
            MergeDisposition::Clean | MergeDisposition::AutoResolved => {}
            MergeDisposition::Conflict => conflicts.push(resolved.clone()),
        }
    }

    if conflicts.is_empty()
        && let Some(structured) = &manifest.structured
    {
        aggregate.absorb(structured);
    }
    Ok(conflicts)
}
