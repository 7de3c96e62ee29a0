//! Initialize the engine directory and migrate existing projects.

use std::fs;
use std::path::Path;

use anyhow::Context;
use tracing::info;

use crate::ENGINE_SCHEMA_VERSION;
use crate::context::EngineContext;
use crate::diff::unified_file_diff;
use crate::fs::{copy_dir_filtered, copy_file, walk_files};
use crate::merge::enable_rerere;
use crate::state::SkillState;

/// Project subtrees snapshotted into the base.
const BASE_INCLUDES: &[&str] = &["src", "package.json", ".env.example", "container"];

/// Build outputs and engine internals never snapshotted.
const BASE_EXCLUDES: &[&str] = &[
    "node_modules",
    ".g2",
    ".git",
    "dist",
    "data",
    "groups",
    "store",
    "logs",
];

/// Report of a migration.
#[derive(Debug, Default)]
pub struct MigrateReport {
    /// True when pre-existing modifications were captured as a patch.
    pub patch_recorded: bool,
    pub patch_file: Option<String>,
}

/// Creates the `.g2/` skeleton: base snapshot, initial ledger, rerere config.
#[derive(Debug)]
pub struct InitCommand<'a> {
    ctx: &'a EngineContext,
}

impl<'a> InitCommand<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = self.ctx;
        fs::create_dir_all(ctx.engine_dir()).with_context(|| {
            format!("Failed to create directory: {}", ctx.engine_dir().display())
        })?;

        // A stale base from a previous init would poison every merge
        let base_dir = ctx.base_dir();
        if base_dir.exists() {
            fs::remove_dir_all(&base_dir)
                .with_context(|| format!("Failed to clear base: {}", base_dir.display()))?;
        }
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("Failed to create directory: {}", base_dir.display()))?;

        for include in BASE_INCLUDES {
            let src = ctx.project_root().join(include);
            if !src.exists() {
                continue;
            }
            let dest = base_dir.join(include);
            if src.is_dir() {
                copy_dir_filtered(&src, &dest, BASE_EXCLUDES)?;
            } else {
                copy_file(&src, &dest)?;
            }
        }

        let state = SkillState::new(
            ENGINE_SCHEMA_VERSION.to_string(),
            read_core_version(ctx.project_root()),
        );
        ctx.state_store().save(&state)?;

        // Auto-resolution of recurring conflicts rides on rerere
        enable_rerere(ctx.project_root())?;

        info!("skills system initialized");
        Ok(())
    }

    /// Init, then capture any base-to-working-tree divergence as a
    /// migration patch recorded as a custom modification.
    pub fn migrate(&self) -> anyhow::Result<MigrateReport> {
        let ctx = self.ctx;
        self.execute()?;

        let base_src = ctx.base_dir().join("src");
        let src = ctx.project_root().join("src");

        let mut rel_paths = walk_files(&base_src)?;
        for rel in walk_files(&src)? {
            if !is_excluded(&rel) {
                rel_paths.insert(rel);
            }
        }

        let mut combined_patch = String::new();
        let mut files_modified: Vec<String> = Vec::new();
        for rel in &rel_paths {
            let project_rel = format!("src/{rel}");
            if let Some(patch) =
                unified_file_diff(&base_src.join(rel), &src.join(rel), &project_rel)?
            {
                combined_patch.push_str(&patch);
                files_modified.push(project_rel);
            }
        }

        if combined_patch.trim().is_empty() {
            info!("no custom modifications detected");
            return Ok(MigrateReport::default());
        }

        fs::create_dir_all(ctx.custom_dir()).with_context(|| {
            format!("Failed to create directory: {}", ctx.custom_dir().display())
        })?;
        let patch_rel_path = ".g2/custom/migration.patch".to_string();
        fs::write(ctx.custom_dir().join("migration.patch"), &combined_patch)
            .context("Failed to write migration patch")?;

        ctx.state_store().record_custom_modification(
            "Pre-skills migration",
            files_modified,
            &patch_rel_path,
        )?;

        info!(patch = %patch_rel_path, "custom modifications captured");
        Ok(MigrateReport {
            patch_recorded: true,
            patch_file: Some(patch_rel_path),
        })
    }
}

fn is_excluded(rel_path: &str) -> bool {
    rel_path
        .split('/')
        .any(|component| BASE_EXCLUDES.contains(&component))
}

/// Read the core version from the project's package.json, defaulting on absence.
fn read_core_version(project_root: &Path) -> String {
    fs::read_to_string(project_root.join("package.json"))
        .ok()
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
        .and_then(|pkg| pkg.get("version").and_then(|v| v.as_str()).map(String::from))
        .unwrap_or_else(|| "0.0.0".to_string())
}
