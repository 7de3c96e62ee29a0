//! Customize sessions: capture user edits to skill-managed files as patches.

use std::collections::BTreeMap;
use std::fs;

use anyhow::Context;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::EngineContext;
use crate::diff::unified_file_diff;
use crate::error::EngineError;
use crate::fs::sha256_file;

/// Marker for an in-flight customize session.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingCustomize {
    description: String,
    started_at: String,
    /// Snapshot of every applied skill's file hashes at session start.
    file_hashes: BTreeMap<String, String>,
}

/// Outcome of committing a customize session.
#[derive(Debug, Default)]
pub struct CustomizeCommit {
    /// False when no tracked file changed and nothing was recorded.
    pub committed: bool,
    pub patch_file: Option<String>,
    pub files_modified: Vec<String>,
}

/// Session-scoped patch capture over skill-managed files.
#[derive(Debug)]
pub struct CustomizeSession<'a> {
    ctx: &'a EngineContext,
}

impl<'a> CustomizeSession<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    pub fn is_active(&self) -> bool {
        self.ctx.pending_customize_path().exists()
    }

    /// Start a session, snapshotting the hashes of every skill-managed file.
    pub fn start(&self, description: &str) -> anyhow::Result<()> {
        if self.is_active() {
            return Err(EngineError::precondition(
                "A customize session is already active. Commit or abort it first.",
            )
            .into());
        }
        let state = self.ctx.state_store().load()?;

        let mut file_hashes = BTreeMap::new();
        for skill in &state.applied_skills {
            for (rel_path, hash) in &skill.file_hashes {
                file_hashes.insert(rel_path.clone(), hash.clone());
            }
        }

        let pending = PendingCustomize {
            description: description.to_string(),
            started_at: Utc::now().to_rfc3339(),
            file_hashes,
        };

        fs::create_dir_all(self.ctx.custom_dir()).with_context(|| {
            format!("Failed to create directory: {}", self.ctx.custom_dir().display())
        })?;
        let yaml = serde_yaml::to_string(&pending).context("Failed to serialize session")?;
        fs::write(self.ctx.pending_customize_path(), yaml)
            .context("Failed to write pending customize session")?;
        info!(description, "customize session started");
        Ok(())
    }

    /// Commit the session: diff changed files against base and record the
    /// combined patch as a custom modification.
    pub fn commit(&self) -> anyhow::Result<CustomizeCommit> {
        let pending_path = self.ctx.pending_customize_path();
        if !pending_path.exists() {
            return Err(EngineError::precondition(
                "No active customize session. Start one first.",
            )
            .into());
        }
        let pending: PendingCustomize = serde_yaml::from_str(
            &fs::read_to_string(&pending_path)
                .context("Failed to read pending customize session")?,
        )
        .context("Failed to parse pending customize session")?;

        // A missing file counts as changed (deletion)
        let mut changed: Vec<String> = Vec::new();
        for (rel_path, recorded_hash) in &pending.file_hashes {
            let full_path = self.ctx.project_root().join(rel_path);
            if !full_path.exists() || sha256_file(&full_path)? != *recorded_hash {
                changed.push(rel_path.clone());
            }
        }

        if changed.is_empty() {
            info!("no files changed during customize session, nothing to commit");
            fs::remove_file(&pending_path).context("Failed to remove session marker")?;
            return Ok(CustomizeCommit::default());
        }

        let mut combined_patch = String::new();
        for rel_path in &changed {
            let base_path = self.ctx.base_dir().join(rel_path);
            let current_path = self.ctx.project_root().join(rel_path);
            if let Some(patch) = unified_file_diff(&base_path, &current_path, rel_path)? {
                combined_patch.push_str(&patch);
            }
        }

        if combined_patch.trim().is_empty() {
            info!("diff was empty despite hash changes, nothing to commit");
            fs::remove_file(&pending_path).context("Failed to remove session marker")?;
            return Ok(CustomizeCommit::default());
        }

        let store = self.ctx.state_store();
        let state = store.load()?;
        let sequence = state.custom_mods().len() + 1;
        let slug = slugify(&pending.description);
        let patch_filename = format!("{sequence:03}-{slug}.patch");
        let patch_rel_path = format!(".g2/custom/{patch_filename}");

        let patch_full_path = self.ctx.custom_dir().join(&patch_filename);
        fs::write(&patch_full_path, &combined_patch)
            .with_context(|| format!("Failed to write patch: {}", patch_full_path.display()))?;

        store.record_custom_modification(&pending.description, changed.clone(), &patch_rel_path)?;
        fs::remove_file(&pending_path).context("Failed to remove session marker")?;

        info!(patch = %patch_rel_path, files = changed.len(), "customize session committed");
        Ok(CustomizeCommit {
            committed: true,
            patch_file: Some(patch_rel_path),
            files_modified: changed,
        })
    }

    /// Abort the session, discarding the pending marker.
    pub fn abort(&self) -> anyhow::Result<()> {
        let pending_path = self.ctx.pending_customize_path();
        if pending_path.exists() {
            fs::remove_file(&pending_path).context("Failed to remove session marker")?;
        }
        Ok(())
    }
}

/// Lowercase, collapse everything non-alphanumeric into single dashes.
fn slugify(description: &str) -> String {
    let collapse = Regex::new(r"[^a-z0-9]+").expect("slug regex is valid");
    collapse
        .replace_all(&description.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}
