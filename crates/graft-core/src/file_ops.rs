//! File operations (rename, move, delete) executed during apply and replay.
//!
//! Every path is resolved against the project root and rejected unless the
//! canonical form stays inside it; execution stops at the first failure.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use tracing::warn;

use crate::error::EngineError;
use crate::manifest::FileOperation;

/// Outcome of a file-operation batch.
#[derive(Debug, Default)]
pub struct FileOpsReport {
    pub executed: Vec<FileOperation>,
    pub warnings: Vec<String>,
}

/// Resolve a relative path inside the project root, refusing escapes.
///
/// The nearest existing ancestor is canonicalised so a symlink cannot smuggle
/// the resolved path outside the root.
pub fn resolve_inside(project_root: &Path, rel_path: &str) -> Result<PathBuf, EngineError> {
    let rel = Path::new(rel_path);
    if rel.is_absolute() || rel.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(EngineError::PathTraversal(rel_path.to_string()));
    }

    let root = project_root
        .canonicalize()
        .map_err(|_| EngineError::PathTraversal(rel_path.to_string()))?;
    let joined = root.join(rel);

    // Canonicalise the deepest existing ancestor; the target itself may not
    // exist yet (rename/move destinations).
    let mut probe = joined.as_path();
    let anchored = loop {
        if probe.exists() {
            break probe
                .canonicalize()
                .map_err(|_| EngineError::PathTraversal(rel_path.to_string()))?;
        }
        probe = match probe.parent() {
            Some(parent) => parent,
            None => return Err(EngineError::PathTraversal(rel_path.to_string())),
        };
    };
    if !anchored.starts_with(&root) {
        return Err(EngineError::PathTraversal(rel_path.to_string()));
    }

    Ok(joined)
}

/// Execute a batch of file operations within the project root.
pub fn execute_file_ops(
    ops: &[FileOperation],
    project_root: &Path,
) -> anyhow::Result<FileOpsReport> {
    let mut report = FileOpsReport::default();

    for op in ops {
        match op {
            FileOperation::Rename { from, to } | FileOperation::Move { from, to } => {
                let from_path = resolve_inside(project_root, from)?;
                let to_path = resolve_inside(project_root, to)?;
                if !from_path.exists() {
                    return Err(EngineError::invalid_input(format!(
                        "source does not exist: {from}"
                    ))
                    .into());
                }
                if to_path.exists() {
                    return Err(EngineError::invalid_input(format!(
                        "target already exists: {to}"
                    ))
                    .into());
                }
                if let Some(parent) = to_path.parent() {
                    fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create directory: {}", parent.display())
                    })?;
                }
                fs::rename(&from_path, &to_path)
                    .with_context(|| format!("Failed to move {from} to {to}"))?;
                report.executed.push(op.clone());
            }
            FileOperation::Delete { path } => {
                let del_path = resolve_inside(project_root, path)?;
                if !del_path.exists() {
                    let message = format!("delete: file does not exist (skipped): {path}");
                    warn!("{message}");
                    report.warnings.push(message);
                    report.executed.push(op.clone());
                    continue;
                }
                fs::remove_file(&del_path)
                    .with_context(|| format!("Failed to delete {path}"))?;
                report.executed.push(op.clone());
            }
        }
    }

    Ok(report)
}
