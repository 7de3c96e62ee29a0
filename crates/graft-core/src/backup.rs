//! Tombstone-aware backup and restore across a fallible operation.
//!
//! `create_backup` copies each existing file into `.g2/backup/` mirroring the
//! project layout; a path that does not exist yet gets a zero-byte
//! `.tombstone` sentinel so restore knows to delete it (undoing an add).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::context::EngineContext;
use crate::fs::copy_file;

const TOMBSTONE_SUFFIX: &str = ".tombstone";

/// Back up a list of project-absolute file paths.
pub fn create_backup(ctx: &EngineContext, paths: &[PathBuf]) -> anyhow::Result<()> {
    let backup_dir = ctx.backup_dir();
    fs::create_dir_all(&backup_dir)
        .with_context(|| format!("Failed to create directory: {}", backup_dir.display()))?;

    for path in paths {
        let rel = path.strip_prefix(ctx.project_root()).with_context(|| {
            format!("Backup path outside project root: {}", path.display())
        })?;
        let backup_path = backup_dir.join(rel);
        if let Some(parent) = backup_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        if path.exists() {
            copy_file(path, &backup_path)?;
        } else {
            let tombstone = tombstone_path(&backup_path);
            fs::write(&tombstone, b"").with_context(|| {
                format!("Failed to write tombstone: {}", tombstone.display())
            })?;
        }
    }
    Ok(())
}

/// Restore every backed-up file; tombstones delete the working-tree file.
pub fn restore_backup(ctx: &EngineContext) -> anyhow::Result<()> {
    let backup_dir = ctx.backup_dir();
    if !backup_dir.exists() {
        return Ok(());
    }
    restore_walk(&backup_dir, &backup_dir, ctx.project_root())
}

fn restore_walk(dir: &Path, backup_root: &Path, project_root: &Path) -> anyhow::Result<()> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            restore_walk(&path, backup_root, project_root)?;
            continue;
        }

        let rel = path
            .strip_prefix(backup_root)
            .expect("walked entries live under the backup root");
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(original_name) = name.strip_suffix(TOMBSTONE_SUFFIX) {
            let original = project_root
                .join(rel.parent().unwrap_or(Path::new("")))
                .join(original_name);
            if original.exists() {
                fs::remove_file(&original).with_context(|| {
                    format!("Failed to delete added file: {}", original.display())
                })?;
            }
        } else {
            copy_file(&path, &project_root.join(rel))?;
        }
    }
    Ok(())
}

/// Remove the backup tree entirely.
pub fn clear_backup(ctx: &EngineContext) -> anyhow::Result<()> {
    let backup_dir = ctx.backup_dir();
    if backup_dir.exists() {
        fs::remove_dir_all(&backup_dir)
            .with_context(|| format!("Failed to clear backup: {}", backup_dir.display()))?;
    }
    Ok(())
}

/// Whether a backup is currently on disk (an operation is mid-flight or
/// awaiting manual conflict resolution).
pub fn backup_pending(ctx: &EngineContext) -> bool {
    ctx.backup_dir().exists()
}

fn tombstone_path(backup_path: &Path) -> PathBuf {
    let mut name = backup_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(TOMBSTONE_SUFFIX);
    backup_path.with_file_name(name)
}
