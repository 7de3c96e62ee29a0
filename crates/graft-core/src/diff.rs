//! Unified-diff generation for custom patches and archival records.
//!
//! Patches carry project-relative `a/` and `b/` headers so they re-apply
//! with `git apply --3way` from the project root.

use std::fs;
use std::path::Path;

use anyhow::Context;
use similar::TextDiff;

/// Produce a unified diff between two on-disk files, either of which may be
/// absent (treated as empty with a `/dev/null` header).
///
/// Returns `None` when the contents are identical.
pub fn unified_file_diff(
    old_path: &Path,
    new_path: &Path,
    rel_path: &str,
) -> anyhow::Result<Option<String>> {
    let old = read_or_empty(old_path)?;
    let new = read_or_empty(new_path)?;
    Ok(unified_diff(&old, &new, rel_path, old_path.exists(), new_path.exists()))
}

/// Produce a unified diff between two strings with `a/<rel>` / `b/<rel>`
/// headers. Returns `None` when identical.
pub fn unified_diff(
    old: &str,
    new: &str,
    rel_path: &str,
    old_exists: bool,
    new_exists: bool,
) -> Option<String> {
    if old == new {
        return None;
    }
    let old_header = if old_exists {
        format!("a/{rel_path}")
    } else {
        "/dev/null".to_string()
    };
    let new_header = if new_exists {
        format!("b/{rel_path}")
    } else {
        "/dev/null".to_string()
    };

    let diff = TextDiff::from_lines(old, new);
    let patch = diff
        .unified_diff()
        .context_radius(3)
        .header(&old_header, &new_header)
        .to_string();
    Some(patch)
}

/// Re-apply a recorded patch with three-way fallback.
pub fn apply_patch_3way(project_root: &Path, patch_path: &Path) -> anyhow::Result<()> {
    let output = std::process::Command::new("git")
        .arg("apply")
        .arg("--3way")
        .arg(patch_path)
        .current_dir(project_root)
        .output()
        .with_context(|| format!("Failed to invoke git apply for {}", patch_path.display()))?;
    if !output.status.success() {
        anyhow::bail!(
            "git apply --3way failed for {}: {}",
            patch_path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

fn read_or_empty(path: &Path) -> anyhow::Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    fs::read_to_string(path)
        .with_context(|| format!("Failed to read file for diff: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_identical_yields_none() {
        assert!(unified_diff("same\n", "same\n", "a.txt", true, true).is_none());
    }

    #[test]
    fn test_diff_headers_are_relative() {
        let patch = unified_diff("one\n", "one\ntwo\n", "src/app.ts", true, true)
            .expect("different contents should diff");
        assert!(patch.contains("--- a/src/app.ts"));
        assert!(patch.contains("+++ b/src/app.ts"));
        assert!(patch.contains("+two"));
    }

    #[test]
    fn test_created_file_uses_dev_null() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let old = tmp.path().join("missing");
        let new = tmp.path().join("new.txt");
        fs::write(&new, "fresh\n").expect("write should succeed");

        let patch = unified_file_diff(&old, &new, "new.txt")
            .expect("diff should succeed")
            .expect("creation should produce a patch");
        assert!(patch.contains("--- /dev/null"));
        assert!(patch.contains("+++ b/new.txt"));
    }

    #[test]
    fn test_deleted_file_uses_dev_null() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let old = tmp.path().join("old.txt");
        fs::write(&old, "bye\n").expect("write should succeed");
        let new = tmp.path().join("missing");

        let patch = unified_file_diff(&old, &new, "old.txt")
            .expect("diff should succeed")
            .expect("deletion should produce a patch");
        assert!(patch.contains("--- a/old.txt"));
        assert!(patch.contains("+++ /dev/null"));
        assert!(patch.contains("-bye"));
    }
}
