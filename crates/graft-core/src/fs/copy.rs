//! Directory copy and traversal helpers.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::Context;

/// Copy a single file, creating destination directories as needed.
pub fn copy_file(src: &Path, dest: &Path) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::copy(src, dest)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dest.display()))?;
    Ok(())
}

/// Recursively copy a directory tree from `src` into `dest`.
pub fn copy_dir(src: &Path, dest: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create directory: {}", dest.display()))?;

    let entries = fs::read_dir(src)
        .with_context(|| format!("Failed to read directory: {}", src.display()))?;
    for entry in entries {
        let entry = entry?;
        let dest_path = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &dest_path)?;
        } else {
            copy_file(&entry.path(), &dest_path)?;
        }
    }
    Ok(())
}

/// Recursively copy a directory tree, skipping entries whose name is in
/// `excludes` at any depth.
pub fn copy_dir_filtered(src: &Path, dest: &Path, excludes: &[&str]) -> anyhow::Result<()> {
    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create directory: {}", dest.display()))?;

    let entries = fs::read_dir(src)
        .with_context(|| format!("Failed to read directory: {}", src.display()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if excludes.iter().any(|e| name.to_string_lossy() == *e) {
            continue;
        }
        let dest_path = dest.join(&name);
        if entry.file_type()?.is_dir() {
            copy_dir_filtered(&entry.path(), &dest_path, excludes)?;
        } else {
            copy_file(&entry.path(), &dest_path)?;
        }
    }
    Ok(())
}

/// Walk a directory and return the relative (slash-separated) paths of every
/// file beneath it, in sorted order. A missing directory yields an empty set.
pub fn walk_files(dir: &Path) -> anyhow::Result<BTreeSet<String>> {
    let mut files = BTreeSet::new();
    if !dir.exists() {
        return Ok(files);
    }
    walk_into(dir, dir, &mut files)?;
    Ok(files)
}

fn walk_into(dir: &Path, root: &Path, out: &mut BTreeSet<String>) -> anyhow::Result<()> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            walk_into(&entry.path(), root, out)?;
        } else {
            let rel = entry
                .path()
                .strip_prefix(root)
                .expect("walked entries live under the walk root")
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            out.insert(rel);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create_dir_all should succeed in test temp dirs");
        }
        fs::write(path, content).expect("write should succeed in test temp dirs");
    }

    #[test]
    fn test_copy_dir_round_trip() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let src = tmp.path().join("src");
        write_file(&src.join("a.txt"), "a");
        write_file(&src.join("nested/b.txt"), "b");

        let dest = tmp.path().join("dest");
        copy_dir(&src, &dest).expect("copy_dir should succeed");

        assert_eq!(
            fs::read_to_string(dest.join("nested/b.txt")).expect("read should succeed"),
            "b"
        );
    }

    #[test]
    fn test_copy_dir_filtered_skips_excludes() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let src = tmp.path().join("src");
        write_file(&src.join("keep.txt"), "keep");
        write_file(&src.join("node_modules/dep/index.js"), "dep");
        write_file(&src.join("nested/node_modules/x.js"), "x");

        let dest = tmp.path().join("dest");
        copy_dir_filtered(&src, &dest, &["node_modules"]).expect("copy should succeed");

        assert!(dest.join("keep.txt").exists());
        assert!(!dest.join("node_modules").exists());
        assert!(!dest.join("nested/node_modules").exists());
    }

    #[test]
    fn test_walk_files_relative_sorted() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        write_file(&tmp.path().join("b.txt"), "b");
        write_file(&tmp.path().join("a/c.txt"), "c");

        let files = walk_files(tmp.path()).expect("walk should succeed");
        let listed: Vec<_> = files.iter().cloned().collect();
        assert_eq!(listed, vec!["a/c.txt".to_string(), "b.txt".to_string()]);
    }

    #[test]
    fn test_walk_missing_dir_is_empty() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let files = walk_files(&tmp.path().join("absent")).expect("walk should succeed");
        assert!(files.is_empty());
    }
}
