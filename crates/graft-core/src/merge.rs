//! Three-way file merge and the rerere adapter.
//!
//! Merging delegates to `git merge-file`; recurring-conflict resolution rides
//! on git's rerere ("reuse recorded resolution") substrate. The adapter seeds
//! an unmerged index with stages 1/2/3 for the conflicted path, satisfies
//! rerere's merge-in-progress preconditions, and afterwards resets only that
//! path's index entries so unrelated staged work survives. Without a git
//! repository, conflicts always surface to the caller.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::Context;
use tracing::debug;

use crate::error::EngineError;

const CONFLICT_MARKER: &[u8] = b"<<<<<<<";

/// Result of a three-way merge.
#[derive(Debug, Clone, Copy)]
pub struct MergeOutcome {
    /// True when the merge produced no conflicts.
    pub clean: bool,
    /// Number of conflicts left in the output.
    pub conflicts: u32,
}

/// How a merge-with-rerere attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDisposition {
    /// Merged without conflicts.
    Clean,
    /// Conflicted, but a recorded resolution applied.
    AutoResolved,
    /// Conflict markers remain in the working file.
    Conflict,
}

/// Three-way merge `(base, current, theirs)`, modifying `current` in place.
///
/// Exit code conventions follow `git merge-file`: zero is clean, a positive
/// code is the conflict count, anything else is a tool failure.
pub fn merge_file(current: &Path, base: &Path, theirs: &Path) -> anyhow::Result<MergeOutcome> {
    let output = Command::new("git")
        .arg("merge-file")
        .arg(current)
        .arg(base)
        .arg(theirs)
        .output()
        .context("Failed to invoke git merge-file")?;

    match output.status.code() {
        Some(0) => Ok(MergeOutcome {
            clean: true,
            conflicts: 0,
        }),
        Some(code) if code > 0 => Ok(MergeOutcome {
            clean: false,
            conflicts: code as u32,
        }),
        _ => Err(EngineError::Subprocess {
            command: format!("git merge-file {}", current.display()),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
        .into()),
    }
}

/// Discover the repository containing the project root, if any.
pub fn find_repo(project_root: &Path) -> Option<git2::Repository> {
    git2::Repository::discover(project_root).ok()
}

pub fn is_git_repo(project_root: &Path) -> bool {
    find_repo(project_root).is_some()
}

/// The `.git` directory for the project, absolute.
pub fn git_dir(project_root: &Path) -> Option<PathBuf> {
    find_repo(project_root).map(|repo| repo.path().to_path_buf())
}

/// Enable rerere in the repository's local configuration.
pub fn enable_rerere(project_root: &Path) -> anyhow::Result<()> {
    if let Some(repo) = find_repo(project_root) {
        repo.config()
            .and_then(|mut config| config.set_bool("rerere.enabled", true))
            .context("Failed to enable rerere in local git config")?;
    }
    Ok(())
}

/// Merge `theirs` into the working file against `base`, attempting rerere
/// auto-resolution on conflict.
///
/// On `Conflict`, the working file is left holding the conflict markers and
/// rerere has recorded the preimage for later resolution capture.
pub fn merge_into_working(
    project_root: &Path,
    rel_path: &str,
    working: &Path,
    base: &Path,
    theirs: &Path,
) -> anyhow::Result<MergeDisposition> {
    // Stage 2 ("ours") needs the pre-merge working content
    let ours = fs::read(working)
        .with_context(|| format!("Failed to read file for merge: {}", working.display()))?;

    // merge-file rewrites its first argument, so merge on a scratch copy
    let scratch = tempfile::Builder::new()
        .prefix("graft-merge-")
        .tempfile()
        .context("Failed to create merge scratch file")?;
    fs::copy(working, scratch.path())
        .with_context(|| format!("Failed to stage merge copy of {}", working.display()))?;

    let outcome = merge_file(scratch.path(), base, theirs)?;
    fs::copy(scratch.path(), working)
        .with_context(|| format!("Failed to write merge result: {}", working.display()))?;

    if outcome.clean {
        return Ok(MergeDisposition::Clean);
    }
    debug!(path = rel_path, conflicts = outcome.conflicts, "merge conflicted");

    let base_bytes = fs::read(base)
        .with_context(|| format!("Failed to read base for rerere: {}", base.display()))?;
    let theirs_bytes = fs::read(theirs)
        .with_context(|| format!("Failed to read incoming for rerere: {}", theirs.display()))?;

    if try_auto_resolve(project_root, rel_path, working, &base_bytes, &ours, &theirs_bytes)? {
        Ok(MergeDisposition::AutoResolved)
    } else {
        Ok(MergeDisposition::Conflict)
    }
}

/// Run the full rerere cycle for a conflicted path.
///
/// Records the preimage when the conflict is new; applies a recorded
/// resolution when one matches, then records the postimage and undoes the
/// staging it needed.
pub fn try_auto_resolve(
    project_root: &Path,
    rel_path: &str,
    working: &Path,
    base: &[u8],
    ours: &[u8],
    theirs: &[u8],
) -> anyhow::Result<bool> {
    let Some(dir) = git_dir(project_root) else {
        return Ok(false);
    };

    seed_unmerged_index(project_root, &dir, rel_path, base, ours, theirs)?;

    if !invoke_rerere(project_root, working) {
        cleanup_merge_state(project_root, Some(rel_path));
        return Ok(false);
    }

    // rerere rewrote the working file; record the postimage, then unstage.
    // The add is only there to let rerere see the resolved content.
    git_quiet(project_root, &["add", rel_path]);
    git_quiet(project_root, &["rerere"]);
    cleanup_merge_state(project_root, Some(rel_path));
    git_quiet(project_root, &["restore", "--staged", rel_path]);
    debug!(path = rel_path, "rerere auto-resolved conflict");
    Ok(true)
}

/// Seed index stages 1/2/3 and the merge markers rerere requires.
fn seed_unmerged_index(
    project_root: &Path,
    git_dir: &Path,
    rel_path: &str,
    base: &[u8],
    ours: &[u8],
    theirs: &[u8],
) -> anyhow::Result<()> {
    // A stale MERGE_HEAD from a crashed run would confuse rerere
    if git_dir.join("MERGE_HEAD").exists() {
        cleanup_merge_state(project_root, Some(rel_path));
    }

    let base_oid = hash_object(project_root, base)?;
    let ours_oid = hash_object(project_root, ours)?;
    let theirs_oid = hash_object(project_root, theirs)?;

    let index_info = format!(
        "100644 {base_oid} 1\t{rel_path}\n100644 {ours_oid} 2\t{rel_path}\n100644 {theirs_oid} 3\t{rel_path}\n"
    );
    git_with_stdin(project_root, &["update-index", "--index-info"], index_info.as_bytes())
        .context("Failed to seed unmerged index for rerere")?;

    let head = git_stdout(project_root, &["rev-parse", "HEAD"])
        .context("Failed to resolve HEAD for rerere merge state")?;
    fs::write(git_dir.join("MERGE_HEAD"), format!("{head}\n"))
        .context("Failed to write MERGE_HEAD")?;
    fs::write(git_dir.join("MERGE_MSG"), format!("Skill merge: {rel_path}\n"))
        .context("Failed to write MERGE_MSG")?;
    Ok(())
}

/// Invoke rerere and report whether the working file came out conflict-free.
///
/// rerere resolves the working tree but leaves the index unmerged, so the
/// file content -- not the index -- is the signal.
fn invoke_rerere(project_root: &Path, working: &Path) -> bool {
    let status = Command::new("git")
        .arg("rerere")
        .current_dir(project_root)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if !matches!(status, Ok(s) if s.success()) {
        return false;
    }
    match fs::read(working) {
        Ok(content) => !contains_conflict_markers(&content),
        Err(_) => false,
    }
}

/// Remove merge markers and reset only the affected path's index entries,
/// preserving any unrelated staging.
pub fn cleanup_merge_state(project_root: &Path, rel_path: Option<&str>) {
    let Some(dir) = git_dir(project_root) else {
        return;
    };
    for marker in ["MERGE_HEAD", "MERGE_MSG"] {
        let path = dir.join(marker);
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }
    match rel_path {
        Some(rel) => git_quiet(project_root, &["reset", "--", rel]),
        None => git_quiet(project_root, &["reset"]),
    }
}

/// Whether a blob still carries conflict markers.
pub fn contains_conflict_markers(content: &[u8]) -> bool {
    content
        .windows(CONFLICT_MARKER.len())
        .any(|window| window == CONFLICT_MARKER)
}

fn hash_object(project_root: &Path, content: &[u8]) -> anyhow::Result<String> {
    let mut child = Command::new("git")
        .args(["hash-object", "-w", "--stdin"])
        .current_dir(project_root)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("Failed to invoke git hash-object")?;
    child
        .stdin
        .take()
        .expect("stdin was requested as piped")
        .write_all(content)
        .context("Failed to stream blob to git hash-object")?;
    let output = child
        .wait_with_output()
        .context("Failed to collect git hash-object output")?;
    if !output.status.success() {
        anyhow::bail!("git hash-object failed");
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn git_with_stdin(project_root: &Path, args: &[&str], input: &[u8]) -> anyhow::Result<()> {
    let mut child = Command::new("git")
        .args(args)
        .current_dir(project_root)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to invoke git {}", args.join(" ")))?;
    child
        .stdin
        .take()
        .expect("stdin was requested as piped")
        .write_all(input)
        .with_context(|| format!("Failed to stream input to git {}", args.join(" ")))?;
    let output = child.wait_with_output()?;
    if !output.status.success() {
        anyhow::bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

fn git_stdout(project_root: &Path, args: &[&str]) -> anyhow::Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(project_root)
        .output()
        .with_context(|| format!("Failed to invoke git {}", args.join(" ")))?;
    if !output.status.success() {
        anyhow::bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Best-effort git invocation for steps that may legitimately fail
/// (nothing staged, path untracked).
fn git_quiet(project_root: &Path, args: &[&str]) {
    let _ = Command::new("git")
        .args(args)
        .current_dir(project_root)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}
