//! Env-var declaration merging.
//!
//! The env file is newline-delimited `NAME=value`; comment and blank lines
//! are preserved verbatim. Names already declared are skipped silently, new
//! names are appended under a `# Added by skill` header.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::Context;
use regex::Regex;

fn var_declaration() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)=").expect("declaration regex is valid")
    })
}

/// Append missing variable declarations to the env file.
pub fn merge_env_additions(env_path: &Path, additions: &[String]) -> anyhow::Result<()> {
    let mut content = if env_path.exists() {
        fs::read_to_string(env_path)
            .with_context(|| format!("Failed to read {}", env_path.display()))?
    } else {
        String::new()
    };

    let mut declared: BTreeSet<&str> = BTreeSet::new();
    for line in content.lines() {
        if let Some(captures) = var_declaration().captures(line) {
            declared.insert(captures.get(1).expect("group 1 always matches").as_str());
        }
    }

    let mut new_vars: Vec<&str> = Vec::new();
    for var in additions {
        if !declared.contains(var.as_str()) && !new_vars.contains(&var.as_str()) {
            new_vars.push(var);
        }
    }
    if new_vars.is_empty() {
        return Ok(());
    }

    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str("\n# Added by skill\n");
    for var in new_vars {
        content.push_str(var);
        content.push_str("=\n");
    }

    fs::write(env_path, content)
        .with_context(|| format!("Failed to write {}", env_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env_file(dir: &TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(".env.example");
        fs::write(&path, content).expect("write should succeed");
        path
    }

    fn vars(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_appends_under_header() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let path = env_file(&tmp, "# existing config\nAPI_URL=http://localhost\n");

        merge_env_additions(&path, &vars(&["TELEGRAM_TOKEN"])).expect("merge should succeed");

        let content = fs::read_to_string(&path).expect("read should succeed");
        assert!(content.starts_with("# existing config\nAPI_URL=http://localhost\n"));
        assert!(content.contains("# Added by skill\nTELEGRAM_TOKEN=\n"));
    }

    #[test]
    fn test_already_declared_is_idempotent() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let original = "X=1\nY=2\n";
        let path = env_file(&tmp, original);

        merge_env_additions(&path, &vars(&["X"])).expect("merge should succeed");
        assert_eq!(
            fs::read_to_string(&path).expect("read should succeed"),
            original
        );
    }

    #[test]
    fn test_missing_file_is_created() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let path = tmp.path().join(".env.example");

        merge_env_additions(&path, &vars(&["NEW_VAR"])).expect("merge should succeed");
        let content = fs::read_to_string(&path).expect("read should succeed");
        assert!(content.contains("NEW_VAR=\n"));
    }

    #[test]
    fn test_comment_mentions_do_not_count_as_declared() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let path = env_file(&tmp, "# TOKEN=placeholder docs\n");

        merge_env_additions(&path, &vars(&["TOKEN"])).expect("merge should succeed");
        let content = fs::read_to_string(&path).expect("read should succeed");
        assert!(content.contains("TOKEN=\n"));
    }
}
