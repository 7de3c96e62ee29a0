//! Shared fixtures for engine integration tests.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use graft_core::commands::InitCommand;
use graft_core::context::EngineContext;
use graft_core::state::SkillState;

/// A disposable project with a core source tree and an initialized engine.
pub struct TestProject {
    // Held for its Drop; the tempdir outlives every path handed out
    _temp: TempDir,
    root: PathBuf,
}

impl TestProject {
    /// Create a project with a small core tree and run init.
    pub fn new() -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let root = temp.path().join("project");
        fs::create_dir_all(root.join("src")).expect("Failed to create src dir");

        write(
            &root.join("package.json"),
            "{\n  \"name\": \"core\",\n  \"version\": \"1.2.0\",\n  \"dependencies\": {}\n}\n",
        );
        write(&root.join(".env.example"), "API_URL=http://localhost\n");
        write(&root.join("src/config.ts"), "export const config = {};\n");

        let project = Self { _temp: temp, root };
        InitCommand::new(&project.ctx())
            .execute()
            .expect("init should succeed");
        project
    }

    /// Create a project inside a committed git repository, for rerere paths.
    pub fn new_with_git() -> Self {
        let project = Self::new();
        run_git(&project.root, &["init"]);
        run_git(&project.root, &["checkout", "-b", "main"]);
        run_git(&project.root, &["config", "user.email", "test@example.com"]);
        run_git(&project.root, &["config", "user.name", "Test User"]);
        run_git(&project.root, &["config", "commit.gpgsign", "false"]);
        run_git(&project.root, &["config", "rerere.enabled", "true"]);
        run_git(&project.root, &["add", "."]);
        run_git(&project.root, &["commit", "-m", "init"]);
        project
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ctx(&self) -> EngineContext {
        EngineContext::new(self.root.clone())
    }

    pub fn state(&self) -> SkillState {
        self.ctx().state_store().load().expect("state should load")
    }

    pub fn write_file(&self, rel: &str, content: &str) {
        write(&self.root.join(rel), content);
    }

    pub fn read_file(&self, rel: &str) -> String {
        fs::read_to_string(self.root.join(rel))
            .unwrap_or_else(|err| panic!("Failed to read {rel}: {err}"))
    }

    pub fn file_exists(&self, rel: &str) -> bool {
        self.root.join(rel).exists()
    }

    /// Refresh the base copy of a file to match new content.
    pub fn write_base_file(&self, rel: &str, content: &str) {
        write(&self.ctx().base_dir().join(rel), content);
    }

    /// Lay down a skill package under .claude/skills/<name>/.
    pub fn install_skill_package(&self, name: &str, skill: &SkillFixture) -> PathBuf {
        let dir = self.root.join(".claude/skills").join(name);
        skill.write_to(&dir);
        dir
    }
}

/// Builder for a skill package on disk.
pub struct SkillFixture {
    pub manifest: String,
    pub adds: Vec<(String, String)>,
    pub modifies: Vec<(String, String)>,
}

impl SkillFixture {
    pub fn new(manifest: &str) -> Self {
        Self {
            manifest: manifest.to_string(),
            adds: Vec::new(),
            modifies: Vec::new(),
        }
    }

    pub fn with_add(mut self, rel: &str, content: &str) -> Self {
        self.adds.push((rel.to_string(), content.to_string()));
        self
    }

    pub fn with_modify(mut self, rel: &str, content: &str) -> Self {
        self.modifies.push((rel.to_string(), content.to_string()));
        self
    }

    pub fn write_to(&self, dir: &Path) {
        write(&dir.join("manifest.yaml"), &self.manifest);
        for (rel, content) in &self.adds {
            write(&dir.join("add").join(rel), content);
        }
        for (rel, content) in &self.modifies {
            write(&dir.join("modify").join(rel), content);
        }
    }
}

pub fn write(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent dirs");
    }
    fs::write(path, content).unwrap_or_else(|err| panic!("Failed to write {}: {err}", path.display()));
}

pub fn run_git(repo: &Path, args: &[&str]) {
    let status = std::process::Command::new("git")
        .args(args)
        .current_dir(repo)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .expect("Failed to invoke git");
    assert!(status.success(), "git command failed: {:?}", args);
}

/// Manifest YAML for a skill that modifies `src/config.ts` and adds one file.
pub fn basic_manifest(name: &str) -> String {
    format!(
        "skill: {name}\nversion: 1.0.0\ncore_version: 1.2.0\nadds:\n  - src/{name}.ts\nmodifies:\n  - src/config.ts\n"
    )
}
