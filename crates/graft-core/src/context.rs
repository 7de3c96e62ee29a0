//! Engine context owning the project root and the `.g2/` layout.

use std::path::{Path, PathBuf};

use crate::state::StateStore;

/// Directory holding all engine state inside the project.
pub const ENGINE_DIR: &str = ".g2";

/// Directory holding installable skill packages.
pub const SKILLS_ROOT: &str = ".claude/skills";

/// Maintainer-shipped resolution cache, preferred over the project cache.
pub const SHIPPED_RESOLUTIONS: &str = ".claude/resolutions";

/// Unified engine context.
///
/// Owns the project root and derives every path the engine reads or writes.
/// Frontends create this once and pass it to commands.
#[derive(Debug, Clone)]
pub struct EngineContext {
    project_root: PathBuf,
}

impl EngineContext {
    /// Create a context rooted at the given project directory.
    pub fn new(project_root: PathBuf) -> Self {
        Self { project_root }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn engine_dir(&self) -> PathBuf {
        self.project_root.join(ENGINE_DIR)
    }

    pub fn state_path(&self) -> PathBuf {
        self.engine_dir().join("state.yaml")
    }

    /// Pristine snapshot of the core code base.
    pub fn base_dir(&self) -> PathBuf {
        self.engine_dir().join("base")
    }

    /// Transient rollback snapshot; exists only across a fallible operation.
    pub fn backup_dir(&self) -> PathBuf {
        self.engine_dir().join("backup")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.engine_dir().join("lock")
    }

    /// User-authored patches plus the active-session marker.
    pub fn custom_dir(&self) -> PathBuf {
        self.engine_dir().join("custom")
    }

    pub fn pending_customize_path(&self) -> PathBuf {
        self.custom_dir().join("pending.yaml")
    }

    /// Project-local resolution cache.
    pub fn resolutions_dir(&self) -> PathBuf {
        self.engine_dir().join("resolutions")
    }

    /// Maintainer-shipped resolution cache.
    pub fn shipped_resolutions_dir(&self) -> PathBuf {
        self.project_root.join(SHIPPED_RESOLUTIONS)
    }

    /// Archival diff written by the last rebase.
    pub fn combined_patch_path(&self) -> PathBuf {
        self.engine_dir().join("combined.patch")
    }

    /// Root of installable skill packages.
    pub fn skills_root(&self) -> PathBuf {
        self.project_root.join(SKILLS_ROOT)
    }

    /// Dependency table rewritten by structured merges.
    pub fn package_json_path(&self) -> PathBuf {
        self.project_root.join("package.json")
    }

    pub fn package_lock_path(&self) -> PathBuf {
        self.project_root.join("package-lock.json")
    }

    /// Env-var declaration file rewritten by structured merges.
    pub fn env_file_path(&self) -> PathBuf {
        self.project_root.join(".env.example")
    }

    /// Container-service manifest rewritten by structured merges.
    pub fn compose_path(&self) -> PathBuf {
        self.project_root.join("docker-compose.yml")
    }

    /// Get a StateStore for this project.
    pub fn state_store(&self) -> StateStore {
        StateStore::new(self.state_path())
    }
}
