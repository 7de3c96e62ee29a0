//! Process-exclusive file lock for mutating operations.
//!
//! The lock is a file at `.g2/lock` holding the owner's pid and acquisition
//! timestamp. Acquisition is an atomic exclusive create; a holder is stale
//! when its timestamp is older than five minutes or its process is gone.
//! Release only removes the file when the recorded pid matches this process.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::context::EngineContext;
use crate::error::EngineError;

const STALE_TIMEOUT_SECS: i64 = 5 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    /// Unix epoch seconds of acquisition.
    timestamp: i64,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            timestamp: Utc::now().timestamp(),
        }
    }

    fn is_stale(&self) -> bool {
        Utc::now().timestamp() - self.timestamp > STALE_TIMEOUT_SECS
    }

    fn started_iso(&self) -> String {
        DateTime::<Utc>::from_timestamp(self.timestamp, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| self.timestamp.to_string())
    }
}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}

/// Exclusive lock over the engine's mutating operations.
///
/// Released on drop, so every exit path -- including panics -- lets the next
/// process in.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    pid: u32,
}

impl LockGuard {
    /// Acquire the engine lock, reclaiming stale or dead-process locks.
    pub fn acquire(ctx: &EngineContext) -> anyhow::Result<Self> {
        let path = ctx.lock_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let info = LockInfo::current();
        if try_create(&path, &info)? {
            return Ok(Self { path, pid: info.pid });
        }

        // Lock file exists; a live, fresh holder wins
        if let Some(existing) = read_lock(&path) {
            if !existing.is_stale() && is_process_alive(existing.pid) {
                return Err(EngineError::LockContention {
                    pid: existing.pid,
                    started: existing.started_iso(),
                }
                .into());
            }
            warn!(
                pid = existing.pid,
                started = %existing.started_iso(),
                "reclaiming stale lock"
            );
        }

        // Stale, dead, or unreadable -- remove and retry once
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to remove stale lock: {}", path.display()));
            }
        }

        if try_create(&path, &info)? {
            return Ok(Self { path, pid: info.pid });
        }
        Err(EngineError::LockContention {
            pid: read_lock(&path).map(|l| l.pid).unwrap_or_default(),
            started: "just now".to_string(),
        }
        .into())
    }

    /// Release the lock if it still belongs to this process.
    pub fn release(&self) {
        match read_lock(&self.path) {
            Some(info) if info.pid != self.pid => {}
            // Ours, corrupt, or already gone -- safe to remove
            _ => {
                let _ = fs::remove_file(&self.path);
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Check whether a valid (non-stale, live-process) lock is held.
pub fn is_locked(ctx: &EngineContext) -> bool {
    match read_lock(&ctx.lock_path()) {
        Some(info) => !info.is_stale() && is_process_alive(info.pid),
        None => false,
    }
}

fn try_create(path: &PathBuf, info: &LockInfo) -> anyhow::Result<bool> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            let payload =
                serde_json::to_vec(info).context("Failed to serialize lock info")?;
            file.write_all(&payload)
                .with_context(|| format!("Failed to write lock: {}", path.display()))?;
            Ok(true)
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => {
            Err(err).with_context(|| format!("Failed to create lock: {}", path.display()))
        }
    }
}

fn read_lock(path: &PathBuf) -> Option<LockInfo> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx_in(dir: &TempDir) -> EngineContext {
        EngineContext::new(dir.path().to_path_buf())
    }

    #[test]
    fn test_acquire_and_release() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let ctx = ctx_in(&tmp);

        let guard = LockGuard::acquire(&ctx).expect("acquire should succeed");
        assert!(ctx.lock_path().exists());
        assert!(is_locked(&ctx));

        drop(guard);
        assert!(!ctx.lock_path().exists());
        assert!(!is_locked(&ctx));
    }

    #[test]
    fn test_second_acquire_contends() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let ctx = ctx_in(&tmp);

        let _guard = LockGuard::acquire(&ctx).expect("acquire should succeed");
        let err = LockGuard::acquire(&ctx).expect_err("second acquire must contend");
        let engine_err = err
            .downcast_ref::<EngineError>()
            .expect("contention should be an EngineError");
        assert!(matches!(engine_err, EngineError::LockContention { .. }));
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let ctx = ctx_in(&tmp);
        fs::create_dir_all(ctx.engine_dir()).expect("mkdir should succeed");

        let stale = LockInfo {
            pid: std::process::id(),
            timestamp: Utc::now().timestamp() - STALE_TIMEOUT_SECS - 10,
        };
        fs::write(
            ctx.lock_path(),
            serde_json::to_vec(&stale).expect("serialize should succeed"),
        )
        .expect("write should succeed");

        assert!(!is_locked(&ctx));
        let _guard = LockGuard::acquire(&ctx).expect("stale lock should be reclaimed");
    }

    #[test]
    fn test_dead_pid_lock_is_reclaimed() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let ctx = ctx_in(&tmp);
        fs::create_dir_all(ctx.engine_dir()).expect("mkdir should succeed");

        // Fresh timestamp but a pid that cannot be alive
        let dead = LockInfo {
            pid: u32::MAX - 1,
            timestamp: Utc::now().timestamp(),
        };
        fs::write(
            ctx.lock_path(),
            serde_json::to_vec(&dead).expect("serialize should succeed"),
        )
        .expect("write should succeed");

        let _guard = LockGuard::acquire(&ctx).expect("dead-pid lock should be reclaimed");
    }

    #[test]
    fn test_release_keeps_foreign_lock() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let ctx = ctx_in(&tmp);
        fs::create_dir_all(ctx.engine_dir()).expect("mkdir should succeed");

        let guard = LockGuard::acquire(&ctx).expect("acquire should succeed");

        // Another process overwrote the lock after a reclaim race
        let foreign = LockInfo {
            pid: std::process::id().wrapping_add(1),
            timestamp: Utc::now().timestamp(),
        };
        fs::write(
            ctx.lock_path(),
            serde_json::to_vec(&foreign).expect("serialize should succeed"),
        )
        .expect("write should succeed");

        drop(guard);
        assert!(ctx.lock_path().exists(), "foreign lock must survive release");
    }

    #[test]
    fn test_corrupt_lock_is_reclaimed() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let ctx = ctx_in(&tmp);
        fs::create_dir_all(ctx.engine_dir()).expect("mkdir should succeed");
        fs::write(ctx.lock_path(), "not json").expect("write should succeed");

        assert!(!is_locked(&ctx));
        let _guard = LockGuard::acquire(&ctx).expect("corrupt lock should be reclaimed");
    }
}
