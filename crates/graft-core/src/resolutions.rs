//! Content-addressed cache of conflict resolutions.
//!
//! Each entry is keyed by the set of skills in play (sorted, `+`-joined) and
//! holds preimage/resolution blob pairs verified by the SHA-256 of the live
//! base/current/skill inputs. Loading materialises pairs into git's
//! `rr-cache` so rerere can replay them; saving captures the rerere hash of
//! each recorded preimage into a sidecar so later loads can key the cache
//! without re-running a merge.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::fs::sha256_file;
use crate::manifest::modify_source;
use crate::merge::git_dir;

const PREIMAGE_SUFFIX: &str = ".preimage";
const RESOLUTION_SUFFIX: &str = ".resolution";
const HASH_SIDECAR_SUFFIX: &str = ".preimage.hash";

/// Who produced a recorded resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionSource {
    Maintainer,
    User,
    Assistant,
}

/// SHA-256 triple of the inputs a resolution was recorded against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInputHashes {
    pub base: String,
    pub current: String,
    pub skill: String,
}

/// `meta.yaml` accompanying a resolution entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionMeta {
    pub skills: Vec<String>,
    pub apply_order: Vec<String>,
    pub core_version: String,
    pub resolved_at: String,
    pub tested: bool,
    pub test_passed: bool,
    pub resolution_source: ResolutionSource,
    #[serde(default)]
    pub input_hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub output_hash: String,
    pub file_hashes: BTreeMap<String, FileInputHashes>,
}

/// One resolved file handed to [`save_resolutions`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionFile {
    pub rel_path: String,
    pub preimage: String,
    pub resolution: String,
    pub input_hashes: FileInputHashes,
}

/// Caller-supplied metadata for [`save_resolutions`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionMetaInput {
    #[serde(default)]
    pub apply_order: Option<Vec<String>>,
    #[serde(default)]
    pub core_version: String,
    #[serde(default)]
    pub tested: bool,
    #[serde(default)]
    pub test_passed: bool,
    #[serde(default = "default_resolution_source")]
    pub resolution_source: ResolutionSource,
}

fn default_resolution_source() -> ResolutionSource {
    ResolutionSource::User
}

impl Default for ResolutionMetaInput {
    fn default() -> Self {
        Self {
            apply_order: None,
            core_version: String::new(),
            tested: false,
            test_passed: false,
            resolution_source: ResolutionSource::User,
        }
    }
}

/// Canonical cache key: alphabetically sorted skill names joined with `+`.
pub fn resolution_key(skills: &[String]) -> String {
    let mut sorted: Vec<&str> = skills.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.join("+")
}

/// Locate the resolution directory for a skill combination.
///
/// Maintainer-shipped entries win over project-local ones.
pub fn find_resolution_dir(ctx: &EngineContext, skills: &[String]) -> Option<PathBuf> {
    let key = resolution_key(skills);
    for root in [ctx.shipped_resolutions_dir(), ctx.resolutions_dir()] {
        let dir = root.join(&key);
        if dir.exists() {
            return Some(dir);
        }
    }
    None
}

/// Load cached resolutions for a skill set into git's rr-cache.
///
/// Pairs whose recorded input hashes no longer match the live base, working
/// tree, or skill content are skipped: they were recorded for different
/// inputs. Returns true iff at least one pair was materialised.
pub fn load_resolutions(
    ctx: &EngineContext,
    skills: &[String],
    top_skill_dir: Option<&Path>,
) -> anyhow::Result<bool> {
    let Some(res_dir) = find_resolution_dir(ctx, skills) else {
        return Ok(false);
    };
    let meta_path = res_dir.join("meta.yaml");
    if !meta_path.exists() {
        return Ok(false);
    }
    let meta: ResolutionMeta = match fs::read_to_string(&meta_path)
        .ok()
        .and_then(|content| serde_yaml::from_str(&content).ok())
    {
        Some(meta) => meta,
        None => {
            warn!(path = %meta_path.display(), "unreadable resolution meta, skipping cache");
            return Ok(false);
        }
    };

    let pairs = find_preimage_pairs(&res_dir, &res_dir)?;
    if pairs.is_empty() {
        return Ok(false);
    }

    let Some(git_dir) = git_dir(ctx.project_root()) else {
        return Ok(false);
    };
    let rr_cache = git_dir.join("rr-cache");

    let Some(skill_dir) = top_skill_dir else {
        debug!("no skill package for resolution verification, skipping cache");
        return Ok(false);
    };

    let mut loaded_any = false;
    for (rel_path, preimage_path, resolution_path) in pairs {
        let Some(expected) = meta.file_hashes.get(&rel_path) else {
            debug!(path = rel_path, "no recorded input hashes, skipping pair");
            continue;
        };

        let base_path = ctx.base_dir().join(&rel_path);
        let current_path = ctx.project_root().join(&rel_path);
        let skill_path = modify_source(skill_dir, &rel_path);
        if !base_path.exists() || !current_path.exists() || !skill_path.exists() {
            debug!(path = rel_path, "input files not found, skipping pair");
            continue;
        }

        if sha256_file(&base_path)? != expected.base
            || sha256_file(&current_path)? != expected.current
            || sha256_file(&skill_path)? != expected.skill
        {
            debug!(path = rel_path, "input hash mismatch, skipping pair");
            continue;
        }

        // rerere keys entries by its own conflict hash; without the sidecar
        // (legacy entries) the pair cannot be placed in rr-cache
        let sidecar = sidecar_path(&preimage_path);
        let Some(rerere_hash) = fs::read_to_string(&sidecar)
            .ok()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
        else {
            debug!(path = rel_path, "no rerere hash sidecar, skipping pair");
            continue;
        };

        let entry_dir = rr_cache.join(&rerere_hash);
        fs::create_dir_all(&entry_dir)
            .with_context(|| format!("Failed to create rr-cache entry: {}", entry_dir.display()))?;
        fs::copy(&preimage_path, entry_dir.join("preimage"))
            .with_context(|| format!("Failed to materialise preimage for {rel_path}"))?;
        fs::copy(&resolution_path, entry_dir.join("postimage"))
            .with_context(|| format!("Failed to materialise postimage for {rel_path}"))?;
        info!(path = rel_path, hash = %rerere_hash, "loaded cached resolution");
        loaded_any = true;
    }

    Ok(loaded_any)
}

/// Persist resolved conflicts for a skill set into the project-local cache.
pub fn save_resolutions(
    ctx: &EngineContext,
    skills: &[String],
    files: &[ResolutionFile],
    meta: ResolutionMetaInput,
) -> anyhow::Result<()> {
    let key = resolution_key(skills);
    let res_dir = ctx.resolutions_dir().join(&key);

    let rr_cache = git_dir(ctx.project_root()).map(|dir| dir.join("rr-cache"));

    let mut file_hashes = BTreeMap::new();
    for file in files {
        let preimage_path = res_dir.join(format!("{}{PREIMAGE_SUFFIX}", file.rel_path));
        let resolution_path = res_dir.join(format!("{}{RESOLUTION_SUFFIX}", file.rel_path));
        if let Some(parent) = preimage_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        fs::write(&preimage_path, &file.preimage)
            .with_context(|| format!("Failed to write preimage for {}", file.rel_path))?;
        fs::write(&resolution_path, &file.resolution)
            .with_context(|| format!("Failed to write resolution for {}", file.rel_path))?;

        // Recover the rerere hash by byte-matching rr-cache preimages; it is
        // the only way to key rr-cache without re-running the merge
        if let Some(rr_cache) = &rr_cache
            && let Some(hash) = find_rerere_hash(rr_cache, &file.preimage)?
        {
            fs::write(sidecar_path(&preimage_path), hash)
                .with_context(|| format!("Failed to write hash sidecar for {}", file.rel_path))?;
        }

        file_hashes.insert(file.rel_path.clone(), file.input_hashes.clone());
    }

    let mut sorted_skills: Vec<String> = skills.to_vec();
    sorted_skills.sort_unstable();
    let full_meta = ResolutionMeta {
        apply_order: meta.apply_order.unwrap_or_else(|| skills.to_vec()),
        skills: sorted_skills,
        core_version: meta.core_version,
        resolved_at: Utc::now().to_rfc3339(),
        tested: meta.tested,
        test_passed: meta.test_passed,
        resolution_source: meta.resolution_source,
        input_hashes: BTreeMap::new(),
        output_hash: String::new(),
        file_hashes,
    };

    fs::create_dir_all(&res_dir)
        .with_context(|| format!("Failed to create directory: {}", res_dir.display()))?;
    let meta_yaml =
        serde_yaml::to_string(&full_meta).context("Failed to serialize resolution meta")?;
    fs::write(res_dir.join("meta.yaml"), meta_yaml)
        .with_context(|| format!("Failed to write resolution meta under {}", res_dir.display()))?;
    Ok(())
}

/// Remove every project-local resolution entry.
///
/// Called after rebase: the base is hashed into every recorded input triple,
/// so a new base invalidates the whole cache.
pub fn clear_resolutions(ctx: &EngineContext) -> anyhow::Result<()> {
    let res_dir = ctx.resolutions_dir();
    if res_dir.exists() {
        fs::remove_dir_all(&res_dir)
            .with_context(|| format!("Failed to clear resolutions: {}", res_dir.display()))?;
    }
    fs::create_dir_all(&res_dir)
        .with_context(|| format!("Failed to recreate resolutions dir: {}", res_dir.display()))?;
    Ok(())
}

fn sidecar_path(preimage_path: &Path) -> PathBuf {
    let name = preimage_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.strip_suffix(PREIMAGE_SUFFIX).unwrap_or(&name);
    preimage_path.with_file_name(format!("{stem}{HASH_SIDECAR_SUFFIX}"))
}

/// Recursively collect `(rel_path, preimage, resolution)` triples.
fn find_preimage_pairs(
    dir: &Path,
    root: &Path,
) -> anyhow::Result<Vec<(String, PathBuf, PathBuf)>> {
    let mut pairs = Vec::new();
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            pairs.extend(find_preimage_pairs(&path, root)?);
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.ends_with(PREIMAGE_SUFFIX) || name.ends_with(HASH_SIDECAR_SUFFIX) {
            continue;
        }
        let stem = name
            .strip_suffix(PREIMAGE_SUFFIX)
            .expect("suffix was just checked");
        let resolution = path.with_file_name(format!("{stem}{RESOLUTION_SUFFIX}"));
        if !resolution.exists() {
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .expect("walked entries live under the cache root")
            .with_file_name(stem)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        pairs.push((rel, path, resolution));
    }
    Ok(pairs)
}

/// Scan rr-cache entries for one whose stored preimage byte-matches.
fn find_rerere_hash(rr_cache: &Path, preimage: &str) -> anyhow::Result<Option<String>> {
    if !rr_cache.exists() {
        return Ok(None);
    }
    let entries = fs::read_dir(rr_cache)
        .with_context(|| format!("Failed to read rr-cache: {}", rr_cache.display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let stored = entry.path().join("preimage");
        if stored.exists()
            && fs::read_to_string(&stored).map(|c| c == preimage).unwrap_or(false)
        {
            return Ok(Some(entry.file_name().to_string_lossy().into_owned()));
        }
    }
    Ok(None)
}
