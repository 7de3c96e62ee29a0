//! Dependency-table merging with a narrow range-compatibility check.
//!
//! Two caret ranges unify iff they agree on the major version; two tilde
//! ranges iff they agree on major and minor. The resolved range is the
//! numerically higher of the two. Everything else (mixed prefixes, exact
//! pins, comparator ranges) is incompatible when the strings differ.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde_json::Value;
use tracing::info;

use crate::error::EngineError;
use crate::exec::run_program;
use crate::version::{compare_parts, version_parts};

/// Outcome of unifying two version ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeUnification {
    pub compatible: bool,
    pub resolved: String,
}

/// Unify an existing range with a requested one.
pub fn unify_ranges(existing: &str, requested: &str) -> RangeUnification {
    if existing == requested {
        return RangeUnification {
            compatible: true,
            resolved: existing.to_string(),
        };
    }

    for prefix in ['^', '~'] {
        let (Some(existing_core), Some(requested_core)) = (
            existing.strip_prefix(prefix),
            requested.strip_prefix(prefix),
        ) else {
            continue;
        };
        let existing_parts = version_parts(existing_core);
        let requested_parts = version_parts(requested_core);

        let agrees = match prefix {
            // Caret: same major
            '^' => existing_parts.first() == requested_parts.first(),
            // Tilde: same major and minor
            _ => {
                existing_parts.first() == requested_parts.first()
                    && existing_parts.get(1) == requested_parts.get(1)
            }
        };
        if !agrees {
            return RangeUnification {
                compatible: false,
                resolved: existing.to_string(),
            };
        }
        let resolved = if compare_parts(&existing_parts, &requested_parts).is_ge() {
            existing
        } else {
            requested
        };
        return RangeUnification {
            compatible: true,
            resolved: resolved.to_string(),
        };
    }

    RangeUnification {
        compatible: false,
        resolved: existing.to_string(),
    }
}

/// Merge new dependencies into the project's package.json.
///
/// Aborts with a structural-incompatibility error when any range fails to
/// unify; the file is untouched in that case. Output maps are sorted for
/// deterministic diffs.
pub fn merge_dependencies(
    package_json: &Path,
    additions: &BTreeMap<String, String>,
) -> anyhow::Result<()> {
    let content = fs::read_to_string(package_json)
        .with_context(|| format!("Failed to read {}", package_json.display()))?;
    let mut pkg: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", package_json.display()))?;

    let root = pkg
        .as_object_mut()
        .ok_or_else(|| EngineError::invalid_input("package.json is not an object"))?;

    let mut dependencies: BTreeMap<String, String> = map_of_strings(root.get("dependencies"));
    let dev_dependencies: Option<BTreeMap<String, String>> = root
        .get("devDependencies")
        .map(|value| map_of_strings(Some(value)));

    for (name, requested) in additions {
        // Dev dependencies count for duplicate detection too
        let existing = dependencies.get(name).cloned().or_else(|| {
            dev_dependencies
                .as_ref()
                .and_then(|dev| dev.get(name).cloned())
        });
        match existing {
            Some(existing) if existing != *requested => {
                let unified = unify_ranges(&existing, requested);
                if !unified.compatible {
                    return Err(EngineError::Incompatible(format!(
                        "Dependency conflict: {name} is already at {existing}, skill wants {requested}"
                    ))
                    .into());
                }
                dependencies.insert(name.clone(), unified.resolved);
            }
            Some(_) => {}
            None => {
                dependencies.insert(name.clone(), requested.clone());
            }
        }
    }

    root.insert("dependencies".to_string(), to_sorted_object(&dependencies));
    if let Some(dev) = dev_dependencies {
        root.insert("devDependencies".to_string(), to_sorted_object(&dev));
    }

    let output = serde_json::to_string_pretty(&pkg).context("Failed to serialize package.json")?;
    fs::write(package_json, format!("{output}\n"))
        .with_context(|| format!("Failed to write {}", package_json.display()))?;
    Ok(())
}

/// Run the platform-native dependency install after the table changed.
pub fn run_dependency_install(project_root: &Path) -> anyhow::Result<()> {
    info!("installing dependencies");
    run_program("npm", &["install", "--legacy-peer-deps"], project_root)
}

fn map_of_strings(value: Option<&Value>) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if let Some(Value::Object(object)) = value {
        for (key, value) in object {
            if let Value::String(version) = value {
                map.insert(key.clone(), version.clone());
            }
        }
    }
    map
}

fn to_sorted_object(map: &BTreeMap<String, String>) -> Value {
    let mut object = serde_json::Map::new();
    for (key, value) in map {
        object.insert(key.clone(), Value::String(value.clone()));
    }
    Value::Object(object)
}
