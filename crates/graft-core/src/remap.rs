//! Path remapping for files renamed by core updates.
//!
//! The remap reroutes reads and writes against the project and base
//! directories. Skill packages are immutable, so paths inside a package are
//! never remapped: a manifest that modifies `src/old.ts` is always read from
//! `<skill>/modify/src/old.ts` even when the project file moved.

use std::collections::BTreeMap;

/// Old relative path -> new relative path.
#[derive(Debug, Clone, Default)]
pub struct PathRemap {
    map: BTreeMap<String, String>,
}

impl PathRemap {
    pub fn from_map(map: BTreeMap<String, String>) -> Self {
        Self { map }
    }

    /// Resolve a relative path through the remap table.
    pub fn resolve<'a>(&'a self, rel_path: &'a str) -> &'a str {
        self.map.get(rel_path).map(String::as_str).unwrap_or(rel_path)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
