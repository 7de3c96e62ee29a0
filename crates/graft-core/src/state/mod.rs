//! Ledger types and persistence.
//!
//! The ledger (`.g2/state.yaml`) is the single source of truth for applied
//! skills, custom modifications, the path remap, and version markers.

pub mod store;
pub mod types;

pub use store::StateStore;
pub use types::{AppliedSkill, CustomModification, SkillState, StructuredOutcomes};
