//! Structured merges for the three well-known project files.
//!
//! Unlike source files, these targets are merged semantically: the dependency
//! table by range unification, the env file by declared-name union, and the
//! service manifest by name with host-port collision detection.

pub mod dependencies;
pub mod env;
pub mod services;

pub use dependencies::{merge_dependencies, run_dependency_install, unify_ranges};
pub use env::merge_env_additions;
pub use services::merge_services;
