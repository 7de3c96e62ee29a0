//! Filesystem primitives shared across features.

pub mod copy;
pub mod digest;

pub use copy::{copy_dir, copy_dir_filtered, copy_file, walk_files};
pub use digest::sha256_file;
