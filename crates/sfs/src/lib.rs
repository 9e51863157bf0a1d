#![forbid(unsafe_code)]
//! SimpleFS public API facade.
//!
//! Re-exports the image engine from `sfs-core` through a stable external
//! interface. This is the crate that downstream consumers (the CLI, other
//! tools) depend on.

pub use sfs_core::*;
