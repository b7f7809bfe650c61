#![forbid(unsafe_code)]
//! VDFS public API facade.
//!
//! Re-exports the volume engine from `vdfs-core` through a stable external
//! interface. This is the crate downstream consumers (the CLI, VFS
//! bindings) depend on.

pub use vdfs_core::*;
