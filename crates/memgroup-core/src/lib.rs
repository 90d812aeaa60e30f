//! memgroup-core: shared types, errors, and capability detection for memgroup
//!
//! This crate provides the foundational types used by all memgroup sub-crates:
//! - Error types and Result alias
//! - Utility functions (memory size parsing, UID queries, group name checks)
//! - Runtime capability detection (cgroup v2, memory controller, cgroup.kill, pidfd)

pub mod capabilities;
pub mod error;
pub mod util;

pub use capabilities::SystemCapabilities;
pub use error::{GroupError, Result};
