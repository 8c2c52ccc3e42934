//! # rustainer-common
//!
//! Shared utilities and types for the Rustainer network stack.
//!
//! This crate provides functionality used across all Rustainer crates:
//! - Container ID validation and generation
//! - Standard filesystem paths
//! - The common error type

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{RustainerError, RustainerResult};
pub use id::ContainerId;
pub use paths::RustainerPaths;
