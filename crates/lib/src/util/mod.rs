//! Shared utilities.
//!
//! Common utilities used across the crate including hashing, path
//! normalization and test helpers.

pub mod hash;
pub mod paths;
