//! I/O helpers for patchgate commands.

pub mod config;
pub mod context;
pub mod git;
pub mod github;
pub mod index;
pub mod model;
pub mod policy_file;
pub mod process;
pub mod qa;
pub mod repo_fs;
pub mod sandbox;
pub mod store;
