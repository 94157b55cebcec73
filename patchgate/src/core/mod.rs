//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod branch_name;
pub mod diff_split;
pub mod playbook;
pub mod policy;
pub mod types;
