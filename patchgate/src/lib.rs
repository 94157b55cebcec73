//! Validate-then-promote pipeline for machine-generated code changes.
//!
//! A change (single-file patch or ordered bundle) is proposed into a local
//! store, validated inside a disposable git worktree, and only then promoted
//! to the real repository as a branch, a commit, a push and optionally a pull
//! request. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (policy, diff splitting, branch
//!   naming, playbooks, result types). No I/O.
//! - **[`io`]**: Side-effecting operations (store, git, sandbox, QA commands,
//!   HTTP collaborators). Behind traits where tests need fakes.
//!
//! Orchestration modules ([`apply`], [`task`]) combine the two to implement
//! CLI commands.

pub mod apply;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
