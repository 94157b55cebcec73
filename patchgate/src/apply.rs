//! Apply pipeline: validate a bundle inside a throwaway worktree.
//!
//! Stages run in a fixed order, `sandbox -> policy -> dry-run -> apply -> qa
//! -> done`, and every outcome is a [`Verdict`] naming where the run stopped.
//! Nothing here touches the caller's working tree.

use std::path::Path;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::policy::Policy;
use crate::core::types::{Bundle, ItemFailure, ToolOutput, Verdict};
use crate::io::git::Git;
use crate::io::qa::QaRunner;
use crate::io::sandbox::{Sandbox, SandboxHandle};
use crate::io::store::{PatchStore, StoreError};

const LINT_NOT_REQUIRED: &str = "lint not required by policy; skipped.";
const TESTS_NOT_REQUIRED: &str = "tests not required by policy; skipped.";

/// Validate `bundle` against `reference` of the repository containing `repo_dir`.
#[instrument(skip_all, fields(bundle = %bundle.id, items = bundle.items.len(), reference))]
pub fn apply_bundle<Q: QaRunner>(
    repo_dir: &Path,
    reference: &str,
    bundle: &Bundle,
    policy: &Policy,
    qa: &Q,
) -> Verdict {
    if bundle.items.is_empty() {
        warn!("refusing empty bundle");
        return Verdict::empty_bundle();
    }

    let sandbox = match Sandbox::open(repo_dir) {
        Ok(sandbox) => sandbox,
        Err(err) => {
            warn!(err = %err, "sandbox unavailable");
            return Verdict::sandbox(err.to_string());
        }
    };

    let verdict = match sandbox.with_worktree(reference, |handle| {
        validate_in_sandbox(handle, bundle, policy, qa)
    }) {
        Ok(verdict) => verdict,
        Err(err) => {
            warn!(err = %err, "sandbox setup failed");
            Verdict::sandbox(err.to_string())
        }
    };
    info!(
        applied = verdict.applied,
        stage = %verdict.stage,
        items_applied = verdict.items_applied,
        "apply pipeline finished"
    );
    verdict
}

/// Run a stored single-file patch through the pipeline as a one-item bundle.
pub fn apply_stored_patch<Q: QaRunner>(
    store: &PatchStore,
    id: &str,
    repo_dir: &Path,
    reference: &str,
    policy: &Policy,
    qa: &Q,
) -> Result<Verdict, StoreError> {
    let bundle = store.load_patch(id)?.into_bundle();
    Ok(apply_bundle(repo_dir, reference, &bundle, policy, qa))
}

/// Run a stored bundle through the pipeline.
pub fn apply_stored_bundle<Q: QaRunner>(
    store: &PatchStore,
    id: &str,
    repo_dir: &Path,
    reference: &str,
    policy: &Policy,
    qa: &Q,
) -> Result<Verdict, StoreError> {
    let bundle = store.load_bundle(id)?;
    Ok(apply_bundle(repo_dir, reference, &bundle, policy, qa))
}

fn validate_in_sandbox<Q: QaRunner>(
    handle: &SandboxHandle,
    bundle: &Bundle,
    policy: &Policy,
    qa: &Q,
) -> Verdict {
    // Policy covers every item before any of them is dry-run.
    if let Some(violation) = policy.first_violation(&bundle.items) {
        warn!(index = violation.index, file = %violation.file, rule = %violation.rule, "protected path");
        return Verdict::policy(violation);
    }

    let git = Git::new(&handle.path);
    let mut items_applied = 0;
    for (index, item) in bundle.items.iter().enumerate() {
        let failure = |output: ToolOutput| ItemFailure {
            index,
            file: item.file.clone(),
            output,
        };

        let check = git
            .apply_check(&item.diff)
            .unwrap_or_else(|err| ToolOutput::failed(format!("{err:#}")));
        if !check.ok {
            warn!(index, file = %item.file, "dry-run failed");
            return Verdict::dry_run(failure(check), items_applied);
        }

        let applied = git
            .apply(&item.diff)
            .unwrap_or_else(|err| ToolOutput::failed(format!("{err:#}")));
        if !applied.ok {
            warn!(index, file = %item.file, "apply failed");
            return Verdict::apply(failure(applied), items_applied);
        }
        items_applied += 1;
    }

    run_qa(&handle.path, policy, qa, items_applied)
}

fn run_qa<Q: QaRunner>(workdir: &Path, policy: &Policy, qa: &Q, items_applied: usize) -> Verdict {
    let lint_required = policy.requires_lint();
    let tests_required = policy.requires_tests();

    let lint = if lint_required {
        as_check(qa.run_lint(workdir), "lint")
    } else {
        ToolOutput::skipped(LINT_NOT_REQUIRED)
    };
    let lint_failed = lint_required && !lint.ok;

    let tests = if !tests_required {
        Some(ToolOutput::skipped(TESTS_NOT_REQUIRED))
    } else if lint_failed && policy.fail_fast {
        info!("lint failed, skipping tests");
        None
    } else {
        Some(as_check(qa.run_tests(workdir), "tests"))
    };
    let tests_failed = tests_required && tests.as_ref().is_none_or(|t| !t.ok);

    match tests {
        Some(tests) if !lint_failed && !tests_failed => Verdict::done(lint, tests, items_applied),
        tests => {
            warn!(lint_failed, tests_failed, "qa gate failed");
            Verdict::qa(lint, tests, items_applied)
        }
    }
}

/// A runner that could not run the check counts as a failed check.
fn as_check(result: Result<ToolOutput>, label: &str) -> ToolOutput {
    result.unwrap_or_else(|err| {
        warn!(check = label, err = %err, "check could not run");
        ToolOutput::failed(format!("{label} could not run: {err:#}"))
    })
}
