//! End-to-end task orchestrator scenarios against real temporary repositories.
//!
//! The diff generator, QA runner and pull-request service are scripted; git,
//! the store and the sandbox are real.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use patchgate::core::policy::Policy;
use patchgate::core::types::{ApplyStage, TaskStage, ToolOutput};
use patchgate::io::config::ToolConfig;
use patchgate::io::github::PullRequestError;
use patchgate::io::qa::QaRunner;
use patchgate::io::store::PatchStore;
use patchgate::task::{TaskDeps, TaskRequest, TaskResult, run_task};
use patchgate::test_support::{
    README_CONTENTS, RecordingPullRequests, ScriptedCheck, ScriptedQa, TestRepo, static_diff,
};

const GOAL: &str = "Append line to README";

fn run(
    repo: &TestRepo,
    request: &TaskRequest,
    diff: String,
    qa: &ScriptedQa,
    pull_requests: &RecordingPullRequests,
) -> Result<TaskResult> {
    let generator = static_diff(diff);
    run_task(
        repo.path(),
        &ToolConfig::default(),
        &Policy::default(),
        request,
        TaskDeps {
            generator: &generator,
            qa,
            pull_requests,
        },
    )
}

#[test]
fn dry_run_validates_without_promoting() {
    let repo = TestRepo::new().expect("repo");
    let head = repo.head();
    let mut request = TaskRequest::new(GOAL, &ToolConfig::default());
    request.dry_run = true;

    let result = run(
        &repo,
        &request,
        repo.readme_append_diff("dry run line"),
        &ScriptedQa::passing(),
        &RecordingPullRequests::new(),
    )
    .expect("run");

    assert!(result.ok, "{result:?}");
    assert_eq!(result.stage, TaskStage::Done);
    let verdict = result.verdict.expect("verdict");
    assert!(verdict.applied);
    assert_eq!(verdict.stage, ApplyStage::Done);
    assert_eq!(result.files, vec!["README.md"]);
    assert!(result.branch.is_none());
    assert!(result.commit.is_none());
    assert!(result.pr.is_none());

    assert_eq!(repo.read("README.md"), README_CONTENTS);
    assert_eq!(repo.head(), head);
    assert_eq!(repo.current_branch(), "main");
}

#[test]
fn empty_diff_stops_at_plan() {
    let repo = TestRepo::new().expect("repo");
    let request = TaskRequest::new(GOAL, &ToolConfig::default());
    let qa = ScriptedQa::passing();

    let result = run(
        &repo,
        &request,
        "  \n".to_string(),
        &qa,
        &RecordingPullRequests::new(),
    )
    .expect("run");

    assert!(!result.ok);
    assert_eq!(result.stage, TaskStage::Plan);
    assert!(result.verdict.is_none());
    assert!(qa.calls().is_empty());
    let json = serde_json::to_value(&result).expect("json");
    assert_eq!(json["stage"], "plan");
    assert_eq!(json["ok"], false);
}

#[test]
fn strict_checks_report_both_failures_verbatim() {
    let repo = TestRepo::new().expect("repo");
    let mut request = TaskRequest::new(GOAL, &ToolConfig::default());
    request.strict_checks = true;
    let qa = ScriptedQa::new(
        ScriptedCheck::fail("README.md:2: trailing whitespace"),
        ScriptedCheck::fail("FAILED test_readme - AssertionError"),
    );

    let result = run(
        &repo,
        &request,
        repo.readme_append_diff("bad line "),
        &qa,
        &RecordingPullRequests::new(),
    )
    .expect("run");

    assert!(!result.ok);
    assert_eq!(result.stage, TaskStage::Qa);
    let verdict = result.verdict.expect("verdict");
    assert_eq!(
        verdict.lint.expect("lint").stderr,
        "README.md:2: trailing whitespace"
    );
    assert_eq!(
        verdict.tests.expect("tests").stderr,
        "FAILED test_readme - AssertionError"
    );
    assert_eq!(repo.current_branch(), "main");
}

#[test]
fn happy_path_pushes_branch_and_opens_pull_request() {
    let mut repo = TestRepo::new().expect("repo");
    repo.add_bare_remote().expect("remote");
    let mut request = TaskRequest::new(GOAL, &ToolConfig::default());
    request.auto_pr = true;
    let pull_requests = RecordingPullRequests::new();

    let result = run(
        &repo,
        &request,
        repo.readme_append_diff("promoted line"),
        &ScriptedQa::passing(),
        &pull_requests,
    )
    .expect("run");

    assert!(result.ok, "{result:?}");
    assert_eq!(result.stage, TaskStage::Done);
    let branch = result.branch.clone().expect("branch");
    assert_eq!(branch, "patchgate/append-line-to-readme");
    assert_eq!(repo.current_branch(), branch);
    assert_eq!(repo.last_commit_subject(), GOAL);
    assert_eq!(result.commit.as_deref(), Some(repo.head().as_str()));
    assert!(repo.remote_has_branch(&branch));
    assert_eq!(repo.read("README.md"), "# Demo\npromoted line\n");

    let opened = pull_requests.opened();
    assert_eq!(opened.len(), 1);
    let (pr_branch, title, body) = &opened[0];
    assert_eq!(pr_branch, &branch);
    assert_eq!(title, GOAL);
    assert!(body.contains("`README.md`"));
    assert_eq!(result.pr.expect("pr").number, 1);

    // The store's records stay out of the commit.
    let committed = repo
        .git(&["show", "--name-only", "--format=", "HEAD"])
        .expect("show");
    assert_eq!(committed.trim(), "README.md");
    let store = PatchStore::new(repo.path().join(".patchgate/store"));
    let bundle = store
        .load_bundle(result.bundle_id.as_deref().expect("bundle id"))
        .expect("stored bundle");
    assert_eq!(bundle.files(), vec!["README.md"]);
}

#[test]
fn missing_token_is_raised_before_any_change() {
    let mut repo = TestRepo::new().expect("repo");
    repo.add_bare_remote().expect("remote");
    let head = repo.head();
    let mut request = TaskRequest::new(GOAL, &ToolConfig::default());
    request.auto_pr = true;
    let qa = ScriptedQa::passing();

    let err = run(
        &repo,
        &request,
        repo.readme_append_diff("never lands"),
        &qa,
        &RecordingPullRequests::missing_token(),
    )
    .expect_err("missing token");

    let err = err
        .downcast_ref::<PullRequestError>()
        .expect("pull request error");
    assert_eq!(err.to_string(), "GITHUB_TOKEN is not set");
    assert!(qa.calls().is_empty());
    assert_eq!(repo.head(), head);
    assert_eq!(repo.current_branch(), "main");
}

#[test]
fn pull_request_failure_is_a_pr_stage_failure() {
    let mut repo = TestRepo::new().expect("repo");
    repo.add_bare_remote().expect("remote");
    let mut request = TaskRequest::new(GOAL, &ToolConfig::default());
    request.auto_pr = true;
    request.branch = Some("feature/readme".to_string());

    let result = run(
        &repo,
        &request,
        repo.readme_append_diff("x"),
        &ScriptedQa::passing(),
        &RecordingPullRequests::http_failure(422),
    )
    .expect("run");

    assert!(!result.ok);
    assert_eq!(result.stage, TaskStage::Pr);
    assert!(result.error.expect("error").contains("422"));
    assert!(repo.remote_has_branch("feature/readme"));
}

#[test]
fn protected_path_in_generated_diff_is_rejected() {
    let repo = TestRepo::new().expect("repo");
    let request = TaskRequest::new("Upgrade the lockfile", &ToolConfig::default());
    let diff = format!(
        "{}{}",
        repo.readme_append_diff("x"),
        repo.new_file_diff("package-lock.json", "{}")
    );

    let result = run(
        &repo,
        &request,
        diff,
        &ScriptedQa::passing(),
        &RecordingPullRequests::new(),
    )
    .expect("run");

    assert_eq!(result.stage, TaskStage::Policy);
    assert_eq!(result.files, vec!["README.md", "package-lock.json"]);
    let violation = result
        .verdict
        .expect("verdict")
        .policy_violation
        .expect("violation");
    assert_eq!(violation.index, 1);
}

/// Lint fails whenever `file` exists in the checked tree.
struct RejectsFile(&'static str);

impl QaRunner for RejectsFile {
    fn run_lint(&self, workdir: &Path) -> Result<ToolOutput> {
        Ok(if workdir.join(self.0).exists() {
            ToolOutput::failed(format!("{} must not exist", self.0))
        } else {
            ToolOutput::skipped("clean")
        })
    }

    fn run_tests(&self, _workdir: &Path) -> Result<ToolOutput> {
        Ok(ToolOutput::skipped("no tests"))
    }
}

#[test]
fn promotion_branches_from_the_validated_reference() {
    let mut repo = TestRepo::new().expect("repo");
    let base = repo.head();
    repo.write("broken.txt", "unvalidated\n").expect("write");
    repo.commit_all("break the build").expect("commit");
    repo.add_bare_remote().expect("remote");
    let mut request = TaskRequest::new(GOAL, &ToolConfig::default());
    request.reference = base.clone();
    request.branch = Some("feature/from-base".to_string());
    let generator = static_diff(repo.readme_append_diff("validated"));

    let result = run_task(
        repo.path(),
        &ToolConfig::default(),
        &Policy::default(),
        &request,
        TaskDeps {
            generator: &generator,
            qa: &RejectsFile("broken.txt"),
            pull_requests: &RecordingPullRequests::new(),
        },
    )
    .expect("run");

    assert!(result.ok, "{result:?}");
    assert_eq!(result.base_commit.as_deref(), Some(base.as_str()));
    assert_eq!(repo.current_branch(), "feature/from-base");
    assert!(!repo.path().join("broken.txt").exists());
    let parent = repo.git(&["rev-parse", "HEAD^"]).expect("parent");
    assert_eq!(parent.trim(), base);
    let tree = repo
        .git(&["ls-tree", "--name-only", "feature/from-base"])
        .expect("ls-tree");
    assert_eq!(tree.trim(), "README.md");
}

#[test]
fn unknown_reference_fails_before_validation() {
    let repo = TestRepo::new().expect("repo");
    let mut request = TaskRequest::new(GOAL, &ToolConfig::default());
    request.reference = "no-such-ref".to_string();
    let qa = ScriptedQa::passing();

    let result = run(
        &repo,
        &request,
        repo.readme_append_diff("x"),
        &qa,
        &RecordingPullRequests::new(),
    )
    .expect("run");

    assert!(!result.ok);
    assert_eq!(result.stage, TaskStage::Sandbox);
    assert!(result.error.expect("error").contains("no-such-ref"));
    assert!(result.verdict.is_none());
    assert!(qa.calls().is_empty());
    assert_eq!(repo.current_branch(), "main");
}

#[test]
fn generator_sees_hinted_context() {
    let repo = TestRepo::new().expect("repo");
    repo.write("docs/guide.md", "guide\n").expect("write");
    repo.commit_all("docs").expect("commit");
    let mut request = TaskRequest::new(GOAL, &ToolConfig::default());
    request.dry_run = true;
    request.hints = vec!["README.md".to_string(), "docs".to_string()];

    let seen = std::cell::RefCell::new(Vec::new());
    let diff = repo.readme_append_diff("ctx");
    let generator = |_goal: &str, context: &BTreeMap<String, String>| -> Result<String> {
        seen.borrow_mut().extend(context.keys().cloned());
        Ok(diff.clone())
    };
    let result = run_task(
        repo.path(),
        &ToolConfig::default(),
        &Policy::default(),
        &request,
        TaskDeps {
            generator: &generator,
            qa: &ScriptedQa::passing(),
            pull_requests: &RecordingPullRequests::new(),
        },
    )
    .expect("run");

    assert!(result.ok);
    assert_eq!(seen.into_inner(), vec!["README.md", "docs/guide.md"]);
}
