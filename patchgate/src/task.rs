//! Task orchestration: goal -> diff -> sandbox validation -> promotion.
//!
//! Stages: `plan -> [apply pipeline] -> branch -> apply-working -> stage ->
//! commit -> push -> pr -> done`. A failed stage ends the run with a
//! [`TaskResult`] naming it; earlier stages are not rolled back.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::apply::apply_bundle;
use crate::core::branch_name::{branch_for_goal, validate_branch_name};
use crate::core::diff_split::split_into_items;
use crate::core::playbook::{Playbook, select_playbook};
use crate::core::policy::Policy;
use crate::core::types::{PullRequest, TaskStage, ToolOutput, Verdict};
use crate::io::config::ToolConfig;
use crate::io::context::{ContextBudget, gather_context};
use crate::io::git::Git;
use crate::io::github::{PullRequestError, PullRequestService};
use crate::io::model::{DiffGenerator, DiffRequest};
use crate::io::qa::QaRunner;
use crate::io::store::PatchStore;

/// One end-to-end change request.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub goal: String,
    /// Files, directories or globs used as generator context.
    pub hints: Vec<String>,
    /// Validate only; never touch the real tree.
    pub dry_run: bool,
    pub auto_pr: bool,
    /// Explicit branch name; defaults to `<prefix><slug-of-goal>`.
    pub branch: Option<String>,
    pub pr_title: Option<String>,
    pub pr_body: Option<String>,
    pub max_files: usize,
    /// Advisory; exceeding it is reported, not enforced.
    pub time_budget: Duration,
    /// Require every check and report all QA failures.
    pub strict_checks: bool,
    /// Reference the change is validated against and the branch is cut from.
    pub reference: String,
}

impl TaskRequest {
    pub fn new(goal: impl Into<String>, config: &ToolConfig) -> Self {
        Self {
            goal: goal.into(),
            hints: Vec::new(),
            dry_run: false,
            auto_pr: false,
            branch: None,
            pr_title: None,
            pr_body: None,
            max_files: config.context.max_files,
            time_budget: config.time_budget(),
            strict_checks: false,
            reference: "HEAD".to_string(),
        }
    }
}

/// Outcome of one task run.
///
/// `ok == true` implies the sandbox verdict was applied and, unless this was a
/// dry run, every promotion stage succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub ok: bool,
    pub stage: TaskStage,
    pub playbook: Playbook,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub files: Vec<String>,
    /// Commit `reference` resolved to when the run started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr: Option<PullRequest>,
    pub elapsed_ms: u64,
    pub time_budget_secs: u64,
    pub over_budget: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// External collaborators of a task run.
pub struct TaskDeps<'a, D, Q, P> {
    pub generator: &'a D,
    pub qa: &'a Q,
    pub pull_requests: &'a P,
}

/// Tracks the in-progress result and stamps timing on completion.
struct TaskRun {
    started: Instant,
    budget: Duration,
    result: TaskResult,
}

impl TaskRun {
    fn new(request: &TaskRequest, playbook: Playbook) -> Self {
        Self {
            started: Instant::now(),
            budget: request.time_budget,
            result: TaskResult {
                ok: false,
                stage: TaskStage::Plan,
                playbook,
                dry_run: request.dry_run,
                branch: None,
                files: Vec::new(),
                base_commit: None,
                bundle_id: None,
                verdict: None,
                commit: None,
                pr: None,
                elapsed_ms: 0,
                time_budget_secs: request.time_budget.as_secs(),
                over_budget: false,
                error: None,
            },
        }
    }

    fn fail(self, stage: TaskStage, error: impl Into<String>) -> TaskResult {
        let error = error.into();
        warn!(stage = %stage, error = %error, "task stopped");
        let mut result = self.finish(stage, false);
        result.error = Some(error);
        result
    }

    fn finish(self, stage: TaskStage, ok: bool) -> TaskResult {
        let elapsed = self.started.elapsed();
        let mut result = self.result;
        result.ok = ok;
        result.stage = stage;
        result.elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        result.over_budget = elapsed > self.budget;
        if result.over_budget {
            warn!(
                elapsed_ms = result.elapsed_ms,
                budget_secs = self.budget.as_secs(),
                "task exceeded its time budget"
            );
        }
        result
    }
}

/// Run one task against the repository containing `repo_dir`.
///
/// Stage failures come back as `Ok(TaskResult { ok: false, .. })`. `Err` is
/// reserved for missing pull-request configuration and store I/O errors.
#[instrument(skip_all, fields(dry_run = request.dry_run, auto_pr = request.auto_pr))]
pub fn run_task<D, Q, P>(
    repo_dir: &Path,
    config: &ToolConfig,
    policy: &Policy,
    request: &TaskRequest,
    deps: TaskDeps<'_, D, Q, P>,
) -> Result<TaskResult>
where
    D: DiffGenerator,
    Q: QaRunner,
    P: PullRequestService,
{
    let playbook = select_playbook(&request.goal);
    let mut run = TaskRun::new(request, playbook);
    info!(playbook = playbook.as_str(), "task started");

    if request.auto_pr && !request.dry_run {
        deps.pull_requests.ensure_configured()?;
    }

    let root = Git::new(repo_dir)
        .toplevel()
        .unwrap_or_else(|_| repo_dir.to_path_buf());

    // plan
    let budget = ContextBudget {
        max_files: request.max_files,
        snippet_bytes: config.context.snippet_bytes,
    };
    let context = match gather_context(&root, &request.hints, budget) {
        Ok(context) => context,
        Err(err) => return Ok(run.fail(TaskStage::Plan, format!("gather context: {err:#}"))),
    };
    let diff = match deps.generator.get_diff(&DiffRequest {
        goal: &request.goal,
        playbook,
        context: &context,
    }) {
        Ok(diff) => diff,
        Err(err) => return Ok(run.fail(TaskStage::Plan, format!("generate diff: {err:#}"))),
    };
    if diff.trim().is_empty() {
        return Ok(run.fail(TaskStage::Plan, "diff generator returned no changes"));
    }

    // split + store
    let items = split_into_items(&diff, &request.goal);
    run.result.files = items.iter().map(|item| item.file.clone()).collect();
    let store = PatchStore::new(config.store_path(&root));
    let bundle_id = store.propose_bundle(items, &request.goal)?;
    let bundle = store.load_bundle(&bundle_id)?;
    run.result.bundle_id = Some(bundle_id);

    // Pin the reference once so validation and promotion see the same tree.
    let git = Git::new(&root);
    let base = match git.resolve_commit(&request.reference) {
        Ok(base) => base,
        Err(err) => {
            return Ok(run.fail(
                TaskStage::Sandbox,
                format!("resolve reference '{}': {err:#}", request.reference),
            ));
        }
    };
    run.result.base_commit = Some(base.clone());

    // sandbox validation
    let policy = if request.strict_checks {
        policy.strict()
    } else {
        policy.clone()
    };
    let verdict = apply_bundle(&root, &base, &bundle, &policy, deps.qa);
    let verdict_stage = TaskStage::from(verdict.stage);
    let verdict_error = verdict.error.clone();
    let applied = verdict.applied;
    run.result.verdict = Some(verdict);
    if !applied {
        return Ok(match verdict_error {
            Some(error) => run.fail(verdict_stage, error),
            None => {
                warn!(stage = %verdict_stage, "sandbox validation failed");
                run.finish(verdict_stage, false)
            }
        });
    }

    if request.dry_run {
        info!("dry run validated, skipping promotion");
        return Ok(run.finish(TaskStage::Done, true));
    }

    // branch
    let branch = match &request.branch {
        Some(branch) => branch.trim().to_string(),
        None => branch_for_goal(&config.branch_prefix, &request.goal),
    };
    run.result.branch = Some(branch.clone());
    if let Err(err) = validate_branch_name(&branch) {
        return Ok(run.fail(TaskStage::Branch, format!("{err:#}")));
    }
    let store_prefix = store_prefix(&root, store.dir());
    let allowed: Vec<&str> = store_prefix.iter().map(String::as_str).collect();
    if let Err(err) = git.ensure_clean_except_prefixes(&allowed) {
        return Ok(run.fail(TaskStage::Branch, format!("{err:#}")));
    }
    match git.branch_exists(&branch) {
        Ok(false) => {}
        Ok(true) => {
            return Ok(run.fail(
                TaskStage::Branch,
                format!("branch '{branch}' already exists"),
            ));
        }
        Err(err) => return Ok(run.fail(TaskStage::Branch, format!("{err:#}"))),
    }
    if let Err(err) = git.checkout_new_branch(&branch, &base) {
        return Ok(run.fail(TaskStage::Branch, format!("{err:#}")));
    }

    // apply-working
    let working = git
        .apply(&diff)
        .unwrap_or_else(|err| ToolOutput::failed(format!("{err:#}")));
    if !working.ok {
        return Ok(run.fail(TaskStage::ApplyWorking, working.stderr.trim().to_string()));
    }

    // stage + commit
    if let Err(err) = git.add_all() {
        return Ok(run.fail(TaskStage::Stage, format!("{err:#}")));
    }
    let message = request.pr_title.as_deref().unwrap_or(&request.goal);
    match git.commit_staged(message) {
        Ok(true) => {}
        Ok(false) => return Ok(run.fail(TaskStage::Commit, "nothing staged to commit")),
        Err(err) => return Ok(run.fail(TaskStage::Commit, format!("{err:#}"))),
    }
    run.result.commit = git.resolve_commit("HEAD").ok();

    // push
    if let Err(err) = git.push_branch(&config.remote, &branch) {
        return Ok(run.fail(TaskStage::Push, format!("{err:#}")));
    }

    // pr
    if request.auto_pr {
        let title = request.pr_title.as_deref().unwrap_or(&request.goal);
        let body = match &request.pr_body {
            Some(body) => body.clone(),
            None => pr_summary(&request.goal, &run.result),
        };
        match deps.pull_requests.open_pull_request(&branch, title, &body) {
            Ok(pr) => run.result.pr = Some(pr),
            Err(err @ PullRequestError::MissingConfig(_)) => return Err(err.into()),
            Err(err) => return Ok(run.fail(TaskStage::Pr, err.to_string())),
        }
    }

    info!(branch = %branch, "task promoted");
    Ok(run.finish(TaskStage::Done, true))
}

/// Store directory as a `/`-terminated path relative to `root`, if it lives inside it.
fn store_prefix(root: &Path, store_dir: &Path) -> Option<String> {
    let rel = store_dir.strip_prefix(root).ok()?;
    let rel = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    (!rel.is_empty()).then(|| format!("{rel}/"))
}

fn pr_summary(goal: &str, result: &TaskResult) -> String {
    let mut body = format!(
        "Automated change for: {goal}\n\nPlaybook: `{}`\n",
        result.playbook.as_str()
    );
    body.push_str("\nFiles:\n");
    for file in &result.files {
        body.push_str(&format!("- `{file}`\n"));
    }
    if let Some(verdict) = &result.verdict {
        let status = |check: &Option<ToolOutput>| match check {
            Some(output) if output.ok => "passed",
            Some(_) => "failed",
            None => "not run",
        };
        body.push_str(&format!(
            "\nValidated in an isolated worktree: lint {}, tests {}.\n",
            status(&verdict.lint),
            status(&verdict.tests)
        ));
    }
    body
}
