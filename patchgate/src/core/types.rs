//! Shared deterministic types for the change pipeline.
//!
//! These types define the stable JSON contracts printed by the CLI and
//! persisted by the store. They carry no I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single-file change as supplied by a caller or recovered by the diff splitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleItem {
    /// Repository-relative path the diff targets.
    pub file: String,
    /// Unified diff text, applied verbatim.
    pub diff: String,
    #[serde(default)]
    pub description: String,
}

impl BundleItem {
    pub fn new(file: impl Into<String>, diff: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            diff: diff.into(),
            description: description.into(),
        }
    }
}

/// A proposed single-file patch (`patch_` id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub id: String,
    pub file: String,
    pub diff: String,
    #[serde(default)]
    pub description: String,
    pub created_at: String,
}

impl Patch {
    /// View this patch as a one-item bundle so it can flow through the apply pipeline.
    pub fn into_bundle(self) -> Bundle {
        let item = BundleItem::new(self.file, self.diff, self.description.clone());
        Bundle {
            id: self.id,
            description: self.description,
            items: vec![item],
            created_at: self.created_at,
        }
    }
}

/// An ordered set of changes applied as one unit (`bundle_` id).
///
/// Item order is application order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub items: Vec<BundleItem>,
    pub created_at: String,
}

impl Bundle {
    pub fn files(&self) -> Vec<String> {
        self.items.iter().map(|item| item.file.clone()).collect()
    }
}

/// Captured result of an external tool or check (`git apply`, lint, tests).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
    /// Process exit code, if the process exited normally.
    pub code: Option<i32>,
}

impl ToolOutput {
    /// Successful result carrying an informational message (nothing was run).
    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            stdout: message.into(),
            stderr: String::new(),
            code: Some(0),
        }
    }

    /// Failed result for a tool that could not be run at all.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            stdout: String::new(),
            stderr: message.into(),
            code: None,
        }
    }
}

/// Terminal stage of one apply pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyStage {
    /// The isolated working copy could not be created.
    Sandbox,
    Policy,
    DryRun,
    Apply,
    Qa,
    Done,
}

impl ApplyStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ApplyStage::Sandbox => "sandbox",
            ApplyStage::Policy => "policy",
            ApplyStage::DryRun => "dry-run",
            ApplyStage::Apply => "apply",
            ApplyStage::Qa => "qa",
            ApplyStage::Done => "done",
        }
    }
}

impl fmt::Display for ApplyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protected path hit reported by the policy gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyViolation {
    /// Position of the offending item in the bundle (0-based).
    pub index: usize,
    pub file: String,
    /// Pattern or sensitive segment that matched.
    pub rule: String,
}

/// Per-item `git apply` failure with the tool's diagnostics attached verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub index: usize,
    pub file: String,
    pub output: ToolOutput,
}

/// Immutable outcome of one apply pipeline run.
///
/// `applied == true` only when every item dry-ran and applied, no item was
/// protected, and every required check passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub applied: bool,
    pub stage: ApplyStage,
    /// Number of items applied inside the sandbox before the run ended.
    pub items_applied: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_violation: Option<PolicyViolation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_failure: Option<ItemFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lint: Option<ToolOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<ToolOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Verdict {
    fn failed(stage: ApplyStage, items_applied: usize) -> Self {
        Self {
            applied: false,
            stage,
            items_applied,
            policy_violation: None,
            item_failure: None,
            lint: None,
            tests: None,
            error: None,
        }
    }

    pub fn sandbox(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::failed(ApplyStage::Sandbox, 0)
        }
    }

    pub fn policy(violation: PolicyViolation) -> Self {
        Self {
            error: Some(format!(
                "protected path: {} (rule '{}')",
                violation.file, violation.rule
            )),
            policy_violation: Some(violation),
            ..Self::failed(ApplyStage::Policy, 0)
        }
    }

    pub fn empty_bundle() -> Self {
        Self {
            error: Some("bundle has no items".to_string()),
            ..Self::failed(ApplyStage::DryRun, 0)
        }
    }

    pub fn dry_run(failure: ItemFailure, items_applied: usize) -> Self {
        Self {
            item_failure: Some(failure),
            ..Self::failed(ApplyStage::DryRun, items_applied)
        }
    }

    pub fn apply(failure: ItemFailure, items_applied: usize) -> Self {
        Self {
            item_failure: Some(failure),
            ..Self::failed(ApplyStage::Apply, items_applied)
        }
    }

    /// `tests` is `None` when a failing lint short-circuited the run.
    pub fn qa(lint: ToolOutput, tests: Option<ToolOutput>, items_applied: usize) -> Self {
        Self {
            lint: Some(lint),
            tests,
            ..Self::failed(ApplyStage::Qa, items_applied)
        }
    }

    pub fn done(lint: ToolOutput, tests: ToolOutput, items_applied: usize) -> Self {
        Self {
            applied: true,
            lint: Some(lint),
            tests: Some(tests),
            ..Self::failed(ApplyStage::Done, items_applied)
        }
    }
}

/// Terminal stage of one task orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStage {
    Plan,
    Sandbox,
    Policy,
    DryRun,
    Apply,
    Qa,
    Branch,
    ApplyWorking,
    Stage,
    Commit,
    Push,
    Pr,
    Done,
}

impl TaskStage {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStage::Plan => "plan",
            TaskStage::Sandbox => "sandbox",
            TaskStage::Policy => "policy",
            TaskStage::DryRun => "dry-run",
            TaskStage::Apply => "apply",
            TaskStage::Qa => "qa",
            TaskStage::Branch => "branch",
            TaskStage::ApplyWorking => "apply-working",
            TaskStage::Stage => "stage",
            TaskStage::Commit => "commit",
            TaskStage::Push => "push",
            TaskStage::Pr => "pr",
            TaskStage::Done => "done",
        }
    }
}

impl From<ApplyStage> for TaskStage {
    fn from(stage: ApplyStage) -> Self {
        match stage {
            ApplyStage::Sandbox => TaskStage::Sandbox,
            ApplyStage::Policy => TaskStage::Policy,
            ApplyStage::DryRun => TaskStage::DryRun,
            ApplyStage::Apply => TaskStage::Apply,
            ApplyStage::Qa => TaskStage::Qa,
            ApplyStage::Done => TaskStage::Done,
        }
    }
}

impl fmt::Display for TaskStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to an opened pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}
