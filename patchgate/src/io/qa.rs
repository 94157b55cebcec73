//! Lint and test runners for the QA gate.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::core::types::ToolOutput;
use crate::io::config::QaConfig;
use crate::io::process::run_command_with_timeout;

pub const NO_TESTS_MESSAGE: &str = "No tests detected; skipping.";
pub const NO_LINT_MESSAGE: &str = "No linter detected; skipping.";

/// Runs the repository's checks inside a working copy.
pub trait QaRunner {
    fn run_lint(&self, workdir: &Path) -> Result<ToolOutput>;
    fn run_tests(&self, workdir: &Path) -> Result<ToolOutput>;
}

impl<T: QaRunner + ?Sized> QaRunner for &T {
    fn run_lint(&self, workdir: &Path) -> Result<ToolOutput> {
        (**self).run_lint(workdir)
    }

    fn run_tests(&self, workdir: &Path) -> Result<ToolOutput> {
        (**self).run_tests(workdir)
    }
}

/// Toolchain detected from marker files at the working-copy root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectKind {
    Python,
    Node,
    None,
}

const NODE_MARKERS: &[&str] = &["package.json"];
const PYTHON_MARKERS: &[&str] = &["pyproject.toml", "pytest.ini", "ruff.toml", "setup.cfg"];

impl ProjectKind {
    pub fn detect(workdir: &Path) -> Self {
        let has_any = |markers: &[&str]| markers.iter().any(|m| workdir.join(m).is_file());
        if has_any(NODE_MARKERS) {
            ProjectKind::Node
        } else if has_any(PYTHON_MARKERS) {
            ProjectKind::Python
        } else {
            ProjectKind::None
        }
    }

    pub fn lint_command(self) -> Option<&'static [&'static str]> {
        match self {
            ProjectKind::Python => Some(&["ruff", "check", "."]),
            ProjectKind::Node => Some(&["npm", "run", "lint"]),
            ProjectKind::None => None,
        }
    }

    pub fn test_command(self) -> Option<&'static [&'static str]> {
        match self {
            ProjectKind::Python => Some(&["pytest", "-q"]),
            ProjectKind::Node => Some(&["npm", "test"]),
            ProjectKind::None => None,
        }
    }

    /// Lint argv narrowed to `scope`: ruff checks the scope instead of `.`,
    /// npm forwards it after `--`.
    pub fn scoped_lint_command(self, scope: Option<&str>) -> Option<Vec<String>> {
        let mut argv = to_argv(self.lint_command())?;
        if let Some(scope) = scope {
            match self {
                ProjectKind::Python => {
                    argv.pop();
                    argv.push(scope.to_string());
                }
                ProjectKind::Node => argv.extend(["--".to_string(), scope.to_string()]),
                ProjectKind::None => {}
            }
        }
        Some(argv)
    }

    /// Test argv with `scope` appended as the last argument.
    pub fn scoped_test_command(self, scope: Option<&str>) -> Option<Vec<String>> {
        let mut argv = to_argv(self.test_command())?;
        argv.extend(scope.map(str::to_string));
        Some(argv)
    }
}

/// Runs detected (or configured) commands as subprocesses.
#[derive(Debug, Clone)]
pub struct CommandQaRunner {
    timeout: Duration,
    output_limit_bytes: usize,
    lint_override: Option<Vec<String>>,
    test_override: Option<Vec<String>>,
    scope: Option<String>,
}

impl CommandQaRunner {
    pub fn new(config: &QaConfig) -> Self {
        Self {
            timeout: config.timeout(),
            output_limit_bytes: config.output_limit_bytes,
            lint_override: config.lint_command.clone(),
            test_override: config.test_command.clone(),
            scope: None,
        }
    }

    /// Narrow both checks to a path or test selector. Configured commands get
    /// the scope appended as their last argument.
    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope.filter(|scope| !scope.trim().is_empty());
        self
    }

    fn override_with_scope(&self, argv: &[String]) -> Vec<String> {
        let mut argv = argv.to_vec();
        argv.extend(self.scope.clone());
        argv
    }

    fn run_check(
        &self,
        label: &str,
        workdir: &Path,
        command: Option<Vec<String>>,
        skip_message: &str,
    ) -> Result<ToolOutput> {
        let Some(argv) = command else {
            info!(check = label, "nothing to run");
            return Ok(ToolOutput::skipped(skip_message));
        };
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("{label} command is empty"))?;
        debug!(check = label, command = %argv.join(" "), "running check");

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(workdir);
        let output = run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)?;
        let report = output.into_tool_output(label);
        info!(check = label, ok = report.ok, code = ?report.code, "check finished");
        Ok(report)
    }
}

impl QaRunner for CommandQaRunner {
    #[instrument(skip_all, fields(workdir = %workdir.display()))]
    fn run_lint(&self, workdir: &Path) -> Result<ToolOutput> {
        let scope = self.scope.as_deref();
        let command = match &self.lint_override {
            Some(argv) => Some(self.override_with_scope(argv)),
            None => ProjectKind::detect(workdir).scoped_lint_command(scope),
        };
        self.run_check("lint", workdir, command, NO_LINT_MESSAGE)
    }

    #[instrument(skip_all, fields(workdir = %workdir.display()))]
    fn run_tests(&self, workdir: &Path) -> Result<ToolOutput> {
        let scope = self.scope.as_deref();
        let command = match &self.test_override {
            Some(argv) => Some(self.override_with_scope(argv)),
            None => ProjectKind::detect(workdir).scoped_test_command(scope),
        };
        self.run_check("tests", workdir, command, NO_TESTS_MESSAGE)
    }
}

fn to_argv(template: Option<&[&str]>) -> Option<Vec<String>> {
    template.map(|parts| parts.iter().map(|part| (*part).to_string()).collect())
}
