//! Validate-then-promote pipeline for machine-generated code changes.
//!
//! Every command prints one JSON document to stdout. Diagnostics go to stderr
//! through `tracing` (`RUST_LOG`).

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use patchgate::apply::{apply_stored_bundle, apply_stored_patch};
use patchgate::core::diff_split::split_into_items;
use patchgate::core::policy::Policy;
use patchgate::core::types::BundleItem;
use patchgate::exit_codes;
use patchgate::io::config::{ToolConfig, resolve_config};
use patchgate::io::git::Git;
use patchgate::io::github::{GitHubClient, PullRequestService};
use patchgate::io::index::{build_index, save_repo_map};
use patchgate::io::model::HttpDiffGenerator;
use patchgate::io::policy_file::load_policy;
use patchgate::io::qa::{CommandQaRunner, QaRunner};
use patchgate::io::repo_fs::{list_files, read_file, search_code};
use patchgate::io::store::PatchStore;
use patchgate::logging;
use patchgate::task::{TaskDeps, TaskRequest, run_task};

const STDIN_MARKER: &str = "-";

#[derive(Parser)]
#[command(
    name = "patchgate",
    version,
    about = "Validate code changes in a sandbox before promoting them"
)]
struct Cli {
    /// Repository to operate on (any directory inside it).
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,
    /// Tool config (default: `<repo>/.patchgate/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Policy file (default: `<repo>/.patchgate/policy.toml`).
    #[arg(long, global = true)]
    policy: Option<PathBuf>,
    /// Exit with a dedicated code when the result reports a failed stage.
    #[arg(long, global = true)]
    fail_on_error: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List files, optionally filtered by a glob.
    Ls {
        pattern: Option<String>,
    },
    /// Print a file, or the `[start, end)` line slice of it.
    Cat {
        path: PathBuf,
        #[arg(long)]
        start: Option<usize>,
        #[arg(long)]
        end: Option<usize>,
    },
    /// Regex search over text files.
    Search {
        pattern: String,
        #[arg(long, default_value_t = 200)]
        max: usize,
    },
    /// Store a single-file patch.
    Propose {
        #[arg(long)]
        file: String,
        /// Diff file, or `-` for stdin.
        #[arg(long, default_value = STDIN_MARKER)]
        diff: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Validate a stored patch in a sandbox.
    Apply {
        id: String,
        #[arg(long, default_value = "HEAD")]
        reference: String,
    },
    /// Delete a stored patch or bundle.
    Discard {
        id: String,
    },
    /// Store a bundle from a JSON item list or by splitting a multi-file diff.
    Bundle {
        /// JSON array of `{file, diff, description}`.
        #[arg(long, conflicts_with = "diff")]
        items: Option<PathBuf>,
        /// Multi-file diff, or `-` for stdin.
        #[arg(long)]
        diff: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Validate a stored bundle in a sandbox.
    ApplyBundle {
        id: String,
        #[arg(long, default_value = "HEAD")]
        reference: String,
    },
    /// Run the detected (or configured) linter in the repository.
    Lint {
        /// Path handed to the linter instead of the whole repository.
        #[arg(long)]
        scope: Option<String>,
    },
    /// Run the detected (or configured) test command in the repository.
    Test {
        /// Path or test selector appended to the test command.
        #[arg(long)]
        scope: Option<String>,
    },
    /// Index symbols and imports of Python and JS/TS sources.
    Index,
    /// Find definitions by exact name.
    Symbol {
        name: String,
    },
    /// Print the file -> imports adjacency list.
    Deps,
    /// Write the index to `.patchgate/cache/map.json`.
    Summarize,
    /// Generate, validate and promote a change for a goal.
    Task {
        #[arg(long)]
        goal: String,
        /// Context hints: files, directories or globs.
        #[arg(long, num_args = 1.., value_delimiter = ',')]
        hints: Vec<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        auto_pr: bool,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        pr_title: Option<String>,
        #[arg(long)]
        pr_body: Option<String>,
        #[arg(long)]
        max_files: Option<usize>,
        #[arg(long)]
        time_budget_sec: Option<u64>,
        /// Require lint and tests and report both failures.
        #[arg(long)]
        strict_checks: bool,
        #[arg(long, default_value = "HEAD")]
        reference: String,
    },
    /// Open a pull request for an already pushed branch.
    Pr {
        #[arg(long)]
        branch: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        body: String,
    },
    /// Comment on a pull request.
    Comment {
        #[arg(long)]
        number: u64,
        #[arg(long)]
        body: String,
    },
}

/// Repository root, effective config and policy for one invocation.
struct Env {
    root: PathBuf,
    config: ToolConfig,
    policy: Policy,
}

impl Env {
    fn resolve(cli: &Cli) -> Result<Self> {
        let root = Git::new(&cli.repo)
            .toplevel()
            .unwrap_or_else(|_| cli.repo.clone());
        let config = resolve_config(&root, cli.config.as_deref(), |key| std::env::var(key).ok())?;
        let policy = load_policy(&root, cli.policy.as_deref());
        Ok(Self {
            root,
            config,
            policy,
        })
    }

    fn store(&self) -> PatchStore {
        PatchStore::new(self.config.store_path(&self.root))
    }

    fn qa(&self) -> CommandQaRunner {
        CommandQaRunner::new(&self.config.qa)
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => {
            if code != exit_codes::OK {
                std::process::exit(code);
            }
        }
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let env = Env::resolve(&cli)?;
    let fail_on_error = cli.fail_on_error;
    let ok = match cli.command {
        Command::Ls { pattern } => {
            emit(&list_files(&env.root, pattern.as_deref())?)?;
            true
        }
        Command::Cat { path, start, end } => {
            let path = resolve_in_repo(&env.root, &path);
            let lines = match (start, end) {
                (None, None) => None,
                (start, end) => Some((start.unwrap_or(0), end.unwrap_or(usize::MAX))),
            };
            let content = read_file(&path, lines)?;
            emit(&json!({ "path": path, "content": content }))?;
            true
        }
        Command::Search { pattern, max } => {
            emit(&search_code(&env.root, &pattern, max)?)?;
            true
        }
        Command::Propose {
            file,
            diff,
            description,
        } => {
            let diff = read_input(&diff)?;
            let id = env.store().propose(&file, &diff, &description)?;
            emit(&json!({ "id": id }))?;
            true
        }
        Command::Apply { id, reference } => {
            let verdict = apply_stored_patch(
                &env.store(),
                &id,
                &env.root,
                &reference,
                &env.policy,
                &env.qa(),
            )?;
            emit(&verdict)?;
            verdict.applied
        }
        Command::Discard { id } => {
            let discarded = env.store().discard(&id)?;
            emit(&json!({ "id": id, "discarded": discarded }))?;
            true
        }
        Command::Bundle {
            items,
            diff,
            description,
        } => {
            let items = match (items, diff) {
                (Some(path), None) => read_items(&path)?,
                (None, Some(diff)) => split_into_items(&read_input(&diff)?, &description),
                _ => bail!("bundle requires exactly one of --items or --diff"),
            };
            let files: Vec<String> = items.iter().map(|item| item.file.clone()).collect();
            let id = env.store().propose_bundle(items, &description)?;
            emit(&json!({ "id": id, "files": files }))?;
            true
        }
        Command::ApplyBundle { id, reference } => {
            let verdict = apply_stored_bundle(
                &env.store(),
                &id,
                &env.root,
                &reference,
                &env.policy,
                &env.qa(),
            )?;
            emit(&verdict)?;
            verdict.applied
        }
        Command::Lint { scope } => {
            let output = env.qa().with_scope(scope).run_lint(&env.root)?;
            emit(&output)?;
            output.ok
        }
        Command::Test { scope } => {
            let output = env.qa().with_scope(scope).run_tests(&env.root)?;
            emit(&output)?;
            output.ok
        }
        Command::Index => {
            emit(&build_index(&env.root)?)?;
            true
        }
        Command::Symbol { name } => {
            emit(&build_index(&env.root)?.find_symbol(&name))?;
            true
        }
        Command::Deps => {
            emit(build_index(&env.root)?.dependency_graph())?;
            true
        }
        Command::Summarize => {
            let path = save_repo_map(&env.root, &build_index(&env.root)?)?;
            emit(&json!({ "path": path }))?;
            true
        }
        Command::Task {
            goal,
            hints,
            dry_run,
            auto_pr,
            branch,
            pr_title,
            pr_body,
            max_files,
            time_budget_sec,
            strict_checks,
            reference,
        } => {
            let mut request = TaskRequest::new(goal, &env.config);
            request.hints = hints;
            request.dry_run = dry_run;
            request.auto_pr = auto_pr;
            request.branch = branch;
            request.pr_title = pr_title;
            request.pr_body = pr_body;
            request.strict_checks = strict_checks;
            request.reference = reference;
            if let Some(max_files) = max_files {
                request.max_files = max_files;
            }
            if let Some(secs) = time_budget_sec {
                request.time_budget = Duration::from_secs(secs);
            }

            let generator = HttpDiffGenerator::new(&env.config.model)?;
            let pull_requests = GitHubClient::new(&env.config.github)?;
            let result = run_task(
                &env.root,
                &env.config,
                &env.policy,
                &request,
                TaskDeps {
                    generator: &generator,
                    qa: &env.qa(),
                    pull_requests: &pull_requests,
                },
            )?;
            emit(&result)?;
            result.ok
        }
        Command::Pr {
            branch,
            title,
            body,
        } => {
            let client = GitHubClient::new(&env.config.github)?;
            emit(&client.open_pull_request(&branch, &title, &body)?)?;
            true
        }
        Command::Comment { number, body } => {
            let client = GitHubClient::new(&env.config.github)?;
            emit(&client.comment(number, &body)?)?;
            true
        }
    };

    if !ok && fail_on_error {
        return Ok(exit_codes::STAGE_FAILED);
    }
    Ok(exit_codes::OK)
}

/// Print `value` as pretty JSON to stdout.
fn emit<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

/// Read a path argument, or stdin for `-`.
fn read_input(source: &str) -> Result<String> {
    if source == STDIN_MARKER {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read diff from stdin")?;
        return Ok(buf);
    }
    fs::read_to_string(source).with_context(|| format!("read {source}"))
}

fn read_items(path: &Path) -> Result<Vec<BundleItem>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse bundle items {}", path.display()))
}

fn resolve_in_repo(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
