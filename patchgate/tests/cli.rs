//! CLI tests for the `patchgate` binary.
//!
//! Spawns the binary against temporary repositories and checks the JSON on
//! stdout together with the exit code.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use patchgate::exit_codes;
use patchgate::test_support::{OneShotHttpServer, README_CONTENTS, TestRepo};
use serde_json::Value;

const ENV_KEYS: &[&str] = &[
    "PATCHGATE_STORE_DIR",
    "MODEL_PROVIDER",
    "MODEL_NAME",
    "MODEL_ENDPOINT",
    "API_KEY",
    "GITHUB_TOKEN",
    "GITHUB_REPO",
    "DEFAULT_BRANCH",
    "HTTP_PROXY",
    "http_proxy",
    "ALL_PROXY",
    "all_proxy",
];

fn patchgate(repo: &Path, args: &[&str], env: &[(&str, &str)]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_patchgate"));
    cmd.arg("--repo").arg(repo).args(args);
    for key in ENV_KEYS {
        cmd.env_remove(key);
    }
    cmd.envs(env.iter().copied());
    cmd.output().expect("spawn patchgate")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
        panic!(
            "stdout is not json ({err}): {}\nstderr: {}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

#[test]
fn propose_apply_and_discard_a_patch() {
    let repo = TestRepo::new().expect("repo");
    let scratch = tempfile::tempdir().expect("scratch");
    let diff_path = scratch.path().join("change.diff");
    fs::write(&diff_path, repo.readme_append_diff("from cli")).expect("write diff");

    let output = patchgate(
        repo.path(),
        &[
            "propose",
            "--file",
            "README.md",
            "--diff",
            diff_path.to_str().expect("utf-8 path"),
        ],
        &[],
    );
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let id = stdout_json(&output)["id"]
        .as_str()
        .expect("id")
        .to_string();
    assert!(id.starts_with("patch_"));

    let output = patchgate(repo.path(), &["apply", &id], &[]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let verdict = stdout_json(&output);
    assert_eq!(verdict["applied"], true);
    assert_eq!(verdict["stage"], "done");
    assert_eq!(repo.read("README.md"), README_CONTENTS);

    let output = patchgate(repo.path(), &["discard", &id], &[]);
    assert_eq!(stdout_json(&output)["discarded"], true);
    let output = patchgate(repo.path(), &["discard", &id], &[]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout_json(&output)["discarded"], false);
}

#[test]
fn failed_verdict_exit_code_is_opt_in() {
    let repo = TestRepo::new().expect("repo");
    let items = serde_json::json!([
        {"file": "README.md", "diff": repo.readme_append_diff("x")},
        {"file": "yarn.lock", "diff": repo.new_file_diff("yarn.lock", "y")},
    ]);
    let items_path = repo.path().join(".patchgate/items.json");
    fs::create_dir_all(items_path.parent().expect("parent")).expect("mkdir");
    fs::write(&items_path, items.to_string()).expect("write items");

    let output = patchgate(
        repo.path(),
        &["bundle", "--items", items_path.to_str().expect("utf-8 path")],
        &[],
    );
    let created = stdout_json(&output);
    let id = created["id"].as_str().expect("id").to_string();
    assert_eq!(created["files"], serde_json::json!(["README.md", "yarn.lock"]));

    let output = patchgate(repo.path(), &["apply-bundle", &id], &[]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let verdict = stdout_json(&output);
    assert_eq!(verdict["applied"], false);
    assert_eq!(verdict["stage"], "policy");
    assert_eq!(verdict["policy_violation"]["file"], "yarn.lock");

    let output = patchgate(repo.path(), &["--fail-on-error", "apply-bundle", &id], &[]);
    assert_eq!(output.status.code(), Some(exit_codes::STAGE_FAILED));
}

#[test]
fn unknown_record_exits_invalid() {
    let repo = TestRepo::new().expect("repo");
    let output = patchgate(repo.path(), &["apply", "patch_doesnotexist"], &[]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(!output.stderr.is_empty());
}

#[test]
fn task_dry_run_uses_configured_http_generator() {
    let repo = TestRepo::new().expect("repo");
    let diff = repo.readme_append_diff("generated");
    let body = serde_json::json!({ "diff": diff }).to_string();
    let server = OneShotHttpServer::start(200, &body);
    let endpoint = server.url();

    let output = patchgate(
        repo.path(),
        &["task", "--goal", "Append line to README", "--dry-run"],
        &[("MODEL_PROVIDER", "http"), ("MODEL_ENDPOINT", &endpoint)],
    );
    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let result = stdout_json(&output);
    assert_eq!(result["ok"], true);
    assert_eq!(result["stage"], "done");
    assert_eq!(result["dry_run"], true);
    assert_eq!(result["verdict"]["applied"], true);
    assert!(result.get("branch").is_none());

    assert!(server.request().contains("Append line to README"));
    assert_eq!(repo.read("README.md"), README_CONTENTS);
}

#[test]
fn pr_without_token_exits_invalid() {
    let repo = TestRepo::new().expect("repo");
    let output = patchgate(
        repo.path(),
        &["pr", "--branch", "feature", "--title", "t"],
        &[("GITHUB_REPO", "acme/widgets")],
    );
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("GITHUB_TOKEN is not set"));
}

#[test]
fn symbol_and_deps_come_from_the_index() {
    let repo = TestRepo::new().expect("repo");
    repo.write("app/models.py", "import os\n\nclass User:\n    pass\n")
        .expect("write");
    repo.write("web/index.js", "const api = require('./api');\n")
        .expect("write");

    let output = patchgate(repo.path(), &["symbol", "User"], &[]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let found = stdout_json(&output);
    assert_eq!(
        found,
        serde_json::json!([{"name": "User", "kind": "class", "file": "app/models.py", "line": 3}])
    );

    let output = patchgate(repo.path(), &["deps"], &[]);
    let deps = stdout_json(&output);
    assert_eq!(deps["app/models.py"], serde_json::json!(["os"]));
    assert_eq!(deps["web/index.js"], serde_json::json!(["./api"]));
}

#[test]
fn summarize_writes_an_ignored_repo_map() {
    let repo = TestRepo::new().expect("repo");
    repo.write("lib.py", "def main():\n    pass\n").expect("write");
    repo.commit_all("lib").expect("commit");

    let output = patchgate(repo.path(), &["summarize"], &[]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let path = stdout_json(&output)["path"]
        .as_str()
        .expect("path")
        .to_string();
    assert!(path.ends_with(".patchgate/cache/map.json"));
    let map: Value = serde_json::from_str(&fs::read_to_string(&path).expect("read map"))
        .expect("map json");
    assert_eq!(map["files"]["lib.py"]["symbols"][0]["name"], "main");

    let status = repo.git(&["status", "--porcelain"]).expect("status");
    assert!(status.trim().is_empty(), "{status}");
}

#[test]
fn scope_is_forwarded_to_configured_checks() {
    let repo = TestRepo::new().expect("repo");
    repo.write(
        ".patchgate/config.toml",
        "[qa]\nlint_command = [\"echo\", \"linting\"]\ntest_command = [\"echo\", \"testing\"]\n",
    )
    .expect("write config");

    let output = patchgate(repo.path(), &["lint", "--scope", "src/app"], &[]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout_json(&output)["stdout"], "linting src/app\n");

    let output = patchgate(repo.path(), &["test", "--scope", "tests/unit"], &[]);
    assert_eq!(stdout_json(&output)["stdout"], "testing tests/unit\n");
}
