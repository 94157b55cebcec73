//! Test-only fixtures: throwaway git repositories and scripted collaborators.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::types::{PullRequest, ToolOutput};
use crate::io::github::{PullRequestComment, PullRequestError, PullRequestService};
use crate::io::qa::QaRunner;

pub const README_CONTENTS: &str = "# Demo\n";

/// A temporary git repository with one commit (`README.md`) on `main`.
pub struct TestRepo {
    dir: TempDir,
    remote: Option<TempDir>,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create repo tempdir")?;
        let repo = Self { dir, remote: None };
        repo.git(&["init", "-q", "--initial-branch=main"])?;
        repo.git(&["config", "user.email", "test@example.com"])?;
        repo.git(&["config", "user.name", "test"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        repo.write("README.md", README_CONTENTS)?;
        repo.commit_all("initial commit")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Attach a bare repository as `origin`.
    pub fn add_bare_remote(&mut self) -> Result<PathBuf> {
        let remote = tempfile::tempdir().context("create remote tempdir")?;
        let status = Command::new("git")
            .args(["init", "-q", "--bare"])
            .current_dir(remote.path())
            .status()
            .context("git init --bare")?;
        if !status.success() {
            return Err(anyhow!("git init --bare failed"));
        }
        let url = remote.path().to_string_lossy().into_owned();
        self.git(&["remote", "add", "origin", &url])?;
        let path = remote.path().to_path_buf();
        self.remote = Some(remote);
        Ok(path)
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path().join(rel)).unwrap_or_else(|err| panic!("read {rel}: {err}"))
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.git(&["add", "-A"])?;
        self.git(&["commit", "-q", "-m", message])?;
        Ok(())
    }

    pub fn head(&self) -> String {
        self.git(&["rev-parse", "HEAD"])
            .map(|out| out.trim().to_string())
            .unwrap_or_else(|err| panic!("rev-parse HEAD: {err:#}"))
    }

    pub fn current_branch(&self) -> String {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"])
            .map(|out| out.trim().to_string())
            .unwrap_or_else(|err| panic!("current branch: {err:#}"))
    }

    pub fn last_commit_subject(&self) -> String {
        self.git(&["log", "-1", "--format=%s"])
            .map(|out| out.trim().to_string())
            .unwrap_or_else(|err| panic!("git log: {err:#}"))
    }

    /// True if the bare remote has `branch`.
    pub fn remote_has_branch(&self, branch: &str) -> bool {
        let Some(remote) = &self.remote else {
            return false;
        };
        Command::new("git")
            .args(["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .current_dir(remote.path())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    /// Diff appending `line` to the committed README.
    pub fn readme_append_diff(&self, line: &str) -> String {
        format!(
            "diff --git a/README.md b/README.md\n--- a/README.md\n+++ b/README.md\n@@ -1 +1,2 @@\n # Demo\n+{line}\n"
        )
    }

    /// Diff creating `rel` with one line.
    pub fn new_file_diff(&self, rel: &str, line: &str) -> String {
        format!(
            "diff --git a/{rel} b/{rel}\nnew file mode 100644\n--- /dev/null\n+++ b/{rel}\n@@ -0,0 +1 @@\n+{line}\n"
        )
    }

    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Scripted outcome for one QA check.
#[derive(Debug, Clone)]
pub enum ScriptedCheck {
    Output(ToolOutput),
    /// The runner itself fails (e.g. the binary is missing).
    Error(String),
}

impl ScriptedCheck {
    pub fn pass(stdout: &str) -> Self {
        ScriptedCheck::Output(ToolOutput {
            ok: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
            code: Some(0),
        })
    }

    pub fn fail(stderr: &str) -> Self {
        ScriptedCheck::Output(ToolOutput {
            ok: false,
            stdout: String::new(),
            stderr: stderr.to_string(),
            code: Some(1),
        })
    }
}

/// QA runner returning fixed outcomes and recording each call with the
/// working copy it ran in.
pub struct ScriptedQa {
    lint: ScriptedCheck,
    tests: ScriptedCheck,
    calls: RefCell<Vec<(String, PathBuf)>>,
}

impl ScriptedQa {
    pub fn new(lint: ScriptedCheck, tests: ScriptedCheck) -> Self {
        Self {
            lint,
            tests,
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn passing() -> Self {
        Self::new(ScriptedCheck::pass("lint ok"), ScriptedCheck::pass("tests ok"))
    }

    /// Names of the checks run so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|(name, _)| name.clone()).collect()
    }

    /// Working copies the checks ran in.
    pub fn workdirs(&self) -> Vec<PathBuf> {
        self.calls.borrow().iter().map(|(_, dir)| dir.clone()).collect()
    }

    fn respond(&self, name: &str, workdir: &Path, check: &ScriptedCheck) -> Result<ToolOutput> {
        self.calls
            .borrow_mut()
            .push((name.to_string(), workdir.to_path_buf()));
        match check {
            ScriptedCheck::Output(output) => Ok(output.clone()),
            ScriptedCheck::Error(message) => Err(anyhow!("{message}")),
        }
    }
}

impl QaRunner for ScriptedQa {
    fn run_lint(&self, workdir: &Path) -> Result<ToolOutput> {
        self.respond("lint", workdir, &self.lint)
    }

    fn run_tests(&self, workdir: &Path) -> Result<ToolOutput> {
        self.respond("tests", workdir, &self.tests)
    }
}

/// Pull-request service that records requests instead of calling an API.
#[derive(Default)]
pub struct RecordingPullRequests {
    fail_with: Option<FailMode>,
    opened: RefCell<Vec<(String, String, String)>>,
    comments: RefCell<Vec<(u64, String)>>,
}

#[derive(Debug, Clone, Copy)]
enum FailMode {
    MissingToken,
    Http(u16),
}

impl RecordingPullRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn missing_token() -> Self {
        Self {
            fail_with: Some(FailMode::MissingToken),
            ..Self::default()
        }
    }

    pub fn http_failure(status: u16) -> Self {
        Self {
            fail_with: Some(FailMode::Http(status)),
            ..Self::default()
        }
    }

    /// `(branch, title, body)` for each opened pull request.
    pub fn opened(&self) -> Vec<(String, String, String)> {
        self.opened.borrow().clone()
    }

    pub fn comments(&self) -> Vec<(u64, String)> {
        self.comments.borrow().clone()
    }

    fn check(&self) -> Result<(), PullRequestError> {
        match self.fail_with {
            None => Ok(()),
            Some(FailMode::MissingToken) => Err(PullRequestError::MissingConfig("GITHUB_TOKEN")),
            Some(FailMode::Http(status)) => Err(PullRequestError::Http {
                status: Some(status),
                message: "scripted failure".to_string(),
            }),
        }
    }
}

impl PullRequestService for RecordingPullRequests {
    fn ensure_configured(&self) -> Result<(), PullRequestError> {
        match self.fail_with {
            Some(FailMode::MissingToken) => Err(PullRequestError::MissingConfig("GITHUB_TOKEN")),
            _ => Ok(()),
        }
    }

    fn open_pull_request(
        &self,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest, PullRequestError> {
        self.check()?;
        let mut opened = self.opened.borrow_mut();
        opened.push((branch.to_string(), title.to_string(), body.to_string()));
        let number = opened.len() as u64;
        Ok(PullRequest {
            number,
            url: Some(format!("https://example.test/pull/{number}")),
        })
    }

    fn comment(&self, number: u64, body: &str) -> Result<PullRequestComment, PullRequestError> {
        self.check()?;
        let mut comments = self.comments.borrow_mut();
        comments.push((number, body.to_string()));
        Ok(PullRequestComment {
            id: comments.len() as u64,
            url: None,
        })
    }
}

/// Diff generator closure that always returns `diff`.
pub fn static_diff(
    diff: impl Into<String>,
) -> impl Fn(&str, &BTreeMap<String, String>) -> Result<String> {
    let diff = diff.into();
    move |_goal: &str, _context: &BTreeMap<String, String>| Ok(diff.clone())
}

/// Minimal HTTP server answering exactly one request with a canned JSON body.
pub struct OneShotHttpServer {
    addr: String,
    handle: JoinHandle<String>,
}

impl OneShotHttpServer {
    pub fn start(status: u16, body: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let addr = listener.local_addr().expect("local addr").to_string();
        let body = body.to_string();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let request = read_request(&mut stream);
            let response = format!(
                "HTTP/1.1 {status} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).expect("write response");
            request
        });
        Self { addr, handle }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Wait for the request and return it (request line, headers, body).
    pub fn request(self) -> String {
        self.handle.join().expect("server thread")
    }
}

fn read_request(stream: &mut impl Read) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(header_end) = find_subslice(&buf, b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
            let length = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= header_end + 4 + length {
                break;
            }
        }
        let n = stream.read(&mut chunk).expect("read request");
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
