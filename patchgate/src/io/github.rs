//! Pull-request service backed by the GitHub REST API.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::core::types::PullRequest;
use crate::io::config::GitHubConfig;

const USER_AGENT: &str = concat!("patchgate/", env!("CARGO_PKG_VERSION"));
const API_VERSION: &str = "2022-11-28";

#[derive(Debug, Error)]
pub enum PullRequestError {
    /// Raised before any request is made; callers surface it instead of
    /// reporting a stage failure.
    #[error("{0} is not set")]
    MissingConfig(&'static str),

    #[error("github request failed (status {}): {message}", status.map_or_else(|| "none".to_string(), |s| s.to_string()))]
    Http { status: Option<u16>, message: String },

    #[error("decode github response: {0}")]
    Decode(String),
}

/// Comment created on a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestComment {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Opens pull requests and comments on them.
pub trait PullRequestService {
    /// Fail with [`PullRequestError::MissingConfig`] when requests cannot be made at all.
    fn ensure_configured(&self) -> Result<(), PullRequestError> {
        Ok(())
    }

    fn open_pull_request(
        &self,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest, PullRequestError>;

    fn comment(&self, number: u64, body: &str) -> Result<PullRequestComment, PullRequestError>;
}

impl<T: PullRequestService + ?Sized> PullRequestService for &T {
    fn ensure_configured(&self) -> Result<(), PullRequestError> {
        (**self).ensure_configured()
    }

    fn open_pull_request(
        &self,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest, PullRequestError> {
        (**self).open_pull_request(branch, title, body)
    }

    fn comment(&self, number: u64, body: &str) -> Result<PullRequestComment, PullRequestError> {
        (**self).comment(number, body)
    }
}

#[derive(Debug, Serialize)]
struct CreatePullRequest<'a> {
    title: &'a str,
    head: &'a str,
    base: &'a str,
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateComment<'a> {
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    number: u64,
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommentResponse {
    id: u64,
    #[serde(default)]
    html_url: Option<String>,
}

/// Blocking GitHub client. Token and repository are checked per call so the
/// client can be built even when pull requests are never requested.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: Client,
    api_base_url: String,
    repo: Option<String>,
    token: Option<String>,
    base_branch: String,
}

impl GitHubClient {
    pub fn new(config: &GitHubConfig) -> Result<Self, PullRequestError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| PullRequestError::Http {
                status: None,
                message: error.to_string(),
            })?;
        Ok(Self {
            http,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            repo: config.repo.clone().filter(|r| !r.trim().is_empty()),
            token: config.token.clone().filter(|t| !t.trim().is_empty()),
            base_branch: config.default_branch.clone(),
        })
    }

    fn credentials(&self) -> Result<(&str, &str), PullRequestError> {
        let token = self
            .token
            .as_deref()
            .ok_or(PullRequestError::MissingConfig("GITHUB_TOKEN"))?;
        let repo = self
            .repo
            .as_deref()
            .ok_or(PullRequestError::MissingConfig("GITHUB_REPO"))?;
        Ok((token, repo))
    }

    fn post<P: Serialize, R: DeserializeOwned>(
        &self,
        token: &str,
        path: &str,
        payload: &P,
    ) -> Result<R, PullRequestError> {
        let endpoint = format!("{}{path}", self.api_base_url);
        debug!(endpoint = %endpoint, "github POST");
        let response = self
            .http
            .post(endpoint)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", API_VERSION)
            .bearer_auth(token)
            .json(payload)
            .send()
            .map_err(|error| PullRequestError::Http {
                status: None,
                message: error.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "unable to read response body".to_string());
            return Err(PullRequestError::Http {
                status: Some(status.as_u16()),
                message,
            });
        }
        response
            .json()
            .map_err(|error| PullRequestError::Decode(error.to_string()))
    }
}

impl PullRequestService for GitHubClient {
    fn ensure_configured(&self) -> Result<(), PullRequestError> {
        self.credentials().map(|_| ())
    }

    #[instrument(skip_all, fields(branch))]
    fn open_pull_request(
        &self,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest, PullRequestError> {
        let (token, repo) = self.credentials()?;
        let payload = CreatePullRequest {
            title,
            head: branch,
            base: &self.base_branch,
            body,
        };
        let created: PullResponse = self.post(token, &format!("/repos/{repo}/pulls"), &payload)?;
        info!(number = created.number, "opened pull request");
        Ok(PullRequest {
            number: created.number,
            url: created.html_url,
        })
    }

    #[instrument(skip_all, fields(number))]
    fn comment(&self, number: u64, body: &str) -> Result<PullRequestComment, PullRequestError> {
        let (token, repo) = self.credentials()?;
        let created: CommentResponse = self.post(
            token,
            &format!("/repos/{repo}/issues/{number}/comments"),
            &CreateComment { body },
        )?;
        Ok(PullRequestComment {
            id: created.id,
            url: created.html_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::OneShotHttpServer;

    fn config(base: &str, token: Option<&str>, repo: Option<&str>) -> GitHubConfig {
        GitHubConfig {
            api_base_url: base.to_string(),
            repo: repo.map(str::to_string),
            default_branch: "main".to_string(),
            timeout_secs: 5,
            token: token.map(str::to_string),
        }
    }

    #[test]
    fn missing_token_or_repo_fails_before_any_request() {
        let client = GitHubClient::new(&config("http://127.0.0.1:9", None, Some("a/b")))
            .expect("client");
        let err = client
            .open_pull_request("feature", "t", "b")
            .expect_err("no token");
        assert!(matches!(err, PullRequestError::MissingConfig("GITHUB_TOKEN")));

        let client = GitHubClient::new(&config("http://127.0.0.1:9", Some("tok"), None))
            .expect("client");
        let err = client.comment(1, "hi").expect_err("no repo");
        assert_eq!(err.to_string(), "GITHUB_REPO is not set");
    }

    #[test]
    fn opens_pull_request_against_default_branch() {
        let server = OneShotHttpServer::start(
            201,
            r#"{"number": 7, "html_url": "https://github.com/acme/widgets/pull/7"}"#,
        );
        let client =
            GitHubClient::new(&config(&server.url(), Some("tok"), Some("acme/widgets")))
                .expect("client");
        let pr = client
            .open_pull_request("patchgate/readme", "Append line", "body text")
            .expect("open");
        assert_eq!(pr.number, 7);
        assert_eq!(
            pr.url.as_deref(),
            Some("https://github.com/acme/widgets/pull/7")
        );

        let request = server.request();
        assert!(request.starts_with("POST /repos/acme/widgets/pulls "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer tok"));
        assert!(request.contains("\"head\":\"patchgate/readme\""));
        assert!(request.contains("\"base\":\"main\""));
    }

    #[test]
    fn http_failure_carries_status_and_body() {
        let server = OneShotHttpServer::start(422, r#"{"message": "Validation Failed"}"#);
        let client =
            GitHubClient::new(&config(&server.url(), Some("tok"), Some("acme/widgets")))
                .expect("client");
        let err = client.comment(3, "hello").expect_err("422");
        match err {
            PullRequestError::Http { status, message } => {
                assert_eq!(status, Some(422));
                assert!(message.contains("Validation Failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(server.request().starts_with("POST /repos/acme/widgets/issues/3/comments "));
    }
}
