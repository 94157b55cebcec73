//! Diff generators: anything that turns a goal plus file context into diff text.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use minijinja::{Environment, context};
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::core::playbook::Playbook;
use crate::io::config::{ModelConfig, ModelProvider};

const DIFF_REQUEST_TEMPLATE: &str = include_str!("prompts/diff_request.md");
const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const TEMPERATURE: f64 = 0.1;

/// Input for one diff generation.
#[derive(Debug, Clone)]
pub struct DiffRequest<'a> {
    pub goal: &'a str,
    pub playbook: Playbook,
    /// Repository-relative path -> snippet.
    pub context: &'a BTreeMap<String, String>,
}

/// Produces unified diff text for a goal. An empty result means "nothing to do".
pub trait DiffGenerator {
    fn get_diff(&self, request: &DiffRequest<'_>) -> Result<String>;
}

/// Closures `(goal, context) -> diff` are generators too.
impl<F> DiffGenerator for F
where
    F: Fn(&str, &BTreeMap<String, String>) -> Result<String>,
{
    fn get_diff(&self, request: &DiffRequest<'_>) -> Result<String> {
        self(request.goal, request.context)
    }
}

#[derive(Debug, Error)]
pub enum DiffGenError {
    #[error("model provider {provider:?} requires MODEL_ENDPOINT")]
    MissingEndpoint { provider: ModelProvider },

    #[error("model request failed (status {status:?}): {message}")]
    Http { status: Option<u16>, message: String },

    #[error("decode model response: {0}")]
    Decode(String),

    #[error("render diff prompt: {0}")]
    Prompt(#[from] minijinja::Error),
}

#[derive(Debug, Serialize)]
struct ContextFile<'a> {
    path: &'a str,
    snippet: &'a str,
}

/// Render the diff-generation prompt.
pub fn render_prompt(request: &DiffRequest<'_>) -> Result<String, DiffGenError> {
    let files: Vec<ContextFile<'_>> = request
        .context
        .iter()
        .map(|(path, snippet)| ContextFile {
            path,
            snippet: snippet.trim_end(),
        })
        .collect();
    let env = Environment::new();
    let rendered = env.render_str(
        DIFF_REQUEST_TEMPLATE,
        context! {
            playbook => request.playbook.as_str(),
            guidance => request.playbook.guidance(),
            goal => request.goal.trim(),
            files => files,
        },
    )?;
    Ok(rendered)
}

/// Built-in generator calling an LLM (or generic HTTP) endpoint.
#[derive(Debug, Clone)]
pub struct HttpDiffGenerator {
    http: Client,
    provider: ModelProvider,
    model: String,
    endpoint: Option<String>,
    api_key: Option<String>,
}

impl HttpDiffGenerator {
    pub fn new(config: &ModelConfig) -> Result<Self, DiffGenError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| DiffGenError::Http {
                status: None,
                message: error.to_string(),
            })?;
        Ok(Self {
            http,
            provider: config.provider,
            model: config.name.clone(),
            endpoint: config.endpoint.clone().filter(|e| !e.trim().is_empty()),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
        })
    }

    fn endpoint(&self) -> Result<&str, DiffGenError> {
        match (self.provider, self.endpoint.as_deref()) {
            (_, Some(endpoint)) => Ok(endpoint),
            (ModelProvider::Openai, None) => Ok(OPENAI_CHAT_URL),
            (provider, None) => Err(DiffGenError::MissingEndpoint { provider }),
        }
    }

    fn request(&self, request: &DiffRequest<'_>) -> Result<String, DiffGenError> {
        let endpoint = self.endpoint()?;
        let payload = match self.provider {
            ModelProvider::Openai | ModelProvider::AzureOpenai => json!({
                "model": self.model,
                "messages": [{"role": "user", "content": render_prompt(request)?}],
                "temperature": TEMPERATURE,
            }),
            ModelProvider::Http => json!({
                "goal": request.goal,
                "playbook": request.playbook.as_str(),
                "context": request.context,
            }),
        };

        let mut builder = self.http.post(endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            builder = match self.provider {
                ModelProvider::AzureOpenai => builder.header("api-key", key),
                ModelProvider::Openai | ModelProvider::Http => builder.bearer_auth(key),
            };
        }
        debug!(endpoint, provider = ?self.provider, "requesting diff");
        let response = builder.send().map_err(|error| DiffGenError::Http {
            status: None,
            message: error.to_string(),
        })?;

        let status = response.status();
        let body = response.text().map_err(|error| DiffGenError::Http {
            status: Some(status.as_u16()),
            message: error.to_string(),
        })?;
        if !status.is_success() {
            return Err(DiffGenError::Http {
                status: Some(status.as_u16()),
                message: body,
            });
        }

        match self.provider {
            ModelProvider::Openai | ModelProvider::AzureOpenai => chat_content(&body),
            ModelProvider::Http => Ok(http_content(&body)),
        }
    }
}

impl DiffGenerator for HttpDiffGenerator {
    #[instrument(skip_all, fields(provider = ?self.provider, files = request.context.len()))]
    fn get_diff(&self, request: &DiffRequest<'_>) -> Result<String> {
        let raw = self.request(request)?;
        let diff = extract_diff(&raw);
        info!(bytes = diff.len(), "received diff");
        Ok(diff)
    }
}

/// `choices[0].message.content` of a chat completion; missing content is empty.
fn chat_content(body: &str) -> Result<String, DiffGenError> {
    let value: Value =
        serde_json::from_str(body).map_err(|error| DiffGenError::Decode(error.to_string()))?;
    Ok(value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string())
}

/// `{"diff": ...}`, `{"content": ...}` or the raw body when it is not JSON.
fn http_content(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(value @ Value::Object(_)) => ["diff", "content"]
            .iter()
            .filter_map(|key| value.get(*key).and_then(Value::as_str))
            .find(|text| !text.is_empty())
            .unwrap_or_default()
            .to_string(),
        Ok(Value::String(text)) => text,
        _ => body.to_string(),
    }
}

/// Strip a surrounding markdown code fence and normalize the trailing newline.
///
/// Only blank lines around the body are dropped. Spaces inside the body are
/// kept, since a hunk's last line may be a context line holding a lone space.
pub fn extract_diff(raw: &str) -> String {
    let body = match raw.find("```") {
        Some(open) => {
            let after_open = &raw[open + 3..];
            // Skip the info string (e.g. `diff`) on the fence line.
            let content = after_open
                .split_once('\n')
                .map_or("", |(_, rest)| rest);
            match content.find("```") {
                Some(close) => &content[..close],
                None => content,
            }
        }
        None => raw,
    };
    let body = skip_blank_lines(body).trim_end_matches(['\n', '\r']);
    if body.trim().is_empty() {
        return String::new();
    }
    format!("{body}\n")
}

fn skip_blank_lines(text: &str) -> &str {
    let mut rest = text;
    for line in text.split_inclusive('\n') {
        if !line.trim().is_empty() {
            break;
        }
        rest = &rest[line.len()..];
    }
    rest
}
