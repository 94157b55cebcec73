//! Bounded file context handed to the diff generator.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path};

use anyhow::{Context, Result};
use glob::Pattern;
use tracing::{debug, instrument, warn};

use crate::io::repo_fs::{SKIP_DIRS, looks_binary, matches_relative, walk_files};

/// Limits for one context gathering pass.
#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    pub max_files: usize,
    pub snippet_bytes: usize,
}

/// Collect `path -> snippet` for the files named by `hints`.
///
/// A hint is a repository-relative file, a directory (all files below it) or
/// a glob. Hints are taken in order until `max_files` is reached. Binary files,
/// files under [`SKIP_DIRS`] and paths that resolve outside the repository
/// (through `..` or a symlink) are skipped.
#[instrument(skip_all, fields(root = %root.display(), hints = hints.len()))]
pub fn gather_context(
    root: &Path,
    hints: &[String],
    budget: ContextBudget,
) -> Result<BTreeMap<String, String>> {
    let mut context = BTreeMap::new();
    if hints.is_empty() || budget.max_files == 0 {
        return Ok(context);
    }
    let canonical_root = root
        .canonicalize()
        .with_context(|| format!("resolve {}", root.display()))?;
    let mut all_files = None;

    for hint in hints {
        let hint = hint.trim().trim_start_matches("./");
        if hint.is_empty() {
            continue;
        }
        if escapes_root(hint) {
            warn!(hint, "context hint escapes repository root, skipping");
            continue;
        }
        if in_skipped_dir(hint) {
            warn!(hint, "context hint names tool-internal files, skipping");
            continue;
        }

        let candidate = root.join(hint);
        let matched: Vec<String> = if candidate.is_file() {
            vec![hint.to_string()]
        } else {
            if all_files.is_none() {
                all_files = Some(walk_files(root)?);
            }
            let files = all_files.as_deref().unwrap_or_default();
            if candidate.is_dir() {
                let prefix = format!("{}/", hint.trim_end_matches('/'));
                files
                    .iter()
                    .filter(|(rel, _)| rel.starts_with(&prefix))
                    .map(|(rel, _)| rel.clone())
                    .collect()
            } else {
                match Pattern::new(hint) {
                    Ok(pattern) => files
                        .iter()
                        .filter(|(rel, _)| matches_relative(&pattern, rel))
                        .map(|(rel, _)| rel.clone())
                        .collect(),
                    Err(err) => {
                        warn!(hint, err = %err, "context hint is neither a path nor a glob");
                        Vec::new()
                    }
                }
            }
        };

        for rel in matched {
            if context.len() >= budget.max_files {
                debug!(max_files = budget.max_files, "context file budget reached");
                return Ok(context);
            }
            if context.contains_key(&rel) {
                continue;
            }
            let path = root.join(&rel);
            match path.canonicalize() {
                Ok(resolved) if resolved.starts_with(&canonical_root) => {}
                Ok(resolved) => {
                    warn!(file = %rel, target = %resolved.display(), "context file resolves outside the repository, skipping");
                    continue;
                }
                Err(err) => {
                    warn!(file = %rel, err = %err, "context file cannot be resolved, skipping");
                    continue;
                }
            }
            let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
            if looks_binary(&bytes) {
                continue;
            }
            context.insert(rel, snippet(&bytes, budget.snippet_bytes));
        }
    }
    debug!(files = context.len(), "gathered context");
    Ok(context)
}

fn escapes_root(hint: &str) -> bool {
    Path::new(hint)
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
}

fn in_skipped_dir(hint: &str) -> bool {
    hint.split(['/', '\\'])
        .any(|segment| SKIP_DIRS.contains(&segment))
}

/// Lossy text truncated at a char boundary at or below `limit` bytes.
fn snippet(bytes: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= limit {
        return text.into_owned();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}\n[truncated {} bytes]\n",
        &text[..end],
        text.len() - end
    )
}
