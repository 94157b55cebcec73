//! Read-only repository browsing: listing, reading and naive search.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, instrument};
use walkdir::WalkDir;

/// Directories never descended into.
pub const SKIP_DIRS: &[&str] = &[".git", ".patchgate"];

/// Files bigger than this are not searched.
const MAX_SEARCH_FILE_BYTES: u64 = 1_000_000;
const BINARY_SNIFF_BYTES: usize = 8_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    /// Path relative to the listing root, `/`-separated.
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub path: String,
    /// 1-based line number.
    pub line: usize,
    pub text: String,
}

/// All files under `root` in path order, skipping [`SKIP_DIRS`].
pub fn walk_files(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !(entry.file_type().is_dir()
                    && SKIP_DIRS.iter().any(|skip| entry.file_name() == *skip))
        });
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        files.push((relative_display(rel), entry.into_path()));
    }
    Ok(files)
}

/// List files under `root`, optionally filtered by a glob.
///
/// A pattern without `/` matches file names at any depth; one with `/`
/// matches the whole relative path.
#[instrument(skip_all, fields(root = %root.display(), pattern))]
pub fn list_files(root: &Path, pattern: Option<&str>) -> Result<Vec<FileEntry>> {
    let matcher = pattern
        .map(|raw| Pattern::new(raw).with_context(|| format!("parse glob '{raw}'")))
        .transpose()?;
    let mut entries = Vec::new();
    for (rel, path) in walk_files(root)? {
        if let Some(pattern) = &matcher
            && !matches_relative(pattern, &rel)
        {
            continue;
        }
        let size = fs::metadata(&path)
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        entries.push(FileEntry { path: rel, size });
    }
    debug!(count = entries.len(), "listed files");
    Ok(entries)
}

/// Read a file as text (invalid UTF-8 replaced), optionally a `[start, end)` line slice.
pub fn read_file(path: &Path, lines: Option<(usize, usize)>) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    let Some((start, end)) = lines else {
        return Ok(text.into_owned());
    };
    Ok(text
        .lines()
        .skip(start)
        .take(end.saturating_sub(start))
        .collect::<Vec<_>>()
        .join("\n"))
}

/// Regex search over text files under `root`, stopping after `max_hits`.
#[instrument(skip_all, fields(root = %root.display(), pattern, max_hits))]
pub fn search_code(root: &Path, pattern: &str, max_hits: usize) -> Result<Vec<SearchHit>> {
    let re = Regex::new(pattern).with_context(|| format!("parse regex '{pattern}'"))?;
    let mut hits = Vec::new();
    if max_hits == 0 {
        return Ok(hits);
    }
    for (rel, path) in walk_files(root)? {
        let Ok(meta) = fs::metadata(&path) else {
            continue;
        };
        if meta.len() > MAX_SEARCH_FILE_BYTES {
            continue;
        }
        let Ok(bytes) = fs::read(&path) else {
            continue;
        };
        if looks_binary(&bytes) {
            continue;
        }
        let text = String::from_utf8_lossy(&bytes);
        for (idx, line) in text.lines().enumerate() {
            if re.is_match(line) {
                hits.push(SearchHit {
                    path: rel.clone(),
                    line: idx + 1,
                    text: line.to_string(),
                });
                if hits.len() >= max_hits {
                    return Ok(hits);
                }
            }
        }
    }
    debug!(count = hits.len(), "search finished");
    Ok(hits)
}

pub(crate) fn looks_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(BINARY_SNIFF_BYTES).any(|b| *b == 0)
}

pub(crate) fn matches_relative(pattern: &Pattern, rel: &str) -> bool {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    if pattern.as_str().contains('/') {
        return pattern.matches_with(rel, options);
    }
    let name = rel.rsplit('/').next().unwrap_or(rel);
    pattern.matches_with(name, options)
}

fn relative_display(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
