//! Line-based symbol and import index for Python and JavaScript/TypeScript.
//!
//! Extraction is regex per line: top-level and nested definitions are found
//! alike, and anything a single line cannot show (multi-line imports,
//! destructuring) is missed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::io::repo_fs::{looks_binary, walk_files};

/// Directory (relative to the repository root) holding derived, ignored files.
pub const CACHE_DIR: &str = ".patchgate/cache";
pub const MAP_FILE: &str = "map.json";

static PY_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:from\s+([\w.]+)\s+import\s+[\w*]+|import\s+([\w.]+))")
        .expect("valid python import regex")
});
static PY_FUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:async\s+)?def\s+([A-Za-z_]\w*)\s*\(").expect("valid python def regex")
});
static PY_CLASS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*class\s+([A-Za-z_]\w*)").expect("valid python class regex"));
static PY_ASSIGN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_]\w*)\s*(?::[^=]+)?=(?:[^=]|$)").expect("valid python assign regex")
});

static JS_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*import\s+(?:[^"']+\s+from\s+)?["']([^"']+)["']"#)
        .expect("valid js import regex")
});
static JS_REQUIRE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"require\(\s*["']([^"']+)["']\s*\)"#).expect("valid js require regex")
});
static JS_FUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s+([A-Za-z0-9_$]+)\s*\(")
        .expect("valid js function regex")
});
static JS_CLASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:export\s+)?(?:default\s+)?class\s+([A-Za-z0-9_$]+)")
        .expect("valid js class regex")
});
static JS_VARIABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z0-9_$]+)\s*(?::[^=]+)?=")
        .expect("valid js variable regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Function,
    Class,
    Variable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    /// Repository-relative, `/`-separated.
    pub file: String,
    /// 1-based.
    pub line: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIndex {
    pub symbols: Vec<Symbol>,
    /// Sorted, deduplicated module specifiers.
    pub imports: Vec<String>,
}

/// Per-file symbols plus the file -> imports adjacency list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoIndex {
    pub files: BTreeMap<String, FileIndex>,
    pub deps: BTreeMap<String, Vec<String>>,
}

impl RepoIndex {
    /// Every symbol named exactly `name`, in file then line order.
    pub fn find_symbol(&self, name: &str) -> Vec<&Symbol> {
        self.files
            .values()
            .flat_map(|file| file.symbols.iter())
            .filter(|symbol| symbol.name == name)
            .collect()
    }

    pub fn dependency_graph(&self) -> &BTreeMap<String, Vec<String>> {
        &self.deps
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Language {
    Python,
    Script,
}

impl Language {
    fn for_path(rel: &str) -> Option<Self> {
        let ext = rel.rsplit_once('.')?.1.to_ascii_lowercase();
        match ext.as_str() {
            "py" => Some(Language::Python),
            "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" => Some(Language::Script),
            _ => None,
        }
    }
}

/// Index every Python and JS/TS file under `root`.
///
/// Unreadable or binary files are skipped with a warning rather than failing
/// the whole index.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn build_index(root: &Path) -> Result<RepoIndex> {
    let mut index = RepoIndex::default();
    for (rel, path) in walk_files(root)? {
        let Some(language) = Language::for_path(&rel) else {
            continue;
        };
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(file = %rel, err = %err, "unreadable source, skipping");
                continue;
            }
        };
        if looks_binary(&bytes) {
            continue;
        }
        let text = String::from_utf8_lossy(&bytes);
        let file_index = index_source(language, &rel, &text);
        index.deps.insert(rel.clone(), file_index.imports.clone());
        index.files.insert(rel, file_index);
    }
    debug!(files = index.files.len(), "built repository index");
    Ok(index)
}

fn index_source(language: Language, rel: &str, text: &str) -> FileIndex {
    let mut symbols = Vec::new();
    let mut imports = Vec::new();
    let (function, class, variable) = match language {
        Language::Python => (&*PY_FUNCTION_RE, &*PY_CLASS_RE, &*PY_ASSIGN_RE),
        Language::Script => (&*JS_FUNCTION_RE, &*JS_CLASS_RE, &*JS_VARIABLE_RE),
    };

    for (idx, line) in text.lines().enumerate() {
        let found = [
            (function, SymbolKind::Function),
            (class, SymbolKind::Class),
            (variable, SymbolKind::Variable),
        ]
        .into_iter()
        .find_map(|(re, kind)| re.captures(line).map(|caps| (caps[1].to_string(), kind)));
        if let Some((name, kind)) = found {
            symbols.push(Symbol {
                name,
                kind,
                file: rel.to_string(),
                line: idx + 1,
            });
        }

        match language {
            Language::Python => {
                if let Some(caps) = PY_IMPORT_RE.captures(line) {
                    let module = caps.get(1).or_else(|| caps.get(2));
                    imports.extend(module.map(|m| m.as_str().to_string()));
                }
            }
            Language::Script => {
                if let Some(caps) = JS_IMPORT_RE.captures(line) {
                    imports.push(caps[1].to_string());
                }
                imports.extend(
                    JS_REQUIRE_RE
                        .captures_iter(line)
                        .map(|caps| caps[1].to_string()),
                );
            }
        }
    }

    imports.sort();
    imports.dedup();
    FileIndex { symbols, imports }
}

/// Write `index` as pretty JSON to `<root>/.patchgate/cache/map.json`.
///
/// The cache directory gets a `.gitignore` of `*`, so the map never dirties
/// the working tree. Returns the written path.
pub fn save_repo_map(root: &Path, index: &RepoIndex) -> Result<PathBuf> {
    let dir = root.join(CACHE_DIR);
    fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;
    let ignore = dir.join(".gitignore");
    if !ignore.exists() {
        fs::write(&ignore, "*\n").with_context(|| format!("write {}", ignore.display()))?;
    }

    let mut payload = serde_json::to_string_pretty(index).context("serialize repository map")?;
    payload.push('\n');
    let path = dir.join(MAP_FILE);
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, payload).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, &path).with_context(|| format!("replace {}", path.display()))?;
    debug!(path = %path.display(), "saved repository map");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PYTHON: &str = "\
import os
from app.models import User
import os.path

MAX_RETRIES = 3
limit: int = 10

class Service:
    def run(self):
        if self.x == 1:
            pass

async def fetch(url):
    return url
";

    const TYPESCRIPT: &str = r#"import React from "react";
import "./styles.css";
const fs = require('fs'), path = require("path");

export function render(props) {}
export default class App {}
let counter = 0;
"#;

    fn names(index: &FileIndex) -> Vec<(&str, SymbolKind, usize)> {
        index
            .symbols
            .iter()
            .map(|s| (s.name.as_str(), s.kind, s.line))
            .collect()
    }

    #[test]
    fn python_symbols_and_imports() {
        let index = index_source(Language::Python, "app/service.py", PYTHON);
        assert_eq!(
            names(&index),
            vec![
                ("MAX_RETRIES", SymbolKind::Variable, 5),
                ("limit", SymbolKind::Variable, 6),
                ("Service", SymbolKind::Class, 8),
                ("run", SymbolKind::Function, 9),
                ("fetch", SymbolKind::Function, 13),
            ]
        );
        assert_eq!(index.imports, vec!["app.models", "os", "os.path"]);
        assert!(index.symbols.iter().all(|s| s.file == "app/service.py"));
    }

    #[test]
    fn script_symbols_imports_and_requires() {
        let index = index_source(Language::Script, "web/app.tsx", TYPESCRIPT);
        assert_eq!(
            names(&index),
            vec![
                ("fs", SymbolKind::Variable, 3),
                ("render", SymbolKind::Function, 5),
                ("App", SymbolKind::Class, 6),
                ("counter", SymbolKind::Variable, 7),
            ]
        );
        assert_eq!(index.imports, vec!["./styles.css", "fs", "path", "react"]);
    }

    #[test]
    fn builds_index_over_supported_files_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        for (rel, contents) in [
            ("pkg/a.py", "import b\ndef helper():\n    pass\n"),
            ("pkg/b.py", "def helper():\n    pass\n"),
            ("web/main.js", "const b = require('./b');\n"),
            ("README.md", "def not_code():\n"),
            (".patchgate/store/x.py", "def hidden():\n"),
        ] {
            let path = temp.path().join(rel);
            fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
            fs::write(path, contents).expect("write");
        }

        let index = build_index(temp.path()).expect("index");
        let files: Vec<&str> = index.files.keys().map(String::as_str).collect();
        assert_eq!(files, vec!["pkg/a.py", "pkg/b.py", "web/main.js"]);
        assert_eq!(index.dependency_graph()["pkg/a.py"], vec!["b"]);
        assert_eq!(index.dependency_graph()["web/main.js"], vec!["./b"]);

        let found: Vec<(&str, usize)> = index
            .find_symbol("helper")
            .into_iter()
            .map(|s| (s.file.as_str(), s.line))
            .collect();
        assert_eq!(found, vec![("pkg/a.py", 2), ("pkg/b.py", 1)]);
        assert!(index.find_symbol("hidden").is_empty());
        assert!(index.find_symbol("not_code").is_empty());
    }

    #[test]
    fn saved_map_round_trips_and_is_ignored() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("m.py"), "X = 1\n").expect("write");
        let index = build_index(temp.path()).expect("index");

        let path = save_repo_map(temp.path(), &index).expect("save");
        assert_eq!(path, temp.path().join(".patchgate/cache/map.json"));
        let raw = fs::read_to_string(&path).expect("read map");
        let loaded: RepoIndex = serde_json::from_str(&raw).expect("decode map");
        assert_eq!(loaded, index);
        assert_eq!(
            fs::read_to_string(temp.path().join(".patchgate/cache/.gitignore")).expect("ignore"),
            "*\n"
        );
    }
}
