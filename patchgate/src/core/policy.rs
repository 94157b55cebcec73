//! Path-protection and required-check policy.
//!
//! Matching is pure string/glob work on the declared path and on every path
//! the item's diff headers name, so it can run before anything in the sandbox
//! is touched.

use std::collections::BTreeMap;

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use crate::core::diff_split::touched_paths;
use crate::core::types::{BundleItem, PolicyViolation};

/// Segments that are always protected, whatever the policy file says.
pub const SENSITIVE_SEGMENTS: &[&str] = &[".git", ".husky"];

pub const CHECK_LINT: &str = "lint";
pub const CHECK_TESTS: &str = "tests";

/// Immutable snapshot of the repository policy for one apply call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Glob patterns matched against the path, its file name, and each segment.
    pub protected_paths: Vec<String>,
    /// Check name -> required. Missing names count as required.
    pub require_checks: BTreeMap<String, bool>,
    /// Skip tests when a required lint already failed.
    pub fail_fast: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            protected_paths: vec![
                "package-lock.json".to_string(),
                "pnpm-lock.yaml".to_string(),
                "yarn.lock".to_string(),
            ],
            require_checks: BTreeMap::from([
                (CHECK_LINT.to_string(), true),
                (CHECK_TESTS.to_string(), true),
            ]),
            fail_fast: true,
        }
    }
}

impl Policy {
    pub fn requires(&self, check: &str) -> bool {
        self.require_checks.get(check).copied().unwrap_or(true)
    }

    pub fn requires_lint(&self) -> bool {
        self.requires(CHECK_LINT)
    }

    pub fn requires_tests(&self) -> bool {
        self.requires(CHECK_TESTS)
    }

    /// Every check required and no short-circuiting, so a run reports all failures.
    pub fn strict(&self) -> Self {
        let mut strict = self.clone();
        for check in [CHECK_LINT, CHECK_TESTS] {
            strict.require_checks.insert(check.to_string(), true);
        }
        for required in strict.require_checks.values_mut() {
            *required = true;
        }
        strict.fail_fast = false;
        strict
    }

    /// First protected item in bundle order, checked before anything is applied.
    ///
    /// An item violates the policy when its declared file or any path in its
    /// diff headers is protected; `git apply` writes to the headers, not to the
    /// declared file.
    pub fn first_violation(&self, items: &[BundleItem]) -> Option<PolicyViolation> {
        items.iter().enumerate().find_map(|(index, item)| {
            std::iter::once(item.file.clone())
                .chain(touched_paths(&item.diff))
                .find_map(|file| {
                    self.protection_rule(&file)
                        .map(|rule| PolicyViolation { index, file, rule })
                })
        })
    }

    pub fn is_protected(&self, path: &str) -> bool {
        self.protection_rule(path).is_some()
    }

    /// Return the sensitive segment or pattern protecting `path`, if any.
    pub fn protection_rule(&self, path: &str) -> Option<String> {
        let normalized = normalize_path(path);
        let segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();

        if let Some(segment) = segments
            .iter()
            .find(|segment| SENSITIVE_SEGMENTS.contains(segment))
        {
            return Some((*segment).to_string());
        }

        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        for raw in &self.protected_paths {
            let rule = raw.trim();
            if rule.is_empty() {
                continue;
            }
            let rule = normalize_path(rule);
            let matched = match Pattern::new(&rule) {
                Ok(pattern) => {
                    pattern.matches_with(&normalized, options)
                        || segments
                            .iter()
                            .any(|segment| pattern.matches_with(segment, options))
                }
                // Not a valid glob; fall back to literal comparison.
                Err(_) => normalized == rule || segments.iter().any(|segment| *segment == rule),
            };
            if matched {
                return Some(rule);
            }
        }
        None
    }
}

/// Normalize separators and strip `./` so paths from diffs and callers compare equal.
fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    unified
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}
