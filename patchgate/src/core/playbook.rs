//! Coarse goal classification used to shape the diff prompt.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Playbook {
    Bugfix,
    AddTests,
    Refactor,
    UpgradeDep,
    General,
}

impl Playbook {
    pub fn as_str(self) -> &'static str {
        match self {
            Playbook::Bugfix => "bugfix",
            Playbook::AddTests => "add-tests",
            Playbook::Refactor => "refactor",
            Playbook::UpgradeDep => "upgrade-dep",
            Playbook::General => "general",
        }
    }

    /// One-line guidance rendered into the diff-generation prompt.
    pub fn guidance(self) -> &'static str {
        match self {
            Playbook::Bugfix => "Make the smallest change that fixes the defect; keep behavior elsewhere unchanged.",
            Playbook::AddTests => "Add or extend tests only; do not change production code unless required to test it.",
            Playbook::Refactor => "Preserve behavior exactly; restructure without changing public interfaces.",
            Playbook::UpgradeDep => "Update the dependency and adapt call sites; do not touch lockfiles.",
            Playbook::General => "Make a focused change that accomplishes the goal.",
        }
    }
}

/// Keyword rules checked in order; the first match wins.
const RULES: &[(Playbook, &[&str])] = &[
    (
        Playbook::Bugfix,
        &["fix", "bug", "exception", "error", "failing test", "flake"],
    ),
    (
        Playbook::AddTests,
        &["test", "coverage", "unit test", "pytest", "jest"],
    ),
    (
        Playbook::Refactor,
        &["refactor", "cleanup", "rename", "restructure"],
    ),
    (Playbook::UpgradeDep, &["upgrade", "bump", "migrate"]),
];

pub fn select_playbook(goal: &str) -> Playbook {
    let goal = goal.to_lowercase();
    RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|keyword| goal.contains(keyword)))
        .map(|(playbook, _)| *playbook)
        .unwrap_or(Playbook::General)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_first_matching_rule() {
        assert_eq!(select_playbook("Fix flaky login"), Playbook::Bugfix);
        assert_eq!(select_playbook("Add unit test for parser"), Playbook::AddTests);
        assert_eq!(select_playbook("Rename module"), Playbook::Refactor);
        assert_eq!(select_playbook("Bump serde"), Playbook::UpgradeDep);
        assert_eq!(select_playbook("Append line to README"), Playbook::General);
    }

    #[test]
    fn bugfix_wins_over_tests() {
        assert_eq!(select_playbook("fix failing test"), Playbook::Bugfix);
    }
}
