//! Deterministic branch naming for promoted changes.

use anyhow::{Result, anyhow};

const MAX_SLUG_LEN: usize = 48;
const EMPTY_SLUG: &str = "change";

/// Lowercase, `-`-separated slug of `text`, bounded to a readable length.
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
            if slug.len() >= MAX_SLUG_LEN {
                break;
            }
        } else {
            pending_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        return EMPTY_SLUG.to_string();
    }
    slug
}

/// Branch name for a goal: `<prefix><slug>`.
pub fn branch_for_goal(prefix: &str, goal: &str) -> String {
    format!("{prefix}{}", slugify(goal))
}

/// Validate a caller-supplied branch name against the subset of git ref rules we rely on.
pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow!("branch name must not be empty"));
    }
    if name.starts_with('-') || name.starts_with('/') || name.ends_with('/') {
        return Err(anyhow!("branch name '{name}' has a leading '-' or a leading/trailing '/'"));
    }
    if name.ends_with(".lock") || name.ends_with('.') {
        return Err(anyhow!("branch name '{name}' must not end with '.lock' or '.'"));
    }
    if name.contains("..") || name.contains("//") || name.contains("@{") {
        return Err(anyhow!("branch name '{name}' contains '..', '//' or '@{{'"));
    }
    if name
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/')))
    {
        return Err(anyhow!(
            "branch name must be [A-Za-z0-9._/-] only (got '{name}')"
        ));
    }
    Ok(())
}
