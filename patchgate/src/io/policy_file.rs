//! Loading the repository policy from `.patchgate/policy.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::core::policy::Policy;

pub const POLICY_RELATIVE_PATH: &str = ".patchgate/policy.toml";

/// Resolve the policy for `root`.
///
/// Precedence: `explicit` if it exists, then `<root>/.patchgate/policy.toml`,
/// then built-in defaults. A file that cannot be read or parsed yields the
/// defaults and a warning; policy loading never fails a run.
pub fn load_policy(root: &Path, explicit: Option<&Path>) -> Policy {
    let Some(path) = policy_path(root, explicit) else {
        debug!("no policy file, using defaults");
        return Policy::default();
    };
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(err = %err, path = %path.display(), "read policy file, using defaults");
            return Policy::default();
        }
    };
    match toml::from_str::<Policy>(&raw) {
        Ok(policy) => {
            debug!(path = %path.display(), "loaded policy");
            policy
        }
        Err(err) => {
            warn!(err = %err, path = %path.display(), "malformed policy file, using defaults");
            Policy::default()
        }
    }
}

fn policy_path(root: &Path, explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit.filter(|path| path.is_file()) {
        return Some(path.to_path_buf());
    }
    let default = root.join(POLICY_RELATIVE_PATH);
    default.is_file().then_some(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, contents: &str) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, contents).expect("write");
        path
    }

    #[test]
    fn missing_file_yields_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(load_policy(temp.path(), None), Policy::default());
    }

    #[test]
    fn repository_file_overrides_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(
            temp.path(),
            POLICY_RELATIVE_PATH,
            "protected_paths = [\"*.pem\"]\n\n[require_checks]\nlint = false\n",
        );
        let policy = load_policy(temp.path(), None);
        assert_eq!(policy.protected_paths, vec!["*.pem"]);
        assert!(!policy.requires_lint());
        assert!(policy.requires_tests());
        assert!(policy.fail_fast);
    }

    #[test]
    fn explicit_path_wins_and_missing_explicit_falls_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), POLICY_RELATIVE_PATH, "protected_paths = [\"a\"]\n");
        let explicit = write(temp.path(), "custom.toml", "protected_paths = [\"b\"]\n");

        let policy = load_policy(temp.path(), Some(&explicit));
        assert_eq!(policy.protected_paths, vec!["b"]);

        let policy = load_policy(temp.path(), Some(&temp.path().join("nope.toml")));
        assert_eq!(policy.protected_paths, vec!["a"]);
    }

    #[test]
    fn malformed_file_yields_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), POLICY_RELATIVE_PATH, "protected_paths = [unterminated\n");
        assert_eq!(load_policy(temp.path(), None), Policy::default());
    }
}
