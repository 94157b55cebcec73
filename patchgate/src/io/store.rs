//! Persisted patch and bundle records.
//!
//! Each record is one JSON file `<store>/<id>.json`. Ids are random tokens and
//! files are created with exclusive-create, so concurrent proposals never
//! overwrite each other. The store directory carries a `.gitignore` of `*` so
//! records never get staged into a promoted commit.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::types::{Bundle, BundleItem, Patch};

pub const PATCH_PREFIX: &str = "patch_";
pub const BUNDLE_PREFIX: &str = "bundle_";

const ID_TOKEN_LEN: usize = 12;
const MAX_CREATE_ATTEMPTS: usize = 8;
const GITIGNORE_CONTENTS: &str = "*\n";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {id}")]
    NotFound { id: String },

    #[error("invalid id '{id}': expected {prefix}[A-Za-z0-9_]+")]
    InvalidId { id: String, prefix: &'static str },

    #[error("diff for '{file}' is empty")]
    EmptyDiff { file: String },

    #[error("bundle has no items")]
    EmptyBundle,

    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("encode record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("could not allocate a unique {prefix} id")]
    IdExhausted { prefix: &'static str },
}

/// Directory-backed store for proposed changes.
#[derive(Debug, Clone)]
pub struct PatchStore {
    dir: PathBuf,
}

impl PatchStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a single-file change. The diff is stored verbatim and never parsed.
    #[instrument(skip_all, fields(file))]
    pub fn propose(&self, file: &str, diff: &str, description: &str) -> Result<String, StoreError> {
        if diff.trim().is_empty() {
            return Err(StoreError::EmptyDiff {
                file: file.to_string(),
            });
        }
        self.create(PATCH_PREFIX, |id| Patch {
            id,
            file: file.to_string(),
            diff: diff.to_string(),
            description: description.to_string(),
            created_at: now_rfc3339(),
        })
    }

    /// Persist an ordered list of items as one bundle.
    #[instrument(skip_all, fields(items = items.len()))]
    pub fn propose_bundle(
        &self,
        items: Vec<BundleItem>,
        description: &str,
    ) -> Result<String, StoreError> {
        if items.is_empty() {
            return Err(StoreError::EmptyBundle);
        }
        self.create(BUNDLE_PREFIX, |id| Bundle {
            id,
            description: description.to_string(),
            items,
            created_at: now_rfc3339(),
        })
    }

    /// Remove a patch or bundle. Returns false when there was nothing to remove.
    #[instrument(skip_all, fields(id))]
    pub fn discard(&self, id: &str) -> Result<bool, StoreError> {
        if !is_valid_token(id) {
            return Ok(false);
        }
        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(id, "discarded record");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io {
                action: "remove",
                path,
                source,
            }),
        }
    }

    pub fn load_patch(&self, id: &str) -> Result<Patch, StoreError> {
        check_id(id, PATCH_PREFIX)?;
        self.load(id)
    }

    pub fn load_bundle(&self, id: &str) -> Result<Bundle, StoreError> {
        check_id(id, BUNDLE_PREFIX)?;
        self.load(id)
    }

    fn load<T: DeserializeOwned>(&self, id: &str) -> Result<T, StoreError> {
        let path = self.record_path(id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound { id: id.to_string() });
            }
            Err(source) => {
                return Err(StoreError::Io {
                    action: "read",
                    path,
                    source,
                });
            }
        };
        serde_json::from_str(&raw).map_err(|source| StoreError::Decode { path, source })
    }

    fn create<T: Serialize>(
        &self,
        prefix: &'static str,
        build: impl FnOnce(String) -> T,
    ) -> Result<String, StoreError> {
        self.ensure_dir()?;
        for _ in 0..MAX_CREATE_ATTEMPTS {
            let id = generate_id(prefix);
            let path = self.record_path(&id);
            let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(source) => {
                    return Err(StoreError::Io {
                        action: "create",
                        path,
                        source,
                    });
                }
            };
            let record = build(id.clone());
            let written = serde_json::to_string_pretty(&record)
                .map_err(StoreError::Encode)
                .and_then(|mut payload| {
                    payload.push('\n');
                    write_all(file, &path, payload.as_bytes())
                });
            if let Err(err) = written {
                // A half-written record would later fail to decode under a valid id.
                if let Err(remove_err) = fs::remove_file(&path) {
                    warn!(path = %path.display(), err = %remove_err, "could not remove partial record");
                }
                return Err(err);
            }
            debug!(id = %id, path = %path.display(), "stored record");
            return Ok(id);
        }
        Err(StoreError::IdExhausted { prefix })
    }

    fn ensure_dir(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            action: "create directory",
            path: self.dir.clone(),
            source,
        })?;
        let ignore = self.dir.join(".gitignore");
        if !ignore.exists() {
            fs::write(&ignore, GITIGNORE_CONTENTS).map_err(|source| StoreError::Io {
                action: "write",
                path: ignore,
                source,
            })?;
        }
        Ok(())
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

fn write_all(mut file: fs::File, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .map_err(|source| StoreError::Io {
            action: "write",
            path: path.to_path_buf(),
            source,
        })
}

fn generate_id(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let token = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(ID_TOKEN_LEN)
        .collect::<String>()
        .to_lowercase();
    format!("{prefix}{token}")
}

fn is_valid_token(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_id(id: &str, prefix: &'static str) -> Result<(), StoreError> {
    if id.len() > prefix.len() && id.starts_with(prefix) && is_valid_token(id) {
        return Ok(());
    }
    Err(StoreError::InvalidId {
        id: id.to_string(),
        prefix,
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
