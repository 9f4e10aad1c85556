use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum CredentialStoreError {
    #[error("no valid credential bundles found")]
    Empty,
    #[error("credential bundle {0} not found")]
    NotFound(u32),
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("credential bundle {index} is not valid JSON: {source}")]
    Parse {
        index: u32,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
enum Source {
    /// `AUTH_JSON_<N>` environment variables.
    Env,
    /// `auth-<N>.json` files in a directory.
    Dir(PathBuf),
}

/// Read-only registry of stored browser-state bundles, one per account.
///
/// Discovery runs once at construction and decides which indices exist and
/// what account names they carry; `load` re-reads the underlying source every
/// call so bundles rotated on disk are picked up on next use.
pub struct CredentialStore {
    source: Source,
    indices: Vec<u32>,
    names: BTreeMap<u32, Option<String>>,
}

impl CredentialStore {
    pub fn from_env() -> Result<Self, CredentialStoreError> {
        Self::discover(Source::Env)
    }

    pub fn from_dir(path: impl Into<PathBuf>) -> Result<Self, CredentialStoreError> {
        Self::discover(Source::Dir(path.into()))
    }

    fn discover(source: Source) -> Result<Self, CredentialStoreError> {
        let mut indices = Vec::new();
        let mut names = BTreeMap::new();

        for index in scan_candidates(&source) {
            match read_bundle(&source, index) {
                Ok(bundle) => {
                    names.insert(index, account_name(&bundle));
                    indices.push(index);
                }
                Err(error) => {
                    tracing::warn!(index, %error, "skipping invalid credential bundle");
                }
            }
        }

        indices.sort_unstable();
        if indices.is_empty() {
            return Err(CredentialStoreError::Empty);
        }

        Ok(Self {
            source,
            indices,
            names,
        })
    }

    pub fn available_indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn contains(&self, index: u32) -> bool {
        self.indices.binary_search(&index).is_ok()
    }

    pub fn max_index(&self) -> u32 {
        self.indices.last().copied().unwrap_or(0)
    }

    pub fn name_of(&self, index: u32) -> Option<&str> {
        self.names.get(&index).and_then(|name| name.as_deref())
    }

    /// Next valid index after `current`, cycling back to the lowest. With a
    /// single stored bundle this is `current` itself: rotating reloads the
    /// same account.
    pub fn next_index_after(&self, current: u32) -> Option<u32> {
        self.indices
            .iter()
            .copied()
            .find(|&index| index > current)
            .or_else(|| self.indices.first().copied())
    }

    /// Re-read bundle `index` from its source.
    pub fn load(&self, index: u32) -> Result<Value, CredentialStoreError> {
        if !self.contains(index) {
            return Err(CredentialStoreError::NotFound(index));
        }
        read_bundle(&self.source, index)
    }

    /// `(index, account name)` pairs for status introspection.
    pub fn roster(&self) -> Vec<(u32, Option<String>)> {
        self.indices
            .iter()
            .map(|&index| (index, self.names.get(&index).cloned().flatten()))
            .collect()
    }
}

fn scan_candidates(source: &Source) -> Vec<u32> {
    let mut found: Vec<u32> = match source {
        Source::Env => std::env::vars()
            .filter_map(|(key, _)| parse_env_index(&key))
            .collect(),
        Source::Dir(dir) => match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| parse_file_index(&entry.file_name().to_string_lossy()))
                .collect(),
            Err(error) => {
                tracing::warn!(dir = %dir.display(), %error, "cannot scan credential directory");
                Vec::new()
            }
        },
    };
    found.sort_unstable();
    found.dedup();
    found
}

fn parse_env_index(key: &str) -> Option<u32> {
    let suffix = key.strip_prefix("AUTH_JSON_")?;
    let index: u32 = suffix.parse().ok()?;
    (index >= 1).then_some(index)
}

fn parse_file_index(name: &str) -> Option<u32> {
    let stem = name.strip_prefix("auth-")?.strip_suffix(".json")?;
    let index: u32 = stem.parse().ok()?;
    (index >= 1).then_some(index)
}

fn read_bundle(source: &Source, index: u32) -> Result<Value, CredentialStoreError> {
    let raw = match source {
        Source::Env => std::env::var(format!("AUTH_JSON_{index}"))
            .map_err(|_| CredentialStoreError::NotFound(index))?,
        Source::Dir(dir) => {
            let path = bundle_path(dir, index);
            std::fs::read_to_string(&path)
                .map_err(|source| CredentialStoreError::Io { path, source })?
        }
    };
    serde_json::from_str(&raw).map_err(|source| CredentialStoreError::Parse { index, source })
}

pub fn bundle_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("auth-{index}.json"))
}

fn account_name(bundle: &Value) -> Option<String> {
    bundle
        .get("accountName")
        .and_then(Value::as_str)
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}
