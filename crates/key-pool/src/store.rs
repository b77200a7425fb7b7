//! Persisted user-supplied key list
//!
//! The user's keys are stored as a JSON array of strings. Writes use atomic
//! temp-file + rename so a crash mid-write never leaves a half-written list.
//! A corrupted file is not fatal: it is logged, treated as an empty list and
//! overwritten with `[]`.
//!
//! An ephemeral (memory-only) store is available for embedding and tests.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Upper bound on the number of keys a user may save.
pub const MAX_USER_KEYS: usize = 10;

/// User key list, optionally backed by a file.
pub struct KeyStore {
    path: Option<PathBuf>,
    keys: Mutex<Vec<String>>,
}

impl KeyStore {
    /// Load the key list from `path`.
    ///
    /// A missing file yields an empty list. Malformed JSON (or JSON that is
    /// not an array of strings) is logged, treated as empty, and the file is
    /// reset to `[]`. Other read errors are returned.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let keys = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<Vec<String>>(&contents) {
                Ok(keys) => {
                    info!(path = %path.display(), keys = keys.len(), "loaded user keys");
                    keys
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "user key file is corrupted, resetting to empty");
                    if let Err(e) = write_atomic(&path, &[]).await {
                        warn!(path = %path.display(), error = %e, "failed to reset corrupted user key file");
                    }
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "user key file not found, starting with no user keys");
                Vec::new()
            }
            Err(e) => return Err(Error::Io(format!("reading user key file: {e}"))),
        };

        Ok(Self {
            path: Some(path),
            keys: Mutex::new(keys),
        })
    }

    /// A store that lives only in memory.
    pub fn ephemeral() -> Self {
        Self {
            path: None,
            keys: Mutex::new(Vec::new()),
        }
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Snapshot of the stored keys.
    pub async fn keys(&self) -> Vec<String> {
        self.keys.lock().await.clone()
    }

    /// Replace the stored list and persist it.
    ///
    /// The in-memory list is only updated once the file write succeeded.
    pub async fn replace(&self, keys: Vec<String>) -> Result<()> {
        let mut state = self.keys.lock().await;
        if let Some(path) = &self.path {
            write_atomic(path, &keys).await?;
        }
        debug!(keys = keys.len(), "replaced user keys");
        *state = keys;
        Ok(())
    }
}

/// Write the key list atomically with 0600 permissions.
async fn write_atomic(path: &Path, keys: &[String]) -> Result<()> {
    let json = serde_json::to_string_pretty(keys)
        .map_err(|e| Error::Serialize(format!("serializing user keys: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let tmp_path = dir.join(format!(".keys.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp key file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting key file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp key file: {e}")))?;

    debug!(path = %path.display(), "persisted user keys");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::load(dir.path().join("keys.json")).await.unwrap();
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn replace_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");

        let store = KeyStore::load(path.clone()).await.unwrap();
        store
            .replace(vec!["a".into(), "b".into()])
            .await
            .unwrap();

        let reloaded = KeyStore::load(path).await.unwrap();
        assert_eq!(reloaded.keys().await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn corrupted_file_fails_soft_and_is_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        tokio::fs::write(&path, "[\"unterminated").await.unwrap();

        let store = KeyStore::load(path.clone()).await.unwrap();
        assert!(store.keys().await.is_empty());

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: Vec<String> = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn non_array_json_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        tokio::fs::write(&path, r#"{"keys":["a"]}"#).await.unwrap();

        let store = KeyStore::load(path).await.unwrap();
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn ephemeral_store_keeps_keys_in_memory() {
        let store = KeyStore::ephemeral();
        assert!(store.path().is_none());
        store.replace(vec!["only-in-memory".into()]).await.unwrap();
        assert_eq!(store.keys().await, vec!["only-in-memory"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn key_file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let store = KeyStore::load(path.clone()).await.unwrap();
        store.replace(vec!["secret".into()]).await.unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "key file must be 0600, got {mode:o}");
    }
}
