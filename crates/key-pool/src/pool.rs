//! Key pool state and round-robin selection
//!
//! The pool holds an ordered list of keys, each `Active` or `Invalid`, plus a
//! rotation cursor. Selection scans forward from the cursor and returns the
//! first active key, so invalid keys are skipped without disturbing the order
//! of the remaining ones.
//!
//! The pool is rebuilt wholesale from its source (user keys if any are saved,
//! otherwise system keys) whenever the user key list changes. Rebuilding is the
//! only way an `Invalid` key becomes `Active` again.

use common::Secret;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::{KeyStore, MAX_USER_KEYS};

/// Eligibility of a key.
///
/// Transitions:
/// - Active → Invalid (key rejected by the service)
/// - Invalid → Active only through a pool rebuild
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Active,
    Invalid,
}

impl KeyStatus {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Invalid => "invalid",
        }
    }
}

/// Where the pool's keys came from. Decides the remedy shown on exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Keys the user saved themselves.
    User,
    /// Keys configured by the operator (environment or key file).
    System,
}

impl KeySource {
    pub fn label(&self) -> &'static str {
        match self {
            KeySource::User => "user",
            KeySource::System => "system",
        }
    }
}

/// One API key with a stable, non-secret identifier.
#[derive(Debug, Clone)]
pub struct Credential {
    id: String,
    secret: Secret<String>,
}

impl Credential {
    pub fn new(secret: String) -> Self {
        Self {
            id: fingerprint(&secret),
            secret: Secret::new(secret),
        }
    }

    /// Fingerprint used in logs, health output and `mark_invalid`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn secret(&self) -> &Secret<String> {
        &self.secret
    }

    /// Masked form for display (`AIza…wxyz`).
    pub fn masked(&self) -> String {
        self.secret.masked()
    }
}

/// Short SHA-256 fingerprint of a key: `key-` followed by 12 hex chars.
pub fn fingerprint(secret: &str) -> String {
    let hash = Sha256::digest(secret.as_bytes());
    let hex: String = hash[..6].iter().map(|b| format!("{b:02x}")).collect();
    format!("key-{hex}")
}

/// Trim every key and drop the empty ones, preserving order.
pub fn normalize_keys<I, S>(keys: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    keys.into_iter()
        .map(|k| k.as_ref().trim().to_string())
        .filter(|k| !k.is_empty())
        .collect()
}

/// Split a comma-separated key list (as found in environment variables).
pub fn parse_key_list(raw: &str) -> Vec<String> {
    normalize_keys(raw.split(','))
}

struct Entry {
    credential: Credential,
    status: KeyStatus,
}

struct PoolState {
    entries: Vec<Entry>,
    source: KeySource,
    /// Position in `entries` where the next scan starts.
    cursor: usize,
    /// Bumped on every rebuild.
    generation: u64,
}

impl PoolState {
    fn build(user_keys: &[String], system_keys: &[String]) -> Self {
        let (source, keys) = if user_keys.is_empty() {
            (KeySource::System, system_keys)
        } else {
            (KeySource::User, user_keys)
        };

        let mut entries: Vec<Entry> = Vec::with_capacity(keys.len());
        for key in keys {
            let credential = Credential::new(key.clone());
            if entries.iter().any(|e| e.credential.id == credential.id) {
                continue;
            }
            entries.push(Entry {
                credential,
                status: KeyStatus::Active,
            });
        }

        Self {
            entries,
            source,
            cursor: 0,
            generation: 0,
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.credential.id == id)
    }

    /// Active credentials in rotation order, starting at the cursor.
    fn active_from_cursor(&self) -> Vec<Credential> {
        let n = self.entries.len();
        (0..n)
            .map(|offset| &self.entries[(self.cursor + offset) % n])
            .filter(|e| e.status == KeyStatus::Active)
            .map(|e| e.credential.clone())
            .collect()
    }

    fn active_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status == KeyStatus::Active)
            .count()
    }
}

/// Consistent view of the pool taken at the start of a rotated call.
#[derive(Debug, Clone)]
pub struct RotationSnapshot {
    /// Pool build the candidates belong to.
    pub generation: u64,
    pub source: KeySource,
    pub total: usize,
    pub candidates: Vec<Credential>,
}

/// Pool of API keys shared by every outbound call.
///
/// Key statuses and the cursor sit behind one `RwLock`, so concurrent calls
/// rotating through the same pool never lose a status transition.
pub struct KeyPool {
    state: RwLock<PoolState>,
    store: KeyStore,
    system_keys: Vec<String>,
}

impl KeyPool {
    /// Build the pool from the stored user keys, falling back to `system_keys`.
    pub async fn new(store: KeyStore, system_keys: Vec<String>) -> Self {
        let system_keys = normalize_keys(system_keys);
        let state = PoolState::build(&store.keys().await, &system_keys);
        info!(
            source = state.source.label(),
            keys = state.entries.len(),
            "key pool initialized"
        );
        Self {
            state: RwLock::new(state),
            store,
            system_keys,
        }
    }

    /// Rebuild the pool from its sources. All keys become `Active` and the
    /// cursor returns to the first key.
    pub async fn initialize(&self) {
        let mut rebuilt = PoolState::build(&self.store.keys().await, &self.system_keys);
        let mut state = self.state.write().await;
        rebuilt.generation = state.generation + 1;
        info!(
            source = rebuilt.source.label(),
            keys = rebuilt.entries.len(),
            generation = rebuilt.generation,
            "key pool rebuilt"
        );
        *state = rebuilt;
    }

    /// Persist a new user key list and rebuild the pool.
    ///
    /// Keys are trimmed and blanks dropped. An empty list clears the user
    /// keys, so the pool falls back to the system keys. Returns the list that
    /// was stored.
    pub async fn set_user_credentials<I, S>(&self, keys: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = normalize_keys(keys);
        if keys.len() > MAX_USER_KEYS {
            return Err(Error::InvalidKeys(format!(
                "at most {MAX_USER_KEYS} keys may be saved, got {}",
                keys.len()
            )));
        }
        self.store.replace(keys.clone()).await?;
        self.initialize().await;
        Ok(keys)
    }

    /// The persisted user key list (empty if none).
    pub async fn user_credentials(&self) -> Vec<String> {
        self.store.keys().await
    }

    /// Next active key in round-robin order, advancing the cursor.
    ///
    /// Returns `None` when no key is active. Never returns an invalid key.
    pub async fn next_candidate(&self) -> Option<Credential> {
        let mut state = self.state.write().await;
        let n = state.entries.len();
        for offset in 0..n {
            let idx = (state.cursor + offset) % n;
            if state.entries[idx].status == KeyStatus::Active {
                state.cursor = (idx + 1) % n;
                return Some(state.entries[idx].credential.clone());
            }
        }
        None
    }

    /// Snapshot of the active keys in rotation order. Does not move the cursor.
    pub async fn snapshot(&self) -> RotationSnapshot {
        let state = self.state.read().await;
        RotationSnapshot {
            generation: state.generation,
            source: state.source,
            total: state.entries.len(),
            candidates: state.active_from_cursor(),
        }
    }

    /// Move the cursor past `id` so the next call starts with the key after it.
    ///
    /// Unknown ids (e.g. after a rebuild) are ignored.
    pub async fn record_attempt(&self, id: &str) {
        let mut state = self.state.write().await;
        if let Some(idx) = state.position(id) {
            state.cursor = (idx + 1) % state.entries.len();
        }
    }

    /// Mark a key `Invalid`. Idempotent; returns whether the status changed.
    pub async fn mark_invalid(&self, id: &str) -> bool {
        let mut state = self.state.write().await;
        Self::invalidate(&mut state, id)
    }

    /// Like `mark_invalid`, but only if the pool has not been rebuilt since
    /// `generation` was observed. A failure seen on a key from an older
    /// build says nothing about the entry that replaced it.
    pub async fn mark_invalid_in(&self, generation: u64, id: &str) -> bool {
        let mut state = self.state.write().await;
        if state.generation != generation {
            debug!(
                key_id = id,
                generation,
                current = state.generation,
                "pool rebuilt since attempt, not invalidating"
            );
            return false;
        }
        Self::invalidate(&mut state, id)
    }

    fn invalidate(state: &mut PoolState, id: &str) -> bool {
        let Some(idx) = state.position(id) else {
            debug!(key_id = id, "mark_invalid for key not in pool, ignoring");
            return false;
        };
        let entry = &mut state.entries[idx];
        if entry.status == KeyStatus::Invalid {
            return false;
        }
        entry.status = KeyStatus::Invalid;
        warn!(key_id = id, "key marked invalid");
        true
    }

    /// Whether `id` is in the pool and active.
    pub async fn is_active(&self, id: &str) -> bool {
        self.status(id).await == Some(KeyStatus::Active)
    }

    pub async fn status(&self, id: &str) -> Option<KeyStatus> {
        let state = self.state.read().await;
        state.position(id).map(|idx| state.entries[idx].status)
    }

    pub async fn source(&self) -> KeySource {
        self.state.read().await.source
    }

    /// Total keys in the pool, active or not.
    pub async fn total(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn active_count(&self) -> usize {
        self.state.read().await.active_count()
    }

    /// Pool summary for health and key management endpoints.
    ///
    /// Status mapping: all active → healthy, some active → degraded,
    /// none active (or no keys) → unhealthy. Secrets appear masked only.
    pub async fn health(&self) -> serde_json::Value {
        let state = self.state.read().await;
        let total = state.entries.len();
        let active = state.active_count();

        let keys: Vec<serde_json::Value> = state
            .entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "id": e.credential.id,
                    "masked": e.credential.masked(),
                    "status": e.status.label(),
                })
            })
            .collect();

        let status = if active == total && total > 0 {
            "healthy"
        } else if active > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "source": state.source.label(),
            "keys_total": total,
            "keys_active": active,
            "keys_invalid": total - active,
            "keys": keys,
        })
    }
}
