//! Key rotation around a single logical call
//!
//! `Rotator::execute` runs an operation once per active key, in rotation
//! order, until one attempt succeeds:
//!
//! ```text
//! Selecting → Invoking → Success
//!                      → Classifying → Auth      → mark invalid → Selecting
//!                                    → Retryable → record       → Selecting
//!                                    → Fatal     → return error unchanged
//! (no candidates left) → Exhausted
//! ```
//!
//! Candidates are tried strictly one after another. The number of attempts is
//! bounded by the number of keys active when the call started.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::classify::{FailureClass, FailureClassifier, KeyFailure};
use crate::pool::{Credential, KeyPool, KeySource};

/// Every active key was tried and none succeeded.
#[derive(Debug, Clone)]
pub struct AggregateFailure {
    /// Whose keys ran out; decides the remedy shown to the user.
    pub source: KeySource,
    /// Number of keys actually invoked.
    pub attempts: usize,
    /// Message of the last per-key failure, for diagnostics.
    pub last_error: Option<String>,
}

impl AggregateFailure {
    /// What the user should do about it.
    pub fn remedy(&self) -> &'static str {
        match self.source {
            KeySource::User => "check your API keys or replace them with working ones",
            KeySource::System => "the shared API keys are used up; add your own API key to continue",
        }
    }
}

impl fmt::Display for AggregateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            KeySource::User => write!(f, "all of your API keys failed ({} tried)", self.attempts)?,
            KeySource::System => {
                write!(f, "all system API keys failed ({} tried)", self.attempts)?
            }
        }
        write!(f, ": {}", self.remedy())?;
        if let Some(last) = &self.last_error {
            write!(f, " (last error: {last})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateFailure {}

/// Error from a rotated call.
#[derive(Debug, thiserror::Error)]
pub enum RotationError<E> {
    /// No keys configured at all; nothing was attempted.
    #[error("no API key configured: add your own API key or configure a system key")]
    NotConfigured,

    /// Every active key failed with an auth or transient error.
    #[error("{0}")]
    Exhausted(AggregateFailure),

    /// The operation's own error, returned as-is.
    #[error("{0}")]
    Fatal(E),
}

impl<E> RotationError<E> {
    /// Whether the user should be prompted for new keys.
    pub fn needs_new_keys(&self) -> bool {
        matches!(self, RotationError::NotConfigured | RotationError::Exhausted(_))
    }
}

/// Runs operations against the key pool with rotation.
#[derive(Clone)]
pub struct Rotator {
    pool: Arc<KeyPool>,
    classifier: FailureClassifier,
}

impl Rotator {
    pub fn new(pool: Arc<KeyPool>, classifier: FailureClassifier) -> Self {
        Self { pool, classifier }
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    pub fn classifier(&self) -> &FailureClassifier {
        &self.classifier
    }

    /// Invoke `operation` with each active key in turn until one succeeds.
    ///
    /// - Auth failure: key marked invalid, next key tried immediately
    /// - Retryable failure: next key tried immediately, key stays active
    /// - Any other failure: returned as `RotationError::Fatal` right away
    ///
    /// A key invalidated by a concurrent call after this call took its
    /// snapshot is skipped without being invoked.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, RotationError<E>>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: KeyFailure,
    {
        let snapshot = self.pool.snapshot().await;
        if snapshot.total == 0 {
            warn!("no API keys configured, nothing to try");
            return Err(RotationError::NotConfigured);
        }

        let mut attempts = 0usize;
        let mut last_error: Option<String> = None;

        for credential in snapshot.candidates {
            let key_id = credential.id().to_string();
            if !self.pool.is_active(&key_id).await {
                debug!(key_id, "key invalidated since snapshot, skipping");
                continue;
            }

            self.pool.record_attempt(&key_id).await;
            attempts += 1;

            let err = match operation(credential).await {
                Ok(value) => {
                    record_attempt_outcome("success");
                    debug!(key_id, attempts, "call succeeded");
                    return Ok(value);
                }
                Err(e) => e,
            };

            let message = err.to_string();
            let class = self.classifier.classify_error(&err);
            record_attempt_outcome(class.label());

            match class {
                FailureClass::Auth => {
                    warn!(key_id, error = %message, "key rejected, marking invalid and rotating");
                    self.pool.mark_invalid_in(snapshot.generation, &key_id).await;
                    last_error = Some(message);
                }
                FailureClass::Retryable => {
                    warn!(key_id, error = %message, "transient failure, rotating to next key");
                    last_error = Some(message);
                }
                FailureClass::Fatal => {
                    debug!(key_id, error = %message, "non-retryable failure, stopping rotation");
                    return Err(RotationError::Fatal(err));
                }
            }
        }

        let failure = AggregateFailure {
            source: snapshot.source,
            attempts,
            last_error,
        };
        error!(
            source = failure.source.label(),
            attempts, "all API keys exhausted"
        );
        Err(RotationError::Exhausted(failure))
    }
}

fn record_attempt_outcome(outcome: &'static str) {
    metrics::counter!("genai_key_attempts_total", "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::KeyStatus;
    use crate::store::KeyStore;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct CallError(String);

    impl fmt::Display for CallError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl KeyFailure for CallError {}

    async fn rotator(keys: &[&str]) -> Rotator {
        let pool = KeyPool::new(
            KeyStore::ephemeral(),
            keys.iter().map(|k| k.to_string()).collect(),
        )
        .await;
        Rotator::new(Arc::new(pool), FailureClassifier::default())
    }

    /// Operation that records every key it was called with and answers from
    /// `respond`.
    fn scripted(
        calls: &Arc<Mutex<Vec<String>>>,
        respond: impl Fn(&str) -> Result<String, CallError>,
    ) -> impl FnMut(Credential) -> std::future::Ready<Result<String, CallError>> {
        let calls = calls.clone();
        move |credential: Credential| {
            let key = credential.secret().expose().clone();
            calls.lock().unwrap().push(key.clone());
            std::future::ready(respond(&key))
        }
    }

    #[tokio::test]
    async fn first_success_returns_immediately() {
        let rotator = rotator(&["a", "b", "c"]).await;
        let calls = Arc::new(Mutex::new(Vec::new()));

        let out = rotator
            .execute(scripted(&calls, |key| Ok(format!("ok from {key}"))))
            .await
            .unwrap();

        assert_eq!(out, "ok from a");
        assert_eq!(*calls.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn auth_failures_invalidate_and_rotate_to_success() {
        let rotator = rotator(&["a", "b", "c"]).await;
        let calls = Arc::new(Mutex::new(Vec::new()));

        let out = rotator
            .execute(scripted(&calls, |key| match key {
                "c" => Ok("generated".to_string()),
                _ => Err(CallError("API key not valid. Please pass a valid API key.".into())),
            }))
            .await
            .unwrap();

        assert_eq!(out, "generated");
        assert_eq!(*calls.lock().unwrap(), vec!["a", "b", "c"]);

        let pool = rotator.pool();
        assert_eq!(pool.active_count().await, 1);
        assert_eq!(pool.health().await["keys_invalid"], 2);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_without_invalidating() {
        let rotator = rotator(&["a", "b", "c"]).await;
        let calls = Arc::new(Mutex::new(Vec::new()));

        let err = rotator
            .execute(scripted(&calls, |_| {
                Err::<String, _>(CallError("429 RESOURCE_EXHAUSTED: quota exceeded".into()))
            }))
            .await
            .unwrap_err();

        assert_eq!(calls.lock().unwrap().len(), 3);
        match err {
            RotationError::Exhausted(failure) => {
                assert_eq!(failure.attempts, 3);
                assert_eq!(failure.source, KeySource::System);
                assert!(failure.last_error.unwrap().contains("quota"));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(rotator.pool().active_count().await, 3);
    }

    #[tokio::test]
    async fn fatal_failure_stops_after_one_attempt() {
        let rotator = rotator(&["a", "b", "c"]).await;
        let calls = Arc::new(Mutex::new(Vec::new()));

        let err = rotator
            .execute(scripted(&calls, |_| {
                Err::<String, _>(CallError("Invalid JSON payload received".into()))
            }))
            .await
            .unwrap_err();

        assert_eq!(*calls.lock().unwrap(), vec!["a"]);
        match err {
            RotationError::Fatal(e) => assert_eq!(e.0, "Invalid JSON payload received"),
            other => panic!("expected Fatal, got {other:?}"),
        }
        assert_eq!(rotator.pool().active_count().await, 3);
    }

    #[tokio::test]
    async fn no_keys_is_not_configured_and_never_invokes() {
        let rotator = rotator(&[]).await;
        let calls = Arc::new(Mutex::new(Vec::new()));

        let err = rotator
            .execute(scripted(&calls, |_| Ok("unreachable".to_string())))
            .await
            .unwrap_err();

        assert!(matches!(err, RotationError::NotConfigured));
        assert!(err.needs_new_keys());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn all_keys_already_invalid_is_exhausted_with_zero_attempts() {
        let rotator = rotator(&["a"]).await;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let id = crate::pool::fingerprint("a");
        rotator.pool().mark_invalid(&id).await;

        let err = rotator
            .execute(scripted(&calls, |_| Ok("unreachable".to_string())))
            .await
            .unwrap_err();

        match err {
            RotationError::Exhausted(failure) => {
                assert_eq!(failure.attempts, 0);
                assert!(failure.last_error.is_none());
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(rotator.pool().status(&id).await, Some(KeyStatus::Invalid));
    }

    #[tokio::test]
    async fn next_call_starts_after_previous_attempt() {
        let rotator = rotator(&["a", "b", "c"]).await;
        let calls = Arc::new(Mutex::new(Vec::new()));

        // "a" fails transiently, "b" succeeds
        rotator
            .execute(scripted(&calls, |key| match key {
                "a" => Err(CallError("503 unavailable".into())),
                _ => Ok(key.to_string()),
            }))
            .await
            .unwrap();

        let out = rotator
            .execute(scripted(&calls, |key| Ok(key.to_string())))
            .await
            .unwrap();

        assert_eq!(out, "c");
        assert_eq!(*calls.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn user_and_system_exhaustion_messages_differ() {
        let rotator = rotator(&["sys"]).await;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let failing = || scripted(&calls, |_| Err::<String, _>(CallError("429".into())));

        let system_err = rotator.execute(failing()).await.unwrap_err();
        assert!(system_err.to_string().contains("add your own API key"));

        rotator.pool().set_user_credentials(["mine"]).await.unwrap();
        let user_err = rotator.execute(failing()).await.unwrap_err();
        assert!(user_err.to_string().contains("all of your API keys failed"));
        assert!(user_err.to_string().contains("last error: 429"));

        let not_configured: RotationError<CallError> = RotationError::NotConfigured;
        assert_ne!(not_configured.to_string(), user_err.to_string());
    }

    #[tokio::test]
    async fn concurrent_calls_share_invalidations() {
        let rotator = rotator(&["bad", "good"]).await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let rotator = rotator.clone();
            handles.push(tokio::spawn(async move {
                rotator
                    .execute(|credential: Credential| async move {
                        tokio::task::yield_now().await;
                        if credential.secret().expose() == "bad" {
                            Err(CallError("403 Forbidden".into()))
                        } else {
                            Ok(())
                        }
                    })
                    .await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }

        let pool = rotator.pool();
        assert_eq!(pool.active_count().await, 1);
        assert_eq!(
            pool.status(&crate::pool::fingerprint("bad")).await,
            Some(KeyStatus::Invalid)
        );
    }

    #[tokio::test]
    async fn rejection_seen_before_a_rebuild_does_not_invalidate_the_new_entry() {
        let rotator = rotator(&["sys"]).await;
        rotator.pool().set_user_credentials(["mine"]).await.unwrap();
        let pool = rotator.pool().clone();

        // the user re-saves the same key while the call is in flight
        let err = rotator
            .execute(|_credential: Credential| {
                let pool = pool.clone();
                async move {
                    pool.set_user_credentials(["mine"]).await.unwrap();
                    Err::<(), _>(CallError("403 Forbidden".into()))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RotationError::Exhausted(_)));
        let id = crate::pool::fingerprint("mine");
        assert_eq!(rotator.pool().status(&id).await, Some(KeyStatus::Active));
    }
}
