//! Error types for generative calls
//!
//! Upstream errors (`Http`, `Api`) carry the status and message text in their
//! `Display` output, because key rotation classifies them from that text.
//! Errors raised by this crate's own checks are always fatal to rotation;
//! their text is never matched. The remaining variants only appear once
//! rotation has finished.

use key_pool::{AggregateFailure, FailureClass, KeyFailure, KeySource, RotationError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport failure before a response arrived.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The service answered with a non-success status.
    #[error("upstream returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The service answered 2xx but the payload is missing or malformed.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Caller input rejected before any key was used.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no API key configured: add your own API key or configure a system key")]
    NotConfigured,

    #[error("{0}")]
    KeysExhausted(AggregateFailure),
}

impl Error {
    /// Whether the user should be prompted for new keys.
    pub fn needs_new_keys(&self) -> bool {
        matches!(self, Error::NotConfigured | Error::KeysExhausted(_))
    }

    /// Which key source ran out, for exhaustion errors.
    pub fn key_source(&self) -> Option<KeySource> {
        match self {
            Error::KeysExhausted(failure) => Some(failure.source),
            _ => None,
        }
    }
}

impl KeyFailure for Error {
    fn failure_class(&self) -> Option<FailureClass> {
        match self {
            Error::Http(_) | Error::Api { .. } => None,
            _ => Some(FailureClass::Fatal),
        }
    }
}

impl From<RotationError<Error>> for Error {
    fn from(err: RotationError<Error>) -> Self {
        match err {
            RotationError::NotConfigured => Error::NotConfigured,
            RotationError::Exhausted(failure) => Error::KeysExhausted(failure),
            RotationError::Fatal(inner) => inner,
        }
    }
}

/// Result alias for generative calls.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_upstream_errors_are_classified_by_message() {
        let classifier = key_pool::FailureClassifier::default();

        let payload = Error::InvalidResponse(
            "image data is not valid base64: Invalid symbol 33, offset 403.".into(),
        );
        assert_eq!(classifier.classify_error(&payload), FailureClass::Fatal);
        let input = Error::InvalidRequest("prompt of 429 words".into());
        assert_eq!(classifier.classify_error(&input), FailureClass::Fatal);

        let rejected = Error::Api {
            status: 403,
            message: "PERMISSION_DENIED".into(),
        };
        assert_eq!(classifier.classify_error(&rejected), FailureClass::Auth);
        let transport = Error::Http("request timed out: deadline elapsed".into());
        assert_eq!(classifier.classify_error(&transport), FailureClass::Retryable);
    }

    #[test]
    fn fatal_rotation_error_is_unwrapped() {
        let err: Error = RotationError::Fatal(Error::InvalidResponse("no image data".into())).into();
        assert!(matches!(err, Error::InvalidResponse(ref m) if m == "no image data"));
        assert!(!err.needs_new_keys());
    }

    #[test]
    fn exhaustion_keeps_key_source() {
        let err: Error = RotationError::<Error>::Exhausted(AggregateFailure {
            source: KeySource::System,
            attempts: 2,
            last_error: Some("429".into()),
        })
        .into();
        assert!(err.needs_new_keys());
        assert_eq!(err.key_source(), Some(KeySource::System));
    }

    #[test]
    fn api_error_display_carries_status_for_classification() {
        let err = Error::Api {
            status: 429,
            message: "Resource has been exhausted (RESOURCE_EXHAUSTED)".into(),
        };
        assert_eq!(
            err.to_string(),
            "upstream returned 429: Resource has been exhausted (RESOURCE_EXHAUSTED)"
        );
    }
}
