//! Failure classification from error messages
//!
//! The generative service does not return structured error types reliably, so
//! failures are classified by matching known phrases in the error message.
//! Both pattern lists are configuration: they can be replaced without touching
//! the rotation loop.
//!
//! Authorization patterns are checked first. A message matching neither list
//! is fatal: another key cannot fix a malformed request.

use std::fmt;

/// Phrases meaning the key itself was rejected.
pub const DEFAULT_AUTH_PATTERNS: &[&str] = &[
    "api key not valid",
    "api_key_invalid",
    "invalid api key",
    "api key expired",
    "permission denied",
    "permission_denied",
    "forbidden",
    "unauthenticated",
    "401",
    "403",
];

/// Phrases meaning a temporary condition unrelated to key validity.
pub const DEFAULT_RETRYABLE_PATTERNS: &[&str] = &[
    "429",
    "resource_exhausted",
    "rate limit",
    "quota",
    "too many requests",
    "500",
    "502",
    "503",
    "504",
    "unavailable",
    "overloaded",
    "internal error",
    "timed out",
    "deadline exceeded",
];

/// Outcome of classifying one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Key rejected: disable it and try the next one
    Auth,
    /// Temporary: try the next key, keep this one active
    Retryable,
    /// Caller's problem: stop and surface the error
    Fatal,
}

impl FailureClass {
    pub fn label(&self) -> &'static str {
        match self {
            FailureClass::Auth => "auth",
            FailureClass::Retryable => "retryable",
            FailureClass::Fatal => "fatal",
        }
    }
}

/// Error type of an operation run under rotation or same-key retry.
///
/// An error that already knows its class (typically a payload check done by
/// the caller itself) returns it from `failure_class` and its message is never
/// matched against the patterns. Everything else is classified by message.
pub trait KeyFailure: fmt::Display {
    fn failure_class(&self) -> Option<FailureClass> {
        None
    }
}

impl KeyFailure for String {}

/// Pattern-based classifier. Matching is case-insensitive.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    auth_patterns: Vec<String>,
    retryable_patterns: Vec<String>,
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_AUTH_PATTERNS, DEFAULT_RETRYABLE_PATTERNS)
    }
}

impl FailureClassifier {
    pub fn new<A, R>(auth_patterns: A, retryable_patterns: R) -> Self
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        R: IntoIterator,
        R::Item: AsRef<str>,
    {
        Self {
            auth_patterns: lowercase_patterns(auth_patterns),
            retryable_patterns: lowercase_patterns(retryable_patterns),
        }
    }

    pub fn is_auth_failure(&self, message: &str) -> bool {
        matches_any(message, &self.auth_patterns)
    }

    pub fn is_retryable_failure(&self, message: &str) -> bool {
        matches_any(message, &self.retryable_patterns)
    }

    /// Class of an operation error: its own answer if it has one, otherwise
    /// the message patterns.
    pub fn classify_error<E: KeyFailure + ?Sized>(&self, err: &E) -> FailureClass {
        err.failure_class()
            .unwrap_or_else(|| self.classify(&err.to_string()))
    }

    pub fn classify(&self, message: &str) -> FailureClass {
        if self.is_auth_failure(message) {
            FailureClass::Auth
        } else if self.is_retryable_failure(message) {
            FailureClass::Retryable
        } else {
            FailureClass::Fatal
        }
    }
}

fn lowercase_patterns<I>(patterns: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    patterns
        .into_iter()
        .map(|p| p.as_ref().trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect()
}

fn matches_any(message: &str, patterns: &[String]) -> bool {
    let lower = message.to_lowercase();
    patterns.iter().any(|p| contains_pattern(&lower, p))
}

/// Substring match, except that an all-digit pattern (a status code) must
/// not be part of a longer number.
fn contains_pattern(haystack: &str, pattern: &str) -> bool {
    if !pattern.bytes().all(|b| b.is_ascii_digit()) {
        return haystack.contains(pattern);
    }
    haystack.match_indices(pattern).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + pattern.len()..].chars().next();
        !before.is_some_and(|c| c.is_ascii_digit()) && !after.is_some_and(|c| c.is_ascii_digit())
    })
}
