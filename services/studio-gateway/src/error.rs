//! Service-specific error types

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Startup errors of the gateway.
///
/// Per-request errors are turned into JSON responses by the handlers
/// (`api::error_response`); they never propagate as Rust errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to open user key store {path}: {source}")]
    KeyStore {
        path: PathBuf,
        source: key_pool::Error,
    },

    #[error("failed to create upstream client: {0}")]
    Upstream(#[from] genai::Error),

    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages_are_descriptive() {
        let err = Error::KeyStore {
            path: PathBuf::from("/var/lib/studio/keys.json"),
            source: key_pool::Error::Io("permission denied".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("/var/lib/studio/keys.json"));
        assert!(msg.contains("permission denied"));

        let err = Error::Bind {
            addr: "127.0.0.1:8080".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().starts_with("failed to bind 127.0.0.1:8080"));
    }

    #[test]
    fn error_debug_includes_variant_name() {
        let err = Error::Metrics("already installed".into());
        let debug = format!("{err:?}");
        assert!(
            debug.contains("Metrics"),
            "Debug output must include variant name, got: {debug}"
        );
    }
}
