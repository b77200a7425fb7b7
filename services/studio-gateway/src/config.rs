//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! System API keys come from GEMINI_API_KEY, API_KEY or system_keys_file,
//! never from the TOML directly to avoid leaking secrets.

use common::Secret;
use genai::StudioSettings;
use key_pool::{FailureClassifier, RetryPolicy, parse_key_list};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env vars holding system keys, in precedence order.
const SYSTEM_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Largest accepted request body (first frames for video are inline)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Generative service endpoint
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Key sources
#[derive(Debug, Default, Deserialize)]
pub struct KeysConfig {
    /// JSON file holding the user's saved keys. Without it, saved keys live
    /// only as long as the process.
    #[serde(default)]
    pub user_keys_file: Option<PathBuf>,
    /// File with comma-separated system keys (alternative to GEMINI_API_KEY)
    #[serde(default)]
    pub system_keys_file: Option<PathBuf>,
    #[serde(skip)]
    pub system_keys: Option<Secret<String>>,
}

/// Failure message patterns. Omitted lists keep the built-in defaults.
#[derive(Debug, Default, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub auth_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub retryable_patterns: Option<Vec<String>>,
}

/// Adapter tunables
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub text_model: String,
    pub image_model: String,
    pub speech_model: String,
    pub image_max_attempts: u32,
    pub image_base_delay_ms: u64,
    pub image_max_delay_ms: u64,
    pub image_rate_limit_delay_ms: u64,
    pub image_jitter: bool,
    /// Minimum spacing between images of a batch
    pub image_interval_ms: u64,
    pub video_poll_interval_ms: u64,
    pub video_timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        let studio = StudioSettings::default();
        let retry = studio.image_retry;
        Self {
            text_model: studio.text_model,
            image_model: studio.image_model,
            speech_model: studio.speech_model,
            image_max_attempts: retry.max_attempts,
            image_base_delay_ms: retry.base_delay.as_millis() as u64,
            image_max_delay_ms: retry.max_delay.as_millis() as u64,
            image_rate_limit_delay_ms: retry.rate_limit_delay.as_millis() as u64,
            image_jitter: retry.jitter,
            image_interval_ms: studio.image_interval.as_millis() as u64,
            video_poll_interval_ms: studio.video_poll_interval.as_millis() as u64,
            video_timeout_secs: studio.video_timeout.as_secs(),
        }
    }
}

fn default_base_url() -> String {
    genai::constants::DEFAULT_BASE_URL.to_string()
}

fn default_timeout() -> u64 {
    120
}

fn default_max_connections() -> usize {
    256
}

fn default_max_body_bytes() -> usize {
    20 * 1024 * 1024
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// System key resolution order:
    /// 1. GEMINI_API_KEY env var
    /// 2. API_KEY env var
    /// 3. system_keys_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        let from_env = SYSTEM_KEY_VARS
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|value| !value.trim().is_empty());
        if let Some(keys) = from_env {
            config.keys.system_keys = Some(Secret::new(keys));
        } else if let Some(ref key_file) = config.keys.system_keys_file {
            let keys = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read system_keys_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let keys = keys.trim().to_owned();
            if !keys.is_empty() {
                config.keys.system_keys = Some(Secret::new(keys));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let base_url = &self.upstream.base_url;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {base_url}"
            )));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.generation.image_max_attempts == 0 {
            return Err(common::Error::Config(
                "image_max_attempts must be greater than 0".into(),
            ));
        }
        if self.generation.video_poll_interval_ms == 0 || self.generation.video_timeout_secs == 0 {
            return Err(common::Error::Config(
                "video_poll_interval_ms and video_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// System keys as a normalized list (comma-separated source).
    pub fn system_key_list(&self) -> Vec<String> {
        self.keys
            .system_keys
            .as_ref()
            .map(|keys| parse_key_list(keys.expose()))
            .unwrap_or_default()
    }

    pub fn classifier(&self) -> FailureClassifier {
        match (
            &self.classifier.auth_patterns,
            &self.classifier.retryable_patterns,
        ) {
            (None, None) => FailureClassifier::default(),
            (auth, retryable) => FailureClassifier::new(
                auth.clone().unwrap_or_else(|| owned(key_pool::classify::DEFAULT_AUTH_PATTERNS)),
                retryable
                    .clone()
                    .unwrap_or_else(|| owned(key_pool::classify::DEFAULT_RETRYABLE_PATTERNS)),
            ),
        }
    }

    pub fn studio_settings(&self) -> StudioSettings {
        let g = &self.generation;
        StudioSettings {
            text_model: g.text_model.clone(),
            image_model: g.image_model.clone(),
            speech_model: g.speech_model.clone(),
            image_retry: RetryPolicy {
                max_attempts: g.image_max_attempts,
                base_delay: Duration::from_millis(g.image_base_delay_ms),
                max_delay: Duration::from_millis(g.image_max_delay_ms),
                rate_limit_delay: Duration::from_millis(g.image_rate_limit_delay_ms),
                jitter: g.image_jitter,
            },
            image_interval: Duration::from_millis(g.image_interval_ms),
            video_poll_interval: Duration::from_millis(g.video_poll_interval_ms),
            video_timeout: Duration::from_secs(g.video_timeout_secs),
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("studio-gateway.toml")
    }
}

fn owned(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|p| p.to_string()).collect()
}
