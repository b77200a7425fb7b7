//! Generative service endpoints and model names
//!
//! The API key travels in the `x-goog-api-key` header, never in the URL, so
//! it cannot leak into access logs or returned links.

/// Public endpoint of the generative language API
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// API version prefix for every path
pub const API_VERSION: &str = "v1beta";

/// Header carrying the API key
pub const API_KEY_HEADER: &str = "x-goog-api-key";

/// Text, JSON and search-grounded generation
pub const TEXT_MODEL: &str = "gemini-2.5-flash";

/// Image generation (inline image parts)
pub const IMAGE_MODEL: &str = "gemini-2.5-flash-image";

/// Speech synthesis (inline audio parts)
pub const SPEECH_MODEL: &str = "gemini-2.5-flash-preview-tts";
