//! Client and content adapters for the generative-AI service
//!
//! `GenAiClient` speaks the REST API with an explicit key per call. `Studio`
//! wraps every call in key rotation (see the `key-pool` crate) and turns the
//! raw responses into checked results:
//!
//! 1. Text: story ideas, polished story, full story, scene breakdown,
//!    lyrics (search grounded), lyric translation, UGC scripts
//! 2. Media: images (same-key backoff, throttled batches), speech, video
//!    (long-running operation, polled, downloaded with the producing key)
//!
//! Errors keep the upstream status and message in their text so rotation
//! can tell rejected keys from rate limits.

pub mod client;
pub mod constants;
pub mod error;
pub mod studio;
pub mod types;
pub mod wire;

pub use client::GenAiClient;
pub use error::{Error, Result};
pub use studio::{Studio, StudioSettings};
pub use types::{
    AspectRatio, Gender, LyricLine, Lyrics, Media, Resolution, Scene, StoryIdea, UgcScene,
    VideoModel, VideoRequest, Voice, WebSource,
};
