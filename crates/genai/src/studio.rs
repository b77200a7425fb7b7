//! Content adapters
//!
//! Each operation builds one request, runs it through key rotation, and
//! validates the payload shape before returning it. A payload that is missing
//! or malformed is an `InvalidResponse`, which rotation treats as fatal:
//! another key would get the same answer.

use std::future::Future;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use key_pool::{Credential, KeyPool, RetryPolicy, Rotator, Throttle, retry_with_backoff};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::client::GenAiClient;
use crate::constants::{IMAGE_MODEL, SPEECH_MODEL, TEXT_MODEL};
use crate::error::{Error, Result};
use crate::types::{
    AspectRatio, Gender, LyricLine, Lyrics, Media, Scene, StoryIdea, UgcScene, VideoRequest, Voice,
};
use crate::wire::{
    GenerateContentRequest, GenerateContentResponse, GenerationConfig, ImageConfig,
    PredictRequest, PrebuiltVoiceConfig, SpeechConfig, VideoImage, VideoInstance, VideoParameters,
    VoiceConfig,
};

const STORY_IDEA_COUNT: usize = 8;
const STORY_SCENE_COUNT: usize = 8;
const UGC_SCENE_COUNT: usize = 7;

/// Largest image batch: one image per UGC scene.
pub const MAX_UGC_IMAGES: usize = UGC_SCENE_COUNT;

/// Returned by `lyrics` when search finds nothing.
pub const LYRICS_NOT_FOUND: &str = "Lyrics not found.";

/// Tunables for the adapters.
#[derive(Debug, Clone)]
pub struct StudioSettings {
    pub text_model: String,
    pub image_model: String,
    pub speech_model: String,
    /// Same-key retry for image generation.
    pub image_retry: RetryPolicy,
    /// Minimum spacing between images of a batch.
    pub image_interval: Duration,
    pub video_poll_interval: Duration,
    /// Give up on a video operation after this long.
    pub video_timeout: Duration,
}

impl Default for StudioSettings {
    fn default() -> Self {
        Self {
            text_model: TEXT_MODEL.to_string(),
            image_model: IMAGE_MODEL.to_string(),
            speech_model: SPEECH_MODEL.to_string(),
            image_retry: RetryPolicy::default(),
            image_interval: Duration::from_secs(30),
            video_poll_interval: Duration::from_secs(5),
            video_timeout: Duration::from_secs(600),
        }
    }
}

pub struct Studio {
    rotator: Rotator,
    client: GenAiClient,
    settings: StudioSettings,
    image_throttle: Throttle,
}

impl Studio {
    pub fn new(rotator: Rotator, client: GenAiClient, settings: StudioSettings) -> Self {
        let image_throttle = Throttle::new(settings.image_interval);
        Self {
            rotator,
            client,
            settings,
            image_throttle,
        }
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        self.rotator.pool()
    }

    /// Short story premises for a genre.
    pub async fn story_ideas(&self, genre: &str) -> Result<Vec<StoryIdea>> {
        let genre = require("genre", genre)?;
        let request = GenerateContentRequest::prompt(format!(
            "Generate {STORY_IDEA_COUNT} creative and unique story ideas for the genre \"{genre}\". \
             Return a JSON array of strings."
        ))
        .with_config(GenerationConfig::json(json!({
            "type": "ARRAY",
            "items": {"type": "STRING"}
        })));

        let response = self.generate(&self.settings.text_model, &request).await?;
        let texts: Vec<String> = parse_json(&response, "story ideas")?;
        let batch = uuid::Uuid::new_v4().simple().to_string();
        Ok(texts
            .into_iter()
            .enumerate()
            .map(|(i, text)| StoryIdea {
                id: format!("{batch}-{i}"),
                text,
            })
            .collect())
    }

    /// Rewrite a story more vividly; returns the input if nothing comes back.
    pub async fn polish_story(&self, text: &str) -> Result<String> {
        let text = require("text", text)?;
        let request = GenerateContentRequest::prompt(format!(
            "Polish the following story to make it more engaging and descriptive \
             while keeping the same plot:\n\n{text}"
        ));
        let response = self.generate(&self.settings.text_model, &request).await?;
        Ok(response.text().unwrap_or_else(|| text.to_string()))
    }

    /// Full story from a plot, structured so it splits into scenes.
    pub async fn full_story(&self, plot: &str, genre: &str, gender: Gender) -> Result<String> {
        let plot = require("plot", plot)?;
        let protagonist = match gender {
            Gender::Male => " The main character is male.",
            Gender::Female => " The main character is female.",
            Gender::Unspecified => "",
        };
        let request = GenerateContentRequest::prompt(format!(
            "Write a complete, well-structured story based on this plot: \"{plot}\". \
             Genre: {genre}.{protagonist} Structure it in {STORY_SCENE_COUNT} parts: setup, \
             inciting incident, reaction, rising action, midpoint, crisis, climax, resolution."
        ));
        let response = self.generate(&self.settings.text_model, &request).await?;
        Ok(response
            .text()
            .map(|t| t.trim().to_string())
            .unwrap_or_default())
    }

    /// Split a story into illustrated, narrated scenes.
    pub async fn story_scenes(&self, story: &str, character: Option<&str>) -> Result<Vec<Scene>> {
        let story = require("story", story)?;
        let character = character
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or("A main character");
        let request = GenerateContentRequest::prompt(format!(
            "Split the story below into exactly {STORY_SCENE_COUNT} key scenes. Start every \
             imagePrompt with this character description, unchanged: \"{character}\". \
             For each scene return \"imagePrompt\" (detailed, English) and \"narration\" \
             (2-3 sentences).\n\nSTORY:\n{story}"
        ))
        .with_config(GenerationConfig::json(json!({
            "type": "ARRAY",
            "items": {
                "type": "OBJECT",
                "properties": {
                    "imagePrompt": {"type": "STRING"},
                    "narration": {"type": "STRING"}
                },
                "required": ["imagePrompt", "narration"]
            }
        })));
        let response = self.generate(&self.settings.text_model, &request).await?;
        parse_json(&response, "story scenes")
    }

    /// One image. Each key is retried with backoff before rotation moves on.
    pub async fn image(&self, prompt: &str, aspect_ratio: AspectRatio) -> Result<Media> {
        let prompt = require("prompt", prompt)?;
        let request = GenerateContentRequest::prompt(format!(
            "Create a high-quality image based on this description: {prompt}\n\n\
             Requirements: cinematic lighting, photorealistic, highly detailed."
        ))
        .with_config(GenerationConfig {
            response_modalities: Some(vec!["IMAGE".into()]),
            image_config: Some(ImageConfig {
                aspect_ratio: aspect_ratio.as_str().into(),
            }),
            ..GenerationConfig::default()
        });

        let policy = &self.settings.image_retry;
        let classifier = self.rotator.classifier();
        let request = &request;
        self.rotate(|credential| async move {
            retry_with_backoff(policy, classifier, || self.image_once(&credential, request)).await
        })
        .await
    }

    async fn image_once(&self, credential: &Credential, request: &GenerateContentRequest) -> Result<Media> {
        let response = self
            .client
            .generate_content(credential.secret(), &self.settings.image_model, request)
            .await?;
        decode_inline(&response, "image")
    }

    /// Narration audio (raw PCM as returned by the service).
    pub async fn speech(&self, text: &str, voice: Voice) -> Result<Media> {
        let text = require("text", text)?;
        let request = GenerateContentRequest::prompt(text).with_config(GenerationConfig {
            response_modalities: Some(vec!["AUDIO".into()]),
            speech_config: Some(SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: voice.as_str().into(),
                    },
                },
            }),
            ..GenerationConfig::default()
        });
        let response = self.generate(&self.settings.speech_model, &request).await?;
        decode_inline(&response, "audio")
    }

    /// Song lyrics found through search grounding.
    pub async fn lyrics(&self, query: &str) -> Result<Lyrics> {
        let query = require("query", query)?;
        let request = GenerateContentRequest::prompt(format!(
            "Find the lyrics for: \"{query}\". If it is a URL, find the song lyrics on that \
             page. Return the full lyrics."
        ))
        .with_search();
        let response = self.generate(&self.settings.text_model, &request).await?;
        Ok(Lyrics {
            lyrics: response
                .text()
                .unwrap_or_else(|| LYRICS_NOT_FOUND.to_string()),
            sources: response.web_sources(),
        })
    }

    /// Line-by-line translation.
    pub async fn translate_lyrics(&self, text: &str, language: &str) -> Result<Vec<LyricLine>> {
        let text = require("text", text)?;
        let language = require("language", language)?;
        let request = GenerateContentRequest::prompt(format!(
            "Translate the following lyrics to {language}. Return a JSON array of objects \
             with \"original\" and \"translated\" keys, one per line.\n\nLYRICS:\n{text}"
        ))
        .with_config(GenerationConfig::json(json!({
            "type": "ARRAY",
            "items": {
                "type": "OBJECT",
                "properties": {
                    "original": {"type": "STRING"},
                    "translated": {"type": "STRING"}
                }
            }
        })));
        let response = self.generate(&self.settings.text_model, &request).await?;
        parse_json(&response, "lyric translation")
    }

    /// Scene-by-scene script for a short user-generated-content video.
    pub async fn ugc_scripts(&self, scenario: &str, language: &str) -> Result<Vec<UgcScene>> {
        let scenario = require("scenario", scenario)?;
        let language = require("language", language)?;
        let request = GenerateContentRequest::prompt(format!(
            "Create a {UGC_SCENE_COUNT}-scene UGC video script based on \"{scenario}\" in \
             language {language}. Return a JSON array of objects with keys \"visual_prompt\" \
             and \"spoken_script\". Every visual_prompt describes a full body shot of the \
             same person in a consistent outfit."
        ))
        .with_config(GenerationConfig::json(json!({
            "type": "ARRAY",
            "items": {
                "type": "OBJECT",
                "properties": {
                    "visual_prompt": {"type": "STRING"},
                    "spoken_script": {"type": "STRING"}
                }
            }
        })));
        let response = self.generate(&self.settings.text_model, &request).await?;
        parse_json(&response, "UGC scripts")
    }

    /// Images for a list of prompts, one after another behind the image
    /// throttle. A failed image is recorded in its slot and the batch goes
    /// on; running out of keys stops the batch. At most `MAX_UGC_IMAGES`
    /// prompts are accepted.
    pub async fn ugc_images(
        &self,
        prompts: &[String],
        aspect_ratio: AspectRatio,
    ) -> Result<Vec<Result<Media>>> {
        if prompts.is_empty() {
            return Err(Error::InvalidRequest("prompts must not be empty".into()));
        }
        if prompts.len() > MAX_UGC_IMAGES {
            return Err(Error::InvalidRequest(format!(
                "at most {MAX_UGC_IMAGES} prompts per batch, got {}",
                prompts.len()
            )));
        }
        let mut results = Vec::with_capacity(prompts.len());
        for (index, prompt) in prompts.iter().enumerate() {
            self.image_throttle.wait().await;
            match self.image(prompt, aspect_ratio).await {
                Ok(media) => results.push(Ok(media)),
                Err(e) if e.needs_new_keys() => return Err(e),
                Err(e) => {
                    warn!(index, error = %e, "image in batch failed");
                    results.push(Err(e));
                }
            }
        }
        Ok(results)
    }

    /// Generate a video clip and download it with the key that produced it.
    pub async fn video(&self, request: &VideoRequest) -> Result<Media> {
        require("prompt", &request.prompt)?;
        let body = PredictRequest {
            instances: vec![VideoInstance {
                prompt: request.prompt.trim().to_string(),
                image: request.image.as_ref().map(|image| VideoImage {
                    bytes_base64_encoded: image.base64(),
                    mime_type: image.mime_type.clone(),
                }),
            }],
            parameters: VideoParameters {
                aspect_ratio: request.aspect_ratio.as_str().into(),
                resolution: request.resolution.as_str().into(),
                sample_count: 1,
            },
        };
        let model = request.model.as_str();
        let body = &body;
        self.rotate(|credential| async move { self.video_once(&credential, model, body).await })
            .await
    }

    async fn video_once(&self, credential: &Credential, model: &str, body: &PredictRequest) -> Result<Media> {
        let key = credential.secret();
        let mut operation = self.client.start_video(key, model, body).await?;
        info!(model, operation = %operation.name, key_id = credential.id(), "video generation started");

        let deadline = tokio::time::Instant::now() + self.settings.video_timeout;
        while !operation.done {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::InvalidResponse(format!(
                    "video generation did not finish within {}s",
                    self.settings.video_timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.settings.video_poll_interval).await;
            operation = self.client.poll_operation(key, &operation.name).await?;
            debug!(operation = %operation.name, done = operation.done, "polled video operation");
        }

        if let Some(err) = &operation.error {
            return Err(Error::Api {
                status: err.code,
                message: err.message.clone(),
            });
        }
        let uri = operation
            .video_uri()
            .ok_or_else(|| Error::InvalidResponse("video operation finished without a video".into()))?;
        let data = self.client.download(key, uri).await?;
        if data.is_empty() {
            return Err(Error::InvalidResponse("downloaded video is empty".into()));
        }
        Ok(Media::new("video/mp4", data))
    }

    async fn generate(&self, model: &str, request: &GenerateContentRequest) -> Result<GenerateContentResponse> {
        self.rotate(|credential| async move {
            self.client
                .generate_content(credential.secret(), model, request)
                .await
        })
        .await
    }

    async fn rotate<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.rotator.execute(operation).await.map_err(Error::from)
    }
}

fn require<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidRequest(format!("{field} must not be empty")));
    }
    Ok(trimmed)
}

/// Remove a surrounding Markdown code fence, if any.
fn strip_json_fence(text: &str) -> &str {
    let text = text.trim();
    let text = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .unwrap_or(text);
    text.strip_suffix("```").unwrap_or(text).trim()
}

/// Decode a JSON array reply. No text at all counts as an empty array.
fn parse_json<T: DeserializeOwned>(response: &GenerateContentResponse, what: &str) -> Result<Vec<T>> {
    let Some(text) = response.text() else {
        return Ok(Vec::new());
    };
    serde_json::from_str(strip_json_fence(&text))
        .map_err(|e| Error::InvalidResponse(format!("{what}: expected a JSON array: {e}")))
}

fn decode_inline(response: &GenerateContentResponse, what: &str) -> Result<Media> {
    let Some(inline) = response.inline_data() else {
        let reason = response
            .block_reason()
            .map(|r| format!(" (finish reason: {r})"))
            .unwrap_or_default();
        return Err(Error::InvalidResponse(format!("no {what} data returned{reason}")));
    };
    let data = STANDARD
        .decode(inline.data.trim())
        .map_err(|e| Error::InvalidResponse(format!("{what} data is not valid base64: {e}")))?;
    if data.is_empty() {
        return Err(Error::InvalidResponse(format!("{what} data is empty")));
    }
    Ok(Media::new(inline.mime_type.clone(), data))
}
