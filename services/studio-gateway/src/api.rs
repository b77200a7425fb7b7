//! Content generation endpoints
//!
//! Every handler runs one `Studio` operation and answers with JSON (video
//! answers with the raw MP4). Failures use one error body:
//!
//! ```json
//! {"error": {"type": "keys_exhausted", "message": "...", "request_id": "req_...", "key_source": "system"}}
//! ```
//!
//! | type                  | status | when                                   |
//! |-----------------------|--------|----------------------------------------|
//! | `invalid_request`     | 400    | malformed body or empty field          |
//! | `keys_not_configured` | 503    | no key configured at all               |
//! | `keys_exhausted`      | 503    | every active key failed                |
//! | `upstream_error`      | 502    | the service rejected the call          |
//! | `invalid_response`    | 502    | the service answered without a payload |

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use genai::{
    AspectRatio, Gender, Media, Resolution, Studio, VideoModel, VideoRequest, Voice,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{Instrument, info_span, warn};

use crate::metrics::{ServiceMetrics, record_request};

/// State shared by the generation handlers.
#[derive(Clone)]
pub struct ApiState {
    pub studio: Arc<Studio>,
    pub metrics: ServiceMetrics,
}

pub fn build_api_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/story/ideas", post(story_ideas))
        .route("/api/story/polish", post(polish_story))
        .route("/api/story/full", post(full_story))
        .route("/api/story/scenes", post(story_scenes))
        .route("/api/image", post(image))
        .route("/api/speech", post(speech))
        .route("/api/lyrics", post(lyrics))
        .route("/api/lyrics/translate", post(translate_lyrics))
        .route("/api/ugc/scripts", post(ugc_scripts))
        .route("/api/ugc/images", post(ugc_images))
        .route("/api/video", post(video))
        .with_state(state)
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// JSON error body shared by every endpoint.
pub fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    let body = json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Status and `type` for a failed generation.
fn classify_error(err: &genai::Error) -> (StatusCode, &'static str) {
    match err {
        genai::Error::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        genai::Error::NotConfigured => (StatusCode::SERVICE_UNAVAILABLE, "keys_not_configured"),
        genai::Error::KeysExhausted(_) => (StatusCode::SERVICE_UNAVAILABLE, "keys_exhausted"),
        genai::Error::InvalidResponse(_) => (StatusCode::BAD_GATEWAY, "invalid_response"),
        genai::Error::Api { .. } | genai::Error::Http(_) => {
            (StatusCode::BAD_GATEWAY, "upstream_error")
        }
    }
}

fn genai_error_response(err: &genai::Error, request_id: &str) -> Response {
    let (status, error_type) = classify_error(err);
    let mut body = json!({
        "error": {
            "type": error_type,
            "message": err.to_string(),
            "request_id": request_id,
        }
    });
    if let Some(source) = err.key_source() {
        body["error"]["key_source"] = json!(source.label());
    }
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> genai::Result<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| genai::Error::InvalidRequest(rejection.body_text()))
}

/// Run one generation with request accounting, logging and error mapping.
async fn run<Fut>(state: &ApiState, route: &'static str, operation: Fut) -> Response
where
    Fut: Future<Output = genai::Result<Response>>,
{
    let request_id = new_request_id();
    let _in_flight = state.metrics.begin();
    let started = Instant::now();

    let span = info_span!("generate", route, request_id = %request_id);
    let response = match operation.instrument(span).await {
        Ok(response) => response,
        Err(err) => {
            state
                .metrics
                .errors_total
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            warn!(route, request_id = %request_id, error = %err, "generation failed");
            genai_error_response(&err, &request_id)
        }
    };

    record_request(route, response.status().as_u16(), started.elapsed().as_secs_f64());
    response
}

fn ok_json(value: serde_json::Value) -> Response {
    (StatusCode::OK, Json(value)).into_response()
}

/// Base64 media in a JSON body.
#[derive(Debug, Serialize, Deserialize)]
pub struct MediaBody {
    pub mime_type: String,
    pub data: String,
}

impl From<&Media> for MediaBody {
    fn from(media: &Media) -> Self {
        Self {
            mime_type: media.mime_type.clone(),
            data: media.base64(),
        }
    }
}

impl MediaBody {
    fn decode(&self) -> genai::Result<Media> {
        // tolerate a data URL prefix
        let data = self
            .data
            .split_once(',')
            .map_or(self.data.as_str(), |(_, rest)| rest);
        let bytes = STANDARD
            .decode(data.trim())
            .map_err(|e| genai::Error::InvalidRequest(format!("image is not valid base64: {e}")))?;
        Ok(Media::new(self.mime_type.clone(), bytes))
    }
}

#[derive(Deserialize)]
struct IdeasRequest {
    genre: String,
}

async fn story_ideas(
    State(state): State<ApiState>,
    payload: Result<Json<IdeasRequest>, JsonRejection>,
) -> Response {
    run(&state, "story_ideas", async {
        let req = body(payload)?;
        let ideas = state.studio.story_ideas(&req.genre).await?;
        Ok(ok_json(json!({ "ideas": ideas })))
    })
    .await
}

#[derive(Deserialize)]
struct TextRequest {
    text: String,
}

async fn polish_story(
    State(state): State<ApiState>,
    payload: Result<Json<TextRequest>, JsonRejection>,
) -> Response {
    run(&state, "story_polish", async {
        let req = body(payload)?;
        let text = state.studio.polish_story(&req.text).await?;
        Ok(ok_json(json!({ "text": text })))
    })
    .await
}

#[derive(Deserialize)]
struct FullStoryRequest {
    plot: String,
    #[serde(default)]
    genre: String,
    #[serde(default)]
    gender: Gender,
}

async fn full_story(
    State(state): State<ApiState>,
    payload: Result<Json<FullStoryRequest>, JsonRejection>,
) -> Response {
    run(&state, "story_full", async {
        let req = body(payload)?;
        let story = state
            .studio
            .full_story(&req.plot, &req.genre, req.gender)
            .await?;
        Ok(ok_json(json!({ "story": story })))
    })
    .await
}

#[derive(Deserialize)]
struct ScenesRequest {
    story: String,
    #[serde(default)]
    character: Option<String>,
}

async fn story_scenes(
    State(state): State<ApiState>,
    payload: Result<Json<ScenesRequest>, JsonRejection>,
) -> Response {
    run(&state, "story_scenes", async {
        let req = body(payload)?;
        let scenes = state
            .studio
            .story_scenes(&req.story, req.character.as_deref())
            .await?;
        Ok(ok_json(json!({ "scenes": scenes })))
    })
    .await
}

#[derive(Deserialize)]
struct ImageRequest {
    prompt: String,
    #[serde(default)]
    aspect_ratio: AspectRatio,
}

async fn image(
    State(state): State<ApiState>,
    payload: Result<Json<ImageRequest>, JsonRejection>,
) -> Response {
    run(&state, "image", async {
        let req = body(payload)?;
        let image = state.studio.image(&req.prompt, req.aspect_ratio).await?;
        Ok(ok_json(json!({ "image": MediaBody::from(&image) })))
    })
    .await
}

#[derive(Deserialize)]
struct SpeechRequest {
    text: String,
    #[serde(default)]
    voice: Voice,
}

async fn speech(
    State(state): State<ApiState>,
    payload: Result<Json<SpeechRequest>, JsonRejection>,
) -> Response {
    run(&state, "speech", async {
        let req = body(payload)?;
        let audio = state.studio.speech(&req.text, req.voice).await?;
        Ok(ok_json(json!({ "audio": MediaBody::from(&audio) })))
    })
    .await
}

#[derive(Deserialize)]
struct LyricsRequest {
    query: String,
}

async fn lyrics(
    State(state): State<ApiState>,
    payload: Result<Json<LyricsRequest>, JsonRejection>,
) -> Response {
    run(&state, "lyrics", async {
        let req = body(payload)?;
        let lyrics = state.studio.lyrics(&req.query).await?;
        Ok(ok_json(json!(lyrics)))
    })
    .await
}

#[derive(Deserialize)]
struct TranslateRequest {
    text: String,
    language: String,
}

async fn translate_lyrics(
    State(state): State<ApiState>,
    payload: Result<Json<TranslateRequest>, JsonRejection>,
) -> Response {
    run(&state, "lyrics_translate", async {
        let req = body(payload)?;
        let lines = state
            .studio
            .translate_lyrics(&req.text, &req.language)
            .await?;
        Ok(ok_json(json!({ "lines": lines })))
    })
    .await
}

#[derive(Deserialize)]
struct UgcScriptsRequest {
    scenario: String,
    language: String,
}

async fn ugc_scripts(
    State(state): State<ApiState>,
    payload: Result<Json<UgcScriptsRequest>, JsonRejection>,
) -> Response {
    run(&state, "ugc_scripts", async {
        let req = body(payload)?;
        let scenes = state
            .studio
            .ugc_scripts(&req.scenario, &req.language)
            .await?;
        Ok(ok_json(json!({ "scenes": scenes })))
    })
    .await
}

#[derive(Deserialize)]
struct UgcImagesRequest {
    prompts: Vec<String>,
    #[serde(default = "portrait")]
    aspect_ratio: AspectRatio,
}

fn portrait() -> AspectRatio {
    AspectRatio::Portrait
}

async fn ugc_images(
    State(state): State<ApiState>,
    payload: Result<Json<UgcImagesRequest>, JsonRejection>,
) -> Response {
    run(&state, "ugc_images", async {
        let req = body(payload)?;
        let results = state
            .studio
            .ugc_images(&req.prompts, req.aspect_ratio)
            .await?;
        let images: Vec<serde_json::Value> = results
            .iter()
            .enumerate()
            .map(|(index, result)| match result {
                Ok(media) => json!({ "index": index, "image": MediaBody::from(media) }),
                Err(err) => {
                    let (_, error_type) = classify_error(err);
                    json!({
                        "index": index,
                        "error": { "type": error_type, "message": err.to_string() }
                    })
                }
            })
            .collect();
        Ok(ok_json(json!({ "images": images })))
    })
    .await
}

#[derive(Deserialize)]
struct VideoBody {
    prompt: String,
    #[serde(default)]
    model: VideoModel,
    #[serde(default)]
    aspect_ratio: AspectRatio,
    #[serde(default)]
    resolution: Resolution,
    #[serde(default)]
    image: Option<MediaBody>,
}

async fn video(
    State(state): State<ApiState>,
    payload: Result<Json<VideoBody>, JsonRejection>,
) -> Response {
    run(&state, "video", async {
        let req = body(payload)?;
        let image = req.image.as_ref().map(MediaBody::decode).transpose()?;
        let video = state
            .studio
            .video(&VideoRequest {
                prompt: req.prompt,
                model: req.model,
                aspect_ratio: req.aspect_ratio,
                resolution: req.resolution,
                image,
            })
            .await?;
        Ok((
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, video.mime_type.clone())],
            video.data,
        )
            .into_response())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use genai::{GenAiClient, StudioSettings};
    use key_pool::{FailureClassifier, KeyPool, KeyStore, RetryPolicy, Rotator};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    /// Mock generative service answering by API key: `bad` is rejected,
    /// `limited` is rate limited, anything else succeeds.
    async fn start_mock_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = axum::Router::new().fallback(|request: axum::extract::Request| async move {
                let key = request
                    .headers()
                    .get("x-goog-api-key")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let path = request.uri().path().to_string();
                match key.as_str() {
                    "bad" => (
                        StatusCode::BAD_REQUEST,
                        Json(json!({"error": {"code": 400, "message": "API key not valid. Please pass a valid API key.", "status": "INVALID_ARGUMENT"}})),
                    ),
                    "limited" => (
                        StatusCode::TOO_MANY_REQUESTS,
                        Json(json!({"error": {"code": 429, "message": "Resource has been exhausted", "status": "RESOURCE_EXHAUSTED"}})),
                    ),
                    _ if path.contains("flash-image") => (
                        StatusCode::OK,
                        Json(json!({"candidates": [{"content": {"parts": [
                            {"inlineData": {"mimeType": "image/png", "data": "cG5n"}}
                        ]}}]})),
                    ),
                    _ => (
                        StatusCode::OK,
                        Json(json!({"candidates": [{"content": {"parts": [
                            {"text": "[\"idea one\", \"idea two\"]"}
                        ]}}]})),
                    ),
                }
            });
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn test_state(upstream: &str, keys: &[&str]) -> ApiState {
        let pool = Arc::new(
            KeyPool::new(
                KeyStore::ephemeral(),
                keys.iter().map(|k| k.to_string()).collect(),
            )
            .await,
        );
        let settings = StudioSettings {
            image_retry: RetryPolicy::none(),
            image_interval: Duration::from_millis(1),
            ..StudioSettings::default()
        };
        let studio = Studio::new(
            Rotator::new(pool, FailureClassifier::default()),
            GenAiClient::new(upstream, Duration::from_secs(5)).unwrap(),
            settings,
        );
        ApiState {
            studio: Arc::new(studio),
            metrics: ServiceMetrics::new(),
        }
    }

    async fn post_json(app: Router, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn story_ideas_returns_ideas() {
        let upstream = start_mock_upstream().await;
        let app = build_api_router(test_state(&upstream, &["good"]).await);

        let (status, json) = post_json(app, "/api/story/ideas", r#"{"genre":"fantasy"}"#).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ideas"][0]["text"], "idea one");
        assert_eq!(json["ideas"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn bad_key_is_skipped_transparently() {
        let upstream = start_mock_upstream().await;
        let state = test_state(&upstream, &["bad", "good"]).await;
        let app = build_api_router(state.clone());

        let (status, _) = post_json(app, "/api/story/polish", r#"{"text":"a tale"}"#).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(state.studio.pool().active_count().await, 1);
    }

    #[tokio::test]
    async fn exhausted_system_keys_return_503_with_key_source() {
        let upstream = start_mock_upstream().await;
        let app = build_api_router(test_state(&upstream, &["limited", "bad"]).await);

        let (status, json) = post_json(app, "/api/lyrics", r#"{"query":"a song"}"#).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"]["type"], "keys_exhausted");
        assert_eq!(json["error"]["key_source"], "system");
        assert!(
            json["error"]["request_id"]
                .as_str()
                .unwrap()
                .starts_with("req_")
        );
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .contains("add your own API key")
        );
    }

    #[tokio::test]
    async fn no_keys_returns_keys_not_configured() {
        let upstream = start_mock_upstream().await;
        let app = build_api_router(test_state(&upstream, &[]).await);

        let (status, json) = post_json(app, "/api/speech", r#"{"text":"hello"}"#).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"]["type"], "keys_not_configured");
        assert!(json["error"].get("key_source").is_none());
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_request() {
        let upstream = start_mock_upstream().await;
        let app = build_api_router(test_state(&upstream, &["good"]).await);

        let (status, json) = post_json(app.clone(), "/api/image", r#"{"prompt": 42}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["type"], "invalid_request");

        let (status, json) =
            post_json(app, "/api/image", r#"{"prompt":"a fox","aspect_ratio":"4:3"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["type"], "invalid_request");
    }

    #[tokio::test]
    async fn empty_field_is_invalid_request() {
        let upstream = start_mock_upstream().await;
        let app = build_api_router(test_state(&upstream, &["good"]).await);

        let (status, json) =
            post_json(app, "/api/lyrics/translate", r#"{"text":"  ","language":"English"}"#).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["message"], "invalid request: text must not be empty");
    }

    #[tokio::test]
    async fn text_reply_to_image_request_is_invalid_response() {
        let upstream = start_mock_upstream().await;
        let mut state = test_state(&upstream, &["good"]).await;
        // route images to the text model so the mock answers with text
        let settings = StudioSettings {
            image_model: "gemini-2.5-flash".into(),
            image_retry: RetryPolicy::none(),
            ..StudioSettings::default()
        };
        state.studio = Arc::new(Studio::new(
            Rotator::new(state.studio.pool().clone(), FailureClassifier::default()),
            GenAiClient::new(&upstream, Duration::from_secs(5)).unwrap(),
            settings,
        ));
        let app = build_api_router(state);

        let (status, json) = post_json(app, "/api/image", r#"{"prompt":"a fox"}"#).await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["error"]["type"], "invalid_response");
    }

    #[tokio::test]
    async fn image_returns_base64_media() {
        let upstream = start_mock_upstream().await;
        let app = build_api_router(test_state(&upstream, &["good"]).await);

        let (status, json) =
            post_json(app, "/api/image", r#"{"prompt":"a fox","aspect_ratio":"9:16"}"#).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["image"]["mime_type"], "image/png");
        assert_eq!(json["image"]["data"], "cG5n");
    }

    #[tokio::test]
    async fn ugc_images_reports_each_slot() {
        let upstream = start_mock_upstream().await;
        let app = build_api_router(test_state(&upstream, &["good"]).await);

        let (status, json) = post_json(
            app,
            "/api/ugc/images",
            r#"{"prompts":["a shoe","a hat"]}"#,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let images = json["images"].as_array().unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[1]["index"], 1);
        assert_eq!(images[1]["image"]["data"], "cG5n");
    }

    #[tokio::test]
    async fn ugc_images_without_prompts_is_rejected() {
        let upstream = start_mock_upstream().await;
        let app = build_api_router(test_state(&upstream, &["good"]).await);

        let (status, _) = post_json(app, "/api/ugc/images", r#"{"prompts":[]}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ugc_images_over_the_batch_limit_is_rejected() {
        let upstream = start_mock_upstream().await;
        let state = test_state(&upstream, &["good"]).await;
        let app = build_api_router(state.clone());
        let prompts: Vec<String> = (0..=genai::studio::MAX_UGC_IMAGES)
            .map(|i| format!("scene {i}"))
            .collect();
        let body = json!({ "prompts": prompts }).to_string();

        let (status, json) = post_json(app, "/api/ugc/images", &body).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["type"], "invalid_request");
        assert_eq!(state.studio.pool().active_count().await, 1);
    }

    #[tokio::test]
    async fn requests_are_counted() {
        let upstream = start_mock_upstream().await;
        let state = test_state(&upstream, &[]).await;
        let app = build_api_router(state.clone());

        post_json(app, "/api/story/ideas", r#"{"genre":"noir"}"#).await;

        use std::sync::atomic::Ordering;
        assert_eq!(state.metrics.requests_total.load(Ordering::Relaxed), 1);
        assert_eq!(state.metrics.errors_total.load(Ordering::Relaxed), 1);
        assert_eq!(state.metrics.in_flight.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn media_body_accepts_data_urls() {
        let body = MediaBody {
            mime_type: "image/png".into(),
            data: "data:image/png;base64,aGVsbG8=".into(),
        };
        assert_eq!(body.decode().unwrap().data, b"hello");

        let bad = MediaBody {
            mime_type: "image/png".into(),
            data: "not base64!".into(),
        };
        assert!(matches!(bad.decode(), Err(genai::Error::InvalidRequest(_))));
    }
}
