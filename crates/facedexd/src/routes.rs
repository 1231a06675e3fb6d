//! HTTP surface: registration, recognition, listing and chat.

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use facedex_core::{FaceMatch, Identity, MatchError, MatchPolicy, Matcher};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::chat;
use crate::engine::EngineHandle;
use crate::error::ApiError;
use crate::store::EmbeddingStore;

const NO_FACES_IN_DATABASE: &str = "No faces in database";

/// Shared by every handler; cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EmbeddingStore>,
    pub engine: EngineHandle,
    pub policy: MatchPolicy,
    pub threshold: f32,
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/entries", get(list_entries))
        .route("/register", post(register))
        .route("/recognize", post(recognize))
        .route("/chat", post(chat))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    status: &'static str,
    name: String,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RecognizeResponse {
    Results { results: Vec<FaceMatch> },
    EmptyRegistry { error: &'static str },
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    answer: String,
}

/// Form fields of a registration or recognition upload.
#[derive(Default)]
struct Upload {
    name: Option<String>,
    file: Option<Vec<u8>>,
}

impl Upload {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut upload = Upload::default();
        while let Some(field) = multipart.next_field().await? {
            let key = field.name().map(str::to_owned);
            match key.as_deref() {
                Some("name") => upload.name = Some(field.text().await?),
                Some("file") => upload.file = Some(field.bytes().await?.to_vec()),
                _ => {}
            }
        }
        Ok(upload)
    }

    fn require_file(&mut self) -> Result<Vec<u8>, ApiError> {
        self.file
            .take()
            .ok_or_else(|| ApiError::BadRequest("missing form field: file".into()))
    }
}

async fn root() -> Json<Value> {
    Json(json!({ "msg": "API OK" }))
}

async fn health(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let identities = state.store.count().await?;
    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "identities": identities,
        "embedding_dim": state.engine.dimension(),
        "threshold": report_f32(state.threshold),
        "match_policy": state.policy,
    })))
}

/// Widen a configured `f32` for JSON without exposing binary noise
/// (0.47 rather than 0.4699999988079071).
fn report_f32(value: f32) -> f64 {
    (f64::from(value) * 1e6).round() / 1e6
}

async fn list_entries(State(state): State<AppState>) -> Result<Json<Vec<Identity>>, ApiError> {
    Ok(Json(state.store.list_all().await?))
}

async fn register(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<RegisterResponse>, ApiError> {
    let mut upload = Upload::read(multipart).await?;
    let image = upload.require_file()?;
    let name = upload
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing form field: name".into()))?;

    tracing::info!(%name, bytes = image.len(), "registering");

    let detections = state.engine.embed(image).await?;
    if detections.len() > 1 {
        tracing::debug!(%name, faces = detections.len(), "several faces, using the highest scoring one");
    }
    let face = detections.into_iter().next().ok_or_else(|| {
        tracing::info!(%name, "register: no face found");
        ApiError::NoFaceDetected
    })?;

    let identity = state.store.upsert(&name, face.embedding).await?;
    tracing::info!(
        name = %identity.name,
        embeddings = identity.embeddings.len(),
        "registered"
    );

    Ok(Json(RegisterResponse {
        status: "registered",
        timestamp: identity.last_registered(),
        name: identity.name,
    }))
}

async fn recognize(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<RecognizeResponse>, ApiError> {
    let image = Upload::read(multipart).await?.require_file()?;

    // One snapshot serves every face in this image.
    let gallery = state.store.list_all().await?;
    if gallery.is_empty() {
        return Ok(Json(RecognizeResponse::EmptyRegistry {
            error: NO_FACES_IN_DATABASE,
        }));
    }

    let detections = state.engine.embed(image).await?;
    let results = detections
        .iter()
        .map(|d| -> Result<FaceMatch, MatchError> {
            let result = state.policy.compare(&d.embedding, &gallery, state.threshold)?;
            tracing::debug!(
                name = result.display_name(),
                distance = ?result.distance,
                score = d.score,
                "face matched"
            );
            Ok(FaceMatch::new(&result, d.bbox))
        })
        .collect::<Result<Vec<_>, MatchError>>()?;

    tracing::info!(
        faces = results.len(),
        matched = results.iter().filter(|r| r.confidence.is_some()).count(),
        "recognized"
    );

    Ok(Json(RecognizeResponse::Results { results }))
}

async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let entries = state.store.list_all().await?;
    Ok(Json(ChatResponse {
        answer: chat::answer(&req.message, &entries),
    }))
}
