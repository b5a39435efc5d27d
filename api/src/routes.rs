use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use keyout_chroma::{ChromaError, ChromaKeyConfig};
use serde::Deserialize;
use tower_http::services::ServeFile;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::gemini::{GenerateError, ImageGenerator};

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    /// `None` when no API key was configured; `/generate` then answers 500.
    pub generator: Option<Arc<dyn ImageGenerator>>,
    pub chroma: ChromaKeyConfig,
    pub request_timeout: Duration,
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    #[serde(default)]
    prompt: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("image generation failed: {0}")]
    Generate(#[from] GenerateError),
    #[error(transparent)]
    Chroma(#[from] ChromaError),
    #[error("chroma key task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("pipeline timed out after {0:?}")]
    Timeout(Duration),
}

/// Generates an image for `prompt` and keys out its green background.
pub async fn run_pipeline(
    generator: &dyn ImageGenerator,
    prompt: &str,
    chroma: ChromaKeyConfig,
) -> Result<Vec<u8>, PipelineError> {
    let raw = generator.generate(prompt).await?;
    let png = tokio::task::spawn_blocking(move || keyout_chroma::key_out(&raw, &chroma)).await??;
    Ok(png)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /hello
async fn hello() -> impl IntoResponse {
    Json(serde_json::json!({ "message": "hello world" }))
}

/// POST /generate — body: { "prompt": "a red fox" }, responds with image/png
async fn generate(
    State(state): State<Arc<AppState>>,
    body: Option<Json<GenerateBody>>,
) -> impl IntoResponse {
    let prompt = body
        .and_then(|Json(b)| b.prompt)
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());
    let Some(prompt) = prompt else {
        return (StatusCode::BAD_REQUEST, "missing prompt").into_response();
    };

    let Some(generator) = state.generator.clone() else {
        error!("generate called but no Gemini API key is configured");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Gemini API key is not configured",
        )
            .into_response();
    };

    let start = Instant::now();
    let result = tokio::time::timeout(
        state.request_timeout,
        run_pipeline(generator.as_ref(), &prompt, state.chroma),
    )
    .await
    .unwrap_or(Err(PipelineError::Timeout(state.request_timeout)));

    match result {
        Ok(png) => {
            info!(
                generator = generator.name(),
                bytes = png.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "generated transparent PNG"
            );
            ([(header::CONTENT_TYPE, "image/png")], png).into_response()
        }
        Err(e) => {
            error!(error = %e, generator = generator.name(), "generate pipeline failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub fn router(state: Arc<AppState>, static_dir: &Path) -> Router {
    Router::new()
        .route_service("/", ServeFile::new(static_dir.join("index.html")))
        .route("/hello", get(hello))
        .route("/generate", post(generate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
