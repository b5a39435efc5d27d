mod gemini;
mod routes;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use keyout_chroma::ChromaKeyConfig;
use keyout_common::config::Config;
use tracing::{error, info, warn};

use crate::gemini::{GeminiClient, ImageGenerator};
use crate::routes::AppState;

#[tokio::main]
async fn main() {
    // A missing .env is normal in production.
    dotenv::dotenv().ok();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load_or_default(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    let chroma = match ChromaKeyConfig::new(
        config.chroma.green_threshold,
        config.chroma.diff_threshold,
    ) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid [chroma] section");
            std::process::exit(1);
        }
    };

    // The client lives for the whole process; handlers never rebuild it.
    let generator: Option<Arc<dyn ImageGenerator>> = match config.gemini.resolve_api_key() {
        Some(key) => match GeminiClient::new(&config.gemini, key) {
            Ok(client) => Some(Arc::new(client) as Arc<dyn ImageGenerator>),
            Err(e) => {
                error!(error = %e, "failed to build Gemini HTTP client");
                std::process::exit(1);
            }
        },
        None => {
            warn!("no Gemini API key found (GEMINI_API_KEY); /generate will return 500");
            None
        }
    };

    info!(
        model = config.gemini.model,
        green_threshold = chroma.green_threshold(),
        diff_threshold = chroma.diff_threshold(),
        request_timeout_secs = config.server.request_timeout_secs,
        static_dir = config.server.static_dir,
        "keyout configuration loaded"
    );

    let state = Arc::new(AppState {
        generator,
        chroma,
        request_timeout: Duration::from_secs(config.server.request_timeout_secs),
    });

    let app = routes::router(state, Path::new(&config.server.static_dir));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!(addr, "keyout API server starting");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
