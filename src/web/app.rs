use super::{AppState, handlers};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use std::path::Path;
use tower_http::{
    cors::CorsLayer,
    services::{ServeDir, ServeFile},
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::Level;

/// Builds the router. When `public_dir` is given, unmatched `GET`s are served from it,
/// falling back to its `index.html` so client-side routes resolve to the app shell.
pub fn create_app(state: AppState, public_dir: Option<&Path>) -> Router {
    let body_limit = state.policy.body_limit();

    let mut router = Router::new()
        .route("/api/remove-background", post(handlers::remove_background))
        .route("/api/health", get(handlers::health));

    if let Some(dir) = public_dir {
        let index = ServeFile::new(dir.join("index.html"));
        router = router.fallback_service(ServeDir::new(dir).fallback(index));
    }

    router
        // Uploads above this are cut off while streaming; the handler reports them as too large.
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new().level(Level::INFO)))
        .with_state(state)
}
