//! HTTP gateway for Nestling.
//!
//! Exposes the chat surface, child-detail management and a health check,
//! and owns the process [`Runtime`] that wires storage, model clients and
//! the background index worker together.
//!
//! Built on Axum.

pub mod api_v1;
pub mod runtime;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, Method, header};
use axum::{Router, response::Json, routing::get};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

pub use api_v1::{ApiError, Caller, USER_HEADER};
pub use runtime::{Backends, Runtime, Services};

/// Build the full router: `/health` plus the v1 API under `/v1`.
///
/// Layers applied:
/// - Request body size limit
/// - CORS for local browser front-ends
/// - HTTP trace logging
pub fn build_router(services: Arc<Services>, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin, _| {
            let origin = origin.as_bytes();
            origin.starts_with(b"http://localhost") || origin.starts_with(b"http://127.0.0.1")
        }))
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(USER_HEADER)])
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", api_v1::v1_router(services))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Serve until Ctrl-C, then stop the worker and close storage.
pub async fn serve(mut runtime: Runtime) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{}:{}", runtime.config().gateway.host, runtime.config().gateway.port);
    let app = build_router(runtime.services(), runtime.config().gateway.body_limit);
    runtime.start_worker();

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Gateway listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    runtime.shutdown().await;
    served?;
    Ok(())
}

/// Build the runtime from `config` and serve it.
pub async fn start(config: nestling_config::AppConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let runtime = Runtime::open(config).await?;
    serve(runtime).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Could not listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use nestling_config::AppConfig;
    use nestling_memory::InMemoryChildStore;
    use nestling_providers::{HashEmbedder, OpenAiCompatProvider};
    use tower::ServiceExt;

    fn test_router(body_limit: usize) -> Router {
        let backends = Backends::in_memory(
            InMemoryChildStore::new(),
            Arc::new(HashEmbedder::default()),
            Arc::new(OpenAiCompatProvider::openrouter("test-key")),
        );
        let runtime = Runtime::assemble(AppConfig::default(), backends).unwrap();
        build_router(runtime.services(), body_limit)
    }

    #[tokio::test]
    async fn health_endpoint() {
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = test_router(1024).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected() {
        let req = Request::builder()
            .method("POST")
            .uri("/v1/chat")
            .header(USER_HEADER, nestling_core::child::UserId::new().to_string())
            .header("content-type", "application/json")
            .body(Body::from(format!(r#"{{"question":"{}"}}"#, "a".repeat(4096))))
            .unwrap();

        let response = test_router(1024).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
