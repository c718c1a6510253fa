mod db;
mod error;
mod handlers;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::Body;
use axum::extract::DefaultBodyLimit;
use axum::http::{Request, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracekeep_config::ServerConfig;
use tracing::info;

use db::IngestStore;

/// Uploads carry up to a thousand traces with their spans.
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

pub struct ServerState {
    pub store: IngestStore,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();

    let config = ServerConfig::from_env();
    if let Some(parent) = Path::new(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = IngestStore::new(&config.db_path)?;
    info!("Trace store opened at {}", config.db_path);

    let app = router(Arc::new(ServerState { store }));

    info!("Starting server on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: Arc<ServerState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<Body>| {
            tracing::info_span!(
                "request",
                method = %req.method(),
                uri = %req.uri(),
                version = ?req.version(),
            )
        })
        .on_response(|res: &Response<Body>, latency: Duration, _span: &tracing::Span| {
            info!(
                latency = %format!("{} ms", latency.as_millis()),
                status = %res.status().as_u16(),
                "finished processing request"
            );
        });

    let api_routes = Router::new()
        .route(
            "/api/traces",
            post(handlers::traces::ingest)
                .get(handlers::traces::list)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/traces/{id}", get(handlers::traces::get))
        .route("/api/metrics/summary", get(handlers::traces::metrics_summary))
        .layer(trace_layer);

    Router::new()
        .merge(api_routes)
        .route("/health", get(handlers::health))
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::collections::HashMap;
    use tower::ServiceExt;
    use tracekeep_core::{ConversationTrace, Feedback, Metadata, UploadPayload};

    fn app() -> Router {
        router(Arc::new(ServerState {
            store: IngestStore::in_memory().unwrap(),
        }))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn upload_request(payload: &UploadPayload) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/traces")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(payload).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_upload_then_list_and_get() {
        let app = app();
        let mut feedback = HashMap::new();
        feedback.insert("t1:1".to_string(), Feedback::Good);
        let payload = UploadPayload::new(
            vec![ConversationTrace::new("trace-1", "t1", Metadata::new(), 42)],
            feedback,
            100,
        );

        let response = app.clone().oneshot(upload_request(&payload)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["received"], 1);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/traces").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["traces"][0]["id"], "trace-1");
        assert_eq!(body["traces"][0]["threadId"], "t1");

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/traces/trace-1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["startTime"], 42);

        let response = app
            .oneshot(Request::builder().uri("/api/metrics/summary").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["totalTraces"], 1);
        assert_eq!(body["totalUploads"], 1);
    }

    #[tokio::test]
    async fn test_missing_trace_is_404() {
        let response = app()
            .oneshot(Request::builder().uri("/api/traces/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "trace not found");
    }

    #[tokio::test]
    async fn test_malformed_upload_rejected() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/traces")
            .header("content-type", "application/json")
            .body(Body::from("{\"traces\": 5}"))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert!(response.status().is_client_error());
    }
}
