//! Router configuration.

use axum::{extract::DefaultBodyLimit, routing::get, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;

use super::handlers::{connector_get, connector_post, thumbnail, AppState};
use super::middleware::create_cors_layer;

/// Create the connector router.
pub fn create_router(app_state: Arc<AppState>, cors_origins: &[String], max_body_size: usize) -> Router {
    Router::new()
        .route("/connector", get(connector_get).post(connector_post))
        .route("/connector/thumb/:hash", get(thumbnail))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(create_cors_layer(cors_origins)),
        )
        .with_state(app_state)
}

/// Create a health check router.
pub fn create_health_router() -> Router {
    Router::new().route("/health", get(health_check))
}

/// Health check handler.
async fn health_check() -> &'static str {
    "OK"
}

/// Full application: connector, health check and compression.
pub fn create_app(app_state: Arc<AppState>, cors_origins: &[String], max_body_size: usize) -> Router {
    create_router(app_state, cors_origins, max_body_size)
        .merge(create_health_router())
        .layer(CompressionLayer::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, VolumeConfig};
    use crate::Backend;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn backend(dir: &TempDir) -> Backend {
        let mut config = Config::default();
        config.connector.temp_dir = dir.path().join("tmp").to_string_lossy().into_owned();
        config
            .volumes
            .push(VolumeConfig::new(dir.path().join("files").to_string_lossy()));
        Backend::build(&config).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = create_health_router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_unknown_command_envelope() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let app = create_app(
            Arc::new(AppState::new(Arc::clone(backend.connector()))),
            &[],
            1024 * 1024,
        );

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/connector?cmd=format")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({"error": ["errUnknownCmd"]}));
    }
}
