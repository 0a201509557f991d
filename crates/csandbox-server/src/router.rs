//! HTTP router configuration.

use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handler::{health_check, readiness_check, run_native, run_wasm};
use crate::state::AppState;

/// Build the application router.
///
/// Routes:
/// - `POST /run` - Compile and run with the native compiler
/// - `POST /run/wasm` - Compile and run in the in-process toolchain
/// - `GET /health` - Health check
/// - `GET /ready` - Toolchain readiness
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let run_routes = Router::new()
        .route("/run", post(run_native))
        .route("/run/wasm", post(run_wasm));

    let health_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check));

    Router::new()
        .merge(run_routes)
        .merge(health_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use csandbox_common::SandboxConfig;
    use tower::util::ServiceExt;

    fn setup_router(max_source_bytes: usize) -> Router {
        let mut config = SandboxConfig::default();
        config.engine.pooling_allocator = false;
        config.toolchain.wasm_image = "/nonexistent/cc.wasm".to_string();
        let state = AppState::new(config, max_source_bytes);
        build_router(state, Duration::from_secs(30))
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = setup_router(1024);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_not_ready_before_any_load() {
        let app = setup_router(1024);

        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_oversized_source_rejected() {
        let app = setup_router(8);

        let response = app
            .oneshot(post_json("/run", r#"{"code": "int main(void){return 0;}"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_malformed_body_rejected() {
        let app = setup_router(1024);

        let response = app
            .oneshot(post_json("/run", r#"{"source": 1}"#))
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_run_wasm_without_image_is_503() {
        let app = setup_router(1024);

        let response = app
            .oneshot(post_json("/run/wasm", r#"{"code": "int main(void){return 0;}"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let app = setup_router(1024);

        let response = app
            .oneshot(Request::builder().uri("/functions/x").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
