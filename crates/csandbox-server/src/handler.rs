//! Request handlers.
//!
//! Every run request gets a fresh session on the shared toolchain; the
//! session is closed before the reply is sent.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use csandbox_common::ExecutionResult;
use csandbox_core::WasmSession;
use csandbox_process::ProcessSession;

use crate::request::RunRequest;
use crate::response::JsonReply;
use crate::state::AppState;

/// `POST /run`: compile and run with the native compiler.
#[instrument(skip_all, fields(request_id = %Uuid::new_v4(), variant = "native"))]
pub async fn run_native(State(state): State<AppState>, Json(request): Json<RunRequest>) -> JsonReply {
    if let Err(reply) = request.check_size(state.max_source_bytes()) {
        return reply;
    }

    let toolchain = match state.native_toolchain().await {
        Ok(toolchain) => toolchain,
        Err(e) => {
            warn!(error = %e, "Native toolchain unavailable");
            return JsonReply::error(&e);
        }
    };

    let mut session = ProcessSession::open(toolchain, state.exec_config().clone());
    let result = session
        .run_source(&request.code, &request.compile_options(), &request.input)
        .await;
    session.close().await;

    log_result(&result);
    JsonReply::result(&result)
}

/// `POST /run/wasm`: compile and run inside the in-process toolchain.
#[instrument(skip_all, fields(request_id = %Uuid::new_v4(), variant = "wasm"))]
pub async fn run_wasm(State(state): State<AppState>, Json(request): Json<RunRequest>) -> JsonReply {
    if let Err(reply) = request.check_size(state.max_source_bytes()) {
        return reply;
    }

    let toolchain = match state.wasm_toolchain().await {
        Ok(toolchain) => toolchain,
        Err(e) => {
            warn!(error = %e, "In-process toolchain unavailable");
            return JsonReply::error(&e);
        }
    };

    let mut session = match WasmSession::open(toolchain, state.exec_config().clone()).await {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "Session could not be opened");
            return JsonReply::error(&e);
        }
    };

    let result = match session.compile(&request.code, &request.compile_options()).await {
        Ok(()) => session.run(&request.execution_request()).await,
        Err(e) => {
            if !e.is_compile_phase() {
                warn!(error = %e, "Compile did not complete");
            }
            ExecutionResult::from_error(&e)
        }
    };
    session.close().await;

    log_result(&result);
    JsonReply::result(&result)
}

fn log_result(result: &ExecutionResult) {
    info!(
        success = result.success,
        exit_code = ?result.exit_code,
        error = ?result.error,
        duration_ms = result.duration_ms,
        "Request completed"
    );
}

/// Health check handler.
///
/// Returns 200 OK if the server is running.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness check handler.
///
/// 200 once at least one toolchain is loaded, 503 before that.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let native = state.native_ready();
    let wasm = state.wasm_ready();

    let (status, label) = if native || wasm {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    };

    let body = serde_json::json!({
        "status": label,
        "toolchains": {
            "native": native,
            "wasm": wasm,
        },
    });

    (status, Json(body))
}
