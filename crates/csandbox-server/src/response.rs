//! HTTP replies built from sandbox results and errors.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use csandbox_common::{ExecutionResult, SandboxError};

/// A JSON reply with a status code.
#[derive(Debug, Clone)]
pub struct JsonReply {
    pub status: StatusCode,
    pub body: serde_json::Value,
}

impl JsonReply {
    /// 200 with the serialized result.
    ///
    /// Compile failures, timeouts and runtime errors are all reported this
    /// way: the request was served, the program just did not succeed.
    pub fn result(result: &ExecutionResult) -> Self {
        Self {
            status: StatusCode::OK,
            body: serde_json::to_value(result).unwrap_or_else(|e| {
                json!({ "success": false, "stderr": format!("Unserializable result: {e}") })
            }),
        }
    }

    /// An error reply for a request that could not be served.
    pub fn error(error: &SandboxError) -> Self {
        Self::message(status_for(error), error.kind(), &error.to_string())
    }

    /// An error reply with an explicit status and message.
    pub fn message(status: StatusCode, kind: impl serde::Serialize, message: &str) -> Self {
        Self {
            status,
            body: json!({
                "error": message,
                "kind": kind,
            }),
        }
    }
}

impl IntoResponse for JsonReply {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// HTTP status for an error that prevents serving a request.
pub fn status_for(error: &SandboxError) -> StatusCode {
    match error {
        SandboxError::ToolchainUnavailable { .. } | SandboxError::ToolingMissing { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        SandboxError::CompileFailed { .. }
        | SandboxError::NothingCompiled
        | SandboxError::SymbolNotFound { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        SandboxError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        SandboxError::InvalidConfig { .. } => StatusCode::BAD_REQUEST,
        SandboxError::Runtime { .. } | SandboxError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
