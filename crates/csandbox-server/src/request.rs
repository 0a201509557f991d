//! Request bodies accepted by the run endpoints.

use axum::http::StatusCode;
use serde::Deserialize;

use csandbox_common::{CompileOptions, ErrorKind, ExecutionRequest};

use crate::response::JsonReply;

/// Body of `POST /run` and `POST /run/wasm`.
#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    /// C source text.
    pub code: String,

    /// Bytes fed to the program's stdin.
    #[serde(default)]
    pub input: String,

    /// Extra compiler arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Entry symbol (in-process variant only).
    #[serde(default)]
    pub entry: Option<String>,
}

impl RunRequest {
    /// Reject source larger than `max_bytes`.
    pub fn check_size(&self, max_bytes: usize) -> Result<(), JsonReply> {
        if self.code.len() > max_bytes {
            return Err(JsonReply::message(
                StatusCode::PAYLOAD_TOO_LARGE,
                ErrorKind::Internal,
                &format!(
                    "Source is {} bytes; the limit is {max_bytes}",
                    self.code.len()
                ),
            ));
        }
        Ok(())
    }

    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions::with_args(self.args.iter().cloned())
    }

    pub fn execution_request(&self) -> ExecutionRequest {
        let request = ExecutionRequest::with_input(self.input.clone());
        match &self.entry {
            Some(entry) => request.entry(entry.clone()),
            None => request,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csandbox_common::DEFAULT_ENTRY_POINT;

    #[test]
    fn test_minimal_body() {
        let request: RunRequest = serde_json::from_str(r#"{"code": "int main(void){}"}"#).unwrap();

        assert!(request.input.is_empty());
        assert!(request.args.is_empty());
        assert_eq!(request.execution_request().entry_point(), DEFAULT_ENTRY_POINT);
    }

    #[test]
    fn test_full_body() {
        let request: RunRequest = serde_json::from_str(
            r#"{"code": "x", "input": "1 2", "args": ["-lm"], "entry": "start"}"#,
        )
        .unwrap();

        assert_eq!(request.compile_options().args, vec!["-lm".to_string()]);
        let exec = request.execution_request();
        assert_eq!(exec.input, "1 2");
        assert_eq!(exec.entry_point(), "start");
    }

    #[test]
    fn test_size_limit() {
        let request = RunRequest {
            code: "x".repeat(11),
            input: String::new(),
            args: Vec::new(),
            entry: None,
        };

        assert!(request.check_size(11).is_ok());
        let reply = request.check_size(10).unwrap_err();
        assert_eq!(reply.status, StatusCode::PAYLOAD_TOO_LARGE);
    }
}
