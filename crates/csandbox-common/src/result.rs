//! Request and result types shared by both execution variants.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ErrorKind, SandboxError};

/// Entry point used when a request names none.
pub const DEFAULT_ENTRY_POINT: &str = "main";

/// Options applied to a single compile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Extra compiler arguments, in order (include paths, defines, ...).
    ///
    /// Passed through untouched; the compiler decides what it accepts.
    #[serde(default)]
    pub args: Vec<String>,
}

impl CompileOptions {
    /// Options with the given extra arguments.
    pub fn with_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// A request to run the currently compiled artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Entry-point symbol (in-process variant). Defaults to `main`.
    #[serde(default)]
    pub entry_point: Option<String>,

    /// Payload written to the program's standard input.
    #[serde(default)]
    pub input: String,

    /// Override the configured run deadline.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ExecutionRequest {
    /// Request feeding `input` to the default entry point.
    pub fn with_input(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }

    /// Set the entry-point symbol.
    #[must_use]
    pub fn entry(mut self, symbol: impl Into<String>) -> Self {
        self.entry_point = Some(symbol.into());
        self
    }

    /// Set a per-request deadline.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// The entry-point symbol to resolve.
    pub fn entry_point(&self) -> &str {
        self.entry_point.as_deref().unwrap_or(DEFAULT_ENTRY_POINT)
    }
}

/// Outcome of a compile-and/or-run attempt.
///
/// Callers always receive one of these; failures carry an [`ErrorKind`] and
/// human-readable text in `stderr`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error, plus any diagnostic appended by the sandbox.
    pub stderr: String,

    /// Whether the attempt counts as successful.
    pub success: bool,

    /// Process exit status, or the entry point's return value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Failure category, if the attempt failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,

    /// Resolved address of the entry point (in-process variant).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol_address: Option<u32>,

    /// Wall-clock duration of the attempt.
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// A failed result carrying `error`'s text on stderr.
    pub fn from_error(error: &SandboxError) -> Self {
        let mut result = Self::default();
        result.fail(error);
        result
    }

    /// Mark this result failed, keeping any output captured so far.
    ///
    /// The error text is appended to stderr on its own line.
    pub fn fail(&mut self, error: &SandboxError) {
        self.success = false;
        self.error = Some(error.kind());
        self.append_stderr(&error.to_string());
    }

    /// Append a line of sandbox diagnostics to stderr.
    pub fn append_stderr(&mut self, text: &str) {
        if !self.stderr.is_empty() && !self.stderr.ends_with('\n') {
            self.stderr.push('\n');
        }
        self.stderr.push_str(text);
    }

    /// Record the elapsed time.
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Whether the attempt timed out.
    pub fn is_timeout(&self) -> bool {
        self.error == Some(ErrorKind::Timeout)
    }
}
