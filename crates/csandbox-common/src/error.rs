//! Error types for csandbox.
//!
//! This module defines the error taxonomy shared by both execution variants:
//! - [`SandboxError`]: Every failure a compile or run attempt can end in
//! - [`ErrorKind`]: The serializable discriminant carried in results

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the toolchain loader, compiler session and execution
/// controller.
///
/// The public `run` entry points never return these directly; they are folded
/// into an [`ExecutionResult`](crate::ExecutionResult) with `success = false`.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The compiler/runtime image could not be fetched, read or instantiated.
    #[error("Toolchain unavailable: {reason}")]
    ToolchainUnavailable {
        /// Why the toolchain could not be brought up.
        reason: String,
    },

    /// The compiler rejected the source text.
    #[error("Compilation failed: {diagnostic}")]
    CompileFailed {
        /// The compiler's own error text.
        diagnostic: String,
    },

    /// A run was requested while no artifact is installed.
    #[error("Nothing compiled: compile a program before running it")]
    NothingCompiled,

    /// The requested entry point is not defined by the artifact.
    #[error("Symbol not found: {symbol}")]
    SymbolNotFound {
        /// The symbol that was looked up.
        symbol: String,
    },

    /// The running program faulted (trap, crash, or killed by a signal).
    #[error("Runtime error: {message}")]
    Runtime {
        /// Description of the fault.
        message: String,
    },

    /// The deadline expired before the program finished.
    #[error("Execution timed out after {duration_ms}ms (possible infinite loop)")]
    Timeout {
        /// The deadline in milliseconds.
        duration_ms: u64,
    },

    /// The native compiler executable is not installed on this host.
    #[error("Compiler not found: '{program}' is not installed or not on PATH")]
    ToolingMissing {
        /// The program that could not be spawned.
        program: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

/// Serializable failure category of an execution result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ToolchainUnavailable,
    CompileFailed,
    NothingCompiled,
    SymbolNotFound,
    RuntimeError,
    Timeout,
    ToolingMissing,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::ToolchainUnavailable => "toolchain_unavailable",
            ErrorKind::CompileFailed => "compile_failed",
            ErrorKind::NothingCompiled => "nothing_compiled",
            ErrorKind::SymbolNotFound => "symbol_not_found",
            ErrorKind::RuntimeError => "runtime_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ToolingMissing => "tooling_missing",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl SandboxError {
    /// Create a new `ToolchainUnavailable` error.
    pub fn toolchain_unavailable(reason: impl Into<String>) -> Self {
        Self::ToolchainUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a new `CompileFailed` error.
    pub fn compile_failed(diagnostic: impl Into<String>) -> Self {
        Self::CompileFailed {
            diagnostic: diagnostic.into(),
        }
    }

    /// Create a new `SymbolNotFound` error.
    pub fn symbol_not_found(symbol: impl Into<String>) -> Self {
        Self::SymbolNotFound {
            symbol: symbol.into(),
        }
    }

    /// Create a new `Runtime` error.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Create a new `ToolingMissing` error.
    pub fn tooling_missing(program: impl Into<String>) -> Self {
        Self::ToolingMissing {
            program: program.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// The result category this error is reported under.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ToolchainUnavailable { .. } => ErrorKind::ToolchainUnavailable,
            Self::CompileFailed { .. } => ErrorKind::CompileFailed,
            Self::NothingCompiled => ErrorKind::NothingCompiled,
            Self::SymbolNotFound { .. } => ErrorKind::SymbolNotFound,
            Self::Runtime { .. } => ErrorKind::RuntimeError,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ToolingMissing { .. } => ErrorKind::ToolingMissing,
            Self::Io(_) | Self::InvalidConfig { .. } => ErrorKind::Internal,
        }
    }

    /// Returns `true` if this error belongs to the compile phase.
    pub fn is_compile_phase(&self) -> bool {
        matches!(
            self,
            Self::CompileFailed { .. } | Self::ToolingMissing { .. }
        )
    }

    /// Returns `true` if this error indicates the deadline was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SandboxError::symbol_not_found("main");
        assert_eq!(err.to_string(), "Symbol not found: main");

        let err = SandboxError::Timeout { duration_ms: 5000 };
        assert_eq!(
            err.to_string(),
            "Execution timed out after 5000ms (possible infinite loop)"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err: SandboxError = io_err.into();

        assert!(matches!(err, SandboxError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            SandboxError::compile_failed("x").kind(),
            ErrorKind::CompileFailed
        );
        assert_eq!(
            SandboxError::NothingCompiled.kind(),
            ErrorKind::NothingCompiled
        );
        assert_eq!(SandboxError::runtime("trap").kind(), ErrorKind::RuntimeError);
        assert_eq!(
            SandboxError::tooling_missing("gcc").kind(),
            ErrorKind::ToolingMissing
        );
    }

    #[test]
    fn test_compile_phase() {
        assert!(SandboxError::compile_failed("x").is_compile_phase());
        assert!(SandboxError::tooling_missing("gcc").is_compile_phase());
        assert!(!SandboxError::NothingCompiled.is_compile_phase());
    }

    #[test]
    fn test_resource_limit() {
        assert!(SandboxError::Timeout { duration_ms: 1 }.is_resource_limit());
        assert!(!SandboxError::runtime("trap").is_resource_limit());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ToolingMissing).unwrap();
        assert_eq!(json, "\"tooling_missing\"");
        assert_eq!(ErrorKind::RuntimeError.to_string(), "runtime_error");
    }
}
