//! Common types, errors, and utilities for csandbox.
//!
//! This crate provides shared functionality used by both execution variants:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures and the TOML config file
//! - Output capture buffers and the single-artifact session slot
//! - Request/result types returned to callers

pub mod capture;
pub mod config;
pub mod config_file;
pub mod error;
pub mod lifecycle;
pub mod loader;
pub mod result;

pub use capture::{BlockBuffer, LineBuffer, LineCollector, LineSink, StreamKind};
pub use config::{EngineConfig, ExecutionConfig, LoadOptions, SandboxConfig, ToolchainConfig};
pub use config_file::{ConfigFile, ConfigFileError, ServerConfigFile};
pub use error::{ErrorKind, SandboxError};
pub use lifecycle::{Artifact, ArtifactSlot};
pub use loader::ToolchainCell;
pub use result::{CompileOptions, DEFAULT_ENTRY_POINT, ExecutionRequest, ExecutionResult};
