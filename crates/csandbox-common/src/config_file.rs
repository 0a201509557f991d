//! Configuration file structures for csandbox.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ServerConfigFile`]: HTTP server settings

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::SandboxConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [sandbox.engine]
/// pooling_allocator = false
/// instance_memory_mb = 128
///
/// [sandbox.execution]
/// compile_timeout_ms = 5000
/// run_timeout_ms = 5000
///
/// [sandbox.toolchain]
/// compiler = "gcc"
/// compiler_args = ["-O2", "-std=c11", "-lm"]
/// wasm_image = "./toolchain/cc.wasm"
///
/// [server]
/// bind_addr = "0.0.0.0:8080"
/// request_timeout_secs = 30
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Sandbox configuration (engine + execution + toolchain settings).
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfigFile,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// HTTP server configuration from config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfigFile {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "defaults::bind_addr")]
    pub bind_addr: String,

    /// Request timeout in seconds.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Enable graceful shutdown.
    #[serde(default = "defaults::graceful_shutdown")]
    pub graceful_shutdown: bool,

    /// Maximum accepted source size in bytes.
    #[serde(default = "defaults::max_source_bytes")]
    pub max_source_bytes: usize,
}

impl Default for ServerConfigFile {
    fn default() -> Self {
        Self {
            bind_addr: defaults::bind_addr(),
            request_timeout_secs: defaults::request_timeout_secs(),
            graceful_shutdown: defaults::graceful_shutdown(),
            max_source_bytes: defaults::max_source_bytes(),
        }
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

/// Default value functions for serde.
mod defaults {
    pub fn bind_addr() -> String {
        "0.0.0.0:8080".to_string()
    }

    pub const fn request_timeout_secs() -> u64 {
        30
    }

    pub const fn graceful_shutdown() -> bool {
        true
    }

    pub const fn max_source_bytes() -> usize {
        64 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.server.request_timeout_secs, 30);
        assert!(config.server.graceful_shutdown);
        assert_eq!(config.server.max_source_bytes, 64 * 1024);
        assert_eq!(config.sandbox.toolchain.compiler, "gcc");
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [server]
            bind_addr = "127.0.0.1:3000"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.server.bind_addr, "127.0.0.1:3000");
        // Defaults applied
        assert_eq!(config.server.request_timeout_secs, 30);
        assert_eq!(config.sandbox.execution.run_timeout_ms, 5000);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [sandbox.engine]
            pooling_allocator = false
            instance_memory_mb = 128

            [sandbox.execution]
            compile_timeout_ms = 3000
            run_timeout_ms = 1500
            nonzero_exit_is_failure = true
            max_output_bytes = 4096

            [sandbox.toolchain]
            compiler = "clang"
            compiler_args = ["-O0", "-lm"]
            wasm_image = "https://example.com/cc.wasm"
            temp_dir = "/tmp/judge"

            [server]
            bind_addr = "0.0.0.0:9000"
            request_timeout_secs = 60
            graceful_shutdown = false
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert!(!config.sandbox.engine.pooling_allocator);
        assert_eq!(config.sandbox.engine.instance_memory_mb, 128);
        assert_eq!(config.sandbox.execution.compile_timeout_ms, 3000);
        assert_eq!(config.sandbox.execution.run_timeout_ms, 1500);
        assert!(config.sandbox.execution.nonzero_exit_is_failure);
        assert_eq!(config.sandbox.execution.max_output_bytes, 4096);
        assert_eq!(config.sandbox.toolchain.compiler, "clang");
        assert_eq!(config.sandbox.toolchain.compiler_args, vec!["-O0", "-lm"]);
        assert_eq!(
            config.sandbox.toolchain.temp_dir.as_deref(),
            Some(Path::new("/tmp/judge"))
        );
        assert_eq!(config.server.bind_addr, "0.0.0.0:9000");
        assert!(!config.server.graceful_shutdown);
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(result.is_err());
    }
}
