//! Configuration structures for csandbox.
//!
//! This module defines configuration options for various components:
//! - [`SandboxConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings for the in-process variant
//! - [`ExecutionConfig`]: Per-attempt limits (deadlines, fuel, output caps)
//! - [`ToolchainConfig`]: Where the compiler image / native compiler lives

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level sandbox configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SandboxConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-attempt execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Toolchain locations.
    #[serde(default)]
    pub toolchain: ToolchainConfig,
}

/// Wasmtime engine configuration.
///
/// These settings affect the engine that hosts the compiler image.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for instance creation.
    ///
    /// Every session instantiates the toolchain image, so pre-allocated
    /// slots make opening a session cheap.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent sessions in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Working memory per session in megabytes.
    ///
    /// This is the fixed-size linear memory region the compiler image and
    /// the programs it compiles share.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Enable epoch-based interruption.
    ///
    /// Required for deadlines to interrupt guest code that never returns.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,

    /// Interval between epoch ticks in milliseconds.
    #[serde(default = "defaults::epoch_tick_ms")]
    pub epoch_tick_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            epoch_interruption: defaults::epoch_interruption(),
            epoch_tick_ms: defaults::epoch_tick_ms(),
        }
    }
}

impl EngineConfig {
    /// Get the epoch tick interval as a `Duration`.
    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms.max(1))
    }

    /// Working memory per session in bytes.
    pub fn instance_memory_bytes(&self) -> usize {
        (self.instance_memory_mb as usize) * 1024 * 1024
    }
}

/// Per-attempt execution configuration.
///
/// Compile and run deadlines are tracked separately.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Compile deadline in milliseconds.
    #[serde(default = "defaults::compile_timeout_ms")]
    pub compile_timeout_ms: u64,

    /// Run deadline in milliseconds.
    #[serde(default = "defaults::run_timeout_ms")]
    pub run_timeout_ms: u64,

    /// Maximum fuel (guest instructions) per compile or run call.
    ///
    /// In-process variant only.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Enable fuel metering for the in-process variant.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,

    /// Cap on captured bytes per output stream.
    #[serde(default = "defaults::max_output_bytes")]
    pub max_output_bytes: usize,

    /// Report a nonzero exit code (or entry-point return value) as failure.
    #[serde(default)]
    pub nonzero_exit_is_failure: bool,

    /// Delay before transient files of a finished run are removed.
    #[serde(default = "defaults::cleanup_delay_ms")]
    pub cleanup_delay_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            compile_timeout_ms: defaults::compile_timeout_ms(),
            run_timeout_ms: defaults::run_timeout_ms(),
            max_fuel: defaults::max_fuel(),
            fuel_metering: defaults::fuel_metering(),
            max_output_bytes: defaults::max_output_bytes(),
            nonzero_exit_is_failure: false,
            cleanup_delay_ms: defaults::cleanup_delay_ms(),
        }
    }
}

impl ExecutionConfig {
    /// Get the compile deadline as a `Duration`.
    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }

    /// Get the run deadline as a `Duration`.
    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    /// Get the cleanup delay as a `Duration`.
    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }
}

/// Toolchain locations for both variants.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolchainConfig {
    /// Path or `http(s)://` URL of the compiler image (in-process variant).
    #[serde(default = "defaults::wasm_image")]
    pub wasm_image: String,

    /// Native compiler executable (spawned-process variant).
    #[serde(default = "defaults::compiler")]
    pub compiler: String,

    /// Arguments passed to the native compiler before any per-compile ones.
    #[serde(default = "defaults::compiler_args")]
    pub compiler_args: Vec<String>,

    /// Directory for transient source files and binaries.
    ///
    /// Defaults to `<system temp>/csandbox`.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            wasm_image: defaults::wasm_image(),
            compiler: defaults::compiler(),
            compiler_args: defaults::compiler_args(),
            temp_dir: None,
        }
    }
}

impl ToolchainConfig {
    /// Resolve the directory used for transient files.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("csandbox"))
    }
}

/// Options recognized by a toolchain load.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Override the configured location of the compiler image or executable.
    pub toolchain_path: Option<String>,
}

impl LoadOptions {
    /// Load options pointing at a specific toolchain location.
    pub fn with_toolchain_path(path: impl Into<String>) -> Self {
        Self {
            toolchain_path: Some(path.into()),
        }
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        true
    }

    pub const fn max_instances() -> u32 {
        100
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn epoch_tick_ms() -> u64 {
        1
    }

    pub const fn compile_timeout_ms() -> u64 {
        5000
    }

    pub const fn run_timeout_ms() -> u64 {
        5000
    }

    pub const fn max_fuel() -> u64 {
        10_000_000_000
    }

    pub const fn fuel_metering() -> bool {
        false
    }

    pub const fn max_output_bytes() -> usize {
        1024 * 1024
    }

    pub const fn cleanup_delay_ms() -> u64 {
        1000
    }

    pub fn wasm_image() -> String {
        "./toolchain/cc.wasm".to_string()
    }

    pub fn compiler() -> String {
        "gcc".to_string()
    }

    pub fn compiler_args() -> Vec<String> {
        vec!["-O2".to_string(), "-std=c11".to_string()]
    }
}
