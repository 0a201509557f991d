//! Host functions and toolchain loading for the in-process variant.
//!
//! The toolchain image imports a small host interface from module `env`:
//!
//! - [`stdio`]: character output/input of the compiled program and the
//!   compiler's diagnostic callback
//! - [`linker`]: registration of those functions (plus WASI preview1) on the
//!   Wasmtime linker
//!
//! [`load_toolchain`] assembles a ready [`Toolchain`] from configuration.
//!
//! # Security Model
//!
//! The image gets no filesystem, network, or environment access: WASI is
//! linked with an empty context and all I/O goes through the session's
//! in-memory buffers.

pub mod linker;
pub mod stdio;

use tracing::{info, instrument};

use csandbox_common::{LoadOptions, SandboxConfig, SandboxError};
use csandbox_core::{InstanceRunner, Toolchain, ToolchainImage, WasmEngine};

pub use stdio::StdioHost;

/// Environment variable overriding the configured image location.
pub const WASM_IMAGE_ENV: &str = "CSANDBOX_WASM_IMAGE";

/// Create an instance runner with every host import registered.
///
/// # Errors
///
/// Returns an error if host function registration fails.
pub fn create_instance_runner(engine: &WasmEngine) -> Result<InstanceRunner, SandboxError> {
    let mut runner = InstanceRunner::new(engine);
    linker::register_all(runner.linker_mut())?;
    Ok(runner)
}

/// Where to load the image from: `options`, then the environment, then the
/// configuration.
pub fn image_location(config: &SandboxConfig, options: &LoadOptions) -> String {
    options
        .toolchain_path
        .clone()
        .or_else(|| std::env::var(WASM_IMAGE_ENV).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| config.toolchain.wasm_image.clone())
}

/// Load the in-process toolchain.
///
/// Creates the engine, fetches and compiles the image, and links the host
/// interface. Wrap in a [`csandbox_common::ToolchainCell`] to share one load
/// between callers.
///
/// # Errors
///
/// Returns `ToolchainUnavailable` if any step fails.
#[instrument(skip_all)]
pub async fn load_toolchain(
    config: &SandboxConfig,
    options: &LoadOptions,
) -> Result<Toolchain, SandboxError> {
    let location = image_location(config, options);
    info!(location = %location, "Loading in-process toolchain");

    let engine = WasmEngine::new(&config.engine).map_err(unavailable)?;
    let image = ToolchainImage::load(engine.inner(), &location).await?;
    let runner = create_instance_runner(&engine).map_err(unavailable)?;

    info!(
        content_hash = image.content_hash(),
        pooling = engine.is_pooling_enabled(),
        "Toolchain image compiled"
    );

    Toolchain::new(engine, image, runner).map_err(unavailable)
}

fn unavailable(error: SandboxError) -> SandboxError {
    match error {
        SandboxError::ToolchainUnavailable { .. } => error,
        other => SandboxError::toolchain_unavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_location_prefers_options() {
        let config = SandboxConfig::default();
        let options = LoadOptions::with_toolchain_path("/opt/cc.wasm");

        assert_eq!(image_location(&config, &options), "/opt/cc.wasm");
    }

    #[tokio::test]
    async fn test_load_missing_image() {
        let mut config = SandboxConfig::default();
        config.engine.pooling_allocator = false;
        let options = LoadOptions::with_toolchain_path("/nonexistent/cc.wasm");

        let err = load_toolchain(&config, &options).await.unwrap_err();
        assert!(matches!(err, SandboxError::ToolchainUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_load_malformed_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cc.wasm");
        std::fs::write(&path, b"not wasm at all").unwrap();

        let mut config = SandboxConfig::default();
        config.engine.pooling_allocator = false;
        let options = LoadOptions::with_toolchain_path(path.to_string_lossy());

        let err = load_toolchain(&config, &options).await.unwrap_err();
        assert!(err.to_string().contains("bad magic number"));
    }
}
