//! Shared application state.
//!
//! [`AppState`] holds the configuration and the two lazily-loaded
//! toolchains. Each request opens its own session on a shared toolchain.

use std::sync::Arc;

use tracing::{info, warn};

use csandbox_common::{
    ExecutionConfig, LoadOptions, SandboxConfig, SandboxError, ToolchainCell,
};
use csandbox_core::Toolchain;
use csandbox_process::NativeToolchain;

/// Shared state across all request handlers.
///
/// Cloned for each request, so shared data sits behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    config: Arc<SandboxConfig>,
    native: Arc<ToolchainCell<NativeToolchain>>,
    wasm: Arc<ToolchainCell<Toolchain>>,
    max_source_bytes: usize,
}

impl AppState {
    /// Create state with nothing loaded yet.
    pub fn new(config: SandboxConfig, max_source_bytes: usize) -> Self {
        Self {
            config: Arc::new(config),
            native: Arc::new(ToolchainCell::new()),
            wasm: Arc::new(ToolchainCell::new()),
            max_source_bytes,
        }
    }

    /// Sandbox configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Execution limits handed to every session.
    pub fn exec_config(&self) -> &ExecutionConfig {
        &self.config.execution
    }

    /// Largest accepted source text, in bytes.
    pub fn max_source_bytes(&self) -> usize {
        self.max_source_bytes
    }

    /// The native compiler, probing it on first use.
    pub async fn native_toolchain(&self) -> Result<Arc<NativeToolchain>, SandboxError> {
        let config = Arc::clone(&self.config);
        self.native
            .get_or_load(|| async move {
                NativeToolchain::load(&config, &LoadOptions::default()).await
            })
            .await
    }

    /// The in-process toolchain, loading the image on first use.
    pub async fn wasm_toolchain(&self) -> Result<Arc<Toolchain>, SandboxError> {
        let config = Arc::clone(&self.config);
        self.wasm
            .get_or_load(|| async move {
                csandbox_host::load_toolchain(&config, &LoadOptions::default()).await
            })
            .await
    }

    /// Whether the native compiler has been checked successfully.
    pub fn native_ready(&self) -> bool {
        self.native.is_ready()
    }

    /// Whether the in-process image has been loaded.
    pub fn wasm_ready(&self) -> bool {
        self.wasm.is_ready()
    }

    /// Load both toolchains ahead of the first request.
    ///
    /// Failures are logged, not fatal: the variant stays unavailable and
    /// the next request retries the load.
    pub async fn warm_up(&self) {
        let (native, wasm) = tokio::join!(self.native_toolchain(), self.wasm_toolchain());

        match native {
            Ok(toolchain) => info!(
                compiler = toolchain.compiler(),
                version = toolchain.version(),
                "Native toolchain ready"
            ),
            Err(e) => warn!(error = %e, "Native toolchain unavailable"),
        }

        match wasm {
            Ok(toolchain) => info!(
                source = toolchain.image().source(),
                "In-process toolchain ready"
            ),
            Err(e) => warn!(error = %e, "In-process toolchain unavailable"),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("native_ready", &self.native_ready())
            .field("wasm_ready", &self.wasm_ready())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_missing_image() -> SandboxConfig {
        let mut config = SandboxConfig::default();
        config.engine.pooling_allocator = false;
        config.toolchain.wasm_image = "/nonexistent/cc.wasm".to_string();
        config
    }

    #[test]
    fn test_new_state_has_nothing_loaded() {
        let state = AppState::new(SandboxConfig::default(), 1024);

        assert!(!state.native_ready());
        assert!(!state.wasm_ready());
        assert_eq!(state.max_source_bytes(), 1024);
    }

    #[tokio::test]
    async fn test_missing_image_stays_unready() {
        let state = AppState::new(config_with_missing_image(), 1024);

        let err = state.wasm_toolchain().await.unwrap_err();
        assert!(matches!(err, SandboxError::ToolchainUnavailable { .. }));
        assert!(!state.wasm_ready());
    }

    #[tokio::test]
    async fn test_clones_share_toolchains() {
        let mut config = config_with_missing_image();
        config.toolchain.compiler = "csandbox-no-such-cc".to_string();
        let state = AppState::new(config, 1024);
        let clone = state.clone();

        state.warm_up().await;

        assert!(Arc::ptr_eq(&state.native, &clone.native));
        assert_eq!(state.native_ready(), clone.native_ready());
    }
}
