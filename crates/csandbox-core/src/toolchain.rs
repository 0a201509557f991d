//! A loaded, ready in-process toolchain.

use tracing::info;

use crate::engine::EpochTicker;
use crate::instance::{InstanceRunner, ToolchainInstance};
use crate::store::create_store;
use crate::{ToolchainImage, WasmEngine};
use csandbox_common::{ExecutionConfig, SandboxError};

/// Engine, compiled image and linker, shared by every session.
///
/// Owns the epoch ticker; the ticker stops when the toolchain is dropped.
pub struct Toolchain {
    engine: WasmEngine,
    image: ToolchainImage,
    runner: InstanceRunner,
    _ticker: Option<EpochTicker>,
}

impl Toolchain {
    /// Assemble a toolchain and start its epoch ticker.
    ///
    /// `runner` must already have every host import registered.
    pub fn new(
        engine: WasmEngine,
        image: ToolchainImage,
        runner: InstanceRunner,
    ) -> Result<Self, SandboxError> {
        let ticker = engine.start_ticker()?;

        info!(
            source = image.source(),
            content_hash = image.content_hash(),
            epoch_ticker = ticker.is_some(),
            "Toolchain assembled"
        );

        Ok(Self {
            engine,
            image,
            runner,
            _ticker: ticker,
        })
    }

    /// Get the engine.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    /// Get the compiled image.
    pub fn image(&self) -> &ToolchainImage {
        &self.image
    }

    /// Instantiate the image into a fresh store for one session.
    pub async fn instantiate(
        &self,
        config: &ExecutionConfig,
        session_id: String,
    ) -> Result<ToolchainInstance, SandboxError> {
        let store = create_store(&self.engine, config, session_id)?;
        self.runner
            .instantiate(&self.image, store, self.engine.epoch_tick())
            .await
    }
}

impl std::fmt::Debug for Toolchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolchain")
            .field("engine", &self.engine)
            .field("image", &self.image)
            .finish_non_exhaustive()
    }
}
