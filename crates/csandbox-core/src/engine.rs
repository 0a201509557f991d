//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is the foundation of the in-process variant. It is:
//! - Thread-safe and shared by every session of a toolchain
//! - Configured with pooling allocator for fast session instantiation
//! - Set up with fuel metering and epoch interruption so deadlines can stop
//!   guest code that never returns

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info};
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use csandbox_common::{EngineConfig, SandboxError};

/// Thread-safe WebAssembly engine wrapper.
///
/// # Configuration
///
/// The engine is configured with:
/// - **Pooling Allocator**: Pre-allocates memory slots for sessions
/// - **Fuel Metering**: Enables deterministic CPU limiting
/// - **Epoch Interruption**: Enables wall-clock deadlines
/// - **Async Support**: Guest calls are driven as futures
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the Wasmtime configuration is invalid or the
    /// pooling allocator cannot be initialized.
    pub fn new(config: &EngineConfig) -> Result<Self, SandboxError> {
        let mut wasmtime_config = Config::new();

        wasmtime_config.async_support(true);

        // Fuel is always consumed; sessions without metering get an
        // effectively unbounded budget.
        wasmtime_config.consume_fuel(true);

        if config.epoch_interruption {
            wasmtime_config.epoch_interruption(true);
        }

        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            SandboxError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!("Wasmtime engine initialized");

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    /// Create pooling allocation configuration.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);
        pooling.max_memory_size(config.instance_memory_bytes());

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }

    /// The epoch tick interval, if epoch interruption is enabled.
    pub fn epoch_tick(&self) -> Option<Duration> {
        self.config
            .epoch_interruption
            .then(|| self.config.epoch_tick())
    }

    /// Start the background thread that advances the epoch.
    ///
    /// Returns `None` when epoch interruption is disabled.
    pub fn start_ticker(&self) -> Result<Option<EpochTicker>, SandboxError> {
        match self.epoch_tick() {
            Some(interval) => EpochTicker::start(self.engine.as_ref().clone(), interval).map(Some),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("max_instances", &self.config.max_instances)
            .field("instance_memory_mb", &self.config.instance_memory_mb)
            .field("epoch_interruption", &self.config.epoch_interruption)
            .finish_non_exhaustive()
    }
}

/// Background epoch driver.
///
/// A dedicated OS thread rather than a runtime task: guest code runs on the
/// runtime's worker threads and can occupy all of them.
pub struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    /// Spawn a thread incrementing `engine`'s epoch every `interval`.
    pub fn start(engine: Engine, interval: Duration) -> Result<Self, SandboxError> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("csandbox-epoch".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    engine.increment_epoch();
                }
            })?;

        debug!(interval_ms = interval.as_millis(), "Epoch ticker started");

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for EpochTicker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochTicker")
            .field("running", &self.handle.is_some())
            .finish()
    }
}
