//! Toolchain instance lifecycle management.
//!
//! This module provides [`InstanceRunner`], which links host functions and
//! instantiates the toolchain image, and [`ToolchainInstance`], the typed
//! view of one instantiated image:
//!
//! 1. Link host functions with the image
//! 2. Instantiate the image into a session's store
//! 3. Resolve the compiler ABI exports
//! 4. Run the optional `_initialize` reactor hook

use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};
use wasmtime::{Instance, Linker, Memory, Store, Trap, TypedFunc};

use crate::module::MEMORY_EXPORT;
use crate::store::{SessionContext, calculate_fuel_consumed, deadline_ticks, fuel_budget};
use crate::{ToolchainImage, WasmEngine};
use csandbox_common::{ExecutionConfig, SandboxError};

/// How a guest call ended abnormally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestFault {
    /// The epoch deadline passed or the fuel budget ran out.
    DeadlineExceeded,

    /// Any other trap or host error.
    Trapped {
        /// Description of the trap.
        message: String,
        /// Trap code if available.
        code: Option<String>,
    },
}

impl GuestFault {
    /// Classify a Wasmtime call error.
    pub fn from_error(error: &wasmtime::Error) -> Self {
        match error.downcast_ref::<Trap>() {
            Some(Trap::Interrupt | Trap::OutOfFuel) => Self::DeadlineExceeded,
            trap => Self::Trapped {
                message: format!("{error:#}"),
                code: trap.map(|t| format!("{t:?}")),
            },
        }
    }

    /// Returns `true` if the call was stopped by a limit.
    pub fn is_deadline(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }
}

/// Instance lifecycle manager.
///
/// Holds the linker with every host import registered. One runner is shared
/// by all sessions of a toolchain; each session gets its own [`Store`].
pub struct InstanceRunner {
    linker: Linker<SessionContext>,
}

impl InstanceRunner {
    /// Create a new instance runner with an empty linker.
    pub fn new(engine: &WasmEngine) -> Self {
        Self {
            linker: Linker::new(engine.inner()),
        }
    }

    /// Get a mutable reference to the linker.
    ///
    /// Use this to register host functions.
    pub fn linker_mut(&mut self) -> &mut Linker<SessionContext> {
        &mut self.linker
    }

    /// Instantiate `image` into `store`.
    ///
    /// # Errors
    ///
    /// Returns `ToolchainUnavailable` if instantiation fails, an ABI export
    /// has the wrong signature, or `_initialize` traps.
    #[instrument(skip_all, fields(session_id = %store.data().session_id))]
    pub async fn instantiate(
        &self,
        image: &ToolchainImage,
        mut store: Store<SessionContext>,
        epoch_tick: Option<Duration>,
    ) -> Result<ToolchainInstance, SandboxError> {
        debug!("Instantiating toolchain image");

        let instance = self
            .linker
            .instantiate_async(&mut store, image.module())
            .await
            .map_err(|e| SandboxError::toolchain_unavailable(format!("Instantiation failed: {e}")))?;

        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or_else(|| SandboxError::toolchain_unavailable("Toolchain exports no memory"))?;

        let abi = ToolchainAbi::resolve(&instance, &mut store)?;

        if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, "_initialize") {
            debug!("Running toolchain reactor initialization");
            init.call_async(&mut store, ()).await.map_err(|e| {
                SandboxError::toolchain_unavailable(format!("Toolchain initialization failed: {e}"))
            })?;
        }

        debug!("Toolchain instantiated");

        Ok(ToolchainInstance {
            store,
            memory,
            abi,
            epoch_tick,
        })
    }
}

impl std::fmt::Debug for InstanceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRunner").finish_non_exhaustive()
    }
}

/// Typed handles to the compiler ABI exports.
struct ToolchainAbi {
    malloc: TypedFunc<i32, i32>,
    free: TypedFunc<i32, ()>,
    new_state: TypedFunc<(), i32>,
    delete_state: TypedFunc<i32, ()>,
    add_option: TypedFunc<(i32, i32), i32>,
    compile_string: TypedFunc<(i32, i32), i32>,
    relocate: TypedFunc<i32, i32>,
    get_symbol: TypedFunc<(i32, i32), i32>,
    call: TypedFunc<(i32, i32), i32>,
}

impl ToolchainAbi {
    fn resolve(instance: &Instance, store: &mut Store<SessionContext>) -> Result<Self, SandboxError> {
        fn export<P, R>(
            instance: &Instance,
            store: &mut Store<SessionContext>,
            name: &str,
        ) -> Result<TypedFunc<P, R>, SandboxError>
        where
            P: wasmtime::WasmParams,
            R: wasmtime::WasmResults,
        {
            instance.get_typed_func::<P, R>(store, name).map_err(|e| {
                SandboxError::toolchain_unavailable(format!("Bad toolchain export '{name}': {e}"))
            })
        }

        Ok(Self {
            malloc: export(instance, store, "malloc")?,
            free: export(instance, store, "free")?,
            new_state: export(instance, store, "cc_new")?,
            delete_state: export(instance, store, "cc_delete")?,
            add_option: export(instance, store, "cc_add_option")?,
            compile_string: export(instance, store, "cc_compile_string")?,
            relocate: export(instance, store, "cc_relocate")?,
            get_symbol: export(instance, store, "cc_get_symbol")?,
            call: export(instance, store, "cc_call")?,
        })
    }
}

/// One instantiated toolchain image and the store it lives in.
///
/// Raw ABI calls return [`wasmtime::Result`] so callers can tell traps and
/// deadline interrupts apart with [`GuestFault::from_error`].
pub struct ToolchainInstance {
    store: Store<SessionContext>,
    memory: Memory,
    abi: ToolchainAbi,
    epoch_tick: Option<Duration>,
}

impl ToolchainInstance {
    /// The session context.
    pub fn context(&self) -> &SessionContext {
        self.store.data()
    }

    /// The session context, mutably.
    pub fn context_mut(&mut self) -> &mut SessionContext {
        self.store.data_mut()
    }

    /// Refill fuel and set the epoch deadline for the next guest call.
    ///
    /// Returns the fuel budget that was installed.
    pub fn arm(&mut self, timeout: Duration, config: &ExecutionConfig) -> Result<u64, SandboxError> {
        let budget = fuel_budget(config);
        self.store
            .set_fuel(budget)
            .map_err(|e| SandboxError::invalid_config(format!("Failed to set fuel: {e}")))?;

        if let Some(tick) = self.epoch_tick {
            self.store.set_epoch_deadline(deadline_ticks(timeout, tick));
        }

        Ok(budget)
    }

    /// Record fuel and duration of the call that started at `start`.
    pub fn record_metrics(&mut self, budget: u64, start: Instant) {
        let fuel_consumed = calculate_fuel_consumed(budget, &self.store);
        let metrics = &mut self.store.data_mut().metrics;
        metrics.fuel_consumed = fuel_consumed;
        metrics.duration = Some(start.elapsed());
    }

    /// `cc_new`: allocate a compiler state. 0 means failure.
    pub async fn new_state(&mut self) -> wasmtime::Result<i32> {
        self.abi.new_state.call_async(&mut self.store, ()).await
    }

    /// `cc_delete`: free a compiler state and its relocated code.
    ///
    /// Best effort; a trap here is logged and swallowed.
    pub async fn delete_state(&mut self, state: i32) {
        if let Err(e) = self.abi.delete_state.call_async(&mut self.store, state).await {
            warn!(state, error = %e, "Failed to delete compiler state");
        }
    }

    /// `cc_add_option`: apply one compiler argument.
    pub async fn add_option(&mut self, state: i32, option: &str) -> wasmtime::Result<i32> {
        self.call_with_string(|abi| &abi.add_option, state, option)
            .await
    }

    /// `cc_compile_string`: compile C source. Negative means failure.
    pub async fn compile_string(&mut self, state: i32, source: &str) -> wasmtime::Result<i32> {
        self.call_with_string(|abi| &abi.compile_string, state, source)
            .await
    }

    /// `cc_relocate`: place the compiled code in memory. Returns the code
    /// size, negative on failure.
    pub async fn relocate(&mut self, state: i32) -> wasmtime::Result<i32> {
        self.abi.relocate.call_async(&mut self.store, state).await
    }

    /// `cc_get_symbol`: resolve a symbol. 0 means absent.
    pub async fn get_symbol(&mut self, state: i32, name: &str) -> wasmtime::Result<i32> {
        self.call_with_string(|abi| &abi.get_symbol, state, name)
            .await
    }

    /// `cc_call`: invoke the function at `address`, returning its result.
    pub async fn call(&mut self, state: i32, address: i32) -> wasmtime::Result<i32> {
        self.abi.call.call_async(&mut self.store, (state, address)).await
    }

    async fn call_with_string(
        &mut self,
        select: fn(&ToolchainAbi) -> &TypedFunc<(i32, i32), i32>,
        state: i32,
        text: &str,
    ) -> wasmtime::Result<i32> {
        let ptr = self.write_c_string(text).await?;
        let result = select(&self.abi)
            .call_async(&mut self.store, (state, ptr))
            .await;
        self.release_guest(ptr).await;
        result
    }

    /// Copy `text` plus a NUL terminator into guest memory.
    #[allow(clippy::cast_sign_loss)]
    async fn write_c_string(&mut self, text: &str) -> wasmtime::Result<i32> {
        let len = i32::try_from(text.len() + 1)
            .map_err(|_| wasmtime::Error::msg("string too large for guest memory"))?;

        let ptr = self.abi.malloc.call_async(&mut self.store, len).await?;
        if ptr == 0 {
            return Err(wasmtime::Error::msg("guest allocation failed"));
        }

        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);

        if let Err(e) = self.memory.write(&mut self.store, ptr as u32 as usize, &bytes) {
            self.release_guest(ptr).await;
            return Err(e.into());
        }

        Ok(ptr)
    }

    async fn release_guest(&mut self, ptr: i32) {
        if let Err(e) = self.abi.free.call_async(&mut self.store, ptr).await {
            debug!(ptr, error = %e, "Guest free failed");
        }
    }
}

impl std::fmt::Debug for ToolchainInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolchainInstance")
            .field("context", self.store.data())
            .field("epoch_tick", &self.epoch_tick)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_from_interrupt() {
        let err = wasmtime::Error::new(Trap::Interrupt);
        assert_eq!(GuestFault::from_error(&err), GuestFault::DeadlineExceeded);

        let err = wasmtime::Error::new(Trap::OutOfFuel);
        assert!(GuestFault::from_error(&err).is_deadline());
    }

    #[test]
    fn test_fault_from_trap() {
        let err = wasmtime::Error::new(Trap::UnreachableCodeReached);
        let fault = GuestFault::from_error(&err);

        match fault {
            GuestFault::Trapped { code, .. } => {
                assert_eq!(code.as_deref(), Some("UnreachableCodeReached"));
            }
            GuestFault::DeadlineExceeded => panic!("expected a trap"),
        }
    }

    #[test]
    fn test_fault_from_host_error() {
        let err = wasmtime::Error::msg("guest allocation failed");
        let fault = GuestFault::from_error(&err);

        assert_eq!(
            fault,
            GuestFault::Trapped {
                message: "guest allocation failed".into(),
                code: None,
            }
        );
    }
}
