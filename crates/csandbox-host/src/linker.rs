//! Host function registration for Wasmtime linkers.
//!
//! This module provides functions to register the imports the toolchain image
//! expects on a [`Linker<SessionContext>`].

use csandbox_common::SandboxError;
use csandbox_core::SessionContext;
use tracing::warn;
use wasmtime::{Caller, Linker};

use crate::stdio::StdioHost;

/// Module name of the toolchain's host imports.
pub const HOST_MODULE: &str = "env";

/// Register all host functions on a linker.
///
/// This registers the following host functions:
/// - `env::cc_putchar` - Character output for the compiled program
/// - `env::cc_getchar` - Character input for the compiled program
/// - `env::cc_error` - Compiler diagnostics
/// - WASI preview1, for images built against wasi-libc
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn register_all(linker: &mut Linker<SessionContext>) -> Result<(), SandboxError> {
    register_stdio(linker)?;
    register_diagnostics(linker)?;
    register_wasi(linker)?;
    Ok(())
}

/// Register `env::cc_putchar(stream: i32, ch: i32)` and
/// `env::cc_getchar() -> i32`.
pub fn register_stdio(linker: &mut Linker<SessionContext>) -> Result<(), SandboxError> {
    linker
        .func_wrap(
            HOST_MODULE,
            "cc_putchar",
            |mut caller: Caller<'_, SessionContext>, stream: i32, ch: i32| {
                StdioHost::put_char(caller.data_mut(), stream, ch);
            },
        )
        .map_err(|e| registration_failed("cc_putchar", &e))?;

    linker
        .func_wrap(
            HOST_MODULE,
            "cc_getchar",
            |mut caller: Caller<'_, SessionContext>| -> i32 { StdioHost::get_char(caller.data_mut()) },
        )
        .map_err(|e| registration_failed("cc_getchar", &e))?;

    Ok(())
}

/// Register the diagnostic callback.
///
/// Registers `env::cc_error(ptr: i32, len: i32)`, through which the compiler
/// reports error text.
///
/// # Memory Protocol
///
/// The guest passes:
/// - `ptr`: Pointer to the message in guest memory
/// - `len`: Length of the message in bytes (UTF-8, decoded lossily)
pub fn register_diagnostics(linker: &mut Linker<SessionContext>) -> Result<(), SandboxError> {
    linker
        .func_wrap(
            HOST_MODULE,
            "cc_error",
            |mut caller: Caller<'_, SessionContext>, ptr: i32, len: i32| {
                if ptr < 0 || len < 0 {
                    warn!(ptr, len, "Invalid pointer or length (negative value)");
                    return;
                }

                let Some(memory) = caller
                    .get_export("memory")
                    .and_then(wasmtime::Extern::into_memory)
                else {
                    warn!("Memory export not found in toolchain image");
                    return;
                };

                #[allow(clippy::cast_sign_loss)]
                let message = {
                    let data = memory.data(&caller);
                    let start = ptr as usize;
                    let Some(end) = start.checked_add(len as usize) else {
                        warn!(ptr, len, "Pointer + length overflow");
                        return;
                    };

                    let Some(bytes) = data.get(start..end) else {
                        warn!(
                            start,
                            end,
                            memory_size = data.len(),
                            "Memory access out of bounds"
                        );
                        return;
                    };

                    String::from_utf8_lossy(bytes).into_owned()
                };

                StdioHost::report_error(caller.data_mut(), &message);
            },
        )
        .map_err(|e| registration_failed("cc_error", &e))?;

    Ok(())
}

/// Link WASI preview1.
///
/// The context has no preopened directories or inherited stdio, so the
/// image can link against wasi-libc without gaining host access.
pub fn register_wasi(linker: &mut Linker<SessionContext>) -> Result<(), SandboxError> {
    wasmtime_wasi::preview1::add_to_linker_async(linker, SessionContext::wasi_mut)
        .map_err(|e| registration_failed("wasi_snapshot_preview1", &e))
}

fn registration_failed(name: &str, error: &wasmtime::Error) -> SandboxError {
    SandboxError::invalid_config(format!("Failed to register {name}: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use csandbox_common::EngineConfig;
    use csandbox_core::WasmEngine;

    fn engine() -> WasmEngine {
        WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_register_stdio() {
        let engine = engine();
        let mut linker = Linker::new(engine.inner());

        assert!(register_stdio(&mut linker).is_ok());
        assert!(register_diagnostics(&mut linker).is_ok());
    }

    #[test]
    fn test_register_all() {
        let engine = engine();
        let mut linker = Linker::new(engine.inner());

        let result = register_all(&mut linker);
        assert!(result.is_ok());
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let engine = engine();
        let mut linker = Linker::new(engine.inner());

        register_stdio(&mut linker).unwrap();
        let err = register_stdio(&mut linker).unwrap_err();

        assert!(err.to_string().contains("cc_putchar"));
    }
}
