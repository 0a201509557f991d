//! Per-session guest context and store management.
//!
//! This module provides:
//! - [`SessionContext`]: Per-session state accessible from host functions
//! - [`ExecutionMetrics`]: Fuel and timing of the last guest call
//! - [`create_store`]: Store construction with memory, fuel and epoch limits

use std::time::Duration;

use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::WasmEngine;
use csandbox_common::{ExecutionConfig, LineBuffer, LineSink, SandboxError, StreamKind};

/// Fuel given to stores when metering is off.
///
/// Fuel is always consumed by the engine, so an unmetered store still needs
/// a budget; this one is never reached in practice.
pub const UNMETERED_FUEL: u64 = u64::MAX / 2;

/// Diagnostics kept per compile or call; later reports are dropped.
pub const MAX_DIAGNOSTICS: usize = 100;

/// Per-session guest context.
///
/// Lives inside the session's [`Store`] for as long as the session does.
/// Host functions reach it through [`wasmtime::Caller::data_mut`].
///
/// # Contents
///
/// - `wasi`: WASI preview1 context (no preopens, no inherited stdio)
/// - `limits`: fixed working-memory cap
/// - `stdout` / `stderr`: line buffers fed by `cc_putchar`
/// - `diagnostics`: compiler messages reported through `cc_error`
/// - stdin payload consumed by `cc_getchar`
pub struct SessionContext {
    wasi: WasiP1Ctx,

    limits: StoreLimits,

    /// Session identifier for tracing.
    pub session_id: String,

    /// Guest standard output.
    pub stdout: LineBuffer,

    /// Guest standard error.
    pub stderr: LineBuffer,

    /// Compiler diagnostics of the current compile.
    pub diagnostics: Vec<String>,

    input: Vec<u8>,
    input_pos: usize,

    /// Metrics of the last guest call.
    pub metrics: ExecutionMetrics,
}

/// Guest call metrics.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetrics {
    /// Fuel consumed by the last call.
    pub fuel_consumed: u64,

    /// Duration of the last call.
    pub duration: Option<Duration>,
}

impl SessionContext {
    /// Create a context whose linear memories may grow to `memory_limit`
    /// bytes.
    pub fn new(session_id: String, memory_limit: usize) -> Self {
        let wasi = WasiCtxBuilder::new().build_p1();
        let limits = StoreLimitsBuilder::new()
            .memory_size(memory_limit)
            .instances(1)
            .build();

        Self {
            wasi,
            limits,
            session_id,
            stdout: LineBuffer::new(),
            stderr: LineBuffer::new(),
            diagnostics: Vec::new(),
            input: Vec::new(),
            input_pos: 0,
            metrics: ExecutionMetrics::default(),
        }
    }

    /// WASI context, for the preview1 linker bindings.
    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }

    /// The line buffer for `stream`.
    pub fn stream_mut(&mut self, stream: StreamKind) -> &mut LineBuffer {
        match stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        }
    }

    /// Record a compiler diagnostic.
    pub fn report_diagnostic(&mut self, message: impl Into<String>) {
        if self.diagnostics.len() < MAX_DIAGNOSTICS {
            self.diagnostics.push(message.into());
        }
    }

    /// Take the diagnostics of the current compile, joined into one text.
    pub fn take_diagnostic(&mut self) -> Option<String> {
        if self.diagnostics.is_empty() {
            return None;
        }
        let text = self.diagnostics.join("\n");
        self.diagnostics.clear();
        Some(text)
    }

    /// Replace the stdin payload and rewind.
    pub fn set_input(&mut self, input: &[u8]) {
        self.input.clear();
        self.input.extend_from_slice(input);
        self.input_pos = 0;
    }

    /// Next stdin byte, or `None` at end of input.
    pub fn next_input(&mut self) -> Option<u8> {
        let byte = self.input.get(self.input_pos).copied()?;
        self.input_pos += 1;
        Some(byte)
    }

    /// Route both streams to the given sinks for one call.
    ///
    /// Stale partial lines and diagnostics from an earlier call are dropped.
    /// A pending line is held to at most `max_line` bytes.
    pub fn attach(&mut self, stdout: LineSink, stderr: LineSink, max_line: usize) {
        self.diagnostics.clear();
        for (buffer, sink) in [(&mut self.stdout, stdout), (&mut self.stderr, stderr)] {
            buffer.clear();
            buffer.set_limit(Some(max_line));
            buffer.set_sink(Some(sink));
        }
    }

    /// Mute both streams, returning their unterminated trailing text.
    pub fn detach(&mut self) -> (Option<String>, Option<String>) {
        let out = take_pending(&mut self.stdout);
        let err = take_pending(&mut self.stderr);
        self.stdout.set_sink(None);
        self.stderr.set_sink(None);
        (out, err)
    }
}

fn take_pending(buffer: &mut LineBuffer) -> Option<String> {
    if buffer.pending().is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(buffer.pending()).into_owned();
    buffer.clear();
    Some(text)
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .field("diagnostics", &self.diagnostics.len())
            .field("input_len", &self.input.len())
            .finish_non_exhaustive()
    }
}

/// Fuel budget for one guest call.
pub fn fuel_budget(config: &ExecutionConfig) -> u64 {
    if config.fuel_metering {
        config.max_fuel
    } else {
        UNMETERED_FUEL
    }
}

/// Number of epoch ticks covering `timeout`, at least one.
pub fn deadline_ticks(timeout: Duration, tick: Duration) -> u64 {
    let tick_ms = tick.as_millis().max(1);
    let ticks = timeout.as_millis().div_ceil(tick_ms);
    u64::try_from(ticks).unwrap_or(u64::MAX).max(1)
}

/// Create a new Wasmtime store for one session.
///
/// The store is armed with the compile budget so that instantiation and the
/// image's `_initialize` are bounded too.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(
    engine: &WasmEngine,
    config: &ExecutionConfig,
    session_id: String,
) -> Result<Store<SessionContext>, SandboxError> {
    let context = SessionContext::new(session_id, engine.config().instance_memory_bytes());
    let mut store = Store::new(engine.inner(), context);

    store.limiter(|ctx| &mut ctx.limits);

    store
        .set_fuel(fuel_budget(config))
        .map_err(|e| SandboxError::invalid_config(format!("Failed to set fuel: {e}")))?;

    if let Some(tick) = engine.epoch_tick() {
        store.epoch_deadline_trap();
        store.set_epoch_deadline(deadline_ticks(config.compile_timeout(), tick));
    }

    Ok(store)
}

/// Get remaining fuel from a store.
pub fn get_remaining_fuel(store: &Store<SessionContext>) -> Option<u64> {
    store.get_fuel().ok()
}

/// Calculate fuel consumed.
pub fn calculate_fuel_consumed(initial_fuel: u64, store: &Store<SessionContext>) -> u64 {
    let remaining = get_remaining_fuel(store).unwrap_or(0);
    initial_fuel.saturating_sub(remaining)
}
