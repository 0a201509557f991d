//! In-process compiler session.
//!
//! A [`WasmSession`] owns one instance of the toolchain image. Compiling
//! installs a [`WasmArtifact`] (a compiler state holding relocated code)
//! in the session's [`ArtifactSlot`]; running resolves an entry point in that
//! artifact and calls it. The artifact survives runs and is released by the
//! next compile or by [`WasmSession::close`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::Toolchain;
use crate::instance::{GuestFault, ToolchainInstance};
use csandbox_common::{
    Artifact, ArtifactSlot, CompileOptions, ExecutionConfig, ExecutionRequest, ExecutionResult,
    LineCollector, SandboxError,
};

/// Compiled code living inside the toolchain's linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WasmArtifact {
    state: i32,
    code_size: u32,
}

impl WasmArtifact {
    /// Size of the relocated code in bytes.
    pub fn code_size(&self) -> u32 {
        self.code_size
    }
}

#[async_trait]
impl Artifact for WasmArtifact {
    type Host = ToolchainInstance;

    async fn release(self, host: &mut ToolchainInstance) {
        host.delete_state(self.state).await;
    }
}

/// One user's in-process compile/run session.
pub struct WasmSession {
    id: String,
    toolchain: Arc<Toolchain>,
    guest: ToolchainInstance,
    slot: ArtifactSlot<WasmArtifact>,
    config: ExecutionConfig,
    last_stdout: String,
    last_stderr: String,
    last_diagnostic: Option<String>,
}

impl WasmSession {
    /// Open a session on a loaded toolchain.
    ///
    /// # Errors
    ///
    /// Returns `ToolchainUnavailable` if the image cannot be instantiated.
    pub async fn open(toolchain: Arc<Toolchain>, config: ExecutionConfig) -> Result<Self, SandboxError> {
        let id = uuid::Uuid::new_v4().to_string();
        let guest = toolchain.instantiate(&config, id.clone()).await?;

        info!(session_id = %id, "In-process session opened");

        Ok(Self {
            id,
            toolchain,
            guest,
            slot: ArtifactSlot::new(),
            config,
            last_stdout: String::new(),
            last_stderr: String::new(),
            last_diagnostic: None,
        })
    }

    /// Session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The toolchain this session runs on.
    pub fn toolchain(&self) -> &Arc<Toolchain> {
        &self.toolchain
    }

    /// Whether an artifact is installed.
    pub fn is_compiled(&self) -> bool {
        self.slot.is_compiled()
    }

    /// The installed artifact, if any.
    pub fn artifact(&self) -> Option<&WasmArtifact> {
        self.slot.current()
    }

    /// Compile `source`, replacing any previous artifact.
    ///
    /// On failure no artifact is installed and the compiler's text is
    /// available from [`last_diagnostic`](Self::last_diagnostic).
    #[instrument(skip(self, source, options), fields(session_id = %self.id, source_len = source.len()))]
    pub async fn compile(&mut self, source: &str, options: &CompileOptions) -> Result<(), SandboxError> {
        let start = Instant::now();

        self.slot.release(&mut self.guest).await;
        self.last_diagnostic = None;
        self.guest.context_mut().diagnostics.clear();

        let timeout = self.config.compile_timeout();
        self.guest.arm(timeout, &self.config)?;

        match self.build(source, options, timeout).await {
            Ok(artifact) => {
                info!(
                    code_size = artifact.code_size,
                    duration_ms = start.elapsed().as_millis(),
                    "Compilation succeeded"
                );
                self.slot.mark_compiled(&mut self.guest, artifact).await;
                Ok(())
            }
            Err(e) => {
                warn!(
                    duration_ms = start.elapsed().as_millis(),
                    error = %e,
                    "Compilation failed"
                );
                if let SandboxError::CompileFailed { diagnostic } = &e {
                    self.last_diagnostic = Some(diagnostic.clone());
                }
                Err(e)
            }
        }
    }

    async fn build(
        &mut self,
        source: &str,
        options: &CompileOptions,
        timeout: Duration,
    ) -> Result<WasmArtifact, SandboxError> {
        let state = self
            .guest
            .new_state()
            .await
            .map_err(|e| self.compile_fault(&e, timeout))?;

        if state == 0 {
            return Err(self.diagnostic_or("Failed to create compiler state"));
        }

        match self.build_in(state, source, options, timeout).await {
            Ok(code_size) => Ok(WasmArtifact { state, code_size }),
            Err(e) => {
                self.guest.delete_state(state).await;
                Err(e)
            }
        }
    }

    async fn build_in(
        &mut self,
        state: i32,
        source: &str,
        options: &CompileOptions,
        timeout: Duration,
    ) -> Result<u32, SandboxError> {
        for arg in &options.args {
            let rc = self
                .guest
                .add_option(state, arg)
                .await
                .map_err(|e| self.compile_fault(&e, timeout))?;
            if rc < 0 {
                return Err(self.diagnostic_or(format!("Invalid compiler option '{arg}'")));
            }
        }

        let rc = self
            .guest
            .compile_string(state, source)
            .await
            .map_err(|e| self.compile_fault(&e, timeout))?;
        if rc < 0 {
            return Err(self.diagnostic_or("Compilation failed"));
        }

        let size = self
            .guest
            .relocate(state)
            .await
            .map_err(|e| self.compile_fault(&e, timeout))?;

        u32::try_from(size).map_err(|_| self.diagnostic_or("Relocation failed"))
    }

    /// `CompileFailed` carrying the reported diagnostics, or `fallback`.
    fn diagnostic_or(&mut self, fallback: impl Into<String>) -> SandboxError {
        let diagnostic = self
            .guest
            .context_mut()
            .take_diagnostic()
            .unwrap_or_else(|| fallback.into());
        SandboxError::compile_failed(diagnostic)
    }

    fn compile_fault(&mut self, error: &wasmtime::Error, timeout: Duration) -> SandboxError {
        match GuestFault::from_error(error) {
            GuestFault::DeadlineExceeded => self.diagnostic_or(format!(
                "Compilation timed out after {}ms",
                timeout.as_millis()
            )),
            GuestFault::Trapped { message, .. } => {
                self.diagnostic_or(format!("Compiler crashed: {message}"))
            }
        }
    }

    /// Resolve `symbol` in the installed artifact.
    ///
    /// # Errors
    ///
    /// `NothingCompiled` without an artifact, `SymbolNotFound` if the
    /// compiler does not know the symbol.
    pub async fn lookup_symbol(&mut self, symbol: &str) -> Result<u32, SandboxError> {
        let artifact = *self.slot.current().ok_or(SandboxError::NothingCompiled)?;

        self.guest.arm(self.config.compile_timeout(), &self.config)?;
        self.resolve(artifact, symbol).await
    }

    #[allow(clippy::cast_sign_loss)]
    async fn resolve(&mut self, artifact: WasmArtifact, symbol: &str) -> Result<u32, SandboxError> {
        let address = self
            .guest
            .get_symbol(artifact.state, symbol)
            .await
            .map_err(|e| SandboxError::runtime(format!("Symbol lookup trapped: {e}")))?;

        if address == 0 {
            return Err(SandboxError::symbol_not_found(symbol));
        }

        Ok(address as u32)
    }

    /// Run the installed artifact.
    ///
    /// Never fails outright: every problem is reported through the returned
    /// [`ExecutionResult`]. The artifact stays installed for further runs.
    #[instrument(skip(self, request), fields(session_id = %self.id, entry = request.entry_point()))]
    pub async fn run(&mut self, request: &ExecutionRequest) -> ExecutionResult {
        let start = Instant::now();

        let Some(artifact) = self.slot.current().copied() else {
            warn!("Run requested with nothing compiled");
            return self.remember(ExecutionResult::from_error(&SandboxError::NothingCompiled));
        };

        let timeout = request
            .timeout_ms
            .map_or_else(|| self.config.run_timeout(), Duration::from_millis);

        let result = match self.invoke(artifact, request, timeout).await {
            Ok(result) => result,
            Err(e) => ExecutionResult::from_error(&e),
        }
        .with_duration(start.elapsed());

        info!(
            success = result.success,
            exit_code = ?result.exit_code,
            duration_ms = result.duration_ms,
            fuel_consumed = self.guest.context().metrics.fuel_consumed,
            "Run finished"
        );

        self.remember(result)
    }

    fn remember(&mut self, result: ExecutionResult) -> ExecutionResult {
        self.last_stdout.clone_from(&result.stdout);
        self.last_stderr.clone_from(&result.stderr);
        result
    }

    #[allow(clippy::cast_sign_loss)]
    async fn invoke(
        &mut self,
        artifact: WasmArtifact,
        request: &ExecutionRequest,
        timeout: Duration,
    ) -> Result<ExecutionResult, SandboxError> {
        self.guest.arm(self.config.compile_timeout(), &self.config)?;
        let address = self.resolve(artifact, request.entry_point()).await?;

        debug!(address, "Entry point resolved");

        let stdout = LineCollector::with_cap(self.config.max_output_bytes);
        let stderr = LineCollector::with_cap(self.config.max_output_bytes);
        {
            let ctx = self.guest.context_mut();
            ctx.set_input(request.input.as_bytes());
            ctx.attach(
                stdout.sink(),
                stderr.sink(),
                self.config.max_output_bytes.saturating_add(1),
            );
        }

        let budget = self.guest.arm(timeout, &self.config)?;
        let call_start = Instant::now();
        let outcome = tokio::time::timeout(
            timeout,
            self.guest.call(artifact.state, address as i32),
        )
        .await;
        self.guest.record_metrics(budget, call_start);

        let (out_tail, err_tail) = self.guest.context_mut().detach();

        let mut result = ExecutionResult {
            stdout: stdout.into_text(out_tail.as_deref()),
            stderr: stderr.into_text(err_tail.as_deref()),
            symbol_address: Some(address),
            ..Default::default()
        };

        let timed_out = SandboxError::Timeout {
            duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };

        match outcome {
            Ok(Ok(value)) => {
                result.exit_code = Some(value);
                result.success = true;
                if value != 0 && self.config.nonzero_exit_is_failure {
                    result.fail(&SandboxError::runtime(format!(
                        "Program returned nonzero value {value}"
                    )));
                }
            }
            Ok(Err(e)) => match GuestFault::from_error(&e) {
                GuestFault::DeadlineExceeded => result.fail(&timed_out),
                GuestFault::Trapped { message, .. } => {
                    result.fail(&SandboxError::runtime(message));
                }
            },
            Err(_) => result.fail(&timed_out),
        }

        Ok(result)
    }

    /// Release the installed artifact, if any.
    pub async fn release(&mut self) -> bool {
        self.slot.release(&mut self.guest).await
    }

    /// Release everything and end the session.
    pub async fn close(mut self) {
        self.release().await;
        info!(session_id = %self.id, "In-process session closed");
    }

    /// Standard output of the last run.
    pub fn last_stdout(&self) -> &str {
        &self.last_stdout
    }

    /// Standard error of the last run.
    pub fn last_stderr(&self) -> &str {
        &self.last_stderr
    }

    /// Diagnostic of the last failed compile.
    pub fn last_diagnostic(&self) -> Option<&str> {
        self.last_diagnostic.as_deref()
    }
}

impl std::fmt::Debug for WasmSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmSession")
            .field("id", &self.id)
            .field("artifact", &self.slot.current())
            .finish_non_exhaustive()
    }
}
