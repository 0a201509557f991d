//! Spawned-process compiler session.
//!
//! A [`ProcessSession`] compiles C source with the native compiler into a
//! binary in the toolchain's temp directory, then runs that binary as a
//! child process. The artifact is consumed by the run: both files are
//! removed after every run, after the configured cleanup delay. Closing or
//! dropping the session removes whatever is still waiting on that delay.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::NativeToolchain;
use crate::artifact::{Cleanup, ProcessArtifact, next_stem};
use crate::runner::{ChildStatus, run_child};
use csandbox_common::{
    ArtifactSlot, CompileOptions, ExecutionConfig, ExecutionResult, SandboxError,
};

/// One user's compile/run session backed by native processes.
pub struct ProcessSession {
    id: String,
    toolchain: Arc<NativeToolchain>,
    slot: ArtifactSlot<ProcessArtifact>,
    cleanup: Cleanup,
    config: ExecutionConfig,
    last_stdout: String,
    last_stderr: String,
    last_diagnostic: Option<String>,
}

impl ProcessSession {
    /// Open a session on a loaded toolchain.
    pub fn open(toolchain: Arc<NativeToolchain>, config: ExecutionConfig) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        debug!(session_id = %id, "Process session opened");

        Self {
            id,
            toolchain,
            slot: ArtifactSlot::new(),
            cleanup: Cleanup::after(config.cleanup_delay()),
            config,
            last_stdout: String::new(),
            last_stderr: String::new(),
            last_diagnostic: None,
        }
    }

    /// Session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether an artifact is installed.
    pub fn is_compiled(&self) -> bool {
        self.slot.is_compiled()
    }

    /// The installed artifact, if any.
    pub fn artifact(&self) -> Option<&ProcessArtifact> {
        self.slot.current()
    }

    /// Compile `source`, replacing any previous artifact.
    ///
    /// # Errors
    ///
    /// `ToolingMissing` if the compiler cannot be spawned, `CompileFailed`
    /// with the compiler's stderr if it rejects the source or exceeds the
    /// compile deadline.
    #[instrument(skip(self, source, options), fields(session_id = %self.id, source_len = source.len()))]
    pub async fn compile(&mut self, source: &str, options: &CompileOptions) -> Result<(), SandboxError> {
        let start = Instant::now();

        self.slot.release(&mut self.cleanup).await;
        self.last_diagnostic = None;

        let artifact = ProcessArtifact::new(self.toolchain.temp_dir(), &next_stem());

        match self.build(&artifact, source, options).await {
            Ok(()) => {
                info!(
                    binary = %artifact.binary().display(),
                    duration_ms = start.elapsed().as_millis(),
                    "Compilation succeeded"
                );
                self.slot.mark_compiled(&mut self.cleanup, artifact).await;
                Ok(())
            }
            Err(e) => {
                warn!(
                    duration_ms = start.elapsed().as_millis(),
                    error = %e,
                    "Compilation failed"
                );
                artifact.remove_now();
                if let SandboxError::CompileFailed { diagnostic } = &e {
                    self.last_diagnostic = Some(diagnostic.clone());
                }
                Err(e)
            }
        }
    }

    async fn build(
        &self,
        artifact: &ProcessArtifact,
        source: &str,
        options: &CompileOptions,
    ) -> Result<(), SandboxError> {
        tokio::fs::write(artifact.source(), source).await?;

        let compiler = self.toolchain.compiler();
        let child = Command::new(compiler)
            .args(self.toolchain.base_args())
            .args(&options.args)
            .arg(artifact.source())
            .arg("-o")
            .arg(artifact.binary())
            .current_dir(self.toolchain.temp_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => SandboxError::tooling_missing(compiler),
                _ => SandboxError::Io(e),
            })?;

        let timeout = self.config.compile_timeout();
        let Ok(output) = tokio::time::timeout(timeout, child.wait_with_output()).await else {
            // Dropping the child kills it.
            return Err(SandboxError::compile_failed(format!(
                "Compilation timed out after {}ms",
                timeout.as_millis()
            )));
        };
        let output = output?;

        if !output.status.success() {
            let mut diagnostic = String::from_utf8_lossy(&output.stderr).into_owned();
            if diagnostic.trim().is_empty() {
                diagnostic = format!("{compiler} exited with {}", output.status);
            }
            return Err(SandboxError::compile_failed(diagnostic));
        }

        if !tokio::fs::try_exists(artifact.binary()).await.unwrap_or(false) {
            return Err(SandboxError::compile_failed(
                "Compiler produced no output binary",
            ));
        }

        Ok(())
    }

    /// Run the installed artifact with `input` on stdin.
    ///
    /// Never fails outright: every problem is reported through the returned
    /// [`ExecutionResult`]. The artifact is released afterwards, whatever
    /// the outcome.
    #[instrument(skip(self, input), fields(session_id = %self.id, input_len = input.len()))]
    pub async fn run(&mut self, input: &str) -> ExecutionResult {
        self.run_with_timeout(input, self.config.run_timeout()).await
    }

    /// [`run`](Self::run) with an explicit deadline.
    pub async fn run_with_timeout(&mut self, input: &str, timeout: Duration) -> ExecutionResult {
        let start = Instant::now();

        let Some(artifact) = self.slot.current().cloned() else {
            warn!("Run requested with nothing compiled");
            return self.remember(ExecutionResult::from_error(&SandboxError::NothingCompiled));
        };

        let result = match self.execute(&artifact, input, timeout).await {
            Ok(result) => result,
            Err(e) => ExecutionResult::from_error(&e),
        }
        .with_duration(start.elapsed());

        self.slot.release(&mut self.cleanup).await;

        info!(
            success = result.success,
            exit_code = ?result.exit_code,
            duration_ms = result.duration_ms,
            "Run finished"
        );

        self.remember(result)
    }

    fn remember(&mut self, result: ExecutionResult) -> ExecutionResult {
        self.last_stdout.clone_from(&result.stdout);
        self.last_stderr.clone_from(&result.stderr);
        result
    }

    async fn execute(
        &self,
        artifact: &ProcessArtifact,
        input: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult, SandboxError> {
        let outcome = run_child(
            artifact.binary(),
            self.toolchain.temp_dir(),
            input.as_bytes(),
            timeout,
            self.config.max_output_bytes,
        )
        .await?;

        let mut result = ExecutionResult {
            stdout: outcome.stdout.into_string(),
            stderr: outcome.stderr.into_string(),
            exit_code: outcome.status.exit_code(),
            ..Default::default()
        };

        match outcome.status {
            ChildStatus::Exited(code) => {
                result.success = true;
                if code != 0 && self.config.nonzero_exit_is_failure {
                    result.fail(&SandboxError::runtime(format!(
                        "Program exited with code {code}"
                    )));
                }
            }
            ChildStatus::Signaled(signal) => {
                result.fail(&SandboxError::runtime(format!(
                    "Program terminated by signal {signal}"
                )));
            }
            ChildStatus::TimedOut => {
                result.fail(&SandboxError::Timeout {
                    duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        }

        Ok(result)
    }

    /// Compile and run in one step.
    ///
    /// A failed compile is reported as a result carrying the diagnostic.
    pub async fn run_source(
        &mut self,
        source: &str,
        options: &CompileOptions,
        input: &str,
    ) -> ExecutionResult {
        let start = Instant::now();
        match self.compile(source, options).await {
            Ok(()) => self.run(input).await,
            Err(e) => {
                let result = ExecutionResult::from_error(&e).with_duration(start.elapsed());
                self.remember(result)
            }
        }
    }

    /// Release the installed artifact, if any.
    pub async fn release(&mut self) -> bool {
        self.slot.release(&mut self.cleanup).await
    }

    /// Release everything and end the session.
    ///
    /// Files are removed before this returns, even those released earlier
    /// whose cleanup delay has not elapsed.
    pub async fn close(mut self) {
        self.release().await;
        self.cleanup.flush();
        debug!(session_id = %self.id, "Process session closed");
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

impl Drop for ProcessSession {
    fn drop(&mut self) {
        if let Some(artifact) = self.slot.take() {
            artifact.remove_now();
        }
        self.cleanup.flush();
    }
}

impl std::fmt::Debug for ProcessSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSession")
            .field("id", &self.id)
            .field("compiler", &self.toolchain.compiler())
            .field("artifact", &self.slot.current())
            .finish_non_exhaustive()
    }
}
