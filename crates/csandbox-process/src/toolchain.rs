//! Native compiler resolution.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{info, instrument};

use csandbox_common::{LoadOptions, SandboxConfig, SandboxError};

/// Environment variable overriding the configured compiler.
pub const COMPILER_ENV: &str = "CSANDBOX_CC";

/// A native C compiler verified to be invocable.
#[derive(Debug, Clone)]
pub struct NativeToolchain {
    compiler: String,
    version: String,
    base_args: Vec<String>,
    temp_dir: PathBuf,
}

impl NativeToolchain {
    /// Resolve the compiler and check that it runs.
    ///
    /// The compiler is taken from `options`, then [`COMPILER_ENV`], then the
    /// configuration, and must answer `--version` within the compile
    /// deadline. The temp directory is created if missing.
    ///
    /// # Errors
    ///
    /// Returns `ToolchainUnavailable` if the compiler cannot be run or the
    /// temp directory cannot be created.
    #[instrument(skip_all)]
    pub async fn load(config: &SandboxConfig, options: &LoadOptions) -> Result<Self, SandboxError> {
        let compiler = compiler_program(config, options);
        let temp_dir = config.toolchain.temp_dir();

        let version_check = Command::new(&compiler)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(config.execution.compile_timeout(), version_check)
            .await
            .map_err(|_| {
                SandboxError::toolchain_unavailable(format!("'{compiler} --version' timed out"))
            })?
            .map_err(|e| {
                SandboxError::toolchain_unavailable(format!("Cannot run compiler '{compiler}': {e}"))
            })?;

        if !output.status.success() {
            return Err(SandboxError::toolchain_unavailable(format!(
                "'{compiler} --version' exited with {}",
                output.status
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();

        tokio::fs::create_dir_all(&temp_dir).await.map_err(|e| {
            SandboxError::toolchain_unavailable(format!(
                "Cannot create temp dir {}: {e}",
                temp_dir.display()
            ))
        })?;

        info!(
            compiler = %compiler,
            version = %version,
            temp_dir = %temp_dir.display(),
            "Native toolchain ready"
        );

        Ok(Self {
            compiler,
            version,
            base_args: config.toolchain.compiler_args.clone(),
            temp_dir,
        })
    }

    /// Compiler executable.
    pub fn compiler(&self) -> &str {
        &self.compiler
    }

    /// First line of `--version`.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Arguments passed before any per-compile ones.
    pub fn base_args(&self) -> &[String] {
        &self.base_args
    }

    /// Directory for transient sources and binaries.
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }
}

/// Which compiler to run: `options`, then the environment, then config.
pub fn compiler_program(config: &SandboxConfig, options: &LoadOptions) -> String {
    options
        .toolchain_path
        .clone()
        .or_else(|| std::env::var(COMPILER_ENV).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| config.toolchain.compiler.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> SandboxConfig {
        let mut config = SandboxConfig::default();
        config.toolchain.temp_dir = Some(dir.join("work"));
        config
    }

    #[test]
    fn test_options_override_config() {
        let config = SandboxConfig::default();
        let options = LoadOptions::with_toolchain_path("/usr/bin/clang");

        assert_eq!(compiler_program(&config, &options), "/usr/bin/clang");
    }

    #[tokio::test]
    async fn test_missing_compiler_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let options = LoadOptions::with_toolchain_path("csandbox-no-such-cc");

        let err = NativeToolchain::load(&config_in(dir.path()), &options)
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::ToolchainUnavailable { .. }));
        assert!(err.to_string().contains("csandbox-no-such-cc"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_version_check_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        // `false` exits nonzero even for --version.
        let options = LoadOptions::with_toolchain_path("false");

        let err = NativeToolchain::load(&config_in(dir.path()), &options)
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::ToolchainUnavailable { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_version_check_creates_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        // Any program that accepts --version will do.
        let options = LoadOptions::with_toolchain_path("true");

        let toolchain = NativeToolchain::load(&config_in(dir.path()), &options)
            .await
            .unwrap();

        assert_eq!(toolchain.compiler(), "true");
        assert!(toolchain.temp_dir().is_dir());
        assert_eq!(toolchain.base_args(), ["-O2", "-std=c11"]);
    }
}
