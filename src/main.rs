//! csandbox CLI entry point.
//!
//! `csandbox serve` runs the HTTP server; `csandbox run` compiles and runs a
//! single C file and exits with the program's exit code.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use csandbox_common::{
    CompileOptions, ConfigFile, ExecutionRequest, ExecutionResult, LoadOptions, SandboxConfig,
};
use csandbox_core::WasmSession;
use csandbox_process::{NativeToolchain, ProcessSession};
use csandbox_server::{SandboxServer, ServerConfig};

#[derive(Debug, Parser)]
#[command(name = "csandbox", version, about = "Compile and run untrusted C programs")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API.
    Serve {
        /// TOML configuration file.
        #[arg(long, env = "CSANDBOX_CONFIG")]
        config: Option<PathBuf>,

        /// Address to bind, overriding the config file.
        #[arg(long, env = "BIND_ADDR")]
        bind: Option<SocketAddr>,
    },

    /// Compile and run one C file.
    Run {
        /// C source file.
        file: PathBuf,

        /// File fed to the program's stdin.
        #[arg(long)]
        input: Option<PathBuf>,

        /// Which execution variant to use.
        #[arg(long, value_enum, default_value_t = Variant::Native)]
        variant: Variant,

        /// TOML configuration file.
        #[arg(long, env = "CSANDBOX_CONFIG")]
        config: Option<PathBuf>,

        /// Entry symbol (wasm variant only).
        #[arg(long)]
        entry: Option<String>,

        /// Extra compiler arguments.
        #[arg(last = true)]
        cc_args: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Variant {
    Native,
    Wasm,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Program output owns stdout in `run`; keep logs quiet there by default.
    let default_filter = match cli.command {
        Command::Serve { .. } => "info,csandbox=debug",
        Command::Run { .. } => "warn",
    };
    init_tracing(cli.json, default_filter);

    match cli.command {
        Command::Serve { config, bind } => {
            serve(config.as_deref(), bind).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            file,
            input,
            variant,
            config,
            entry,
            cc_args,
        } => {
            let config = load_config(config.as_deref())?;
            let source = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read source file '{}'", file.display()))?;
            let input = match input {
                Some(path) => tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("Failed to read input file '{}'", path.display()))?,
                None => String::new(),
            };
            let options = CompileOptions::with_args(cc_args);

            let result = match variant {
                Variant::Native => run_native(&config.sandbox, &source, &options, &input).await?,
                Variant::Wasm => {
                    let mut request = ExecutionRequest::with_input(input);
                    request.entry_point = entry;
                    run_wasm(&config.sandbox, &source, &options, &request).await?
                }
            };

            Ok(report(&result))
        }
    }
}

fn init_tracing(json: bool, default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ConfigFile> {
    match path {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config '{}'", path.display())),
        None => Ok(ConfigFile::default()),
    }
}

async fn serve(config_path: Option<&Path>, bind: Option<SocketAddr>) -> anyhow::Result<()> {
    info!("Starting csandbox");

    let config = load_config(config_path)?;
    let mut server_config =
        ServerConfig::from_file(&config.server).context("Invalid [server] configuration")?;
    if let Some(addr) = bind {
        server_config = server_config.with_bind_addr(addr);
    }

    info!(bind_addr = %server_config.bind_addr, "Configuration loaded");

    let server = SandboxServer::new(config.sandbox, server_config);

    info!("Available endpoints:");
    info!("  GET  /health    - Health check");
    info!("  GET  /ready     - Toolchain readiness");
    info!("  POST /run       - Compile and run natively");
    info!("  POST /run/wasm  - Compile and run in-process");

    server.run().await.context("Server failed")?;
    Ok(())
}

async fn run_native(
    config: &SandboxConfig,
    source: &str,
    options: &CompileOptions,
    input: &str,
) -> anyhow::Result<ExecutionResult> {
    let toolchain = NativeToolchain::load(config, &LoadOptions::default())
        .await
        .context("Native compiler unavailable")?;

    let mut session = ProcessSession::open(Arc::new(toolchain), config.execution.clone());
    let result = session.run_source(source, options, input).await;
    session.close().await;
    Ok(result)
}

async fn run_wasm(
    config: &SandboxConfig,
    source: &str,
    options: &CompileOptions,
    request: &ExecutionRequest,
) -> anyhow::Result<ExecutionResult> {
    let toolchain = csandbox_host::load_toolchain(config, &LoadOptions::default())
        .await
        .context("In-process toolchain unavailable")?;

    let mut session = WasmSession::open(Arc::new(toolchain), config.execution.clone())
        .await
        .context("Failed to open session")?;

    let result = match session.compile(source, options).await {
        Ok(()) => session.run(request).await,
        Err(e) => ExecutionResult::from_error(&e),
    };
    session.close().await;
    Ok(result)
}

/// Print captured output and pick the process exit code.
fn report(result: &ExecutionResult) -> ExitCode {
    print!("{}", result.stdout);
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
        if !result.stderr.ends_with('\n') {
            eprintln!();
        }
    }

    let code = match (result.success, result.exit_code) {
        (_, Some(code)) => code,
        (true, None) => 0,
        (false, None) => 1,
    };
    ExitCode::from(u8::try_from(code.rem_euclid(256)).unwrap_or(1))
}
