//! HTTP server for csandbox.
//!
//! Exposes both execution variants over HTTP:
//!
//! - `POST /run` compiles and runs with the native compiler
//! - `POST /run/wasm` compiles and runs in the in-process toolchain
//! - `GET /health` and `GET /ready` for liveness and readiness checks
//!
//! # Quick Start
//!
//! ```ignore
//! use csandbox_common::SandboxConfig;
//! use csandbox_server::{SandboxServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = SandboxServer::new(SandboxConfig::default(), ServerConfig::default());
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod handler;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod state;

pub use server::{SandboxServer, ServerConfig, TestHandle};
pub use state::AppState;
