//! In-process execution variant for csandbox.
//!
//! A C compiler + runtime packaged as a WebAssembly module (the toolchain
//! image) runs inside an embedded Wasmtime engine:
//! - [`WasmEngine`]: Configured Wasmtime engine and epoch ticker
//! - [`ToolchainImage`]: Compiled toolchain image
//! - [`SessionContext`]: Per-session guest state
//! - [`InstanceRunner`]: Linker and image instantiation
//! - [`WasmSession`]: Compile/run session with a single live artifact
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Toolchain                          │
//! │  (Loaded once, shared by all sessions)                  │
//! │  - WasmEngine + epoch ticker                            │
//! │  - ToolchainImage (compiled image)                      │
//! │  - InstanceRunner (linker with host imports)            │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │       WasmSession: Store<SessionContext> + Instance     │
//! │  (Per user, isolated)                                   │
//! │  - Fixed working memory                                 │
//! │  - Fuel and epoch deadlines                             │
//! │  - stdout/stderr line buffers, diagnostics, stdin       │
//! │  - At most one compiled artifact                        │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod engine;
pub mod instance;
pub mod module;
pub mod session;
pub mod store;
pub mod toolchain;

pub use engine::{EpochTicker, WasmEngine};
pub use instance::{GuestFault, InstanceRunner, ToolchainInstance};
pub use module::ToolchainImage;
pub use session::{WasmArtifact, WasmSession};
pub use store::{ExecutionMetrics, SessionContext};
pub use toolchain::Toolchain;
