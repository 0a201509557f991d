//! Spawned-process execution variant for csandbox.
//!
//! An installed native C compiler (`gcc` by default) turns source into an
//! executable on disk, which then runs as a child process:
//! - [`NativeToolchain`]: compiler resolution and `--version` check
//! - [`ProcessSession`]: compile/run session with a single live artifact
//! - [`runner`]: child execution with stdin feeding, capped capture and a
//!   wall-clock deadline
//!
//! Every child is spawned with `kill_on_drop`, a cleared environment and the
//! session temp directory as working directory.

pub mod artifact;
pub mod runner;
pub mod session;
pub mod toolchain;

pub use artifact::{Cleanup, ProcessArtifact};
pub use runner::{ChildOutcome, ChildStatus};
pub use session::ProcessSession;
pub use toolchain::{COMPILER_ENV, NativeToolchain};
