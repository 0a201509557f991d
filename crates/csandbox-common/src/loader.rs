//! Once-only toolchain readiness.
//!
//! Loading a toolchain is expensive (compiling a large Wasm image, or probing
//! a native compiler). [`ToolchainCell`] makes sure every caller waiting for a
//! toolchain observes the same single initialization.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::SandboxError;

/// Lazily-initialized, shared toolchain handle.
///
/// Concurrent callers of [`get_or_load`](Self::get_or_load) wait on the same
/// in-flight load. A failed load is not cached; the next caller retries.
pub struct ToolchainCell<T> {
    cell: OnceCell<Arc<T>>,
}

impl<T> Default for ToolchainCell<T> {
    fn default() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }
}

impl<T> ToolchainCell<T> {
    /// Create an empty cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cell that is already ready.
    pub fn ready(toolchain: T) -> Self {
        Self {
            cell: OnceCell::new_with(Some(Arc::new(toolchain))),
        }
    }

    /// Return the toolchain, loading it with `load` if no load has succeeded
    /// yet.
    pub async fn get_or_load<F, Fut>(&self, load: F) -> Result<Arc<T>, SandboxError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SandboxError>>,
    {
        let toolchain = self
            .cell
            .get_or_try_init(move || async move {
                let loaded = load().await;
                match &loaded {
                    Ok(_) => info!("Toolchain ready"),
                    Err(e) => warn!(error = %e, "Toolchain load failed"),
                }
                loaded.map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(toolchain))
    }

    /// The toolchain, if a load has completed.
    pub fn get(&self) -> Option<Arc<T>> {
        self.cell.get().cloned()
    }

    /// Whether a load has completed.
    pub fn is_ready(&self) -> bool {
        self.cell.initialized()
    }
}

impl<T> std::fmt::Debug for ToolchainCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolchainCell")
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_load() {
        let cell = Arc::new(ToolchainCell::<u32>::new());
        let loads = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cell = Arc::clone(&cell);
            let loads = Arc::clone(&loads);
            handles.push(tokio::spawn(async move {
                cell.get_or_load(|| async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    Ok(42)
                })
                .await
                .map(|v| *v)
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(cell.is_ready());
    }

    #[tokio::test]
    async fn test_failed_load_is_retried() {
        let cell = ToolchainCell::<u32>::new();

        let first = cell
            .get_or_load(|| async { Err(SandboxError::toolchain_unavailable("offline")) })
            .await;
        assert!(matches!(
            first,
            Err(SandboxError::ToolchainUnavailable { .. })
        ));
        assert!(!cell.is_ready());

        let second = cell.get_or_load(|| async { Ok(7) }).await.unwrap();
        assert_eq!(*second, 7);
        assert_eq!(cell.get().map(|v| *v), Some(7));
    }

    #[test]
    fn test_ready_cell() {
        let cell = ToolchainCell::ready("gcc");
        assert!(cell.is_ready());
        assert_eq!(cell.get().map(|v| *v), Some("gcc"));
    }
}
