//! Session lifecycle management.
//!
//! A session owns at most one compiled artifact. [`ArtifactSlot`] enforces
//! that: installing a new artifact releases the previous one first, and
//! releasing an empty slot is a no-op.

use async_trait::async_trait;
use tracing::debug;

/// A compiled, runnable representation of user code.
///
/// Releasing an artifact may need the resource that holds it (for example
/// the guest instance whose linear memory contains the relocated code), so
/// `release` takes that host by mutable reference.
#[async_trait]
pub trait Artifact: Send + Sized {
    /// The resource the artifact lives in.
    type Host: Send + ?Sized;

    /// Free everything the artifact holds. Must not fail; problems are
    /// logged and swallowed.
    async fn release(self, host: &mut Self::Host);
}

/// Tracks the single live artifact of a session.
#[derive(Debug)]
pub struct ArtifactSlot<A> {
    current: Option<A>,
    generation: u64,
}

impl<A> Default for ArtifactSlot<A> {
    fn default() -> Self {
        Self {
            current: None,
            generation: 0,
        }
    }
}

impl<A: Artifact> ArtifactSlot<A> {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an artifact is installed.
    pub fn is_compiled(&self) -> bool {
        self.current.is_some()
    }

    /// The installed artifact, if any.
    pub fn current(&self) -> Option<&A> {
        self.current.as_ref()
    }

    /// Number of artifacts installed over the slot's lifetime.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Release any previous artifact, then install `artifact`.
    pub async fn mark_compiled(&mut self, host: &mut A::Host, artifact: A) {
        self.release(host).await;
        self.current = Some(artifact);
        self.generation += 1;
        debug!(generation = self.generation, "Artifact installed");
    }

    /// Release the installed artifact.
    ///
    /// Returns `true` if something was released.
    pub async fn release(&mut self, host: &mut A::Host) -> bool {
        match self.current.take() {
            Some(artifact) => {
                artifact.release(host).await;
                debug!(generation = self.generation, "Artifact released");
                true
            }
            None => false,
        }
    }

    /// Remove the artifact without releasing it.
    ///
    /// Used by teardown paths that cannot await (`Drop`).
    pub fn take(&mut self) -> Option<A> {
        self.current.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Fake(u32);

    #[async_trait]
    impl Artifact for Fake {
        type Host = Vec<u32>;

        async fn release(self, host: &mut Vec<u32>) {
            host.push(self.0);
        }
    }

    #[tokio::test]
    async fn test_empty_slot() {
        let mut released = Vec::new();
        let mut slot: ArtifactSlot<Fake> = ArtifactSlot::new();

        assert!(!slot.is_compiled());
        assert!(!slot.release(&mut released).await);
        assert!(released.is_empty());
    }

    #[tokio::test]
    async fn test_second_install_replaces_first() {
        let mut released = Vec::new();
        let mut slot = ArtifactSlot::new();

        slot.mark_compiled(&mut released, Fake(1)).await;
        slot.mark_compiled(&mut released, Fake(2)).await;

        assert_eq!(released, vec![1]);
        assert_eq!(slot.current().map(|a| a.0), Some(2));
        assert_eq!(slot.generation(), 2);
    }

    #[tokio::test]
    async fn test_release_clears_flag() {
        let mut released = Vec::new();
        let mut slot = ArtifactSlot::new();

        slot.mark_compiled(&mut released, Fake(7)).await;
        assert!(slot.release(&mut released).await);
        assert!(!slot.is_compiled());
        assert!(!slot.release(&mut released).await);
        assert_eq!(released, vec![7]);
    }

    #[test]
    fn test_take_skips_release() {
        let mut released = Vec::new();
        let mut slot = ArtifactSlot::new();

        tokio_test::block_on(slot.mark_compiled(&mut released, Fake(3)));
        let taken = slot.take();

        assert_eq!(taken.map(|a| a.0), Some(3));
        assert!(released.is_empty());
        assert!(!slot.is_compiled());
    }
}
