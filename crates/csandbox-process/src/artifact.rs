//! On-disk artifacts and their cleanup.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;

use csandbox_common::Artifact;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Unique file stem `code_<millis>_<seq>`.
///
/// The sequence number is process-wide, so sessions created within the
/// same millisecond never collide.
pub fn next_stem() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis());
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("code_{millis}_{seq}")
}

/// A compiled program: its source file and executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessArtifact {
    source: PathBuf,
    binary: PathBuf,
}

impl ProcessArtifact {
    /// Paths for a new artifact named `stem` in `dir`.
    pub fn new(dir: &Path, stem: &str) -> Self {
        Self {
            source: dir.join(format!("{stem}.c")),
            binary: dir.join(stem),
        }
    }

    /// The C source file.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// The executable.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Remove both files now, ignoring failures.
    pub fn remove_now(&self) {
        for path in [&self.source, &self.binary] {
            if let Err(e) = std::fs::remove_file(path) {
                debug!(path = %path.display(), error = %e, "Cleanup skipped");
            }
        }
    }
}

/// Removes released artifacts after a delay.
///
/// Removals still waiting on their delay are tracked, so [`flush`](Self::flush)
/// can carry them out at once when the owner goes away.
#[derive(Debug, Default)]
pub struct Cleanup {
    delay: Duration,
    pending: Vec<(ProcessArtifact, JoinHandle<()>)>,
}

impl Cleanup {
    /// Remove released artifacts `delay` after release.
    pub fn after(delay: Duration) -> Self {
        Self {
            delay,
            pending: Vec::new(),
        }
    }

    /// The configured delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Number of removals still waiting on their delay.
    pub fn pending(&self) -> usize {
        self.pending
            .iter()
            .filter(|(_, task)| !task.is_finished())
            .count()
    }

    /// Cancel every delayed removal and remove those files now.
    pub fn flush(&mut self) {
        for (artifact, task) in self.pending.drain(..) {
            task.abort();
            artifact.remove_now();
        }
    }

    fn schedule(&mut self, artifact: ProcessArtifact) {
        self.pending.retain(|(_, task)| !task.is_finished());

        let delay = self.delay;
        let target = artifact.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for path in [&target.source, &target.binary] {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    debug!(path = %path.display(), error = %e, "Cleanup skipped");
                }
            }
        });
        self.pending.push((artifact, task));
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        self.flush();
    }
}

#[async_trait]
impl Artifact for ProcessArtifact {
    type Host = Cleanup;

    async fn release(self, host: &mut Cleanup) {
        if host.delay.is_zero() {
            self.remove_now();
        } else {
            host.schedule(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stems_are_unique() {
        let a = next_stem();
        let b = next_stem();

        assert!(a.starts_with("code_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_artifact_paths() {
        let artifact = ProcessArtifact::new(Path::new("/tmp/csandbox"), "code_1_0");

        assert_eq!(artifact.source(), Path::new("/tmp/csandbox/code_1_0.c"));
        assert_eq!(artifact.binary(), Path::new("/tmp/csandbox/code_1_0"));
    }

    #[tokio::test]
    async fn test_immediate_release_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = ProcessArtifact::new(dir.path(), "code_1_0");
        std::fs::write(artifact.source(), "int main(void){return 0;}").unwrap();

        artifact.clone().release(&mut Cleanup::after(Duration::ZERO)).await;

        // The binary never existed; its removal failure is swallowed.
        assert!(!artifact.source().exists());
    }

    #[tokio::test]
    async fn test_delayed_release() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = ProcessArtifact::new(dir.path(), "code_2_0");
        std::fs::write(artifact.source(), "").unwrap();
        std::fs::write(artifact.binary(), "").unwrap();

        artifact
            .clone()
            .release(&mut Cleanup::after(Duration::from_millis(20)))
            .await;
        assert!(artifact.source().exists());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!artifact.source().exists());
        assert!(!artifact.binary().exists());
    }

    #[tokio::test]
    async fn test_flush_removes_delayed_files_now() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = ProcessArtifact::new(dir.path(), "code_3_0");
        std::fs::write(artifact.source(), "").unwrap();
        std::fs::write(artifact.binary(), "").unwrap();

        let mut cleanup = Cleanup::after(Duration::from_secs(3600));
        artifact.clone().release(&mut cleanup).await;
        assert_eq!(cleanup.pending(), 1);
        assert!(artifact.source().exists());

        cleanup.flush();

        assert_eq!(cleanup.pending(), 0);
        assert!(!artifact.source().exists());
        assert!(!artifact.binary().exists());
    }

    #[test]
    fn test_runtime_exit_leaves_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = ProcessArtifact::new(dir.path(), "code_4_0");
        std::fs::write(artifact.source(), "").unwrap();
        std::fs::write(artifact.binary(), "").unwrap();

        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let mut cleanup = Cleanup::after(Duration::from_secs(1));
            artifact.clone().release(&mut cleanup).await;
            // Dropping the cleanup carries out what was still scheduled.
        });
        drop(runtime);

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
