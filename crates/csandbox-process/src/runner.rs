//! Child-process execution under a wall-clock deadline.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tracing::{debug, warn};

use csandbox_common::{BlockBuffer, SandboxError};

/// How long output readers may linger after the child is gone.
const READ_GRACE: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 8192;

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    /// Exited normally with a status code.
    Exited(i32),

    /// Killed by a signal.
    Signaled(i32),

    /// Killed by us at the deadline.
    TimedOut,
}

impl ChildStatus {
    fn from_exit(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signaled(signal);
            }
        }

        Self::Signaled(0)
    }

    /// Shell-style exit code: the status code, or 128 + signal.
    pub fn exit_code(self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(code),
            Self::Signaled(signal) => Some(128 + signal),
            Self::TimedOut => None,
        }
    }
}

/// Captured output and final status of a child.
#[derive(Debug)]
pub struct ChildOutcome {
    pub stdout: BlockBuffer,
    pub stderr: BlockBuffer,
    pub status: ChildStatus,
}

/// Run `binary` in `cwd` with a cleared environment.
///
/// `input` is written to stdin, which is then closed. Stdout and stderr are
/// drained concurrently, each capped at `cap` bytes. When `timeout` expires
/// the child is killed and reaped; output captured so far is kept.
///
/// On unix the child leads its own process group. Once the child has exited
/// or the deadline has passed, the whole group is killed, so nothing it
/// forked outlives the run.
///
/// # Errors
///
/// Returns an error only if the child cannot be spawned or waited on.
pub async fn run_child(
    binary: &Path,
    cwd: &Path,
    input: &[u8],
    timeout: Duration,
    cap: usize,
) -> Result<ChildOutcome, SandboxError> {
    let mut command = Command::new(binary);
    command
        .env_clear()
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    confine(&mut command, timeout);

    let mut child = command.spawn()?;
    let pid = child.id();

    debug!(pid, binary = %binary.display(), "Child spawned");

    let feeder = child
        .stdin
        .take()
        .map(|stdin| tokio::spawn(feed(stdin, input.to_vec())));
    let stdout = child
        .stdout
        .take()
        .map(|out| tokio::spawn(read_capped(out, cap)));
    let stderr = child
        .stderr
        .take()
        .map(|err| tokio::spawn(read_capped(err, cap)));

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            kill_group(pid);
            ChildStatus::from_exit(status?)
        }
        Err(_) => {
            warn!(
                pid,
                timeout_ms = timeout.as_millis(),
                "Deadline exceeded, killing child"
            );
            kill_group(pid);
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "Kill failed; child already gone");
            }
            child.wait().await?;
            ChildStatus::TimedOut
        }
    };

    if let Some(feeder) = feeder {
        feeder.abort();
    }

    Ok(ChildOutcome {
        stdout: collect(stdout, cap).await,
        stderr: collect(stderr, cap).await,
        status,
    })
}

/// Put the child in its own process group and bound what it may consume.
#[cfg(unix)]
#[allow(unsafe_code)]
fn confine(command: &mut Command, timeout: Duration) {
    let cpu_secs = timeout.as_secs().saturating_add(2);
    command.process_group(0);
    // SAFETY: the hook only calls setrlimit, which is async-signal-safe
    unsafe {
        command.pre_exec(move || apply_rlimits(cpu_secs));
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn apply_rlimits(cpu_secs: u64) -> std::io::Result<()> {
    let limits: [(_, libc::rlim_t); 2] = [(libc::RLIMIT_CORE, 0), (libc::RLIMIT_CPU, cpu_secs)];
    for (resource, value) in limits {
        let limit = libc::rlimit {
            rlim_cur: value,
            rlim_max: value,
        };
        // SAFETY: `limit` is a valid rlimit for the duration of the call
        if unsafe { libc::setrlimit(resource, &limit) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// SIGKILL every process in the group led by `pid`.
#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: kill has no memory-safety preconditions
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!(pgid, error = %err, "Process group kill failed");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

async fn feed(mut stdin: ChildStdin, input: Vec<u8>) {
    // A child that exits without reading its input closes the pipe early.
    if let Err(e) = stdin.write_all(&input).await {
        debug!(error = %e, "Stdin write ended early");
    }
    let _ = stdin.shutdown().await;
}

/// Read `reader` to the end, keeping at most `cap` bytes.
///
/// Keeps draining past the cap so the writer never blocks on a full pipe.
pub async fn read_capped<R>(mut reader: R, cap: usize) -> BlockBuffer
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BlockBuffer::with_cap(cap);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buffer.extend(&chunk[..n]),
            Err(e) => {
                debug!(error = %e, "Output read failed");
                break;
            }
        }
    }

    buffer
}

async fn collect(task: Option<tokio::task::JoinHandle<BlockBuffer>>, cap: usize) -> BlockBuffer {
    let Some(mut task) = task else {
        return BlockBuffer::with_cap(cap);
    };

    match tokio::time::timeout(READ_GRACE, &mut task).await {
        Ok(Ok(buffer)) => buffer,
        Ok(Err(e)) => {
            debug!(error = %e, "Output reader failed");
            BlockBuffer::with_cap(cap)
        }
        Err(_) => {
            task.abort();
            warn!("Output pipe held open after exit; output dropped");
            BlockBuffer::with_cap(cap)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_capped_drains_past_cap() {
        let data = vec![b'x'; 20_000];
        let buffer = read_capped(&data[..], 10).await;

        assert_eq!(buffer.len(), 10);
        assert!(buffer.is_truncated());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ChildStatus::Exited(3).exit_code(), Some(3));
        assert_eq!(ChildStatus::Signaled(9).exit_code(), Some(137));
        assert_eq!(ChildStatus::TimedOut.exit_code(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cat_echoes_input() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_child(
            Path::new("/bin/cat"),
            dir.path(),
            b"one\ntwo",
            Duration::from_secs(5),
            1024,
        )
        .await
        .unwrap();

        assert_eq!(outcome.status, ChildStatus::Exited(0));
        assert_eq!(outcome.stdout.into_string(), "one\ntwo");
        assert!(outcome.stderr.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_busy_loop_is_killed_at_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let start = std::time::Instant::now();

        let outcome = run_child(
            Path::new("/bin/sh"),
            dir.path(),
            b"while :; do :; done\n",
            Duration::from_millis(200),
            1024,
        )
        .await
        .unwrap();

        assert_eq!(outcome.status, ChildStatus::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    /// Whether `pid` names a live, non-zombie process.
    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            return false;
        };
        let state = stat.rsplit(')').next().and_then(|rest| rest.trim().chars().next());
        state != Some('Z')
    }

    #[cfg(target_os = "linux")]
    async fn assert_gone(pid: u32) {
        for _ in 0..40 {
            if !is_running(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("process {pid} outlived the run");
    }

    #[cfg(target_os = "linux")]
    async fn background_pid(script: &[u8], timeout: Duration) -> (ChildStatus, u32) {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_child(Path::new("/bin/sh"), dir.path(), script, timeout, 1024)
            .await
            .unwrap();

        let stdout = outcome.stdout.into_string();
        (outcome.status, stdout.trim().parse().unwrap())
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_deadline_kills_background_children() {
        let (status, pid) = background_pid(
            b"sleep 30 &\necho $!\nwhile :; do :; done\n",
            Duration::from_millis(300),
        )
        .await;

        assert_eq!(status, ChildStatus::TimedOut);
        assert_gone(pid).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_exit_kills_background_children() {
        let start = std::time::Instant::now();
        let (status, pid) =
            background_pid(b"sleep 30 &\necho $!\nexit 0\n", Duration::from_secs(5)).await;

        assert_eq!(status, ChildStatus::Exited(0));
        assert_gone(pid).await;
        // The orphan held the pipes open; killing it ends the read promptly.
        assert!(start.elapsed() < Duration::from_secs(3));
    }
}
