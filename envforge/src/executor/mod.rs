//! Runs one attempt of a stage action as a child process.
//!
//! The executor knows nothing about retries or verification. It spawns the
//! command in its own process group, drains both pipes into bounded buffers,
//! and kills the whole group when the stage timeout expires or the run is
//! cancelled.

use crate::cancellation::CancellationToken;
use crate::catalog::StageDefinition;
use crate::core::{CapturedOutput, ExitStatus, StageRun, TRUNCATION_MARKER_PREFIX};
use crate::platform::Platform;
use crate::utils::now_utc;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default bytes kept per output stream.
pub const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;

/// Default time allowed for pipes to drain after the process ended.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Executes a single attempt of a stage action.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Runs the stage's action once. Never fails: spawn errors, timeouts
    /// and cancellation are all reported through [`StageRun::exit_status`].
    async fn execute(&self, stage: &StageDefinition, attempt: u32, cancel: &CancellationToken) -> StageRun;
}

/// Runs stage actions as operating system processes.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    platform: Platform,
    output_limit: usize,
    drain_grace: Duration,
}

impl ProcessExecutor {
    /// Creates an executor targeting a platform.
    #[must_use]
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    /// Sets the per-stream capture limit.
    #[must_use]
    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit = bytes;
        self
    }

    /// Sets the pipe drain grace period.
    #[must_use]
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Returns true if the stage may run on the target platform.
    #[must_use]
    pub fn supports(&self, stage: &StageDefinition) -> bool {
        stage.supports(&self.platform)
    }

    fn command(stage: &StageDefinition) -> Command {
        let action = &stage.action;
        let mut cmd = Command::new(&action.command);
        cmd.args(&action.args)
            .envs(&action.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &action.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    async fn kill_tree(&self, child: &mut Child) {
        signal_process_group(child);
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "Child already exited");
        }
        if tokio::time::timeout(self.drain_grace, child.wait()).await.is_err() {
            warn!(pid = ?child.id(), "Child did not exit after kill");
        }
    }
}

enum Ended {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl ActionExecutor for ProcessExecutor {
    async fn execute(&self, stage: &StageDefinition, attempt: u32, cancel: &CancellationToken) -> StageRun {
        let started_at = now_utc();
        let clock = Instant::now();
        let record = |exit_status: ExitStatus, stdout: CapturedOutput, stderr: CapturedOutput| StageRun {
            stage_id: stage.id.clone(),
            attempt,
            started_at,
            finished_at: now_utc(),
            duration: clock.elapsed(),
            exit_status,
            stdout,
            stderr,
        };

        if !self.supports(stage) {
            return record(
                ExitStatus::UnsupportedPlatform {
                    platform: self.platform.id(),
                },
                CapturedOutput::default(),
                CapturedOutput::default(),
            );
        }
        if cancel.is_cancelled() {
            return record(ExitStatus::Cancelled, CapturedOutput::default(), CapturedOutput::default());
        }

        let mut child = match Self::command(stage).spawn() {
            Ok(child) => child,
            Err(e) => {
                return record(
                    ExitStatus::SpawnFailed {
                        message: format!("{}: {e}", stage.action.command),
                    },
                    CapturedOutput::default(),
                    CapturedOutput::default(),
                )
            }
        };
        debug!(stage = %stage.id, attempt, pid = ?child.id(), command = %stage.action.display(), "Spawned stage action");

        let stdout_buf = Arc::new(Mutex::new(BoundedBuffer::new(self.output_limit)));
        let stderr_buf = Arc::new(Mutex::new(BoundedBuffer::new(self.output_limit)));
        let stdout_task = child.stdout.take().map(|r| tokio::spawn(drain(r, stdout_buf.clone())));
        let stderr_task = child.stderr.take().map(|r| tokio::spawn(drain(r, stderr_buf.clone())));

        let ended = tokio::select! {
            status = child.wait() => Ended::Exited(status),
            () = tokio::time::sleep(stage.timeout()) => Ended::TimedOut,
            () = cancel.cancelled() => Ended::Cancelled,
        };

        let exit_status = match ended {
            Ended::Exited(Ok(status)) => ExitStatus::Exited { code: status.code() },
            Ended::Exited(Err(e)) => {
                self.kill_tree(&mut child).await;
                ExitStatus::SpawnFailed {
                    message: format!("waiting for {} failed: {e}", stage.action.command),
                }
            }
            Ended::TimedOut => {
                warn!(stage = %stage.id, attempt, timeout_secs = stage.timeout_secs, "Stage action timed out, killing process group");
                self.kill_tree(&mut child).await;
                ExitStatus::TimedOut
            }
            Ended::Cancelled => {
                debug!(stage = %stage.id, attempt, "Run cancelled, killing process group");
                self.kill_tree(&mut child).await;
                ExitStatus::Cancelled
            }
        };

        let stdout = collect(stdout_task, &stdout_buf, self.drain_grace).await;
        let stderr = collect(stderr_task, &stderr_buf, self.drain_grace).await;
        record(exit_status, stdout, stderr)
    }
}

#[cfg(unix)]
fn signal_process_group(child: &Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            debug!(pid, error = %e, "Process group already gone");
        }
    }
}

#[cfg(not(unix))]
fn signal_process_group(_child: &Child) {}

/// Keeps the first `limit` bytes of a stream and counts the rest.
#[derive(Debug)]
struct BoundedBuffer {
    kept: Vec<u8>,
    limit: usize,
    discarded: u64,
}

impl BoundedBuffer {
    fn new(limit: usize) -> Self {
        Self {
            kept: Vec::new(),
            limit,
            discarded: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.kept.len());
        let take = room.min(chunk.len());
        self.kept.extend_from_slice(&chunk[..take]);
        self.discarded += u64::try_from(chunk.len() - take).unwrap_or(u64::MAX);
    }

    fn finish(&mut self) -> CapturedOutput {
        let mut text = String::from_utf8_lossy(&std::mem::take(&mut self.kept)).into_owned();
        if self.discarded > 0 {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&format!("{TRUNCATION_MARKER_PREFIX} {} bytes]", self.discarded));
        }
        CapturedOutput {
            text,
            truncated_bytes: self.discarded,
        }
    }
}

async fn drain<R>(mut reader: R, buf: Arc<Mutex<BoundedBuffer>>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buf.lock().push(&chunk[..n]),
            Err(e) => {
                debug!(error = %e, "Output pipe read failed");
                break;
            }
        }
    }
}

/// Waits for a drain task; a pipe held open by an orphaned grandchild is
/// abandoned after the grace period.
async fn collect(task: Option<JoinHandle<()>>, buf: &Mutex<BoundedBuffer>, grace: Duration) -> CapturedOutput {
    if let Some(mut task) = task {
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            debug!("Output pipe still open after grace period, abandoning");
            task.abort();
        }
    }
    buf.lock().finish()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::catalog::ActionSpec;

    fn sh(id: &str, script: &str) -> StageDefinition {
        StageDefinition::new(id, ActionSpec::new("sh").with_args(["-c", script]))
    }

    fn executor() -> ProcessExecutor {
        ProcessExecutor::new(Platform::new("linux", "x86_64")).with_drain_grace(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_captures_exit_code_and_output() {
        let run = executor()
            .execute(&sh("a", "echo out; echo err >&2; exit 6"), 2, &CancellationToken::new())
            .await;

        assert_eq!(run.stage_id, "a");
        assert_eq!(run.attempt, 2);
        assert_eq!(run.exit_status, ExitStatus::code(6));
        assert_eq!(run.stdout.text, "out\n");
        assert_eq!(run.stderr.last_line(), Some("err"));
        assert!(run.finished_at >= run.started_at);
    }

    #[tokio::test]
    async fn test_env_overlay_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut stage = sh("a", "echo \"$RELEASE\"; pwd");
        stage.action = stage.action.with_env("RELEASE", "3.4.0");
        stage.action.working_dir = Some(dir.path().to_path_buf());

        let run = executor().execute(&stage, 1, &CancellationToken::new()).await;
        let mut lines = run.stdout.text.lines();
        assert_eq!(lines.next(), Some("3.4.0"));
        let pwd = std::path::PathBuf::from(lines.next().unwrap());
        assert_eq!(pwd.canonicalize().unwrap(), dir.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn test_output_is_bounded() {
        let run = executor()
            .with_output_limit(10)
            .execute(&sh("a", "printf 'abcdefghijklmnopqrstuvwxyz'"), 1, &CancellationToken::new())
            .await;

        assert_eq!(run.stdout.truncated_bytes, 16);
        assert!(run.stdout.text.starts_with("abcdefghij\n"));
        assert!(run.stdout.text.ends_with("[... truncated 16 bytes]"));
        assert_eq!(run.stdout.last_line(), Some("abcdefghij"));
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let stage = sh("slow", "sleep 30 & sleep 30").with_timeout_secs(1);
        let started = Instant::now();
        let run = executor().execute(&stage, 1, &CancellationToken::new()).await;

        assert_eq!(run.exit_status, ExitStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancellation_kills_action() {
        let cancel = Arc::new(CancellationToken::new());
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel("operator interrupt");
        });

        let started = Instant::now();
        let run = executor().execute(&sh("slow", "sleep 30"), 1, &cancel).await;
        assert_eq!(run.exit_status, ExitStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let stage = StageDefinition::new("ghost", ActionSpec::new("envforge-no-such-program"));
        let run = executor().execute(&stage, 1, &CancellationToken::new()).await;
        assert!(matches!(run.exit_status, ExitStatus::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_unsupported_platform_not_spawned() {
        let stage = sh("mac-only", "exit 0").with_platforms(["darwin-aarch64"]);
        let run = executor().execute(&stage, 1, &CancellationToken::new()).await;
        assert_eq!(
            run.exit_status,
            ExitStatus::UnsupportedPlatform {
                platform: "linux-x86_64".to_string()
            }
        );

        let aliased = sh("amd64", "exit 0").with_platforms(["linux-amd64"]);
        let run = executor().execute(&aliased, 1, &CancellationToken::new()).await;
        assert_eq!(run.exit_status, ExitStatus::code(0));
    }
}
