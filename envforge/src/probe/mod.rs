//! Post-condition checks that confirm a stage's effect is really present.
//!
//! A zero exit code is not trusted on its own: installers routinely exit 0
//! after a partial download. The probe declared by the stage gets the last
//! word, and the same probe is replayed on `--resume` to decide whether a
//! recorded success still holds.

use crate::catalog::{ProbeSpec, StageDefinition};
use crate::utils::sha256_file;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Default time a command probe may take.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Stdout a command probe keeps for its `expect` match; the rest is drained
/// and dropped.
pub const DEFAULT_PROBE_OUTPUT_LIMIT: usize = 16 * 1024;

/// Result of a verification probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// The effect is present.
    Confirmed,
    /// The effect could not be confirmed, with the reason.
    Unconfirmed(String),
}

impl ProbeVerdict {
    /// Returns true for [`ProbeVerdict::Confirmed`].
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed)
    }
}

/// Checks a stage's post-condition.
#[async_trait]
pub trait VerificationProbe: Send + Sync {
    /// Verifies that the stage's effect is present. Never fails: any error
    /// while probing is reported as [`ProbeVerdict::Unconfirmed`].
    async fn verify(&self, stage: &StageDefinition) -> ProbeVerdict;
}

/// Evaluates the probe kinds a catalog can declare.
#[derive(Debug, Clone)]
pub struct BuiltinProbe {
    timeout: Duration,
    output_limit: usize,
}

impl Default for BuiltinProbe {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROBE_TIMEOUT,
            output_limit: DEFAULT_PROBE_OUTPUT_LIMIT,
        }
    }
}

impl BuiltinProbe {
    /// Creates a probe with the default command timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the command probe timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets how much stdout a command probe keeps.
    #[must_use]
    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    async fn run_command(&self, program: &str, args: &[String], expect: Option<&str>) -> ProbeVerdict {
        let spawned = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => return ProbeVerdict::Unconfirmed(format!("'{program}' could not be started: {e}")),
        };

        let stdout = child.stdout.take();
        let limit = self.output_limit;
        // dropping the child on timeout kills it
        let finished = async move {
            let kept = match stdout {
                Some(out) => read_bounded(out, limit).await?,
                None => Vec::new(),
            };
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, kept))
        };

        let (status, stdout) = match tokio::time::timeout(self.timeout, finished).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ProbeVerdict::Unconfirmed(format!("'{program}' failed: {e}")),
            Err(_) => {
                return ProbeVerdict::Unconfirmed(format!(
                    "'{program}' did not finish within {}s",
                    self.timeout.as_secs()
                ))
            }
        };

        if !status.success() {
            return ProbeVerdict::Unconfirmed(format!("'{program}' {status}"));
        }
        if let Some(needle) = expect {
            let stdout = String::from_utf8_lossy(&stdout);
            if !stdout.contains(needle) {
                return ProbeVerdict::Unconfirmed(format!(
                    "'{program}' output does not contain '{needle}'"
                ));
            }
        }
        ProbeVerdict::Confirmed
    }
}

/// Reads to end of stream, keeping at most `limit` bytes.
async fn read_bounded(mut reader: impl AsyncRead + Unpin, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(kept);
        }
        let room = limit.saturating_sub(kept.len());
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }
}

#[async_trait]
impl VerificationProbe for BuiltinProbe {
    async fn verify(&self, stage: &StageDefinition) -> ProbeVerdict {
        let verdict = match &stage.probe {
            ProbeSpec::None => ProbeVerdict::Confirmed,
            ProbeSpec::Command { program, args, expect } => {
                self.run_command(program, args, expect.as_deref()).await
            }
            ProbeSpec::PathExists { path } => match tokio::fs::try_exists(path).await {
                Ok(true) => ProbeVerdict::Confirmed,
                Ok(false) => ProbeVerdict::Unconfirmed(format!("{} does not exist", path.display())),
                Err(e) => ProbeVerdict::Unconfirmed(format!("cannot stat {}: {e}", path.display())),
            },
            ProbeSpec::FileSha256 { path, sha256 } => {
                let target = path.clone();
                match tokio::task::spawn_blocking(move || sha256_file(&target)).await {
                    Ok(Ok(actual)) if actual.eq_ignore_ascii_case(sha256) => ProbeVerdict::Confirmed,
                    Ok(Ok(actual)) => ProbeVerdict::Unconfirmed(format!(
                        "{} has sha256 {actual}, expected {sha256}",
                        path.display()
                    )),
                    Ok(Err(e)) => ProbeVerdict::Unconfirmed(format!("cannot read {}: {e}", path.display())),
                    Err(e) => ProbeVerdict::Unconfirmed(format!("hashing {} aborted: {e}", path.display())),
                }
            }
        };

        tracing::debug!(
            stage = %stage.id,
            confirmed = verdict.is_confirmed(),
            "Probe evaluated"
        );
        verdict
    }
}
