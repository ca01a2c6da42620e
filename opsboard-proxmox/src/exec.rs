//! Remote command execution inside guests.
//!
//! Submits a command through the guest agent and polls the exec-status
//! endpoint until the process exits or a local deadline passes. The
//! deadline is soft: the remote process is never cancelled, the caller
//! just gets the 124 sentinel with empty output.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::Result;
use crate::traits::ClusterApi;
use crate::types::{ExecStatus, VmIdentity};

/// Exit code reported when the deadline passed before the guest process
/// exited. The real outcome of the process is unknown.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Timeout applied when the caller does not specify one.
const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between exec-status polls.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(400);

/// Outcome of a remote command.
///
/// stdout/stderr are returned atomically by the API on completion; no
/// incremental streaming exists at this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Guest-side process id.
    pub pid: u32,
    /// Exit code, or [`TIMEOUT_EXIT_CODE`] on deadline expiry.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutcome {
    pub fn timed_out(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE
    }

    fn from_status(pid: u32, status: ExecStatus) -> Self {
        Self {
            pid,
            // A missing exit code on an exited process is treated as failure.
            exit_code: status.exitcode.unwrap_or(1),
            stdout: status.out_data.unwrap_or_default(),
            stderr: status.err_data.unwrap_or_default(),
        }
    }

    fn deadline(pid: u32) -> Self {
        Self {
            pid,
            exit_code: TIMEOUT_EXIT_CODE,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Submit-and-poll helper on top of [`ClusterApi`].
pub struct RemoteExecutor {
    api: Arc<dyn ClusterApi>,
    poll_interval: Duration,
}

impl RemoteExecutor {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self {
            api,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the poll interval. Mainly for tests.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run `program args...` inside the guest, optionally feeding stdin,
    /// and wait for completion up to `timeout` (default 10s).
    ///
    /// Submission failures propagate as errors. Once submitted, the call
    /// always produces an [`ExecOutcome`]: the real exit code if the
    /// process finished in time, otherwise the 124 sentinel.
    pub async fn execute(
        &self,
        identity: &VmIdentity,
        program: &str,
        args: &[String],
        input: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecOutcome> {
        let timeout = timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT);

        let mut command = Vec::with_capacity(args.len() + 1);
        command.push(program.to_string());
        command.extend_from_slice(args);

        let pid = self
            .api
            .guest_exec(&identity.node, identity.vmid, &command, input)
            .await?;
        debug!(vm = %identity, pid, program, "guest command submitted");

        let deadline = Instant::now() + timeout;
        loop {
            match self
                .api
                .guest_exec_status(&identity.node, identity.vmid, pid)
                .await
            {
                Ok(status) if status.exited => {
                    let outcome = ExecOutcome::from_status(pid, status);
                    debug!(vm = %identity, pid, exit_code = outcome.exit_code, "guest command exited");
                    return Ok(outcome);
                }
                Ok(_) => {}
                Err(err) => {
                    // Polling failures degrade: wait out the deadline,
                    // take one best-effort final look, then give up.
                    warn!(vm = %identity, pid, error = %err, "exec-status poll failed");
                    let now = Instant::now();
                    if now < deadline {
                        tokio::time::sleep(deadline - now).await;
                    }
                    if let Ok(status) = self
                        .api
                        .guest_exec_status(&identity.node, identity.vmid, pid)
                        .await
                    {
                        if status.exited {
                            return Ok(ExecOutcome::from_status(pid, status));
                        }
                    }
                    return Ok(ExecOutcome::deadline(pid));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(vm = %identity, pid, "exec deadline exceeded, leaving process running");
                return Ok(ExecOutcome::deadline(pid));
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}
