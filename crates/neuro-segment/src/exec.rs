//! Launch and supervise one tool process: register it, wait with a deadline,
//! and stop the whole group on timeout or cancellation.

use crate::error::{RungError, RuntimeUnavailable};
use crate::runtime::RunRequest;
use neuro_process::{terminate_group, ProcessRecord, ProcessRegistry};
use neuro_types::JobId;
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TAIL_LINES: usize = 20;
const REAP_WAIT: Duration = Duration::from_secs(5);
/// How long output is still read after the process exits. A grandchild that
/// inherited the pipes can keep them open indefinitely.
const DRAIN_WAIT: Duration = Duration::from_secs(2);

pub(crate) struct Finished {
    pub status: ExitStatus,
    pub stderr_tail: String,
}

/// How a supervised run was stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stopped {
    TimedOut,
    Cancelled,
}

pub(crate) struct Launched {
    child: Child,
    pid: Option<u32>,
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
}

fn drain<R>(reader: R, job_id: JobId, stream: &'static str) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut tail = VecDeque::with_capacity(TAIL_LINES);
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(job_id = %job_id, stream, "{}", line);
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        Vec::from(tail).join("\n")
    })
}

/// Output collected so far, or empty if the stream is still open after `DRAIN_WAIT`.
async fn collect(handle: Option<JoinHandle<String>>, job_id: &JobId, stream: &'static str) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(DRAIN_WAIT, &mut handle).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            tracing::warn!(job_id = %job_id, stream, "output still open after exit, abandoning it");
            handle.abort();
            String::new()
        }
    }
}

/// Spawn `cmd` and record it with the registry before anyone waits on it.
pub(crate) async fn launch(
    runtime: &str,
    mut cmd: Command,
    registry: &ProcessRegistry,
    job_id: JobId,
    container: Option<String>,
) -> Result<Launched, RungError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            RungError::Unavailable(RuntimeUnavailable::NotInstalled {
                runtime: runtime.to_string(),
            })
        } else {
            RungError::Io {
                runtime: runtime.to_string(),
                source: e,
            }
        }
    })?;

    let pid = child.id();
    if let Some(pid) = pid {
        let mut record = ProcessRecord::new(job_id, pid, runtime);
        if cfg!(unix) {
            record = record.with_group(pid as i32);
        }
        if let Some(name) = container {
            record = record.with_container(name);
        }
        if let Err(e) = registry.register(record).await {
            tracing::warn!(job_id = %job_id, pid, error = %e, "failed to persist process record");
        }
        tracing::info!(job_id = %job_id, pid, runtime, "segmentation process started");
    }

    let stdout = child.stdout.take().map(|r| drain(r, job_id, "stdout"));
    let stderr = child.stderr.take().map(|r| drain(r, job_id, "stderr"));
    Ok(Launched {
        child,
        pid,
        stdout,
        stderr,
    })
}

/// Wait for the launched process. On timeout or cancellation the process group
/// gets SIGTERM, then SIGKILL after `req.kill_grace`.
pub(crate) async fn supervise(
    runtime: &str,
    launched: Launched,
    req: &RunRequest,
    cancel: &CancellationToken,
) -> Result<Result<Finished, Stopped>, RungError> {
    let Launched {
        mut child,
        pid,
        stdout,
        stderr,
    } = launched;

    let deadline = tokio::time::sleep(req.timeout);
    tokio::pin!(deadline);
    let stopped = tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|e| RungError::Io { runtime: runtime.to_string(), source: e })?;
            let (_, stderr_tail) = tokio::join!(
                collect(stdout, &req.job_id, "stdout"),
                collect(stderr, &req.job_id, "stderr"),
            );
            return Ok(Ok(Finished { status, stderr_tail }));
        }
        _ = &mut deadline => Stopped::TimedOut,
        _ = cancel.cancelled() => Stopped::Cancelled,
    };

    tracing::warn!(job_id = %req.job_id, pid = ?pid, runtime, reason = ?stopped, "stopping segmentation process group");
    if let Some(pid) = pid {
        match terminate_group(pid as i32, req.kill_grace).await {
            Ok(outcome) => tracing::info!(job_id = %req.job_id, pid, ?outcome, "process group stopped"),
            Err(e) => tracing::warn!(job_id = %req.job_id, pid, error = %e, "failed to stop process group"),
        }
    }
    if tokio::time::timeout(REAP_WAIT, child.wait()).await.is_err() {
        let _ = child.start_kill();
    }
    for handle in [stdout, stderr].into_iter().flatten() {
        handle.abort();
    }
    Ok(Err(stopped))
}
