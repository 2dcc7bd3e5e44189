//! Worker dispatch for primality checks.
//!
//! Every cache miss gets a fresh child process:
//! - the service writes one task line `{"n":<n>}` to the child's stdin
//! - the child writes one reply line `{"result":<bool>}` to its stdout
//! - the child is killed if still running, then reaped; it is never reused
//!
//! A child that exits, errors, or closes stdout without a reply fails the
//! request. There is no timeout unless one is configured, so a hung child
//! holds its request open indefinitely. The number of concurrent children is
//! unbounded unless `max_workers` is set.

use crate::protocol::Answer;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

/// Flag that switches the binary into worker mode
pub const WORKER_FLAG: &str = "--worker";

/// Message sent to a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerTask {
    pub n: u64,
}

/// Message sent back by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReply {
    pub result: bool,
}

/// Computes answers off the event loop
pub trait Dispatcher: Send + Sync + 'static {
    fn compute(&self, n: u64) -> impl Future<Output = Result<Answer, WorkerError>> + Send;
}

/// Worker failures
#[derive(Debug)]
pub enum WorkerError {
    /// Worker process could not be started
    Spawn(std::io::Error),
    /// Pipe I/O with the worker failed
    Io(std::io::Error),
    /// Worker closed its output without replying
    NoReply(Option<ExitStatus>),
    /// Worker message was not valid JSON for the expected shape
    Malformed(serde_json::Error),
    /// Worker did not reply within the configured timeout
    TimedOut(Duration),
    /// Worker side: stdin closed before a task arrived
    NoTask,
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Spawn(e) => write!(f, "Failed to spawn worker: {}", e),
            WorkerError::Io(e) => write!(f, "Worker I/O error: {}", e),
            WorkerError::NoReply(Some(status)) => {
                write!(f, "Worker exited without a reply ({})", status)
            }
            WorkerError::NoReply(None) => write!(f, "Worker exited without a reply"),
            WorkerError::Malformed(e) => write!(f, "Malformed worker message: {}", e),
            WorkerError::TimedOut(after) => write!(f, "Worker timed out after {:?}", after),
            WorkerError::NoTask => write!(f, "No task received"),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<std::io::Error> for WorkerError {
    fn from(e: std::io::Error) -> Self {
        WorkerError::Io(e)
    }
}

/// Spawns one child process per computation
#[derive(Debug, Clone)]
pub struct ProcessDispatcher {
    program: PathBuf,
    args: Vec<String>,
    slots: Option<Arc<Semaphore>>,
    timeout: Option<Duration>,
}

impl ProcessDispatcher {
    /// Dispatcher running `program args...` for every task
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        ProcessDispatcher {
            program: program.into(),
            args,
            slots: None,
            timeout: None,
        }
    }

    /// Dispatcher that re-executes the running binary in worker mode
    pub fn current_exe() -> std::io::Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, vec![WORKER_FLAG.to_string()]))
    }

    /// Cap concurrent workers; `0` leaves them unbounded.
    ///
    /// When every slot is taken, further requests wait for one to free up.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.slots = (max_workers > 0).then(|| Arc::new(Semaphore::new(max_workers)));
        self
    }

    /// Give up on a worker after `timeout`; `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Free worker slots, or `None` when unbounded
    pub fn available_slots(&self) -> Option<usize> {
        self.slots.as_ref().map(|slots| slots.available_permits())
    }

    async fn run_task(&self, n: u64) -> Result<bool, WorkerError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::Spawn)?;

        trace!(n, pid = ?child.id(), "Worker spawned");

        let mut message = serde_json::to_vec(&WorkerTask { n }).map_err(WorkerError::Malformed)?;
        message.push(b'\n');

        // Dropping stdin after the write closes it, so the worker sees EOF
        // after its single task.
        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| WorkerError::Io(std::io::ErrorKind::BrokenPipe.into()))?;
            stdin.write_all(&message).await?;
            stdin.flush().await?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Io(std::io::ErrorKind::BrokenPipe.into()))?;
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();

        if reader.read_line(&mut line).await? == 0 {
            let status = child.wait().await.ok();
            return Err(WorkerError::NoReply(status));
        }

        let reply: WorkerReply =
            serde_json::from_str(line.trim_end()).map_err(WorkerError::Malformed)?;

        // The worker is finished once it has replied. Kill it if it is still
        // running and reap it off the request path.
        if let Ok(None) = child.try_wait() {
            if let Err(e) = child.start_kill() {
                warn!(n, error = %e, "Failed to kill worker after reply");
            }
        }
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => trace!(n, %status, "Worker reaped"),
                Err(e) => warn!(n, error = %e, "Failed to reap worker"),
            }
        });

        Ok(reply.result)
    }
}

impl Dispatcher for ProcessDispatcher {
    async fn compute(&self, n: u64) -> Result<Answer, WorkerError> {
        let _permit = match &self.slots {
            Some(slots) => match slots.acquire().await {
                Ok(permit) => Some(permit),
                // The semaphore is never closed.
                Err(_) => None,
            },
            None => None,
        };

        let is_prime = match self.timeout {
            Some(after) => tokio::time::timeout(after, self.run_task(n))
                .await
                .map_err(|_| WorkerError::TimedOut(after))??,
            None => self.run_task(n).await?,
        };

        let answer = Answer::from_is_prime(is_prime);
        debug!(n, %answer, "Worker finished");
        Ok(answer)
    }
}

/// Worker-side loop: read one task, reply once, return.
pub fn run_worker<R: BufRead, W: Write>(mut input: R, mut output: W) -> Result<(), WorkerError> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(WorkerError::NoTask);
    }

    let task: WorkerTask = serde_json::from_str(line.trim_end()).map_err(WorkerError::Malformed)?;
    let result = primes::is_prime(task.n);
    debug!(n = task.n, result, "Computed primality");

    serde_json::to_writer(&mut output, &WorkerReply { result }).map_err(WorkerError::Malformed)?;
    output.write_all(b"\n")?;
    output.flush()?;
    Ok(())
}
