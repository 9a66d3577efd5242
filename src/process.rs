//! Child process supervision and the running program's handle.

use crate::config::Toolchain;
use crate::error::RunnerError;
use crate::stream::{Chunk, Forwarder, Output, StreamKind};
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Prefix that marks program stderr in the session output.
pub const STDERR_PREFIX: &str = "Error: ";

/// Quiet period after which pipes still open past the child's exit are
/// abandoned.
const DRAIN_IDLE: Duration = Duration::from_secs(1);

/// Longest time output keeps being forwarded after the child's exit.
const DRAIN_LIMIT: Duration = Duration::from_secs(10);

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Code(i32),
    Signal(i32),
    Unknown,
}

impl Termination {
    pub fn success(self) -> bool {
        self == Termination::Code(0)
    }
}

impl From<ExitStatus> for Termination {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Termination::Code(code);
        }
        match status.signal() {
            Some(signal) => Termination::Signal(signal),
            None => Termination::Unknown,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Code(code) => write!(f, "code {}", code),
            Termination::Signal(signal) => write!(f, "signal {}", signal),
            Termination::Unknown => write!(f, "unknown status"),
        }
    }
}

/// Spawn `argv` followed by `extra` in `cwd`, as the leader of a new process
/// group, with stdout and stderr piped.
pub(crate) fn spawn(
    argv: &[String],
    extra: &[String],
    cwd: &Path,
    stdin: Stdio,
) -> Result<Child, RunnerError> {
    let (program, leading) = argv.split_first().ok_or(RunnerError::EmptyCommand)?;

    let mut cmd = Command::new(program);
    cmd.args(leading)
        .args(extra)
        .current_dir(cwd)
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

    let child = cmd.spawn().map_err(|source| RunnerError::Spawn {
        program: program.clone(),
        source,
    })?;
    debug!(program = %program, args = ?extra, pid = ?child.id(), "Spawned");
    Ok(child)
}

/// SIGKILL every process in the group led by `pid`.
pub(crate) fn kill_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "killpg failed"),
    }
}

/// A spawned child whose output is being forwarded.
pub(crate) struct Supervised {
    child: Child,
    pid: Option<u32>,
    forwarder: Option<Forwarder>,
}

impl Supervised {
    pub(crate) fn new<F>(
        mut child: Child,
        output: Output,
        buffer: usize,
        capture_limit: usize,
        render: F,
    ) -> Self
    where
        F: Fn(&Chunk) -> String + Send + 'static,
    {
        let pid = child.id();
        let forwarder = Forwarder::spawn(
            child.stdout.take(),
            child.stderr.take(),
            output,
            buffer,
            capture_limit,
            render,
        );
        Self {
            child,
            pid,
            forwarder: Some(forwarder),
        }
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Cancel safe.
    pub(crate) async fn wait(&mut self) -> Result<Termination, RunnerError> {
        let status = self.child.wait().await.map_err(RunnerError::Wait)?;
        Ok(status.into())
    }

    pub(crate) fn kill(&mut self) {
        if !self.is_alive() {
            return;
        }
        if let Some(pid) = self.pid {
            kill_group(pid);
        }
        if let Err(e) = self.child.start_kill() {
            debug!(pid = ?self.pid, error = %e, "start_kill failed");
        }
        info!(pid = ?self.pid, "Process killed");
    }

    /// Reap the child, sweep its process group and forward what is left of
    /// its output. A process that escaped the group can keep the pipes open,
    /// so draining is bounded by [`DRAIN_IDLE`] and [`DRAIN_LIMIT`]. Returns
    /// the exit state and captured text.
    pub(crate) async fn finish(&mut self) -> (Result<Termination, RunnerError>, String) {
        let status = self.wait().await;
        if let Some(pid) = self.pid {
            kill_group(pid);
        }
        let captured = match self.forwarder.take() {
            Some(forwarder) => forwarder.finish(DRAIN_IDLE, DRAIN_LIMIT).await,
            None => String::new(),
        };
        (status, captured)
    }
}

impl Drop for Supervised {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            if self.is_alive() {
                kill_group(pid);
            }
        }
    }
}

/// The live compiled program of one session.
pub struct ProcessHandle {
    inner: Supervised,
    input: Option<mpsc::Sender<String>>,
}

impl ProcessHandle {
    /// Spawn the program in `workspace` with `args`. Returns as soon as the
    /// process exists; output flows to `output` in the background.
    pub fn start(
        toolchain: &Toolchain,
        workspace: &Path,
        args: &[String],
        output: Output,
        buffer: usize,
    ) -> Result<Self, RunnerError> {
        let mut child = spawn(&toolchain.run, args, workspace, Stdio::piped())?;
        let input = child.stdin.take().map(|stdin| {
            let (tx, rx) = mpsc::channel(buffer.max(1));
            tokio::spawn(feed_stdin(stdin, rx));
            tx
        });
        let inner = Supervised::new(child, output, buffer, 0, render_program_chunk);
        info!(pid = ?inner.pid(), args = ?args, "Program started");
        Ok(Self { inner, input })
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid()
    }

    pub fn is_alive(&mut self) -> bool {
        self.inner.is_alive()
    }

    /// Send `line` plus a newline to the program's stdin. Writing to a process
    /// that already exited is a silent no-op; returns whether the line was
    /// queued.
    ///
    /// Lines wait in a queue of `buffer` entries in front of the pipe. When the
    /// program stops reading and both fill up, the line is dropped with a
    /// warning and `false` is returned; the caller is never blocked.
    pub fn write(&mut self, line: &str) -> bool {
        if !self.inner.is_alive() {
            debug!(pid = ?self.pid(), "Input for exited process dropped");
            return false;
        }
        let Some(input) = &self.input else {
            return false;
        };
        match input.try_send(format!("{}\n", line)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(pid = ?self.pid(), "Program is not reading input; line dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(pid = ?self.pid(), "Program stdin closed");
                self.input = None;
                false
            }
        }
    }

    /// Resolves when the program exits. Cancel safe.
    pub async fn wait(&mut self) -> Result<Termination, RunnerError> {
        self.inner.wait().await
    }

    /// Forcibly kill the program and its process group. Idempotent.
    pub fn terminate(&mut self) {
        self.inner.kill();
    }

    /// Reap the program and wait for the last of its output to be forwarded.
    pub async fn finish(mut self) -> Result<Termination, RunnerError> {
        self.input = None;
        let (status, _) = self.inner.finish().await;
        status
    }
}

fn render_program_chunk(chunk: &Chunk) -> String {
    match chunk.kind {
        StreamKind::Stdout => chunk.text.clone(),
        StreamKind::Stderr => format!("{}{}", STDERR_PREFIX, chunk.text),
    }
}

async fn feed_stdin(mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        let written = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            debug!(error = %e, "Stdin write failed; process has exited");
            break;
        }
    }
}
