//! Per-connection build-and-run lifecycle.
//!
//! Every session is driven by one actor task. Transport events (submit,
//! input, disconnect) arrive on its command channel and child-process exits
//! are awaited in the same `select!`, so the phase and the owned process
//! handle are only ever touched from that task.

use crate::args;
use crate::build::{Build, BuildOutcome, DIAGNOSTIC_PREFIX};
use crate::config::{Config, Toolchain};
use crate::error::RunnerError;
use crate::process::{ProcessHandle, Termination, STDERR_PREFIX};
use crate::stream::Output;
use crate::workspace::Workspaces;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 32;
const SEPARATOR: &str = "-------------------------";

/// Source text plus the raw argument string of one submit event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Submission {
    pub code: String,
    pub args: String,
}

impl Submission {
    pub fn new(code: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            args: args.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Writing,
    Compiling,
    Running,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Writing => write!(f, "writing"),
            Self::Compiling => write!(f, "compiling"),
            Self::Running => write!(f, "running"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// How a submission ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The workspace or source file could not be written.
    WriteFailed,
    /// The compiler failed, or could not be started (`None`).
    CompileFailed(Option<Termination>),
    /// A newer submission arrived while compiling.
    Cancelled,
    /// The compiled program could not be started.
    LaunchFailed,
    /// The program exited on its own.
    Exited(Termination),
    /// The program was killed because a newer submission arrived.
    Superseded(Termination),
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteFailed => write!(f, "write failed"),
            Self::CompileFailed(Some(status)) => write!(f, "compilation failed with {}", status),
            Self::CompileFailed(None) => write!(f, "compiler unavailable"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::LaunchFailed => write!(f, "launch failed"),
            Self::Exited(status) => write!(f, "exited with {}", status),
            Self::Superseded(status) => write!(f, "superseded ({})", status),
        }
    }
}

/// Observable status of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Outcome of the most recently finished submission.
    pub outcome: Option<SessionOutcome>,
    /// Number of submissions that have finished.
    pub completed: u64,
}

#[derive(Debug)]
enum Command {
    Submit(Submission),
    Input(String),
    Disconnect,
}

enum Event {
    Command(Command),
    BuildExited,
    ProgramExited,
    Closed,
}

enum Phase {
    Idle,
    Compiling { build: Build, args: Vec<String> },
    Running(ProcessHandle),
    Terminated,
}

/// Cheap, cloneable front door to one session actor.
#[derive(Clone)]
pub struct SessionHandle {
    key: String,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    /// Start the actor for `key`. Everything it says goes to `output`.
    pub fn spawn(key: impl Into<String>, config: &Config, output: Output) -> Self {
        let key = key.into();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (status_tx, status_rx) = watch::channel(SessionStatus {
            state: SessionState::Idle,
            outcome: None,
            completed: 0,
        });

        let controller = SessionController {
            key: key.clone(),
            workspaces: Workspaces::new(
                config.workspace_root.clone(),
                config.toolchain.source_file.clone(),
            ),
            toolchain: config.toolchain.clone(),
            buffer: config.output_buffer.max(1),
            output,
            phase: Phase::Idle,
            workspace: None,
            status: status_tx,
            commands: commands_rx,
        };
        tokio::spawn(controller.run());

        Self {
            key,
            commands: commands_tx,
            status: status_rx,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub async fn submit(&self, submission: Submission) {
        self.send(Command::Submit(submission)).await;
    }

    pub async fn input(&self, text: impl Into<String>) {
        self.send(Command::Input(text.into())).await;
    }

    /// Tear the session down and wait until its process is dead and its
    /// workspace removed.
    pub async fn disconnect(&self) {
        self.send(Command::Disconnect).await;
        let mut status = self.status.clone();
        let _ = status
            .wait_for(|s| s.state == SessionState::Terminated)
            .await;
    }

    /// Wait until at least `count` submissions have finished, or the session
    /// is gone.
    pub async fn wait_completed(&self, count: u64) -> SessionStatus {
        let mut status = self.status.clone();
        let reached = status
            .wait_for(|s| s.completed >= count || s.state == SessionState::Terminated)
            .await
            .map(|s| s.clone());
        match reached {
            Ok(s) => s,
            Err(_) => self.status(),
        }
    }

    async fn send(&self, command: Command) {
        if self.commands.send(command).await.is_err() {
            debug!(session = %self.key, "Event for finished session dropped");
        }
    }
}

struct SessionController {
    key: String,
    workspaces: Workspaces,
    toolchain: Toolchain,
    buffer: usize,
    output: Output,
    phase: Phase,
    workspace: Option<PathBuf>,
    status: watch::Sender<SessionStatus>,
    commands: mpsc::Receiver<Command>,
}

impl SessionController {
    async fn run(mut self) {
        info!(session = %self.key, "Session started");
        while !matches!(self.phase, Phase::Terminated) {
            let event = self.next_event().await;
            self.handle(event).await;
        }
        info!(session = %self.key, "Session ended");
    }

    async fn next_event(&mut self) -> Event {
        let commands = &mut self.commands;
        match &mut self.phase {
            Phase::Compiling { build, .. } => tokio::select! {
                command = commands.recv() => command.map_or(Event::Closed, Event::Command),
                _ = build.wait() => Event::BuildExited,
            },
            Phase::Running(process) => tokio::select! {
                command = commands.recv() => command.map_or(Event::Closed, Event::Command),
                _ = process.wait() => Event::ProgramExited,
            },
            Phase::Idle | Phase::Terminated => {
                commands.recv().await.map_or(Event::Closed, Event::Command)
            }
        }
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Command(Command::Submit(submission)) => self.submit(submission).await,
            Event::Command(Command::Input(text)) => self.input(&text),
            Event::Command(Command::Disconnect) | Event::Closed => self.terminate().await,
            Event::BuildExited => self.build_exited().await,
            Event::ProgramExited => self.program_exited().await,
        }
    }

    async fn submit(&mut self, submission: Submission) {
        // At most one child per session: a new submission cancels the old one.
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {}
            Phase::Compiling { mut build, .. } => {
                build.cancel();
                let _ = build.finish().await;
                info!(session = %self.key, "Build superseded");
                self.complete(SessionOutcome::Cancelled);
            }
            Phase::Running(mut process) => {
                process.terminate();
                let status = process.finish().await;
                info!(session = %self.key, "Program superseded");
                let status = self.finish_run(status).await;
                self.complete(SessionOutcome::Superseded(status));
            }
            Phase::Terminated => {
                self.phase = Phase::Terminated;
                return;
            }
        }

        self.set_state(SessionState::Writing);
        let args = args::parse(&submission.args);
        let dir = match self.materialize(&submission.code).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(session = %self.key, error = %e, "Workspace write failed");
                self.emit(format!("Error writing file: {}\n", e)).await;
                self.complete(SessionOutcome::WriteFailed);
                return;
            }
        };

        self.emit("Compiling...\n").await;
        match Build::start(&self.toolchain, &dir, self.output.clone(), self.buffer) {
            Ok(build) => {
                self.phase = Phase::Compiling { build, args };
                self.set_state(SessionState::Compiling);
            }
            Err(e) => {
                warn!(session = %self.key, error = %e, "Compiler did not start");
                self.emit(format!("{}{}\n", DIAGNOSTIC_PREFIX, e)).await;
                self.emit("\nCompilation failed.\n").await;
                self.complete(SessionOutcome::CompileFailed(None));
            }
        }
    }

    async fn materialize(&mut self, code: &str) -> Result<PathBuf, crate::error::WorkspaceError> {
        let dir = self.workspaces.ensure(&self.key).await?;
        self.workspace = Some(dir.clone());
        self.workspaces.write_source(&dir, code).await?;
        Ok(dir)
    }

    fn input(&mut self, text: &str) {
        match &mut self.phase {
            Phase::Running(process) => {
                process.write(text);
            }
            _ => debug!(session = %self.key, "Input with no running program dropped"),
        }
    }

    async fn build_exited(&mut self) {
        let Phase::Compiling { build, args } = std::mem::replace(&mut self.phase, Phase::Idle) else {
            return;
        };

        match build.finish().await {
            Ok(BuildOutcome::Success) => self.launch(args).await,
            Ok(BuildOutcome::Failure {
                diagnostics,
                status,
            }) => {
                info!(session = %self.key, %status, diagnostic_bytes = diagnostics.len(), "Compilation failed");
                self.emit(format!("\nCompilation failed with {}.\n", status)).await;
                self.complete(SessionOutcome::CompileFailed(Some(status)));
            }
            Err(e) => {
                warn!(session = %self.key, error = %e, "Lost track of compiler");
                self.emit("\nCompilation failed.\n").await;
                self.complete(SessionOutcome::CompileFailed(None));
            }
        }
    }

    async fn launch(&mut self, args: Vec<String>) {
        let Some(dir) = self.workspace.clone() else {
            self.complete(SessionOutcome::LaunchFailed);
            return;
        };

        self.emit(format!("Running...\n{}\n", SEPARATOR)).await;
        match ProcessHandle::start(&self.toolchain, &dir, &args, self.output.clone(), self.buffer) {
            Ok(process) => {
                self.phase = Phase::Running(process);
                self.set_state(SessionState::Running);
            }
            Err(e) => {
                warn!(session = %self.key, error = %e, "Program did not start");
                self.emit(format!("{}{}\n", STDERR_PREFIX, e)).await;
                self.cleanup().await;
                self.complete(SessionOutcome::LaunchFailed);
            }
        }
    }

    async fn program_exited(&mut self) {
        let Phase::Running(process) = std::mem::replace(&mut self.phase, Phase::Idle) else {
            return;
        };
        let status = process.finish().await;
        let status = self.finish_run(status).await;
        self.complete(SessionOutcome::Exited(status));
    }

    /// Report the end of a run and remove its workspace.
    async fn finish_run(&mut self, status: Result<Termination, RunnerError>) -> Termination {
        let status = status.unwrap_or_else(|e| {
            warn!(session = %self.key, error = %e, "Lost track of program");
            Termination::Unknown
        });
        info!(session = %self.key, %status, "Program finished");
        self.emit(format!("\n{}\nProcess exited with {}.", SEPARATOR, status)).await;
        self.cleanup().await;
        status
    }

    async fn terminate(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Terminated) {
            Phase::Compiling { mut build, .. } => {
                build.cancel();
                let _ = build.finish().await;
            }
            Phase::Running(mut process) => {
                process.terminate();
                let _ = process.finish().await;
            }
            Phase::Idle | Phase::Terminated => {}
        }

        match self.workspaces.path_for(&self.key) {
            Ok(dir) => self.workspaces.destroy(&dir).await,
            Err(e) => debug!(session = %self.key, error = %e, "No workspace to remove"),
        }
        self.workspace = None;
        self.set_state(SessionState::Terminated);
        info!(session = %self.key, "Session terminated");
    }

    async fn cleanup(&mut self) {
        if let Some(dir) = self.workspace.take() {
            self.workspaces.destroy(&dir).await;
        }
    }

    async fn emit(&self, text: impl Into<String>) {
        if !self.output.emit(text).await {
            debug!(session = %self.key, "Client gone; output dropped");
        }
    }

    fn set_state(&self, state: SessionState) {
        self.status.send_modify(|s| s.state = state);
    }

    fn complete(&self, outcome: SessionOutcome) {
        self.status.send_modify(|s| {
            s.state = SessionState::Idle;
            s.outcome = Some(outcome);
            s.completed += 1;
        });
    }
}
