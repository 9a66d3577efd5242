//! Compiler invocation.

use crate::config::{Toolchain, MAX_DIAGNOSTIC_BYTES};
use crate::error::RunnerError;
use crate::process::{spawn, Supervised, Termination};
use crate::stream::{Chunk, Output};
use std::path::Path;
use std::process::Stdio;
use tracing::info;

/// Prefix that marks compiler diagnostics in the session output.
pub const DIAGNOSTIC_PREFIX: &str = "Compilation Error: ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Success,
    Failure {
        diagnostics: String,
        status: Termination,
    },
}

/// A running compiler. Its stdout and stderr are merged into one diagnostic
/// channel and streamed to the session as they arrive.
pub struct Build {
    inner: Supervised,
}

impl Build {
    pub fn start(
        toolchain: &Toolchain,
        workspace: &Path,
        output: Output,
        buffer: usize,
    ) -> Result<Self, RunnerError> {
        let source = [toolchain.source_file.clone()];
        let child = spawn(&toolchain.compile, &source, workspace, Stdio::null())?;
        let inner = Supervised::new(child, output, buffer, MAX_DIAGNOSTIC_BYTES, render_diagnostic);
        info!(pid = ?inner.pid(), workspace = %workspace.display(), "Compiler started");
        Ok(Self { inner })
    }

    /// Resolves when the compiler exits. Cancel safe.
    pub async fn wait(&mut self) -> Result<Termination, RunnerError> {
        self.inner.wait().await
    }

    /// Kill the compiler if it is still running.
    pub fn cancel(&mut self) {
        self.inner.kill();
    }

    /// Reap the compiler, forward the remaining diagnostics and decide.
    pub async fn finish(mut self) -> Result<BuildOutcome, RunnerError> {
        let (status, diagnostics) = self.inner.finish().await;
        let status = status?;
        if status.success() {
            Ok(BuildOutcome::Success)
        } else {
            Ok(BuildOutcome::Failure {
                diagnostics,
                status,
            })
        }
    }
}

/// Compile the workspace's source file, streaming diagnostics to `output`.
pub async fn compile(
    toolchain: &Toolchain,
    workspace: &Path,
    output: Output,
    buffer: usize,
) -> Result<BuildOutcome, RunnerError> {
    Build::start(toolchain, workspace, output, buffer)?.finish().await
}

fn render_diagnostic(chunk: &Chunk) -> String {
    format!("{}{}", DIAGNOSTIC_PREFIX, chunk.text)
}
