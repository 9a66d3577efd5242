//! Runtime configuration.

use std::path::PathBuf;

/// Default number of chunks buffered per output pipeline.
pub const DEFAULT_OUTPUT_BUFFER: usize = 64;

/// Upper bound on compiler diagnostics retained in a [`crate::build::BuildOutcome`].
pub const MAX_DIAGNOSTIC_BYTES: usize = 64 * 1024;

/// How a submission is compiled and run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    /// Compiler program and leading arguments; the source file name is appended.
    pub compile: Vec<String>,
    /// Program launcher and leading arguments; user arguments are appended.
    pub run: Vec<String>,
    /// Fixed name of the source file inside each workspace.
    pub source_file: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            compile: vec!["javac".to_string()],
            run: vec!["java".to_string(), "Main".to_string()],
            source_file: "Main.java".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub workspace_root: PathBuf,
    pub toolchain: Toolchain,
    pub output_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("temp"),
            toolchain: Toolchain::default(),
            output_buffer: DEFAULT_OUTPUT_BUFFER,
        }
    }
}
