//! Codebox - compile and run submitted source on the host, streaming the
//! program's output to a connected client and its input back.
//!
//! Submitted code runs with the server's privileges; there is no sandbox.

#[cfg(not(unix))]
compile_error!("codebox only works on Unix hosts.");

pub mod args;
pub mod build;
pub mod config;
pub mod error;
pub mod process;
pub mod server;
pub mod session;
pub mod state;
pub mod stream;
pub mod workspace;
