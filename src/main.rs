//! Codebox - compile-and-run server with streaming program I/O.
//!
//! Usage:
//!   codebox serve [--port 3000]              # Start the WebSocket server
//!   codebox run Main.java [--args "a b"]     # Compile and run one file locally

use clap::{Parser, Subcommand};
use codebox::args;
use codebox::config::{Config, Toolchain, DEFAULT_OUTPUT_BUFFER};
use codebox::process::Termination;
use codebox::server;
use codebox::session::{SessionHandle, SessionOutcome, Submission};
use codebox::state::AppState;
use codebox::stream::Output;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::exit;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "codebox")]
#[command(about = "Compile and run submitted programs, streaming their I/O")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the WebSocket server
    Serve {
        /// Address to bind
        #[arg(long, env = "CODEBOX_HOST", default_value = "0.0.0.0")]
        host: IpAddr,

        /// Port to listen on
        #[arg(long, env = "CODEBOX_PORT", default_value = "3000")]
        port: u16,

        #[command(flatten)]
        toolchain: ToolchainArgs,
    },
    /// Compile and run a local source file once, using this terminal for I/O
    Run {
        /// Source file to submit
        file: PathBuf,

        /// Program arguments, split like a client-supplied argument string
        #[arg(long, default_value = "")]
        args: String,

        #[command(flatten)]
        toolchain: ToolchainArgs,
    },
}

#[derive(clap::Args, Debug)]
struct ToolchainArgs {
    /// Directory holding one workspace per session
    #[arg(long, env = "CODEBOX_WORKSPACE_ROOT", default_value = "temp")]
    workspace_root: PathBuf,

    /// Compiler command line; the source file name is appended
    #[arg(long, env = "CODEBOX_COMPILE", default_value = "javac")]
    compile: String,

    /// Program command line; user arguments are appended
    #[arg(long, env = "CODEBOX_RUN", default_value = "java Main")]
    run: String,

    /// Name of the source file inside each workspace
    #[arg(long, env = "CODEBOX_SOURCE_FILE", default_value = "Main.java")]
    source_file: String,

    /// Output chunks buffered per session before the program is throttled
    #[arg(long, env = "CODEBOX_OUTPUT_BUFFER", default_value_t = DEFAULT_OUTPUT_BUFFER)]
    output_buffer: usize,
}

impl ToolchainArgs {
    fn into_config(self) -> Result<Config, String> {
        let compile = args::parse(&self.compile);
        let run = args::parse(&self.run);
        if compile.is_empty() {
            return Err("--compile must name a program".to_string());
        }
        if run.is_empty() {
            return Err("--run must name a program".to_string());
        }
        Ok(Config {
            workspace_root: self.workspace_root,
            toolchain: Toolchain {
                compile,
                run,
                source_file: self.source_file,
            },
            output_buffer: self.output_buffer.max(1),
        })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    match args.command {
        Commands::Serve {
            host,
            port,
            toolchain,
        } => {
            let config = toolchain.into_config().unwrap_or_else(|e| {
                eprintln!("Error: {}", e);
                exit(1);
            });
            let state = AppState::new(config);
            if let Err(e) = server::run_server(SocketAddr::new(host, port), state).await {
                error!(error = %e, "Server failed");
                exit(1);
            }
        }
        Commands::Run {
            file,
            args,
            toolchain,
        } => {
            let config = toolchain.into_config().unwrap_or_else(|e| {
                eprintln!("Error: {}", e);
                exit(1);
            });
            // Exit explicitly: the stdin reader cannot be cancelled.
            exit(run_oneshot(file, args, config).await);
        }
    }
}

/// Drive one session with the terminal as its transport.
async fn run_oneshot(file: PathBuf, raw_args: String, config: Config) -> i32 {
    let code = match tokio::fs::read_to_string(&file).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}: {}", file.display(), e);
            return 1;
        }
    };

    let (output, mut outbound) = Output::channel(config.output_buffer);
    let key = format!("run-{}", uuid::Uuid::new_v4());
    let session = SessionHandle::spawn(key, &config, output);

    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(text) = outbound.recv().await {
            if stdout.write_all(text.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let feeder = tokio::spawn({
        let session = session.clone();
        async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                session.input(line).await;
            }
        }
    });

    session.submit(Submission::new(code, raw_args)).await;
    let status = session.wait_completed(1).await;
    feeder.abort();
    session.disconnect().await;
    drop(session);
    let _ = printer.await;
    println!();

    match status.outcome {
        Some(SessionOutcome::Exited(Termination::Code(code))) => code,
        Some(SessionOutcome::Exited(Termination::Signal(signal))) => 128 + signal,
        _ => 1,
    }
}
