//! snippet-runner
//!
//! Runs code snippets with a local toolchain or the Piston remote API.
//! Serves MCP over stdio, or runs a single file from the command line.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use snippet_runner::backend::{PistonClient, TerminalStatus};
use snippet_runner::config::Config;
use snippet_runner::coordinator::ExecutionCoordinator;
use snippet_runner::mcp;
use snippet_runner::sink::TerminalSink;

#[derive(Parser, Debug)]
#[command(name = "snippet-runner")]
#[command(about = "Run code snippets locally or through a remote execution API")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// Language tag of the file to run (e.g. python, bash, js)
    #[arg(long, requires = "file")]
    language: Option<String>,

    /// Source file to run once, streaming output to the terminal
    #[arg(long, requires = "language")]
    file: Option<PathBuf>,

    /// List the runtimes offered by the remote API
    #[arg(long)]
    runtimes: bool,

    /// JSON configuration file (defaults to SNIPPET_RUNNER_CONFIG or built-ins)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    }
    .context("Failed to load configuration")?;

    info!(
        timeout_ms = config.timeout_ms,
        prefer = %config.prefer,
        remote = %config.remote.endpoint,
        "Loaded configuration"
    );

    if args.runtimes {
        let client = PistonClient::new(config.remote.endpoint.clone());
        let runtimes = client.runtimes(config.timeout()).await.context("Failed to list remote runtimes")?;
        for rt in runtimes {
            println!("{} {} {:?}", rt.language, rt.version, rt.aliases);
        }
        return Ok(());
    }

    let coordinator = ExecutionCoordinator::new(config);

    if let (Some(language), Some(file)) = (&args.language, &args.file) {
        let source = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let origin = file.display().to_string();
        let report = coordinator
            .submit(&origin, language, &source, &mut TerminalSink)
            .await?;
        std::process::exit(match report.status {
            TerminalStatus::Succeeded => 0,
            TerminalStatus::Failed => 1,
        });
    }

    if args.stdio {
        mcp::serve_stdio(coordinator).await?;
    } else {
        anyhow::bail!("Pass --stdio, --runtimes, or --language with --file");
    }

    Ok(())
}
