/// Entry point for the shroud CLI, an x86-64 ELF object obfuscator.
///
/// Parses command-line arguments, initializes logging on stderr and
/// dispatches to the `obfuscate`, `decode` and `cfg` subcommands. Failures
/// exit with a stable code per error kind.
use clap::Parser;
use shroud_cli::commands::{Cmd, Command};
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command-line interface for shroud.
#[derive(Parser)]
#[command(name = "shroud", version)]
#[command(about = "shroud: x86-64 ELF relocatable object obfuscator")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command.execute().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
