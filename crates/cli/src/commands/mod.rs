//! Subcommand dispatch.

use async_trait::async_trait;
use clap::Subcommand;
use shroud_transform::ObfuscationError;
use shroud_utils::errors::ObfuscateError;

pub mod cfg;
pub mod decode;
pub mod obfuscate;

/// Top-level subcommands.
#[derive(Subcommand)]
pub enum Cmd {
    /// Obfuscate an x86-64 ELF relocatable object
    Obfuscate(obfuscate::ObfuscateArgs),

    /// List the lifted functions and blocks of an object
    Decode(decode::DecodeArgs),

    /// Write one function's CFG as Graphviz DOT
    Cfg(cfg::CfgArgs),
}

/// Failure of a subcommand.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Bad arguments or unreadable input.
    #[error(transparent)]
    Obfuscate(#[from] ObfuscateError),
    /// A pipeline run failed; its failure report has already been written.
    #[error(transparent)]
    Run(#[from] Box<ObfuscationError>),
}

impl CliError {
    /// Process exit code for this failure.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Obfuscate(e) => e.exit_code(),
            Self::Run(e) => e.exit_code(),
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        Self::Obfuscate(e.into())
    }
}

impl From<shroud_utils::errors::ParseError> for CliError {
    fn from(e: shroud_utils::errors::ParseError) -> Self {
        Self::Obfuscate(e.into())
    }
}

impl From<shroud_utils::errors::ConfigError> for CliError {
    fn from(e: shroud_utils::errors::ConfigError) -> Self {
        Self::Obfuscate(e.into())
    }
}

/// A runnable subcommand.
#[async_trait]
pub trait Command {
    /// Runs the subcommand to completion.
    async fn execute(self) -> Result<(), CliError>;
}

#[async_trait]
impl Command for Cmd {
    async fn execute(self) -> Result<(), CliError> {
        match self {
            Self::Obfuscate(args) => args.execute().await,
            Self::Decode(args) => args.execute().await,
            Self::Cfg(args) => args.execute().await,
        }
    }
}
