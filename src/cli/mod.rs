pub mod check;
pub mod config;
pub mod paths;
pub mod run;
pub mod shell;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "encap")]
#[command(author, version, about = "A confined shell for untrusted scripts")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "ENCAP_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start an interactive confined shell
    Shell(shell::ShellArgs),

    /// Run a script in a confined session
    Run(run::RunArgs),

    /// Parse and rewrite a script without running it
    Check(check::CheckArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show resolved XDG directory paths
    Paths,
}
