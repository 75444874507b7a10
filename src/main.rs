use anyhow::Result;
use clap::Parser;

use encap::cli::{self, Cli, Commands};
use encap::config::Config;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_from(cli.config.as_deref());

    // RUST_LOG wins, then -v, then the configured level
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        config
            .as_ref()
            .map(|c| c.logging.level.clone())
            .unwrap_or_else(|_| "warn".to_string())
    };
    let json = matches!(&config, Ok(c) if c.logging.format == "json");
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }

    match cli.command {
        Commands::Shell(args) => cli::shell::run(args, &config?),
        Commands::Run(args) => cli::run::run(args, &config?),
        Commands::Check(args) => cli::check::run(args),
        Commands::Config(args) => cli::config::run(args, cli.config.as_deref()),
        Commands::Paths => cli::paths::run(),
    }
}
