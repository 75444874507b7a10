use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use super::shell::session_config;
use crate::config::Config;
use crate::session::{LaunchOptions, Session, format_traceback};

#[derive(Args)]
pub struct RunArgs {
    /// Script to run
    pub file: PathBuf,
}

pub fn run(args: RunArgs, config: &Config) -> Result<()> {
    let src = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;

    let mut options = LaunchOptions::new(session_config(config)?);
    options.file = args.file.display().to_string();
    let session = Session::launch(options).map_err(|e| anyhow::anyhow!("Failed to start session: {e}"))?;

    if let Err(err) = session.run_script(&src) {
        eprint!("{}", format_traceback(&err, session.token()));
        anyhow::bail!("{} failed", args.file.display());
    }
    Ok(())
}
