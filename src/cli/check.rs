//! CLI subcommand: `encap check`
//!
//! Runs the parser and the program rewriter over a script without executing
//! any of it.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use crate::error::KernelError;
use crate::kernel::rewriter;
use crate::script::{self, ParseError};

#[derive(Args)]
pub struct CheckArgs {
    /// Script to check
    pub file: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("SyntaxError: {0}")]
    Syntax(#[from] ParseError),

    #[error("{name}: {err}", name = .0.kind().name(), err = .0)]
    Rejected(#[from] KernelError),
}

/// Whether `src` would be accepted for execution.
pub fn check_source(src: &str) -> std::result::Result<(), CheckError> {
    let stmts = script::parse_module(src)?;
    rewriter::rewrite_module(stmts)?;
    Ok(())
}

pub fn run(args: CheckArgs) -> Result<()> {
    let src = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    match check_source(&src) {
        Ok(()) => {
            println!("{}: ok", args.file.display());
            Ok(())
        }
        Err(e) => {
            tracing::info!(file = %args.file.display(), "check rejected source: {e}");
            anyhow::bail!("{}: {e}", args.file.display())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_source() {
        assert!(check_source("x = 1\nprint(x)\n").is_ok());
        let err = check_source("def f():\n    global x\n").unwrap_err();
        assert!(err.to_string().starts_with("ForbiddenSyntaxError"), "{err}");
        let err = check_source("f.__code__\n").unwrap_err();
        assert!(err.to_string().starts_with("ForbiddenNameError"), "{err}");
        let err = check_source("x = (\n").unwrap_err();
        assert!(matches!(err, CheckError::Syntax(_)));
    }
}
