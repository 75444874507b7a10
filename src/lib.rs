//! encap - a confinement kernel for an embedded scripting shell
//!
//! This crate provides:
//! - A Python-flavoured guest language (parser and tree-walking evaluator)
//! - Locked stores, sealed types and sealed capabilities
//! - A program rewriter and a reflection mediator guarding every attribute step
//! - Sealed per-module scopes and a mediated loader for local and remote sources
//! - Nested shell sessions with token-gated tracebacks

pub mod cli;
pub mod config;
pub mod error;
pub mod interp;
pub mod kernel;
pub mod loader;
pub mod paths;
pub mod script;
pub mod session;

pub use config::Config;
pub use error::{ErrorKind, KernelError};
pub use session::{LaunchOptions, Session, SessionConfig};
