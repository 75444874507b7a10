//! The confinement kernel.
//!
//! - [`store`]: lockable mappings and objects
//! - [`types`]: sealed types and their identity markers
//! - [`rewriter`]: static rejection and redirection of reflective source
//! - [`sealer`]: opaque capabilities over host and guest callables
//! - [`mediator`]: checked attribute access
//! - [`manager`]: construction of sealed module scopes
//! - [`signed`]: RS256 tokens for signed classes

pub mod format;
pub mod manager;
pub mod mediator;
pub mod rewriter;
pub mod scope;
pub mod sealer;
pub mod signed;
pub mod stdlib;
pub mod store;
pub mod types;
pub mod value;
