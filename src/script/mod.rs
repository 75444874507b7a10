//! Guest language front end: tokenizer, parser and syntax tree.

pub mod ast;
pub mod lexer;
pub mod parser;

pub use parser::{parse_expression, parse_module};

/// A syntax error in guest source.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{msg} (line {line})")]
pub struct ParseError {
    pub msg: String,
    pub line: usize,
}

impl ParseError {
    pub fn new(msg: impl Into<String>, line: usize) -> Self {
        Self {
            msg: msg.into(),
            line,
        }
    }
}
