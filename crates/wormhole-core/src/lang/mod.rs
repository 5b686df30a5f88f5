//! The function language: a small, indentation-structured language with
//! Python-like surface syntax.
//!
//! # Modules
//!
//! - [`lexer`]: tokens, including NEWLINE/INDENT/DEDENT
//! - [`parser`]: recursive descent into the [`ast`]
//! - [`ast`]: serializable syntax tree; cached next to admitted source

pub mod ast;
pub mod lexer;
pub mod parser;

use serde::{Deserialize, Serialize};

pub use ast::{Pos, Program};

/// A lexical or grammatical error at a source position.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{line}:{col}: {message}")]
pub struct SyntaxError {
    pub line: u32,
    pub col: u32,
    pub message: String,
}

impl SyntaxError {
    pub fn new(pos: Pos, message: impl Into<String>) -> Self {
        Self {
            line: pos.line,
            col: pos.col,
            message: message.into(),
        }
    }
}

/// Parse `source` into a [`Program`]. Never executes anything.
pub fn parse(source: &str) -> Result<Program, SyntaxError> {
    let tokens = lexer::tokenize(source)?;
    parser::Parser::new(tokens).parse_program()
}
