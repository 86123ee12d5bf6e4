//! Error type shared by the lexer, store, builder, renderer and directives.

use std::path::PathBuf;
use thiserror::Error;

use crate::lexer::TokenKind;

/// Errors that can occur while reading, querying or rendering BibTeX data.
#[derive(Error, Debug)]
pub enum Error {
    #[error("expected '{expected}' got '{found}' at offset {offset}")]
    Syntax {
        expected: String,
        found: String,
        offset: usize,
    },

    #[error("unknown BibTeX entry '{0}'")]
    UnknownEntry(String),

    #[error("invalid query: {0}")]
    Query(String),

    #[error("missing template '{0}'")]
    MissingTemplate(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("{0} are disabled")]
    OperationDisabled(&'static str),

    #[error("{stage} failed: {output}")]
    Build { stage: String, output: String },

    #[error("insecure permissions for '{}'", .0.display())]
    Permission(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Builds a syntax error for a failed `expect`.
    pub(crate) fn syntax(expected: TokenKind, found: &str, offset: usize) -> Self {
        Error::Syntax {
            expected: expected.to_string(),
            found: found.to_string(),
            offset,
        }
    }
}

impl From<tera::Error> for Error {
    fn from(e: tera::Error) -> Self {
        // tera keeps the useful part of the message in the source chain
        let mut message = e.to_string();
        let mut source = std::error::Error::source(&e);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Error::Template(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
