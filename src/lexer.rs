//! Lexical scanner for BibTeX sources.
//!
//! Rules are tried in declaration order and the first one matching at the
//! cursor wins, so escaped characters are claimed as `Data` before the brace
//! and quote rules ever see them.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

/// The kind of a lexeme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// `@article`, `@book`, ...
    Type,
    Id,
    LBrace,
    RBrace,
    Quote,
    Comma,
    Equal,
    /// Anything else, including the escapes `\{`, `\}`, `\"`, `\\` and `\,`
    Data,
    Eoi,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenKind::Type => "type",
            TokenKind::Id => "id",
            TokenKind::LBrace => "lbrace",
            TokenKind::RBrace => "rbrace",
            TokenKind::Quote => "quote",
            TokenKind::Comma => "comma",
            TokenKind::Equal => "equal",
            TokenKind::Data => "data",
            TokenKind::Eoi => "eoi",
        };
        f.write_str(name)
    }
}

/// A lexeme with its exact byte position in the scanned text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub offset: usize,
    pub length: usize,
}

impl Token<'_> {
    /// Byte offset one past the end of the token.
    pub fn end(&self) -> usize {
        self.offset + self.length
    }
}

static RULES: Lazy<Vec<(Regex, TokenKind)>> = Lazy::new(|| {
    [
        (r"^@[A-Za-z]+", TokenKind::Type),
        (r"^\\\\", TokenKind::Data),
        (r#"^\\""#, TokenKind::Data),
        (r"^\\\{", TokenKind::Data),
        (r"^\\\}", TokenKind::Data),
        (r"^\\,", TokenKind::Data),
        (r"^\{", TokenKind::LBrace),
        (r"^\}", TokenKind::RBrace),
        (r#"^""#, TokenKind::Quote),
        (r"^,", TokenKind::Comma),
        (r"^=", TokenKind::Equal),
        (r"^[A-Za-z][A-Za-z0-9_$:\-./+]*", TokenKind::Id),
        (r#"^[^{}",=\s]+"#, TokenKind::Data),
    ]
    .into_iter()
    .map(|(pattern, kind)| (Regex::new(pattern).unwrap(), kind))
    .collect()
});

/// Splits a text buffer into [`Token`]s on demand.
#[derive(Debug, Clone)]
pub struct Lexer<'a> {
    text: &'a str,
    head: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text, head: 0 }
    }

    /// The complete buffer being scanned.
    pub fn text(&self) -> &'a str {
        self.text
    }

    /// Returns the next token, or an `Eoi` token once the input is exhausted.
    ///
    /// # Errors
    ///
    /// Returns a syntax error if no rule matches at the cursor.
    pub fn next_token(&mut self) -> Result<Token<'a>> {
        self.eat();

        let input = &self.text[self.head..];
        if input.is_empty() {
            return Ok(Token {
                kind: TokenKind::Eoi,
                text: "",
                offset: self.text.len(),
                length: 0,
            });
        }

        for (regex, kind) in RULES.iter() {
            if let Some(m) = regex.find(input) {
                let token = Token {
                    kind: *kind,
                    text: m.as_str(),
                    offset: self.head,
                    length: m.len(),
                };
                self.head += m.len();
                return Ok(token);
            }
        }

        let found: String = input.chars().take(20).collect();
        Err(Error::Syntax {
            expected: "token".to_string(),
            found,
            offset: self.head,
        })
    }

    /// Skips any run of whitespace and `%` comments.
    fn eat(&mut self) {
        loop {
            let rest = &self.text[self.head..];
            let trimmed = rest.trim_start();
            if trimmed.len() != rest.len() {
                self.head += rest.len() - trimmed.len();
                continue;
            }
            if rest.starts_with('%') {
                // a comment runs to the end of the line, or to the end of input
                self.head += rest.find('\n').map_or(rest.len(), |nl| nl + 1);
                continue;
            }
            break;
        }
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Result<Token<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_token() {
            Ok(token) if token.kind == TokenKind::Eoi => None,
            other => Some(other),
        }
    }
}
