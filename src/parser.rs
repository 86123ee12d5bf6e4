//! Recursive-descent BibTeX parser.
//!
//! The parser sees the input only through [`Lexer`] tokens and keeps exactly
//! one token of lookahead:
//!
//! ```text
//! collection := record*
//! record     := TYPE LBRACE ID COMMA datafields RBRACE
//! datafields := (field COMMA)* field?
//! field      := ID EQUAL value
//! value      := QUOTE token* QUOTE | LBRACE balanced RBRACE | ID | DATA
//! ```

use once_cell::sync::Lazy;
use regex::Regex;

use crate::entry::{Entry, SourceSpan};
use crate::error::{Error, Result};
use crate::lexer::{Lexer, Token, TokenKind};

/// Parser over a single text buffer.
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    lookahead: Token<'a>,
}

impl<'a> Parser<'a> {
    /// Creates a parser and reads the first lookahead token.
    pub fn new(mut lexer: Lexer<'a>) -> Result<Self> {
        let lookahead = lexer.next_token()?;
        Ok(Self { lexer, lookahead })
    }

    /// Parses every record, handing each completed entry to `add`.
    ///
    /// Records completed before an error have already been handed over; the
    /// record being read when the error occurs is dropped.
    pub fn parse(&mut self, mut add: impl FnMut(Entry)) -> Result<()> {
        while let Some(entry) = self.record()? {
            add(entry);
        }
        Ok(())
    }

    fn next_token(&mut self) -> Result<()> {
        self.lookahead = self.lexer.next_token()?;
        Ok(())
    }

    /// Consumes the lookahead if it has the given kind and returns its text.
    fn expect(&mut self, kind: TokenKind) -> Result<&'a str> {
        if self.lookahead.kind != kind {
            return Err(Error::syntax(
                kind,
                self.lookahead.text,
                self.lookahead.offset,
            ));
        }
        let text = self.lookahead.text;
        self.next_token()?;
        Ok(text)
    }

    fn record(&mut self) -> Result<Option<Entry>> {
        if self.lookahead.kind == TokenKind::Eoi {
            return Ok(None);
        }

        let start = self.lookahead.offset;
        let entry_type = self.expect(TokenKind::Type)?;
        self.expect(TokenKind::LBrace)?;
        let id = self.expect(TokenKind::Id)?;
        let mut entry = Entry::new(id, entry_type);
        self.expect(TokenKind::Comma)?;

        self.datafields(&mut entry)?;

        let end = self.lookahead.end();
        self.expect(TokenKind::RBrace)?;

        let text = &self.lexer.text()[start..end];
        entry.source = Some(SourceSpan {
            offset: start,
            length: end - start,
            text: text.to_string(),
        });
        Ok(Some(entry))
    }

    fn datafields(&mut self, entry: &mut Entry) -> Result<()> {
        while self.lookahead.kind == TokenKind::Id {
            let (key, value) = self.field()?;
            entry.add_field(&key, value);
            if self.lookahead.kind != TokenKind::Comma {
                break;
            }
            self.next_token()?;
        }
        Ok(())
    }

    fn field(&mut self) -> Result<(String, String)> {
        let key = self.expect(TokenKind::Id)?.to_lowercase();
        self.expect(TokenKind::Equal)?;

        let value = match self.lookahead.kind {
            TokenKind::LBrace => {
                self.next_token()?;
                self.delimited(TokenKind::RBrace)?
            }
            TokenKind::Quote => {
                self.next_token()?;
                self.delimited(TokenKind::Quote)?
            }
            TokenKind::Id | TokenKind::Data => {
                let text = self.lookahead.text.to_string();
                self.next_token()?;
                text
            }
            _ => {
                return Err(Error::Syntax {
                    expected: "value".to_string(),
                    found: self.lookahead.text.to_string(),
                    offset: self.lookahead.offset,
                })
            }
        };

        Ok((key, value))
    }

    /// Reads a value up to the `closing` token at brace depth zero.
    ///
    /// Tokens are joined with a single space wherever the source had
    /// whitespace (or a comment) between them; nested braces are kept.
    fn delimited(&mut self, closing: TokenKind) -> Result<String> {
        let mut depth = 0usize;
        let mut data = String::new();
        let mut prev_end: Option<usize> = None;

        loop {
            let token = self.lookahead;
            match token.kind {
                TokenKind::Eoi => {
                    return Err(Error::syntax(closing, &preview(&data), token.offset));
                }
                kind if kind == closing && depth == 0 => {
                    self.next_token()?;
                    break;
                }
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => {
                    // an unbalanced '}' inside a quoted value
                    depth = depth.checked_sub(1).ok_or_else(|| {
                        Error::syntax(closing, token.text, token.offset)
                    })?;
                }
                _ => {}
            }

            if prev_end.is_some_and(|end| token.offset > end) {
                data.push(' ');
            }
            data.push_str(token.text);
            prev_end = Some(token.end());
            self.next_token()?;
        }

        Ok(normalize(&data))
    }
}

static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static SPACE_BEFORE_PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r" ([,.])").unwrap());

/// Collapses whitespace and drops spaces in front of commas and periods.
fn normalize(data: &str) -> String {
    let collapsed = SPACES.replace_all(data.trim(), " ");
    SPACE_BEFORE_PUNCT.replace_all(&collapsed, "$1").into_owned()
}

fn preview(data: &str) -> String {
    let head: String = data.chars().take(20).collect();
    format!("{head}...")
}

/// Parses all records of `text`.
///
/// # Examples
///
/// ```
/// use bibtex_render::parser::parse_str;
///
/// let entries = parse_str("@book{knuth84, title = {The {\\TeX}book}, year = 1984}").unwrap();
/// assert_eq!(entries[0].get("title").as_deref(), Some("The {\\TeX}book"));
/// assert_eq!(entries[0].get("year").as_deref(), Some("1984"));
/// ```
pub fn parse_str(text: &str) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    Parser::new(Lexer::new(text))?.parse(|e| entries.push(e))?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
% publications
@Article{doe99,
  Author = {Doe, John and Roe, Jane},
  title  = {On the {Theory} of  Everything , revisited},
  journal = "Journal of {B}ogus Results",
  year   = {1999},
}

@book{knuth84,
  author = {Knuth, Donald E.},
  title = {The {\TeX}book},
  year = 1984
}
"#;

    // ============================================
    // Tests for records and fields
    // ============================================

    #[test]
    fn test_parse_two_records() {
        // Given: two records, one with a trailing comma and one without
        // When: we parse them
        let entries = parse_str(SAMPLE).unwrap();

        // Then: both come back with lower-cased types and field names
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "doe99");
        assert_eq!(entries[0].entry_type, "article");
        assert_eq!(
            entries[0].get("author").as_deref(),
            Some("Doe, John and Roe, Jane")
        );
        assert_eq!(entries[1].id, "knuth84");
        assert_eq!(entries[1].get("year").as_deref(), Some("1984"));
    }

    #[test]
    fn test_parse_normalizes_whitespace_and_keeps_braces() {
        let entries = parse_str(SAMPLE).unwrap();

        assert_eq!(
            entries[0].get("title").as_deref(),
            Some("On the {Theory} of Everything, revisited")
        );
        assert_eq!(entries[1].get("title").as_deref(), Some(r"The {\TeX}book"));
    }

    #[test]
    fn test_parse_quoted_value() {
        let entries = parse_str(SAMPLE).unwrap();
        assert_eq!(
            entries[0].get("journal").as_deref(),
            Some("Journal of {B}ogus Results")
        );
    }

    #[test]
    fn test_parse_escaped_braces_do_not_nest() {
        let entries = parse_str(r"@misc{m1, note = {a \{ b}}").unwrap();
        assert_eq!(entries[0].get("note").as_deref(), Some(r"a \{ b"));
    }

    #[test]
    fn test_parse_quote_inside_braces() {
        let entries = parse_str(r#"@misc{m1, title = "A {"quoted"} word"}"#).unwrap();
        assert_eq!(
            entries[0].get("title").as_deref(),
            Some(r#"A {"quoted"} word"#)
        );
    }

    #[test]
    fn test_parse_keeps_spacing_around_hyphens_and_quotes() {
        // Given: values whose hyphens, dashes and quotes are spaced differently
        let text = r#"@misc{m1,
  a = {Jean-Paul Sartre},
  b = {Jean -Paul},
  c = {10 -- 20},
  d = {10--20},
  e = {A "quoted"   word},
  f = {``Quoted'' words , too .}
}"#;

        // When: we parse it
        let entries = parse_str(text).unwrap();
        let get = |key: &str| entries[0].get(key).unwrap();

        // Then: only whitespace runs and spaces before ',' or '.' change
        assert_eq!(get("a"), "Jean-Paul Sartre");
        assert_eq!(get("b"), "Jean -Paul");
        assert_eq!(get("c"), "10 -- 20");
        assert_eq!(get("d"), "10--20");
        assert_eq!(get("e"), "A \"quoted\" word");
        assert_eq!(get("f"), "``Quoted'' words, too.");
    }

    #[test]
    fn test_parse_empty_record() {
        let entries = parse_str("@misc{empty,}").unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].fields.is_empty());
    }

    // ============================================
    // Tests for source spans
    // ============================================

    #[test]
    fn test_parse_records_source_span() {
        // Given: a record preceded by a comment
        let text = "% c\n@misc{a1, title={T}}\n\n@misc{a2, title={U}}";

        // When: we parse it
        let entries = parse_str(text).unwrap();

        // Then: the span covers exactly "@misc{...}"
        let span = entries[0].source.as_ref().unwrap();
        assert_eq!(span.offset, 4);
        assert_eq!(span.text, "@misc{a1, title={T}}");
        assert_eq!(&text[span.offset..span.offset + span.length], span.text);

        let span = entries[1].source.as_ref().unwrap();
        assert_eq!(span.text, "@misc{a2, title={U}}");
    }

    // ============================================
    // Tests for syntax errors
    // ============================================

    #[test]
    fn test_parse_missing_comma_after_id() {
        let result = parse_str("@misc{a1 title={T}}");

        match result {
            Err(Error::Syntax {
                expected, found, ..
            }) => {
                assert_eq!(expected, "comma");
                assert_eq!(found, "title");
            }
            other => panic!("Expected syntax error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_unterminated_value() {
        let result = parse_str("@misc{a1, title={Never {closed}");
        assert!(matches!(result, Err(Error::Syntax { .. })));
    }

    #[test]
    fn test_parse_error_keeps_earlier_records() {
        // Given: a valid record followed by a broken one
        let text = "@misc{good, title={T}}\n@misc{bad, title=}";
        let mut seen = Vec::new();

        // When: we parse with a sink
        let result = Parser::new(Lexer::new(text))
            .unwrap()
            .parse(|e| seen.push(e.id));

        // Then: the good record was delivered, the broken one was not
        assert!(result.is_err());
        assert_eq!(seen, vec!["good".to_string()]);
    }

    // ============================================
    // Round-trip through to_bib
    // ============================================

    #[test]
    fn test_to_bib_round_trip() {
        let original = parse_str(SAMPLE).unwrap();

        for entry in &original {
            let reparsed = parse_str(&entry.to_bib()).unwrap();
            assert_eq!(reparsed.len(), 1);
            assert_eq!(reparsed[0].id, entry.id);
            assert_eq!(reparsed[0].entry_type, entry.entry_type);
            assert_eq!(reparsed[0].fields, entry.fields);
        }
    }
}
