//! Field queries over entries.
//!
//! A [`Query`] maps field names to [`Matcher`]s. Fields named in the query
//! but missing from an entry pass vacuously unless listed in `require`.
//!
//! Query expressions written by document authors (`year=>/^199/,
//! 'author'=>/Knuth/`) are read by [`parse_query`], a small scanner that
//! only understands key/regex pairs. Nothing in an expression is ever
//! evaluated.

use std::collections::HashMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};

use regex::Regex;

use crate::entry::Entry;
use crate::error::{Error, Result};

/// Field name under which queries see the formatted bibliography text of
/// an entry.
pub const BBL_FIELD: &str = "$bbl";

static PREDICATES_DISABLED: AtomicBool = AtomicBool::new(false);

/// Forbids predicate queries for the rest of the process.
///
/// There is no way to turn predicates back on.
pub fn disable_predicates() {
    PREDICATES_DISABLED.store(true, Ordering::SeqCst);
}

/// Whether [`disable_predicates`] has been called.
pub fn predicates_disabled() -> bool {
    PREDICATES_DISABLED.load(Ordering::SeqCst)
}

/// A test applied to one field value.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Regular expression source, compiled when the query runs.
    Pattern(String),
    Regex(Regex),
    /// Integer range; the field is read as an integer (leading digits, else 0).
    Range(RangeInclusive<i64>),
    /// Exact membership.
    OneOf(Vec<String>),
}

impl From<&str> for Matcher {
    fn from(pattern: &str) -> Self {
        Matcher::Pattern(pattern.to_string())
    }
}

impl From<Regex> for Matcher {
    fn from(regex: Regex) -> Self {
        Matcher::Regex(regex)
    }
}

impl From<RangeInclusive<i64>> for Matcher {
    fn from(range: RangeInclusive<i64>) -> Self {
        Matcher::Range(range)
    }
}

type Predicate = Box<dyn Fn(&Entry) -> bool + Send + Sync>;

/// Query options: field matchers, required fields and an optional predicate.
#[derive(Default)]
pub struct Query {
    fields: Vec<(String, Matcher)>,
    require: Vec<String>,
    predicate: Option<Predicate>,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("fields", &self.fields)
            .field("require", &self.require)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field test. Tests run in the order they were added.
    pub fn field(mut self, name: &str, matcher: impl Into<Matcher>) -> Self {
        self.fields.push((name.to_string(), matcher.into()));
        self
    }

    /// Marks fields that an entry must have to match.
    pub fn require<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.require.extend(names.into_iter().map(Into::into));
        self
    }

    /// Sets a predicate evaluated before any field test.
    pub fn predicate(mut self, predicate: impl Fn(&Entry) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Box::new(predicate));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.require.is_empty() && self.predicate.is_none()
    }

    /// Checks the query can run and compiles its string patterns.
    ///
    /// # Errors
    ///
    /// `OperationDisabled` if the query has a predicate after
    /// [`disable_predicates`]; `Query` for a pattern that does not compile.
    pub(crate) fn compile(&self) -> Result<CompiledQuery<'_>> {
        if self.predicate.is_some() && predicates_disabled() {
            return Err(Error::OperationDisabled("predicates"));
        }

        let mut patterns = HashMap::new();
        for (index, (_, matcher)) in self.fields.iter().enumerate() {
            if let Matcher::Pattern(source) = matcher {
                let regex = Regex::new(source).map_err(|e| {
                    Error::Query(format!("failed to compile regex '{}': {}", source, e))
                })?;
                patterns.insert(index, regex);
            }
        }

        Ok(CompiledQuery {
            query: self,
            patterns,
        })
    }
}

/// A [`Query`] whose string patterns have been compiled.
pub(crate) struct CompiledQuery<'q> {
    query: &'q Query,
    patterns: HashMap<usize, Regex>,
}

impl CompiledQuery<'_> {
    pub(crate) fn matches(&self, entry: &Entry) -> bool {
        self.matches_with_bbl(entry, None)
    }

    /// Whether any test reads [`BBL_FIELD`].
    pub(crate) fn uses_bbl(&self) -> bool {
        self.query.require.iter().any(|name| name == BBL_FIELD)
            || self.query.fields.iter().any(|(name, _)| name == BBL_FIELD)
    }

    /// Like `matches`, with `bbl` as the value of [`BBL_FIELD`].
    pub(crate) fn matches_with_bbl(&self, entry: &Entry, bbl: Option<&str>) -> bool {
        let value = |name: &str| match name {
            BBL_FIELD => bbl.map(str::to_string),
            _ => entry.get(name),
        };

        if let Some(predicate) = &self.query.predicate {
            if !predicate(entry) {
                return false;
            }
        }

        if self.query.require.iter().any(|name| value(name).is_none()) {
            return false;
        }

        self.query
            .fields
            .iter()
            .enumerate()
            .all(|(index, (name, matcher))| match value(name) {
                None => true,
                Some(value) => match matcher {
                    Matcher::Pattern(_) => self.patterns[&index].is_match(&value),
                    Matcher::Regex(regex) => regex.is_match(&value),
                    Matcher::Range(range) => range.contains(&leading_integer(&value)),
                    Matcher::OneOf(set) => set.iter().any(|s| *s == value),
                },
            })
    }
}

/// Reads the leading integer of a field value, `0` when there is none.
fn leading_integer(value: &str) -> i64 {
    let value = value.trim_start();
    let (sign, digits) = match value.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, value.strip_prefix('+').unwrap_or(value)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse::<i64>().map_or(0, |n| sign * n)
}

/// Builds a [`Query`] from an expression such as
/// `year=>/^199\d$/, 'author'=>/Knuth/`.
///
/// Keys may be bare or wrapped in single or double quotes. Values are
/// regular expressions between slashes (`\/` escapes a slash); a value
/// without slashes runs to the next comma.
///
/// # Errors
///
/// Returns `Error::Query` for malformed expressions and regexes that do not
/// compile.
///
/// # Examples
///
/// ```
/// use bibtex_render::query::parse_query;
///
/// assert!(parse_query(r"year=>/^199\d$/, 'author'=>/Knuth/").is_ok());
/// assert!(parse_query("year=>/(/").is_err());
/// ```
pub fn parse_query(expr: &str) -> Result<Query> {
    let mut scanner = Scanner { rest: expr };
    let mut query = Query::new();

    loop {
        scanner.skip_ws();
        if scanner.rest.is_empty() {
            break;
        }

        let key = scanner.key()?;
        scanner.skip_ws();
        if !scanner.eat("=>") {
            return Err(Error::Query(format!("expected '=>' after '{}'", key)));
        }
        scanner.skip_ws();
        let pattern = scanner.value()?;

        let regex = Regex::new(&pattern)
            .map_err(|e| Error::Query(format!("failed to compile regex '{}': {}", pattern, e)))?;
        query = query.field(&key, regex);

        scanner.skip_ws();
        if !scanner.eat(",") && !scanner.rest.is_empty() {
            return Err(Error::Query(format!(
                "expected ',' before '{}'",
                scanner.rest
            )));
        }
    }

    if query.is_empty() {
        return Err(Error::Query("empty query".to_string()));
    }
    Ok(query)
}

struct Scanner<'a> {
    rest: &'a str,
}

impl<'a> Scanner<'a> {
    fn skip_ws(&mut self) {
        self.rest = self.rest.trim_start();
    }

    fn eat(&mut self, literal: &str) -> bool {
        match self.rest.strip_prefix(literal) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn key(&mut self) -> Result<String> {
        for quote in ['\'', '"'] {
            if let Some(quoted) = self.rest.strip_prefix(quote) {
                let end = quoted
                    .find(quote)
                    .ok_or_else(|| Error::Query(format!("unterminated key in '{}'", self.rest)))?;
                self.rest = &quoted[end + 1..];
                return Ok(quoted[..end].to_string());
            }
        }

        let end = self.rest.find("=>").unwrap_or(self.rest.len());
        let key = self.rest[..end].trim();
        if key.is_empty() || key.contains(',') {
            return Err(Error::Query(format!("missing key in '{}'", self.rest)));
        }
        self.rest = &self.rest[end..];
        Ok(key.to_string())
    }

    fn value(&mut self) -> Result<String> {
        let Some(body) = self.rest.strip_prefix('/') else {
            let end = self.rest.find(',').unwrap_or(self.rest.len());
            let value = self.rest[..end].trim().to_string();
            self.rest = &self.rest[end..];
            return Ok(value);
        };

        let mut pattern = String::new();
        let mut chars = body.char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '/' => {
                    self.rest = &body[i + 1..];
                    return Ok(pattern);
                }
                '\\' => match chars.next() {
                    Some((_, '/')) => pattern.push('/'),
                    Some((_, other)) => {
                        pattern.push('\\');
                        pattern.push(other);
                    }
                    None => pattern.push('\\'),
                },
                _ => pattern.push(c),
            }
        }
        Err(Error::Query(format!("unterminated regex '/{}'", body)))
    }
}
