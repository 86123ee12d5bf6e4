//! The record store: every entry read from the configured sources.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use indexmap::IndexMap;
use tracing::debug;

use crate::bbl::BblBuilder;
use crate::entry::Entry;
use crate::error::Result;
use crate::lexer::Lexer;
use crate::parser::Parser;
use crate::query::Query;

/// Formatted bibliography items and the mutation count they were built at.
#[derive(Debug, Default)]
pub(crate) struct BblState {
    pub(crate) built_at: Option<u64>,
    pub(crate) items: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct AuthorIndex {
    built_at: u64,
    names: Vec<String>,
}

/// Entries keyed by id, in the order they were first added.
///
/// Every [`Store::scan`] and [`Store::add`] bumps a mutation counter. Derived
/// data (the `bibtex` output and the author index) remembers the counter it
/// was computed at and is rebuilt once the counter has moved on.
#[derive(Debug, Default)]
pub struct Store {
    entries: IndexMap<String, Entry>,
    mutations: u64,
    bbl: Mutex<BblState>,
    authors: Mutex<Option<AuthorIndex>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `text` and adds every record in it, replacing entries with the
    /// same id.
    ///
    /// # Errors
    ///
    /// Returns the first syntax error. Records that were complete before the
    /// error stay in the store; the broken record is dropped.
    pub fn scan(&mut self, text: &str) -> Result<()> {
        self.mutations += 1;
        let entries = &mut self.entries;
        let mut count = 0usize;
        let result = Parser::new(Lexer::new(text)).and_then(|mut parser| {
            parser.parse(|entry| {
                count += 1;
                entries.insert(entry.id.clone(), entry);
            })
        });
        debug!(records = count, total = self.entries.len(), "scanned BibTeX text");
        result
    }

    /// Adds a single entry, replacing any entry with the same id.
    pub fn add(&mut self, entry: Entry) {
        self.mutations += 1;
        self.entries.insert(entry.id.clone(), entry);
    }

    pub fn get(&self, id: &str) -> Option<&Entry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    /// Number of `scan` and `add` calls so far.
    pub fn mutations(&self) -> u64 {
        self.mutations
    }

    /// Returns the entries matching `query` in store order.
    ///
    /// # Errors
    ///
    /// `OperationDisabled` for predicate queries once predicates are
    /// disabled, `Query` for patterns that do not compile.
    pub fn query(&self, query: &Query) -> Result<Vec<&Entry>> {
        let mut found = Vec::new();
        self.query_each(query, |entry| found.push(entry))?;
        Ok(found)
    }

    /// Like [`Store::query`] but hands each match to `consumer`.
    ///
    /// Queries on `$bbl` see the text of the last bibliography build; they
    /// do not start one.
    pub fn query_each<'s>(
        &'s self,
        query: &Query,
        mut consumer: impl FnMut(&'s Entry),
    ) -> Result<()> {
        let compiled = query.compile()?;
        if !compiled.uses_bbl() {
            for entry in self.entries.values() {
                if compiled.matches(entry) {
                    consumer(entry);
                }
            }
            return Ok(());
        }

        // matches are collected first so the consumer runs unlocked
        let found: Vec<&'s Entry> = {
            let bbl = lock(&self.bbl);
            self.entries
                .values()
                .filter(|entry| compiled.matches_with_bbl(entry, bbl.items.get(&entry.id).map(String::as_str)))
                .collect()
        };
        found.into_iter().for_each(consumer);
        Ok(())
    }

    /// All author names ("firstname lastname"), deduplicated and sorted by
    /// the last word of the name.
    pub fn authors(&self) -> Vec<String> {
        let mut cache = lock(&self.authors);
        if let Some(index) = cache.as_ref() {
            if index.built_at == self.mutations {
                return index.names.clone();
            }
        }

        let mut names: Vec<String> = Vec::new();
        for entry in self.entries.values() {
            for author in entry.authors() {
                if !names.contains(&author) {
                    names.push(author);
                }
            }
        }
        names.sort_by(|a, b| surname(a).cmp(surname(b)));

        *cache = Some(AuthorIndex {
            built_at: self.mutations,
            names: names.clone(),
        });
        names
    }

    /// Whether the `bibtex` output is up to date with the entries.
    pub fn is_fresh(&self) -> bool {
        lock(&self.bbl).built_at == Some(self.mutations)
    }

    /// Runs the bibliography build unless the store is already fresh.
    ///
    /// # Errors
    ///
    /// Returns the build error; the store stays stale so the next call
    /// retries.
    pub fn ensure_bbl(&self, builder: &BblBuilder) -> Result<()> {
        let mut state = lock(&self.bbl);
        if state.built_at == Some(self.mutations) {
            return Ok(());
        }
        builder.build(self, &mut state)
    }

    /// The formatted bibliography item for `id`, as written by `bibtex`.
    pub fn bbl(&self, id: &str) -> Option<String> {
        lock(&self.bbl).items.get(id).cloned()
    }
}

fn surname(name: &str) -> &str {
    name.split_whitespace().last().unwrap_or("")
}

/// Locks a mutex, recovering the data if a panicking thread poisoned it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
