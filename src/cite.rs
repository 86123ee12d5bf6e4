//! "Cite now, list later": entries cited with `!cite{}` are collected per
//! caller context until `!putbib{}` takes them.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::entry::Entry;

/// Shown for `!putbib{}` without preceding citations.
pub const EMPTY_BIBLIOGRAPHY: &str =
    "<div class=\"flash warning\">Empty bibliography (no !cite{} for !putbib{}).</div>";

/// Pending citations keyed by a caller-supplied context id.
///
/// A context exists from its first [`cite`](CitationCollector::cite) until
/// [`take`](CitationCollector::take). A context that is never taken stays
/// until [`clear`](CitationCollector::clear).
#[derive(Debug, Default)]
pub struct CitationCollector {
    pending: Mutex<HashMap<String, Vec<Entry>>>,
}

impl CitationCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `entries` to the list of `context` and returns their 1-based
    /// numbers within that list.
    ///
    /// Citing nothing leaves `context` untouched.
    pub fn cite(&self, context: &str, entries: Vec<Entry>) -> Vec<usize> {
        if entries.is_empty() {
            return Vec::new();
        }
        let mut pending = self.lock();
        let list = pending.entry(context.to_string()).or_default();
        let first = list.len() + 1;
        let numbers = (first..first + entries.len()).collect();
        list.extend(entries);
        debug!(%context, pending = list.len(), "collected citations");
        numbers
    }

    /// Removes and returns the list of `context`, `None` when nothing was
    /// cited.
    pub fn take(&self, context: &str) -> Option<Vec<Entry>> {
        self.lock().remove(context)
    }

    /// Drops the list of `context` without rendering it.
    pub fn clear(&self, context: &str) {
        self.lock().remove(context);
    }

    /// Whether `context` has pending citations.
    pub fn is_collecting(&self, context: &str) -> bool {
        self.lock().contains_key(context)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Entry>>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The `[1,2]` markup linking citation numbers to entry anchors.
pub fn cite_markup(entries: &[&Entry], numbers: &[usize]) -> String {
    let links: Vec<String> = entries
        .iter()
        .zip(numbers)
        .map(|(entry, n)| format!("<a href=\"#{}\"><b>{}</b></a>", entry.id, n))
        .collect();
    format!("[{}]", links.join(","))
}
