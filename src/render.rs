//! Rendering entries through templates.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tera::Context;
use tracing::warn;

use crate::bbl::BblBuilder;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::latex::latex_to_html;
use crate::store::Store;
use crate::templates::TemplateSet;

static BIBITEM_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\\bibitem.*\n").unwrap());
static NEWBLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\newblock\s+").unwrap());

/// How a list of entries is rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delimiter {
    /// One evaluation with all entries in scope as `entries`.
    SingleTemplate,
    /// One evaluation per entry, joined with the string.
    Join(String),
}

impl Delimiter {
    pub fn join(separator: &str) -> Self {
        Delimiter::Join(separator.to_string())
    }
}

/// The `bibtex` output of one entry, converted to HTML and split into its
/// `\newblock` segments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BblParts {
    pub bbl: String,
    pub bbl_authors: String,
    pub bbl_title: String,
    pub bbl_remainder: Vec<String>,
}

impl BblParts {
    pub fn from_bbl(bbl: &str) -> Self {
        let html = latex_to_html(bbl);
        let body = BIBITEM_LINE.replace(&html, "").into_owned();
        let mut segments = NEWBLOCK.split(&body).map(|s| s.trim().to_string());

        let bbl_authors = segments.next().unwrap_or_default();
        let bbl_title = segments.next().unwrap_or_default();
        let bbl_remainder = segments.collect();
        Self {
            bbl: body.trim().to_string(),
            bbl_authors,
            bbl_title,
            bbl_remainder,
        }
    }
}

/// An entry with its derived values, as seen by templates in `entries`.
#[derive(Debug, Serialize)]
struct EntryView<'e> {
    #[serde(flatten)]
    entry: &'e Entry,
    #[serde(flatten)]
    parts: BblParts,
}

/// Renders entries of one store with one template set.
#[derive(Debug, Clone, Copy)]
pub struct Renderer<'a> {
    store: &'a Store,
    templates: &'a TemplateSet,
    builder: &'a BblBuilder,
}

impl<'a> Renderer<'a> {
    pub fn new(store: &'a Store, templates: &'a TemplateSet, builder: &'a BblBuilder) -> Self {
        Self {
            store,
            templates,
            builder,
        }
    }

    pub fn store(&self) -> &'a Store {
        self.store
    }

    pub fn templates(&self) -> &'a TemplateSet {
        self.templates
    }

    /// Renders one entry.
    ///
    /// The template sees `entry` and the derived values `bbl`,
    /// `bbl_authors`, `bbl_title` and `bbl_remainder`. When the template
    /// mentions `bbl` the bibliography is brought up to date first.
    ///
    /// # Errors
    ///
    /// `MissingTemplate`, `Template`, or the `Build` error of a failed
    /// bibliography build.
    pub fn render_entry(&self, entry: &Entry, name: &str) -> Result<String> {
        let source = self
            .templates
            .get(name)
            .ok_or_else(|| Error::MissingTemplate(name.to_string()))?;
        let parts = self.parts(entry, source.contains("bbl"))?;

        let mut context = Context::new();
        context.insert("entry", entry);
        context.insert("bbl", &parts.bbl);
        context.insert("bbl_authors", &parts.bbl_authors);
        context.insert("bbl_title", &parts.bbl_title);
        context.insert("bbl_remainder", &parts.bbl_remainder);
        self.templates.render(name, &context)
    }

    /// Renders several entries with one template.
    pub fn render_list(&self, name: &str, entries: &[&Entry], delimiter: &Delimiter) -> Result<String> {
        let source = self
            .templates
            .get(name)
            .ok_or_else(|| Error::MissingTemplate(name.to_string()))?;

        match delimiter {
            Delimiter::Join(separator) => {
                let rendered = entries
                    .iter()
                    .map(|entry| self.render_entry(entry, name))
                    .collect::<Result<Vec<_>>>()?;
                Ok(rendered.join(separator))
            }
            Delimiter::SingleTemplate => {
                let needs_bbl = source.contains("bbl");
                let views = entries
                    .iter()
                    .map(|entry| {
                        Ok(EntryView {
                            entry,
                            parts: self.parts(entry, needs_bbl)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;

                let mut context = Context::new();
                context.insert("entries", &views);
                self.templates.render(name, &context)
            }
        }
    }

    fn parts(&self, entry: &Entry, needs_bbl: bool) -> Result<BblParts> {
        if !needs_bbl {
            return Ok(BblParts::default());
        }
        self.store.ensure_bbl(self.builder)?;
        match self.store.bbl(&entry.id) {
            Some(bbl) => Ok(BblParts::from_bbl(&bbl)),
            None => {
                warn!(id = %entry.id, "no bibliography item for entry");
                Ok(BblParts::default())
            }
        }
    }
}
